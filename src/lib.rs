// funding-capture: funding-rate capture bot for skew-based perpetual markets.
// trades the minority side when funding pays it, packs the trades into
// compute- and size-bounded bundles, and unwinds ahead of the daily index window.
// all ledger access goes through collaborator traits; the core is deterministic.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: MarketId, AccountKey, Side, SignedSize, Price
//   2.x  market.rs: market snapshot, raw account scaling, skew data
//   4.x  position.rs: positions and the margin account
//   5.x  funding.rs: expected pnl from funding rate and velocity
//   5.5  fees.rs: blended maker/taker fee
//   6.x  window.rs: daily index update window
//   7.x  config.rs: budget, window, retry, packing, logging, env overrides
//   8.x  ledger.rs: Ledger and AccountFetcher traits, simulation result
//   9.x  price_feed.rs: oracle reads, concurrent fetch
//   10.x bundle.rs: modify-position op, account union, pending/signed bundle
//   11.x blockhash.rs: replay token cache
//   12.x decision.rs: candidate selection, budget ratio, acceptable price
//   12.5 unwind.rs: closing orders at the window or after a skew flip
//   13.x packer.rs: greedy packing with rollback on overflow
//   14.x submit.rs: FETCH_TOKEN → VERIFY → SUBMIT → CONFIRM with classified retries
//   15.x scheduler.rs: poll loop
//   16.x sim.rs: in-memory exchange (mocked)
//   17.x rpc.rs: json-rpc ledger over http

// core math
pub mod fees;
pub mod funding;
pub mod market;
pub mod position;
pub mod types;
pub mod window;

// decisions and batching
pub mod blockhash;
pub mod bundle;
pub mod decision;
pub mod packer;
pub mod scheduler;
pub mod submit;
pub mod unwind;

// integration modules
pub mod config;
pub mod ledger;
pub mod price_feed;
pub mod rpc;
pub mod sim;

// re exports for convenience
pub use blockhash::*;
pub use bundle::*;
pub use decision::*;
pub use fees::*;
pub use funding::*;
pub use ledger::*;
pub use market::*;
pub use packer::*;
pub use position::*;
pub use scheduler::*;
pub use submit::*;
pub use types::*;
pub use unwind::*;
pub use window::*;
pub use config::{BotConfig, ConfigError, LoggingConfig};
pub use price_feed::{fetch_price, fetch_prices, OraclePrice, PriceOracle};
pub use rpc::RpcLedger;
pub use sim::{SimBuilder, SimExchange};
