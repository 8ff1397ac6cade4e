// 10.0 bundle.rs: the unit of atomicity. an ordered list of modify-position
// operations that all reference the same account union.
// the exchange's risk check needs to see every market touched in the bundle,
// so accounts only ever grow while a bundle is being built.

use serde::{Deserialize, Serialize};

use crate::types::{AccountKey, Blockhash, MarketId, Price, SignedSize};

/// Largest serialized transaction the ledger accepts.
pub const MAX_TRANSACTION_BYTES: usize = 1232;

/// Highest compute-unit limit a single transaction can request.
pub const MAX_COMPUTE_UNITS: u32 = 1_400_000;

// 10.1: one position change. size_delta is signed: positive buys, negative sells.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyPosition {
    pub market_id: MarketId,
    pub size_delta: SignedSize,
    pub acceptable_price: Price,
    pub market: AccountKey,
    pub price_feed: AccountKey,
}

// 10.2: ordered set of market + price feed accounts. insertion order is kept
// because the instruction's remaining accounts are positional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountUnion {
    markets: Vec<AccountKey>,
    price_feeds: Vec<AccountKey>,
}

impl AccountUnion {
    pub fn new() -> Self {
        Self::default()
    }

    // returns true if the pair was new
    pub fn insert(&mut self, market: AccountKey, price_feed: AccountKey) -> bool {
        if self.markets.contains(&market) {
            return false;
        }
        self.markets.push(market);
        self.price_feeds.push(price_feed);
        true
    }

    pub fn extend(&mut self, other: &AccountUnion) {
        for (market, feed) in other.markets.iter().zip(&other.price_feeds) {
            self.insert(*market, *feed);
        }
    }

    pub fn contains(&self, market: &AccountKey) -> bool {
        self.markets.contains(market)
    }

    pub fn markets(&self) -> &[AccountKey] {
        &self.markets
    }

    pub fn price_feeds(&self) -> &[AccountKey] {
        &self.price_feeds
    }

    /// Number of market/feed pairs.
    pub fn len(&self) -> usize {
        self.markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }
}

// 10.3: bundle under construction. owned by exactly one packing pass,
// trial copies are cloned off it and either adopted or dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingBundle {
    operations: Vec<ModifyPosition>,
    accounts: AccountUnion,
}

impl PendingBundle {
    pub fn new(seed: AccountUnion) -> Self {
        Self {
            operations: Vec::new(),
            accounts: seed,
        }
    }

    pub fn push(&mut self, operation: ModifyPosition) {
        self.accounts.insert(operation.market, operation.price_feed);
        self.operations.push(operation);
    }

    /// Trial copy with one more operation.
    pub fn with(&self, operation: ModifyPosition) -> Self {
        let mut trial = self.clone();
        trial.push(operation);
        trial
    }

    pub fn operations(&self) -> &[ModifyPosition] {
        &self.operations
    }

    pub fn accounts(&self) -> &AccountUnion {
        &self.accounts
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn into_parts(self) -> (Vec<ModifyPosition>, AccountUnion) {
        (self.operations, self.accounts)
    }
}

/// Serialized, signed transaction ready for simulation or submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedBundle {
    pub bytes: Vec<u8>,
    pub blockhash: Blockhash,
    pub compute_unit_limit: u32,
    /// Operations the transaction was built from, for logging and replay
    pub operations: Vec<ModifyPosition>,
    pub account_count: usize,
}

impl SignedBundle {
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("transaction too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("cannot build an empty bundle")]
    Empty,

    #[error("signing failed: {0}")]
    Signing(String),
}

// 10.4: turns a pending bundle into a signed transaction. every operation is
// emitted with the bundle's full account union, followed by a compute budget
// instruction. exchange, margin account and signer are fixed per builder.
pub trait BundleBuilder: Send + Sync {
    fn build(
        &self,
        bundle: &PendingBundle,
        compute_unit_limit: u32,
        blockhash: &Blockhash,
    ) -> Result<SignedBundle, BuildError>;
}
