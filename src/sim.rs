// 16.0 sim.rs: MOCKED. in-memory exchange standing in for the ledger, the
// account fetcher and the oracle at once. confirmed bundles are applied to
// positions and skew, so the next cycle sees the result of the last one.
// failures are injected explicitly; nothing here is random.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::bundle::{BuildError, BundleBuilder, PendingBundle, SignedBundle, MAX_TRANSACTION_BYTES};
use crate::ledger::{AccountFetcher, Ledger, LedgerError, Simulation};
use crate::market::Market;
use crate::position::{MarginAccount, Position};
use crate::price_feed::{OraclePrice, PriceOracle};
use crate::types::{AccountKey, Blockhash, MarketId, Signature, SignedSize};

#[derive(Debug, Clone, Copy)]
struct UnitModel {
    base: u64,
    per_operation: u64,
    per_account: u64,
}

#[derive(Debug)]
struct SimState {
    markets: Vec<Market>,
    margin: Option<MarginAccount>,
    prices: HashMap<AccountKey, Option<Decimal>>,
    units: UnitModel,
    issued: u64,
    valid_blockhashes: HashSet<Blockhash>,
    blockhash_failures: u32,
    simulation_rejects: HashMap<MarketId, String>,
    simulation_failures: u32,
    simulation_failures_after: usize,
    send_failures: VecDeque<LedgerError>,
    failures_after: usize,
    attempts: Vec<SignedBundle>,
    confirmed: Vec<SignedBundle>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            markets: Vec::new(),
            margin: None,
            prices: HashMap::new(),
            units: UnitModel {
                base: 5_000,
                per_operation: 60_000,
                per_account: 0,
            },
            issued: 0,
            valid_blockhashes: HashSet::new(),
            blockhash_failures: 0,
            simulation_rejects: HashMap::new(),
            simulation_failures: 0,
            simulation_failures_after: 0,
            send_failures: VecDeque::new(),
            failures_after: 0,
            attempts: Vec::new(),
            confirmed: Vec::new(),
        }
    }
}

impl SimState {
    fn apply(&mut self, bundle: &SignedBundle) {
        for op in &bundle.operations {
            if let Some(market) = self.markets.iter_mut().find(|m| m.id == op.market_id) {
                market.skew = SignedSize::new(market.skew.value() + op.size_delta.value());
            }
            let Some(margin) = self.margin.as_mut() else { continue };
            match margin.positions.iter_mut().find(|p| p.market_id == op.market_id) {
                Some(position) => {
                    position.size = SignedSize::new(position.size.value() + op.size_delta.value());
                }
                None => margin.positions.push(Position::new(op.market_id, op.size_delta)),
            }
        }
    }
}

/// Shared handle; clones see the same exchange.
#[derive(Debug, Clone, Default)]
pub struct SimExchange {
    state: Arc<Mutex<SimState>>,
}

impl SimExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_market(&self, market: Market) {
        self.state.lock().markets.push(market);
    }

    pub fn set_margin_account(&self, margin: MarginAccount) {
        self.state.lock().margin = Some(margin);
    }

    /// `None` models a feed that is not trading.
    pub fn set_price(&self, feed: AccountKey, price: Option<Decimal>) {
        self.state.lock().prices.insert(feed, price);
    }

    pub fn set_skew(&self, market_id: MarketId, skew: Decimal) {
        if let Some(market) = self.state.lock().markets.iter_mut().find(|m| m.id == market_id) {
            market.skew = SignedSize::new(skew);
        }
    }

    /// Simulated cost: base + per operation + per account pair.
    pub fn set_units(&self, base: u64, per_operation: u64, per_account: u64) {
        self.state.lock().units = UnitModel {
            base,
            per_operation,
            per_account,
        };
    }

    pub fn reject_market_in_simulation(&self, market_id: MarketId, error: &str) {
        self.state.lock().simulation_rejects.insert(market_id, error.to_string());
    }

    /// Once `confirmed` bundles have landed, the following `count`
    /// simulations fail at the transport level.
    pub fn fail_simulations_after(&self, confirmed: usize, count: u32) {
        let mut state = self.state.lock();
        state.simulation_failures_after = confirmed;
        state.simulation_failures = count;
    }

    pub fn fail_next_blockhash_fetches(&self, count: u32) {
        self.state.lock().blockhash_failures = count;
    }

    /// Every blockhash handed out so far stops being recognised.
    pub fn expire_blockhashes(&self) {
        self.state.lock().valid_blockhashes.clear();
    }

    /// The next sends fail with these errors, in order.
    pub fn fail_next_sends(&self, errors: Vec<LedgerError>) {
        let mut state = self.state.lock();
        state.failures_after = state.confirmed.len();
        state.send_failures = errors.into();
    }

    /// Once `confirmed` bundles have landed, the following `count` sends fail.
    pub fn fail_sends_after(&self, confirmed: usize, error: LedgerError, count: usize) {
        let mut state = self.state.lock();
        state.failures_after = confirmed;
        state.send_failures = std::iter::repeat(error).take(count).collect();
    }

    /// Every send attempt, including failed ones.
    pub fn attempts(&self) -> Vec<SignedBundle> {
        self.state.lock().attempts.clone()
    }

    pub fn confirmed(&self) -> Vec<SignedBundle> {
        self.state.lock().confirmed.clone()
    }

    pub fn market(&self, market_id: MarketId) -> Option<Market> {
        self.state.lock().markets.iter().find(|m| m.id == market_id).cloned()
    }

    pub fn margin(&self) -> Option<MarginAccount> {
        self.state.lock().margin.clone()
    }
}

#[async_trait]
impl Ledger for SimExchange {
    async fn latest_blockhash(&self) -> Result<Blockhash, LedgerError> {
        let mut state = self.state.lock();
        if state.blockhash_failures > 0 {
            state.blockhash_failures -= 1;
            return Err(LedgerError::Transport("blockhash fetch failed".to_string()));
        }
        state.issued += 1;
        let blockhash = Blockhash(format!("sim-blockhash-{}", state.issued));
        state.valid_blockhashes.insert(blockhash.clone());
        Ok(blockhash)
    }

    async fn is_blockhash_valid(&self, blockhash: &Blockhash) -> Result<bool, LedgerError> {
        Ok(self.state.lock().valid_blockhashes.contains(blockhash))
    }

    async fn simulate(&self, bundle: &SignedBundle) -> Result<Simulation, LedgerError> {
        let mut state = self.state.lock();
        if state.simulation_failures > 0 && state.confirmed.len() >= state.simulation_failures_after {
            state.simulation_failures -= 1;
            return Err(LedgerError::Transport("simulation request failed".to_string()));
        }
        let units = state.units;
        let units_consumed = units.base
            + units.per_operation * bundle.operations.len() as u64
            + units.per_account * bundle.account_count as u64;

        let rejected = bundle
            .operations
            .iter()
            .find_map(|op| state.simulation_rejects.get(&op.market_id));

        Ok(Simulation {
            units_consumed,
            error: rejected.cloned(),
            logs: Vec::new(),
        })
    }

    async fn send_and_confirm(&self, bundle: &SignedBundle) -> Result<Signature, LedgerError> {
        let mut state = self.state.lock();
        state.attempts.push(bundle.clone());

        if !state.valid_blockhashes.contains(&bundle.blockhash) {
            return Err(LedgerError::Transaction("Blockhash not found".to_string()));
        }
        if state.confirmed.len() >= state.failures_after {
            if let Some(error) = state.send_failures.pop_front() {
                return Err(error);
            }
        }

        state.apply(bundle);
        state.confirmed.push(bundle.clone());
        Ok(Signature(format!("sim-signature-{}", state.attempts.len())))
    }
}

#[async_trait]
impl AccountFetcher for SimExchange {
    async fn margin_account(&self, address: &AccountKey) -> Result<Option<MarginAccount>, LedgerError> {
        Ok(self
            .state
            .lock()
            .margin
            .as_ref()
            .filter(|m| &m.address == address)
            .cloned())
    }

    async fn markets(&self) -> Result<Vec<Market>, LedgerError> {
        Ok(self.state.lock().markets.clone())
    }
}

#[async_trait]
impl PriceOracle for SimExchange {
    async fn price(&self, feed: &AccountKey) -> Result<Option<OraclePrice>, LedgerError> {
        Ok(self.state.lock().prices.get(feed).map(|price| OraclePrice {
            price: *price,
            confidence: None,
            publish_time: 0,
        }))
    }
}

/// Byte-size model of a signed transaction.
#[derive(Debug, Clone)]
pub struct SimBuilder {
    pub max_bytes: usize,
    pub base_bytes: usize,
    pub per_operation_bytes: usize,
    /// Per market/feed pair (two keys)
    pub per_account_bytes: usize,
}

impl Default for SimBuilder {
    fn default() -> Self {
        Self {
            max_bytes: MAX_TRANSACTION_BYTES,
            base_bytes: 300,
            per_operation_bytes: 80,
            per_account_bytes: 64,
        }
    }
}

impl SimBuilder {
    pub fn new(max_bytes: usize, base_bytes: usize, per_operation_bytes: usize, per_account_bytes: usize) -> Self {
        Self {
            max_bytes,
            base_bytes,
            per_operation_bytes,
            per_account_bytes,
        }
    }
}

impl BundleBuilder for SimBuilder {
    fn build(
        &self,
        bundle: &PendingBundle,
        compute_unit_limit: u32,
        blockhash: &Blockhash,
    ) -> Result<SignedBundle, BuildError> {
        if bundle.is_empty() {
            return Err(BuildError::Empty);
        }
        let size = self.base_bytes
            + self.per_operation_bytes * bundle.len()
            + self.per_account_bytes * bundle.accounts().len();
        if size > self.max_bytes {
            return Err(BuildError::TooLarge {
                size,
                max: self.max_bytes,
            });
        }

        let mut bytes = vec![0u8; size];
        let stamp = blockhash.0.as_bytes();
        let n = stamp.len().min(size);
        bytes[..n].copy_from_slice(&stamp[..n]);

        Ok(SignedBundle {
            bytes,
            blockhash: blockhash.clone(),
            compute_unit_limit,
            operations: bundle.operations().to_vec(),
            account_count: bundle.accounts().len(),
        })
    }
}
