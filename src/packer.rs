// 13.0 packer.rs: greedy sequential packing with rollback on overflow.
// one working bundle at a time. each candidate operation is tried as
// working + op, simulated at the compute ceiling, and either adopted or the
// working bundle is sealed and the op starts a fresh one.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::blockhash::BlockhashCache;
use crate::bundle::{
    AccountUnion, BuildError, ModifyPosition, PendingBundle, MAX_COMPUTE_UNITS, MAX_TRANSACTION_BYTES,
};
use crate::ledger::LedgerError;
use crate::submit::{classify, is_spurious, FailureClass, Submission, SubmitError, Submitter};
use crate::types::{MarketId, Signature, SignedSize};

const COMPUTE_EXCEEDED_MARKERS: [&str; 2] = ["exceeded CUs meter", "ComputationalBudgetExceeded"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackerConfig {
    /// Operations per bundle before it is sealed regardless of headroom
    pub group_size: usize,
    pub compute_unit_ceiling: u32,
    /// Fraction of the ceiling a simulation may use before it counts as overflow
    pub compute_headroom: Decimal,
    pub max_bundle_bytes: usize,
    pub carry_confirmed_accounts: bool,
}

impl Default for PackerConfig {
    fn default() -> Self {
        Self {
            group_size: 3,
            compute_unit_ceiling: MAX_COMPUTE_UNITS,
            compute_headroom: dec!(0.95),
            max_bundle_bytes: MAX_TRANSACTION_BYTES,
            carry_confirmed_accounts: false,
        }
    }
}

impl PackerConfig {
    pub fn compute_threshold(&self) -> Decimal {
        Decimal::from(self.compute_unit_ceiling) * self.compute_headroom
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    Size,
    Compute,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Trial {
    Fits(u64),
    Overflow(Overflow),
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedBundle {
    pub signature: Signature,
    pub operations: Vec<ModifyPosition>,
    pub accounts: AccountUnion,
    pub submission: Submission,
}

/// An operation left out of every bundle, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedOperation {
    pub market_id: MarketId,
    pub size_delta: SignedSize,
    pub reason: String,
}

impl RejectedOperation {
    pub fn new(operation: &ModifyPosition, reason: impl Into<String>) -> Self {
        Self {
            market_id: operation.market_id,
            size_delta: operation.size_delta,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackReport {
    pub submitted: Vec<SubmittedBundle>,
    pub rejected: Vec<RejectedOperation>,
}

impl PackReport {
    pub fn is_empty(&self) -> bool {
        self.submitted.is_empty() && self.rejected.is_empty()
    }

    pub fn operations_submitted(&self) -> usize {
        self.submitted.iter().map(|b| b.operations.len()).sum()
    }

    pub fn submitted_markets(&self) -> Vec<MarketId> {
        self.submitted
            .iter()
            .flat_map(|b| b.operations.iter().map(|op| op.market_id))
            .collect()
    }
}

// every variant keeps the bundles confirmed before the failure so the caller
// can report them
#[derive(Debug, Clone, thiserror::Error)]
pub enum PackError {
    #[error("bundle submission failed after {} confirmed bundles: {source}", .submitted.len())]
    Submission {
        submitted: Vec<SubmittedBundle>,
        source: SubmitError,
    },

    #[error("no blockhash for trial bundle after {} confirmed bundles: {source}", .submitted.len())]
    Blockhash {
        submitted: Vec<SubmittedBundle>,
        source: SubmitError,
    },

    #[error("trial bundle could not be built after {} confirmed bundles: {source}", .submitted.len())]
    Build {
        submitted: Vec<SubmittedBundle>,
        source: BuildError,
    },

    #[error("simulation unavailable after {} confirmed bundles: {source}", .submitted.len())]
    Simulation {
        submitted: Vec<SubmittedBundle>,
        source: LedgerError,
    },
}

impl PackError {
    pub fn submitted(&self) -> &[SubmittedBundle] {
        match self {
            PackError::Submission { submitted, .. }
            | PackError::Blockhash { submitted, .. }
            | PackError::Build { submitted, .. }
            | PackError::Simulation { submitted, .. } => submitted,
        }
    }
}

// failure inside a pass, before the confirmed bundles are attached
#[derive(Debug)]
enum PassFailure {
    Submission(SubmitError),
    Blockhash(SubmitError),
    Build(BuildError),
    Simulation(LedgerError),
}

impl PassFailure {
    fn into_error(self, submitted: Vec<SubmittedBundle>) -> PackError {
        match self {
            PassFailure::Submission(source) => PackError::Submission { submitted, source },
            PassFailure::Blockhash(source) => PackError::Blockhash { submitted, source },
            PassFailure::Build(source) => PackError::Build { submitted, source },
            PassFailure::Simulation(source) => PackError::Simulation { submitted, source },
        }
    }
}

pub struct BatchPacker {
    config: PackerConfig,
}

impl BatchPacker {
    pub fn new(config: PackerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PackerConfig {
        &self.config
    }

    /// Packs `operations` in order and submits each sealed bundle before
    /// starting the next. Every bundle starts from `seed`.
    pub async fn pack_and_submit(
        &self,
        operations: Vec<ModifyPosition>,
        seed: AccountUnion,
        submitter: &Submitter,
        cache: &mut BlockhashCache,
    ) -> Result<PackReport, PackError> {
        let mut report = PackReport::default();
        match self.pack(operations, seed, submitter, cache, &mut report).await {
            Ok(()) => Ok(report),
            Err(failure) => Err(failure.into_error(report.submitted)),
        }
    }

    async fn pack(
        &self,
        operations: Vec<ModifyPosition>,
        seed: AccountUnion,
        submitter: &Submitter,
        cache: &mut BlockhashCache,
        report: &mut PackReport,
    ) -> Result<(), PassFailure> {
        let group_size = self.config.group_size.max(1);
        let mut carried = AccountUnion::new();
        let mut working = PendingBundle::new(seed.clone());

        for op in operations {
            let trial = working.with(op.clone());
            match self.try_bundle(&trial, submitter, cache).await? {
                Trial::Fits(units) => {
                    debug!(market = %op.market_id, units, len = trial.len(), "operation fits");
                    working = trial;
                }
                Trial::Rejected(reason) => {
                    warn!(market = %op.market_id, reason = %reason, "operation rejected in simulation");
                    report.rejected.push(RejectedOperation::new(&op, reason));
                    continue;
                }
                Trial::Overflow(kind) => {
                    if working.is_empty() {
                        warn!(market = %op.market_id, ?kind, "operation does not fit in an empty bundle");
                        report.rejected.push(RejectedOperation::new(&op, format!("{kind:?} overflow on its own")));
                        continue;
                    }
                    debug!(market = %op.market_id, ?kind, len = working.len(), "bundle full, sealing");
                    let sealed = std::mem::replace(&mut working, PendingBundle::new(AccountUnion::new()));
                    self.seal(sealed, submitter, cache, report, &mut carried).await?;

                    let fresh = PendingBundle::new(self.next_seed(&seed, &carried)).with(op.clone());
                    match self.try_bundle(&fresh, submitter, cache).await? {
                        Trial::Fits(_) => working = fresh,
                        Trial::Overflow(kind) => {
                            warn!(market = %op.market_id, ?kind, "operation does not fit in an empty bundle");
                            report.rejected.push(RejectedOperation::new(&op, format!("{kind:?} overflow on its own")));
                            working = PendingBundle::new(self.next_seed(&seed, &carried));
                            continue;
                        }
                        Trial::Rejected(reason) => {
                            warn!(market = %op.market_id, reason = %reason, "operation rejected in simulation");
                            report.rejected.push(RejectedOperation::new(&op, reason));
                            working = PendingBundle::new(self.next_seed(&seed, &carried));
                            continue;
                        }
                    }
                }
            }

            if working.len() >= group_size {
                let sealed = std::mem::replace(&mut working, PendingBundle::new(AccountUnion::new()));
                self.seal(sealed, submitter, cache, report, &mut carried).await?;
                working = PendingBundle::new(self.next_seed(&seed, &carried));
            }
        }

        if !working.is_empty() {
            self.seal(working, submitter, cache, report, &mut carried).await?;
        }

        Ok(())
    }

    fn next_seed(&self, seed: &AccountUnion, carried: &AccountUnion) -> AccountUnion {
        let mut next = seed.clone();
        if self.config.carry_confirmed_accounts {
            next.extend(carried);
        }
        next
    }

    async fn try_bundle(
        &self,
        trial: &PendingBundle,
        submitter: &Submitter,
        cache: &mut BlockhashCache,
    ) -> Result<Trial, PassFailure> {
        let mut stale = 0;
        let mut transport_retried = false;
        loop {
            let blockhash = submitter.latest_blockhash(cache).await.map_err(PassFailure::Blockhash)?;
            let signed = match submitter
                .builder()
                .build(trial, self.config.compute_unit_ceiling, &blockhash)
            {
                Ok(signed) => signed,
                Err(BuildError::TooLarge { .. }) => return Ok(Trial::Overflow(Overflow::Size)),
                Err(e) => return Err(PassFailure::Build(e)),
            };
            if signed.size() > self.config.max_bundle_bytes {
                return Ok(Trial::Overflow(Overflow::Size));
            }

            let simulation = match submitter.ledger().simulate(&signed).await {
                Ok(simulation) => simulation,
                Err(LedgerError::Transport(reason)) if !transport_retried => {
                    warn!(error = %reason, "simulation transport error, retrying once");
                    transport_retried = true;
                    sleep(submitter.policy().retry_delay()).await;
                    continue;
                }
                Err(e) => return Err(PassFailure::Simulation(e)),
            };
            let Some(detail) = simulation.error_detail() else {
                return Ok(self.check_units(simulation.units_consumed));
            };

            if COMPUTE_EXCEEDED_MARKERS.iter().any(|m| detail.contains(m)) {
                return Ok(Trial::Overflow(Overflow::Compute));
            }
            // 6000 says nothing about this bundle, judge it on units alone
            if is_spurious(&detail) {
                return Ok(self.check_units(simulation.units_consumed));
            }
            if classify(&LedgerError::Transaction(detail.clone())) == FailureClass::StaleToken
                && stale < submitter.policy().max_stale_retries
            {
                stale += 1;
                cache.invalidate();
                continue;
            }
            return Ok(Trial::Rejected(detail));
        }
    }

    fn check_units(&self, units: u64) -> Trial {
        if Decimal::from(units) >= self.config.compute_threshold() {
            Trial::Overflow(Overflow::Compute)
        } else {
            Trial::Fits(units)
        }
    }

    async fn seal(
        &self,
        bundle: PendingBundle,
        submitter: &Submitter,
        cache: &mut BlockhashCache,
        report: &mut PackReport,
        carried: &mut AccountUnion,
    ) -> Result<(), PassFailure> {
        match submitter.submit(&bundle, self.config.compute_unit_ceiling, cache).await {
            Ok(submission) => {
                let (operations, accounts) = bundle.into_parts();
                info!(
                    signature = %submission.signature,
                    operations = operations.len(),
                    accounts = accounts.len(),
                    "bundle submitted"
                );
                carried.extend(&accounts);
                report.submitted.push(SubmittedBundle {
                    signature: submission.signature.clone(),
                    operations,
                    accounts,
                    submission,
                });
                Ok(())
            }
            Err(source) => Err(PassFailure::Submission(source)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBuilder, SimExchange};
    use crate::submit::RetryPolicy;
    use crate::types::{AccountKey, Price, SignedSize};
    use std::sync::Arc;
    use std::time::Duration;

    fn op(id: u32) -> ModifyPosition {
        ModifyPosition {
            market_id: MarketId(id),
            size_delta: SignedSize::new(dec!(2)),
            acceptable_price: Price::new_unchecked(dec!(110)),
            market: AccountKey::derived(1, id),
            price_feed: AccountKey::derived(2, id),
        }
    }

    fn setup(exchange: &SimExchange, builder: SimBuilder) -> (Submitter, BlockhashCache) {
        let submitter = Submitter::new(
            Arc::new(exchange.clone()),
            Arc::new(builder),
            RetryPolicy::default(),
        );
        (submitter, BlockhashCache::new(Duration::from_secs(45)))
    }

    #[tokio::test(start_paused = true)]
    async fn seven_operations_group_into_three_three_one() {
        let exchange = SimExchange::new();
        let (submitter, mut cache) = setup(&exchange, SimBuilder::default());
        let packer = BatchPacker::new(PackerConfig::default());

        let ops: Vec<_> = (0..7).map(op).collect();
        let report = packer
            .pack_and_submit(ops, AccountUnion::new(), &submitter, &mut cache)
            .await
            .unwrap();

        let sizes: Vec<usize> = report.submitted.iter().map(|b| b.operations.len()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert!(report.rejected.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn size_overflow_seals_and_starts_fresh() {
        let exchange = SimExchange::new();
        // base 200 + 100 per op + 64 per account pair: two ops fit, three do not
        let builder = SimBuilder::new(600, 200, 100, 64);
        let (submitter, mut cache) = setup(&exchange, builder);
        let packer = BatchPacker::new(PackerConfig { group_size: 10, ..PackerConfig::default() });

        let ops: Vec<_> = (0..5).map(op).collect();
        let report = packer
            .pack_and_submit(ops, AccountUnion::new(), &submitter, &mut cache)
            .await
            .unwrap();

        let sizes: Vec<usize> = report.submitted.iter().map(|b| b.operations.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        for bundle in exchange.confirmed() {
            assert!(bundle.size() <= 600);
        }
        // fresh bundle after overflow carries only its own accounts
        assert_eq!(report.submitted[1].accounts.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn compute_overflow_seals_bundle() {
        let exchange = SimExchange::new();
        exchange.set_units(10_000, 500_000, 0);
        let (submitter, mut cache) = setup(&exchange, SimBuilder::default());
        let packer = BatchPacker::new(PackerConfig { group_size: 10, ..PackerConfig::default() });

        let ops: Vec<_> = (0..4).map(op).collect();
        let report = packer
            .pack_and_submit(ops, AccountUnion::new(), &submitter, &mut cache)
            .await
            .unwrap();

        // 2 ops = 1_010_000 units, 3 ops = 1_510_000 > 1_330_000
        let sizes: Vec<usize> = report.submitted.iter().map(|b| b.operations.len()).collect();
        assert_eq!(sizes, vec![2, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_single_operation_is_rejected() {
        let exchange = SimExchange::new();
        exchange.set_units(10_000, 1_400_000, 0);
        let (submitter, mut cache) = setup(&exchange, SimBuilder::default());
        let packer = BatchPacker::new(PackerConfig::default());

        let report = packer
            .pack_and_submit(vec![op(1)], AccountUnion::new(), &submitter, &mut cache)
            .await
            .unwrap();
        assert!(report.submitted.is_empty());
        assert_eq!(report.rejected.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn simulation_failure_drops_only_that_operation() {
        let exchange = SimExchange::new();
        exchange.reject_market_in_simulation(MarketId(1), "custom program error: 0x1771");
        let (submitter, mut cache) = setup(&exchange, SimBuilder::default());
        let packer = BatchPacker::new(PackerConfig::default());

        let ops: Vec<_> = (0..3).map(op).collect();
        let report = packer
            .pack_and_submit(ops, AccountUnion::new(), &submitter, &mut cache)
            .await
            .unwrap();

        assert_eq!(report.submitted_markets(), vec![MarketId(0), MarketId(2)]);
        assert_eq!(report.rejected[0].market_id, MarketId(1));
    }

    #[tokio::test(start_paused = true)]
    async fn seed_accounts_appear_in_every_bundle() {
        let exchange = SimExchange::new();
        let (submitter, mut cache) = setup(&exchange, SimBuilder::default());
        let packer = BatchPacker::new(PackerConfig { group_size: 1, ..PackerConfig::default() });

        let mut seed = AccountUnion::new();
        seed.insert(AccountKey::derived(1, 50), AccountKey::derived(2, 50));

        let report = packer
            .pack_and_submit(vec![op(1), op(2)], seed, &submitter, &mut cache)
            .await
            .unwrap();

        assert_eq!(report.submitted.len(), 2);
        for bundle in &report.submitted {
            assert!(bundle.accounts.contains(&AccountKey::derived(1, 50)));
            assert_eq!(bundle.accounts.len(), 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn carried_accounts_flow_into_later_bundles() {
        let exchange = SimExchange::new();
        let (submitter, mut cache) = setup(&exchange, SimBuilder::default());
        let packer = BatchPacker::new(PackerConfig {
            group_size: 1,
            carry_confirmed_accounts: true,
            ..PackerConfig::default()
        });

        let report = packer
            .pack_and_submit(vec![op(1), op(2)], AccountUnion::new(), &submitter, &mut cache)
            .await
            .unwrap();

        assert_eq!(report.submitted[1].accounts.len(), 2);
        assert!(report.submitted[1].accounts.contains(&AccountKey::derived(1, 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_bundle_ends_the_pass() {
        let exchange = SimExchange::new();
        let (submitter, mut cache) = setup(&exchange, SimBuilder::default());
        let packer = BatchPacker::new(PackerConfig::default());

        // first bundle confirms, second fails every attempt
        exchange.fail_sends_after(1, LedgerError::Transaction("insufficient collateral".to_string()), 3);

        let ops: Vec<_> = (0..7).map(op).collect();
        let err = packer
            .pack_and_submit(ops, AccountUnion::new(), &submitter, &mut cache)
            .await
            .unwrap_err();

        match err {
            PackError::Submission { submitted, source } => {
                assert_eq!(submitted.len(), 1);
                assert!(matches!(source, SubmitError::Exhausted { attempts: 3, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(exchange.confirmed().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn single_simulation_blip_is_retried() {
        let exchange = SimExchange::new();
        exchange.fail_simulations_after(0, 1);
        let (submitter, mut cache) = setup(&exchange, SimBuilder::default());
        let packer = BatchPacker::new(PackerConfig::default());

        let report = packer
            .pack_and_submit(vec![op(1), op(2)], AccountUnion::new(), &submitter, &mut cache)
            .await
            .unwrap();
        assert_eq!(report.operations_submitted(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn simulation_outage_keeps_confirmed_bundles() {
        let exchange = SimExchange::new();
        let (submitter, mut cache) = setup(&exchange, SimBuilder::default());
        let packer = BatchPacker::new(PackerConfig::default());

        exchange.fail_simulations_after(1, 2);

        let ops: Vec<_> = (0..5).map(op).collect();
        let err = packer
            .pack_and_submit(ops, AccountUnion::new(), &submitter, &mut cache)
            .await
            .unwrap_err();

        match &err {
            PackError::Simulation { submitted, source } => {
                assert_eq!(submitted.len(), 1);
                assert_eq!(submitted[0].operations.len(), 3);
                assert!(matches!(source, LedgerError::Transport(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.submitted().len(), 1);
    }
}
