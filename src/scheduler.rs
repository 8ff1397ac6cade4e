//! Poll loop.
//!
//! One cycle: fetch the margin account and every market, then exactly one of
//!
//! - inside the index window: close everything, repeated each cycle until
//!   nothing is left open, then idle for the rest of the window
//! - open positions exist: close the ones the skew flipped against, then stop
//! - nothing open: scan for profitable markets and open them
//!
//! Cycles never overlap. Submission inside a cycle is sequential, so a stuck
//! confirmation holds up the loop until its retry budget runs out.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::blockhash::BlockhashCache;
use crate::bundle::AccountUnion;
use crate::config::BotConfig;
use crate::decision::{budget_ratio, find_profitable_markets, to_operations, DecisionParams, TradeCandidate};
use crate::ledger::{AccountFetcher, LedgerError};
use crate::packer::{BatchPacker, PackError, PackReport};
use crate::price_feed::PriceOracle;
use crate::submit::Submitter;
use crate::types::AccountKey;
use crate::unwind::{closing_orders, position_accounts, price_closing_orders};
use crate::window::IndexWindow;

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Window open; `closing` operations confirmed, leftovers in `report.rejected`
    WindowUnwind { closing: usize, report: PackReport },
    /// Window open and already handled, nothing to do until it closes
    WindowIdle,
    /// Positions were open; flipped ones were closed and no scan ran
    Unwound { open_positions: usize, report: PackReport },
    Opened { candidates: Vec<TradeCandidate>, report: PackReport },
    NoOpportunity,
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("margin account {0} not found")]
    MarginAccountMissing(AccountKey),

    #[error("failed to fetch state: {0}")]
    Fetch(#[from] LedgerError),

    #[error(transparent)]
    Pack(#[from] PackError),
}

pub struct Bot {
    accounts: Arc<dyn AccountFetcher>,
    oracle: Arc<dyn PriceOracle>,
    submitter: Submitter,
    packer: BatchPacker,
    cache: BlockhashCache,
    margin_account: AccountKey,
    window: IndexWindow,
    params: DecisionParams,
    poll_interval: Duration,
    first_cycle: bool,
    window_handled: bool,
}

impl Bot {
    pub fn new(
        config: &BotConfig,
        accounts: Arc<dyn AccountFetcher>,
        oracle: Arc<dyn PriceOracle>,
        submitter: Submitter,
    ) -> Self {
        Self {
            accounts,
            oracle,
            cache: BlockhashCache::new(submitter.policy().blockhash_refresh()),
            submitter,
            packer: BatchPacker::new(config.packer.clone()),
            margin_account: config.margin_account_key(),
            window: config.index_window,
            params: config.decision_params(),
            poll_interval: config.poll_interval(),
            first_cycle: true,
            window_handled: false,
        }
    }

    pub fn window_handled(&self) -> bool {
        self.window_handled
    }

    pub fn is_first_cycle(&self) -> bool {
        self.first_cycle
    }

    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<CycleOutcome, CycleError> {
        let first_cycle = std::mem::replace(&mut self.first_cycle, false);

        let margin = self
            .accounts
            .margin_account(&self.margin_account)
            .await?
            .ok_or(CycleError::MarginAccountMissing(self.margin_account))?;
        let markets = self.accounts.markets().await?;
        let open = margin.open_positions();

        if self.window.contains(now) {
            if self.window_handled {
                return Ok(CycleOutcome::WindowIdle);
            }
            info!(open = open.len(), "index window open, closing all positions");

            let orders = closing_orders(&open, &markets, true);
            let (operations, unpriced) =
                price_closing_orders(&orders, self.oracle.as_ref(), self.params.acceptable_slippage).await;
            let seed = position_accounts(&open, &markets);
            let mut report = self
                .packer
                .pack_and_submit(operations, seed, &self.submitter, &mut self.cache)
                .await?;
            report.rejected.extend(unpriced);

            // anything left open is retried on the next cycle inside the window
            self.window_handled = report.rejected.is_empty();
            if !self.window_handled {
                warn!(
                    closed = report.operations_submitted(),
                    left_open = report.rejected.len(),
                    "window unwind incomplete, retrying next cycle"
                );
            }
            return Ok(CycleOutcome::WindowUnwind {
                closing: report.operations_submitted(),
                report,
            });
        }
        self.window_handled = false;

        if !first_cycle && !open.is_empty() {
            let orders = closing_orders(&open, &markets, false);
            info!(open = open.len(), flipped = orders.len(), "checking open positions");

            let report = if orders.is_empty() {
                PackReport::default()
            } else {
                let (operations, unpriced) =
                    price_closing_orders(&orders, self.oracle.as_ref(), self.params.acceptable_slippage).await;
                let seed = position_accounts(&open, &markets);
                let mut report = self
                    .packer
                    .pack_and_submit(operations, seed, &self.submitter, &mut self.cache)
                    .await?;
                report.rejected.extend(unpriced);
                report
            };
            return Ok(CycleOutcome::Unwound {
                open_positions: open.len(),
                report,
            });
        }

        let hours = self.window.hours_until_start(now);
        let candidates = find_profitable_markets(&markets, self.oracle.as_ref(), &self.params, hours).await;
        info!(markets = markets.len(), profitable = candidates.len(), hours = %hours, "scanned markets");
        if candidates.is_empty() {
            return Ok(CycleOutcome::NoOpportunity);
        }

        let ratio = budget_ratio(&candidates, self.params.budget_usd);
        for c in &candidates {
            info!(
                market = %c.market.id,
                side = ?c.side,
                shares = %c.shares,
                expected_pnl = %c.expected_pnl,
                fee_usd = %c.estimated_fee,
                "opening"
            );
        }
        let operations = to_operations(&candidates, ratio, self.params.acceptable_slippage);
        let report = self
            .packer
            .pack_and_submit(operations, AccountUnion::new(), &self.submitter, &mut self.cache)
            .await?;

        Ok(CycleOutcome::Opened { candidates, report })
    }

    /// Runs until `max_cycles` (forever when None) on the wall clock.
    pub async fn run(&mut self, max_cycles: Option<u64>) -> RunStats {
        self.run_with_clock(max_cycles, Utc::now).await
    }

    /// Same loop with the cycle time taken from `clock`. Sleeps the poll
    /// interval between cycles; a failed cycle is logged and the loop moves
    /// on to the next one.
    pub async fn run_with_clock<F>(&mut self, max_cycles: Option<u64>, mut clock: F) -> RunStats
    where
        F: FnMut() -> DateTime<Utc>,
    {
        let mut stats = RunStats::default();
        loop {
            if max_cycles.is_some_and(|max| stats.cycles >= max) {
                break;
            }
            if stats.cycles > 0 {
                tokio::time::sleep(self.poll_interval).await;
            }
            stats.cycles += 1;
            let cycle = stats.cycles;

            match self.run_cycle(clock()).await {
                Ok(outcome) => log_outcome(cycle, &outcome),
                Err(CycleError::Pack(e)) => {
                    stats.failed += 1;
                    error!(cycle, confirmed = e.submitted().len(), error = %e, "bundle failed, skipping to next cycle");
                }
                Err(e) => {
                    stats.failed += 1;
                    warn!(cycle, error = %e, "cycle failed");
                }
            }
        }
        stats
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub cycles: u64,
    pub failed: u64,
}

pub fn log_outcome(cycle: u64, outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::WindowUnwind { closing, report } => info!(
            cycle,
            closing,
            bundles = report.submitted.len(),
            rejected = report.rejected.len(),
            "window unwind done"
        ),
        CycleOutcome::WindowIdle => info!(cycle, "inside index window, waiting"),
        CycleOutcome::Unwound { open_positions, report } => info!(
            cycle,
            open_positions,
            closed = report.operations_submitted(),
            "holding open positions"
        ),
        CycleOutcome::Opened { candidates, report } => info!(
            cycle,
            candidates = candidates.len(),
            opened = report.operations_submitted(),
            bundles = report.submitted.len(),
            "opened positions"
        ),
        CycleOutcome::NoOpportunity => info!(cycle, "no profitable markets"),
    }
}
