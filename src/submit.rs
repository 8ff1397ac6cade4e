//! Submission with blockhash management and bounded retries.
//!
//! Each attempt walks FETCH_TOKEN → VERIFY → SUBMIT → CONFIRM. Failures are
//! classified so that a stale token or the exchange's nondeterministic error
//! 6000 do not burn the general retry budget:
//!
//! - stale token: invalidate the cache and start over, capped by
//!   `max_stale_retries`
//! - spurious 6000: resend the same operations and accounts under a fresh
//!   token, capped by `max_spurious_retries`
//! - unconfirmed: the bundle went out but its fate is unknown; it is never
//!   re-signed, the caller re-reads state instead
//! - anything else: wait `retry_delay` and retry, capped by `max_attempts`
//!
//! The only state shared between submissions is the [`BlockhashCache`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::blockhash::BlockhashCache;
use crate::bundle::{BuildError, BundleBuilder, PendingBundle};
use crate::ledger::{Ledger, LedgerError};
use crate::types::{Blockhash, Signature};

const STALE_TOKEN_MARKERS: [&str; 3] = ["Blockhash not found", "BlockhashNotFound", "block height exceeded"];
const SPURIOUS_MARKERS: [&str; 3] = ["Error Number: 6000", "custom program error: 0x1770", "\"Custom\":6000"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts for failures that are neither stale-token nor spurious
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub blockhash_refresh_secs: u64,
    pub blockhash_fetch_attempts: u32,
    pub max_stale_retries: u32,
    pub max_spurious_retries: u32,
    /// Give up waiting for a confirmation after this long
    pub confirm_timeout_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 1_000,
            blockhash_refresh_secs: 45,
            blockhash_fetch_attempts: 3,
            max_stale_retries: 5,
            max_spurious_retries: 5,
            confirm_timeout_secs: 60,
        }
    }
}

impl RetryPolicy {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn blockhash_refresh(&self) -> Duration {
        Duration::from_secs(self.blockhash_refresh_secs)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    StaleToken,
    Spurious,
    /// Sent, but may still land
    Unconfirmed,
    Other,
}

pub fn is_stale_token(message: &str) -> bool {
    STALE_TOKEN_MARKERS.iter().any(|m| message.contains(m))
}

// program error 6000: an overflow inside the exchange that does not depend on
// the bundle's content
pub fn is_spurious(message: &str) -> bool {
    SPURIOUS_MARKERS.iter().any(|m| message.contains(m))
}

pub fn classify(error: &LedgerError) -> FailureClass {
    if matches!(error, LedgerError::Unconfirmed { .. }) {
        return FailureClass::Unconfirmed;
    }
    let message = error.to_string();
    if is_stale_token(&message) {
        FailureClass::StaleToken
    } else if is_spurious(&message) {
        FailureClass::Spurious
    } else {
        FailureClass::Other
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub signature: Signature,
    pub attempts: u32,
    pub stale_retries: u32,
    pub spurious_retries: u32,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SubmitError {
    #[error("could not fetch a blockhash after {attempts} attempts: {source}")]
    BlockhashUnavailable { attempts: u32, source: LedgerError },

    #[error("bundle could not be built: {0}")]
    Build(#[from] BuildError),

    #[error("submission failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: LedgerError },

    #[error("blockhash went stale {retries} times in a row")]
    StaleRetriesExhausted { retries: u32 },

    #[error("error 6000 persisted across {retries} resubmissions: {last}")]
    SpuriousRetriesExhausted { retries: u32, last: LedgerError },

    #[error("bundle sent but not confirmed, state must be re-read before retrying: {last}")]
    Unconfirmed { attempts: u32, last: LedgerError },
}

#[derive(Clone)]
pub struct Submitter {
    ledger: Arc<dyn Ledger>,
    builder: Arc<dyn BundleBuilder>,
    policy: RetryPolicy,
}

impl Submitter {
    pub fn new(ledger: Arc<dyn Ledger>, builder: Arc<dyn BundleBuilder>, policy: RetryPolicy) -> Self {
        Self { ledger, builder, policy }
    }

    pub fn ledger(&self) -> &dyn Ledger {
        self.ledger.as_ref()
    }

    pub fn builder(&self) -> &dyn BundleBuilder {
        self.builder.as_ref()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Cached token if fresh, otherwise a new one (fetch retried with a fixed delay).
    pub async fn latest_blockhash(&self, cache: &mut BlockhashCache) -> Result<Blockhash, SubmitError> {
        if let Some(blockhash) = cache.fresh(Instant::now()) {
            return Ok(blockhash.clone());
        }

        let attempts = self.policy.blockhash_fetch_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let captured_at = Instant::now();
            match self.ledger.latest_blockhash().await {
                Ok(blockhash) => {
                    debug!(blockhash = %blockhash, "fetched blockhash");
                    cache.store(blockhash.clone(), captured_at);
                    return Ok(blockhash);
                }
                Err(e) if attempt >= attempts => {
                    return Err(SubmitError::BlockhashUnavailable { attempts: attempt, source: e });
                }
                Err(e) => {
                    warn!(attempt, error = %e, "blockhash fetch failed, retrying");
                    sleep(self.policy.retry_delay()).await;
                }
            }
        }
    }

    /// Submits one bundle and waits for confirmation.
    pub async fn submit(
        &self,
        bundle: &PendingBundle,
        compute_unit_limit: u32,
        cache: &mut BlockhashCache,
    ) -> Result<Submission, SubmitError> {
        if bundle.is_empty() {
            return Err(SubmitError::Build(BuildError::Empty));
        }

        let mut attempts = 0;
        let mut failures = 0;
        let mut stale_retries = 0;
        let mut spurious_retries = 0;

        loop {
            attempts += 1;
            let blockhash = self.latest_blockhash(cache).await?;
            let signed = self.builder.build(bundle, compute_unit_limit, &blockhash)?;

            let still_valid = self.ledger.is_blockhash_valid(&blockhash).await.unwrap_or(false);
            if !still_valid {
                cache.invalidate();
                stale_retries += 1;
                if stale_retries > self.policy.max_stale_retries {
                    return Err(SubmitError::StaleRetriesExhausted { retries: stale_retries - 1 });
                }
                warn!(blockhash = %blockhash, stale_retries, "blockhash no longer valid, refetching");
                continue;
            }

            let error = match self.ledger.send_and_confirm(&signed).await {
                Ok(signature) => {
                    info!(
                        signature = %signature,
                        operations = bundle.len(),
                        accounts = bundle.accounts().len(),
                        attempts,
                        "bundle confirmed"
                    );
                    return Ok(Submission {
                        signature,
                        attempts,
                        stale_retries,
                        spurious_retries,
                    });
                }
                Err(e) => e,
            };

            match classify(&error) {
                FailureClass::StaleToken => {
                    cache.invalidate();
                    stale_retries += 1;
                    if stale_retries > self.policy.max_stale_retries {
                        return Err(SubmitError::StaleRetriesExhausted { retries: stale_retries - 1 });
                    }
                    warn!(error = %error, stale_retries, "stale blockhash, refetching");
                }
                FailureClass::Spurious => {
                    // same content under a new token, otherwise the resend
                    // carries the old signature and is dropped as a duplicate
                    cache.invalidate();
                    spurious_retries += 1;
                    if spurious_retries > self.policy.max_spurious_retries {
                        return Err(SubmitError::SpuriousRetriesExhausted {
                            retries: spurious_retries - 1,
                            last: error,
                        });
                    }
                    warn!(error = %error, spurious_retries, "error 6000, resubmitting unchanged bundle");
                }
                FailureClass::Unconfirmed => {
                    // a resend would carry a new token and could execute twice
                    warn!(error = %error, attempts, "bundle unconfirmed, not resending");
                    return Err(SubmitError::Unconfirmed { attempts, last: error });
                }
                FailureClass::Other => {
                    failures += 1;
                    if failures >= self.policy.max_attempts {
                        return Err(SubmitError::Exhausted { attempts: failures, last: error });
                    }
                    warn!(error = %error, failures, "submission failed, retrying");
                    sleep(self.policy.retry_delay()).await;
                }
            }
        }
    }
}
