//! Ledger collaborators.
//!
//! The bot never talks to the network directly; everything goes through
//! these traits so the poll loop can run against the JSON-RPC client or the
//! in-memory simulator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::bundle::SignedBundle;
use crate::market::Market;
use crate::position::MarginAccount;
use crate::types::{AccountKey, Blockhash, Signature};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rpc error {code}: {message} {detail}")]
    Rpc { code: i64, message: String, detail: String },

    #[error("transaction failed: {0}")]
    Transaction(String),

    /// Sent (or possibly sent) but never seen reaching the commitment. The
    /// transaction may still land.
    #[error("transaction unconfirmed: {reason}")]
    Unconfirmed { signature: Option<Signature>, reason: String },

    #[error("account {0} not found")]
    AccountNotFound(AccountKey),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Result of a dry run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Simulation {
    pub units_consumed: u64,
    /// Execution error reported by the runtime, if any
    pub error: Option<String>,
    pub logs: Vec<String>,
}

impl Simulation {
    /// Error text with logs appended, so classification sees program output too.
    pub fn error_detail(&self) -> Option<String> {
        self.error.as_ref().map(|err| {
            if self.logs.is_empty() {
                err.clone()
            } else {
                format!("{err} | {}", self.logs.join(" | "))
            }
        })
    }
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn latest_blockhash(&self) -> Result<Blockhash, LedgerError>;

    /// Cheap existence check used right before a send.
    async fn is_blockhash_valid(&self, blockhash: &Blockhash) -> Result<bool, LedgerError>;

    async fn simulate(&self, bundle: &SignedBundle) -> Result<Simulation, LedgerError>;

    /// Sends and blocks until the bundle is confirmed or has definitely failed.
    async fn send_and_confirm(&self, bundle: &SignedBundle) -> Result<Signature, LedgerError>;
}

#[async_trait]
pub trait AccountFetcher: Send + Sync {
    async fn margin_account(&self, address: &AccountKey) -> Result<Option<MarginAccount>, LedgerError>;

    /// Every market listed on the exchange. undecodable accounts are dropped.
    async fn markets(&self) -> Result<Vec<Market>, LedgerError>;
}
