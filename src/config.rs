// 7.0 config.rs: all settings in one place. budget, window, retry, packing, logging.
// 7.1 file values come first, then RPC_URL / COMMITMENT / DELAY_TIME from the
// environment. credentials never live in the file.

use std::path::Path;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, EnvFilter};

use crate::decision::{DecisionParams, Selection};
use crate::packer::PackerConfig;
use crate::position::MarginAccount;
use crate::submit::RetryPolicy;
use crate::types::AccountKey;
use crate::window::IndexWindow;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;

const COMMITMENTS: [&str; 3] = ["processed", "confirmed", "finalized"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to read config file: {0}")]
    ReadFile(#[source] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

impl LoggingConfig {
    /// Installs the global subscriber. RUST_LOG wins over `level`.
    pub fn init(&self) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));

        match self.format.as_str() {
            "json" => {
                fmt().json().with_env_filter(filter).init();
            }
            _ => {
                fmt().with_env_filter(filter).init();
            }
        }
    }
}

// 7.2: complete bot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// USD notional spread across all trades of one cycle
    pub amount_to_trade_usd: Decimal,
    pub margin_account_id: u32,
    pub index_window: IndexWindow,
    pub trade_on_all_profitable_markets: bool,
    pub poll_interval_secs: u64,
    pub rpc_url: Option<String>,
    pub commitment: String,
    /// 0.10 = buy up to 110% / sell down to 90% of the oracle price
    pub acceptable_slippage: Decimal,
    pub min_expected_pnl: Decimal,
    pub retry: RetryPolicy,
    pub packer: PackerConfig,
    pub logging: LoggingConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            amount_to_trade_usd: dec!(20),
            margin_account_id: 0,
            index_window: IndexWindow::default(),
            trade_on_all_profitable_markets: true,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            rpc_url: None,
            commitment: "confirmed".into(),
            acceptable_slippage: dec!(0.10),
            min_expected_pnl: dec!(100),
            retry: RetryPolicy::default(),
            packer: PackerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl BotConfig {
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Reads the file, applies process environment overrides and validates.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        let mut config = Self::parse_toml(&content)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("RPC_URL").filter(|u| !u.trim().is_empty()) {
            self.rpc_url = Some(url);
        }
        if let Some(commitment) = lookup("COMMITMENT").filter(|c| !c.trim().is_empty()) {
            self.commitment = commitment;
        }
        if let Some(delay) = lookup("DELAY_TIME") {
            self.poll_interval_secs = delay.trim().parse().map_err(|_| ConfigError::InvalidValue {
                field: "DELAY_TIME",
                reason: format!("not a number of seconds: {delay}"),
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.amount_to_trade_usd <= Decimal::ZERO {
            return Err(ConfigError::InvalidValue {
                field: "amount_to_trade_usd",
                reason: "must be greater than 0".to_string(),
            });
        }
        if !self.index_window.is_well_formed() {
            return Err(ConfigError::InvalidValue {
                field: "index_window",
                reason: "start and end must be valid times of day with start before end".to_string(),
            });
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "poll_interval_secs",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.acceptable_slippage <= Decimal::ZERO || self.acceptable_slippage >= Decimal::ONE {
            return Err(ConfigError::InvalidValue {
                field: "acceptable_slippage",
                reason: "must be between 0 and 1".to_string(),
            });
        }
        if !COMMITMENTS.contains(&self.commitment.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "commitment",
                reason: format!("expected one of {COMMITMENTS:?}"),
            });
        }
        if self.retry.max_attempts == 0 || self.retry.blockhash_fetch_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry",
                reason: "attempt counts must be at least 1".to_string(),
            });
        }
        if self.packer.group_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "packer.group_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.packer.compute_headroom <= Decimal::ZERO || self.packer.compute_headroom > Decimal::ONE {
            return Err(ConfigError::InvalidValue {
                field: "packer.compute_headroom",
                reason: "must be in (0, 1]".to_string(),
            });
        }
        Ok(())
    }

    /// Endpoint for the live ledger. Missing is fatal at startup.
    pub fn require_rpc_url(&self) -> Result<&str, ConfigError> {
        self.rpc_url
            .as_deref()
            .ok_or(ConfigError::MissingField { field: "RPC_URL" })
    }

    pub fn margin_account_key(&self) -> AccountKey {
        MarginAccount::address_for(self.margin_account_id)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn decision_params(&self) -> DecisionParams {
        DecisionParams {
            budget_usd: self.amount_to_trade_usd,
            min_expected_pnl: self.min_expected_pnl,
            acceptable_slippage: self.acceptable_slippage,
            selection: Selection::from_trade_on_all(self.trade_on_all_profitable_markets),
        }
    }
}
