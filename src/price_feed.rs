// 9.0: oracle prices. the bot only needs one number per market per cycle;
// a feed without a usable price means "skip this market", never a fatal error.

use async_trait::async_trait;
use futures_util::future::join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ledger::LedgerError;
use crate::types::{AccountKey, Price};

/// A single read of an oracle feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OraclePrice {
    /// None while the feed is not trading
    pub price: Option<Decimal>,
    pub confidence: Option<Decimal>,
    pub publish_time: i64,
}

impl OraclePrice {
    pub fn new(price: Decimal, publish_time: i64) -> Self {
        Self {
            price: Some(price),
            confidence: None,
            publish_time,
        }
    }

    pub fn with_confidence(mut self, confidence: Decimal) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn valid_price(&self) -> Option<Price> {
        self.price.and_then(Price::new)
    }
}

#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn price(&self, feed: &AccountKey) -> Result<Option<OraclePrice>, LedgerError>;
}

// 9.1: errors and empty feeds collapse to None
pub async fn fetch_price(oracle: &dyn PriceOracle, feed: &AccountKey) -> Option<Price> {
    match oracle.price(feed).await {
        Ok(Some(read)) => read.valid_price(),
        Ok(None) => None,
        Err(e) => {
            warn!(feed = %feed, error = %e, "price feed unavailable");
            None
        }
    }
}

// 9.2: read-only and independent, so all feeds are fetched concurrently
pub async fn fetch_prices(oracle: &dyn PriceOracle, feeds: &[AccountKey]) -> Vec<Option<Price>> {
    join_all(feeds.iter().map(|feed| fetch_price(oracle, feed))).await
}
