//! Market snapshots.
//!
//! A market is refreshed from the ledger every poll cycle and never mutated
//! locally. The raw account stores fixed-point integers; [`Market`] holds the
//! same values scaled to shares and percentages.

use crate::types::{AccountKey, MarketId, SignedSize};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Raw skew is stored with 6 implied decimals.
pub const SKEW_DENOMINATOR: Decimal = dec!(1_000_000);
/// Raw funding rate is stored with 13 implied decimals (daily percentage).
pub const FUNDING_RATE_DENOMINATOR: Decimal = dec!(10_000_000_000_000);
/// Raw funding velocity is stored with 11 implied decimals (daily percentage).
pub const FUNDING_VELOCITY_DENOMINATOR: Decimal = dec!(100_000_000_000);
/// Fee rates are stored in basis points; dividing by 100 yields a percentage.
pub const FEE_RATE_DENOMINATOR: Decimal = dec!(100);

/// Market account as it sits on the ledger, already decoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketAccount {
    pub id: u32,
    /// Market account address
    pub address: AccountKey,
    /// Oracle price feed account
    pub price_feed: AccountKey,
    /// Net exposure, 6 implied decimals
    pub skew: i128,
    pub skew_scale: u128,
    pub last_funding_rate: i128,
    pub funding_velocity: i128,
    /// Basis points
    pub maker_fee_rate: u16,
    /// Basis points
    pub taker_fee_rate: u16,
}

/// Immutable per-cycle snapshot of one market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub id: MarketId,
    pub address: AccountKey,
    pub price_feed: AccountKey,
    /// Signed net exposure in shares. positive = longs are the majority
    pub skew: SignedSize,
    pub skew_scale: Decimal,
    /// Last funding rate, daily percentage
    pub funding_rate: Decimal,
    /// Funding velocity, daily percentage
    pub funding_velocity: Decimal,
    /// Maker fee as a percentage
    pub maker_fee: Decimal,
    /// Taker fee as a percentage
    pub taker_fee: Decimal,
}

impl Market {
    pub fn from_account(account: &MarketAccount) -> Result<Self, MarketError> {
        let raw = |value: i128| {
            Decimal::try_from_i128_with_scale(value, 0).map_err(|_| MarketError::Undecodable(account.address))
        };
        let skew_scale = i128::try_from(account.skew_scale).map_err(|_| MarketError::Undecodable(account.address))?;

        Ok(Self {
            id: MarketId(account.id),
            address: account.address,
            price_feed: account.price_feed,
            skew: SignedSize::new(raw(account.skew)? / SKEW_DENOMINATOR),
            skew_scale: raw(skew_scale)? / SKEW_DENOMINATOR,
            funding_rate: raw(account.last_funding_rate)? / FUNDING_RATE_DENOMINATOR,
            funding_velocity: raw(account.funding_velocity)? / FUNDING_VELOCITY_DENOMINATOR,
            maker_fee: Decimal::from(account.maker_fee_rate) / FEE_RATE_DENOMINATOR,
            taker_fee: Decimal::from(account.taker_fee_rate) / FEE_RATE_DENOMINATOR,
        })
    }

    pub fn skew_data(&self) -> SkewData {
        SkewData {
            skew: self.skew,
            skew_scale: self.skew_scale,
            skew_longed: self.skew.is_long(),
        }
    }
}

/// Skew summary used by the decision engine and the unwind pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkewData {
    pub skew: SignedSize,
    pub skew_scale: Decimal,
    /// true when longs are the majority (skew > 0)
    pub skew_longed: bool,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MarketError {
    #[error("Market account at {0} could not be decoded")]
    Undecodable(AccountKey),
}
