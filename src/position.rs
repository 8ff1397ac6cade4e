// 4.0: open exposure as seen from the margin account. read-only here:
// positions only change through submitted bundles and are observed by re-fetching.

use crate::types::{AccountKey, MarketId, Side, SignedSize};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Raw position size is stored with 9 implied decimals.
pub const POSITION_SIZE_DENOMINATOR: Decimal = dec!(1_000_000_000);

const MARGIN_ACCOUNT_TAG: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionAccount {
    pub market_id: u32,
    pub size: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub market_id: MarketId,
    pub size: SignedSize,
}

impl Position {
    pub fn new(market_id: MarketId, size: SignedSize) -> Self {
        Self { market_id, size }
    }

    pub fn from_account(account: &PositionAccount) -> Self {
        Self {
            market_id: MarketId(account.market_id),
            size: SignedSize::new(Decimal::from(account.size) / POSITION_SIZE_DENOMINATOR),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size.is_zero()
    }

    pub fn side(&self) -> Option<Side> {
        self.size.side()
    }
}

// 4.1: margin account. one per signer + id, holds every open position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarginAccount {
    pub address: AccountKey,
    pub id: u32,
    pub positions: Vec<Position>,
}

impl MarginAccount {
    /// Address of margin account `id` for this signer.
    pub fn address_for(id: u32) -> AccountKey {
        AccountKey::derived(MARGIN_ACCOUNT_TAG, id)
    }

    pub fn new(address: AccountKey, id: u32) -> Self {
        Self { address, id, positions: Vec::new() }
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.positions.push(position);
        self
    }

    // empty slots are left behind after a full close; skip them
    pub fn open_positions(&self) -> Vec<Position> {
        self.positions.iter().filter(|p| !p.is_empty()).copied().collect()
    }

    pub fn position(&self, market_id: MarketId) -> Option<&Position> {
        self.positions.iter().find(|p| p.market_id == market_id && !p.is_empty())
    }
}
