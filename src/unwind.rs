// 12.5 unwind.rs: closing open exposure.
// two triggers. at the index window everything closes. otherwise a position
// closes only once the market flipped and it now adds to the skew, and then
// never by more than the skew itself.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::bundle::{AccountUnion, ModifyPosition};
use crate::decision::acceptable_price;
use crate::market::Market;
use crate::packer::RejectedOperation;
use crate::position::Position;
use crate::price_feed::{fetch_prices, PriceOracle};
use crate::types::SignedSize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnwindReason {
    Window,
    SkewFlipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClosingOrder {
    pub position: Position,
    pub market: Market,
    pub size_delta: SignedSize,
    pub reason: UnwindReason,
}

/// True when the position sits on the majority side of its market.
pub fn is_mismatched(position: &Position, market_skew: SignedSize) -> bool {
    (position.size.is_long() && market_skew.is_long()) || (position.size.is_short() && market_skew.is_short())
}

pub fn closing_order(position: &Position, market: &Market, close_all: bool) -> Option<ClosingOrder> {
    if position.is_empty() {
        return None;
    }

    if close_all {
        return Some(ClosingOrder {
            position: *position,
            market: market.clone(),
            size_delta: position.size.negate(),
            reason: UnwindReason::Window,
        });
    }

    if !is_mismatched(position, market.skew) {
        return None;
    }

    let magnitude = position.size.abs().min(market.skew.abs());
    let side = position.side()?.opposite();
    Some(ClosingOrder {
        position: *position,
        market: market.clone(),
        size_delta: SignedSize::from_side(side, magnitude),
        reason: UnwindReason::SkewFlipped,
    })
}

/// Positions whose market is not in the snapshot are skipped.
pub fn closing_orders(positions: &[Position], markets: &[Market], close_all: bool) -> Vec<ClosingOrder> {
    positions
        .iter()
        .filter_map(|position| {
            let Some(market) = markets.iter().find(|m| m.id == position.market_id) else {
                warn!(market = %position.market_id, "position in unknown market, skipping");
                return None;
            };
            closing_order(position, market, close_all)
        })
        .collect()
}

// every market the margin account holds, so the exchange's margin check can
// see all of them from the first operation on
pub fn position_accounts(positions: &[Position], markets: &[Market]) -> AccountUnion {
    let mut union = AccountUnion::new();
    for position in positions {
        if let Some(market) = markets.iter().find(|m| m.id == position.market_id) {
            union.insert(market.address, market.price_feed);
        }
    }
    union
}

/// Prices each order. Orders whose feed has no price come back as rejected
/// so the caller knows the exposure is still open.
pub async fn price_closing_orders(
    orders: &[ClosingOrder],
    oracle: &dyn PriceOracle,
    slippage: Decimal,
) -> (Vec<ModifyPosition>, Vec<RejectedOperation>) {
    let feeds: Vec<_> = orders.iter().map(|o| o.market.price_feed).collect();
    let prices = fetch_prices(oracle, &feeds).await;

    let mut operations = Vec::with_capacity(orders.len());
    let mut unpriced = Vec::new();
    for (order, price) in orders.iter().zip(prices) {
        let Some(side) = order.size_delta.side() else { continue };
        let Some(price) = price else {
            warn!(market = %order.market.id, "no price for closing order, skipping");
            unpriced.push(RejectedOperation {
                market_id: order.market.id,
                size_delta: order.size_delta,
                reason: "no oracle price".to_string(),
            });
            continue;
        };
        operations.push(ModifyPosition {
            market_id: order.market.id,
            size_delta: order.size_delta,
            acceptable_price: acceptable_price(side, price, slippage),
            market: order.market.address,
            price_feed: order.market.price_feed,
        });
    }
    (operations, unpriced)
}
