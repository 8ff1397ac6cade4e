// 12.0 decision.rs: which markets to open and how big.
// always trade the minority side, and only when funding pays that side.
// size is the whole current skew, later scaled down to the USD budget.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bundle::ModifyPosition;
use crate::fees::market_blended_fee;
use crate::funding::{expected_pnl, hourly_rate, is_profitable, PNL_BASELINE};
use crate::market::{Market, SkewData};
use crate::price_feed::{fetch_prices, PriceOracle};
use crate::types::{Price, Side, SignedSize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeCandidate {
    pub market: Market,
    pub side: Side,
    /// Signed target size, full skew magnitude in the trade's direction
    pub size: SignedSize,
    pub shares: Decimal,
    pub expected_pnl: Decimal,
    pub price: Price,
    /// Blended entry fee in USD
    pub estimated_fee: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    AllProfitable,
    BestOnly,
}

impl Selection {
    pub fn from_trade_on_all(trade_on_all: bool) -> Self {
        if trade_on_all {
            Selection::AllProfitable
        } else {
            Selection::BestOnly
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionParams {
    pub budget_usd: Decimal,
    pub min_expected_pnl: Decimal,
    pub acceptable_slippage: Decimal,
    pub selection: Selection,
}

impl Default for DecisionParams {
    fn default() -> Self {
        Self {
            budget_usd: dec!(20),
            min_expected_pnl: PNL_BASELINE,
            acceptable_slippage: dec!(0.10),
            selection: Selection::AllProfitable,
        }
    }
}

// 12.1: long only when longs are not the majority and funding is negative
// (shorts pay longs). short is the mirror image.
pub fn direction(skew: &SkewData, funding_rate: Decimal) -> Option<Side> {
    if !skew.skew_longed && funding_rate < Decimal::ZERO {
        Some(Side::Long)
    } else if skew.skew_longed && funding_rate > Decimal::ZERO {
        Some(Side::Short)
    } else {
        None
    }
}

// 12.2: one market, no I/O. returns the candidate before the profitability filter.
pub fn evaluate_market(market: &Market, price: Option<Price>, hours_until_window: Decimal) -> Option<TradeCandidate> {
    let price = price?;
    let side = direction(&market.skew_data(), market.funding_rate)?;

    let shares = market.skew.abs();
    if shares.is_zero() || market.maker_fee.is_zero() {
        return None;
    }

    let estimated_fee = market_blended_fee(market, side, price, shares);
    let notional = shares * price.value();
    let fee_percentage = estimated_fee / notional * dec!(100);

    let pnl = expected_pnl(
        fee_percentage,
        market.taker_fee,
        hourly_rate(market.funding_rate),
        hours_until_window,
        market.funding_velocity,
    );

    Some(TradeCandidate {
        market: market.clone(),
        side,
        size: SignedSize::from_side(side, shares),
        shares,
        expected_pnl: pnl,
        price,
        estimated_fee,
    })
}

/// Keeps candidates above the threshold, narrowed per `selection`.
pub fn select_candidates(
    candidates: Vec<TradeCandidate>,
    min_expected_pnl: Decimal,
    selection: Selection,
) -> Vec<TradeCandidate> {
    let mut profitable: Vec<TradeCandidate> = candidates
        .into_iter()
        .filter(|c| is_profitable(c.expected_pnl, min_expected_pnl))
        .collect();

    if selection == Selection::BestOnly {
        // stable sort: on a tie the earlier market wins
        profitable.sort_by(|a, b| b.expected_pnl.cmp(&a.expected_pnl));
        profitable.truncate(1);
    }
    profitable
}

// 12.3: all price feeds are read concurrently, then evaluated in market order
pub async fn find_profitable_markets(
    markets: &[Market],
    oracle: &dyn PriceOracle,
    params: &DecisionParams,
    hours_until_window: Decimal,
) -> Vec<TradeCandidate> {
    let feeds: Vec<_> = markets.iter().map(|m| m.price_feed).collect();
    let prices = fetch_prices(oracle, &feeds).await;

    let candidates: Vec<TradeCandidate> = markets
        .iter()
        .zip(prices)
        .filter_map(|(market, price)| {
            let candidate = evaluate_market(market, price, hours_until_window);
            if candidate.is_none() {
                debug!(market = %market.id, "no trade");
            }
            candidate
        })
        .collect();

    select_candidates(candidates, params.min_expected_pnl, params.selection)
}

// 12.4: 1 if the budget covers the full skew of every candidate, else the
// fraction that fits
pub fn budget_ratio(candidates: &[TradeCandidate], budget_usd: Decimal) -> Decimal {
    let total: Decimal = candidates.iter().map(|c| c.shares * c.price.value()).sum();
    if total.is_zero() || budget_usd > total {
        Decimal::ONE
    } else {
        budget_usd / total
    }
}

pub fn acceptable_price(side: Side, price: Price, slippage: Decimal) -> Price {
    price.scale(Decimal::ONE + side.sign() * slippage)
}

/// Size delta opposes the current skew and is scaled by `ratio`.
pub fn to_operations(candidates: &[TradeCandidate], ratio: Decimal, slippage: Decimal) -> Vec<ModifyPosition> {
    candidates
        .iter()
        .map(|c| ModifyPosition {
            market_id: c.market.id,
            size_delta: c.market.skew.negate().scale(ratio),
            acceptable_price: acceptable_price(c.side, c.price, slippage),
            market: c.market.address,
            price_feed: c.market.price_feed,
        })
        .collect()
}
