// 5.5: blended maker/taker fee for a skew-based market.
// the part of a trade that shrinks the imbalance pays maker. anything that
// pushes past zero onto the majority side pays taker.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::market::Market;
use crate::types::{Price, Side};

/// Splits `shares` into (maker, taker) portions given the current skew.
pub fn maker_taker_split(skew_shares: Decimal, side: Side, shares: Decimal) -> (Decimal, Decimal) {
    let shares = shares.abs();
    // minority capacity: how much can be traded before the skew reaches zero
    let capacity = match side {
        Side::Long => (-skew_shares).max(Decimal::ZERO),
        Side::Short => skew_shares.max(Decimal::ZERO),
    };
    let maker = shares.min(capacity);
    (maker, shares - maker)
}

/// Fee in USD. `maker_fee` and `taker_fee` are percentages.
pub fn blended_fee(
    maker_fee: Decimal,
    taker_fee: Decimal,
    skew_shares: Decimal,
    side: Side,
    price: Price,
    shares: Decimal,
) -> Decimal {
    let (maker, taker) = maker_taker_split(skew_shares, side, shares);
    let fee_shares = maker_fee * maker + taker_fee * taker;
    fee_shares * price.value() / dec!(100)
}

pub fn market_blended_fee(market: &Market, side: Side, price: Price, shares: Decimal) -> Decimal {
    blended_fee(market.maker_fee, market.taker_fee, market.skew.value(), side, price, shares)
}
