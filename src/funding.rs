// 5.0: expected funding capture. pure, no I/O.
// funding accrues linearly with the rate plus a quadratic term from funding velocity.
// pnl is expressed against a baseline of 100 (break even), so 100.04 = +0.04%.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

pub const HOURS_PER_DAY: Decimal = dec!(24);
pub const PNL_BASELINE: Decimal = dec!(100);

// 5.1: daily percentage → hourly percentage
pub fn hourly_rate(daily_rate: Decimal) -> Decimal {
    daily_rate / HOURS_PER_DAY
}

// 5.2: |rate·h + ½·(velocity/24)·h²|. direction agnostic, the decision engine
// only trades the side funding pays.
pub fn funding_gained(
    hourly_funding_rate: Decimal,
    hours_until_window: Decimal,
    funding_velocity_daily_pct: Decimal,
) -> Decimal {
    let velocity_hourly = funding_velocity_daily_pct / HOURS_PER_DAY;
    let linear = hourly_funding_rate * hours_until_window;
    let quadratic = dec!(0.5) * velocity_hourly * hours_until_window * hours_until_window;
    (linear + quadratic).abs()
}

// 5.3: net of entry fee and exit taker fee, against the 100 baseline
pub fn expected_pnl(
    fee_percentage: Decimal,
    taker_fee_percentage: Decimal,
    hourly_funding_rate: Decimal,
    hours_until_window: Decimal,
    funding_velocity_daily_pct: Decimal,
) -> Decimal {
    let gained = funding_gained(hourly_funding_rate, hours_until_window, funding_velocity_daily_pct);
    PNL_BASELINE + gained - fee_percentage - taker_fee_percentage
}

pub fn is_profitable(pnl: Decimal, min_expected_pnl: Decimal) -> bool {
    pnl > min_expected_pnl
}
