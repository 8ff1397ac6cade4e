//! Property-based tests for the fee model, the direction rule and packing.
//!
//! These tests verify invariants hold under random inputs.

use std::sync::Arc;
use std::time::Duration;

use funding_capture::*;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

// Strategies for generating test data
fn price_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..1_000_000i64).prop_map(|x| Decimal::new(x, 2)) // $0.01 to $10,000
}

fn shares_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..10_000_000i64).prop_map(|x| Decimal::new(x, 4)) // 0.0001 to 1000
}

fn skew_strategy() -> impl Strategy<Value = Decimal> {
    (-10_000_000i64..=10_000_000i64).prop_map(|x| Decimal::new(x, 4))
}

fn fee_strategy() -> impl Strategy<Value = Decimal> {
    (0i64..=100i64).prop_map(|x| Decimal::new(x, 2)) // 0% to 1%
}

fn rate_strategy() -> impl Strategy<Value = Decimal> {
    (-1_000i64..=1_000i64).prop_map(|x| Decimal::new(x, 4)) // -0.1% to 0.1% daily
}

fn side_strategy() -> impl Strategy<Value = Side> {
    prop_oneof![Just(Side::Long), Just(Side::Short)]
}

fn market(id: u32, skew: Decimal, funding_rate: Decimal) -> Market {
    Market {
        id: MarketId(id),
        address: AccountKey::derived(1, id),
        price_feed: AccountKey::derived(2, id),
        skew: SignedSize::new(skew),
        skew_scale: dec!(1000000),
        funding_rate,
        funding_velocity: Decimal::ZERO,
        maker_fee: dec!(0.1),
        taker_fee: dec!(0.15),
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

proptest! {
    /// No jump in the fee where the trade starts crossing onto the majority side
    #[test]
    fn blended_fee_continuous_at_zero_skew(
        skew_abs in shares_strategy(),
        price in price_strategy(),
        maker in fee_strategy(),
        taker in fee_strategy(),
        side in side_strategy(),
        eps_units in 1i64..100i64,
    ) {
        let price = Price::new_unchecked(price);
        // skew on the opposite side so the trade starts as minority
        let skew = -side.sign() * skew_abs;
        let eps = Decimal::new(eps_units, 6);

        let at_boundary = blended_fee(maker, taker, skew, side, price, skew_abs);
        let just_below = blended_fee(maker, taker, skew, side, price, skew_abs - eps);
        let just_above = blended_fee(maker, taker, skew, side, price, skew_abs + eps);

        let bound = maker.max(taker) * eps * price.value() / dec!(100) + dec!(0.0000001);
        prop_assert!((at_boundary - just_below).abs() <= bound);
        prop_assert!((just_above - at_boundary).abs() <= bound);
    }

    /// Trading entirely on the minority side is pure maker
    #[test]
    fn minority_trade_is_all_maker(
        skew_abs in shares_strategy(),
        fraction in 1u32..=100u32,
        side in side_strategy(),
    ) {
        let skew = -side.sign() * skew_abs;
        let shares = skew_abs * Decimal::from(fraction) / dec!(100);
        let (maker, taker) = maker_taker_split(skew, side, shares);
        prop_assert_eq!(maker, shares);
        prop_assert_eq!(taker, Decimal::ZERO);
    }

    /// Maker and taker portions always add back up to the trade
    #[test]
    fn split_preserves_shares(
        skew in skew_strategy(),
        shares in shares_strategy(),
        side in side_strategy(),
    ) {
        let (maker, taker) = maker_taker_split(skew, side, shares);
        prop_assert!(maker >= Decimal::ZERO && taker >= Decimal::ZERO);
        prop_assert_eq!(maker + taker, shares);
    }

    /// Long iff skew <= 0 and funding < 0, short iff skew > 0 and funding > 0
    #[test]
    fn direction_follows_minority_and_funding(
        skew in skew_strategy(),
        rate in rate_strategy(),
    ) {
        let m = market(1, skew, rate);
        let side = direction(&m.skew_data(), rate);

        prop_assert_eq!(side == Some(Side::Long), skew <= Decimal::ZERO && rate < Decimal::ZERO);
        prop_assert_eq!(side == Some(Side::Short), skew > Decimal::ZERO && rate > Decimal::ZERO);
    }

    /// Candidates always trade against the skew
    #[test]
    fn candidates_oppose_skew(
        skew in skew_strategy(),
        rate in rate_strategy(),
        price in price_strategy(),
    ) {
        let m = market(1, skew, rate);
        if let Some(c) = evaluate_market(&m, Price::new(price), dec!(12)) {
            let ops = to_operations(&[c], Decimal::ONE, dec!(0.1));
            prop_assert_eq!(ops[0].size_delta.value(), -skew);
        }
    }

    /// Same snapshot in, same candidates out
    #[test]
    fn decision_is_idempotent(
        skews in prop::collection::vec(skew_strategy(), 1..8),
        rates in prop::collection::vec(rate_strategy(), 8),
        prices in prop::collection::vec(price_strategy(), 8),
        best_only in any::<bool>(),
    ) {
        let exchange = SimExchange::new();
        let markets: Vec<Market> = skews
            .iter()
            .enumerate()
            .map(|(i, skew)| market(i as u32, *skew, rates[i] * dec!(100)))
            .collect();
        for (i, m) in markets.iter().enumerate() {
            exchange.set_price(m.price_feed, Some(prices[i]));
        }
        let params = DecisionParams {
            selection: Selection::from_trade_on_all(!best_only),
            ..DecisionParams::default()
        };

        let rt = runtime();
        let first = rt.block_on(find_profitable_markets(&markets, &exchange, &params, dec!(20)));
        let second = rt.block_on(find_profitable_markets(&markets, &exchange, &params, dec!(20)));
        prop_assert_eq!(first, second);
    }

    /// Sealed bundles respect the byte ceiling and the group size, and
    /// together hold exactly the input operations
    #[test]
    fn packing_respects_ceiling_and_preserves_operations(
        count in 0usize..16,
        group_size in 1usize..5,
        max_bytes in 400usize..1232,
        per_operation in 20usize..120,
    ) {
        let builder = SimBuilder::new(max_bytes, 150, per_operation, 64);
        let exchange = SimExchange::new();
        let submitter = Submitter::new(
            Arc::new(exchange.clone()),
            Arc::new(builder),
            RetryPolicy::default(),
        );
        let packer = BatchPacker::new(PackerConfig { group_size, ..PackerConfig::default() });

        let ops: Vec<ModifyPosition> = (0..count as u32)
            .map(|id| ModifyPosition {
                market_id: MarketId(id),
                size_delta: SignedSize::new(dec!(1)),
                acceptable_price: Price::new_unchecked(dec!(110)),
                market: AccountKey::derived(1, id),
                price_feed: AccountKey::derived(2, id),
            })
            .collect();

        let rt = runtime();
        let report = rt
            .block_on(async {
                let mut cache = BlockhashCache::new(Duration::from_secs(45));
                packer.pack_and_submit(ops.clone(), AccountUnion::new(), &submitter, &mut cache).await
            })
            .unwrap();

        // a single op is 150 + per_operation + 64 <= 334 < 400, so nothing is rejected
        prop_assert!(report.rejected.is_empty());
        for bundle in exchange.confirmed() {
            prop_assert!(bundle.size() <= max_bytes);
            prop_assert!(!bundle.operations.is_empty());
            prop_assert!(bundle.operations.len() <= group_size);
        }

        let mut packed: Vec<MarketId> = report.submitted_markets();
        packed.sort();
        let expected: Vec<MarketId> = ops.iter().map(|op| op.market_id).collect();
        prop_assert_eq!(packed, expected);
    }

    /// A token captured at T is not handed out at or after T + refresh
    #[test]
    fn token_cache_never_serves_expired(
        refresh_secs in 1u64..120,
        offset_ms in 0u64..240_000,
    ) {
        let mut cache = BlockhashCache::new(Duration::from_secs(refresh_secs));
        let t0 = tokio::time::Instant::now();
        cache.store(Blockhash("h".to_string()), t0);

        let served = cache.fresh(t0 + Duration::from_millis(offset_ms)).is_some();
        prop_assert_eq!(served, offset_ms < refresh_secs * 1000);
    }

    /// Scaled sizes never exceed the budget in notional
    #[test]
    fn budget_ratio_caps_notional(
        skews in prop::collection::vec(shares_strategy(), 1..6),
        price in price_strategy(),
        budget in 1i64..10_000i64,
    ) {
        let price = Price::new_unchecked(price);
        let candidates: Vec<TradeCandidate> = skews
            .iter()
            .enumerate()
            .filter_map(|(i, s)| evaluate_market(&market(i as u32, -*s, dec!(-0.5)), Some(price), dec!(24)))
            .collect();
        let budget = Decimal::from(budget);
        let ratio = budget_ratio(&candidates, budget);

        prop_assert!(ratio > Decimal::ZERO && ratio <= Decimal::ONE);
        let notional: Decimal = to_operations(&candidates, ratio, dec!(0.1))
            .iter()
            .map(|op| op.size_delta.abs() * price.value())
            .sum();
        prop_assert!(notional <= budget + dec!(0.0001));
        if ratio < Decimal::ONE {
            prop_assert!((notional - budget).abs() <= dec!(0.0001));
        }
    }
}
