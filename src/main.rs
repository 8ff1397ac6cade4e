//! Funding capture simulation.
//!
//! Drives the bot through a scripted day against the in-memory exchange:
//! open on the minority side, hold, close what the skew flipped against,
//! unwind at the index window, then resume. A second run shows submissions
//! surviving a stale blockhash and the exchange's spurious error 6000.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::Parser;
use funding_capture::*;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[derive(Parser, Debug)]
#[command(name = "funding-capture-sim", about = "Funding capture bot against a simulated exchange")]
struct Args {
    /// TOML config file; defaults are used when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Only trade the single most profitable market
    #[arg(long)]
    best_only: bool,

    /// Start of the simulated day (RFC 3339, UTC)
    #[arg(long, default_value = "2026-03-02T11:50:00Z")]
    start: String,

    /// Fetch a blockhash from RPC_URL and exit
    #[arg(long)]
    check_rpc: bool,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => BotConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => {
            let mut config = BotConfig::default();
            config.apply_env(|key| std::env::var(key).ok())?;
            config.validate()?;
            config
        }
    };
    if args.best_only {
        config.trade_on_all_profitable_markets = false;
    }
    config.logging.init();

    let start: DateTime<Utc> = args.start.parse().context("--start must be an RFC 3339 timestamp")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;

    if args.check_rpc {
        return runtime.block_on(check_rpc(&config));
    }

    println!("Funding Capture Simulation");
    println!(
        "Budget ${}, window {:02}:{:02}-{:02}:{:02} UTC\n",
        config.amount_to_trade_usd,
        config.index_window.min_hours,
        config.index_window.min_minutes,
        config.index_window.max_hours,
        config.index_window.max_minutes
    );

    runtime.block_on(scenario_1_day_cycle(&config, start))?;
    runtime.block_on(scenario_2_flaky_submission(&config))?;
    runtime.block_on(scenario_3_unattended_loop(&config, start))?;

    println!("\nAll simulations completed successfully.");
    Ok(())
}

async fn check_rpc(config: &BotConfig) -> Result<()> {
    let url = config.require_rpc_url()?;
    let ledger = RpcLedger::new(url, &config.commitment, config.retry.confirm_timeout())?;
    let submitter = Submitter::new(Arc::new(ledger), Arc::new(SimBuilder::default()), config.retry.clone());
    let mut cache = BlockhashCache::new(config.retry.blockhash_refresh());

    let blockhash = submitter
        .latest_blockhash(&mut cache)
        .await
        .with_context(|| format!("fetching blockhash from {url}"))?;
    println!("{url} ({}): latest blockhash {blockhash}", config.commitment);
    Ok(())
}

/// Raw on-chain values, decoded the same way live accounts are.
fn market_account(id: u32, skew_shares: i128, daily_rate_pct: Decimal, maker_bps: u16) -> MarketAccount {
    let rate = (daily_rate_pct * FUNDING_RATE_DENOMINATOR).to_i128().unwrap_or_default();
    MarketAccount {
        id,
        address: AccountKey::derived(1, id),
        price_feed: AccountKey::derived(2, id),
        skew: skew_shares * 1_000_000,
        skew_scale: 1_000_000_000_000,
        last_funding_rate: rate,
        funding_velocity: 0,
        maker_fee_rate: maker_bps,
        taker_fee_rate: 10,
    }
}

fn world(config: &BotConfig) -> Result<(SimExchange, Bot)> {
    let exchange = SimExchange::new();

    let accounts = [
        // shorts dominate, longs get paid
        (market_account(0, -3, dec!(-0.6), 10), dec!(120)),
        // longs dominate, shorts get paid
        (market_account(1, 5, dec!(0.9), 10), dec!(45)),
        // majority is paid: no trade
        (market_account(2, 4, dec!(-0.5), 10), dec!(300)),
        // fee schedule not configured
        (market_account(3, -6, dec!(-1.2), 0), dec!(80)),
    ];
    for (account, price) in &accounts {
        let market = Market::from_account(account)?;
        exchange.set_price(market.price_feed, Some(*price));
        exchange.add_market(market);
    }
    exchange.set_margin_account(MarginAccount::new(config.margin_account_key(), config.margin_account_id));

    let submitter = Submitter::new(
        Arc::new(exchange.clone()),
        Arc::new(SimBuilder::default()),
        config.retry.clone(),
    );
    let shared = Arc::new(exchange.clone());
    let bot = Bot::new(config, shared.clone(), shared, submitter);
    Ok((exchange, bot))
}

fn describe(at: DateTime<Utc>, outcome: &CycleOutcome) {
    let time = at.format("%H:%M");
    match outcome {
        CycleOutcome::Opened { candidates, report } => {
            println!("  {time} opened {} market(s) in {} bundle(s)", candidates.len(), report.submitted.len());
            for c in candidates {
                println!(
                    "        market {} {:?} {} shares, expected pnl {}, fee ${}",
                    c.market.id,
                    c.side,
                    c.shares,
                    c.expected_pnl.round_dp(4),
                    c.estimated_fee.round_dp(4)
                );
            }
        }
        CycleOutcome::Unwound { open_positions, report } => println!(
            "  {time} holding {open_positions} position(s), closed {} flipped",
            report.operations_submitted()
        ),
        CycleOutcome::WindowUnwind { closing, report } => println!(
            "  {time} index window: closed {closing} position(s) in {} bundle(s)",
            report.submitted.len()
        ),
        CycleOutcome::WindowIdle => println!("  {time} index window: already flat, waiting"),
        CycleOutcome::NoOpportunity => println!("  {time} no profitable markets"),
    }
}

fn print_positions(exchange: &SimExchange) {
    if let Some(margin) = exchange.margin() {
        for p in margin.open_positions() {
            println!("        position market {}: {}", p.market_id, p.size.value());
        }
    }
}

/// A scripted day: open, hold, skew flips, window unwind, resume.
async fn scenario_1_day_cycle(config: &BotConfig, start: DateTime<Utc>) -> Result<()> {
    println!("Scenario 1: A Day of Funding Capture\n");

    let (exchange, mut bot) = world(config)?;

    // first cycle: nothing open, scan and open
    let outcome = bot.run_cycle(start).await?;
    describe(start, &outcome);
    print_positions(&exchange);

    let hold = start + Duration::minutes(5);
    describe(hold, &bot.run_cycle(hold).await?);

    // longs take over market 0, our long now adds to the skew
    exchange.set_skew(MarketId(0), dec!(0.5));
    let flipped = start + Duration::hours(6);
    describe(flipped, &bot.run_cycle(flipped).await?);
    print_positions(&exchange);

    let window = config
        .index_window
        .next_start(start)
        .context("index window has no start time")?
        + Duration::minutes(1);
    describe(window, &bot.run_cycle(window).await?);
    let later = window + Duration::minutes(5);
    describe(later, &bot.run_cycle(later).await?);
    print_positions(&exchange);

    let after = config
        .index_window
        .bounds_on(window.date_naive())
        .map(|(_, end)| end + Duration::minutes(5))
        .context("index window has no end time")?;
    describe(after, &bot.run_cycle(after).await?);

    println!("  confirmed bundles: {}\n", exchange.confirmed().len());
    Ok(())
}

/// Stale blockhash and error 6000 on the way in; both are retried without
/// touching the general retry budget.
async fn scenario_2_flaky_submission(config: &BotConfig) -> Result<()> {
    println!("Scenario 2: Stale Blockhash and Error 6000\n");

    let (exchange, _) = world(config)?;
    let submitter = Submitter::new(
        Arc::new(exchange.clone()),
        Arc::new(SimBuilder::default()),
        config.retry.clone(),
    );
    let mut cache = BlockhashCache::new(config.retry.blockhash_refresh());

    let op = ModifyPosition {
        market_id: MarketId(0),
        size_delta: SignedSize::new(dec!(0.1)),
        acceptable_price: Price::new_unchecked(dec!(132)),
        market: AccountKey::derived(1, 0),
        price_feed: AccountKey::derived(2, 0),
    };
    let bundle = PendingBundle::new(AccountUnion::new()).with(op);

    exchange.fail_next_sends(vec![
        LedgerError::Transaction("Blockhash not found".to_string()),
        LedgerError::Transaction("custom program error: 0x1770".to_string()),
    ]);
    let submission = submitter
        .submit(&bundle, config.packer.compute_unit_ceiling, &mut cache)
        .await?;

    println!("  confirmed {}", submission.signature);
    println!(
        "  attempts {}, stale retries {}, spurious retries {}",
        submission.attempts, submission.stale_retries, submission.spurious_retries
    );
    let attempts = exchange.attempts();
    let same_content = attempts.windows(2).all(|w| w[0].operations == w[1].operations);
    println!("  {} sends, identical operations on every resend: {}\n", attempts.len(), same_content);
    Ok(())
}

/// The bot's own loop for three cycles; the first bundle fails outright and
/// the loop carries on.
async fn scenario_3_unattended_loop(config: &BotConfig, start: DateTime<Utc>) -> Result<()> {
    println!("Scenario 3: Unattended Loop\n");

    let config = BotConfig {
        poll_interval_secs: 1,
        ..config.clone()
    };
    let (exchange, mut bot) = world(&config)?;
    exchange.fail_next_sends(vec![
        LedgerError::Transaction("insufficient collateral".to_string());
        config.retry.max_attempts as usize
    ]);

    // one simulated hour per cycle, clear of the window
    let mut cycle = 0;
    let stats = bot
        .run_with_clock(Some(3), || {
            cycle += 1;
            start + Duration::hours(cycle)
        })
        .await;

    println!("  cycles {}, failed {}", stats.cycles, stats.failed);
    print_positions(&exchange);
    println!("  confirmed bundles: {}", exchange.confirmed().len());
    Ok(())
}
