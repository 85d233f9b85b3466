use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use perp_arb_keeper::adapters::mock::{MockExchangeAdapter, MockHistoricalService};
use perp_arb_keeper::adapters::{ExchangeAdapter, HistoricalFundingService};
use perp_arb_keeper::config::KeeperConfig;
use perp_arb_keeper::error::KeeperError;
use perp_arb_keeper::evaluator::{
    score_candidate, select_top_candidate, CandidateOpportunity, ExecutionPlan, HistoricalMetrics,
};
use perp_arb_keeper::events::EventBus;
use perp_arb_keeper::execution::SlicedExecutionEngine;
use perp_arb_keeper::loss_tracker::LossTracker;
use perp_arb_keeper::model::{Exchange, LockHolder, Side, Symbol};
use perp_arb_keeper::rate_limiter::RateLimiter;
use perp_arb_keeper::registry::{LockRegistry, OrderRegistry};

/// Perpetual-futures funding-rate arbitrage keeper — demo CLI wiring the core
/// components around scriptable mock venues.
#[derive(Parser)]
#[command(name = "keeper", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler loop against mock venues.
    Run {
        /// Path to a JSON config file. Falls back to defaults if omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Run a single cycle then exit, instead of looping forever.
        #[arg(long)]
        once: bool,

        /// Seconds to sleep between scheduler cycles.
        #[arg(long, default_value = "30")]
        interval_secs: u64,
    },
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<KeeperConfig> {
    match path {
        Some(p) => {
            let raw = std::fs::read_to_string(&p)?;
            Ok(KeeperConfig::from_json(&raw)?)
        }
        None => Ok(KeeperConfig::default()),
    }
}

/// Seeds a symbol with mark prices and historical metrics favourable enough
/// to surface as the top candidate — stands in for a real market-data feed.
async fn seed_demo_market(
    historical: &MockHistoricalService,
    long_adapter: &MockExchangeAdapter,
    short_adapter: &MockExchangeAdapter,
    symbol: &Symbol,
) {
    long_adapter.set_mark(symbol, 3_000.0).await;
    short_adapter.set_mark(symbol, 3_000.0).await;
    historical
        .set_metrics(
            symbol,
            Exchange::Alpha,
            Exchange::Beta,
            HistoricalMetrics {
                avg_rate: 0.0002,
                std_dev: 0.00005,
                min_rate: 0.0001,
                max_rate: 0.0003,
                consistency_score: 0.9,
            },
        )
        .await;
}

async fn run_cycle(
    engine: &SlicedExecutionEngine,
    historical: &MockHistoricalService,
    loss_tracker: &LossTracker,
    leg_a: &Arc<dyn ExchangeAdapter>,
    leg_b: &Arc<dyn ExchangeAdapter>,
    config: &KeeperConfig,
    symbol: &Symbol,
) -> Result<(), KeeperError> {
    let opportunity = CandidateOpportunity {
        symbol: symbol.clone(),
        long_venue: Exchange::Alpha,
        short_venue: Exchange::Beta,
        expected_spread: 0.0002,
        long_mark: 3_000.0,
        short_mark: 3_000.0,
        long_open_interest: Some(5_000_000.0),
        short_open_interest: Some(5_000_000.0),
    };
    let plan = ExecutionPlan {
        position_size_usd: 300.0,
        entry_fees: 0.3,
        exit_fees: 0.3,
        slippage: 0.1,
        expected_net_return: 0.0,
    };
    let metrics = historical
        .historical_metrics(symbol, Exchange::Alpha, Exchange::Beta)
        .await?;
    let scored = score_candidate(opportunity, plan, metrics);
    let chosen = select_top_candidate(vec![scored], config.max_worst_case_break_even_days);

    let Some(candidate) = chosen else {
        println!("keeper: no candidate cleared the break-even threshold this cycle");
        return Ok(());
    };

    println!(
        "keeper: executing {} long={} short={} score={:.6}",
        candidate.opportunity.symbol,
        candidate.opportunity.long_venue,
        candidate.opportunity.short_venue,
        candidate.score
    );

    let result = engine
        .execute(
            LockHolder::new(1),
            symbol,
            leg_a,
            leg_b,
            Side::Long,
            0.1,
            100_000.0,
            candidate.opportunity.long_mark,
            candidate.opportunity.short_mark,
        )
        .await?;

    println!(
        "keeper: execution finished success={} slices={}/{} long_filled={:.4} short_filled={:.4}",
        result.success,
        result.slices_completed,
        result.slices_planned,
        result.total_long_filled,
        result.total_short_filled
    );

    if result.success {
        loss_tracker
            .record_position_entry(
                symbol,
                candidate.opportunity.long_venue,
                plan.entry_fees,
                plan.position_size_usd,
                chrono::Utc::now(),
            )
            .await;
        println!(
            "keeper: cumulative loss tracker now at {:.4}",
            loss_tracker.cumulative_loss().await
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            once,
            interval_secs,
        } => {
            let config = load_config(config)?;

            let rate_limiter = Arc::new(RateLimiter::new(Default::default()));
            let lock_registry = Arc::new(LockRegistry::new(&config));
            let order_registry = Arc::new(OrderRegistry::new(&config));
            let event_bus = Arc::new(EventBus::new());
            let loss_tracker = LossTracker::new();
            let historical = MockHistoricalService::new();

            let long_mock = MockExchangeAdapter::new(Exchange::Alpha);
            let short_mock = MockExchangeAdapter::new(Exchange::Beta);
            let symbol = Symbol::normalize("BTC-PERP");
            seed_demo_market(&historical, &long_mock, &short_mock, &symbol).await;

            // Script a happy-path fill for the demo so `once` produces visible output.
            long_mock.queue_next_order_id("demo-a").await;
            long_mock
                .queue_status_sequence(
                    "demo-a",
                    vec![perp_arb_keeper::model::OrderStatusReport {
                        status: perp_arb_keeper::model::OrderStatus::Filled,
                        filled_size: Some(0.1),
                        avg_fill_price: Some(3_000.0),
                    }],
                )
                .await;
            short_mock.queue_next_order_id("demo-b").await;
            short_mock
                .queue_status_sequence(
                    "demo-b",
                    vec![perp_arb_keeper::model::OrderStatusReport {
                        status: perp_arb_keeper::model::OrderStatus::Filled,
                        filled_size: Some(0.1),
                        avg_fill_price: Some(3_000.0),
                    }],
                )
                .await;

            let leg_a: Arc<dyn ExchangeAdapter> = Arc::new(long_mock);
            let leg_b: Arc<dyn ExchangeAdapter> = Arc::new(short_mock);

            let engine = SlicedExecutionEngine::new(
                rate_limiter,
                lock_registry,
                order_registry,
                config.clone(),
            )
            .with_event_bus(event_bus);

            loop {
                if let Err(e) = run_cycle(
                    &engine,
                    &historical,
                    &loss_tracker,
                    &leg_a,
                    &leg_b,
                    &config,
                    &symbol,
                )
                .await
                {
                    eprintln!("keeper: cycle failed: {e}");
                }
                if once {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_secs(interval_secs)).await;
            }
            Ok(())
        }
    }
}
