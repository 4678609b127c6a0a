use anyhow::Context;
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

use retestbot::engine::Engine;
use retestbot::events::{BotEvent, EventBus};
use retestbot::execution::{ExecutionOrchestrator, PaperGateway};
use retestbot::feed::{BarSource, SyntheticFeed};
use retestbot::instruments::PipValueResolver;
use retestbot::resilience::{Dependency, ResilienceSupervisor};
use retestbot::{BotConfig, Timeframe};

/// Replay synthetic multi-instrument data through the retest strategy
/// against a paper venue
#[derive(Parser, Debug)]
#[command(name = "retestbot", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Instruments to simulate
    #[arg(long, value_delimiter = ',', default_value = "EURUSD,XAUUSD,US30")]
    symbols: Vec<String>,

    /// Hours of data to generate per instrument
    #[arg(long, default_value_t = 48)]
    hours: u32,

    /// Seed for the bar generator
    #[arg(long, default_value_t = 7)]
    seed: u64,
}

#[derive(Debug, Default)]
struct ReplayStats {
    bars: usize,
    settled: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();
    let config = BotConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    tracing::info!(
        symbols = ?args.symbols,
        hours = args.hours,
        seed = args.seed,
        "Retest bot starting"
    );

    // ============================================================================
    // Wiring
    // ============================================================================

    let events = EventBus::default();
    let event_log = tokio::spawn(log_events(events.subscribe()));

    let supervisor = Arc::new(ResilienceSupervisor::new(
        config.resilience.clone(),
        events.clone(),
    ));
    let gateway = Arc::new(
        PaperGateway::with_instruments(config.paper.starting_equity, config.instruments.clone())
            .with_account_currency(&config.risk.account_currency),
    );
    let orchestrator = Arc::new(ExecutionOrchestrator::new(
        gateway.clone(),
        supervisor.clone(),
    ));
    let mut engine = Engine::new(
        config.engine.clone(),
        config.pattern.clone(),
        config.volatility.clone(),
        config.risk.clone(),
        config.performance.clone(),
        PipValueResolver::new(config.instruments.clone()),
        orchestrator,
    );

    let symbols: Vec<String> = args
        .symbols
        .iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    let feed = SyntheticFeed::build(
        &symbols,
        replay_start(Utc::now()),
        args.hours,
        args.seed,
        config.engine.structure_timeframe,
        config.engine.confirmation_timeframe,
    );
    tracing::info!(bars = feed.remaining(), "Synthetic replay ready");

    // ============================================================================
    // Replay
    // ============================================================================

    tokio::select! {
        result = replay(
            &feed,
            &supervisor,
            &gateway,
            &mut engine,
            config.engine.confirmation_timeframe,
        ) => {
            match result {
                Ok(stats) => tracing::info!(
                    bars = stats.bars,
                    settled = stats.settled,
                    "Replay finished"
                ),
                Err(err) => tracing::error!(error = %err, "Replay stopped"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, stopping replay");
        }
    }

    // ============================================================================
    // Summary
    // ============================================================================

    for snapshot in engine.snapshot_all().await {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }

    let mut by_kind: BTreeMap<String, usize> = BTreeMap::new();
    for record in supervisor.audit_records() {
        *by_kind.entry(format!("{:?}", record.kind)).or_default() += 1;
    }
    let closed = gateway.closed_orders();
    let realized: f64 = closed.iter().filter_map(|o| o.realized_pnl).sum();

    println!();
    println!("Paper equity:    {:.2}", gateway.equity());
    println!("Realized P&L:    {:.2}", realized);
    println!("Closed orders:   {}", closed.len());
    println!("Open orders:     {}", gateway.open_orders().len());
    println!("Dropped bars:    {}", engine.dropped_bars());
    for dependency in Dependency::ALL {
        let state = supervisor.circuit_state(dependency);
        println!("Circuit {:<18} {:?}", dependency.to_string(), state.state);
    }
    println!("Audit records:   {}", by_kind.values().sum::<usize>());
    for (kind, count) in &by_kind {
        println!("  {:<28} {}", kind, count);
    }

    engine.shutdown().await;
    event_log.abort();
    Ok(())
}

/// Route every bar to the paper venue, then to its worker
///
/// The venue settles a confirmation bar before the worker sees it, and the
/// worker must be done with a bar before the venue sees the next one.
async fn replay(
    feed: &SyntheticFeed,
    supervisor: &ResilienceSupervisor,
    gateway: &PaperGateway,
    engine: &mut Engine,
    confirmation: Timeframe,
) -> retestbot::Result<ReplayStats> {
    let mut stats = ReplayStats::default();

    loop {
        let batch = supervisor
            .call(Dependency::MarketData, "poll_bars", || feed.poll_bars())
            .await?;
        if batch.is_empty() {
            break;
        }

        for bar in batch {
            let symbol = bar.symbol.clone();
            if bar.timeframe == confirmation {
                stats.settled += gateway.mark(&bar).len();
            }
            engine.replay(bar).await?;
            engine.flush(&symbol).await?;
            stats.bars += 1;
        }
    }

    Ok(stats)
}

async fn log_events(mut rx: broadcast::Receiver<BotEvent>) {
    loop {
        match rx.recv().await {
            Ok(BotEvent::TriggerFired(trigger)) => tracing::debug!(
                symbol = %trigger.symbol,
                direction = ?trigger.direction,
                price = trigger.trigger_price,
                "Trigger fired"
            ),
            Ok(
                event @ (BotEvent::CircuitOpened { .. }
                | BotEvent::RestartRequested { .. }
                | BotEvent::ManualInterventionRequired { .. }),
            ) => tracing::warn!(event = ?event, "Resilience event"),
            Ok(event) => tracing::info!(event = ?event, "Event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event log lagging");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Monday 00:00 UTC of the week before `now`
fn replay_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let date = now.date_naive() - Duration::days(7 + now.weekday().num_days_from_monday() as i64);
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("retestbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
