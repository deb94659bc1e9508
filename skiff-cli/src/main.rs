use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use skiff_config::{load_config, AppConfig, EngineMode};
use skiff_core::{normalize_symbol, EventBus, VenueId};
use skiff_engine::{
    ArbitrageConfig, ArbitrageOrchestrator, Engine, EngineConfig, Scheduler, SchedulerConfig,
    ShutdownSignal,
};
use skiff_history::{HistoryStore, JsonlHistoryStore, SqliteHistoryStore};
use skiff_markets::{FeeSchedule, PaperVenue, VenueLatency, VenueRegistry};
use skiff_strategy::HeuristicAdvisor;
use skiff_stream::{MarketStream, StreamConfig};
use tracing::{error, info};

mod telemetry;

use telemetry::{init_tracing, spawn_metrics_server, EngineMetrics};

const EXIT_CONFIG: u8 = 1;
const EXIT_DB_UNREACHABLE: u8 = 2;
const EXIT_INTERRUPT: u8 = 130;

#[derive(Parser)]
#[command(author, version, about = "Skiff paper-trading engine")]
struct Cli {
    /// Increases logging verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Optional JSON log file in addition to console output
    #[arg(long)]
    log_path: Option<PathBuf>,
    /// Address for the Prometheus metrics endpoint
    #[arg(long, default_value = "127.0.0.1:9464")]
    metrics_addr: SocketAddr,
    /// Comma-separated symbols, overriding ENGINE_SYMBOL
    #[arg(long)]
    symbols: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| match cli.verbose {
        0 => config.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    });
    if let Err(err) = init_tracing(&filter, cli.log_path.as_deref()) {
        eprintln!("failed to initialize logging: {err}");
        return ExitCode::from(EXIT_CONFIG);
    }

    let history: Arc<dyn HistoryStore> = match open_history(&config) {
        Ok(history) => history,
        Err(err) => {
            error!(error = %err, url = %config.database_url, "history store unreachable");
            return ExitCode::from(EXIT_DB_UNREACHABLE);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to start async runtime");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    match runtime.block_on(run(cli, config, history)) {
        Ok(interrupted) => {
            if interrupted {
                ExitCode::from(EXIT_INTERRUPT)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(err) => {
            error!(error = %err, "engine run failed");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

/// Pick the history backend from `DATABASE_URL`: SQLite for `.db` files
/// or `sqlite:` URLs, a JSONL directory otherwise.
fn open_history(config: &AppConfig) -> Result<Arc<dyn HistoryStore>> {
    let url = config.database_url.trim();
    if let Some(path) = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:")) {
        return Ok(Arc::new(SqliteHistoryStore::open(path)?));
    }
    if url.ends_with(".db") || url.ends_with(".sqlite") {
        return Ok(Arc::new(SqliteHistoryStore::open(url)?));
    }
    Ok(Arc::new(JsonlHistoryStore::open(url)?))
}

fn paper_registry(config: &AppConfig) -> (VenueRegistry, Vec<Arc<PaperVenue>>) {
    let fees = FeeSchedule {
        maker_bps: config.bot_paper_fee_bps / Decimal::from(2),
        taker_bps: config.bot_paper_fee_bps,
    };
    let mut registry = VenueRegistry::new();
    let mut venues = Vec::new();
    for (venue, round_trip_ms) in [
        (VenueId::Binance, 35),
        (VenueId::Kucoin, 55),
        (VenueId::Bybit, 45),
    ] {
        let adapter = Arc::new(PaperVenue::new(venue, fees, VenueLatency { round_trip_ms }));
        registry.register(adapter.clone());
        venues.push(adapter);
    }
    (registry, venues)
}

/// Mirror every closed bar onto the paper venues as a synthetic top of
/// book, with a small per-venue skew so the scanner has spreads to read.
fn spawn_quote_feeder(
    bus: &EventBus,
    venues: Vec<Arc<PaperVenue>>,
) -> tokio::task::JoinHandle<()> {
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let skiff_core::Event::MarketUpdate { symbol, close, .. } = event {
                for (index, venue) in venues.iter().enumerate() {
                    let skew = Decimal::new(index as i64, 4) * close / Decimal::from(100);
                    let half_spread = close * Decimal::new(1, 4);
                    venue.update_quote(
                        &symbol,
                        close - half_spread - skew,
                        close + half_spread - skew,
                    );
                }
            }
        }
    })
}

/// Opportunistic cross-venue scan on the engine loop cadence.
fn spawn_arbitrage_loop(
    orchestrator: Arc<ArbitrageOrchestrator>,
    symbols: Vec<String>,
    loop_ms: u64,
    shutdown: ShutdownSignal,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_millis(loop_ms.max(1_000)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tick.tick() => {
                    for symbol in &symbols {
                        match orchestrator.scan(symbol).await {
                            Ok(Some(opportunity)) => {
                                let quantity = skiff_core::round_size(
                                    Decimal::from(50) / opportunity.buy_ask.max(Decimal::ONE),
                                );
                                match orchestrator.execute(&opportunity, quantity).await {
                                    Ok(execution) if execution.hedged => {
                                        info!(symbol, "arbitrage leg failed; hedged")
                                    }
                                    Ok(_) => info!(symbol, net_pct = opportunity.net_pct, "arbitrage executed"),
                                    Err(err) => error!(symbol, error = %err, "arbitrage execution failed"),
                                }
                            }
                            Ok(None) => {}
                            Err(err) => error!(symbol, error = %err, "arbitrage scan failed"),
                        }
                    }
                }
            }
        }
    })
}

async fn run(cli: Cli, config: AppConfig, history: Arc<dyn HistoryStore>) -> Result<bool> {
    if config.engine_mode == EngineMode::Live {
        info!("LIVE mode credentials present; execution remains simulated");
    }
    let symbols: Vec<String> = cli
        .symbols
        .as_deref()
        .unwrap_or(&config.engine_symbol)
        .split(',')
        .map(normalize_symbol)
        .filter(|symbol| !symbol.is_empty())
        .collect();

    let bus = EventBus::default();
    let engine_config = EngineConfig {
        symbols: symbols.clone(),
        timeframe: config.timeframe().context("invalid timeframe")?,
        initial_balance: config.initial_balance,
        fee_bps: config.bot_paper_fee_bps,
        confidence_threshold: config.confidence_threshold,
        auto_paper: config.auto_paper,
        stale_data_ms: config.bot_stale_data_ms,
        ..EngineConfig::default()
    };
    let engine = Arc::new(Engine::new(engine_config, history.clone(), bus.clone())?);
    let stream = Arc::new(MarketStream::new(StreamConfig::default(), bus.clone())?);
    let (registry, venues) = paper_registry(&config);

    let metrics = EngineMetrics::new();
    let metrics_task = spawn_metrics_server(metrics.registry(), cli.metrics_addr);
    let collector_task = metrics.spawn_collector(&bus);
    let feeder_task = spawn_quote_feeder(&bus, venues);

    let shutdown = ShutdownSignal::new();
    let orchestrator = Arc::new(ArbitrageOrchestrator::new(
        registry,
        history.clone(),
        ArbitrageConfig {
            slippage_bps: config.bot_paper_slippage_bps.to_f64().unwrap_or(4.0),
            min_net_pct: config.bot_min_expected_edge,
            ..ArbitrageConfig::default()
        },
    ));
    let arbitrage_task = spawn_arbitrage_loop(
        orchestrator,
        symbols.clone(),
        config.bot_loop_ms,
        shutdown.clone(),
    );
    let interrupt = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; shutting down");
                shutdown.trigger();
            }
        })
    };

    info!(
        symbols = ?symbols,
        mode = ?config.engine_mode,
        timeframe = %config.bot_timeframe,
        "starting skiff engine"
    );
    let scheduler = Scheduler::new(
        engine,
        stream,
        Arc::new(HeuristicAdvisor),
        SchedulerConfig::default(),
        shutdown.clone(),
    );
    scheduler.run(symbols).await?;

    metrics_task.abort();
    collector_task.abort();
    feeder_task.abort();
    arbitrage_task.abort();
    let interrupted = shutdown.triggered();
    interrupt.abort();
    Ok(interrupted)
}
