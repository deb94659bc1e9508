//! Tracing setup and the Prometheus metrics endpoint.

use std::convert::Infallible;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, StatusCode};
use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder};
use skiff_core::{Event, EventBus};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

// Keeps the non-blocking appender alive for the process lifetime;
// dropping it would silently stop file logging.
static APPENDER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global tracing subscriber: human-readable console output,
/// plus a JSON line log when `json_log` points at a file.
pub fn init_tracing(directives: &str, json_log: Option<&Path>) -> Result<()> {
    let console = fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(directives));

    let json_file = match json_log {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("cannot create log parent directory {}", parent.display())
                })?;
            }
            let sink = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot append to log file {}", path.display()))?;
            let (non_blocking, appender_guard) = tracing_appender::non_blocking(sink);
            let _ = APPENDER_GUARD.set(appender_guard);
            Some(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(non_blocking)
                    .with_filter(EnvFilter::new(directives)),
            )
        }
        None => None,
    };

    // `Option<Layer>` is itself a layer, so one registry build covers
    // both configurations.
    tracing_subscriber::registry()
        .with(console)
        .with(json_file)
        .try_init()
        .context("tracing subscriber already installed")?;
    Ok(())
}

/// Prometheus metrics collected while the engine runs.
pub struct EngineMetrics {
    registry: Registry,
    candles_total: IntCounter,
    decisions_total: IntCounter,
    fills_total: IntCounter,
    breaker_trips_total: IntCounter,
    stream_lag_ms: Gauge,
    last_close: Gauge,
}

impl EngineMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let candles_total =
            IntCounter::new("skiff_candles_total", "Closed bars processed").unwrap();
        let decisions_total =
            IntCounter::new("skiff_decisions_total", "Decisions recorded").unwrap();
        let fills_total = IntCounter::new("skiff_fills_total", "Simulated fills").unwrap();
        let breaker_trips_total =
            IntCounter::new("skiff_breaker_trips_total", "Circuit breaker trips").unwrap();
        let stream_lag_ms = Gauge::new(
            "skiff_stream_lag_ms",
            "Lag between bar close and local receipt",
        )
        .unwrap();
        let last_close = Gauge::new("skiff_last_close", "Latest observed close price").unwrap();
        registry.register(Box::new(candles_total.clone())).unwrap();
        registry.register(Box::new(decisions_total.clone())).unwrap();
        registry.register(Box::new(fills_total.clone())).unwrap();
        registry
            .register(Box::new(breaker_trips_total.clone()))
            .unwrap();
        registry.register(Box::new(stream_lag_ms.clone())).unwrap();
        registry.register(Box::new(last_close.clone())).unwrap();
        Self {
            registry,
            candles_total,
            decisions_total,
            fills_total,
            breaker_trips_total,
            stream_lag_ms,
            last_close,
        }
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    /// Bridge engine events into the metric set; registered once at boot.
    pub fn spawn_collector(self, bus: &EventBus) -> tokio::task::JoinHandle<()> {
        let mut events = bus.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    Event::MarketUpdate { lag_ms, close, .. } => {
                        self.stream_lag_ms.set(lag_ms as f64);
                        self.last_close
                            .set(close.to_string().parse().unwrap_or_default());
                    }
                    Event::CandleClosed(_) => self.candles_total.inc(),
                    Event::DecisionRecorded(_) => self.decisions_total.inc(),
                    Event::FillRecorded(_) => self.fills_total.inc(),
                    Event::BreakerTripped { .. } => self.breaker_trips_total.inc(),
                    Event::IndicatorReady { .. } => {}
                }
            }
        })
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Render the current registry contents as a text-format scrape response.
fn render_metrics(registry: &Registry) -> Response<Body> {
    let encoder = TextEncoder::new();
    let mut scrape = Vec::new();
    match encoder.encode(&registry.gather(), &mut scrape) {
        Ok(()) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", encoder.format_type())
            .body(Body::from(scrape))
            .expect("static response parts are valid"),
        Err(err) => {
            warn!(error = %err, "metrics encoding failed");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("metrics encoding failed"))
                .expect("static response parts are valid")
        }
    }
}

/// Serve the registry over HTTP for Prometheus scrapes. Every request
/// path answers with the full scrape; there is nothing else to route.
pub fn spawn_metrics_server(registry: Registry, addr: SocketAddr) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let service = make_service_fn(move |_conn| {
            let registry = registry.clone();
            let handler = service_fn(move |_req: Request<Body>| {
                let response = render_metrics(&registry);
                async move { Ok::<_, Infallible>(response) }
            });
            async move { Ok::<_, Infallible>(handler) }
        });
        info!(%addr, "metrics endpoint listening");
        if let Err(err) = hyper::Server::bind(&addr).serve(service).await {
            warn!(error = %err, %addr, "metrics endpoint stopped serving");
        }
    })
}
