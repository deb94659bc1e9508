//! Live kline streaming.
//!
//! Each subscribed symbol gets its own feed task that bootstraps history
//! over REST, pumps closed bars from the WebSocket into a bounded ring
//! buffer, watches its own heartbeat, reconnects with exponential backoff
//! and reconciles missed closes by backfilling on reconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use skiff_core::{normalize_symbol, Candle, EventBus, Interval, Symbol};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::warn;

pub mod buffer;
mod rest;
mod ws;

pub use buffer::{IngestOutcome, SymbolBuffer};
pub use rest::{fetch_klines, MAX_BOOTSTRAP_BARS};

/// Result alias for stream operations.
pub type StreamResult<T> = Result<T, StreamError>;

/// Failure variants surfaced by the market stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Transport-level failures (socket, TLS, HTTP).
    #[error("transport error: {0}")]
    Transport(String),
    /// An HTTP request exceeded its deadline.
    #[error("request timed out")]
    Timeout,
    /// Payloads that could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),
    /// The heartbeat found the socket silent past the stale threshold.
    #[error("stream silent past stale threshold")]
    Stale,
    /// The peer closed the connection.
    #[error("stream closed by peer")]
    Closed,
    /// The caller referenced a symbol that was never subscribed.
    #[error("unknown symbol: {0}")]
    UnknownSymbol(Symbol),
}

/// Tunables for the stream layer. Defaults follow the engine contract:
/// 5 s heartbeat, 20 s staleness, 500 ms -> 30 s backoff, 20-bar backfill.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    pub ws_url: String,
    pub rest_url: String,
    pub max_buffer: usize,
    pub heartbeat_interval: Duration,
    pub stale_after: chrono::Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backfill_bars: usize,
    pub request_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://stream.binance.com:9443".into(),
            rest_url: "https://api.binance.com".into(),
            max_buffer: MAX_BOOTSTRAP_BARS,
            heartbeat_interval: Duration::from_secs(5),
            stale_after: chrono::Duration::seconds(20),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            backfill_bars: 20,
            request_timeout: Duration::from_secs(12),
        }
    }
}

/// Shared liveness state for one symbol feed.
#[derive(Debug)]
pub struct FeedHealth {
    last_message_ms: AtomicI64,
    reconnecting: AtomicBool,
}

impl FeedHealth {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            last_message_ms: AtomicI64::new(now.timestamp_millis()),
            reconnecting: AtomicBool::new(false),
        }
    }

    pub(crate) fn touch(&self, now: DateTime<Utc>) {
        self.last_message_ms
            .store(now.timestamp_millis(), Ordering::SeqCst);
    }

    pub(crate) fn mark_reconnecting(&self) {
        self.reconnecting.store(true, Ordering::SeqCst);
    }

    pub(crate) fn clear_reconnecting(&self) {
        self.reconnecting.store(false, Ordering::SeqCst);
    }

    /// Time since the last message was observed.
    pub fn silent_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        let last = self.last_message_ms.load(Ordering::SeqCst);
        chrono::Duration::milliseconds(now.timestamp_millis() - last)
    }

    /// Unstable when silent past the threshold or mid-reconnect.
    pub fn is_unstable(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        self.reconnecting.load(Ordering::SeqCst) || self.silent_for(now) > stale_after
    }
}

struct SymbolFeed {
    buffer: Arc<Mutex<SymbolBuffer>>,
    health: Arc<FeedHealth>,
    task: Option<JoinHandle<()>>,
}

/// Stream front-end owning one feed per subscribed symbol.
pub struct MarketStream {
    config: Arc<StreamConfig>,
    http: Client,
    bus: EventBus,
    feeds: Mutex<HashMap<Symbol, SymbolFeed>>,
    shutdown_tx: watch::Sender<bool>,
}

impl MarketStream {
    pub fn new(config: StreamConfig, bus: EventBus) -> StreamResult<Self> {
        let http = rest::build_client(config.request_timeout)?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config: Arc::new(config),
            http,
            bus,
            feeds: Mutex::new(HashMap::new()),
            shutdown_tx,
        })
    }

    /// Seed the ring buffer with the last `n` closed bars over REST.
    ///
    /// A timeout here leaves the symbol marked unstable so evaluations
    /// stay gated until live data arrives.
    pub async fn bootstrap(
        &self,
        symbol_code: &str,
        interval: Interval,
        n: usize,
    ) -> StreamResult<usize> {
        let symbol = normalize_symbol(symbol_code);
        let feed_buffer = self.ensure_feed(&symbol, interval);
        match rest::fetch_klines(&self.http, &self.config.rest_url, symbol_code, interval, n).await
        {
            Ok(bars) => {
                let mut buffer = feed_buffer.buffer.lock().expect("buffer poisoned");
                let appended = buffer.reconcile(bars);
                feed_buffer.health.touch(Utc::now());
                Ok(appended)
            }
            Err(err) => {
                warn!(symbol = %symbol, error = %err, "bootstrap failed; symbol marked unstable");
                feed_buffer.health.mark_reconnecting();
                Err(err)
            }
        }
    }

    /// Open the kline socket for a symbol. Closed bars are delivered to
    /// `handler` exactly once each, in order.
    pub fn subscribe(
        &self,
        symbol_code: &str,
        interval: Interval,
        handler: mpsc::Sender<Candle>,
    ) -> StreamResult<()> {
        let symbol = normalize_symbol(symbol_code);
        let feed_parts = self.ensure_feed(&symbol, interval);
        let task = ws::FeedTask {
            symbol: symbol.clone(),
            symbol_code: symbol_code.replace('-', "").to_uppercase(),
            interval,
            config: self.config.clone(),
            http: self.http.clone(),
            buffer: feed_parts.buffer.clone(),
            health: feed_parts.health.clone(),
            handler,
            bus: self.bus.clone(),
            shutdown: self.shutdown_tx.subscribe(),
        };
        let handle = tokio::spawn(task.run());
        let mut feeds = self.feeds.lock().expect("feed map poisoned");
        if let Some(feed) = feeds.get_mut(&symbol) {
            if let Some(previous) = feed.task.replace(handle) {
                previous.abort();
            }
        }
        Ok(())
    }

    /// Restartable view of the last buffered closed bars, oldest first.
    pub fn buffer(&self, symbol: &str) -> StreamResult<Vec<Candle>> {
        let symbol = normalize_symbol(symbol);
        let feeds = self.feeds.lock().expect("feed map poisoned");
        feeds
            .get(&symbol)
            .map(|feed| feed.buffer.lock().expect("buffer poisoned").snapshot())
            .ok_or(StreamError::UnknownSymbol(symbol))
    }

    /// True while the feed is silent past the stale threshold or
    /// reconnecting.
    pub fn is_unstable(&self, symbol: &str) -> bool {
        let symbol = normalize_symbol(symbol);
        let feeds = self.feeds.lock().expect("feed map poisoned");
        feeds
            .get(&symbol)
            .map(|feed| {
                feed.health
                    .is_unstable(Utc::now(), self.config.stale_after)
            })
            .unwrap_or(true)
    }

    /// Shared health handle for a subscribed symbol.
    pub fn health(&self, symbol: &str) -> Option<Arc<FeedHealth>> {
        let symbol = normalize_symbol(symbol);
        let feeds = self.feeds.lock().expect("feed map poisoned");
        feeds.get(&symbol).map(|feed| feed.health.clone())
    }

    /// Signal every feed task to stop and detach their handles.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut feeds = self.feeds.lock().expect("feed map poisoned");
        for feed in feeds.values_mut() {
            feed.task.take();
        }
    }

    fn ensure_feed(&self, symbol: &Symbol, interval: Interval) -> FeedParts {
        let mut feeds = self.feeds.lock().expect("feed map poisoned");
        let feed = feeds.entry(symbol.clone()).or_insert_with(|| SymbolFeed {
            buffer: Arc::new(Mutex::new(SymbolBuffer::new(
                symbol.clone(),
                interval,
                self.config.max_buffer,
            ))),
            health: Arc::new(FeedHealth::new(Utc::now())),
            task: None,
        });
        FeedParts {
            buffer: feed.buffer.clone(),
            health: feed.health.clone(),
        }
    }
}

struct FeedParts {
    buffer: Arc<Mutex<SymbolBuffer>>,
    health: Arc<FeedHealth>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_goes_unstable_after_silence() {
        let start = Utc::now();
        let health = FeedHealth::new(start);
        let stale_after = chrono::Duration::seconds(20);
        assert!(!health.is_unstable(start + chrono::Duration::seconds(5), stale_after));
        assert!(health.is_unstable(start + chrono::Duration::seconds(25), stale_after));
        health.touch(start + chrono::Duration::seconds(25));
        assert!(!health.is_unstable(start + chrono::Duration::seconds(26), stale_after));
    }

    #[test]
    fn reconnecting_flag_forces_unstable() {
        let now = Utc::now();
        let health = FeedHealth::new(now);
        health.mark_reconnecting();
        assert!(health.is_unstable(now, chrono::Duration::seconds(20)));
        health.clear_reconnecting();
        assert!(!health.is_unstable(now, chrono::Duration::seconds(20)));
    }

    #[tokio::test]
    async fn unknown_symbols_are_reported() {
        let stream = MarketStream::new(StreamConfig::default(), EventBus::default()).unwrap();
        assert!(matches!(
            stream.buffer("BTC-USDC"),
            Err(StreamError::UnknownSymbol(_))
        ));
        assert!(stream.is_unstable("BTC-USDC"));
    }
}
