//! Per-symbol kline WebSocket task: message pump, heartbeat, reconnect
//! backoff and post-reconnect backfill.

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use skiff_core::{Candle, Event, EventBus, Interval, Symbol};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};

use crate::buffer::SymbolBuffer;
use crate::rest::{decimal_field, fetch_klines, timestamp_from_ms};
use crate::{FeedHealth, StreamConfig, StreamError};

#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "k")]
    kline: KlinePayload,
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o")]
    open: serde_json::Value,
    #[serde(rename = "h")]
    high: serde_json::Value,
    #[serde(rename = "l")]
    low: serde_json::Value,
    #[serde(rename = "c")]
    close: serde_json::Value,
    #[serde(rename = "v")]
    volume: serde_json::Value,
    #[serde(rename = "x")]
    is_closed: bool,
}

pub(crate) struct FeedTask {
    pub symbol: Symbol,
    pub symbol_code: String,
    pub interval: Interval,
    pub config: Arc<StreamConfig>,
    pub http: Client,
    pub buffer: Arc<Mutex<SymbolBuffer>>,
    pub health: Arc<FeedHealth>,
    pub handler: mpsc::Sender<Candle>,
    pub bus: EventBus,
    pub shutdown: watch::Receiver<bool>,
}

impl FeedTask {
    /// Outer reconnect loop. Backoff doubles from the configured base up
    /// to the cap and resets after a healthy connection.
    pub async fn run(mut self) {
        let mut backoff = self.config.backoff_base;
        let mut first_connection = true;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            if !first_connection {
                self.backfill().await;
            }
            match self.run_socket().await {
                Ok(()) => break,
                Err(err) => {
                    warn!(
                        symbol = %self.symbol,
                        error = %err,
                        backoff_ms = backoff.as_millis() as u64,
                        "kline stream interrupted; reconnecting"
                    );
                    self.health.mark_reconnecting();
                    first_connection = false;
                    tokio::select! {
                        _ = sleep(backoff) => {}
                        _ = self.shutdown.changed() => break,
                    }
                    backoff = (backoff * 2).min(self.config.backoff_max);
                }
            }
        }
        debug!(symbol = %self.symbol, "kline feed task stopped");
    }

    /// One connection lifetime. Returns `Ok(())` only on shutdown.
    async fn run_socket(&mut self) -> Result<(), StreamError> {
        let url = format!(
            "{}/ws/{}@kline_{}",
            self.config.ws_url.trim_end_matches('/'),
            self.symbol_code.to_lowercase(),
            self.interval.label()
        );
        let (mut ws, _) = connect_async(&url)
            .await
            .map_err(|err| StreamError::Transport(err.to_string()))?;
        info!(symbol = %self.symbol, %url, "kline stream connected");
        self.health.touch(Utc::now());
        self.health.clear_reconnecting();

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    let _ = ws.close(None).await;
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    if self.health.silent_for(Utc::now()) > self.config.stale_after {
                        let _ = ws.close(None).await;
                        return Err(StreamError::Stale);
                    }
                }
                msg = ws.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        self.health.touch(Utc::now());
                        if let Err(err) = self.handle_text(&text).await {
                            warn!(symbol = %self.symbol, error = %err, "ignoring bad kline payload");
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        self.health.touch(Utc::now());
                        if let Ok(text) = String::from_utf8(bytes.into()) {
                            if let Err(err) = self.handle_text(&text).await {
                                warn!(symbol = %self.symbol, error = %err, "ignoring bad kline payload");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        self.health.touch(Utc::now());
                        ws.send(Message::Pong(payload))
                            .await
                            .map_err(|err| StreamError::Transport(err.to_string()))?;
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        return Err(StreamError::Closed);
                    }
                    Some(Err(err)) => return Err(StreamError::Transport(err.to_string())),
                    None => return Err(StreamError::Closed),
                }
            }
        }
    }

    async fn handle_text(&mut self, text: &str) -> Result<(), StreamError> {
        let event: KlineEvent =
            serde_json::from_str(text).map_err(|err| StreamError::Parse(err.to_string()))?;
        let payload = event.kline;
        let interval = Interval::from_str(&payload.interval).map_err(StreamError::Parse)?;
        let candle = Candle {
            symbol: self.symbol.clone(),
            interval,
            open: decimal_field(&payload.open, "open")?,
            high: decimal_field(&payload.high, "high")?,
            low: decimal_field(&payload.low, "low")?,
            close: decimal_field(&payload.close, "close")?,
            volume: decimal_field(&payload.volume, "volume")?,
            timestamp: timestamp_from_ms(payload.open_time)?,
        };
        if !payload.is_closed {
            let mut buffer = self.buffer.lock().expect("buffer poisoned");
            buffer.update_trailing(candle);
            return Ok(());
        }

        let close_ts = timestamp_from_ms(payload.close_time)?;
        let advanced = {
            let mut buffer = self.buffer.lock().expect("buffer poisoned");
            buffer.ingest(candle.clone()).advanced()
        };
        if !advanced {
            return Ok(());
        }
        let lag_ms = (Utc::now() - close_ts).num_milliseconds();
        self.bus.publish(Event::MarketUpdate {
            symbol: self.symbol.clone(),
            lag_ms,
            candle_close_ts: close_ts,
            close: candle.close,
        });
        self.bus.publish(Event::CandleClosed(candle.clone()));
        // Back-pressure on the handler bounds memory when evaluation lags.
        if self.handler.send(candle).await.is_err() {
            return Err(StreamError::Closed);
        }
        Ok(())
    }

    /// Reconcile bars missed while disconnected. Failures log and leave
    /// the in-memory buffer as-is.
    async fn backfill(&mut self) {
        match fetch_klines(
            &self.http,
            &self.config.rest_url,
            &self.symbol_code,
            self.interval,
            self.config.backfill_bars,
        )
        .await
        {
            Ok(bars) => {
                let appended = {
                    let mut buffer = self.buffer.lock().expect("buffer poisoned");
                    buffer.reconcile(bars)
                };
                if appended > 0 {
                    info!(symbol = %self.symbol, appended, "backfill reconciled missed bars");
                }
            }
            Err(err) => {
                warn!(symbol = %self.symbol, error = %err, "backfill failed; continuing with buffer");
            }
        }
    }
}
