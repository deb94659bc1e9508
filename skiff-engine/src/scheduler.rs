//! Drives evaluations from candle closes and a fixed safety tick, and
//! starts refinement cycles on their 24-hour cadence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use skiff_core::Interval;
use skiff_strategy::Advisor;
use skiff_stream::MarketStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::Engine;

/// Cloneable shutdown handle observed by every scheduler task.
#[derive(Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Request shutdown; all `wait` calls resolve.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    #[must_use]
    pub fn triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Cadence settings for the scheduler loops.
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    /// Kline interval the stream subscribes to.
    pub stream_interval: Interval,
    /// Bars pulled during bootstrap.
    pub bootstrap_bars: usize,
    /// Safety tick guaranteeing a decision even on a stalled stream.
    pub tick_interval: Duration,
    /// How often the refinement cadence is checked.
    pub refinement_check_interval: Duration,
    /// Grace given to an in-flight refinement during shutdown.
    pub refinement_shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stream_interval: Interval::OneMinute,
            bootstrap_bars: 200,
            tick_interval: Duration::from_secs(60),
            refinement_check_interval: Duration::from_secs(60),
            refinement_shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Owns the engine and its feeds for the lifetime of the run.
pub struct Scheduler {
    engine: Arc<Engine>,
    stream: Arc<MarketStream>,
    advisor: Arc<dyn Advisor>,
    config: SchedulerConfig,
    shutdown: ShutdownSignal,
}

impl Scheduler {
    pub fn new(
        engine: Arc<Engine>,
        stream: Arc<MarketStream>,
        advisor: Arc<dyn Advisor>,
        config: SchedulerConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            engine,
            stream,
            advisor,
            config,
            shutdown,
        }
    }

    /// Run until the shutdown signal fires, then drain cleanly: streams
    /// first, then any in-flight refinement (bounded), then the journals.
    pub async fn run(self, symbols: Vec<String>) -> Result<()> {
        let mut actor_tasks = Vec::new();
        for symbol in &symbols {
            match self
                .stream
                .bootstrap(symbol, self.config.stream_interval, self.config.bootstrap_bars)
                .await
            {
                Ok(bars) => info!(symbol, bars, "bootstrap complete"),
                Err(err) => warn!(symbol, error = %err, "bootstrap failed; starting cold"),
            }
            let (candle_tx, candle_rx) = mpsc::channel(256);
            self.stream
                .subscribe(symbol, self.config.stream_interval, candle_tx)
                .with_context(|| format!("failed to subscribe {symbol}"))?;
            actor_tasks.push(self.spawn_symbol_actor(symbol.clone(), candle_rx));
        }

        let refinement_in_flight = Arc::new(AtomicBool::new(false));
        let refinement_handle: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::new(Mutex::new(None));
        let refinement_task = self.spawn_refinement_loop(
            refinement_in_flight.clone(),
            refinement_handle.clone(),
        );

        self.shutdown.wait().await;
        info!("shutdown requested; draining scheduler tasks");
        self.stream.shutdown();
        for task in actor_tasks {
            let _ = task.await;
        }
        refinement_task.abort();

        let pending = refinement_handle.lock().expect("handle poisoned").take();
        if let Some(handle) = pending {
            if tokio::time::timeout(self.config.refinement_shutdown_timeout, handle)
                .await
                .is_err()
            {
                warn!("in-flight refinement exceeded shutdown grace; abandoning");
            }
        }
        self.engine.shutdown().context("failed to persist engine state")?;
        Ok(())
    }

    /// One actor per symbol: serializes every mutation for that symbol
    /// across both the candle-close and timer triggers.
    fn spawn_symbol_actor(
        &self,
        symbol: String,
        mut candles: mpsc::Receiver<skiff_core::Candle>,
    ) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let stream = self.stream.clone();
        let shutdown = self.shutdown.clone();
        let tick_interval = self.config.tick_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(tick_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    candle = candles.recv() => {
                        let Some(candle) = candle else { break };
                        engine.set_stream_unstable(&symbol, stream.is_unstable(&symbol));
                        if let Err(err) = engine.on_candle(candle, Utc::now()) {
                            error!(symbol, error = %err, "candle evaluation failed");
                        }
                    }
                    _ = tick.tick() => {
                        engine.set_stream_unstable(&symbol, stream.is_unstable(&symbol));
                        if let Err(err) = engine.on_tick(&symbol, Utc::now()) {
                            error!(symbol, error = %err, "tick evaluation failed");
                        }
                    }
                }
            }
            info!(symbol, "symbol actor stopped");
        })
    }

    /// Checks every minute whether 24 h have passed since the last
    /// refinement; at most one cycle runs at a time.
    fn spawn_refinement_loop(
        &self,
        in_flight: Arc<AtomicBool>,
        handle_slot: Arc<Mutex<Option<JoinHandle<()>>>>,
    ) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let advisor = self.advisor.clone();
        let shutdown = self.shutdown.clone();
        let check_interval = self.config.refinement_check_interval;
        tokio::spawn(async move {
            let mut check = tokio::time::interval(check_interval);
            check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = check.tick() => {
                        let now = Utc::now();
                        if !engine.refinement_due(now)
                            || in_flight.swap(true, Ordering::SeqCst)
                        {
                            continue;
                        }
                        let engine = engine.clone();
                        let advisor = advisor.clone();
                        let in_flight = in_flight.clone();
                        let handle = tokio::spawn(async move {
                            match engine.refine(advisor.as_ref(), now).await {
                                Ok(outcome) => info!(?outcome, "refinement cycle finished"),
                                Err(err) => error!(error = %err, "refinement cycle failed"),
                            }
                            in_flight.store(false, Ordering::SeqCst);
                        });
                        *handle_slot.lock().expect("handle poisoned") = Some(handle);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_signal_wakes_waiters() {
        let signal = ShutdownSignal::new();
        assert!(!signal.triggered());
        let waiter = signal.clone();
        let task = tokio::spawn(async move {
            waiter.wait().await;
            true
        });
        signal.trigger();
        assert!(task.await.unwrap());
        assert!(signal.triggered());
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_triggered() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        signal.wait().await;
    }
}
