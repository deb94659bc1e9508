//! Small typed publish/subscribe channel shared by the runtime tasks.
//!
//! Listeners are registered at boot and receive every event published after
//! they subscribed; slow consumers drop the oldest events rather than block
//! the publisher.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::{Candle, Decision, Fill, Price, Symbol};

/// Events published by the engine and its feeds.
#[derive(Clone, Debug)]
pub enum Event {
    /// One closed bar was delivered for `symbol`; `lag_ms` is the distance
    /// between wall clock and the bar close.
    MarketUpdate {
        symbol: Symbol,
        lag_ms: i64,
        candle_close_ts: DateTime<Utc>,
        close: Price,
    },
    /// A validated closed bar entered the buffer.
    CandleClosed(Candle),
    /// All indicator windows for `symbol` are filled.
    IndicatorReady { symbol: Symbol },
    /// An evaluation recorded a decision.
    DecisionRecorded(Decision),
    /// An order was filled by the simulator.
    FillRecorded(Fill),
    /// The circuit breaker latched.
    BreakerTripped { reasons: Vec<String> },
}

/// Broadcast-backed event bus with bounded per-subscriber buffers.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus able to buffer `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Register a new listener.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event; a bus with no listeners silently drops it.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
