//! Latching circuit breaker. Once tripped it blocks order placement until
//! an operator explicitly resets it; the reasons ride along on every
//! decision recorded while latched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Trip thresholds. Defaults: 5% daily drawdown, 3 consecutive large
/// losses, 6% volatility, and any stream instability.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct BreakerThresholds {
    pub max_daily_drawdown_pct: f64,
    pub max_consecutive_large_losses: u32,
    pub max_volatility_pct: f64,
    pub trip_on_stream_unstable: bool,
}

impl Default for BreakerThresholds {
    fn default() -> Self {
        Self {
            max_daily_drawdown_pct: 0.05,
            max_consecutive_large_losses: 3,
            max_volatility_pct: 0.06,
            trip_on_stream_unstable: true,
        }
    }
}

/// Observations fed to the breaker on every tick.
#[derive(Clone, Copy, Debug)]
pub struct BreakerInputs {
    pub daily_drawdown_pct: f64,
    pub consecutive_large_losses: u32,
    pub volatility_pct: f64,
    pub stream_unstable: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct Latch {
    reasons: Vec<String>,
    tripped_at: DateTime<Utc>,
}

/// The breaker itself.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CircuitBreaker {
    #[serde(default)]
    thresholds: BreakerThresholds,
    latch: Option<Latch>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(thresholds: BreakerThresholds) -> Self {
        Self {
            thresholds,
            latch: None,
        }
    }

    /// Evaluate the inputs; returns whether the breaker is latched after
    /// this tick. A latched breaker stays latched regardless of inputs.
    pub fn evaluate(&mut self, inputs: &BreakerInputs, now: DateTime<Utc>) -> bool {
        if self.latch.is_some() {
            return true;
        }
        let mut reasons = Vec::new();
        if inputs.daily_drawdown_pct >= self.thresholds.max_daily_drawdown_pct {
            reasons.push(format!(
                "daily drawdown {:.2}% >= {:.2}%",
                inputs.daily_drawdown_pct * 100.0,
                self.thresholds.max_daily_drawdown_pct * 100.0
            ));
        }
        if inputs.consecutive_large_losses >= self.thresholds.max_consecutive_large_losses {
            reasons.push(format!(
                "{} consecutive large losses",
                inputs.consecutive_large_losses
            ));
        }
        if inputs.volatility_pct >= self.thresholds.max_volatility_pct {
            reasons.push(format!(
                "volatility {:.2}% >= {:.2}%",
                inputs.volatility_pct * 100.0,
                self.thresholds.max_volatility_pct * 100.0
            ));
        }
        if self.thresholds.trip_on_stream_unstable && inputs.stream_unstable {
            reasons.push("market stream unstable".into());
        }
        if reasons.is_empty() {
            return false;
        }
        warn!(reasons = ?reasons, "circuit breaker latched");
        self.latch = Some(Latch {
            reasons,
            tripped_at: now,
        });
        true
    }

    #[must_use]
    pub fn is_latched(&self) -> bool {
        self.latch.is_some()
    }

    /// Reasons recorded at trip time; empty when not latched.
    #[must_use]
    pub fn reasons(&self) -> &[String] {
        self.latch
            .as_ref()
            .map(|latch| latch.reasons.as_slice())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn tripped_at(&self) -> Option<DateTime<Utc>> {
        self.latch.as_ref().map(|latch| latch.tripped_at)
    }

    /// Explicit operator reset; the only way to resume trading.
    pub fn reset(&mut self) {
        if self.latch.take().is_some() {
            info!("circuit breaker reset");
        }
    }
}
