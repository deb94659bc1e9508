//! Strategy parameters, versioned strategy state and the refinement loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

mod metrics;
mod refine;
mod refiner;
mod walkforward;

pub use metrics::{ConditionBuckets, LossCluster, PerformanceMetrics};
pub use refine::{
    Advisor, CandidateParameters, HeuristicAdvisor, RefinementCycle, RefinementOutcome,
    RefinementReport,
};
pub use refiner::{
    decide, stability_audit, Assessment, DecisionContext, StabilityReport, MIN_DECISION_BARS,
};
pub use walkforward::{WalkForward, WalkForwardResult, WalkForwardWindow};

/// Result alias used within the strategy crate.
pub type StrategyResult<T> = Result<T, StrategyError>;

/// Failure variants surfaced by strategy components.
#[derive(Debug, Error)]
pub enum StrategyError {
    /// Raised when a parameter set cannot be used as provided.
    #[error("configuration is invalid: {0}")]
    InvalidConfig(String),
    /// Raised when the refiner lacks sufficient history to proceed.
    #[error("not enough historical data to compute indicators")]
    NotEnoughData,
    /// The external advisor could not produce a candidate.
    #[error("advisor unavailable: {0}")]
    AdvisorUnavailable(String),
    /// Used for all other errors that should bubble up to the caller.
    #[error("an internal strategy error occurred: {0}")]
    Internal(String),
}

/// Tunable strategy parameters. Immutable once committed to a version.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct StrategyParameters {
    pub min_score: f64,
    pub atr_multiplier: f64,
    pub stop_loss_atr: f64,
    pub take_profit_atr: f64,
    pub max_risk_per_trade_pct: f64,
    pub daily_max_loss_pct: f64,
    pub max_concurrent_trades: u32,
    pub kill_switch_losses: u32,
    pub min_atr_pct: f64,
    pub max_atr_pct: f64,
}

impl Default for StrategyParameters {
    fn default() -> Self {
        Self {
            min_score: 0.62,
            atr_multiplier: 1.2,
            stop_loss_atr: 1.6,
            take_profit_atr: 2.8,
            max_risk_per_trade_pct: 0.01,
            daily_max_loss_pct: 0.03,
            max_concurrent_trades: 3,
            kill_switch_losses: 4,
            min_atr_pct: 0.0015,
            max_atr_pct: 0.04,
        }
    }
}

impl StrategyParameters {
    /// Clamp every field into its sanctioned band. Committed parameter
    /// sets always pass through here first.
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        self.min_score = self.min_score.clamp(0.5, 0.95);
        self.atr_multiplier = self.atr_multiplier.clamp(0.6, 2.5);
        self.stop_loss_atr = self.stop_loss_atr.clamp(0.8, 3.5);
        self.take_profit_atr = self.take_profit_atr.clamp(1.2, 5.0);
        self.max_risk_per_trade_pct = self.max_risk_per_trade_pct.clamp(0.003, 0.03);
        self.daily_max_loss_pct = self.daily_max_loss_pct.clamp(0.01, 0.1);
        self.max_concurrent_trades = self.max_concurrent_trades.clamp(1, 5);
        self.kill_switch_losses = self.kill_switch_losses.clamp(2, 6);
        self.min_atr_pct = self.min_atr_pct.clamp(0.0008, 0.02);
        self.max_atr_pct = self.max_atr_pct.clamp(0.005, 0.08);
        self
    }
}

/// One committed parameter set with its bookkeeping.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StrategyRevision {
    pub version: u64,
    pub parameters: StrategyParameters,
    pub notes: String,
    pub committed_at: DateTime<Utc>,
}

const HISTORY_LIMIT: usize = 40;
const WARNING_LIMIT: usize = 20;

/// Durable, versioned strategy state. `version` is strictly monotonic;
/// history keeps the last 40 revisions and warnings the last 20 messages.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StrategyState {
    parameters: StrategyParameters,
    version: u64,
    last_refinement_at: Option<DateTime<Utc>>,
    history: VecDeque<StrategyRevision>,
    warnings: VecDeque<String>,
}

impl Default for StrategyState {
    fn default() -> Self {
        Self::new(StrategyParameters::default(), Utc::now())
    }
}

impl StrategyState {
    /// Start at version 1 with the provided (sanitized) parameters.
    #[must_use]
    pub fn new(parameters: StrategyParameters, now: DateTime<Utc>) -> Self {
        let parameters = parameters.sanitized();
        let mut history = VecDeque::new();
        history.push_back(StrategyRevision {
            version: 1,
            parameters,
            notes: "initial parameters".into(),
            committed_at: now,
        });
        Self {
            parameters,
            version: 1,
            last_refinement_at: None,
            history,
            warnings: VecDeque::new(),
        }
    }

    /// Immutable snapshot taken by evaluators at the start of a tick.
    #[must_use]
    pub fn parameters(&self) -> StrategyParameters {
        self.parameters
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn last_refinement_at(&self) -> Option<DateTime<Utc>> {
        self.last_refinement_at
    }

    #[must_use]
    pub fn history(&self) -> &VecDeque<StrategyRevision> {
        &self.history
    }

    #[must_use]
    pub fn warnings(&self) -> &VecDeque<String> {
        &self.warnings
    }

    /// Commit a candidate as the next version and append it to history.
    pub fn commit(
        &mut self,
        candidate: StrategyParameters,
        notes: impl Into<String>,
        now: DateTime<Utc>,
    ) -> u64 {
        self.parameters = candidate.sanitized();
        self.version += 1;
        self.last_refinement_at = Some(now);
        self.history.push_back(StrategyRevision {
            version: self.version,
            parameters: self.parameters,
            notes: notes.into(),
            committed_at: now,
        });
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.version
    }

    /// Record a refinement warning, keeping only the newest entries.
    pub fn push_warning(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        tracing::warn!(warning = %warning, "strategy warning recorded");
        self.warnings.push_back(warning);
        while self.warnings.len() > WARNING_LIMIT {
            self.warnings.pop_front();
        }
    }

    /// Mark a refinement attempt without committing a new version.
    pub fn touch_refinement(&mut self, now: DateTime<Utc>) {
        self.last_refinement_at = Some(now);
    }
}
