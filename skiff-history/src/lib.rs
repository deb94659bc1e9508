//! Durable, append-only journals for decisions, orders, fills, trades and
//! position snapshots, plus the idempotency index that makes order
//! submission at-most-once across restarts.
//!
//! Two backends implement the same [`HistoryStore`] contract: a JSONL
//! directory with line-buffered, fsync'd appends and a SQLite database
//! that wraps every record set in a transaction. The engine core depends
//! only on the trait.

use chrono::{DateTime, Utc};
use skiff_core::{Decision, EngineStatus, Fill, Order, PositionSnapshot, Trade};
use skiff_strategy::StrategyState;
use thiserror::Error;

mod jsonl;
mod sqlite;

pub use jsonl::JsonlHistoryStore;
pub use sqlite::SqliteHistoryStore;

/// Result alias for history operations.
pub type HistoryResult<T> = Result<T, HistoryError>;

/// History-specific error type.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// Disk-level failures on the JSONL backend.
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Database-level failures on the SQLite backend.
    #[error("journal database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Records that fail to (de)serialize.
    #[error("journal codec error: {0}")]
    Codec(#[from] serde_json::Error),
    /// Store opened against an unusable location.
    #[error("journal unavailable: {0}")]
    Unavailable(String),
}

/// A causally-related group of records written around one execution.
/// Backends persist the whole set atomically and in field order.
#[derive(Clone, Debug, Default)]
pub struct RecordSet {
    pub decision: Option<Decision>,
    pub order: Option<Order>,
    pub fill: Option<Fill>,
    pub trade: Option<Trade>,
    pub snapshot: Option<PositionSnapshot>,
}

/// Contract every history backend satisfies. Journals are append-only;
/// nothing here mutates an existing record.
pub trait HistoryStore: Send + Sync {
    fn append_decision(&self, decision: &Decision) -> HistoryResult<()>;
    fn append_order(&self, order: &Order) -> HistoryResult<()>;
    fn append_fill(&self, fill: &Fill) -> HistoryResult<()>;
    fn append_trade(&self, trade: &Trade) -> HistoryResult<()>;
    fn append_snapshot(&self, snapshot: &PositionSnapshot) -> HistoryResult<()>;

    /// Persist one causally-related record group. The default writes the
    /// members in order; backends with transactions override this.
    fn append_set(&self, set: &RecordSet) -> HistoryResult<()> {
        if let Some(decision) = &set.decision {
            self.append_decision(decision)?;
        }
        if let Some(order) = &set.order {
            self.append_order(order)?;
        }
        if let Some(fill) = &set.fill {
            self.append_fill(fill)?;
        }
        if let Some(trade) = &set.trade {
            self.append_trade(trade)?;
        }
        if let Some(snapshot) = &set.snapshot {
            self.append_snapshot(snapshot)?;
        }
        Ok(())
    }

    /// Look up a non-SKIPPED order carrying this idempotency key.
    fn find_order_by_key(&self, key: &str) -> HistoryResult<Option<Order>>;

    /// Newest-first reads used by the status surface and refinement loop.
    fn recent_decisions(&self, limit: usize) -> HistoryResult<Vec<Decision>>;
    fn recent_orders(&self, limit: usize) -> HistoryResult<Vec<Order>>;
    fn recent_trades(&self, limit: usize) -> HistoryResult<Vec<Trade>>;
    fn trades_since(&self, since: DateTime<Utc>) -> HistoryResult<Vec<Trade>>;

    /// Durable singletons owned by the engine.
    fn load_strategy_state(&self) -> HistoryResult<Option<StrategyState>>;
    fn save_strategy_state(&self, state: &StrategyState) -> HistoryResult<()>;
    fn load_engine_status(&self) -> HistoryResult<Option<EngineStatus>>;
    fn save_engine_status(&self, status: &EngineStatus) -> HistoryResult<()>;

    /// Flush buffered writes; called once during shutdown.
    fn close(&self) -> HistoryResult<()>;
}
