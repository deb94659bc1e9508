//! SQLite-backed history store. Queryable columns are split out; the full
//! record rides along as a JSON payload, and every record set commits in
//! one transaction.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use skiff_core::{Decision, EngineStatus, Fill, Order, PositionSnapshot, Trade};
use skiff_strategy::StrategyState;
use tracing::info;

use crate::{HistoryError, HistoryResult, HistoryStore, RecordSet};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS decisions (
    id TEXT PRIMARY KEY,
    ts TEXT NOT NULL,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    decision TEXT NOT NULL,
    confidence REAL NOT NULL,
    model_version INTEGER NOT NULL,
    payload TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_decisions_ts ON decisions (ts);
CREATE TABLE IF NOT EXISTS orders (
    id TEXT PRIMARY KEY,
    decision_id TEXT NOT NULL,
    idempotency_key TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    payload TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_orders_live_key
    ON orders (idempotency_key) WHERE status != 'SKIPPED';
CREATE TABLE IF NOT EXISTS fills (
    id TEXT PRIMARY KEY,
    order_id TEXT NOT NULL,
    ts TEXT NOT NULL,
    payload TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS trades (
    id TEXT PRIMARY KEY,
    ts TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    status TEXT NOT NULL,
    payload TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_trades_ts ON trades (ts);
CREATE TABLE IF NOT EXISTS snapshots (
    ts TEXT NOT NULL,
    symbol TEXT NOT NULL,
    payload TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS engine_state (
    id TEXT PRIMARY KEY CHECK (id = 'singleton'),
    kind TEXT NOT NULL DEFAULT '',
    payload TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS strategy_state (
    id TEXT PRIMARY KEY CHECK (id = 'singleton'),
    payload TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// SQLite implementation of [`HistoryStore`].
pub struct SqliteHistoryStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteHistoryStore {
    /// Open (or create) the database, applying WAL and the schema. An
    /// unreachable database is a startup-fatal condition for callers.
    pub fn open(path: impl AsRef<Path>) -> HistoryResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "opened sqlite history store");
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<T>(
        &self,
        operation: impl FnOnce(&mut Connection) -> Result<T, rusqlite::Error>,
    ) -> HistoryResult<T> {
        let mut conn = self.conn.lock().expect("connection poisoned");
        operation(&mut conn).map_err(HistoryError::from)
    }
}

fn insert_decision(conn: &Connection, decision: &Decision) -> Result<(), rusqlite::Error> {
    let payload = serde_json::to_string(decision).map_err(to_sql_err)?;
    let action = serde_json::to_string(&decision.action).map_err(to_sql_err)?;
    conn.execute(
        "INSERT INTO decisions (id, ts, symbol, timeframe, decision, confidence, model_version, payload)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            decision.id.to_string(),
            decision.timestamp.to_rfc3339(),
            decision.symbol,
            decision.timeframe.label(),
            action.trim_matches('"'),
            decision.confidence,
            decision.model_version as i64,
            payload
        ],
    )?;
    Ok(())
}

fn insert_order(conn: &Connection, order: &Order) -> Result<(), rusqlite::Error> {
    let payload = serde_json::to_string(order).map_err(to_sql_err)?;
    let status = serde_json::to_string(&order.status).map_err(to_sql_err)?;
    conn.execute(
        "INSERT INTO orders (id, decision_id, idempotency_key, status, created_at, payload)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            order.id.to_string(),
            order.decision_id.to_string(),
            order.idempotency_key,
            status.trim_matches('"'),
            order.created_at.to_rfc3339(),
            payload
        ],
    )?;
    Ok(())
}

fn insert_fill(conn: &Connection, fill: &Fill) -> Result<(), rusqlite::Error> {
    let payload = serde_json::to_string(fill).map_err(to_sql_err)?;
    conn.execute(
        "INSERT INTO fills (id, order_id, ts, payload) VALUES (?1, ?2, ?3, ?4)",
        params![
            fill.id.to_string(),
            fill.order_id.to_string(),
            fill.timestamp.to_rfc3339(),
            payload
        ],
    )?;
    Ok(())
}

fn insert_trade(conn: &Connection, trade: &Trade) -> Result<(), rusqlite::Error> {
    let payload = serde_json::to_string(trade).map_err(to_sql_err)?;
    let side = serde_json::to_string(&trade.side).map_err(to_sql_err)?;
    let status = if trade.pnl.is_some() { "CLOSED" } else { "OPEN" };
    conn.execute(
        "INSERT INTO trades (id, ts, symbol, side, status, payload)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            trade.id.to_string(),
            trade.timestamp.to_rfc3339(),
            trade.symbol,
            side.trim_matches('"'),
            status,
            payload
        ],
    )?;
    Ok(())
}

fn insert_snapshot(conn: &Connection, snapshot: &PositionSnapshot) -> Result<(), rusqlite::Error> {
    let payload = serde_json::to_string(snapshot).map_err(to_sql_err)?;
    conn.execute(
        "INSERT INTO snapshots (ts, symbol, payload) VALUES (?1, ?2, ?3)",
        params![
            snapshot.timestamp.to_rfc3339(),
            snapshot.symbol,
            payload
        ],
    )?;
    Ok(())
}

fn upsert_singleton(
    conn: &Connection,
    table: &str,
    payload: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        &format!(
            "INSERT INTO {table} (id, payload, updated_at) VALUES ('singleton', ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET payload = excluded.payload,
                                           updated_at = excluded.updated_at"
        ),
        params![payload, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn to_sql_err(err: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(err))
}

fn read_payloads<T: serde::de::DeserializeOwned>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<T>, rusqlite::Error> {
    let mut statement = conn.prepare(sql)?;
    let rows = statement.query_map(params, |row| row.get::<_, String>(0))?;
    let mut records = Vec::new();
    for payload in rows {
        let payload = payload?;
        records.push(serde_json::from_str(&payload).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })?);
    }
    Ok(records)
}

impl HistoryStore for SqliteHistoryStore {
    fn append_decision(&self, decision: &Decision) -> HistoryResult<()> {
        self.with_conn(|conn| insert_decision(conn, decision))
    }

    fn append_order(&self, order: &Order) -> HistoryResult<()> {
        self.with_conn(|conn| insert_order(conn, order))
    }

    fn append_fill(&self, fill: &Fill) -> HistoryResult<()> {
        self.with_conn(|conn| insert_fill(conn, fill))
    }

    fn append_trade(&self, trade: &Trade) -> HistoryResult<()> {
        self.with_conn(|conn| insert_trade(conn, trade))
    }

    fn append_snapshot(&self, snapshot: &PositionSnapshot) -> HistoryResult<()> {
        self.with_conn(|conn| insert_snapshot(conn, snapshot))
    }

    fn append_set(&self, set: &RecordSet) -> HistoryResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            if let Some(decision) = &set.decision {
                insert_decision(&tx, decision)?;
            }
            if let Some(order) = &set.order {
                insert_order(&tx, order)?;
            }
            if let Some(fill) = &set.fill {
                insert_fill(&tx, fill)?;
            }
            if let Some(trade) = &set.trade {
                insert_trade(&tx, trade)?;
            }
            if let Some(snapshot) = &set.snapshot {
                insert_snapshot(&tx, snapshot)?;
            }
            tx.commit()
        })
    }

    fn find_order_by_key(&self, key: &str) -> HistoryResult<Option<Order>> {
        self.with_conn(|conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload FROM orders
                     WHERE idempotency_key = ?1 AND status != 'SKIPPED'
                     LIMIT 1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            match payload {
                Some(payload) => serde_json::from_str(&payload)
                    .map(Some)
                    .map_err(|err| {
                        rusqlite::Error::FromSqlConversionFailure(
                            0,
                            rusqlite::types::Type::Text,
                            Box::new(err),
                        )
                    }),
                None => Ok(None),
            }
        })
    }

    fn recent_decisions(&self, limit: usize) -> HistoryResult<Vec<Decision>> {
        self.with_conn(|conn| {
            read_payloads(
                conn,
                "SELECT payload FROM decisions ORDER BY ts DESC LIMIT ?1",
                params![limit as i64],
            )
        })
    }

    fn recent_orders(&self, limit: usize) -> HistoryResult<Vec<Order>> {
        self.with_conn(|conn| {
            read_payloads(
                conn,
                "SELECT payload FROM orders ORDER BY created_at DESC LIMIT ?1",
                params![limit as i64],
            )
        })
    }

    fn recent_trades(&self, limit: usize) -> HistoryResult<Vec<Trade>> {
        self.with_conn(|conn| {
            read_payloads(
                conn,
                "SELECT payload FROM trades ORDER BY ts DESC LIMIT ?1",
                params![limit as i64],
            )
        })
    }

    fn trades_since(&self, since: DateTime<Utc>) -> HistoryResult<Vec<Trade>> {
        self.with_conn(|conn| {
            read_payloads(
                conn,
                "SELECT payload FROM trades WHERE ts >= ?1 ORDER BY ts ASC",
                params![since.to_rfc3339()],
            )
        })
    }

    fn load_strategy_state(&self) -> HistoryResult<Option<StrategyState>> {
        self.with_conn(|conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload FROM strategy_state WHERE id = 'singleton'",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            match payload {
                Some(payload) => serde_json::from_str(&payload).map(Some).map_err(|err| {
                    rusqlite::Error::FromSqlConversionFailure(
                        0,
                        rusqlite::types::Type::Text,
                        Box::new(err),
                    )
                }),
                None => Ok(None),
            }
        })
    }

    fn save_strategy_state(&self, state: &StrategyState) -> HistoryResult<()> {
        let payload = serde_json::to_string(state)?;
        self.with_conn(|conn| upsert_singleton(conn, "strategy_state", &payload))
    }

    fn load_engine_status(&self) -> HistoryResult<Option<EngineStatus>> {
        self.with_conn(|conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload FROM engine_state WHERE id = 'singleton'",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            match payload {
                Some(payload) => serde_json::from_str(&payload).map(Some).map_err(|err| {
                    rusqlite::Error::FromSqlConversionFailure(
                        0,
                        rusqlite::types::Type::Text,
                        Box::new(err),
                    )
                }),
                None => Ok(None),
            }
        })
    }

    fn save_engine_status(&self, status: &EngineStatus) -> HistoryResult<()> {
        let payload = serde_json::to_string(status)?;
        self.with_conn(|conn| upsert_singleton(conn, "engine_state", &payload))
    }

    fn close(&self) -> HistoryResult<()> {
        self.with_conn(|conn| conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);"))
    }
}

#[cfg(test)]
mod tests {
    use skiff_core::OrderStatus;
    use tempfile::TempDir;

    use super::*;
    use crate::fixtures;

    fn store() -> (TempDir, SqliteHistoryStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteHistoryStore::open(dir.path().join("history.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn record_sets_commit_atomically() {
        let (_dir, store) = store();
        let decision = fixtures::decision("BTC-USDC");
        let order = fixtures::order(decision.id, "set-key", OrderStatus::Filled);
        let fill = fixtures::fill(order.id);
        let set = RecordSet {
            decision: Some(decision.clone()),
            order: Some(order),
            fill: Some(fill),
            trade: None,
            snapshot: Some(fixtures::snapshot("BTC-USDC")),
        };
        store.append_set(&set).unwrap();
        assert_eq!(store.recent_decisions(10).unwrap().len(), 1);
        assert!(store.find_order_by_key("set-key").unwrap().is_some());
    }

    #[test]
    fn duplicate_live_keys_are_rejected_by_the_index() {
        let (_dir, store) = store();
        let decision = fixtures::decision("BTC-USDC");
        store
            .append_order(&fixtures::order(decision.id, "dup", OrderStatus::Accepted))
            .unwrap();
        let second = store.append_order(&fixtures::order(decision.id, "dup", OrderStatus::Filled));
        assert!(second.is_err());
        // Skipped records may share the key freely.
        store
            .append_order(&fixtures::order(decision.id, "dup", OrderStatus::Skipped))
            .unwrap();
    }

    #[test]
    fn strategy_state_upserts() {
        let (_dir, store) = store();
        let mut state = StrategyState::default();
        store.save_strategy_state(&state).unwrap();
        state.commit(
            skiff_strategy::StrategyParameters::default(),
            "second",
            Utc::now(),
        );
        store.save_strategy_state(&state).unwrap();
        let loaded = store.load_strategy_state().unwrap().unwrap();
        assert_eq!(loaded.version(), 2);
    }

    #[test]
    fn trades_since_uses_the_ts_column() {
        let (_dir, store) = store();
        let mut old = fixtures::trade("BTC-USDC", Some(4));
        old.timestamp = Utc::now() - chrono::Duration::days(3);
        store.append_trade(&old).unwrap();
        store
            .append_trade(&fixtures::trade("BTC-USDC", Some(7)))
            .unwrap();
        let recent = store
            .trades_since(Utc::now() - chrono::Duration::hours(24))
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(store.recent_trades(10).unwrap().len(), 2);
    }
}
