//! File-backed history store: one JSONL journal per record kind with
//! line-buffered appends and a durable flush after every write.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use skiff_core::{Decision, EngineStatus, Fill, Order, OrderStatus, PositionSnapshot, Trade};
use skiff_strategy::StrategyState;
use std::collections::HashMap;
use tracing::info;

use crate::{HistoryResult, HistoryStore};

const DECISIONS_FILE: &str = "decisions.jsonl";
const ORDERS_FILE: &str = "orders.jsonl";
const FILLS_FILE: &str = "fills.jsonl";
const TRADES_FILE: &str = "trades.jsonl";
const SNAPSHOTS_FILE: &str = "snapshots.jsonl";
const STRATEGY_FILE: &str = "strategy_state.json";
const STATUS_FILE: &str = "engine_status.json";

struct Journal {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl Journal {
    fn open(path: PathBuf) -> HistoryResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Append one record as a single line, flushing through to disk so a
    /// crash never leaves a torn journal tail visible to readers.
    fn append<T: Serialize>(&self, record: &T) -> HistoryResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut writer = self.writer.lock().expect("journal writer poisoned");
        writer.write_all(line.as_bytes())?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    fn read_all<T: DeserializeOwned>(&self) -> HistoryResult<Vec<T>> {
        // Hold the writer lock so reads never observe a partial line.
        let writer = self.writer.lock().expect("journal writer poisoned");
        let file = File::open(&self.path)?;
        drop(writer);
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    fn flush(&self) -> HistoryResult<()> {
        let mut writer = self.writer.lock().expect("journal writer poisoned");
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }
}

/// JSONL-directory implementation of [`HistoryStore`].
pub struct JsonlHistoryStore {
    root: PathBuf,
    decisions: Journal,
    orders: Journal,
    fills: Journal,
    trades: Journal,
    snapshots: Journal,
    idempotency: Mutex<HashMap<String, Order>>,
}

impl JsonlHistoryStore {
    /// Open (or create) a journal directory and rebuild the idempotency
    /// index from the orders journal.
    pub fn open(root: impl AsRef<Path>) -> HistoryResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let store = Self {
            decisions: Journal::open(root.join(DECISIONS_FILE))?,
            orders: Journal::open(root.join(ORDERS_FILE))?,
            fills: Journal::open(root.join(FILLS_FILE))?,
            trades: Journal::open(root.join(TRADES_FILE))?,
            snapshots: Journal::open(root.join(SNAPSHOTS_FILE))?,
            idempotency: Mutex::new(HashMap::new()),
            root,
        };
        let orders: Vec<Order> = store.orders.read_all()?;
        let mut index = store.idempotency.lock().expect("index poisoned");
        for order in orders {
            if order.status != OrderStatus::Skipped {
                index.insert(order.idempotency_key.clone(), order);
            }
        }
        let known = index.len();
        drop(index);
        info!(
            path = %store.root.display(),
            orders = known,
            "opened jsonl history store"
        );
        Ok(store)
    }

    fn write_singleton<T: Serialize>(&self, name: &str, value: &T) -> HistoryResult<()> {
        // Write-then-rename keeps the singleton readable at all times.
        let tmp = self.root.join(format!("{name}.tmp"));
        let target = self.root.join(name);
        let payload = serde_json::to_vec_pretty(value)?;
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn read_singleton<T: DeserializeOwned>(&self, name: &str) -> HistoryResult<Option<T>> {
        let path = self.root.join(name);
        if !path.exists() {
            return Ok(None);
        }
        let payload = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&payload)?))
    }
}

fn newest_first<T>(mut records: Vec<T>, limit: usize) -> Vec<T> {
    records.reverse();
    records.truncate(limit);
    records
}

impl HistoryStore for JsonlHistoryStore {
    fn append_decision(&self, decision: &Decision) -> HistoryResult<()> {
        self.decisions.append(decision)
    }

    fn append_order(&self, order: &Order) -> HistoryResult<()> {
        self.orders.append(order)?;
        if order.status != OrderStatus::Skipped {
            self.idempotency
                .lock()
                .expect("index poisoned")
                .insert(order.idempotency_key.clone(), order.clone());
        }
        Ok(())
    }

    fn append_fill(&self, fill: &Fill) -> HistoryResult<()> {
        self.fills.append(fill)
    }

    fn append_trade(&self, trade: &Trade) -> HistoryResult<()> {
        self.trades.append(trade)
    }

    fn append_snapshot(&self, snapshot: &PositionSnapshot) -> HistoryResult<()> {
        self.snapshots.append(snapshot)
    }

    fn find_order_by_key(&self, key: &str) -> HistoryResult<Option<Order>> {
        Ok(self
            .idempotency
            .lock()
            .expect("index poisoned")
            .get(key)
            .cloned())
    }

    fn recent_decisions(&self, limit: usize) -> HistoryResult<Vec<Decision>> {
        Ok(newest_first(self.decisions.read_all()?, limit))
    }

    fn recent_orders(&self, limit: usize) -> HistoryResult<Vec<Order>> {
        Ok(newest_first(self.orders.read_all()?, limit))
    }

    fn recent_trades(&self, limit: usize) -> HistoryResult<Vec<Trade>> {
        Ok(newest_first(self.trades.read_all()?, limit))
    }

    fn trades_since(&self, since: DateTime<Utc>) -> HistoryResult<Vec<Trade>> {
        let mut trades: Vec<Trade> = self.trades.read_all()?;
        trades.retain(|trade| trade.timestamp >= since);
        Ok(trades)
    }

    fn load_strategy_state(&self) -> HistoryResult<Option<StrategyState>> {
        self.read_singleton(STRATEGY_FILE)
    }

    fn save_strategy_state(&self, state: &StrategyState) -> HistoryResult<()> {
        self.write_singleton(STRATEGY_FILE, state)
    }

    fn load_engine_status(&self) -> HistoryResult<Option<EngineStatus>> {
        self.read_singleton(STATUS_FILE)
    }

    fn save_engine_status(&self, status: &EngineStatus) -> HistoryResult<()> {
        self.write_singleton(STATUS_FILE, status)
    }

    fn close(&self) -> HistoryResult<()> {
        self.decisions.flush()?;
        self.orders.flush()?;
        self.fills.flush()?;
        self.trades.flush()?;
        self.snapshots.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use skiff_core::OrderStatus;
    use tempfile::TempDir;

    use super::*;
    use crate::fixtures;

    #[test]
    fn journals_round_trip_newest_first() {
        let dir = TempDir::new().unwrap();
        let store = JsonlHistoryStore::open(dir.path()).unwrap();
        for _ in 0..3 {
            store.append_decision(&fixtures::decision("BTC-USDC")).unwrap();
        }
        let last = fixtures::decision("ETH-USDC");
        store.append_decision(&last).unwrap();
        let decisions = store.recent_decisions(2).unwrap();
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].id, last.id);
    }

    #[test]
    fn idempotency_index_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let decision = fixtures::decision("BTC-USDC");
        {
            let store = JsonlHistoryStore::open(dir.path()).unwrap();
            store.append_decision(&decision).unwrap();
            store
                .append_order(&fixtures::order(
                    decision.id,
                    "BTC-USDC|1h|1|BUY",
                    OrderStatus::Filled,
                ))
                .unwrap();
            store.close().unwrap();
        }
        let reopened = JsonlHistoryStore::open(dir.path()).unwrap();
        let found = reopened.find_order_by_key("BTC-USDC|1h|1|BUY").unwrap();
        assert!(found.is_some());
        assert!(reopened.find_order_by_key("missing").unwrap().is_none());
    }

    #[test]
    fn skipped_orders_do_not_claim_the_key() {
        let dir = TempDir::new().unwrap();
        let store = JsonlHistoryStore::open(dir.path()).unwrap();
        let decision = fixtures::decision("BTC-USDC");
        store
            .append_order(&fixtures::order(decision.id, "key", OrderStatus::Skipped))
            .unwrap();
        assert!(store.find_order_by_key("key").unwrap().is_none());
    }

    #[test]
    fn strategy_state_singleton_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = JsonlHistoryStore::open(dir.path()).unwrap();
        assert!(store.load_strategy_state().unwrap().is_none());
        let mut state = StrategyState::default();
        state.push_warning("persisted warning");
        store.save_strategy_state(&state).unwrap();
        let loaded = store.load_strategy_state().unwrap().unwrap();
        assert_eq!(loaded.version(), state.version());
        assert_eq!(loaded.warnings().len(), 1);
    }

    #[test]
    fn trades_since_filters_by_timestamp() {
        let dir = TempDir::new().unwrap();
        let store = JsonlHistoryStore::open(dir.path()).unwrap();
        let mut old = fixtures::trade("BTC-USDC", Some(5));
        old.timestamp = Utc::now() - chrono::Duration::hours(48);
        store.append_trade(&old).unwrap();
        store.append_trade(&fixtures::trade("BTC-USDC", Some(3))).unwrap();
        let recent = store
            .trades_since(Utc::now() - chrono::Duration::hours(24))
            .unwrap();
        assert_eq!(recent.len(), 1);
    }
}
