//! End-to-end engine cycles against a real JSONL history store.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use skiff_core::{
    Candle, EventBus, ExitReason, Interval, MarketStatus, OrderStatus, Side, SignalAction,
};
use skiff_engine::{Engine, EngineConfig, ForceTradeRequest};
use skiff_history::{HistoryStore, JsonlHistoryStore};
use tempfile::TempDir;
use uuid::Uuid;

fn start_ts() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap()
}

fn candle(i: usize, close: f64) -> Candle {
    Candle {
        symbol: "BTC-USDC".into(),
        interval: Interval::OneHour,
        open: Decimal::from_f64(close - 5.0).unwrap(),
        high: Decimal::from_f64(close + 150.0).unwrap(),
        low: Decimal::from_f64(close - 150.0).unwrap(),
        close: Decimal::from_f64(close).unwrap(),
        volume: Decimal::from(120),
        timestamp: start_ts() + Duration::hours(i as i64),
    }
}

fn engine(dir: &TempDir) -> (Arc<JsonlHistoryStore>, Engine) {
    let history = Arc::new(JsonlHistoryStore::open(dir.path()).unwrap());
    let engine = Engine::new(
        EngineConfig::default(),
        history.clone(),
        EventBus::default(),
    )
    .unwrap();
    (history, engine)
}

/// Feed `n` steadily rising bars through the engine, one evaluation each.
fn run_cycles(engine: &Engine, n: usize) {
    for i in 0..n {
        let bar = candle(i, 60_000.0 + 10.0 * i as f64);
        let now = bar.timestamp + Duration::seconds(2);
        engine.on_candle(bar, now).unwrap();
    }
}

#[test]
fn training_log_reports_action_and_market_status() {
    // S1: sixty synthetic bars with close = 60000 + 10i.
    let dir = TempDir::new().unwrap();
    let (_history, engine) = engine(&dir);
    run_cycles(&engine, 60);

    let log = engine.training_log();
    let newest = log.last().expect("training log populated");
    assert!(matches!(
        newest.action,
        SignalAction::Buy | SignalAction::Sell | SignalAction::Hold
    ));
    assert!(matches!(
        newest.market_status,
        MarketStatus::Active | MarketStatus::LowVolatility
    ));
    let status = engine.status();
    assert_eq!(status.evaluations, 60);
    assert!(status.counters_consistent());
}

#[test]
fn decisions_journal_records_symbol_and_timeframe() {
    // S2: the decisions journal holds the evaluated symbol under the
    // canonical USDC convention with the engine timeframe.
    let dir = TempDir::new().unwrap();
    let (history, engine) = engine(&dir);
    run_cycles(&engine, 60);

    let decisions = history.recent_decisions(100).unwrap();
    assert!(!decisions.is_empty());
    assert!(decisions
        .iter()
        .all(|decision| decision.symbol == "BTC-USDC"));
    assert!(decisions
        .iter()
        .all(|decision| decision.timeframe == Interval::OneHour));
}

#[test]
fn force_trade_is_idempotent_per_decision() {
    // S5: two submissions sharing a decision id produce one open trade
    // and one skipped order.
    let dir = TempDir::new().unwrap();
    let (history, engine) = engine(&dir);
    run_cycles(&engine, 5);

    let decision_id = Uuid::new_v4();
    let decision_ts = start_ts() + Duration::hours(10);
    let request = ForceTradeRequest {
        symbol: "ETHUSDC".into(),
        side: Side::Buy,
        quantity: None,
        notional_usd: Some(Decimal::from(100)),
        tp_pct: Some(1.5),
        sl_pct: Some(1.0),
        tp_price: None,
        sl_price: None,
        decision_id: Some(decision_id),
        decision_ts: Some(decision_ts),
    };

    // Force-trades only need a mark; seed one bar for the symbol.
    let mut seed = candle(0, 3_000.0);
    seed.symbol = "ETH-USDC".into();
    engine.on_candle(seed, start_ts() + Duration::seconds(2)).unwrap();

    let first = engine.force_trade(request.clone(), decision_ts).unwrap();
    assert_eq!(first.order_status, OrderStatus::Filled);
    assert!(first.trade_id.is_some());

    let second = engine.force_trade(request, decision_ts).unwrap();
    assert_eq!(second.order_status, OrderStatus::Skipped);
    assert!(second.trade_id.is_none());

    let trades: Vec<_> = history
        .recent_trades(100)
        .unwrap()
        .into_iter()
        .filter(|trade| trade.symbol == "ETH-USDC")
        .collect();
    assert_eq!(trades.len(), 1, "exactly one open trade");
    assert!(trades[0].pnl.is_none());

    let skipped = history
        .recent_orders(100)
        .unwrap()
        .into_iter()
        .filter(|order| {
            order.symbol == "ETH-USDC" && order.status == OrderStatus::Skipped
        })
        .count();
    assert_eq!(skipped, 1, "exactly one skipped order");
    assert_eq!(engine.holdings("ETH-USDC"), trades[0].quantity);
}

#[test]
fn accepted_orders_leave_one_record_of_each_kind_in_order() {
    let dir = TempDir::new().unwrap();
    let (history, engine) = engine(&dir);
    run_cycles(&engine, 5);

    engine
        .force_trade(
            ForceTradeRequest {
                symbol: "BTC-USDC".into(),
                side: Side::Buy,
                quantity: Some(Decimal::new(1, 2)),
                notional_usd: None,
                tp_pct: None,
                sl_pct: None,
                tp_price: None,
                sl_price: None,
                decision_id: None,
                decision_ts: None,
            },
            start_ts() + Duration::hours(6),
        )
        .unwrap();

    let orders = history.recent_orders(10).unwrap();
    let accepted: Vec<_> = orders
        .iter()
        .filter(|order| order.status == OrderStatus::Accepted)
        .collect();
    assert_eq!(accepted.len(), 1);

    let decisions = history.recent_decisions(100).unwrap();
    let decision = decisions
        .iter()
        .find(|decision| decision.id == accepted[0].decision_id)
        .expect("order references its decision");
    assert!(decision.timestamp <= accepted[0].created_at);

    // One FILLED fill per accepted order, journaled after the ledger
    // mutation, then a snapshot.
    let fills: Vec<serde_json::Value> = std::fs::read_to_string(dir.path().join("fills.jsonl"))
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(fills.len(), 1);
    assert_eq!(
        fills[0]["order_id"].as_str().unwrap(),
        accepted[0].id.to_string()
    );
    let snapshots = std::fs::read_to_string(dir.path().join("snapshots.jsonl")).unwrap();
    assert_eq!(snapshots.lines().count(), 1);
}

#[test]
fn stop_loss_exit_fires_once_and_does_not_reopen() {
    // S6: a lot with entry 100, stop 98, target 104 closes on the bar
    // that touches 98 and stays closed afterwards.
    let dir = TempDir::new().unwrap();
    let (history, engine) = engine(&dir);

    let mut seed = candle(0, 100.0);
    seed.symbol = "BTC-USDC".into();
    seed.open = Decimal::new(995, 1);
    seed.high = Decimal::from(101);
    seed.low = Decimal::from(99);
    engine.on_candle(seed, start_ts() + Duration::seconds(2)).unwrap();

    engine
        .force_trade(
            ForceTradeRequest {
                symbol: "BTC-USDC".into(),
                side: Side::Buy,
                quantity: Some(Decimal::ONE),
                notional_usd: None,
                tp_pct: None,
                sl_pct: None,
                tp_price: Some(Decimal::from(104)),
                sl_price: Some(Decimal::from(98)),
                decision_id: None,
                decision_ts: None,
            },
            start_ts() + Duration::minutes(30),
        )
        .unwrap();
    assert_eq!(engine.holdings("BTC-USDC"), Decimal::ONE);

    // Price ticks down to the stop.
    for (i, close) in [(1, 99.0), (2, 98.0)] {
        let mut bar = candle(i, close);
        bar.open = Decimal::from_f64(close + 0.2).unwrap();
        bar.high = Decimal::from_f64(close + 0.5).unwrap();
        bar.low = Decimal::from_f64(close - 0.5).unwrap();
        engine
            .on_candle(bar.clone(), bar.timestamp + Duration::seconds(2))
            .unwrap();
    }
    assert_eq!(engine.holdings("BTC-USDC"), Decimal::ZERO);

    let exits: Vec<_> = history
        .recent_trades(100)
        .unwrap()
        .into_iter()
        .filter(|trade| trade.side == Side::Sell)
        .collect();
    assert_eq!(exits.len(), 1);
    let exit = &exits[0];
    assert_eq!(exit.exit_reason, Some(ExitReason::StopLoss));
    let pnl = exit.pnl.unwrap();
    // Roughly -2 before fees and slippage.
    assert!(pnl < Decimal::from(-1), "pnl {pnl}");
    assert!(pnl > Decimal::from(-3), "pnl {pnl}");

    // Further bars at the stop price neither exit again nor reopen.
    for i in 3..6 {
        let mut bar = candle(i, 98.0);
        bar.open = Decimal::new(982, 1);
        bar.high = Decimal::new(985, 1);
        bar.low = Decimal::new(975, 1);
        engine
            .on_candle(bar.clone(), bar.timestamp + Duration::seconds(2))
            .unwrap();
    }
    assert_eq!(engine.holdings("BTC-USDC"), Decimal::ZERO);
    let sells_after = history
        .recent_trades(100)
        .unwrap()
        .into_iter()
        .filter(|trade| trade.side == Side::Sell)
        .count();
    assert_eq!(sells_after, 1);
}

#[test]
fn restart_replays_no_ledger_mutation_for_known_keys() {
    // Property 4: replaying an idempotency key across a restart leaves
    // the ledger untouched.
    let dir = TempDir::new().unwrap();
    let decision_id = Uuid::new_v4();
    let decision_ts = start_ts() + Duration::hours(3);
    let request = ForceTradeRequest {
        symbol: "BTC-USDC".into(),
        side: Side::Buy,
        quantity: Some(Decimal::new(5, 2)),
        notional_usd: None,
        tp_pct: Some(2.0),
        sl_pct: Some(1.0),
        tp_price: None,
        sl_price: None,
        decision_id: Some(decision_id),
        decision_ts: Some(decision_ts),
    };

    {
        let (_history, engine) = engine(&dir);
        run_cycles(&engine, 3);
        engine.force_trade(request.clone(), decision_ts).unwrap();
        engine.shutdown().unwrap();
    }

    // New process, same journal directory.
    let (history, engine) = engine(&dir);
    run_cycles(&engine, 3);
    let replay = engine.force_trade(request, decision_ts).unwrap();
    assert_eq!(replay.order_status, OrderStatus::Skipped);
    assert_eq!(engine.holdings("BTC-USDC"), Decimal::ZERO);

    let open_trades = history
        .recent_trades(100)
        .unwrap()
        .into_iter()
        .filter(|trade| trade.side == Side::Buy)
        .count();
    assert_eq!(open_trades, 1);
}
