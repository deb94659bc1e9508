//! The trading engine proper: per-symbol evaluation, order execution with
//! idempotency, position bookkeeping and the engine-wide singletons.
//!
//! All shared state lives on an explicit [`Engine`] value owned by the
//! scheduler. Symbol-local state is only touched from that symbol's
//! actor; cross-symbol state (account, book, status, strategy) sits
//! behind its own lock with bounded critical sections.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use skiff_core::{
    idempotency_key, round_price, round_size, Candle, Decision, EngineStatus, Event, EventBus,
    ExitReason, Fill, Interval, Lot, MarketStatus, Order, OrderStatus, PositionSnapshot, Price,
    Quantity, Side, SignalAction, Symbol, Trade, TrainingLogEntry,
};
use skiff_execution::{
    r_multiple, realized_pnl, BreakerInputs, BreakerThresholds, CircuitBreaker,
    ExecutionSimulator, RiskContext, RiskManager,
};
use skiff_history::{HistoryError, HistoryStore, RecordSet};
use skiff_indicators::{IndicatorSet, ReadyIndicators};
use skiff_ledger::{Account, LedgerError, PositionBook};
use skiff_strategy::{
    decide, Advisor, DecisionContext, RefinementCycle, RefinementOutcome, StrategyState,
};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod arbitrage;
pub mod scheduler;

pub use arbitrage::{ArbExecution, ArbOpportunity, ArbitrageConfig, ArbitrageOrchestrator};
pub use scheduler::{Scheduler, SchedulerConfig, ShutdownSignal};

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Failures that escape the evaluation pipeline. Persistence errors are
/// the only ones treated as fatal by the caller.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("unknown symbol: {0}")]
    UnknownSymbol(Symbol),
    #[error("engine rejected request: {0}")]
    Rejected(String),
}

/// Static engine configuration derived from the environment.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub symbols: Vec<Symbol>,
    pub timeframe: Interval,
    pub initial_balance: Price,
    pub fee_bps: Decimal,
    pub confidence_threshold: f64,
    pub auto_paper: bool,
    pub stale_data_ms: i64,
    pub max_candles: usize,
    pub training_log_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTC-USDC".into()],
            timeframe: Interval::OneHour,
            initial_balance: Decimal::from(1_000),
            fee_bps: Decimal::from(10),
            confidence_threshold: 0.6,
            auto_paper: true,
            stale_data_ms: 7_200_000,
            max_candles: 500,
            training_log_limit: 256,
        }
    }
}

/// What caused an evaluation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EvalTrigger {
    /// A closed bar arrived from the stream.
    CandleClose,
    /// The 60 s safety tick fired.
    Timer,
}

#[derive(Clone, Debug)]
struct DayTracker {
    day: NaiveDate,
    realized: Price,
    start_equity: Price,
}

impl DayTracker {
    fn new(now: DateTime<Utc>, equity: Price) -> Self {
        Self {
            day: now.date_naive(),
            realized: Decimal::ZERO,
            start_equity: equity,
        }
    }

    fn roll(&mut self, now: DateTime<Utc>, equity: Price) {
        if now.date_naive() != self.day {
            *self = Self::new(now, equity);
        }
    }

    fn drawdown_pct(&self) -> f64 {
        if self.realized >= Decimal::ZERO {
            return 0.0;
        }
        let start = self.start_equity.to_f64().unwrap_or(1.0).max(1.0);
        (-self.realized.to_f64().unwrap_or_default()) / start
    }
}

struct SymbolState {
    candles: VecDeque<Candle>,
    indicators: IndicatorSet,
    last_ready: Option<ReadyIndicators>,
    last_evaluated_ts: Option<DateTime<Utc>>,
    last_trade_at: Option<DateTime<Utc>>,
    daily: DayTracker,
    loss_streak: u32,
    large_loss_streak: u32,
    stream_unstable: bool,
}

impl SymbolState {
    fn new(now: DateTime<Utc>, equity: Price) -> Self {
        Self {
            candles: VecDeque::new(),
            indicators: IndicatorSet::standard().expect("standard indicator periods are valid"),
            last_ready: None,
            last_evaluated_ts: None,
            last_trade_at: None,
            daily: DayTracker::new(now, equity),
            loss_streak: 0,
            large_loss_streak: 0,
            stream_unstable: false,
        }
    }
}

/// Outcome of one evaluation, surfaced for tests and the status facade.
#[derive(Clone, Debug)]
pub struct CycleReport {
    pub decision: Option<Decision>,
    pub exits: usize,
    pub executed_entry: bool,
}

/// Parameters of an operator-initiated trade.
#[derive(Clone, Debug)]
pub struct ForceTradeRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Option<Quantity>,
    pub notional_usd: Option<Price>,
    pub tp_pct: Option<f64>,
    pub sl_pct: Option<f64>,
    pub tp_price: Option<Price>,
    pub sl_price: Option<Price>,
    /// Reuse an existing decision id to make the request idempotent.
    pub decision_id: Option<Uuid>,
    pub decision_ts: Option<DateTime<Utc>>,
}

/// Result of a force-trade call.
#[derive(Clone, Debug)]
pub struct ForcedTrade {
    pub trade_id: Option<Uuid>,
    pub decision_id: Uuid,
    pub order_status: OrderStatus,
}

/// Engine-wide singletons plus per-symbol evaluation state.
pub struct Engine {
    config: EngineConfig,
    history: Arc<dyn HistoryStore>,
    strategy: RwLock<StrategyState>,
    account: Mutex<Account>,
    book: Mutex<PositionBook>,
    status: Mutex<EngineStatus>,
    breaker: Mutex<CircuitBreaker>,
    simulator: ExecutionSimulator,
    bus: EventBus,
    training_log: Mutex<VecDeque<TrainingLogEntry>>,
    symbols: Mutex<HashMap<Symbol, SymbolState>>,
    marks: Mutex<HashMap<Symbol, Price>>,
}

impl Engine {
    /// Assemble the engine, restoring durable strategy state and engine
    /// counters from the history store when present.
    pub fn new(
        config: EngineConfig,
        history: Arc<dyn HistoryStore>,
        bus: EventBus,
    ) -> EngineResult<Self> {
        let strategy = match history.load_strategy_state()? {
            Some(state) => {
                info!(version = state.version(), "restored strategy state");
                state
            }
            None => StrategyState::default(),
        };
        let status = match history.load_engine_status()? {
            Some(mut status) => {
                status.running = true;
                status.last_heartbeat = Utc::now();
                status.auto_paper = config.auto_paper;
                status.confidence_threshold = config.confidence_threshold;
                info!(evaluations = status.evaluations, "restored engine status");
                status
            }
            None => EngineStatus::started(config.auto_paper, config.confidence_threshold),
        };
        let simulator = ExecutionSimulator::new(config.fee_bps);
        let now = Utc::now();
        let mut symbols = HashMap::new();
        for symbol in &config.symbols {
            symbols.insert(
                symbol.clone(),
                SymbolState::new(now, config.initial_balance),
            );
        }
        Ok(Self {
            account: Mutex::new(Account::new(config.initial_balance)),
            book: Mutex::new(PositionBook::new()),
            status: Mutex::new(status),
            breaker: Mutex::new(CircuitBreaker::new(BreakerThresholds::default())),
            strategy: RwLock::new(strategy),
            simulator,
            bus,
            training_log: Mutex::new(VecDeque::new()),
            symbols: Mutex::new(symbols),
            marks: Mutex::new(HashMap::new()),
            history,
            config,
        })
    }

    /// Feed one closed bar and run an evaluation for its symbol.
    pub fn on_candle(&self, candle: Candle, now: DateTime<Utc>) -> EngineResult<CycleReport> {
        if candle.validate().is_err() {
            warn!(symbol = %candle.symbol, "discarding invalid bar at evaluation");
            return Ok(CycleReport {
                decision: None,
                exits: 0,
                executed_entry: false,
            });
        }
        let symbol = candle.symbol.clone();
        {
            let mut symbols = self.symbols.lock().expect("symbol map poisoned");
            let state = symbols
                .entry(symbol.clone())
                .or_insert_with(|| SymbolState::new(now, self.config.initial_balance));
            let monotone = state
                .candles
                .back()
                .map(|last| candle.timestamp > last.timestamp)
                .unwrap_or(true);
            if !monotone {
                warn!(symbol = %symbol, ts = %candle.timestamp, "dropping non-monotone bar");
                return Ok(CycleReport {
                    decision: None,
                    exits: 0,
                    executed_entry: false,
                });
            }
            let snapshot = state.indicators.update(&candle);
            state.last_ready = snapshot.ready();
            state.candles.push_back(candle.clone());
            while state.candles.len() > self.config.max_candles {
                state.candles.pop_front();
            }
        }
        self.marks
            .lock()
            .expect("marks poisoned")
            .insert(symbol.clone(), candle.close);
        self.evaluate(&symbol, EvalTrigger::CandleClose, now)
    }

    /// The 60 s safety tick: evaluates on the latest buffered bar even if
    /// the stream stalled.
    pub fn on_tick(&self, symbol: &str, now: DateTime<Utc>) -> EngineResult<CycleReport> {
        self.evaluate(symbol, EvalTrigger::Timer, now)
    }

    /// Flag used by the breaker; set by the scheduler from stream health.
    pub fn set_stream_unstable(&self, symbol: &str, unstable: bool) {
        let mut symbols = self.symbols.lock().expect("symbol map poisoned");
        if let Some(state) = symbols.get_mut(symbol) {
            state.stream_unstable = unstable;
        }
    }

    /// One full evaluation cycle for a symbol.
    fn evaluate(
        &self,
        symbol: &str,
        trigger: EvalTrigger,
        now: DateTime<Utc>,
    ) -> EngineResult<CycleReport> {
        let equity_now = self.equity();
        let (candles, latest_ts, indicators, unstable, idle_for, daily, loss_streak, large_losses) = {
            let mut symbols = self.symbols.lock().expect("symbol map poisoned");
            let state = symbols
                .get_mut(symbol)
                .ok_or_else(|| EngineError::UnknownSymbol(symbol.to_string()))?;
            state.daily.roll(now, equity_now);
            let latest_ts = state.candles.back().map(|candle| candle.timestamp);
            (
                state.candles.iter().cloned().collect::<Vec<_>>(),
                latest_ts,
                state.last_ready,
                state.stream_unstable,
                state
                    .last_trade_at
                    .map(|at| now - at)
                    .unwrap_or_else(|| Duration::hours(48)),
                state.daily.clone(),
                state.loss_streak,
                state.large_loss_streak,
            )
        };

        let Some(latest_ts) = latest_ts else {
            debug!(symbol, "no bars buffered yet; skipping evaluation");
            return Ok(CycleReport {
                decision: None,
                exits: 0,
                executed_entry: false,
            });
        };

        // Stale data: skip with a warning, never score old bars.
        let age_ms = (now - latest_ts).num_milliseconds();
        if age_ms > self.config.stale_data_ms {
            warn!(symbol, age_ms, "market data stale; skipping evaluation");
            self.strategy
                .write()
                .expect("strategy poisoned")
                .push_warning(format!("{symbol}: evaluation skipped on stale data ({age_ms} ms)"));
            return Ok(CycleReport {
                decision: None,
                exits: 0,
                executed_entry: false,
            });
        }

        // De-dup guard: both triggers land on the same bar at most once.
        {
            let mut symbols = self.symbols.lock().expect("symbol map poisoned");
            let state = symbols
                .get_mut(symbol)
                .ok_or_else(|| EngineError::UnknownSymbol(symbol.to_string()))?;
            if state.last_evaluated_ts == Some(latest_ts) {
                debug!(symbol, ?trigger, "bar already evaluated; deduplicated");
                return Ok(CycleReport {
                    decision: None,
                    exits: 0,
                    executed_entry: false,
                });
            }
            state.last_evaluated_ts = Some(latest_ts);
        }

        self.bump_status(|status| {
            status.evaluations += 1;
            status.last_heartbeat = now;
        });

        let close = candles.last().map(|candle| candle.close).unwrap_or_default();

        // Bracket exits come first so a stopped-out lot cannot also fund a
        // fresh entry within the same tick.
        let exits = self.run_auto_exits(symbol, close, now)?;

        let (params, version) = {
            let strategy = self.strategy.read().expect("strategy poisoned");
            (strategy.parameters(), strategy.version())
        };
        let holdings = self.book.lock().expect("book poisoned").holdings(symbol);
        let mut assessment = decide(
            &candles,
            &params,
            &DecisionContext {
                holdings,
                idle_for,
                model_version: version,
            },
        );

        // Circuit breaker gates everything downstream; its reasons are
        // carried on the decision record while latched.
        let atr_pct = indicators
            .as_ref()
            .map(|ind| ind.atr / close.to_f64().unwrap_or(1.0).max(f64::MIN_POSITIVE))
            .unwrap_or_default();
        let latched = {
            let mut breaker = self.breaker.lock().expect("breaker poisoned");
            let latched = breaker.evaluate(
                &BreakerInputs {
                    daily_drawdown_pct: daily.drawdown_pct(),
                    consecutive_large_losses: large_losses,
                    volatility_pct: atr_pct,
                    stream_unstable: unstable,
                },
                now,
            );
            if latched {
                for reason in breaker.reasons() {
                    assessment.reasons.push(format!("breaker: {reason}"));
                }
                self.bus.publish(Event::BreakerTripped {
                    reasons: breaker.reasons().to_vec(),
                });
            }
            latched
        };

        let signal = assessment.action;
        if signal != SignalAction::Hold {
            self.bump_status(|status| status.signals += 1);
        }

        // Risk and policy gates may demote the action; the decision is
        // recorded with the demotion reasons rather than dropped.
        let mut entry = None;
        let mut action = signal;
        if latched && action != SignalAction::Hold {
            action = SignalAction::Hold;
        } else {
            match action {
                SignalAction::Buy => {
                    if assessment.confidence < self.config.confidence_threshold {
                        assessment.reasons.push(format!(
                            "confidence {:.2} below threshold {:.2}",
                            assessment.confidence, self.config.confidence_threshold
                        ));
                        action = SignalAction::Hold;
                    } else if !self.config.auto_paper {
                        assessment
                            .reasons
                            .push("auto-paper disabled; signal not executed".into());
                        action = SignalAction::Hold;
                    } else if let Some(ind) = &indicators {
                        let risk = RiskManager::new(params);
                        let ctx = RiskContext {
                            balance: self.account.lock().expect("account poisoned").balance(),
                            equity: self.equity(),
                            price: close,
                            atr: ind.atr,
                            atr_pct,
                            regime: assessment.regime,
                            open_positions: self.book.lock().expect("book poisoned").open_lot_count(),
                            daily_realized_pnl: daily.realized,
                            loss_streak,
                        };
                        match risk.evaluate_buy(&ctx) {
                            Ok(sized) => entry = Some(sized),
                            Err(rejection) => {
                                assessment.reasons.push(format!("risk: {rejection}"));
                                action = SignalAction::Hold;
                            }
                        }
                    } else {
                        assessment
                            .reasons
                            .push("indicators not ready for sizing".into());
                        action = SignalAction::Hold;
                    }
                }
                SignalAction::Sell => {
                    let risk = RiskManager::new(params);
                    if let Err(rejection) = risk.evaluate_sell(holdings, None) {
                        assessment.reasons.push(format!("risk: {rejection}"));
                        action = SignalAction::Hold;
                    }
                }
                SignalAction::Hold => {}
            }
        }
        assessment.action = action;

        let decision = Decision {
            id: Uuid::new_v4(),
            timestamp: latest_ts,
            symbol: symbol.to_string(),
            timeframe: self.config.timeframe,
            action: assessment.action,
            confidence: assessment.confidence,
            regime: assessment.regime,
            reasons: assessment.reasons.clone(),
            model_version: assessment.model_version,
            inputs_hash: assessment.inputs_hash.clone(),
        };
        self.history.append_decision(&decision)?;
        self.bus.publish(Event::DecisionRecorded(decision.clone()));
        self.push_training_log(TrainingLogEntry {
            timestamp: now,
            symbol: symbol.to_string(),
            action: decision.action,
            market_status: MarketStatus::from(decision.regime),
            score: assessment.score,
            confidence: decision.confidence,
        });

        let mut executed_entry = false;
        let mut executed_trade = false;
        match decision.action {
            SignalAction::Buy => {
                if let Some(sized) = entry {
                    executed_entry = self.execute_entry(&decision, close, atr_pct, sized, now)?;
                    executed_trade = executed_entry;
                }
            }
            SignalAction::Sell => {
                let quantity = self.book.lock().expect("book poisoned").holdings(symbol);
                if quantity > Decimal::ZERO {
                    self.execute_exit(
                        symbol,
                        quantity,
                        None,
                        close,
                        atr_pct,
                        ExitReason::Signal,
                        Some(&decision),
                        now,
                    )?;
                    executed_trade = true;
                }
            }
            SignalAction::Hold => {}
        }
        if executed_trade {
            // Auto-exits are bracket bookkeeping, not signal executions;
            // only decision-driven trades feed this counter so
            // `trades_executed <= signals <= evaluations` holds.
            self.bump_status(|status| status.trades_executed += 1);
        }

        let open_positions = self.book.lock().expect("book poisoned").open_lot_count() as u64;
        self.bump_status(|status| status.open_positions = open_positions);

        Ok(CycleReport {
            decision: Some(decision),
            exits,
            executed_entry,
        })
    }

    /// Scan open lots against the mark and close any whose bracket was
    /// hit. Stop-loss is checked before take-profit per lot.
    fn run_auto_exits(
        &self,
        symbol: &str,
        price: Price,
        now: DateTime<Utc>,
    ) -> EngineResult<usize> {
        let triggers = self
            .book
            .lock()
            .expect("book poisoned")
            .exit_triggers(symbol, price);
        let mut closed = 0;
        for trigger in triggers {
            self.execute_exit(
                symbol,
                trigger.quantity,
                Some(trigger.lot_id),
                price,
                self.latest_atr_pct(symbol),
                trigger.reason,
                None,
                now,
            )?;
            closed += 1;
        }
        Ok(closed)
    }

    /// Submit a BUY through the idempotent order path. Returns whether a
    /// new fill happened.
    fn execute_entry(
        &self,
        decision: &Decision,
        close: Price,
        atr_pct: f64,
        sized: skiff_execution::SizedEntry,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let key = idempotency_key(
            &decision.symbol,
            decision.timeframe,
            decision.timestamp,
            Side::Buy,
        );
        if self.history.find_order_by_key(&key)?.is_some() {
            let skipped = Order {
                id: Uuid::new_v4(),
                decision_id: decision.id,
                idempotency_key: key,
                symbol: decision.symbol.clone(),
                side: Side::Buy,
                quantity: sized.quantity,
                requested_price: close,
                status: OrderStatus::Skipped,
                created_at: now,
            };
            self.history.append_order(&skipped)?;
            info!(symbol = %decision.symbol, "duplicate order skipped by idempotency key");
            return Ok(false);
        }

        let order = Order {
            id: Uuid::new_v4(),
            decision_id: decision.id,
            idempotency_key: key,
            symbol: decision.symbol.clone(),
            side: Side::Buy,
            quantity: sized.quantity,
            requested_price: close,
            status: OrderStatus::Accepted,
            created_at: now,
        };
        self.history.append_order(&order)?;

        let simulated = self.simulator.simulate(
            &decision.symbol,
            decision.timestamp,
            Side::Buy,
            close,
            atr_pct,
            sized.quantity,
        );
        let version = self.strategy.read().expect("strategy poisoned").version();
        let lot = Lot::open(
            decision.symbol.clone(),
            simulated.fill_price,
            sized.quantity,
            sized.stop_loss,
            sized.take_profit,
            now,
            simulated.fee,
            version,
        )
        .map_err(|err| EngineError::Rejected(err.to_string()))?;

        // Ledger first; the FILLED fill is only journaled once the
        // in-memory state reflects it.
        {
            let mut account = self.account.lock().expect("account poisoned");
            account.apply_buy(simulated.fill_price, sized.quantity, simulated.fee);
        }
        self.book.lock().expect("book poisoned").open(lot);

        let fill = Fill {
            id: Uuid::new_v4(),
            order_id: order.id,
            symbol: decision.symbol.clone(),
            side: Side::Buy,
            avg_price: simulated.fill_price,
            quantity: sized.quantity,
            fee: simulated.fee,
            timestamp: now,
        };
        let trade = Trade {
            id: Uuid::new_v4(),
            decision_id: Some(decision.id),
            arbitrage_id: None,
            symbol: decision.symbol.clone(),
            side: Side::Buy,
            price: simulated.fill_price,
            quantity: sized.quantity,
            fee: simulated.fee,
            pnl: None,
            r_multiple: None,
            exit_reason: None,
            simulation: Some(simulated.simulation.clone()),
            timestamp: now,
        };
        let snapshot = self.snapshot(&decision.symbol, now);
        self.history.append_set(&RecordSet {
            decision: None,
            order: None,
            fill: Some(fill.clone()),
            trade: Some(trade),
            snapshot: Some(snapshot),
        })?;
        self.bus.publish(Event::FillRecorded(fill));

        {
            let mut symbols = self.symbols.lock().expect("symbol map poisoned");
            if let Some(state) = symbols.get_mut(&decision.symbol) {
                state.last_trade_at = Some(now);
            }
        }
        info!(
            symbol = %decision.symbol,
            qty = %sized.quantity,
            fill = %simulated.fill_price,
            "paper entry filled"
        );
        Ok(true)
    }

    /// Close `quantity` (optionally a single lot) and journal the result.
    #[allow(clippy::too_many_arguments)]
    fn execute_exit(
        &self,
        symbol: &str,
        quantity: Quantity,
        target_lot: Option<Uuid>,
        close: Price,
        atr_pct: f64,
        reason: ExitReason,
        decision: Option<&Decision>,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let decision_ts = decision.map(|d| d.timestamp).unwrap_or(now);
        let key = idempotency_key(symbol, self.config.timeframe, decision_ts, Side::Sell);
        if decision.is_some() && self.history.find_order_by_key(&key)?.is_some() {
            let skipped = Order {
                id: Uuid::new_v4(),
                decision_id: decision.map(|d| d.id).unwrap_or_else(Uuid::new_v4),
                idempotency_key: key,
                symbol: symbol.to_string(),
                side: Side::Sell,
                quantity,
                requested_price: close,
                status: OrderStatus::Skipped,
                created_at: now,
            };
            self.history.append_order(&skipped)?;
            return Ok(());
        }

        let simulated =
            self.simulator
                .simulate(&symbol.to_string(), decision_ts, Side::Sell, close, atr_pct, quantity);
        let slice = self
            .book
            .lock()
            .expect("book poisoned")
            .consume(symbol, quantity, target_lot)?;

        let entry_fee = slice.entry_fee_per_unit * quantity;
        let pnl = realized_pnl(
            slice.entry_price,
            simulated.fill_price,
            quantity,
            entry_fee,
            simulated.fee,
        );
        let r = r_multiple(pnl, slice.initial_risk_per_unit, quantity);
        {
            let mut account = self.account.lock().expect("account poisoned");
            account.apply_sell(simulated.fill_price, quantity, simulated.fee);
        }

        let order = Order {
            id: Uuid::new_v4(),
            decision_id: decision.map(|d| d.id).unwrap_or_else(Uuid::new_v4),
            idempotency_key: key,
            symbol: symbol.to_string(),
            side: Side::Sell,
            quantity,
            requested_price: close,
            status: OrderStatus::Accepted,
            created_at: now,
        };
        let fill = Fill {
            id: Uuid::new_v4(),
            order_id: order.id,
            symbol: symbol.to_string(),
            side: Side::Sell,
            avg_price: simulated.fill_price,
            quantity,
            fee: simulated.fee,
            timestamp: now,
        };
        let trade = Trade {
            id: Uuid::new_v4(),
            decision_id: decision.map(|d| d.id),
            arbitrage_id: None,
            symbol: symbol.to_string(),
            side: Side::Sell,
            price: simulated.fill_price,
            quantity,
            fee: simulated.fee,
            pnl: Some(round_price(pnl)),
            r_multiple: Some(r),
            exit_reason: Some(reason),
            simulation: Some(simulated.simulation.clone()),
            timestamp: now,
        };
        let snapshot = self.snapshot(symbol, now);
        self.history.append_set(&RecordSet {
            decision: None,
            order: Some(order),
            fill: Some(fill.clone()),
            trade: Some(trade),
            snapshot: Some(snapshot),
        })?;
        self.bus.publish(Event::FillRecorded(fill));

        {
            let mut symbols = self.symbols.lock().expect("symbol map poisoned");
            if let Some(state) = symbols.get_mut(symbol) {
                state.daily.realized += pnl;
                state.last_trade_at = Some(now);
                if pnl < Decimal::ZERO {
                    state.loss_streak += 1;
                    if r <= -1.0 {
                        state.large_loss_streak += 1;
                    }
                } else {
                    state.loss_streak = 0;
                    state.large_loss_streak = 0;
                }
            }
        }
        info!(
            symbol,
            qty = %quantity,
            fill = %simulated.fill_price,
            pnl = %pnl,
            reason = ?reason,
            "paper exit filled"
        );
        Ok(())
    }

    /// Operator-initiated trade with explicit brackets. Reusing a
    /// decision id makes the call idempotent end to end.
    pub fn force_trade(
        &self,
        request: ForceTradeRequest,
        now: DateTime<Utc>,
    ) -> EngineResult<ForcedTrade> {
        let symbol = skiff_core::normalize_symbol(&request.symbol);
        let mark = self
            .marks
            .lock()
            .expect("marks poisoned")
            .get(&symbol)
            .copied()
            .ok_or_else(|| EngineError::UnknownSymbol(symbol.clone()))?;
        let quantity = match (request.quantity, request.notional_usd) {
            (Some(qty), _) if qty > Decimal::ZERO => qty,
            (_, Some(notional)) if notional > Decimal::ZERO => round_size(notional / mark),
            _ => {
                return Err(EngineError::Rejected(
                    "force-trade requires a positive qty or notionalUsd".into(),
                ))
            }
        };

        let decision_id = request.decision_id.unwrap_or_else(Uuid::new_v4);
        let decision_ts = request.decision_ts.unwrap_or(now);
        let decision = Decision {
            id: decision_id,
            timestamp: decision_ts,
            symbol: symbol.clone(),
            timeframe: self.config.timeframe,
            action: match request.side {
                Side::Buy => SignalAction::Buy,
                Side::Sell => SignalAction::Sell,
            },
            confidence: 1.0,
            regime: skiff_core::Regime::Ranging,
            reasons: vec!["operator force-trade".into()],
            model_version: self.strategy.read().expect("strategy poisoned").version(),
            inputs_hash: String::new(),
        };

        let key = idempotency_key(&symbol, self.config.timeframe, decision_ts, request.side);
        if self.history.find_order_by_key(&key)?.is_some() {
            let skipped = Order {
                id: Uuid::new_v4(),
                decision_id,
                idempotency_key: key,
                symbol: symbol.clone(),
                side: request.side,
                quantity,
                requested_price: mark,
                status: OrderStatus::Skipped,
                created_at: now,
            };
            self.history.append_order(&skipped)?;
            return Ok(ForcedTrade {
                trade_id: None,
                decision_id,
                order_status: OrderStatus::Skipped,
            });
        }
        self.history.append_decision(&decision)?;

        match request.side {
            Side::Buy => {
                let stop_loss = request
                    .sl_price
                    .or_else(|| {
                        request.sl_pct.and_then(|pct| {
                            Decimal::try_from(1.0 - pct / 100.0).ok().map(|f| mark * f)
                        })
                    })
                    .unwrap_or_else(|| mark * Decimal::new(98, 2));
                let take_profit = request
                    .tp_price
                    .or_else(|| {
                        request.tp_pct.and_then(|pct| {
                            Decimal::try_from(1.0 + pct / 100.0).ok().map(|f| mark * f)
                        })
                    })
                    .unwrap_or_else(|| mark * Decimal::new(104, 2));

                let order = Order {
                    id: Uuid::new_v4(),
                    decision_id,
                    idempotency_key: key,
                    symbol: symbol.clone(),
                    side: Side::Buy,
                    quantity,
                    requested_price: mark,
                    status: OrderStatus::Accepted,
                    created_at: now,
                };
                self.history.append_order(&order)?;

                let simulated = self.simulator.simulate(
                    &symbol,
                    decision_ts,
                    Side::Buy,
                    mark,
                    self.latest_atr_pct(&symbol),
                    quantity,
                );
                let version = self.strategy.read().expect("strategy poisoned").version();
                let lot = Lot::open(
                    symbol.clone(),
                    simulated.fill_price,
                    quantity,
                    round_price(stop_loss),
                    round_price(take_profit),
                    now,
                    simulated.fee,
                    version,
                )
                .map_err(|err| EngineError::Rejected(err.to_string()))?;
                {
                    let mut account = self.account.lock().expect("account poisoned");
                    account.apply_buy(simulated.fill_price, quantity, simulated.fee);
                }
                self.book.lock().expect("book poisoned").open(lot);

                let fill = Fill {
                    id: Uuid::new_v4(),
                    order_id: order.id,
                    symbol: symbol.clone(),
                    side: Side::Buy,
                    avg_price: simulated.fill_price,
                    quantity,
                    fee: simulated.fee,
                    timestamp: now,
                };
                let trade = Trade {
                    id: Uuid::new_v4(),
                    decision_id: Some(decision_id),
                    arbitrage_id: None,
                    symbol: symbol.clone(),
                    side: Side::Buy,
                    price: simulated.fill_price,
                    quantity,
                    fee: simulated.fee,
                    pnl: None,
                    r_multiple: None,
                    exit_reason: None,
                    simulation: Some(simulated.simulation.clone()),
                    timestamp: now,
                };
                let trade_id = trade.id;
                let snapshot = self.snapshot(&symbol, now);
                self.history.append_set(&RecordSet {
                    decision: None,
                    order: None,
                    fill: Some(fill),
                    trade: Some(trade),
                    snapshot: Some(snapshot),
                })?;
                self.bump_status(|status| {
                    status.evaluations += 1;
                    status.signals += 1;
                    status.trades_executed += 1;
                });
                Ok(ForcedTrade {
                    trade_id: Some(trade_id),
                    decision_id,
                    order_status: OrderStatus::Filled,
                })
            }
            Side::Sell => {
                let holdings = self.book.lock().expect("book poisoned").holdings(&symbol);
                let quantity = quantity.min(holdings);
                if quantity <= Decimal::ZERO {
                    return Err(EngineError::Rejected("no holdings to sell".into()));
                }
                self.execute_exit(
                    &symbol,
                    quantity,
                    None,
                    mark,
                    self.latest_atr_pct(&symbol),
                    ExitReason::Manual,
                    Some(&decision),
                    now,
                )?;
                self.bump_status(|status| {
                    status.evaluations += 1;
                    status.signals += 1;
                    status.trades_executed += 1;
                });
                Ok(ForcedTrade {
                    trade_id: None,
                    decision_id,
                    order_status: OrderStatus::Filled,
                })
            }
        }
    }

    /// Run one refinement cycle against the last 24 h of closed trades.
    pub async fn refine(&self, advisor: &dyn Advisor, now: DateTime<Utc>) -> EngineResult<RefinementOutcome> {
        let trades = self.history.trades_since(now - Duration::hours(24))?;
        let mut state = self.strategy.read().expect("strategy poisoned").clone();
        let outcome = RefinementCycle::default()
            .run(&mut state, &trades, advisor, now)
            .await;
        *self.strategy.write().expect("strategy poisoned") = state.clone();
        self.history.save_strategy_state(&state)?;
        Ok(outcome)
    }

    /// Whether 24 h have elapsed since the last refinement attempt.
    #[must_use]
    pub fn refinement_due(&self, now: DateTime<Utc>) -> bool {
        let strategy = self.strategy.read().expect("strategy poisoned");
        match strategy.last_refinement_at() {
            Some(last) => now - last >= Duration::hours(24),
            None => true,
        }
    }

    /// Operator reset of the latched breaker.
    pub fn reset_breaker(&self) {
        self.breaker.lock().expect("breaker poisoned").reset();
    }

    /// Snapshot of the process-wide status counters.
    #[must_use]
    pub fn status(&self) -> EngineStatus {
        self.status.lock().expect("status poisoned").clone()
    }

    /// Most recent training-log entries, newest last.
    #[must_use]
    pub fn training_log(&self) -> Vec<TrainingLogEntry> {
        self.training_log
            .lock()
            .expect("training log poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Current strategy snapshot (parameters and version).
    #[must_use]
    pub fn strategy_state(&self) -> StrategyState {
        self.strategy.read().expect("strategy poisoned").clone()
    }

    /// Cash balance of the paper account.
    #[must_use]
    pub fn balance(&self) -> Price {
        self.account.lock().expect("account poisoned").balance()
    }

    /// Holdings for one symbol.
    #[must_use]
    pub fn holdings(&self, symbol: &str) -> Quantity {
        self.book.lock().expect("book poisoned").holdings(symbol)
    }

    /// Total portfolio value: balance plus marked exposure, recomputed.
    #[must_use]
    pub fn equity(&self) -> Price {
        let account = self.account.lock().expect("account poisoned");
        let book = self.book.lock().expect("book poisoned");
        let marks = self.marks.lock().expect("marks poisoned");
        account.total_value(&book, &marks)
    }

    /// Persist durable singletons and flush journals.
    pub fn shutdown(&self) -> EngineResult<()> {
        let mut status = self.status.lock().expect("status poisoned").clone();
        status.running = false;
        self.history.save_engine_status(&status)?;
        let strategy = self.strategy.read().expect("strategy poisoned").clone();
        self.history.save_strategy_state(&strategy)?;
        self.history.close()?;
        info!("engine shut down cleanly");
        Ok(())
    }

    fn snapshot(&self, symbol: &str, now: DateTime<Utc>) -> PositionSnapshot {
        let balance = self.balance();
        let (position_size, avg_entry) = {
            let book = self.book.lock().expect("book poisoned");
            (book.holdings(symbol), book.avg_entry(symbol))
        };
        PositionSnapshot {
            timestamp: now,
            symbol: symbol.to_string(),
            balance: round_price(balance),
            position_size: round_size(position_size),
            avg_entry_price: round_price(avg_entry),
            total_portfolio_value: round_price(self.equity()),
        }
    }

    fn latest_atr_pct(&self, symbol: &str) -> f64 {
        let symbols = self.symbols.lock().expect("symbol map poisoned");
        symbols
            .get(symbol)
            .and_then(|state| {
                let close = state
                    .candles
                    .back()
                    .and_then(|candle| candle.close.to_f64())?;
                let ready = state.last_ready?;
                Some(ready.atr / close.max(f64::MIN_POSITIVE))
            })
            .unwrap_or(0.004)
    }

    fn bump_status(&self, mutate: impl FnOnce(&mut EngineStatus)) {
        let mut status = self.status.lock().expect("status poisoned");
        mutate(&mut status);
        debug_assert!(status.counters_consistent());
    }

    fn push_training_log(&self, entry: TrainingLogEntry) {
        let mut log = self.training_log.lock().expect("training log poisoned");
        log.push_back(entry);
        while log.len() > self.config.training_log_limit {
            log.pop_front();
        }
    }
}
