//! Fundamental data types shared across the entire workspace.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod events;

pub use events::{Event, EventBus};

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for quantity precision.
pub type Quantity = Decimal;
/// Alias used for human-readable market symbols (e.g., `BTC-USDC`).
pub type Symbol = String;

/// Decimal places retained for prices at store boundaries.
pub const PRICE_DP: u32 = 6;
/// Decimal places retained for sizes at store boundaries.
pub const SIZE_DP: u32 = 8;

/// Round a price to the persisted precision.
#[must_use]
pub fn round_price(value: Price) -> Price {
    value.round_dp(PRICE_DP)
}

/// Round a quantity to the persisted precision.
#[must_use]
pub fn round_size(value: Quantity) -> Quantity {
    value.round_dp(SIZE_DP)
}

/// Canonicalize an exchange symbol code into the `BASE-USDC` convention.
///
/// Both `BTCUSDT` and `BTC-USDC` style codes collapse onto `BTC-USDC`;
/// anything else is returned uppercased but otherwise untouched.
#[must_use]
pub fn normalize_symbol(code: &str) -> Symbol {
    let upper = code.trim().to_ascii_uppercase().replace('-', "");
    for quote in ["USDT", "USDC"] {
        if let Some(base) = upper.strip_suffix(quote) {
            if !base.is_empty() {
                return format!("{base}-USDC");
            }
        }
    }
    code.trim().to_ascii_uppercase()
}

/// Enumerates the venues an adapter can represent.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VenueId {
    Binance,
    Kucoin,
    Bybit,
}

impl VenueId {
    /// Stable lowercase identifier used in logs and journal records.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Kucoin => "kucoin",
            Self::Bybit => "bybit",
        }
    }
}

impl fmt::Display for VenueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interval granularity used when aggregating ticks into candles.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Interval {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    OneHour,
    FourHours,
    OneDay,
}

impl Interval {
    /// Convert the interval into a chrono `Duration`.
    #[must_use]
    pub fn as_duration(self) -> Duration {
        match self {
            Self::OneMinute => Duration::minutes(1),
            Self::FiveMinutes => Duration::minutes(5),
            Self::FifteenMinutes => Duration::minutes(15),
            Self::OneHour => Duration::hours(1),
            Self::FourHours => Duration::hours(4),
            Self::OneDay => Duration::days(1),
        }
    }

    /// Canonical label used in journal records and exchange requests.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::OneHour => "1h",
            Self::FourHours => "4h",
            Self::OneDay => "1d",
        }
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "1m" | "1min" | "1minute" => Ok(Self::OneMinute),
            "5m" | "5min" => Ok(Self::FiveMinutes),
            "15m" | "15min" => Ok(Self::FifteenMinutes),
            "1h" | "60m" | "1hour" => Ok(Self::OneHour),
            "4h" | "240m" => Ok(Self::FourHours),
            "1d" | "day" | "d" => Ok(Self::OneDay),
            other => Err(format!("unsupported interval '{other}'")),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Raised when a bar fails structural validation.
#[derive(Debug, Error, PartialEq)]
pub enum CandleError {
    #[error("{symbol}@{timestamp}: low {low} above high {high}")]
    InvertedRange {
        symbol: Symbol,
        timestamp: DateTime<Utc>,
        low: Price,
        high: Price,
    },
    #[error("{symbol}@{timestamp}: {field} {value} outside [{low}, {high}]")]
    PriceOutOfRange {
        symbol: Symbol,
        timestamp: DateTime<Utc>,
        field: &'static str,
        value: Price,
        low: Price,
        high: Price,
    },
    #[error("{symbol}@{timestamp}: negative volume {volume}")]
    NegativeVolume {
        symbol: Symbol,
        timestamp: DateTime<Utc>,
        volume: Quantity,
    },
}

/// Aggregated OHLCV bar data.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Candle {
    pub symbol: Symbol,
    pub interval: Interval,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: Quantity,
    pub timestamp: DateTime<Utc>,
}

impl Candle {
    /// Check the structural bar invariants (`low <= open,close <= high`).
    pub fn validate(&self) -> Result<(), CandleError> {
        if self.low > self.high {
            return Err(CandleError::InvertedRange {
                symbol: self.symbol.clone(),
                timestamp: self.timestamp,
                low: self.low,
                high: self.high,
            });
        }
        for (field, value) in [("open", self.open), ("close", self.close)] {
            if value < self.low || value > self.high {
                return Err(CandleError::PriceOutOfRange {
                    symbol: self.symbol.clone(),
                    timestamp: self.timestamp,
                    field,
                    value,
                    low: self.low,
                    high: self.high,
                });
            }
        }
        if self.volume < Decimal::ZERO {
            return Err(CandleError::NegativeVolume {
                symbol: self.symbol.clone(),
                timestamp: self.timestamp,
                volume: self.volume,
            });
        }
        Ok(())
    }
}

/// The side of an order or position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Returns the opposite side (buy <-> sell).
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Signed direction used by the fill model (+1 buy, -1 sell).
    #[must_use]
    pub fn direction(self) -> i8 {
        match self {
            Self::Buy => 1,
            Self::Sell => -1,
        }
    }

    /// Stable label used in idempotency keys and journals.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discrete action produced by each evaluation.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl SignalAction {
    /// The order side this action maps to, when it maps to one at all.
    #[must_use]
    pub fn side(self) -> Option<Side> {
        match self {
            Self::Buy => Some(Side::Buy),
            Self::Sell => Some(Side::Sell),
            Self::Hold => None,
        }
    }
}

/// Coarse market state label attached to every decision.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    TrendingUp,
    TrendingDown,
    Ranging,
    Chop,
    HighVolatility,
}

/// Headline market state surfaced in the training log.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketStatus {
    Active,
    LowVolatility,
}

impl From<Regime> for MarketStatus {
    fn from(regime: Regime) -> Self {
        match regime {
            Regime::Chop => Self::LowVolatility,
            _ => Self::Active,
        }
    }
}

/// One record per evaluation tick, appended to the decisions journal.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Decision {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub symbol: Symbol,
    pub timeframe: Interval,
    pub action: SignalAction,
    pub confidence: f64,
    pub regime: Regime,
    pub reasons: Vec<String>,
    pub model_version: u64,
    pub inputs_hash: String,
}

/// Lifecycle states of a submitted order.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Accepted,
    Skipped,
    Rejected,
    Filled,
}

/// Append-only order record; `idempotency_key` is unique across
/// non-skipped orders.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Order {
    pub id: Uuid,
    pub decision_id: Uuid,
    pub idempotency_key: String,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Quantity,
    pub requested_price: Price,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

/// Build the stable idempotency key for an order submission.
#[must_use]
pub fn idempotency_key(
    symbol: &str,
    timeframe: Interval,
    decision_ts: DateTime<Utc>,
    side: Side,
) -> String {
    format!(
        "{symbol}|{}|{}|{}",
        timeframe.label(),
        decision_ts.timestamp_millis(),
        side.as_str()
    )
}

/// Execution information emitted whenever an order is filled.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Fill {
    pub id: Uuid,
    pub order_id: Uuid,
    pub symbol: Symbol,
    pub side: Side,
    pub avg_price: Price,
    pub quantity: Quantity,
    pub fee: Price,
    pub timestamp: DateTime<Utc>,
}

/// Deterministic cost breakdown produced by the execution simulator.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ExecutionSimulation {
    pub spread: Price,
    pub slippage: Price,
    pub fee_rate: f64,
    pub fill_price: Price,
    pub seed: u64,
}

/// Why a position slice was closed.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Signal,
    Manual,
}

/// Immutable trade record derived from a fill; SELL trades carry realized
/// PnL and an R-multiple.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Trade {
    pub id: Uuid,
    pub decision_id: Option<Uuid>,
    pub arbitrage_id: Option<Uuid>,
    pub symbol: Symbol,
    pub side: Side,
    pub price: Price,
    pub quantity: Quantity,
    pub fee: Price,
    pub pnl: Option<Price>,
    pub r_multiple: Option<f64>,
    pub exit_reason: Option<ExitReason>,
    pub simulation: Option<ExecutionSimulation>,
    pub timestamp: DateTime<Utc>,
}

/// Raised when lot construction violates a structural invariant.
#[derive(Debug, Error, PartialEq)]
pub enum LotError {
    #[error("lot quantity must be positive (got {0})")]
    NonPositiveQuantity(Quantity),
    #[error("long lot requires stop {stop} < entry {entry} < target {target}")]
    InvertedBrackets {
        stop: Price,
        entry: Price,
        target: Price,
    },
}

/// A single open position slice with its own brackets and entry economics.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Lot {
    pub id: Uuid,
    pub symbol: Symbol,
    pub entry_price: Price,
    pub quantity: Quantity,
    pub stop_loss: Price,
    pub take_profit: Price,
    pub opened_at: DateTime<Utc>,
    pub initial_risk_per_unit: Price,
    pub entry_fee_per_unit: Price,
    pub strategy_version: u64,
}

impl Lot {
    /// Construct a long lot, enforcing `quantity > 0` and
    /// `stop_loss < entry_price < take_profit`.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        symbol: Symbol,
        entry_price: Price,
        quantity: Quantity,
        stop_loss: Price,
        take_profit: Price,
        opened_at: DateTime<Utc>,
        entry_fee: Price,
        strategy_version: u64,
    ) -> Result<Self, LotError> {
        if quantity <= Decimal::ZERO {
            return Err(LotError::NonPositiveQuantity(quantity));
        }
        if !(stop_loss < entry_price && entry_price < take_profit) {
            return Err(LotError::InvertedBrackets {
                stop: stop_loss,
                entry: entry_price,
                target: take_profit,
            });
        }
        Ok(Self {
            id: Uuid::new_v4(),
            symbol,
            entry_price,
            quantity,
            stop_loss,
            take_profit,
            opened_at,
            initial_risk_per_unit: entry_price - stop_loss,
            entry_fee_per_unit: entry_fee / quantity,
            strategy_version,
        })
    }

    /// Notional value of the lot at its entry price.
    #[must_use]
    pub fn entry_notional(&self) -> Price {
        self.entry_price * self.quantity
    }
}

/// Periodic snapshot of a symbol's position and portfolio totals.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PositionSnapshot {
    pub timestamp: DateTime<Utc>,
    pub symbol: Symbol,
    pub balance: Price,
    pub position_size: Quantity,
    pub avg_entry_price: Price,
    pub total_portfolio_value: Price,
}

/// Process-wide engine status surfaced to operators.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub evaluations: u64,
    pub signals: u64,
    pub trades_executed: u64,
    pub open_positions: u64,
    pub auto_paper: bool,
    pub confidence_threshold: f64,
}

impl EngineStatus {
    /// Fresh status for a just-started engine.
    #[must_use]
    pub fn started(auto_paper: bool, confidence_threshold: f64) -> Self {
        Self {
            running: true,
            last_heartbeat: Utc::now(),
            evaluations: 0,
            signals: 0,
            trades_executed: 0,
            open_positions: 0,
            auto_paper,
            confidence_threshold,
        }
    }

    /// Counter invariant maintained by the engine: an order implies a
    /// signal, a signal implies an evaluation.
    #[must_use]
    pub fn counters_consistent(&self) -> bool {
        self.trades_executed <= self.signals && self.signals <= self.evaluations
    }
}

/// Entry appended to the in-memory training log after every engine cycle.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TrainingLogEntry {
    pub timestamp: DateTime<Utc>,
    pub symbol: Symbol,
    pub action: SignalAction,
    pub market_status: MarketStatus,
    pub score: f64,
    pub confidence: f64,
}
