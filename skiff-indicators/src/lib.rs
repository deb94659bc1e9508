//! Incremental, causal indicators.
//!
//! Every indicator consumes bars strictly in order and never reads future
//! data. Values stay unavailable until the full seed window has been
//! observed; the per-symbol [`IndicatorSet`] surfaces that distinction as
//! an explicit [`Gauge`] so evaluators can refuse to score early.

use std::collections::VecDeque;

use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use skiff_core::Candle;
use thiserror::Error;

/// Common configuration errors emitted by indicators.
#[derive(Debug, Error, PartialEq)]
pub enum IndicatorError {
    /// Returned when a period of zero is provided.
    #[error("{name} requires period > 0 (got {period})")]
    InvalidPeriod { name: &'static str, period: usize },
}

impl IndicatorError {
    fn invalid_period(name: &'static str, period: usize) -> Self {
        Self::InvalidPeriod { name, period }
    }
}

/// Core abstraction implemented by every indicator in the crate.
pub trait Indicator {
    /// Input type accepted by the indicator.
    type Input;
    /// Value produced once the seed window is filled.
    type Output;

    /// Consumes a new data point and returns the most recent value, if any.
    fn next(&mut self, input: Self::Input) -> Option<Self::Output>;

    /// Resets the indicator to its initial state.
    fn reset(&mut self);
}

/// Exponential moving average seeded with an SMA over the first `period`
/// inputs.
#[derive(Clone, Debug)]
pub struct Ema {
    period: usize,
    alpha: f64,
    seed_sum: f64,
    seen: usize,
    value: Option<f64>,
}

impl Ema {
    pub fn new(period: usize) -> Result<Self, IndicatorError> {
        if period == 0 {
            return Err(IndicatorError::invalid_period("Ema", period));
        }
        Ok(Self {
            period,
            alpha: 2.0 / (period as f64 + 1.0),
            seed_sum: 0.0,
            seen: 0,
            value: None,
        })
    }
}

impl Indicator for Ema {
    type Input = f64;
    type Output = f64;

    fn next(&mut self, input: f64) -> Option<f64> {
        match self.value {
            Some(prev) => {
                let next = (input - prev) * self.alpha + prev;
                self.value = Some(next);
            }
            None => {
                self.seed_sum += input;
                self.seen += 1;
                if self.seen == self.period {
                    self.value = Some(self.seed_sum / self.period as f64);
                }
            }
        }
        self.value
    }

    fn reset(&mut self) {
        self.seed_sum = 0.0;
        self.seen = 0;
        self.value = None;
    }
}

/// Relative strength index with Wilder smoothing of up/down deltas.
#[derive(Clone, Debug)]
pub struct Rsi {
    period: usize,
    prev_close: Option<f64>,
    gain_sum: f64,
    loss_sum: f64,
    deltas_seen: usize,
    avg_gain: Option<f64>,
    avg_loss: f64,
}

impl Rsi {
    pub fn new(period: usize) -> Result<Self, IndicatorError> {
        if period == 0 {
            return Err(IndicatorError::invalid_period("Rsi", period));
        }
        Ok(Self {
            period,
            prev_close: None,
            gain_sum: 0.0,
            loss_sum: 0.0,
            deltas_seen: 0,
            avg_gain: None,
            avg_loss: 0.0,
        })
    }

    fn value(&self) -> Option<f64> {
        let avg_gain = self.avg_gain?;
        if self.avg_loss == 0.0 {
            return Some(100.0);
        }
        let rs = avg_gain / self.avg_loss;
        Some(100.0 - 100.0 / (1.0 + rs))
    }
}

impl Indicator for Rsi {
    type Input = f64;
    type Output = f64;

    fn next(&mut self, input: f64) -> Option<f64> {
        let prev = match self.prev_close.replace(input) {
            Some(prev) => prev,
            None => return None,
        };
        let delta = input - prev;
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        match self.avg_gain {
            Some(avg_gain) => {
                let n = self.period as f64;
                self.avg_gain = Some((avg_gain * (n - 1.0) + gain) / n);
                self.avg_loss = (self.avg_loss * (n - 1.0) + loss) / n;
            }
            None => {
                self.gain_sum += gain;
                self.loss_sum += loss;
                self.deltas_seen += 1;
                if self.deltas_seen == self.period {
                    self.avg_gain = Some(self.gain_sum / self.period as f64);
                    self.avg_loss = self.loss_sum / self.period as f64;
                }
            }
        }
        self.value()
    }

    fn reset(&mut self) {
        self.prev_close = None;
        self.gain_sum = 0.0;
        self.loss_sum = 0.0;
        self.deltas_seen = 0;
        self.avg_gain = None;
        self.avg_loss = 0.0;
    }
}

/// Average true range with Wilder smoothing.
#[derive(Clone, Debug)]
pub struct Atr {
    period: usize,
    prev_close: Option<f64>,
    seed_sum: f64,
    seen: usize,
    value: Option<f64>,
}

impl Atr {
    pub fn new(period: usize) -> Result<Self, IndicatorError> {
        if period == 0 {
            return Err(IndicatorError::invalid_period("Atr", period));
        }
        Ok(Self {
            period,
            prev_close: None,
            seed_sum: 0.0,
            seen: 0,
            value: None,
        })
    }

    fn true_range(&self, high: f64, low: f64) -> f64 {
        match self.prev_close {
            None => high - low,
            Some(pc) => (high - low).max((high - pc).abs()).max((low - pc).abs()),
        }
    }
}

/// Bar inputs needed by range-based indicators.
#[derive(Clone, Copy, Debug)]
pub struct BarInput {
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl From<&Candle> for BarInput {
    fn from(candle: &Candle) -> Self {
        Self {
            high: candle.high.to_f64().unwrap_or_default(),
            low: candle.low.to_f64().unwrap_or_default(),
            close: candle.close.to_f64().unwrap_or_default(),
        }
    }
}

impl Indicator for Atr {
    type Input = BarInput;
    type Output = f64;

    fn next(&mut self, bar: BarInput) -> Option<f64> {
        let tr = self.true_range(bar.high, bar.low);
        self.prev_close = Some(bar.close);
        match self.value {
            Some(prev) => {
                let n = self.period as f64;
                self.value = Some((prev * (n - 1.0) + tr) / n);
            }
            None => {
                self.seed_sum += tr;
                self.seen += 1;
                if self.seen == self.period {
                    self.value = Some(self.seed_sum / self.period as f64);
                }
            }
        }
        self.value
    }

    fn reset(&mut self) {
        self.prev_close = None;
        self.seed_sum = 0.0;
        self.seen = 0;
        self.value = None;
    }
}

/// Output of the rolling volume average: the mean and the current ratio.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VolumeReading {
    pub sma: f64,
    pub ratio: f64,
}

/// Rolling simple moving average of bar volume.
#[derive(Clone, Debug)]
pub struct VolumeSma {
    period: usize,
    window: VecDeque<f64>,
    sum: f64,
}

impl VolumeSma {
    pub fn new(period: usize) -> Result<Self, IndicatorError> {
        if period == 0 {
            return Err(IndicatorError::invalid_period("VolumeSma", period));
        }
        Ok(Self {
            period,
            window: VecDeque::with_capacity(period),
            sum: 0.0,
        })
    }
}

impl Indicator for VolumeSma {
    type Input = f64;
    type Output = VolumeReading;

    fn next(&mut self, volume: f64) -> Option<VolumeReading> {
        self.window.push_back(volume);
        self.sum += volume;
        if self.window.len() > self.period {
            if let Some(evicted) = self.window.pop_front() {
                self.sum -= evicted;
            }
        }
        if self.window.len() < self.period {
            return None;
        }
        let sma = self.sum / self.period as f64;
        let ratio = if sma == 0.0 { 0.0 } else { volume / sma };
        Some(VolumeReading { sma, ratio })
    }

    fn reset(&mut self) {
        self.window.clear();
        self.sum = 0.0;
    }
}

/// MACD line, signal line and histogram.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MacdOutput {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Moving average convergence/divergence (EMA fast − EMA slow, with an EMA
/// signal line over the MACD value).
#[derive(Clone, Debug)]
pub struct Macd {
    fast: Ema,
    slow: Ema,
    signal: Ema,
}

impl Macd {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Result<Self, IndicatorError> {
        Ok(Self {
            fast: Ema::new(fast)?,
            slow: Ema::new(slow)?,
            signal: Ema::new(signal)?,
        })
    }
}

impl Indicator for Macd {
    type Input = f64;
    type Output = MacdOutput;

    fn next(&mut self, input: f64) -> Option<MacdOutput> {
        let fast = self.fast.next(input);
        let slow = self.slow.next(input);
        let (fast, slow) = match (fast, slow) {
            (Some(fast), Some(slow)) => (fast, slow),
            _ => return None,
        };
        let macd = fast - slow;
        let signal = self.signal.next(macd)?;
        Some(MacdOutput {
            macd,
            signal,
            histogram: macd - signal,
        })
    }

    fn reset(&mut self) {
        self.fast.reset();
        self.slow.reset();
        self.signal.reset();
    }
}

/// A window that is either still filling or carries a usable value.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Gauge {
    Seeding { observed: usize },
    Ready { value: f64 },
}

impl Gauge {
    /// The value, if the window has filled.
    #[must_use]
    pub fn value(self) -> Option<f64> {
        match self {
            Self::Ready { value } => Some(value),
            Self::Seeding { .. } => None,
        }
    }

    fn from_option(value: Option<f64>, observed: usize) -> Self {
        match value {
            Some(value) => Self::Ready { value },
            None => Self::Seeding { observed },
        }
    }
}

/// All indicator readings taken after one closed bar.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct IndicatorSnapshot {
    pub ema_short: Gauge,
    pub ema_long: Gauge,
    pub rsi: Gauge,
    pub prev_rsi: Option<f64>,
    pub atr: Gauge,
    pub volume_sma: Gauge,
    pub volume_ratio: Option<f64>,
    pub macd: Gauge,
    pub macd_signal: Gauge,
}

/// Fully-seeded view of a snapshot; produced only when every window is
/// ready.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReadyIndicators {
    pub ema_short: f64,
    pub ema_long: f64,
    pub rsi: f64,
    pub prev_rsi: f64,
    pub atr: f64,
    pub volume_sma: f64,
    pub volume_ratio: f64,
    pub macd: f64,
    pub macd_signal: f64,
}

impl IndicatorSnapshot {
    /// Collapse the snapshot into plain readings, or `None` while any
    /// window is still seeding.
    #[must_use]
    pub fn ready(&self) -> Option<ReadyIndicators> {
        let rsi = self.rsi.value()?;
        Some(ReadyIndicators {
            ema_short: self.ema_short.value()?,
            ema_long: self.ema_long.value()?,
            rsi,
            prev_rsi: self.prev_rsi.unwrap_or(rsi),
            atr: self.atr.value()?,
            volume_sma: self.volume_sma.value()?,
            volume_ratio: self.volume_ratio.unwrap_or(1.0),
            macd: self.macd.value()?,
            macd_signal: self.macd_signal.value()?,
        })
    }
}

/// Stateful per-symbol indicator collection driven by closed bars.
pub struct IndicatorSet {
    ema_short: Ema,
    ema_long: Ema,
    rsi: Rsi,
    atr: Atr,
    volume: VolumeSma,
    macd: Macd,
    bars_seen: usize,
    prev_rsi: Option<f64>,
}

/// Default periods used by the evaluation pipeline.
pub const EMA_SHORT_PERIOD: usize = 9;
pub const EMA_LONG_PERIOD: usize = 21;
pub const RSI_PERIOD: usize = 14;
pub const ATR_PERIOD: usize = 14;
pub const VOLUME_SMA_PERIOD: usize = 20;

impl IndicatorSet {
    /// Build the standard set: EMA(9, 21), RSI(14), ATR(14), volume
    /// SMA(20), MACD(12, 26, 9).
    pub fn standard() -> Result<Self, IndicatorError> {
        Ok(Self {
            ema_short: Ema::new(EMA_SHORT_PERIOD)?,
            ema_long: Ema::new(EMA_LONG_PERIOD)?,
            rsi: Rsi::new(RSI_PERIOD)?,
            atr: Atr::new(ATR_PERIOD)?,
            volume: VolumeSma::new(VOLUME_SMA_PERIOD)?,
            macd: Macd::new(12, 26, 9)?,
            bars_seen: 0,
            prev_rsi: None,
        })
    }

    /// Advance every window with one closed bar.
    pub fn update(&mut self, candle: &Candle) -> IndicatorSnapshot {
        let close = candle.close.to_f64().unwrap_or_default();
        let volume = candle.volume.to_f64().unwrap_or_default();
        self.bars_seen += 1;
        let observed = self.bars_seen;

        let prev_rsi = self.prev_rsi;
        let rsi = self.rsi.next(close);
        self.prev_rsi = rsi;

        let reading = self.volume.next(volume);
        let macd = self.macd.next(close);
        IndicatorSnapshot {
            ema_short: Gauge::from_option(self.ema_short.next(close), observed),
            ema_long: Gauge::from_option(self.ema_long.next(close), observed),
            rsi: Gauge::from_option(rsi, observed),
            prev_rsi,
            atr: Gauge::from_option(self.atr.next(BarInput::from(candle)), observed),
            volume_sma: Gauge::from_option(reading.map(|r| r.sma), observed),
            volume_ratio: reading.map(|r| r.ratio),
            macd: Gauge::from_option(macd.map(|m| m.macd), observed),
            macd_signal: Gauge::from_option(macd.map(|m| m.signal), observed),
        }
    }

    /// Number of bars consumed so far.
    #[must_use]
    pub fn bars_seen(&self) -> usize {
        self.bars_seen
    }

    /// Discard all state, e.g. after a data-quality reset.
    pub fn reset(&mut self) {
        self.ema_short.reset();
        self.ema_long.reset();
        self.rsi.reset();
        self.atr.reset();
        self.volume.reset();
        self.macd.reset();
        self.bars_seen = 0;
        self.prev_rsi = None;
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use rust_decimal::prelude::FromPrimitive;
    use rust_decimal::Decimal;
    use skiff_core::Interval;

    use super::*;

    fn candle(i: usize, close: f64) -> Candle {
        Candle {
            symbol: "BTC-USDC".into(),
            interval: Interval::OneMinute,
            open: Decimal::from_f64(close - 1.0).unwrap(),
            high: Decimal::from_f64(close + 2.0).unwrap(),
            low: Decimal::from_f64(close - 2.0).unwrap(),
            close: Decimal::from_f64(close).unwrap(),
            volume: Decimal::from(100),
            timestamp: Utc::now() + Duration::minutes(i as i64),
        }
    }

    #[test]
    fn ema_seeds_with_simple_average() {
        let mut ema = Ema::new(3).unwrap();
        assert_eq!(ema.next(1.0), None);
        assert_eq!(ema.next(2.0), None);
        assert_eq!(ema.next(3.0), Some(2.0));
        // alpha = 0.5 -> (6 - 2) * 0.5 + 2
        assert_eq!(ema.next(6.0), Some(4.0));
    }

    #[test]
    fn rsi_handles_constant_input() {
        let mut rsi = Rsi::new(14).unwrap();
        let mut last = None;
        for _ in 0..=14 {
            last = rsi.next(1.0);
        }
        assert_eq!(last, Some(100.0));
    }

    #[test]
    fn rsi_is_bounded_for_mixed_input() {
        let mut rsi = Rsi::new(14).unwrap();
        let mut last = None;
        for i in 0..60 {
            let close = 100.0 + ((i * 7) % 13) as f64 - 6.0;
            last = rsi.next(close);
        }
        let value = last.unwrap();
        assert!((0.0..=100.0).contains(&value));
    }

    #[test]
    fn atr_of_constant_range_equals_range() {
        let mut atr = Atr::new(14).unwrap();
        let mut last = None;
        for i in 0..30 {
            last = atr.next(BarInput {
                high: 102.0,
                low: 98.0,
                close: 100.0,
                // keep the close fixed so true range stays the bar range
            });
            if i < 13 {
                assert_eq!(last, None);
            }
        }
        assert!((last.unwrap() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn volume_ratio_reflects_spikes() {
        let mut vol = VolumeSma::new(4).unwrap();
        for _ in 0..3 {
            assert_eq!(vol.next(10.0), None);
        }
        let steady = vol.next(10.0).unwrap();
        assert!((steady.ratio - 1.0).abs() < 1e-12);
        let spike = vol.next(40.0).unwrap();
        assert!(spike.ratio > 2.0);
    }

    #[test]
    fn indicator_set_refuses_until_all_windows_fill() {
        let mut set = IndicatorSet::standard().unwrap();
        let mut snapshot = None;
        for i in 0..33 {
            snapshot = Some(set.update(&candle(i, 100.0 + i as f64)));
            if i < 30 {
                assert!(snapshot.as_ref().unwrap().ready().is_none());
            }
        }
        // MACD needs slow(26) + signal(9) - 1 = 34 bars.
        assert!(snapshot.unwrap().ready().is_none());
        let snapshot = set.update(&candle(33, 134.0));
        let ready = snapshot.ready().expect("all windows filled");
        assert!(ready.ema_short > ready.ema_long);
        assert!(ready.atr > 0.0);
    }

    #[test]
    fn seeding_gauge_reports_observations() {
        let mut set = IndicatorSet::standard().unwrap();
        let snapshot = set.update(&candle(0, 100.0));
        assert_eq!(snapshot.rsi, Gauge::Seeding { observed: 1 });
        assert_eq!(snapshot.rsi.value(), None);
    }
}
