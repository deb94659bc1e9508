//! Bounded per-symbol bar buffer with timestamp reconciliation.

use std::collections::VecDeque;

use skiff_core::{Candle, Interval, Symbol};
use tracing::warn;

/// What happened to a bar handed to [`SymbolBuffer::ingest`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IngestOutcome {
    /// A new bar was appended at the tail.
    Appended,
    /// A bar with an identical timestamp was replaced in place (backfill
    /// reconciliation path).
    Replaced,
    /// The bar predates the newest buffered bar and was discarded.
    DroppedStale,
    /// The bar failed structural validation and was discarded.
    DroppedInvalid,
}

impl IngestOutcome {
    /// True when the buffer now exposes this bar as its newest close.
    #[must_use]
    pub fn advanced(self) -> bool {
        matches!(self, Self::Appended)
    }
}

/// Ring of the most recent closed bars plus the in-progress trailing bar.
pub struct SymbolBuffer {
    symbol: Symbol,
    interval: Interval,
    max_bars: usize,
    bars: VecDeque<Candle>,
    trailing: Option<Candle>,
}

impl SymbolBuffer {
    pub fn new(symbol: Symbol, interval: Interval, max_bars: usize) -> Self {
        let max_bars = max_bars.max(1);
        Self {
            symbol,
            interval,
            max_bars,
            bars: VecDeque::with_capacity(max_bars),
            trailing: None,
        }
    }

    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    #[must_use]
    pub fn interval(&self) -> Interval {
        self.interval
    }

    /// Insert one closed bar, upserting on identical timestamps and
    /// refusing to travel backwards.
    pub fn ingest(&mut self, candle: Candle) -> IngestOutcome {
        if let Err(err) = candle.validate() {
            warn!(symbol = %self.symbol, error = %err, "dropping invalid bar");
            return IngestOutcome::DroppedInvalid;
        }
        if let Some(last) = self.bars.back() {
            if candle.timestamp < last.timestamp {
                warn!(
                    symbol = %self.symbol,
                    bar_ts = %candle.timestamp,
                    latest_ts = %last.timestamp,
                    "dropping non-monotone bar"
                );
                return IngestOutcome::DroppedStale;
            }
            if candle.timestamp == last.timestamp {
                *self.bars.back_mut().expect("non-empty buffer") = candle;
                return IngestOutcome::Replaced;
            }
        }
        // A freshly closed bar supersedes any trailing partial for it.
        if let Some(trailing) = &self.trailing {
            if trailing.timestamp <= candle.timestamp {
                self.trailing = None;
            }
        }
        if self.bars.len() == self.max_bars {
            self.bars.pop_front();
        }
        self.bars.push_back(candle);
        IngestOutcome::Appended
    }

    /// Reconcile a batch of backfilled bars; older duplicates are upserted
    /// by timestamp, anything new is appended in order.
    pub fn reconcile(&mut self, mut backfill: Vec<Candle>) -> usize {
        backfill.sort_by_key(|bar| bar.timestamp);
        let mut appended = 0;
        for bar in backfill {
            if bar.validate().is_err() {
                continue;
            }
            if let Some(existing) = self
                .bars
                .iter_mut()
                .find(|known| known.timestamp == bar.timestamp)
            {
                *existing = bar;
                continue;
            }
            if self.ingest(bar) == IngestOutcome::Appended {
                appended += 1;
            }
        }
        appended
    }

    /// Replace the in-progress bar from a partial tick.
    pub fn update_trailing(&mut self, candle: Candle) {
        if candle.validate().is_ok() {
            self.trailing = Some(candle);
        }
    }

    /// Restartable snapshot of the buffered closed bars, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Candle> {
        self.bars.iter().cloned().collect()
    }

    /// Newest closed bar, if any.
    #[must_use]
    pub fn latest(&self) -> Option<&Candle> {
        self.bars.back()
    }

    /// The in-progress bar, if a partial tick arrived since the last close.
    #[must_use]
    pub fn trailing(&self) -> Option<&Candle> {
        self.trailing.as_ref()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::*;

    fn bar(minute: i64, close: i64) -> Candle {
        Candle {
            symbol: "BTC-USDC".into(),
            interval: Interval::OneMinute,
            open: Decimal::from(close - 1),
            high: Decimal::from(close + 5),
            low: Decimal::from(close - 5),
            close: Decimal::from(close),
            volume: Decimal::from(10),
            timestamp: Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
                + Duration::minutes(minute),
        }
    }

    #[test]
    fn appends_in_order_and_caps_capacity() {
        let mut buffer = SymbolBuffer::new("BTC-USDC".into(), Interval::OneMinute, 3);
        for minute in 0..5 {
            assert_eq!(buffer.ingest(bar(minute, 100 + minute)), IngestOutcome::Appended);
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.snapshot()[0].close, Decimal::from(102));
    }

    #[test]
    fn identical_timestamp_upserts_in_place() {
        let mut buffer = SymbolBuffer::new("BTC-USDC".into(), Interval::OneMinute, 10);
        buffer.ingest(bar(0, 100));
        assert_eq!(buffer.ingest(bar(0, 101)), IngestOutcome::Replaced);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.latest().unwrap().close, Decimal::from(101));
    }

    #[test]
    fn older_bars_are_dropped() {
        let mut buffer = SymbolBuffer::new("BTC-USDC".into(), Interval::OneMinute, 10);
        buffer.ingest(bar(2, 100));
        assert_eq!(buffer.ingest(bar(1, 99)), IngestOutcome::DroppedStale);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn invalid_bars_do_not_enter_the_buffer() {
        let mut buffer = SymbolBuffer::new("BTC-USDC".into(), Interval::OneMinute, 10);
        let mut broken = bar(0, 100);
        broken.low = Decimal::from(200);
        assert_eq!(buffer.ingest(broken), IngestOutcome::DroppedInvalid);
        assert!(buffer.is_empty());
    }

    #[test]
    fn reconcile_merges_missed_closes() {
        let mut buffer = SymbolBuffer::new("BTC-USDC".into(), Interval::OneMinute, 10);
        buffer.ingest(bar(0, 100));
        buffer.ingest(bar(1, 101));
        // Bar 1 revised, bars 2 and 3 missed during the disconnect.
        let appended = buffer.reconcile(vec![bar(3, 104), bar(1, 150), bar(2, 103)]);
        assert_eq!(appended, 2);
        let closes: Vec<_> = buffer.snapshot().iter().map(|b| b.close).collect();
        assert_eq!(
            closes,
            vec![
                Decimal::from(100),
                Decimal::from(150),
                Decimal::from(103),
                Decimal::from(104)
            ]
        );
    }

    #[test]
    fn closing_a_bar_clears_the_trailing_partial() {
        let mut buffer = SymbolBuffer::new("BTC-USDC".into(), Interval::OneMinute, 10);
        buffer.update_trailing(bar(0, 99));
        assert!(buffer.trailing().is_some());
        buffer.ingest(bar(0, 100));
        assert!(buffer.trailing().is_none());
    }
}
