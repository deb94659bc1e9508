//! FIFO position accounting.
//!
//! Lots are kept per symbol in insertion order; consuming walks that order
//! (or a single targeted lot) and reports the weighted economics of the
//! consumed slice. Holdings and average entry are recomputed from the
//! surviving lots after every mutation and collapse to zero below the dust
//! threshold.

use std::collections::{HashMap, VecDeque};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use skiff_core::{ExitReason, Lot, Price, Quantity, Symbol};
use thiserror::Error;
use uuid::Uuid;

/// Result alias for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Ledger-specific error type.
#[derive(Debug, Error, PartialEq)]
pub enum LedgerError {
    /// Raised when a consume references a symbol with no open lots.
    #[error("no open position for {0}")]
    UnknownSymbol(Symbol),
    /// Raised when a targeted lot id is not open for the symbol.
    #[error("unknown lot {0}")]
    UnknownLot(Uuid),
    /// Raised when a consume asks for more than is held.
    #[error("insufficient holdings: requested {requested}, available {available}")]
    InsufficientHoldings {
        requested: Quantity,
        available: Quantity,
    },
}

/// Holdings below this are treated as fully closed.
pub const DUST_THRESHOLD: Decimal = Decimal::from_parts(1, 0, 0, false, 6);

/// Weighted economics of the slice removed by one consume call.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ConsumedSlice {
    pub quantity: Quantity,
    pub entry_price: Price,
    pub initial_risk_per_unit: Price,
    pub entry_fee_per_unit: Price,
    pub lot_ids: Vec<Uuid>,
}

/// An exit the auto-scan wants to execute.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExitTrigger {
    pub lot_id: Uuid,
    pub quantity: Quantity,
    pub reason: ExitReason,
    pub exit_price: Price,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
struct SymbolPosition {
    lots: VecDeque<Lot>,
    holdings: Quantity,
    avg_entry: Price,
}

impl SymbolPosition {
    fn recompute(&mut self) {
        let total: Quantity = self.lots.iter().map(|lot| lot.quantity).sum();
        if total < DUST_THRESHOLD {
            self.lots.clear();
            self.holdings = Decimal::ZERO;
            self.avg_entry = Decimal::ZERO;
            return;
        }
        let cost: Price = self
            .lots
            .iter()
            .map(|lot| lot.entry_price * lot.quantity)
            .sum();
        self.holdings = total;
        self.avg_entry = cost / total;
    }
}

/// FIFO book of open lots across all symbols.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PositionBook {
    positions: HashMap<Symbol, SymbolPosition>,
}

impl PositionBook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly opened lot at the tail of its symbol's queue.
    pub fn open(&mut self, lot: Lot) {
        let position = self.positions.entry(lot.symbol.clone()).or_default();
        position.lots.push_back(lot);
        position.recompute();
    }

    /// Consume `quantity` in FIFO order, or only from `target` when given.
    pub fn consume(
        &mut self,
        symbol: &str,
        quantity: Quantity,
        target: Option<Uuid>,
    ) -> LedgerResult<ConsumedSlice> {
        let position = self
            .positions
            .get_mut(symbol)
            .filter(|position| !position.lots.is_empty())
            .ok_or_else(|| LedgerError::UnknownSymbol(symbol.to_string()))?;

        let available = match target {
            Some(lot_id) => {
                position
                    .lots
                    .iter()
                    .find(|lot| lot.id == lot_id)
                    .ok_or(LedgerError::UnknownLot(lot_id))?
                    .quantity
            }
            None => position.holdings,
        };
        if quantity <= Decimal::ZERO || quantity > available {
            return Err(LedgerError::InsufficientHoldings {
                requested: quantity,
                available,
            });
        }

        let mut remaining = quantity;
        let mut cost = Decimal::ZERO;
        let mut risk = Decimal::ZERO;
        let mut fees = Decimal::ZERO;
        let mut lot_ids = Vec::new();
        for lot in position.lots.iter_mut() {
            if remaining.is_zero() {
                break;
            }
            if let Some(lot_id) = target {
                if lot.id != lot_id {
                    continue;
                }
            }
            let taken = remaining.min(lot.quantity);
            cost += lot.entry_price * taken;
            risk += lot.initial_risk_per_unit * taken;
            fees += lot.entry_fee_per_unit * taken;
            lot.quantity -= taken;
            remaining -= taken;
            lot_ids.push(lot.id);
        }
        position.lots.retain(|lot| lot.quantity >= DUST_THRESHOLD);
        position.recompute();

        Ok(ConsumedSlice {
            quantity,
            entry_price: cost / quantity,
            initial_risk_per_unit: risk / quantity,
            entry_fee_per_unit: fees / quantity,
            lot_ids,
        })
    }

    /// Current holdings for a symbol (zero when unknown).
    #[must_use]
    pub fn holdings(&self, symbol: &str) -> Quantity {
        self.positions
            .get(symbol)
            .map(|position| position.holdings)
            .unwrap_or(Decimal::ZERO)
    }

    /// Average entry of the surviving lots.
    #[must_use]
    pub fn avg_entry(&self, symbol: &str) -> Price {
        self.positions
            .get(symbol)
            .map(|position| position.avg_entry)
            .unwrap_or(Decimal::ZERO)
    }

    /// Clone the open lots for a symbol in FIFO order.
    #[must_use]
    pub fn lots(&self, symbol: &str) -> Vec<Lot> {
        self.positions
            .get(symbol)
            .map(|position| position.lots.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Count of open lots across every symbol.
    #[must_use]
    pub fn open_lot_count(&self) -> usize {
        self.positions
            .values()
            .map(|position| position.lots.len())
            .sum()
    }

    /// Symbols with live exposure.
    #[must_use]
    pub fn symbols(&self) -> Vec<Symbol> {
        self.positions
            .iter()
            .filter(|(_, position)| position.holdings > Decimal::ZERO)
            .map(|(symbol, _)| symbol.clone())
            .collect()
    }

    /// Scan a symbol's lots against the mark price. Stop-loss is checked
    /// before take-profit for every lot.
    #[must_use]
    pub fn exit_triggers(&self, symbol: &str, price: Price) -> Vec<ExitTrigger> {
        let Some(position) = self.positions.get(symbol) else {
            return Vec::new();
        };
        position
            .lots
            .iter()
            .filter_map(|lot| {
                if price <= lot.stop_loss {
                    Some(ExitTrigger {
                        lot_id: lot.id,
                        quantity: lot.quantity,
                        reason: ExitReason::StopLoss,
                        exit_price: price,
                    })
                } else if price >= lot.take_profit {
                    Some(ExitTrigger {
                        lot_id: lot.id,
                        quantity: lot.quantity,
                        reason: ExitReason::TakeProfit,
                        exit_price: price,
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    /// Mark-to-market exposure summed over all symbols.
    #[must_use]
    pub fn exposure(&self, marks: &HashMap<Symbol, Price>) -> Price {
        self.positions
            .iter()
            .map(|(symbol, position)| {
                let mark = marks
                    .get(symbol)
                    .copied()
                    .unwrap_or(position.avg_entry);
                position.holdings * mark
            })
            .sum()
    }
}

/// Quote-currency cash account mutated by fills.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Account {
    balance: Price,
}

impl Account {
    #[must_use]
    pub fn new(balance: Price) -> Self {
        Self { balance }
    }

    #[must_use]
    pub fn balance(&self) -> Price {
        self.balance
    }

    /// Cash flow of a buy fill: notional plus fees leave the account.
    pub fn apply_buy(&mut self, fill_price: Price, quantity: Quantity, fee: Price) {
        self.balance -= fill_price * quantity + fee;
    }

    /// Cash flow of a sell fill: notional minus fees enters the account.
    pub fn apply_sell(&mut self, fill_price: Price, quantity: Quantity, fee: Price) {
        self.balance += fill_price * quantity - fee;
    }

    /// Total portfolio value: cash plus marked exposure. Recomputed,
    /// never mutated in place.
    #[must_use]
    pub fn total_value(&self, book: &PositionBook, marks: &HashMap<Symbol, Price>) -> Price {
        self.balance + book.exposure(marks)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use skiff_core::Lot;

    use super::*;

    fn lot(symbol: &str, entry: i64, qty: &str, stop: i64, target: i64) -> Lot {
        Lot::open(
            symbol.into(),
            Decimal::from(entry),
            qty.parse().unwrap(),
            Decimal::from(stop),
            Decimal::from(target),
            Utc::now(),
            Decimal::ZERO,
            1,
        )
        .unwrap()
    }

    #[test]
    fn consume_walks_lots_in_insertion_order() {
        let mut book = PositionBook::new();
        book.open(lot("BTC-USDC", 100, "1", 95, 110));
        book.open(lot("BTC-USDC", 104, "1", 99, 114));
        let slice = book
            .consume("BTC-USDC", Decimal::new(15, 1), None)
            .unwrap();
        // 1.0 @ 100 plus 0.5 @ 104 -> weighted entry 101.333...
        assert_eq!(slice.quantity, Decimal::new(15, 1));
        assert_eq!(
            slice.entry_price.round_dp(4),
            (Decimal::from(152) / Decimal::new(15, 1)).round_dp(4)
        );
        assert_eq!(book.holdings("BTC-USDC"), Decimal::new(5, 1));
        assert_eq!(book.avg_entry("BTC-USDC"), Decimal::from(104));
    }

    #[test]
    fn targeted_consume_touches_only_that_lot() {
        let mut book = PositionBook::new();
        let first = lot("BTC-USDC", 100, "1", 95, 110);
        let second = lot("BTC-USDC", 104, "1", 99, 114);
        let second_id = second.id;
        book.open(first);
        book.open(second);
        let slice = book
            .consume("BTC-USDC", Decimal::ONE, Some(second_id))
            .unwrap();
        assert_eq!(slice.entry_price, Decimal::from(104));
        assert_eq!(slice.lot_ids, vec![second_id]);
        assert_eq!(book.holdings("BTC-USDC"), Decimal::ONE);
        assert_eq!(book.avg_entry("BTC-USDC"), Decimal::from(100));
    }

    #[test]
    fn over_consumption_is_rejected() {
        let mut book = PositionBook::new();
        book.open(lot("BTC-USDC", 100, "1", 95, 110));
        assert!(matches!(
            book.consume("BTC-USDC", Decimal::from(2), None),
            Err(LedgerError::InsufficientHoldings { .. })
        ));
        assert!(matches!(
            book.consume("ETH-USDC", Decimal::ONE, None),
            Err(LedgerError::UnknownSymbol(_))
        ));
    }

    #[test]
    fn dust_positions_collapse_to_zero() {
        let mut book = PositionBook::new();
        book.open(lot("BTC-USDC", 100, "1", 95, 110));
        book.consume("BTC-USDC", "0.9999995".parse().unwrap(), None)
            .unwrap();
        assert_eq!(book.holdings("BTC-USDC"), Decimal::ZERO);
        assert_eq!(book.avg_entry("BTC-USDC"), Decimal::ZERO);
        assert_eq!(book.open_lot_count(), 0);
    }

    #[test]
    fn holdings_never_go_negative_across_fill_sequences() {
        let mut book = PositionBook::new();
        let mut bought = Decimal::ZERO;
        let mut sold = Decimal::ZERO;
        for i in 0..50_u32 {
            let qty = Decimal::new(1 + (i % 3) as i64, 1);
            book.open(lot("BTC-USDC", 100 + i as i64, &qty.to_string(), 90, 200));
            bought += qty;
            if i % 2 == 1 {
                let sell_qty = book.holdings("BTC-USDC").min(Decimal::new(2, 1));
                book.consume("BTC-USDC", sell_qty, None).unwrap();
                sold += sell_qty;
            }
        }
        assert_eq!(book.holdings("BTC-USDC"), bought - sold);
        assert!(book.holdings("BTC-USDC") >= Decimal::ZERO);
    }

    #[test]
    fn stop_loss_wins_over_take_profit() {
        let mut book = PositionBook::new();
        book.open(lot("BTC-USDC", 100, "1", 98, 104));
        let stops = book.exit_triggers("BTC-USDC", Decimal::from(98));
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].reason, ExitReason::StopLoss);

        let targets = book.exit_triggers("BTC-USDC", Decimal::from(104));
        assert_eq!(targets[0].reason, ExitReason::TakeProfit);

        assert!(book.exit_triggers("BTC-USDC", Decimal::from(101)).is_empty());
    }

    #[test]
    fn portfolio_identity_holds_after_fills() {
        let mut book = PositionBook::new();
        let mut account = Account::new(Decimal::from(1_000));
        let entry = Decimal::from(100);
        let qty = Decimal::new(2, 0);
        account.apply_buy(entry, qty, Decimal::ZERO);
        book.open(lot("BTC-USDC", 100, "2", 90, 120));

        let mut marks = HashMap::new();
        marks.insert("BTC-USDC".to_string(), Decimal::from(105));
        let total = account.total_value(&book, &marks);
        assert_eq!(total, Decimal::from(1_000) - entry * qty + Decimal::from(105) * qty);
    }

    #[test]
    fn pnl_identity_over_thousand_trades() {
        // S3: equity after 1000 round trips equals 1000 + sum(pnl) exactly.
        let mut account = Account::new(Decimal::from(1_000));
        let qty = Decimal::new(1, 1);
        let fee_rate = Decimal::new(1, 3);
        let mut pnl_sum = Decimal::ZERO;
        for i in 0..1_000_u32 {
            let entry = Decimal::from(100) + Decimal::from(i % 20) * Decimal::new(2, 1);
            let drift = if i % 2 == 0 {
                Decimal::ONE + Decimal::new(4, 3)
            } else {
                Decimal::ONE - Decimal::new(4, 3)
            };
            let exit = entry * drift;
            let entry_fee = entry * qty * fee_rate;
            let exit_fee = exit * qty * fee_rate;
            account.apply_buy(entry, qty, entry_fee);
            account.apply_sell(exit, qty, exit_fee);
            pnl_sum += (exit - entry) * qty - entry_fee - exit_fee;
        }
        let expected = Decimal::from(1_000) + pnl_sum;
        let delta = (account.balance() - expected).abs();
        assert!(delta < Decimal::new(1, 8), "delta {delta}");
    }
}
