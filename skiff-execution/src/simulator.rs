//! Deterministic spread/slippage/fee model.
//!
//! Fills are seedable: the jitter component derives from a hash of
//! `symbol|ts|side`, so replaying the same evaluation reproduces the same
//! fill to the last digit.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use skiff_core::{round_price, ExecutionSimulation, Price, Quantity, Side, Symbol};

const BASE_SPREAD: f64 = 0.000_15;
const SPREAD_ATR_WEIGHT: f64 = 0.18;
const SPREAD_CAP: f64 = 0.001;
const BASE_SLIPPAGE: f64 = 0.000_05;
const SLIPPAGE_ATR_WEIGHT: f64 = 0.08;
const SLIPPAGE_JITTER: f64 = 0.000_2;

/// A simulated execution against the latest close.
#[derive(Clone, Debug, PartialEq)]
pub struct SimulatedFill {
    pub fill_price: Price,
    pub fee: Price,
    pub simulation: ExecutionSimulation,
}

/// Stateless fill simulator configured with a taker fee.
#[derive(Clone, Copy, Debug)]
pub struct ExecutionSimulator {
    fee_rate: Decimal,
}

impl ExecutionSimulator {
    /// Build from a fee expressed in basis points.
    #[must_use]
    pub fn new(fee_bps: Decimal) -> Self {
        Self {
            fee_rate: fee_bps / Decimal::from(10_000),
        }
    }

    /// Fractional taker fee applied to notional.
    #[must_use]
    pub fn fee_rate(&self) -> Decimal {
        self.fee_rate
    }

    /// Simulate a fill of `quantity` at the given close. `dir = +1` for
    /// buys and `-1` for sells; exits therefore pay the spread twice over
    /// a round trip.
    pub fn simulate(
        &self,
        symbol: &Symbol,
        ts: DateTime<Utc>,
        side: Side,
        close: Price,
        atr_pct: f64,
        quantity: Quantity,
    ) -> SimulatedFill {
        let close_f = close.to_f64().unwrap_or_default();
        let seed = fill_seed(symbol, ts, side);
        let jitter = seed as f64 / u64::MAX as f64;

        let spread = close_f * (BASE_SPREAD + (SPREAD_ATR_WEIGHT * atr_pct).min(SPREAD_CAP));
        let slippage =
            close_f * (BASE_SLIPPAGE + SLIPPAGE_ATR_WEIGHT * atr_pct + SLIPPAGE_JITTER * jitter);
        let dir = f64::from(side.direction());
        let fill = close_f + dir * (spread / 2.0 + slippage);

        let fill_price = round_price(Decimal::try_from(fill).unwrap_or(close));
        let fee = round_price(self.fee_rate * fill_price * quantity);
        SimulatedFill {
            fill_price,
            fee,
            simulation: ExecutionSimulation {
                spread: round_price(Decimal::try_from(spread).unwrap_or_default()),
                slippage: round_price(Decimal::try_from(slippage).unwrap_or_default()),
                fee_rate: self.fee_rate.to_f64().unwrap_or_default(),
                fill_price,
                seed,
            },
        }
    }
}

/// Stable seed derived from `symbol|ts|side`.
fn fill_seed(symbol: &Symbol, ts: DateTime<Utc>, side: Side) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(symbol.as_bytes());
    hasher.update(b"|");
    hasher.update(ts.timestamp_millis().to_le_bytes());
    hasher.update(b"|");
    hasher.update(side.as_str().as_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// Realized PnL of an exit: `(fill - entry) * qty - entry_fee - exit_fee`.
#[must_use]
pub fn realized_pnl(
    entry_price: Price,
    exit_fill: Price,
    quantity: Quantity,
    entry_fee: Price,
    exit_fee: Price,
) -> Price {
    (exit_fill - entry_price) * quantity - entry_fee - exit_fee
}

/// PnL expressed in multiples of the risk taken at entry.
#[must_use]
pub fn r_multiple(pnl: Price, initial_risk_per_unit: Price, quantity: Quantity) -> f64 {
    let denom = initial_risk_per_unit * quantity;
    if denom <= Decimal::ZERO {
        return 0.0;
    }
    (pnl / denom).to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn identical_inputs_produce_identical_fills() {
        let sim = ExecutionSimulator::new(Decimal::from(10));
        let a = sim.simulate(
            &"BTC-USDC".to_string(),
            ts(),
            Side::Buy,
            Decimal::from(60_000),
            0.004,
            Decimal::new(1, 1),
        );
        let b = sim.simulate(
            &"BTC-USDC".to_string(),
            ts(),
            Side::Buy,
            Decimal::from(60_000),
            0.004,
            Decimal::new(1, 1),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn buys_fill_above_and_sells_below_the_close() {
        let sim = ExecutionSimulator::new(Decimal::from(10));
        let close = Decimal::from(60_000);
        let buy = sim.simulate(&"BTC-USDC".to_string(), ts(), Side::Buy, close, 0.004, Decimal::ONE);
        let sell =
            sim.simulate(&"BTC-USDC".to_string(), ts(), Side::Sell, close, 0.004, Decimal::ONE);
        assert!(buy.fill_price > close);
        assert!(sell.fill_price < close);
    }

    #[test]
    fn higher_volatility_widens_the_spread() {
        let sim = ExecutionSimulator::new(Decimal::ZERO);
        let close = Decimal::from(60_000);
        let calm = sim.simulate(&"BTC-USDC".to_string(), ts(), Side::Buy, close, 0.001, Decimal::ONE);
        let wild = sim.simulate(&"BTC-USDC".to_string(), ts(), Side::Buy, close, 0.02, Decimal::ONE);
        assert!(wild.simulation.spread > calm.simulation.spread);
        // The volatility term caps at 10 bps of the close.
        let cap = sim.simulate(&"BTC-USDC".to_string(), ts(), Side::Buy, close, 0.5, Decimal::ONE);
        assert_eq!(
            cap.simulation.spread,
            round_price(Decimal::try_from(60_000.0 * (BASE_SPREAD + SPREAD_CAP)).unwrap())
        );
    }

    #[test]
    fn fees_scale_with_notional() {
        let sim = ExecutionSimulator::new(Decimal::from(10));
        let fill = sim.simulate(
            &"BTC-USDC".to_string(),
            ts(),
            Side::Buy,
            Decimal::from(100),
            0.0,
            Decimal::from(2),
        );
        assert_eq!(fill.fee, round_price(fill.fill_price * Decimal::from(2) * Decimal::new(1, 3)));
    }

    #[test]
    fn round_trip_pnl_matches_the_identity() {
        let entry = Decimal::from(100);
        let exit = Decimal::from(104);
        let qty = Decimal::ONE;
        let pnl = realized_pnl(entry, exit, qty, Decimal::ONE, Decimal::ONE);
        assert_eq!(pnl, Decimal::from(2));
        assert!((r_multiple(pnl, Decimal::from(2), qty) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn different_sides_use_different_seeds() {
        let symbol = "BTC-USDC".to_string();
        assert_ne!(
            fill_seed(&symbol, ts(), Side::Buy),
            fill_seed(&symbol, ts(), Side::Sell)
        );
    }
}
