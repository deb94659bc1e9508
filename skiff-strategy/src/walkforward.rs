//! Chronological walk-forward testing of candidate parameter sets.
//!
//! Closed trades are replayed through rolling windows, each split 70/30
//! into training and forward slices. Both parameter sets filter the
//! forward slice; the candidate must not worsen drawdown, must match or
//! beat the baseline profit factor, and must keep enough forward trades.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use skiff_core::{Side, Trade};

use crate::{PerformanceMetrics, StrategyError, StrategyParameters, StrategyResult};

/// One rolling evaluation window.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct WalkForwardWindow {
    pub index: usize,
    pub forward_trades: usize,
    pub baseline: PerformanceMetrics,
    pub candidate: PerformanceMetrics,
    pub accepted: bool,
}

/// Aggregate outcome over all windows.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct WalkForwardResult {
    pub windows: Vec<WalkForwardWindow>,
    pub accepted: bool,
}

impl WalkForwardResult {
    #[must_use]
    pub fn accepted_windows(&self) -> usize {
        self.windows.iter().filter(|window| window.accepted).count()
    }
}

/// Walk-forward runner.
pub struct WalkForward;

const MIN_WINDOW_TRADES: usize = 20;

impl WalkForward {
    /// Evaluate `candidate` against `baseline` over the provided closed
    /// trades. Fails when too few trades exist to build a single window.
    pub fn run(
        trades: &[Trade],
        baseline: &StrategyParameters,
        candidate: &StrategyParameters,
    ) -> StrategyResult<WalkForwardResult> {
        let mut closed: Vec<&Trade> = trades
            .iter()
            .filter(|trade| trade.side == Side::Sell && trade.pnl.is_some())
            .collect();
        closed.sort_by_key(|trade| trade.timestamp);
        if closed.len() < MIN_WINDOW_TRADES {
            return Err(StrategyError::NotEnoughData);
        }

        let window_len = (closed.len() / 3).max(MIN_WINDOW_TRADES).min(closed.len());
        let step = (window_len / 2).max(1);
        let mut windows = Vec::new();
        let mut start = 0;
        let mut index = 0;
        while start + window_len <= closed.len() {
            let window = &closed[start..start + window_len];
            let split = (window.len() * 7) / 10;
            let forward = &window[split..];

            let baseline_trades = apply_filter(forward, baseline, baseline);
            let candidate_trades = apply_filter(forward, baseline, candidate);
            let baseline_metrics = PerformanceMetrics::from_trades(&baseline_trades);
            let candidate_metrics = PerformanceMetrics::from_trades(&candidate_trades);
            let required = (baseline_metrics.trades / 2).max(6);
            let accepted = candidate_metrics.max_drawdown_pct <= baseline_metrics.max_drawdown_pct
                && candidate_metrics.profit_factor >= baseline_metrics.profit_factor
                && candidate_metrics.trades >= required;

            windows.push(WalkForwardWindow {
                index,
                forward_trades: forward.len(),
                baseline: baseline_metrics,
                candidate: candidate_metrics,
                accepted,
            });
            start += step;
            index += 1;
        }

        if windows.is_empty() {
            return Err(StrategyError::NotEnoughData);
        }
        let accepted_count = windows.iter().filter(|window| window.accepted).count();
        Ok(WalkForwardResult {
            accepted: accepted_count * 2 >= windows.len(),
            windows,
        })
    }
}

/// Replay forward trades under a parameter set.
///
/// A stricter minimum score admits fewer trades (selected by a stable
/// per-trade hash so the filter is deterministic), and tighter stop or
/// target multiples scale the corresponding PnL magnitudes.
fn apply_filter(
    forward: &[&Trade],
    baseline: &StrategyParameters,
    params: &StrategyParameters,
) -> Vec<Trade> {
    let admit_probability = 1.0 - 2.0 * (params.min_score - baseline.min_score).max(0.0);
    let loss_scale =
        (params.stop_loss_atr * params.atr_multiplier)
            / (baseline.stop_loss_atr * baseline.atr_multiplier);
    let win_scale = (params.take_profit_atr * params.atr_multiplier)
        / (baseline.take_profit_atr * baseline.atr_multiplier);

    forward
        .iter()
        .filter(|trade| trade_unit(trade) < admit_probability)
        .map(|trade| {
            let mut replayed = (*trade).clone();
            if let Some(pnl) = replayed.pnl {
                let scale = if pnl < Decimal::ZERO {
                    loss_scale
                } else {
                    win_scale
                };
                let scale = Decimal::try_from(scale).unwrap_or(Decimal::ONE);
                replayed.pnl = Some(pnl * scale);
                replayed.r_multiple = replayed
                    .r_multiple
                    .map(|r| r * scale.to_f64().unwrap_or(1.0));
            }
            replayed
        })
        .collect()
}

fn trade_unit(trade: &Trade) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(trade.id.as_bytes());
    let digest = hasher.finalize();
    let raw = u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
    raw as f64 / u64::MAX as f64
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use uuid::Uuid;

    use super::*;

    fn synthetic_trades(n: usize) -> Vec<Trade> {
        (0..n)
            .map(|i| {
                let pnl = if i % 3 == 0 { -4 } else { 6 };
                Trade {
                    id: Uuid::from_u128(i as u128 + 1),
                    decision_id: None,
                    arbitrage_id: None,
                    symbol: "BTC-USDC".into(),
                    side: Side::Sell,
                    price: Decimal::from(100),
                    quantity: Decimal::ONE,
                    fee: Decimal::ZERO,
                    pnl: Some(Decimal::from(pnl)),
                    r_multiple: Some(pnl as f64 / 4.0),
                    exit_reason: None,
                    simulation: None,
                    timestamp: Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap()
                        + Duration::minutes(i as i64 * 17),
                }
            })
            .collect()
    }

    #[test]
    fn windows_are_well_formed_for_large_samples() {
        let trades = synthetic_trades(120);
        let params = StrategyParameters::default();
        let result = WalkForward::run(&trades, &params, &params).unwrap();
        assert!(!result.windows.is_empty());
        for window in &result.windows {
            assert!(window.baseline.sharpe.is_finite());
            assert!(window.baseline.max_drawdown_pct.is_finite());
            assert!(window.baseline.profit_factor >= 0.0);
        }
        assert!(result.accepted_windows() <= result.windows.len());
    }

    #[test]
    fn identical_candidate_is_accepted() {
        let trades = synthetic_trades(90);
        let params = StrategyParameters::default();
        let result = WalkForward::run(&trades, &params, &params).unwrap();
        assert!(result.accepted);
    }

    #[test]
    fn accepted_windows_satisfy_the_dominance_rule() {
        let trades = synthetic_trades(150);
        let baseline = StrategyParameters::default();
        let candidate = StrategyParameters {
            stop_loss_atr: baseline.stop_loss_atr * 0.85,
            ..baseline
        };
        let result = WalkForward::run(&trades, &baseline, &candidate).unwrap();
        for window in result.windows.iter().filter(|window| window.accepted) {
            assert!(window.candidate.max_drawdown_pct <= window.baseline.max_drawdown_pct);
            assert!(window.candidate.profit_factor >= window.baseline.profit_factor);
        }
    }

    #[test]
    fn too_few_trades_is_an_error() {
        let trades = synthetic_trades(5);
        let params = StrategyParameters::default();
        assert!(matches!(
            WalkForward::run(&trades, &params, &params),
            Err(StrategyError::NotEnoughData)
        ));
    }
}
