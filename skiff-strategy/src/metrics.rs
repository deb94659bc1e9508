//! Trade-derived performance aggregates consumed by the refinement loop.

use chrono::{DateTime, Timelike, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use skiff_core::{ExitReason, Side, Trade};

/// Headline performance numbers over a set of closed trades.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub max_drawdown_pct: f64,
    pub avg_r: f64,
    pub net_pnl: f64,
    pub sharpe: f64,
}

impl PerformanceMetrics {
    /// Aggregate over closed (SELL-side) trades. Trades without realized
    /// PnL are ignored.
    #[must_use]
    pub fn from_trades(trades: &[Trade]) -> Self {
        let mut pnls = Vec::new();
        let mut r_values = Vec::new();
        for trade in trades {
            if trade.side != Side::Sell {
                continue;
            }
            let Some(pnl) = trade.pnl.and_then(|p| p.to_f64()) else {
                continue;
            };
            pnls.push(pnl);
            if let Some(r) = trade.r_multiple {
                r_values.push(r);
            }
        }
        if pnls.is_empty() {
            return Self::default();
        }

        let wins = pnls.iter().filter(|pnl| **pnl > 0.0).count();
        let losses = pnls.iter().filter(|pnl| **pnl < 0.0).count();
        let gross_profit: f64 = pnls.iter().filter(|pnl| **pnl > 0.0).sum();
        let gross_loss: f64 = pnls.iter().filter(|pnl| **pnl < 0.0).map(|pnl| -pnl).sum();
        let net_pnl: f64 = pnls.iter().sum();
        let profit_factor = if gross_loss == 0.0 {
            if gross_profit > 0.0 {
                f64::INFINITY
            } else {
                0.0
            }
        } else {
            gross_profit / gross_loss
        };

        // Drawdown over the cumulative PnL curve, relative to its peak.
        let mut equity = 0.0_f64;
        let mut peak = 0.0_f64;
        let mut max_drawdown = 0.0_f64;
        for pnl in &pnls {
            equity += pnl;
            peak = peak.max(equity);
            let base = peak.abs().max(1.0);
            max_drawdown = max_drawdown.max((peak - equity) / base);
        }

        let mean = net_pnl / pnls.len() as f64;
        let variance =
            pnls.iter().map(|pnl| (pnl - mean).powi(2)).sum::<f64>() / pnls.len() as f64;
        let sharpe = if variance > 0.0 {
            mean / variance.sqrt()
        } else {
            0.0
        };

        let avg_r = if r_values.is_empty() {
            0.0
        } else {
            r_values.iter().sum::<f64>() / r_values.len() as f64
        };

        Self {
            trades: pnls.len(),
            wins,
            losses,
            win_rate: wins as f64 / pnls.len() as f64,
            profit_factor,
            max_drawdown_pct: max_drawdown,
            avg_r,
            net_pnl,
            sharpe,
        }
    }
}

/// PnL bucketed by exit reason and by hour of day, used to spot where the
/// strategy bleeds.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ConditionBuckets {
    pub stop_loss_pnl: f64,
    pub take_profit_pnl: f64,
    pub signal_exit_pnl: f64,
    pub hourly_pnl: [f64; 24],
}

impl ConditionBuckets {
    #[must_use]
    pub fn from_trades(trades: &[Trade]) -> Self {
        let mut buckets = Self::default();
        for trade in trades {
            if trade.side != Side::Sell {
                continue;
            }
            let Some(pnl) = trade.pnl.and_then(|p| p.to_f64()) else {
                continue;
            };
            match trade.exit_reason {
                Some(ExitReason::StopLoss) => buckets.stop_loss_pnl += pnl,
                Some(ExitReason::TakeProfit) => buckets.take_profit_pnl += pnl,
                _ => buckets.signal_exit_pnl += pnl,
            }
            buckets.hourly_pnl[trade.timestamp.hour() as usize] += pnl;
        }
        buckets
    }

    /// Hour of day with the worst cumulative PnL, if any bucket is negative.
    #[must_use]
    pub fn worst_hour(&self) -> Option<(usize, f64)> {
        self.hourly_pnl
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, pnl)| *pnl < 0.0)
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }
}

/// A maximal run of consecutive losing trades.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct LossCluster {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub length: usize,
    pub total_loss: f64,
}

impl LossCluster {
    /// Extract loss clusters of at least `min_length` trades, in time order.
    #[must_use]
    pub fn extract(trades: &[Trade], min_length: usize) -> Vec<Self> {
        let mut closed: Vec<&Trade> = trades
            .iter()
            .filter(|trade| trade.side == Side::Sell && trade.pnl.is_some())
            .collect();
        closed.sort_by_key(|trade| trade.timestamp);

        let mut clusters = Vec::new();
        let mut run: Vec<&Trade> = Vec::new();
        for trade in closed {
            let pnl = trade.pnl.and_then(|p| p.to_f64()).unwrap_or_default();
            if pnl < 0.0 {
                run.push(trade);
                continue;
            }
            Self::flush(&mut run, min_length, &mut clusters);
        }
        Self::flush(&mut run, min_length, &mut clusters);
        clusters
    }

    fn flush(run: &mut Vec<&Trade>, min_length: usize, clusters: &mut Vec<Self>) {
        if run.len() >= min_length.max(1) {
            clusters.push(Self {
                started_at: run[0].timestamp,
                ended_at: run[run.len() - 1].timestamp,
                length: run.len(),
                total_loss: run
                    .iter()
                    .map(|trade| trade.pnl.and_then(|p| p.to_f64()).unwrap_or_default())
                    .sum(),
            });
        }
        run.clear();
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use rust_decimal::Decimal;
    use uuid::Uuid;

    use super::*;

    fn sell(pnl: i64, minutes: i64) -> Trade {
        Trade {
            id: Uuid::new_v4(),
            decision_id: None,
            arbitrage_id: None,
            symbol: "BTC-USDC".into(),
            side: Side::Sell,
            price: Decimal::from(100),
            quantity: Decimal::ONE,
            fee: Decimal::ZERO,
            pnl: Some(Decimal::from(pnl)),
            r_multiple: Some(pnl as f64 / 2.0),
            exit_reason: Some(if pnl < 0 {
                ExitReason::StopLoss
            } else {
                ExitReason::TakeProfit
            }),
            simulation: None,
            timestamp: Utc.with_ymd_and_hms(2026, 5, 1, 3, 0, 0).unwrap()
                + Duration::minutes(minutes),
        }
    }

    #[test]
    fn metrics_aggregate_wins_and_losses() {
        let trades = vec![sell(10, 0), sell(-5, 1), sell(20, 2), sell(-5, 3)];
        let metrics = PerformanceMetrics::from_trades(&trades);
        assert_eq!(metrics.trades, 4);
        assert_eq!(metrics.wins, 2);
        assert_eq!(metrics.losses, 2);
        assert!((metrics.win_rate - 0.5).abs() < 1e-12);
        assert!((metrics.profit_factor - 3.0).abs() < 1e-12);
        assert!((metrics.net_pnl - 20.0).abs() < 1e-12);
        assert!(metrics.max_drawdown_pct > 0.0);
    }

    #[test]
    fn empty_input_yields_defaults() {
        let metrics = PerformanceMetrics::from_trades(&[]);
        assert_eq!(metrics.trades, 0);
        assert_eq!(metrics.profit_factor, 0.0);
    }

    #[test]
    fn buckets_split_by_exit_reason() {
        let trades = vec![sell(10, 0), sell(-4, 1), sell(-6, 2)];
        let buckets = ConditionBuckets::from_trades(&trades);
        assert!((buckets.take_profit_pnl - 10.0).abs() < 1e-12);
        assert!((buckets.stop_loss_pnl + 10.0).abs() < 1e-12);
        assert_eq!(buckets.worst_hour().unwrap().0, 3);
    }

    #[test]
    fn loss_clusters_capture_consecutive_runs() {
        let trades = vec![
            sell(5, 0),
            sell(-2, 1),
            sell(-3, 2),
            sell(-1, 3),
            sell(4, 4),
            sell(-2, 5),
        ];
        let clusters = LossCluster::extract(&trades, 2);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].length, 3);
        assert!((clusters[0].total_loss + 6.0).abs() < 1e-12);
    }
}
