//! Ordered risk gates and ATR-based position sizing.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use skiff_core::{round_price, round_size, Price, Quantity, Regime};
use skiff_strategy::StrategyParameters;
use thiserror::Error;

/// Minimum free balance before any entry is considered.
const MIN_BALANCE: f64 = 15.0;
/// Smallest acceptable order notional.
const MIN_NOTIONAL: f64 = 10.0;

/// Inputs the risk gates evaluate for one BUY decision.
#[derive(Clone, Copy, Debug)]
pub struct RiskContext {
    pub balance: Price,
    pub equity: Price,
    pub price: Price,
    pub atr: f64,
    pub atr_pct: f64,
    pub regime: Regime,
    pub open_positions: usize,
    pub daily_realized_pnl: Price,
    pub loss_streak: u32,
}

/// Why an order was refused. Rejections are normal control flow: the
/// decision is recorded HOLD with the rejection as a reason.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum RiskRejection {
    #[error("balance {0} below minimum")]
    InsufficientBalance(Price),
    #[error("chop regime blocks entries")]
    ChoppyRegime,
    #[error("max concurrent trades reached ({0})")]
    MaxConcurrentTrades(usize),
    #[error("daily loss limit breached ({daily_pnl} <= -{limit})")]
    DailyLossBreached { daily_pnl: Price, limit: Price },
    #[error("kill switch: {0} consecutive losses")]
    KillSwitch(u32),
    #[error("atr {atr_pct:.5} outside [{min:.5}, {max:.5}]")]
    AtrOutOfBand { atr_pct: f64, min: f64, max: f64 },
    #[error("order notional {notional:.2} below minimum {minimum:.2}")]
    NotionalTooSmall { notional: f64, minimum: f64 },
    #[error("no holdings to sell")]
    NoHoldings,
    #[error("partial exit {requested} exceeds holdings {available}")]
    ExcessiveExit {
        requested: Quantity,
        available: Quantity,
    },
}

/// A sized, bracketed entry that cleared every gate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SizedEntry {
    pub quantity: Quantity,
    pub stop_loss: Price,
    pub take_profit: Price,
    pub risk_budget: Price,
}

/// Evaluates the gate ladder against a snapshot of strategy parameters.
#[derive(Clone, Copy, Debug)]
pub struct RiskManager {
    params: StrategyParameters,
}

impl RiskManager {
    #[must_use]
    pub fn new(params: StrategyParameters) -> Self {
        Self { params }
    }

    /// Run the BUY gates in their fixed order, then size the order from
    /// the ATR stop distance.
    pub fn evaluate_buy(&self, ctx: &RiskContext) -> Result<SizedEntry, RiskRejection> {
        let balance = ctx.balance.to_f64().unwrap_or_default();
        if balance <= MIN_BALANCE {
            return Err(RiskRejection::InsufficientBalance(ctx.balance));
        }
        if ctx.regime == Regime::Chop {
            return Err(RiskRejection::ChoppyRegime);
        }
        if ctx.open_positions >= self.params.max_concurrent_trades as usize {
            return Err(RiskRejection::MaxConcurrentTrades(ctx.open_positions));
        }
        let equity = ctx.equity.to_f64().unwrap_or_default();
        let max_daily_loss = equity * self.params.daily_max_loss_pct;
        let daily_pnl = ctx.daily_realized_pnl.to_f64().unwrap_or_default();
        if daily_pnl <= -max_daily_loss {
            return Err(RiskRejection::DailyLossBreached {
                daily_pnl: ctx.daily_realized_pnl,
                limit: Decimal::try_from(max_daily_loss).unwrap_or_default(),
            });
        }
        if ctx.loss_streak >= self.params.kill_switch_losses {
            return Err(RiskRejection::KillSwitch(ctx.loss_streak));
        }
        if ctx.atr_pct < self.params.min_atr_pct || ctx.atr_pct > self.params.max_atr_pct {
            return Err(RiskRejection::AtrOutOfBand {
                atr_pct: ctx.atr_pct,
                min: self.params.min_atr_pct,
                max: self.params.max_atr_pct,
            });
        }

        let base_risk = equity * self.params.max_risk_per_trade_pct;
        let streak_multiplier = (1.0 - 0.15 * f64::from(ctx.loss_streak)).max(0.45);
        let dd_multiplier = if daily_pnl < 0.0 && max_daily_loss > 0.0 {
            (1.0 + daily_pnl / max_daily_loss).max(0.5)
        } else {
            1.0
        };
        let effective_risk = base_risk * streak_multiplier * dd_multiplier;

        let stop_distance = ctx.atr * self.params.stop_loss_atr * self.params.atr_multiplier;
        let target_distance = ctx.atr * self.params.take_profit_atr * self.params.atr_multiplier;
        let price = ctx.price.to_f64().unwrap_or_default();
        if stop_distance <= 0.0 || price <= 0.0 {
            return Err(RiskRejection::NotionalTooSmall {
                notional: 0.0,
                minimum: MIN_NOTIONAL,
            });
        }
        let quantity = (effective_risk / stop_distance).min(balance / price);
        let notional = quantity * price;
        if notional < MIN_NOTIONAL {
            return Err(RiskRejection::NotionalTooSmall {
                notional,
                minimum: MIN_NOTIONAL,
            });
        }

        Ok(SizedEntry {
            quantity: round_size(Decimal::try_from(quantity).unwrap_or_default()),
            stop_loss: round_price(
                ctx.price - Decimal::try_from(stop_distance).unwrap_or_default(),
            ),
            take_profit: round_price(
                ctx.price + Decimal::try_from(target_distance).unwrap_or_default(),
            ),
            risk_budget: round_price(Decimal::try_from(effective_risk).unwrap_or_default()),
        })
    }

    /// SELL gate: only an open position may be sold; quantity defaults to
    /// the full holdings unless a smaller partial is requested.
    pub fn evaluate_sell(
        &self,
        holdings: Quantity,
        requested: Option<Quantity>,
    ) -> Result<Quantity, RiskRejection> {
        if holdings <= Decimal::ZERO {
            return Err(RiskRejection::NoHoldings);
        }
        match requested {
            None => Ok(holdings),
            Some(quantity) if quantity <= Decimal::ZERO => Err(RiskRejection::NoHoldings),
            Some(quantity) if quantity > holdings => Err(RiskRejection::ExcessiveExit {
                requested: quantity,
                available: holdings,
            }),
            Some(quantity) => Ok(quantity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RiskContext {
        RiskContext {
            balance: Decimal::from(1_000),
            equity: Decimal::from(1_000),
            price: Decimal::from(100),
            atr: 1.2,
            atr_pct: 0.012,
            regime: Regime::TrendingUp,
            open_positions: 0,
            daily_realized_pnl: Decimal::ZERO,
            loss_streak: 0,
        }
    }

    fn manager() -> RiskManager {
        RiskManager::new(StrategyParameters::default())
    }

    #[test]
    fn happy_path_produces_a_bracketed_entry() {
        let entry = manager().evaluate_buy(&ctx()).unwrap();
        assert!(entry.quantity > Decimal::ZERO);
        assert!(entry.stop_loss < Decimal::from(100));
        assert!(entry.take_profit > Decimal::from(100));
        // risk budget 1% of equity, stop distance 1.2 * 1.6 * 1.2
        let expected_qty = 10.0 / (1.2 * 1.6 * 1.2);
        let actual = entry.quantity.to_f64().unwrap();
        assert!((actual - expected_qty).abs() < 1e-6, "qty {actual}");
    }

    #[test]
    fn gates_fire_in_their_documented_order() {
        let mut broke = ctx();
        broke.balance = Decimal::from(10);
        broke.regime = Regime::Chop;
        // Balance is checked before the regime gate.
        assert!(matches!(
            manager().evaluate_buy(&broke),
            Err(RiskRejection::InsufficientBalance(_))
        ));

        let mut choppy = ctx();
        choppy.regime = Regime::Chop;
        choppy.open_positions = 10;
        assert!(matches!(
            manager().evaluate_buy(&choppy),
            Err(RiskRejection::ChoppyRegime)
        ));

        let mut crowded = ctx();
        crowded.open_positions = 3;
        assert!(matches!(
            manager().evaluate_buy(&crowded),
            Err(RiskRejection::MaxConcurrentTrades(3))
        ));

        let mut bleeding = ctx();
        bleeding.daily_realized_pnl = Decimal::from(-50);
        assert!(matches!(
            manager().evaluate_buy(&bleeding),
            Err(RiskRejection::DailyLossBreached { .. })
        ));

        let mut streaky = ctx();
        streaky.loss_streak = 4;
        assert!(matches!(
            manager().evaluate_buy(&streaky),
            Err(RiskRejection::KillSwitch(4))
        ));

        let mut flat = ctx();
        flat.atr_pct = 0.0001;
        assert!(matches!(
            manager().evaluate_buy(&flat),
            Err(RiskRejection::AtrOutOfBand { .. })
        ));
    }

    #[test]
    fn loss_streak_scales_size_down() {
        let calm = manager().evaluate_buy(&ctx()).unwrap();
        let mut streaky = ctx();
        streaky.loss_streak = 2;
        let shrunk = manager().evaluate_buy(&streaky).unwrap();
        let ratio = (shrunk.quantity / calm.quantity).to_f64().unwrap();
        assert!((ratio - 0.7).abs() < 1e-6, "ratio {ratio}");
    }

    #[test]
    fn drawdown_multiplier_floors_at_half() {
        let mut bleeding = ctx();
        // 2.9% of a 3% daily budget already lost.
        bleeding.daily_realized_pnl = Decimal::new(-29, 0);
        let sized = manager().evaluate_buy(&bleeding).unwrap();
        let calm = manager().evaluate_buy(&ctx()).unwrap();
        let ratio = (sized.quantity / calm.quantity).to_f64().unwrap();
        assert!((ratio - 0.5).abs() < 1e-6, "ratio {ratio}");
    }

    #[test]
    fn tiny_notional_is_rejected() {
        let mut tiny = ctx();
        tiny.equity = Decimal::from(20);
        tiny.balance = Decimal::from(16);
        assert!(matches!(
            manager().evaluate_buy(&tiny),
            Err(RiskRejection::NotionalTooSmall { .. })
        ));
    }

    #[test]
    fn sell_gate_requires_and_caps_holdings() {
        let manager = manager();
        assert!(matches!(
            manager.evaluate_sell(Decimal::ZERO, None),
            Err(RiskRejection::NoHoldings)
        ));
        assert_eq!(
            manager.evaluate_sell(Decimal::from(2), None).unwrap(),
            Decimal::from(2)
        );
        assert_eq!(
            manager
                .evaluate_sell(Decimal::from(2), Some(Decimal::ONE))
                .unwrap(),
            Decimal::ONE
        );
        assert!(matches!(
            manager.evaluate_sell(Decimal::ONE, Some(Decimal::from(3))),
            Err(RiskRejection::ExcessiveExit { .. })
        ));
    }
}
