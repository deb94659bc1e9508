//! The signal refiner: a pure function from candles and parameters to a
//! discrete action with a confidence score, plus its stability audit.

use chrono::Duration;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use skiff_core::{Candle, Quantity, Regime, SignalAction};
use skiff_indicators::{IndicatorSet, ReadyIndicators};

use crate::StrategyParameters;

/// Bars required before the refiner will score a setup.
pub const MIN_DECISION_BARS: usize = 50;

const TREND_GAP: f64 = 0.0015;
const PULLBACK_NORM: f64 = 0.0035;
const MOMENTUM_NORM: f64 = 0.004;
const RELAX_CAP: f64 = 0.08;
const RANGING_BUFFER: f64 = 0.04;
const RANGING_BUFFER_IDLE: f64 = 0.01;
const BUY_CONFIDENCE_FLOOR: f64 = 0.62;

/// Per-evaluation inputs that are not part of the candle history.
#[derive(Clone, Copy, Debug)]
pub struct DecisionContext {
    /// Current holdings for the symbol; SELL signals require exposure.
    pub holdings: Quantity,
    /// Time since the last executed trade for the symbol.
    pub idle_for: Duration,
    /// Strategy version stamped onto the assessment.
    pub model_version: u64,
}

/// Output of one refiner evaluation.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Assessment {
    pub action: SignalAction,
    pub confidence: f64,
    pub regime: Regime,
    pub score: f64,
    pub reasons: Vec<String>,
    pub model_version: u64,
    pub inputs_hash: String,
}

fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

fn regime_penalty(regime: Regime) -> f64 {
    match regime {
        Regime::TrendingUp => 0.0,
        Regime::Ranging => 0.05,
        Regime::TrendingDown => 0.08,
        Regime::Chop => 0.12,
        Regime::HighVolatility => 0.15,
    }
}

fn classify_regime(ind: &ReadyIndicators, close: f64, params: &StrategyParameters) -> Regime {
    let atr_pct = ind.atr / close;
    if atr_pct < params.min_atr_pct {
        return Regime::Chop;
    }
    if atr_pct > 1.2 * params.max_atr_pct {
        return Regime::HighVolatility;
    }
    let gap = (ind.ema_short - ind.ema_long) / close;
    if gap > TREND_GAP && close >= ind.ema_short {
        Regime::TrendingUp
    } else if gap < -TREND_GAP && close <= ind.ema_short {
        Regime::TrendingDown
    } else {
        Regime::Ranging
    }
}

struct SetupScore {
    total: f64,
    pullback: f64,
    rsi_recovery: f64,
    momentum: f64,
    volume: f64,
    trend: f64,
}

fn setup_score(ind: &ReadyIndicators, closes: &[f64], regime: Regime) -> SetupScore {
    let close = closes[closes.len() - 1];
    let prev = closes[closes.len() - 2];
    let prev_prev = closes[closes.len() - 3];

    let pullback = clamp01(1.0 - ((close - ind.ema_short).abs() / close) / PULLBACK_NORM);

    let rsi_rising = ind.rsi > ind.prev_rsi;
    let rsi_recovery = clamp01((ind.rsi - 45.0) / 20.0 + if rsi_rising { 0.2 } else { 0.0 });

    let ret = close / prev - 1.0;
    let prev_ret = prev / prev_prev - 1.0;
    let momentum = clamp01(ret / MOMENTUM_NORM + if ret > prev_ret { 0.3 } else { 0.0 });

    let volume = clamp01((ind.volume_ratio - 0.9) / 0.4);

    let trend = match regime {
        Regime::TrendingUp => 1.0,
        Regime::Ranging => 0.45,
        _ => 0.0,
    };

    let total = 0.22 * pullback + 0.20 * rsi_recovery + 0.20 * momentum + 0.16 * volume
        + 0.22 * trend;
    SetupScore {
        total,
        pullback,
        rsi_recovery,
        momentum,
        volume,
        trend,
    }
}

/// Linear relaxation of the minimum score after a quiet spell: nothing for
/// the first two idle hours, then up to 0.08 over the following twelve.
fn inactivity_relax(idle_for: Duration) -> f64 {
    let idle_hours = idle_for.num_minutes() as f64 / 60.0;
    if idle_hours < 2.0 {
        return 0.0;
    }
    (RELAX_CAP * (idle_hours - 2.0) / 12.0).min(RELAX_CAP)
}

fn inputs_hash(candles: &[Candle], params: &StrategyParameters, model_version: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model_version.to_le_bytes());
    hasher.update(params.min_score.to_le_bytes());
    hasher.update(params.atr_multiplier.to_le_bytes());
    hasher.update(params.stop_loss_atr.to_le_bytes());
    for candle in candles {
        hasher.update(candle.timestamp.timestamp_millis().to_le_bytes());
        hasher.update(
            candle
                .close
                .to_f64()
                .unwrap_or_default()
                .to_le_bytes(),
        );
    }
    let digest = hasher.finalize();
    digest.iter().take(16).fold(String::new(), |mut acc, byte| {
        use std::fmt::Write;
        let _ = write!(acc, "{byte:02x}");
        acc
    })
}

fn hold(
    reason: String,
    regime: Regime,
    confidence: f64,
    candles: &[Candle],
    params: &StrategyParameters,
    ctx: &DecisionContext,
) -> Assessment {
    Assessment {
        action: SignalAction::Hold,
        confidence,
        regime,
        score: 0.0,
        reasons: vec![reason],
        model_version: ctx.model_version,
        inputs_hash: inputs_hash(candles, params, ctx.model_version),
    }
}

/// Derive `{action, confidence, regime, reasons}` from closed candles and
/// the committed parameters. Pure: identical inputs yield bit-identical
/// output.
pub fn decide(
    candles: &[Candle],
    params: &StrategyParameters,
    ctx: &DecisionContext,
) -> Assessment {
    if candles.len() < MIN_DECISION_BARS {
        return hold(
            format!("insufficient history ({} bars)", candles.len()),
            Regime::Ranging,
            0.2,
            candles,
            params,
            ctx,
        );
    }

    let mut set = IndicatorSet::standard().expect("standard indicator periods are valid");
    let mut snapshot = None;
    for candle in candles {
        snapshot = Some(set.update(candle));
    }
    let ind = match snapshot.and_then(|snapshot| snapshot.ready()) {
        Some(ind) => ind,
        None => {
            return hold(
                "indicator windows still seeding".into(),
                Regime::Ranging,
                0.2,
                candles,
                params,
                ctx,
            );
        }
    };

    let closes: Vec<f64> = candles
        .iter()
        .map(|candle| candle.close.to_f64().unwrap_or_default())
        .collect();
    let close = closes[closes.len() - 1];
    if close <= 0.0 {
        return hold(
            "non-positive close".into(),
            Regime::Ranging,
            0.1,
            candles,
            params,
            ctx,
        );
    }

    let regime = classify_regime(&ind, close, params);
    let score = setup_score(&ind, &closes, regime);
    let relax = inactivity_relax(ctx.idle_for);
    let effective_min = params.min_score - relax;

    let mut reasons = vec![
        format!("regime={regime:?}"),
        format!(
            "score={:.3} (pullback={:.2} rsi={:.2} momentum={:.2} volume={:.2} trend={:.2})",
            score.total,
            score.pullback,
            score.rsi_recovery,
            score.momentum,
            score.volume,
            score.trend
        ),
    ];
    if relax > 0.0 {
        reasons.push(format!(
            "inactivity relax {:.3} after {}m idle",
            relax,
            ctx.idle_for.num_minutes()
        ));
    }

    let holdings_open = ctx.holdings > Decimal::ZERO;
    let action = match regime {
        Regime::TrendingUp if score.total >= effective_min => {
            reasons.push(format!(
                "trend entry: score {:.3} >= min {:.3}",
                score.total, effective_min
            ));
            SignalAction::Buy
        }
        Regime::Ranging => {
            let buffer = if ctx.idle_for >= Duration::hours(6) {
                RANGING_BUFFER_IDLE
            } else {
                RANGING_BUFFER
            };
            let threshold = effective_min + buffer;
            if score.total >= threshold && score.rsi_recovery >= 0.55 && score.momentum >= 0.5 {
                reasons.push(format!(
                    "ranging entry: score {:.3} >= min+buffer {:.3}",
                    score.total, threshold
                ));
                SignalAction::Buy
            } else {
                SignalAction::Hold
            }
        }
        Regime::TrendingDown | Regime::HighVolatility if holdings_open => {
            reasons.push("protective exit: adverse regime with open exposure".into());
            SignalAction::Sell
        }
        _ => SignalAction::Hold,
    };

    let mut confidence =
        (0.35 + 0.55 * score.total - regime_penalty(regime)).clamp(0.1, 0.95);
    if action == SignalAction::Buy {
        confidence = confidence.max(BUY_CONFIDENCE_FLOOR);
    }

    Assessment {
        action,
        confidence,
        regime,
        score: score.total,
        reasons,
        model_version: ctx.model_version,
        inputs_hash: inputs_hash(candles, params, ctx.model_version),
    }
}

/// Result of the deterministic stability audit.
#[derive(Clone, Debug, PartialEq)]
pub struct StabilityReport {
    /// 100 identical evaluations produced an identical action with
    /// confidence drift below 1e-12.
    pub deterministic: bool,
    pub max_confidence_delta: f64,
    /// How many of the perturbed trials agreed with the baseline action.
    pub agreement: usize,
    pub trials: usize,
}

impl StabilityReport {
    /// The perturbation test passes at >= 60% agreement.
    #[must_use]
    pub fn robust(&self) -> bool {
        self.agreement * 100 >= self.trials * 60
    }
}

fn perturbation_unit(trial: usize, index: usize) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(b"stability");
    hasher.update((trial as u64).to_le_bytes());
    hasher.update((index as u64).to_le_bytes());
    let digest = hasher.finalize();
    let raw = u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
    raw as f64 / u64::MAX as f64
}

/// Run the refiner 100 times on identical input and 20 times on inputs
/// with closes perturbed by up to +-0.1%.
pub fn stability_audit(
    candles: &[Candle],
    params: &StrategyParameters,
    ctx: &DecisionContext,
) -> StabilityReport {
    let baseline = decide(candles, params, ctx);
    let mut deterministic = true;
    let mut max_delta = 0.0_f64;
    for _ in 0..100 {
        let run = decide(candles, params, ctx);
        let delta = (run.confidence - baseline.confidence).abs();
        max_delta = max_delta.max(delta);
        if run.action != baseline.action || delta >= 1e-12 {
            deterministic = false;
        }
    }

    let trials = 20;
    let mut agreement = 0;
    for trial in 0..trials {
        let perturbed: Vec<Candle> = candles
            .iter()
            .enumerate()
            .map(|(index, candle)| {
                let unit = perturbation_unit(trial, index);
                let factor = Decimal::try_from(1.0 + (unit * 2.0 - 1.0) * 0.001)
                    .unwrap_or(Decimal::ONE);
                let close = candle.close * factor;
                let mut bar = candle.clone();
                bar.close = close;
                bar.high = bar.high.max(close);
                bar.low = bar.low.min(close);
                bar
            })
            .collect();
        if decide(&perturbed, params, ctx).action == baseline.action {
            agreement += 1;
        }
    }

    StabilityReport {
        deterministic,
        max_confidence_delta: max_delta,
        agreement,
        trials,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use rust_decimal::prelude::FromPrimitive;
    use skiff_core::Interval;

    use super::*;

    fn ctx() -> DecisionContext {
        DecisionContext {
            holdings: Decimal::ZERO,
            idle_for: Duration::minutes(10),
            model_version: 1,
        }
    }

    fn candles(n: usize, step: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = 60_000.0 + step * i as f64;
                Candle {
                    symbol: "BTC-USDC".into(),
                    interval: Interval::OneHour,
                    open: Decimal::from_f64(close - step).unwrap(),
                    high: Decimal::from_f64(close + 180.0).unwrap(),
                    low: Decimal::from_f64(close - 180.0).unwrap(),
                    close: Decimal::from_f64(close).unwrap(),
                    volume: Decimal::from(100 + (i % 7) as u64 * 10),
                    timestamp: Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap()
                        + Duration::hours(i as i64),
                }
            })
            .collect()
    }

    #[test]
    fn short_history_holds_with_low_confidence() {
        let assessment = decide(&candles(10, 10.0), &StrategyParameters::default(), &ctx());
        assert_eq!(assessment.action, SignalAction::Hold);
        assert!((assessment.confidence - 0.2).abs() < f64::EPSILON);
        assert!(assessment.reasons[0].contains("insufficient history"));
    }

    #[test]
    fn decide_is_deterministic_over_100_runs() {
        let bars = candles(60, 10.0);
        let report = stability_audit(&bars, &StrategyParameters::default(), &ctx());
        assert!(report.deterministic, "drift {}", report.max_confidence_delta);
        assert!(report.max_confidence_delta < 1e-12);
    }

    #[test]
    fn perturbed_closes_mostly_preserve_the_action() {
        // A firm downtrend keeps the regime classification well clear of
        // its thresholds, so +-0.1% close noise should not flip the action.
        let bars = candles(80, -40.0);
        let report = stability_audit(&bars, &StrategyParameters::default(), &ctx());
        assert!(
            report.robust(),
            "only {}/{} trials agreed",
            report.agreement,
            report.trials
        );
    }

    #[test]
    fn adverse_regime_with_exposure_sells() {
        let bars = candles(80, -40.0);
        let context = DecisionContext {
            holdings: Decimal::ONE,
            ..ctx()
        };
        let assessment = decide(&bars, &StrategyParameters::default(), &context);
        assert_eq!(assessment.regime, Regime::TrendingDown);
        assert_eq!(assessment.action, SignalAction::Sell);
    }

    #[test]
    fn buy_confidence_is_floored() {
        let bars = candles(120, 45.0);
        let assessment = decide(&bars, &StrategyParameters::default(), &ctx());
        if assessment.action == SignalAction::Buy {
            assert!(assessment.confidence >= BUY_CONFIDENCE_FLOOR);
        }
    }

    #[test]
    fn inactivity_relaxation_is_linear_and_capped() {
        assert_eq!(inactivity_relax(Duration::minutes(30)), 0.0);
        let mid = inactivity_relax(Duration::hours(8));
        assert!((mid - 0.04).abs() < 1e-9);
        assert_eq!(inactivity_relax(Duration::hours(30)), RELAX_CAP);
    }

    #[test]
    fn confidence_stays_inside_bounds() {
        for step in [-60.0, -5.0, 0.0, 5.0, 60.0] {
            let assessment = decide(&candles(70, step), &StrategyParameters::default(), &ctx());
            assert!((0.1..=0.95).contains(&assessment.confidence));
        }
    }
}
