use crate::error::CalibrationError;
use crate::models::{ForecastComponents, LearnedParameters, TechnicalSnapshot};
use serde::Serialize;

const TREND_LOOKBACK_RETURNS: usize = 5;
const TREND_WEIGHT: f64 = 0.3;
const RSI_OVERSOLD: f64 = 30.0;
const RSI_OVERBOUGHT: f64 = 70.0;
// Fraction of price applied at the RSI extremes (0 or 100).
const RSI_MAX_REVERSION: f64 = 0.03;
const MACD_IMPULSE: f64 = 0.005;
const BOLLINGER_EDGE_RATIO: f64 = 0.8;
const BOLLINGER_REVERSION: f64 = 0.008;
const VOLATILITY_PASS_THROUGH: f64 = 0.5;

/// Tunables for the forecaster. The defaults are the production values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForecasterConfig {
    pub max_change_ratio: f64,
    pub base_confidence: f64,
    pub training_bonus_scale: f64,
    pub max_training_bonus: f64,
    pub confluence_points: f64,
    pub full_confluence_bonus: f64,
    pub large_move_ratio: f64,
    pub large_move_penalty: f64,
    pub min_confidence: f64,
    pub max_confidence: f64,
}

impl Default for ForecasterConfig {
    fn default() -> Self {
        Self {
            max_change_ratio: 0.025,
            base_confidence: 65.0,
            training_bonus_scale: 10.0,
            max_training_bonus: 15.0,
            confluence_points: 3.0,
            full_confluence_bonus: 5.0,
            large_move_ratio: 0.035,
            large_move_penalty: 10.0,
            min_confidence: 25.0,
            max_confidence: 95.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastOutcome {
    pub predicted_price: f64,
    pub confidence: f64,
    pub components: ForecastComponents,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Forecaster {
    config: ForecasterConfig,
}

impl Forecaster {
    pub fn new(config: ForecasterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ForecasterConfig {
        &self.config
    }

    /// Pure and deterministic: identical inputs always yield identical output.
    pub fn forecast(
        &self,
        current_price: f64,
        snapshot: &TechnicalSnapshot,
        price_history: &[f64],
        parameters: &LearnedParameters,
    ) -> Result<ForecastOutcome, CalibrationError> {
        if !current_price.is_finite() || current_price <= 0.0 {
            return Err(CalibrationError::ComputationError(format!(
                "current price must be a positive finite number (got {})",
                current_price
            )));
        }

        let snapshot = if snapshot.is_well_formed() {
            *snapshot
        } else {
            snapshot.sanitized(current_price)
        };
        let parameters = if parameters.is_finite() {
            *parameters
        } else {
            LearnedParameters::NEUTRAL
        };

        let mut components = ForecastComponents {
            trend: trend_component(current_price, price_history),
            rsi: rsi_component(current_price, snapshot.rsi),
            macd: macd_component(current_price, snapshot.macd),
            bollinger: bollinger_component(current_price, &snapshot),
            volatility: snapshot.volatility * current_price * VOLATILITY_PASS_THROUGH,
            ..ForecastComponents::default()
        };
        components.raw_change = components.trend
            + components.rsi
            + components.macd
            + components.bollinger
            + components.volatility;

        // Application order is fixed; the steps do not commute once the additive bias is in.
        let mut change = components.raw_change;
        change *= parameters.trend_multiplier;
        change *= parameters.volatility_adjustment;
        change *= parameters.momentum_weight;
        change += current_price * parameters.direction_bias;
        change *= parameters.conservatism_factor;
        components.adjusted_change = change;

        let ceiling = current_price * self.config.max_change_ratio;
        let final_change = change.clamp(-ceiling, ceiling);
        components.was_clamped = final_change != change;
        components.final_change = final_change;

        let predicted_price = current_price + final_change;
        let confidence = self.confidence(current_price, final_change, &snapshot, &parameters);

        Ok(ForecastOutcome {
            predicted_price,
            confidence,
            components,
        })
    }

    fn confidence(
        &self,
        current_price: f64,
        final_change: f64,
        snapshot: &TechnicalSnapshot,
        parameters: &LearnedParameters,
    ) -> f64 {
        let config = &self.config;
        let mut confidence = config.base_confidence;

        let deviation = (parameters.trend_multiplier - 1.0).abs()
            + (parameters.volatility_adjustment - 1.0).abs()
            + (parameters.momentum_weight - 1.0).abs()
            + parameters.direction_bias.abs() * 5.0
            + (parameters.conservatism_factor - 1.0).abs();
        confidence += (deviation * config.training_bonus_scale).min(config.max_training_bonus);

        let bullish = [
            snapshot.rsi > 50.0,
            snapshot.macd > 0.0,
            snapshot.stochastic_k > 50.0,
        ]
        .iter()
        .filter(|&&vote| vote)
        .count();
        let agreeing = bullish.max(3 - bullish);
        confidence += agreeing as f64 * config.confluence_points;
        if agreeing == 3 {
            confidence += config.full_confluence_bonus;
        }

        if (final_change / current_price).abs() > config.large_move_ratio {
            confidence -= config.large_move_penalty;
        }

        confidence.clamp(config.min_confidence, config.max_confidence)
    }
}

fn trend_component(current_price: f64, price_history: &[f64]) -> f64 {
    let window_start = price_history
        .len()
        .saturating_sub(TREND_LOOKBACK_RETURNS + 1);
    let returns: Vec<f64> = price_history[window_start..]
        .windows(2)
        .filter(|pair| pair[0].is_finite() && pair[1].is_finite() && pair[0] > 0.0)
        .map(|pair| (pair[1] - pair[0]) / pair[0])
        .collect();
    if returns.is_empty() {
        return 0.0;
    }
    let mean_return = returns.iter().sum::<f64>() / returns.len() as f64;
    mean_return * TREND_WEIGHT * current_price
}

fn rsi_component(current_price: f64, rsi: f64) -> f64 {
    if rsi > RSI_OVERBOUGHT {
        -current_price * (rsi - RSI_OVERBOUGHT) / (100.0 - RSI_OVERBOUGHT) * RSI_MAX_REVERSION
    } else if rsi < RSI_OVERSOLD {
        current_price * (RSI_OVERSOLD - rsi) / RSI_OVERSOLD * RSI_MAX_REVERSION
    } else {
        0.0
    }
}

fn macd_component(current_price: f64, macd: f64) -> f64 {
    if macd > 0.0 {
        current_price * MACD_IMPULSE
    } else if macd < 0.0 {
        -current_price * MACD_IMPULSE
    } else {
        0.0
    }
}

fn bollinger_component(current_price: f64, snapshot: &TechnicalSnapshot) -> f64 {
    let bands = &snapshot.bollinger;
    let half_width = (bands.upper - bands.lower) / 2.0;
    if half_width <= 0.0 {
        return 0.0;
    }
    let displacement = current_price - bands.middle;
    if displacement.abs() <= half_width * BOLLINGER_EDGE_RATIO {
        return 0.0;
    }
    -displacement.signum() * current_price * BOLLINGER_REVERSION
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BollingerBands;
    use crate::parameters::COLD_START_PARAMETERS;

    fn overbought_snapshot() -> TechnicalSnapshot {
        TechnicalSnapshot {
            rsi: 80.0,
            macd: 0.2,
            volatility: 0.0,
            stochastic_k: 60.0,
            bollinger: BollingerBands {
                upper: 102.0,
                middle: 100.0,
                lower: 98.0,
            },
            volume: 1_000_000.0,
        }
    }

    fn quiet_snapshot() -> TechnicalSnapshot {
        TechnicalSnapshot {
            rsi: 50.0,
            macd: 0.0,
            volatility: 0.0,
            stochastic_k: 50.0,
            bollinger: BollingerBands {
                upper: 102.0,
                middle: 100.0,
                lower: 98.0,
            },
            volume: 0.0,
        }
    }

    #[test]
    fn overbought_rsi_pulls_forecast_down() {
        let forecaster = Forecaster::default();
        let outcome = forecaster
            .forecast(
                100.0,
                &overbought_snapshot(),
                &[100.0; 6],
                &LearnedParameters::NEUTRAL,
            )
            .unwrap();

        assert!(outcome.predicted_price < 100.0);
        assert!(outcome.predicted_price >= 97.5);
        assert_eq!(outcome.components.trend, 0.0);
        assert_eq!(outcome.components.bollinger, 0.0);
        assert!((outcome.components.rsi + 1.0).abs() < 1e-9);
        assert!((outcome.components.macd - 0.5).abs() < 1e-9);
        assert!((outcome.predicted_price - 99.5).abs() < 1e-9);
    }

    #[test]
    fn forecast_is_deterministic() {
        let forecaster = Forecaster::default();
        let history = [98.0, 98.5, 99.2, 99.0, 99.6, 100.0];
        let first = forecaster
            .forecast(100.0, &overbought_snapshot(), &history, &COLD_START_PARAMETERS)
            .unwrap();
        for _ in 0..10 {
            let again = forecaster
                .forecast(100.0, &overbought_snapshot(), &history, &COLD_START_PARAMETERS)
                .unwrap();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn change_never_exceeds_ceiling() {
        let forecaster = Forecaster::default();
        let aggressive = LearnedParameters {
            trend_multiplier: 2.5,
            volatility_adjustment: 3.5,
            momentum_weight: 3.0,
            direction_bias: 0.2,
            conservatism_factor: 1.5,
        };
        let mut snapshot = quiet_snapshot();
        snapshot.rsi = 5.0;
        snapshot.macd = 3.0;
        snapshot.volatility = 0.4;
        snapshot.bollinger = BollingerBands {
            upper: 260.0,
            middle: 250.0,
            lower: 240.0,
        };
        let history = [100.0, 110.0, 121.0, 133.0, 146.0, 160.0];

        let outcome = forecaster
            .forecast(200.0, &snapshot, &history, &aggressive)
            .unwrap();
        assert!(outcome.components.was_clamped);
        assert!((outcome.predicted_price - 205.0).abs() < 1e-9);

        let mut bearish = snapshot;
        bearish.rsi = 99.0;
        bearish.macd = -3.0;
        bearish.volatility = 0.0;
        let bearish_parameters = LearnedParameters {
            direction_bias: -0.2,
            ..aggressive
        };
        let outcome = forecaster
            .forecast(200.0, &bearish, &[200.0], &bearish_parameters)
            .unwrap();
        assert!((outcome.predicted_price - 195.0).abs() < 1e-9);
    }

    #[test]
    fn parameters_apply_in_fixed_order() {
        let forecaster = Forecaster::default();
        let mut snapshot = quiet_snapshot();
        snapshot.macd = 1.0;
        let parameters = LearnedParameters {
            trend_multiplier: 1.2,
            volatility_adjustment: 0.5,
            momentum_weight: 2.0,
            direction_bias: 0.001,
            conservatism_factor: 0.5,
        };
        let outcome = forecaster
            .forecast(100.0, &snapshot, &[], &parameters)
            .unwrap();
        // ((0.5 * 1.2 * 0.5 * 2.0) + 0.1) * 0.5
        assert!((outcome.components.adjusted_change - 0.35).abs() < 1e-9);
        assert!((outcome.predicted_price - 100.35).abs() < 1e-9);
    }

    #[test]
    fn bollinger_reverts_only_near_band_edges() {
        let forecaster = Forecaster::default();
        let snapshot = quiet_snapshot();
        let near_upper = forecaster
            .forecast(101.9, &snapshot, &[], &LearnedParameters::NEUTRAL)
            .unwrap();
        assert!((near_upper.components.bollinger + 101.9 * 0.008).abs() < 1e-9);

        let inside = forecaster
            .forecast(101.5, &snapshot, &[], &LearnedParameters::NEUTRAL)
            .unwrap();
        assert_eq!(inside.components.bollinger, 0.0);

        let near_lower = forecaster
            .forecast(98.0, &snapshot, &[], &LearnedParameters::NEUTRAL)
            .unwrap();
        assert!(near_lower.components.bollinger > 0.0);
    }

    #[test]
    fn trend_uses_only_last_five_returns() {
        let forecaster = Forecaster::default();
        let history = [50.0, 100.0, 100.0, 100.0, 100.0, 100.0, 100.0];
        let outcome = forecaster
            .forecast(100.0, &quiet_snapshot(), &history, &LearnedParameters::NEUTRAL)
            .unwrap();
        assert_eq!(outcome.components.trend, 0.0);

        let rising = [100.0, 101.0, 102.01, 103.0301, 104.060401, 105.10100501];
        let outcome = forecaster
            .forecast(100.0, &quiet_snapshot(), &rising, &LearnedParameters::NEUTRAL)
            .unwrap();
        assert!((outcome.components.trend - 0.3).abs() < 1e-9);
    }

    #[test]
    fn confidence_rewards_confluence_and_training() {
        let forecaster = Forecaster::default();
        let mut aligned = quiet_snapshot();
        aligned.rsi = 60.0;
        aligned.macd = 0.5;
        aligned.stochastic_k = 70.0;

        let neutral = forecaster
            .forecast(100.0, &aligned, &[], &LearnedParameters::NEUTRAL)
            .unwrap();
        // 65 + 0 training + 3 * 3 + 5
        assert!((neutral.confidence - 79.0).abs() < 1e-9);

        let trained = forecaster
            .forecast(100.0, &aligned, &[], &COLD_START_PARAMETERS)
            .unwrap();
        assert!(trained.confidence > neutral.confidence);

        let mut split = aligned;
        split.macd = -0.5;
        let split_outcome = forecaster
            .forecast(100.0, &split, &[], &LearnedParameters::NEUTRAL)
            .unwrap();
        assert!((split_outcome.confidence - 71.0).abs() < 1e-9);
    }

    #[test]
    fn confidence_stays_in_range_and_penalises_large_moves() {
        let forecaster = Forecaster::new(ForecasterConfig {
            max_change_ratio: 0.05,
            ..ForecasterConfig::default()
        });
        let mut snapshot = quiet_snapshot();
        snapshot.macd = 1.0;
        let big_bias = LearnedParameters {
            direction_bias: 0.2,
            ..LearnedParameters::NEUTRAL
        };
        let outcome = forecaster
            .forecast(100.0, &snapshot, &[], &big_bias)
            .unwrap();
        assert!(outcome.components.final_change / 100.0 > 0.035);
        // 65 + 10 training + 2 * 3 non-bullish votes - 10 penalty
        assert!((outcome.confidence - 71.0).abs() < 1e-9);

        let extreme = LearnedParameters {
            trend_multiplier: 2.5,
            volatility_adjustment: 3.5,
            momentum_weight: 3.0,
            direction_bias: 0.2,
            conservatism_factor: 1.5,
        };
        let mut aligned = snapshot;
        aligned.rsi = 90.0;
        aligned.stochastic_k = 90.0;
        let outcome = Forecaster::default()
            .forecast(100.0, &aligned, &[], &extreme)
            .unwrap();
        assert!(outcome.confidence <= 95.0 && outcome.confidence >= 25.0);
    }

    #[test]
    fn malformed_inputs_still_produce_a_forecast() {
        let forecaster = Forecaster::default();
        let mut snapshot = overbought_snapshot();
        snapshot.rsi = f64::NAN;
        snapshot.volatility = f64::INFINITY;
        let broken = LearnedParameters {
            trend_multiplier: f64::NAN,
            ..LearnedParameters::NEUTRAL
        };
        let outcome = forecaster
            .forecast(100.0, &snapshot, &[100.0, f64::NAN, 100.0], &broken)
            .unwrap();
        assert!(outcome.predicted_price.is_finite());
        assert!(outcome.confidence >= 25.0 && outcome.confidence <= 95.0);
        assert_eq!(outcome.components.rsi, 0.0);
    }

    #[test]
    fn rejects_unusable_current_price() {
        let forecaster = Forecaster::default();
        let error = forecaster
            .forecast(0.0, &quiet_snapshot(), &[], &LearnedParameters::NEUTRAL)
            .unwrap_err();
        assert!(matches!(error, CalibrationError::ComputationError(_)));
    }
}
