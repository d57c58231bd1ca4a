use crate::models::{LearnedParameters, LearningState};
use log::warn;

/// Below this many resolved samples a symbol is still in cold start.
pub const MIN_SAMPLES_FOR_LEARNING: u32 = 3;

/// Parameters used before a symbol has enough history. Deliberately not neutral so
/// cold-start forecasts are distinguishable from trained ones.
pub const COLD_START_PARAMETERS: LearnedParameters = LearnedParameters {
    trend_multiplier: 1.15,
    volatility_adjustment: 0.85,
    momentum_weight: 1.25,
    direction_bias: 0.05,
    conservatism_factor: 0.9,
};

pub const TREND_MULTIPLIER_BOUNDS: (f64, f64) = (0.4, 2.5);
pub const VOLATILITY_ADJUSTMENT_BOUNDS: (f64, f64) = (0.2, 3.5);
pub const MOMENTUM_WEIGHT_BOUNDS: (f64, f64) = (0.1, 3.0);
pub const DIRECTION_BIAS_BOUNDS: (f64, f64) = (-0.2, 0.2);
pub const CONSERVATISM_BOUNDS: (f64, f64) = (0.5, 1.5);

pub fn derive_parameters(state: &LearningState) -> LearnedParameters {
    if state.sample_count < MIN_SAMPLES_FOR_LEARNING {
        return COLD_START_PARAMETERS;
    }

    let accuracy_edge = state.direction_accuracy - 50.0;

    let trend_multiplier = clamp_bounds(
        state.trend_bias + accuracy_edge * 0.02,
        TREND_MULTIPLIER_BOUNDS,
    );
    let volatility_adjustment = clamp_bounds(
        state.volatility_bias - state.avg_error.min(0.1) * 5.0,
        VOLATILITY_ADJUSTMENT_BOUNDS,
    );
    let momentum_weight = clamp_bounds(
        state.momentum_bias + accuracy_edge * 0.015,
        MOMENTUM_WEIGHT_BOUNDS,
    );

    let direction_bias = if state.direction_accuracy < 45.0 {
        -0.15
    } else if state.direction_accuracy > 75.0 {
        0.15
    } else {
        accuracy_edge * 0.003
    };

    let conservatism_factor = if state.avg_error > 0.02 {
        0.6
    } else if state.avg_error < 0.01 {
        1.4
    } else {
        1.0 - state.avg_error * 10.0
    };

    let parameters = LearnedParameters {
        trend_multiplier,
        volatility_adjustment,
        momentum_weight,
        direction_bias: clamp_bounds(direction_bias, DIRECTION_BIAS_BOUNDS),
        conservatism_factor: clamp_bounds(conservatism_factor, CONSERVATISM_BOUNDS),
    };

    if !parameters.is_finite() {
        warn!(
            "Learning state produced non-finite parameters ({:?}); using neutral parameters",
            state
        );
        return LearnedParameters::NEUTRAL;
    }

    parameters
}

// NaN falls through f64::clamp unchanged, so it is caught by the finite check above.
fn clamp_bounds(value: f64, (min, max): (f64, f64)) -> f64 {
    value.clamp(min, max)
}
