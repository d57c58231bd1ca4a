use crate::models::{ForecastRecord, LearnedParameters, LearningState};
use crate::parameters::derive_parameters;
use crate::store::ForecastStore;
use dashmap::DashMap;
use log::{debug, warn};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, OnceCell};

pub const DEFAULT_HISTORY_WINDOW: usize = 50;
pub const DEFAULT_SAMPLE_CAP: u32 = 100;
pub const SMOOTHING_ALPHA: f64 = 0.1;

const BIAS_BOUNDS: (f64, f64) = (0.5, 1.5);
const TREND_DEVIATION_SCALE: f64 = 20.0;
const VOLATILITY_DEVIATION_SCALE: f64 = 10.0;
// Floors the denominator when the actual move was essentially zero.
const MIN_RELATIVE_MOVE: f64 = 0.001;

struct SymbolEntry {
    initialized: OnceCell<()>,
    write_lock: Mutex<()>,
    state: RwLock<LearningState>,
}

impl SymbolEntry {
    fn new() -> Self {
        Self {
            initialized: OnceCell::new(),
            write_lock: Mutex::new(()),
            state: RwLock::new(LearningState::default()),
        }
    }

    fn read(&self) -> LearningState {
        self.state
            .read()
            .map(|state| *state)
            .unwrap_or_default()
    }

    fn replace(&self, next: LearningState) {
        match self.state.write() {
            Ok(mut state) => *state = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}

/// Per-symbol learning state. Symbols are loaded lazily from resolved history exactly
/// once per process; writes are serialised per symbol and never block other symbols.
pub struct LearningStateStore {
    history: Arc<dyn ForecastStore>,
    entries: DashMap<String, Arc<SymbolEntry>>,
    history_window: usize,
    sample_cap: u32,
}

impl LearningStateStore {
    pub fn new(history: Arc<dyn ForecastStore>) -> Self {
        Self::with_limits(history, DEFAULT_HISTORY_WINDOW, DEFAULT_SAMPLE_CAP)
    }

    pub fn with_limits(
        history: Arc<dyn ForecastStore>,
        history_window: usize,
        sample_cap: u32,
    ) -> Self {
        Self {
            history,
            entries: DashMap::new(),
            history_window: history_window.max(1),
            sample_cap: sample_cap.max(1),
        }
    }

    fn entry(&self, symbol: &str) -> Arc<SymbolEntry> {
        if let Some(existing) = self.entries.get(symbol) {
            return existing.value().clone();
        }
        self.entries
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(SymbolEntry::new()))
            .value()
            .clone()
    }

    async fn ensure_loaded(&self, symbol: &str, entry: &SymbolEntry) {
        entry
            .initialized
            .get_or_init(|| async move {
                let _writer = entry.write_lock.lock().await;
                let state = self.load_from_history(symbol).await;
                entry.replace(state);
            })
            .await;
    }

    /// Recomputes the state for `symbol` from its most recent resolved forecasts.
    /// Never fails: an unreachable history source yields the cold-start state.
    pub async fn load_from_history(&self, symbol: &str) -> LearningState {
        match self
            .history
            .load_recent_resolved(symbol, self.history_window)
            .await
        {
            Ok(records) => {
                let state = compute_learning_state(&records, self.history_window);
                debug!(
                    "Loaded learning state for {} from {} resolved forecast(s)",
                    symbol, state.sample_count
                );
                state
            }
            Err(err) => {
                warn!(
                    "Forecast history unavailable for {}; using cold-start learning state: {}",
                    symbol, err
                );
                LearningState::default()
            }
        }
    }

    /// Consistent snapshot of the current state, loading it on first access.
    pub async fn snapshot(&self, symbol: &str) -> LearningState {
        let entry = self.entry(symbol);
        self.ensure_loaded(symbol, &entry).await;
        entry.read()
    }

    pub async fn learned_parameters(&self, symbol: &str) -> LearnedParameters {
        derive_parameters(&self.snapshot(symbol).await)
    }

    /// Folds one resolved forecast into the symbol's state.
    pub async fn update(
        &self,
        symbol: &str,
        original_price: f64,
        predicted_price: f64,
        actual_price: f64,
    ) -> LearningState {
        let entry = self.entry(symbol);
        self.ensure_loaded(symbol, &entry).await;

        let _writer = entry.write_lock.lock().await;
        let current = entry.read();
        let Some(next) = apply_outcome(
            &current,
            original_price,
            predicted_price,
            actual_price,
            self.sample_cap,
        ) else {
            warn!(
                "Ignoring learning update for {} with unusable prices (original {}, predicted {}, actual {})",
                symbol, original_price, predicted_price, actual_price
            );
            return current;
        };
        entry.replace(next);
        next
    }

    /// Forces a reload from history, replacing whatever is held in memory.
    pub async fn refresh(&self, symbol: &str) -> LearningState {
        let entry = self.entry(symbol);
        let _writer = entry.write_lock.lock().await;
        let state = self.load_from_history(symbol).await;
        entry.replace(state);
        let _ = entry.initialized.set(());
        state
    }

    pub fn tracked_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        symbols.sort();
        symbols
    }
}

/// Batch statistics over resolved forecasts. Records without an actual price, or with
/// non-positive prices, are ignored.
pub fn compute_learning_state(records: &[ForecastRecord], window: usize) -> LearningState {
    let samples: Vec<(f64, f64, f64)> = records
        .iter()
        .filter_map(|record| {
            let actual = record.actual_price?;
            let usable = [record.original_price, record.predicted_price, actual]
                .iter()
                .all(|price| price.is_finite() && *price > 0.0);
            usable.then_some((record.original_price, record.predicted_price, actual))
        })
        .take(window)
        .collect();

    if samples.is_empty() {
        return LearningState::default();
    }

    let count = samples.len() as f64;
    let mut direction_hits = 0usize;
    let mut relative_magnitude_error = 0.0;
    let mut price_error = 0.0;
    let mut signed_deviation = 0.0;
    let mut unsigned_deviation = 0.0;

    for &(original, predicted, actual) in &samples {
        let predicted_return = (predicted - original) / original;
        let actual_return = (actual - original) / original;

        if sign(predicted - original) == sign(actual - original) {
            direction_hits += 1;
        }

        let magnitude_miss = (predicted_return - actual_return).abs()
            / actual_return.abs().max(MIN_RELATIVE_MOVE);
        relative_magnitude_error += (magnitude_miss * 100.0).min(100.0);

        price_error += (predicted - actual).abs() / actual;

        // Positive when the market moved further in the predicted direction than forecast.
        signed_deviation +=
            (actual_return - predicted_return) * f64::from(sign(predicted - original));
        unsigned_deviation += (actual_return - predicted_return).abs();
    }

    let direction_accuracy = direction_hits as f64 / count * 100.0;
    let momentum_bias = if direction_accuracy > 60.0 {
        1.1
    } else if direction_accuracy < 40.0 {
        0.9
    } else {
        1.0
    };

    LearningState {
        avg_error: price_error / count,
        direction_accuracy,
        magnitude_accuracy: (100.0 - relative_magnitude_error / count).max(0.0),
        sample_count: samples.len() as u32,
        trend_bias: clamp_bias(1.0 + signed_deviation / count * TREND_DEVIATION_SCALE),
        volatility_bias: clamp_bias(
            1.0 - unsigned_deviation / count * VOLATILITY_DEVIATION_SCALE,
        ),
        momentum_bias,
    }
}

/// Exponential-moving-average update for a single outcome. Returns `None` for prices
/// that cannot be compared.
pub fn apply_outcome(
    state: &LearningState,
    original_price: f64,
    predicted_price: f64,
    actual_price: f64,
    sample_cap: u32,
) -> Option<LearningState> {
    let usable = [original_price, predicted_price, actual_price]
        .iter()
        .all(|price| price.is_finite() && *price > 0.0);
    if !usable {
        return None;
    }

    let predicted_move = (predicted_price - original_price).abs();
    let actual_move = (actual_price - original_price).abs();
    let target = if predicted_move > f64::EPSILON {
        clamp_bias(actual_move / predicted_move)
    } else if actual_move > f64::EPSILON {
        BIAS_BOUNDS.1
    } else {
        1.0
    };

    let error = (predicted_price - actual_price).abs() / actual_price;

    Some(LearningState {
        trend_bias: clamp_bias(
            (1.0 - SMOOTHING_ALPHA) * state.trend_bias + SMOOTHING_ALPHA * target,
        ),
        avg_error: (1.0 - SMOOTHING_ALPHA) * state.avg_error + SMOOTHING_ALPHA * error,
        sample_count: state.sample_count.saturating_add(1).min(sample_cap),
        ..*state
    })
}

fn clamp_bias(value: f64) -> f64 {
    if !value.is_finite() {
        return 1.0;
    }
    value.clamp(BIAS_BOUNDS.0, BIAS_BOUNDS.1)
}

fn sign(value: f64) -> i8 {
    if value > 0.0 {
        1
    } else if value < 0.0 {
        -1
    } else {
        0
    }
}
