use crate::store::ConfidenceModulator;
use log::debug;
use std::sync::Mutex;

const NEUTRAL_ACCURACY: f64 = 50.0;
const MIN_BOLDNESS: f64 = 0.5;
const MAX_BOLDNESS: f64 = 1.5;

/// Tracks an EMA of accuracy scores and maps it onto a boldness multiplier:
/// 0 accuracy => 0.5, 50 => 1.0, 100 => 1.5.
pub struct BoldnessModulator {
    alpha: f64,
    inner: Mutex<ModulatorData>,
}

struct ModulatorData {
    accuracy_ema: f64,
    observations: u64,
}

impl Default for BoldnessModulator {
    fn default() -> Self {
        Self::new(0.1)
    }
}

impl BoldnessModulator {
    pub fn new(alpha: f64) -> Self {
        let alpha = if alpha.is_finite() {
            alpha.clamp(0.01, 1.0)
        } else {
            0.1
        };
        Self {
            alpha,
            inner: Mutex::new(ModulatorData {
                accuracy_ema: NEUTRAL_ACCURACY,
                observations: 0,
            }),
        }
    }

    pub fn accuracy_ema(&self) -> f64 {
        self.inner
            .lock()
            .map(|data| data.accuracy_ema)
            .unwrap_or(NEUTRAL_ACCURACY)
    }

    pub fn observations(&self) -> u64 {
        self.inner.lock().map(|data| data.observations).unwrap_or(0)
    }
}

impl ConfidenceModulator for BoldnessModulator {
    fn update_with_accuracy_result(&self, accuracy_score: f64) {
        if !accuracy_score.is_finite() {
            return;
        }
        let score = accuracy_score.clamp(0.0, 100.0);
        if let Ok(mut data) = self.inner.lock() {
            data.accuracy_ema = (1.0 - self.alpha) * data.accuracy_ema + self.alpha * score;
            data.observations += 1;
            debug!(
                "Accuracy EMA now {:.2} after {} observation(s)",
                data.accuracy_ema, data.observations
            );
        }
    }

    fn boldness_multiplier(&self) -> f64 {
        (MIN_BOLDNESS + self.accuracy_ema() / 100.0).clamp(MIN_BOLDNESS, MAX_BOLDNESS)
    }
}
