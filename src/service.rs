use crate::error::CalibrationError;
use crate::forecaster::Forecaster;
use crate::learning::LearningStateStore;
use crate::models::{
    ForecastRecord, ForecastState, LearnedParameters, TechnicalSnapshot, MAX_HORIZON_SECONDS,
};
use crate::retry::retry_store_operation;
use crate::store::{ConfidenceModulator, ForecastStore};
use chrono::{DateTime, Duration, Utc};
use log::{error, info};
use std::sync::Arc;
use uuid::Uuid;

/// Entry point for forecast generation and parameter queries.
pub struct CalibrationService {
    store: Arc<dyn ForecastStore>,
    learning: Arc<LearningStateStore>,
    modulator: Arc<dyn ConfidenceModulator>,
    forecaster: Forecaster,
}

impl CalibrationService {
    pub fn new(
        store: Arc<dyn ForecastStore>,
        learning: Arc<LearningStateStore>,
        modulator: Arc<dyn ConfidenceModulator>,
    ) -> Self {
        Self {
            store,
            learning,
            modulator,
            forecaster: Forecaster::default(),
        }
    }

    pub fn with_forecaster(mut self, forecaster: Forecaster) -> Self {
        self.forecaster = forecaster;
        self
    }

    pub fn learning(&self) -> &Arc<LearningStateStore> {
        &self.learning
    }

    pub async fn get_learned_parameters(&self, symbol: &str) -> LearnedParameters {
        self.learning.learned_parameters(symbol).await
    }

    pub fn boldness_multiplier(&self) -> f64 {
        self.modulator.boldness_multiplier()
    }

    pub async fn generate_forecast(
        &self,
        symbol: &str,
        current_price: f64,
        snapshot: &TechnicalSnapshot,
        price_history: &[f64],
        horizon: Duration,
    ) -> Result<ForecastRecord, CalibrationError> {
        self.generate_forecast_at(
            symbol,
            current_price,
            snapshot,
            price_history,
            horizon,
            Utc::now(),
        )
        .await
    }

    /// Produces a PENDING record. A persistence failure is logged and the record is still
    /// returned; only an unusable price or horizon is an error.
    pub async fn generate_forecast_at(
        &self,
        symbol: &str,
        current_price: f64,
        snapshot: &TechnicalSnapshot,
        price_history: &[f64],
        horizon: Duration,
        created_at: DateTime<Utc>,
    ) -> Result<ForecastRecord, CalibrationError> {
        let horizon_seconds = horizon.num_seconds();
        if horizon_seconds <= 0 || horizon_seconds > MAX_HORIZON_SECONDS {
            return Err(CalibrationError::ComputationError(format!(
                "forecast horizon must be between 1s and {}s (got {}s)",
                MAX_HORIZON_SECONDS, horizon_seconds
            )));
        }

        let parameters = self.get_learned_parameters(symbol).await;
        let outcome = self
            .forecaster
            .forecast(current_price, snapshot, price_history, &parameters)?;

        let record = ForecastRecord {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            created_at,
            horizon_seconds,
            original_price: current_price,
            predicted_price: outcome.predicted_price,
            confidence: outcome.confidence,
            parameters,
            state: ForecastState::Pending,
            resolved_at: None,
            actual_price: None,
            accuracy_score: None,
            resolution_attempts: 0,
        };

        match retry_store_operation!(
            format!("persisting forecast {}", record.id),
            self.store.create_forecast(&record)
        ) {
            Ok(()) => info!(
                "Forecast {} for {}: {:.4} -> {:.4} (confidence {:.1}, horizon {}m)",
                record.id,
                record.symbol,
                record.original_price,
                record.predicted_price,
                record.confidence,
                record.horizon_seconds / 60
            ),
            Err(err) => error!(
                "{}",
                CalibrationError::PersistenceFailure {
                    id: record.id.clone(),
                    message: err.to_string(),
                }
            ),
        }

        Ok(record)
    }
}
