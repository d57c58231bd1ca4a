use crate::config::CalibrationSettings;
use crate::database::Database;
use crate::learning::LearningStateStore;
use crate::modulator::BoldnessModulator;
use crate::reconciler::{ReconcilerConfig, ReconciliationWorker};
use crate::service::CalibrationService;
use anyhow::{anyhow, Result};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppContext {
    database_url: Option<String>,
}

impl AppContext {
    pub async fn initialize(database_url: Option<String>) -> Result<Self> {
        Ok(Self { database_url })
    }

    pub async fn database(&self) -> Result<Database> {
        let Some(database_url) = self.database_url.as_deref() else {
            return Err(anyhow!(
                "DATABASE_URL must be set to use database-backed forecast commands."
            ));
        };
        Database::new(database_url).await
    }

    /// Connects, applies the schema and wires the calibration loop against PostgreSQL.
    pub async fn calibration(&self) -> Result<CalibrationContext> {
        let database = Arc::new(self.database().await?);
        database.ensure_schema().await?;

        let stored = match database.get_all_settings().await {
            Ok(settings) => settings,
            Err(err) => {
                warn!("Failed to load settings; using defaults: {}", err);
                HashMap::new()
            }
        };
        let settings =
            CalibrationSettings::from_settings_map(&CalibrationSettings::with_env_overrides(stored))?;
        info!(
            "Calibration settings: horizon {}m, history window {}, reconcile every {}s, max {} attempts",
            settings.forecast_horizon_minutes,
            settings.history_window,
            settings.reconcile_interval_seconds,
            settings.max_resolution_attempts
        );

        Ok(CalibrationContext::new(database, settings))
    }
}

pub struct CalibrationContext {
    pub database: Arc<Database>,
    pub settings: CalibrationSettings,
    pub learning: Arc<LearningStateStore>,
    pub service: CalibrationService,
    modulator: Arc<BoldnessModulator>,
}

impl CalibrationContext {
    fn new(database: Arc<Database>, settings: CalibrationSettings) -> Self {
        let learning = Arc::new(LearningStateStore::with_limits(
            database.clone(),
            settings.history_window,
            settings.sample_cap,
        ));
        let modulator = Arc::new(BoldnessModulator::default());
        let service = CalibrationService::new(database.clone(), learning.clone(), modulator.clone());

        Self {
            database,
            settings,
            learning,
            service,
            modulator,
        }
    }

    pub fn reconciliation_worker(&self) -> ReconciliationWorker {
        ReconciliationWorker::new(
            self.database.clone(),
            self.database.clone(),
            self.learning.clone(),
            self.modulator.clone(),
            ReconcilerConfig::from(&self.settings),
        )
    }
}
