use crate::config::CalibrationSettings;
use crate::error::CalibrationError;
use crate::learning::LearningStateStore;
use crate::models::{ForecastRecord, ForecastState};
use crate::retry::retry_store_operation;
use crate::store::{ConfidenceModulator, ForecastStore, PriceSource};
use crate::worker_status::{WorkerStatus, WorkerStatusSnapshot};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// `max(0, 100 - |predicted - actual| / actual * scale)`. Equals 100 for an exact hit and
/// never increases as the miss grows.
pub fn accuracy_score(predicted_price: f64, actual_price: f64, scale: f64) -> f64 {
    if !predicted_price.is_finite() || !actual_price.is_finite() || actual_price <= 0.0 {
        return 0.0;
    }
    let relative_miss = (predicted_price - actual_price).abs() / actual_price;
    (100.0 - relative_miss * scale).max(0.0)
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: StdDuration,
    pub accuracy_scale: f64,
    pub max_resolution_attempts: u32,
    pub price_lookup_timeout: StdDuration,
    pub max_price_age: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self::from(&CalibrationSettings::default())
    }
}

impl From<&CalibrationSettings> for ReconcilerConfig {
    fn from(settings: &CalibrationSettings) -> Self {
        Self {
            interval: settings.reconcile_interval(),
            accuracy_scale: settings.accuracy_scale,
            max_resolution_attempts: settings.max_resolution_attempts.max(1),
            price_lookup_timeout: settings.price_lookup_timeout(),
            max_price_age: settings.max_price_age(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemError {
    pub forecast_id: String,
    pub symbol: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pending: usize,
    pub not_due: usize,
    pub resolved: usize,
    pub unavailable: usize,
    pub expired: usize,
    pub already_resolved: usize,
    pub mean_accuracy: Option<f64>,
    pub batch_error: Option<String>,
    pub errors: Vec<ItemError>,
}

impl BatchReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            pending: 0,
            not_due: 0,
            resolved: 0,
            unavailable: 0,
            expired: 0,
            already_resolved: 0,
            mean_accuracy: None,
            batch_error: None,
            errors: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.batch_error.is_none() && self.errors.is_empty()
    }

    fn log_summary(&self) {
        if let Some(err) = &self.batch_error {
            error!("Reconciliation batch aborted: {}", err);
            return;
        }
        if self.pending == 0 {
            info!("No pending forecasts require reconciliation");
            return;
        }
        let accuracy = self
            .mean_accuracy
            .map(|value| format!("{:.2}", value))
            .unwrap_or_else(|| "n/a".to_string());
        info!(
            "Resolved {} forecast{} ({} not due, {} awaiting price, {} expired, {} already resolved, {} failed); mean accuracy {}",
            self.resolved,
            if self.resolved == 1 { "" } else { "s" },
            self.not_due,
            self.unavailable,
            self.expired,
            self.already_resolved,
            self.errors.len(),
            accuracy
        );
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ItemOutcome {
    NotDue,
    Resolved(f64),
    Unavailable,
    Expired,
    AlreadyResolved,
    Failed(ItemError),
}

struct RunningGuard<'a> {
    flag: &'a AtomicBool,
    status: &'a WorkerStatus,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.status.mark_idle();
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Periodically resolves PENDING forecasts against current prices and feeds the
/// outcome back into the learning state and the confidence modulator.
pub struct ReconciliationWorker {
    store: Arc<dyn ForecastStore>,
    prices: Arc<dyn PriceSource>,
    learning: Arc<LearningStateStore>,
    modulator: Arc<dyn ConfidenceModulator>,
    config: ReconcilerConfig,
    running: AtomicBool,
    status: WorkerStatus,
}

impl ReconciliationWorker {
    pub fn new(
        store: Arc<dyn ForecastStore>,
        prices: Arc<dyn PriceSource>,
        learning: Arc<LearningStateStore>,
        modulator: Arc<dyn ConfidenceModulator>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            prices,
            learning,
            modulator,
            config,
            running: AtomicBool::new(false),
            status: WorkerStatus::new(),
        }
    }

    pub fn status(&self) -> WorkerStatusSnapshot {
        self.status.snapshot()
    }

    pub fn status_handle(&self) -> WorkerStatus {
        self.status.clone()
    }

    pub async fn run_once(&self) -> Option<BatchReport> {
        self.run_once_at(Utc::now()).await
    }

    /// Runs a single batch as of `now`. Returns `None` when another batch is still in flight.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Option<BatchReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Reconciliation batch still in progress; skipping this run");
            self.status.mark_skipped();
            return None;
        }
        let _guard = RunningGuard {
            flag: &self.running,
            status: &self.status,
        };
        self.status.mark_started(now);

        let report = self.reconcile(now).await;
        report.log_summary();
        self.status.mark_finished(report.clone());
        Some(report)
    }

    async fn reconcile(&self, now: DateTime<Utc>) -> BatchReport {
        let mut report = BatchReport::new(now);

        let pending = match retry_store_operation!(
            "loading pending forecasts",
            self.store.get_pending_forecasts()
        ) {
            Ok(pending) => pending,
            Err(err) => {
                report.batch_error = Some(format!("failed to load pending forecasts: {}", err));
                report.finished_at = Utc::now();
                return report;
            }
        };
        report.pending = pending.len();

        let mut by_symbol: BTreeMap<String, Vec<ForecastRecord>> = BTreeMap::new();
        for record in pending {
            by_symbol
                .entry(record.symbol.clone())
                .or_default()
                .push(record);
        }

        let mut jobs: FuturesUnordered<_> = by_symbol
            .into_iter()
            .map(|(symbol, records)| self.reconcile_symbol(symbol, records, now))
            .collect();

        let mut accuracy_total = 0.0;
        while let Some(outcomes) = jobs.next().await {
            for outcome in outcomes {
                match outcome {
                    ItemOutcome::NotDue => report.not_due += 1,
                    ItemOutcome::Resolved(score) => {
                        report.resolved += 1;
                        accuracy_total += score;
                    }
                    ItemOutcome::Unavailable => report.unavailable += 1,
                    ItemOutcome::Expired => report.expired += 1,
                    ItemOutcome::AlreadyResolved => report.already_resolved += 1,
                    ItemOutcome::Failed(item_error) => report.errors.push(item_error),
                }
            }
        }

        if report.resolved > 0 {
            report.mean_accuracy = Some(accuracy_total / report.resolved as f64);
        }
        report.finished_at = Utc::now();
        report
    }

    // Records of one symbol are handled sequentially so learning updates stay ordered.
    async fn reconcile_symbol(
        &self,
        symbol: String,
        records: Vec<ForecastRecord>,
        now: DateTime<Utc>,
    ) -> Vec<ItemOutcome> {
        let (unschedulable, records): (Vec<ForecastRecord>, Vec<ForecastRecord>) = records
            .into_iter()
            .partition(|record| record.due_at().is_none());
        let mut outcomes = Vec::with_capacity(unschedulable.len() + records.len());
        for record in &unschedulable {
            outcomes.push(self.expire_unschedulable(record).await);
        }

        let (due, waiting): (Vec<ForecastRecord>, Vec<ForecastRecord>) =
            records.into_iter().partition(|record| record.is_due(now));
        outcomes.extend(std::iter::repeat(ItemOutcome::NotDue).take(waiting.len()));
        if due.is_empty() {
            return outcomes;
        }

        let price = self.lookup_price(&symbol, now).await;
        for record in &due {
            let outcome = match &price {
                Ok((actual_price, as_of)) if *as_of >= record.created_at => {
                    self.resolve_record(record, *actual_price, now).await
                }
                Ok(_) => {
                    debug!(
                        "Latest {} price predates forecast {}; waiting for a newer quote",
                        symbol, record.id
                    );
                    self.mark_unavailable(record).await
                }
                Err(err) => {
                    debug!("Forecast {} not resolved yet: {}", record.id, err);
                    self.mark_unavailable(record).await
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn lookup_price(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> Result<(f64, DateTime<Utc>), CalibrationError> {
        let unavailable = || CalibrationError::DataUnavailable {
            symbol: symbol.to_string(),
        };
        let lookup = tokio::time::timeout(
            self.config.price_lookup_timeout,
            self.prices.get_current_price(symbol),
        )
        .await;

        let quote = match lookup {
            Err(_) => {
                warn!(
                    "Price lookup for {} timed out after {}s",
                    symbol,
                    self.config.price_lookup_timeout.as_secs()
                );
                return Err(CalibrationError::Timeout {
                    symbol: symbol.to_string(),
                    seconds: self.config.price_lookup_timeout.as_secs(),
                });
            }
            Ok(Err(err)) => {
                warn!("Price lookup for {} failed: {}", symbol, err);
                return Err(unavailable());
            }
            Ok(Ok(None)) => return Err(unavailable()),
            Ok(Ok(Some(quote))) => quote,
        };

        if !quote.price.is_finite() || quote.price <= 0.0 {
            warn!("Ignoring unusable {} price {}", symbol, quote.price);
            return Err(unavailable());
        }
        if now - quote.as_of > self.config.max_price_age {
            debug!(
                "Latest {} price from {} is older than {} minutes",
                symbol,
                quote.as_of,
                self.config.max_price_age.num_minutes()
            );
            return Err(unavailable());
        }
        Ok((quote.price, quote.as_of))
    }

    async fn resolve_record(
        &self,
        record: &ForecastRecord,
        actual_price: f64,
        now: DateTime<Utc>,
    ) -> ItemOutcome {
        let score = accuracy_score(
            record.predicted_price,
            actual_price,
            self.config.accuracy_scale,
        );

        // History must be loaded before this record turns RESOLVED, otherwise the lazy
        // load would count it and `update` would fold it in a second time.
        self.learning.snapshot(&record.symbol).await;

        match self
            .store
            .persist_resolution(&record.id, actual_price, score, now)
            .await
        {
            Ok(resolved) => {
                self.learning
                    .update(
                        &resolved.symbol,
                        resolved.original_price,
                        resolved.predicted_price,
                        actual_price,
                    )
                    .await;
                self.modulator.update_with_accuracy_result(score);
                debug!(
                    "Resolved forecast {} for {}: predicted {:.4}, actual {:.4}, accuracy {:.2}",
                    resolved.id, resolved.symbol, resolved.predicted_price, actual_price, score
                );
                ItemOutcome::Resolved(score)
            }
            Err(err) if CalibrationError::is_already_resolved(&err) => {
                debug!("Forecast {} was already resolved; skipping", record.id);
                ItemOutcome::AlreadyResolved
            }
            Err(err) if CalibrationError::is_expired(&err) => {
                debug!("Forecast {} expired before it could be resolved", record.id);
                ItemOutcome::Expired
            }
            Err(err) => {
                let failure = CalibrationError::PersistenceFailure {
                    id: record.id.clone(),
                    message: err.to_string(),
                };
                warn!("{}", failure);
                ItemOutcome::Failed(ItemError {
                    forecast_id: record.id.clone(),
                    symbol: record.symbol.clone(),
                    message: failure.to_string(),
                })
            }
        }
    }

    async fn mark_unavailable(&self, record: &ForecastRecord) -> ItemOutcome {
        match self
            .store
            .record_unavailable_attempt(&record.id, self.config.max_resolution_attempts)
            .await
        {
            Ok(ForecastState::Expired) => {
                warn!(
                    "Forecast {} for {} expired after {} attempts without a usable price",
                    record.id, record.symbol, self.config.max_resolution_attempts
                );
                ItemOutcome::Expired
            }
            Ok(ForecastState::Resolved) => ItemOutcome::AlreadyResolved,
            Ok(ForecastState::Pending) => ItemOutcome::Unavailable,
            Err(err) => {
                warn!(
                    "Failed to record resolution attempt for forecast {}: {}",
                    record.id, err
                );
                ItemOutcome::Failed(ItemError {
                    forecast_id: record.id.clone(),
                    symbol: record.symbol.clone(),
                    message: err.to_string(),
                })
            }
        }
    }

    async fn expire_unschedulable(&self, record: &ForecastRecord) -> ItemOutcome {
        warn!(
            "Forecast {} for {} has unusable horizon {}s; expiring it",
            record.id, record.symbol, record.horizon_seconds
        );
        match self.store.record_unavailable_attempt(&record.id, 1).await {
            Ok(ForecastState::Resolved) => ItemOutcome::AlreadyResolved,
            Ok(_) => ItemOutcome::Expired,
            Err(err) => ItemOutcome::Failed(ItemError {
                forecast_id: record.id.clone(),
                symbol: record.symbol.clone(),
                message: err.to_string(),
            }),
        }
    }

    /// Runs immediately, then every `interval`, until `shutdown` flips to true. A batch in
    /// flight when shutdown is requested is allowed to finish.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.interval;
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "Reconciliation worker started (interval {}s)",
            period.as_secs()
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let next_run = Duration::from_std(period).ok().map(|step| Utc::now() + step);
                    self.status.set_next_scheduled_run(next_run);
                    self.run_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.status.set_next_scheduled_run(None);
        info!("Reconciliation worker stopped");
    }

    pub fn spawn(self: Arc<Self>) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let status = self.status_handle();
        let join = tokio::spawn(self.run(shutdown_rx));
        WorkerHandle {
            shutdown: shutdown_tx,
            join,
            status,
        }
    }
}

pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    status: WorkerStatus,
}

impl WorkerHandle {
    pub fn status(&self) -> WorkerStatusSnapshot {
        self.status.snapshot()
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.join
            .await
            .map_err(|err| anyhow!("reconciliation worker task failed: {}", err))
    }
}
