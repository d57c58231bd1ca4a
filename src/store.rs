use crate::error::CalibrationError;
use crate::models::{ForecastRecord, ForecastState, PriceQuote};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Persistence for forecast records.
#[async_trait]
pub trait ForecastStore: Send + Sync {
    async fn create_forecast(&self, record: &ForecastRecord) -> Result<()>;

    async fn get_pending_forecasts(&self) -> Result<Vec<ForecastRecord>>;

    /// Atomically moves a PENDING record to RESOLVED. Fails with
    /// [`CalibrationError::AlreadyResolved`] if the record is no longer pending.
    async fn persist_resolution(
        &self,
        id: &str,
        actual_price: f64,
        accuracy_score: f64,
        resolved_at: DateTime<Utc>,
    ) -> Result<ForecastRecord>;

    /// Most recently resolved records for a symbol, newest first.
    async fn load_recent_resolved(&self, symbol: &str, limit: usize)
        -> Result<Vec<ForecastRecord>>;

    /// Counts a failed price lookup and expires the record once `max_attempts` is reached.
    async fn record_unavailable_attempt(&self, id: &str, max_attempts: u32)
        -> Result<ForecastState>;
}

#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn get_current_price(&self, symbol: &str) -> Result<Option<PriceQuote>>;
}

/// Maintains a global boldness multiplier from a stream of accuracy scores.
pub trait ConfidenceModulator: Send + Sync {
    fn update_with_accuracy_result(&self, accuracy_score: f64);
    fn boldness_multiplier(&self) -> f64;
}

#[derive(Default)]
pub struct MemoryForecastStore {
    records: DashMap<String, ForecastRecord>,
    unavailable: AtomicBool,
}

impl MemoryForecastStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<ForecastRecord> {
        self.records.get(id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Simulates an outage: every call fails until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("forecast store is unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl ForecastStore for MemoryForecastStore {
    async fn create_forecast(&self, record: &ForecastRecord) -> Result<()> {
        self.ensure_available()?;
        self.records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_pending_forecasts(&self) -> Result<Vec<ForecastRecord>> {
        self.ensure_available()?;
        let mut pending: Vec<ForecastRecord> = self
            .records
            .iter()
            .filter(|entry| entry.state == ForecastState::Pending)
            .map(|entry| entry.value().clone())
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(pending)
    }

    async fn persist_resolution(
        &self,
        id: &str,
        actual_price: f64,
        accuracy_score: f64,
        resolved_at: DateTime<Utc>,
    ) -> Result<ForecastRecord> {
        self.ensure_available()?;
        let mut entry = self
            .records
            .get_mut(id)
            .ok_or_else(|| CalibrationError::NotFound { id: id.to_string() })?;
        if !entry.resolve(actual_price, accuracy_score, resolved_at) {
            let id = id.to_string();
            return Err(match entry.state {
                ForecastState::Expired => CalibrationError::Expired { id },
                _ => CalibrationError::AlreadyResolved { id },
            }
            .into());
        }
        Ok(entry.value().clone())
    }

    async fn load_recent_resolved(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<ForecastRecord>> {
        self.ensure_available()?;
        let mut resolved: Vec<ForecastRecord> = self
            .records
            .iter()
            .filter(|entry| entry.symbol == symbol && entry.state == ForecastState::Resolved)
            .map(|entry| entry.value().clone())
            .collect();
        resolved.sort_by(|a, b| b.resolved_at.cmp(&a.resolved_at).then(b.id.cmp(&a.id)));
        resolved.truncate(limit);
        Ok(resolved)
    }

    async fn record_unavailable_attempt(
        &self,
        id: &str,
        max_attempts: u32,
    ) -> Result<ForecastState> {
        self.ensure_available()?;
        let mut entry = self
            .records
            .get_mut(id)
            .ok_or_else(|| CalibrationError::NotFound { id: id.to_string() })?;
        if entry.state != ForecastState::Pending {
            return Ok(entry.state);
        }
        entry.resolution_attempts = entry.resolution_attempts.saturating_add(1);
        if entry.resolution_attempts >= max_attempts {
            entry.state = ForecastState::Expired;
        }
        Ok(entry.state)
    }
}

/// Price source backed by a mutable map, for tests and offline runs.
#[derive(Clone, Default)]
pub struct StaticPriceSource {
    quotes: Arc<DashMap<String, PriceQuote>>,
    failing: Arc<DashMap<String, String>>,
}

impl StaticPriceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, symbol: &str, price: f64, as_of: DateTime<Utc>) {
        self.failing.remove(symbol);
        self.quotes
            .insert(symbol.to_string(), PriceQuote { price, as_of });
    }

    pub fn remove_price(&self, symbol: &str) {
        self.quotes.remove(symbol);
    }

    pub fn fail_symbol(&self, symbol: &str, message: &str) {
        self.failing.insert(symbol.to_string(), message.to_string());
    }
}

#[async_trait]
impl PriceSource for StaticPriceSource {
    async fn get_current_price(&self, symbol: &str) -> Result<Option<PriceQuote>> {
        if let Some(message) = self.failing.get(symbol) {
            return Err(anyhow::anyhow!(
                "price lookup for {} failed: {}",
                symbol,
                message.value()
            ));
        }
        Ok(self.quotes.get(symbol).map(|quote| *quote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LearnedParameters;
    use chrono::{Duration, TimeZone};

    fn record(id: &str, symbol: &str, minutes: i64) -> ForecastRecord {
        ForecastRecord {
            id: id.to_string(),
            symbol: symbol.to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 5, 6, 15, 0, 0).unwrap()
                + Duration::minutes(minutes),
            horizon_seconds: 1200,
            original_price: 50.0,
            predicted_price: 50.5,
            confidence: 60.0,
            parameters: LearnedParameters::NEUTRAL,
            state: ForecastState::Pending,
            resolved_at: None,
            actual_price: None,
            accuracy_score: None,
            resolution_attempts: 0,
        }
    }

    #[tokio::test]
    async fn second_resolution_is_rejected() {
        let store = MemoryForecastStore::new();
        store.create_forecast(&record("a", "MSFT", 0)).await.unwrap();
        let at = Utc::now();

        let resolved = store.persist_resolution("a", 50.4, 98.0, at).await.unwrap();
        assert_eq!(resolved.state, ForecastState::Resolved);

        let error = store
            .persist_resolution("a", 51.0, 10.0, at)
            .await
            .unwrap_err();
        assert!(CalibrationError::is_already_resolved(&error));
        assert_eq!(store.get("a").unwrap().actual_price, Some(50.4));

        let missing = store.persist_resolution("zzz", 1.0, 1.0, at).await.unwrap_err();
        assert!(matches!(
            CalibrationError::find(&missing),
            Some(CalibrationError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn recent_resolved_is_newest_first_and_limited() {
        let store = MemoryForecastStore::new();
        let base = Utc.with_ymd_and_hms(2024, 5, 6, 16, 0, 0).unwrap();
        for idx in 0..5 {
            let id = format!("r{}", idx);
            store.create_forecast(&record(&id, "MSFT", idx)).await.unwrap();
            store
                .persist_resolution(&id, 50.0, 90.0, base + Duration::minutes(idx))
                .await
                .unwrap();
        }
        store.create_forecast(&record("other", "NVDA", 0)).await.unwrap();

        let recent = store.load_recent_resolved("MSFT", 3).await.unwrap();
        let ids: Vec<&str> = recent.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r4", "r3", "r2"]);
        assert!(store.load_recent_resolved("NVDA", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable_attempts_expire_record() {
        let store = MemoryForecastStore::new();
        store.create_forecast(&record("x", "AMD", 0)).await.unwrap();
        assert_eq!(
            store.record_unavailable_attempt("x", 2).await.unwrap(),
            ForecastState::Pending
        );
        assert_eq!(
            store.record_unavailable_attempt("x", 2).await.unwrap(),
            ForecastState::Expired
        );
        assert!(store.get_pending_forecasts().await.unwrap().is_empty());
        assert_eq!(store.get("x").unwrap().resolution_attempts, 2);
    }

    #[tokio::test]
    async fn expired_record_cannot_be_resolved() {
        let store = MemoryForecastStore::new();
        store.create_forecast(&record("x", "AMD", 0)).await.unwrap();
        store.record_unavailable_attempt("x", 1).await.unwrap();

        let error = store
            .persist_resolution("x", 51.0, 90.0, Utc::now())
            .await
            .unwrap_err();
        assert!(CalibrationError::is_expired(&error));
        assert!(!CalibrationError::is_already_resolved(&error));
        let stored = store.get("x").unwrap();
        assert_eq!(stored.state, ForecastState::Expired);
        assert_eq!(stored.actual_price, None);
    }

    #[tokio::test]
    async fn static_price_source_reports_missing_and_failing_symbols() {
        let prices = StaticPriceSource::new();
        let now = Utc::now();
        prices.set_price("AMD", 120.0, now);
        assert_eq!(
            prices.get_current_price("AMD").await.unwrap(),
            Some(PriceQuote {
                price: 120.0,
                as_of: now
            })
        );
        assert!(prices.get_current_price("INTC").await.unwrap().is_none());

        prices.fail_symbol("AMD", "feed down");
        assert!(prices.get_current_price("AMD").await.is_err());

        prices.set_price("AMD", 121.0, now);
        prices.remove_price("AMD");
        assert!(prices.get_current_price("AMD").await.unwrap().is_none());
    }
}
