use crate::error::CalibrationError;
use crate::models::{Candle, ForecastRecord, ForecastState, LearnedParameters, PriceQuote};
use crate::store::{ForecastStore, PriceSource};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::error;
use std::collections::HashMap;
use std::str::FromStr;
use tokio_postgres::{Client, NoTls, Row};

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS settings (
    setting_key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS candles (
    ticker TEXT NOT NULL,
    date TIMESTAMPTZ NOT NULL,
    open DOUBLE PRECISION NOT NULL,
    high DOUBLE PRECISION NOT NULL,
    low DOUBLE PRECISION NOT NULL,
    close DOUBLE PRECISION NOT NULL,
    volume_shares BIGINT NOT NULL DEFAULT 0,
    PRIMARY KEY (ticker, date)
);

CREATE TABLE IF NOT EXISTS forecasts (
    id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    horizon_seconds BIGINT NOT NULL,
    original_price DOUBLE PRECISION NOT NULL,
    predicted_price DOUBLE PRECISION NOT NULL,
    confidence DOUBLE PRECISION NOT NULL,
    parameters TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    resolved_at TIMESTAMPTZ,
    actual_price DOUBLE PRECISION,
    accuracy_score DOUBLE PRECISION,
    resolution_attempts INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS forecasts_state_idx ON forecasts (state);
CREATE INDEX IF NOT EXISTS forecasts_symbol_resolved_idx
    ON forecasts (symbol, resolved_at DESC)
    WHERE state = 'resolved';
";

const FORECAST_COLUMNS: &str = "id, symbol, created_at, horizon_seconds, original_price, \
     predicted_price, confidence, parameters, state, resolved_at, actual_price, \
     accuracy_score, resolution_attempts";

pub struct Database {
    client: Client,
}

impl Database {
    pub async fn new<S: AsRef<str>>(database_url: S) -> Result<Self> {
        let database_url = database_url.as_ref().to_string();
        let (client, connection) = tokio_postgres::connect(&database_url, NoTls)
            .await
            .with_context(|| format!("failed to connect to PostgreSQL at {}", database_url))?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!("PostgreSQL connection error: {}", err);
            }
        });

        Ok(Self { client })
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        self.client
            .batch_execute(SCHEMA)
            .await
            .context("failed to apply forecast schema")
    }

    pub async fn get_all_settings(&self) -> Result<HashMap<String, String>> {
        let rows = self
            .client
            .query("SELECT setting_key, value FROM settings", &[])
            .await?;
        let mut settings = HashMap::with_capacity(rows.len());
        for row in rows {
            settings.insert(row.get::<_, String>(0), row.get::<_, String>(1));
        }
        Ok(settings)
    }

    /// Latest `limit` candles for `symbol`, oldest first.
    pub async fn get_recent_candles(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .client
            .query(
                "SELECT ticker, date, open, high, low, close, volume_shares
                 FROM candles
                 WHERE ticker = $1
                 ORDER BY date DESC
                 LIMIT $2",
                &[&symbol, &limit],
            )
            .await
            .with_context(|| format!("failed to load candles for {}", symbol))?;

        let mut candles: Vec<Candle> = rows
            .iter()
            .map(|row| Candle {
                ticker: row.get(0),
                date: row.get(1),
                open: row.get(2),
                high: row.get(3),
                low: row.get(4),
                close: row.get(5),
                volume_shares: row.get(6),
            })
            .collect();
        candles.reverse();
        Ok(candles)
    }

    async fn find_forecast_state(&self, id: &str) -> Result<Option<ForecastState>> {
        let row = self
            .client
            .query_opt("SELECT state FROM forecasts WHERE id = $1", &[&id])
            .await?;
        row.map(|row| ForecastState::from_str(&row.get::<_, String>(0)))
            .transpose()
    }

    fn map_forecast_row(row: &Row) -> Result<ForecastRecord> {
        let parameters_json: String = row.get(7);
        let parameters: LearnedParameters = serde_json::from_str(&parameters_json)
            .map_err(|err| anyhow!("Failed to parse forecast parameters JSON: {}", err))?;
        let state_str: String = row.get(8);
        let attempts: i32 = row.get(12);

        Ok(ForecastRecord {
            id: row.get(0),
            symbol: row.get(1),
            created_at: row.get(2),
            horizon_seconds: row.get(3),
            original_price: row.get(4),
            predicted_price: row.get(5),
            confidence: row.get(6),
            parameters,
            state: ForecastState::from_str(&state_str)?,
            resolved_at: row.get(9),
            actual_price: row.get(10),
            accuracy_score: row.get(11),
            resolution_attempts: u32::try_from(attempts).unwrap_or(0),
        })
    }
}

#[async_trait]
impl ForecastStore for Database {
    async fn create_forecast(&self, record: &ForecastRecord) -> Result<()> {
        let parameters_json = serde_json::to_string(&record.parameters)
            .map_err(|err| anyhow!("Failed to serialize forecast parameters: {}", err))?;
        let attempts = i32::try_from(record.resolution_attempts).unwrap_or(i32::MAX);

        self.client
            .execute(
                "INSERT INTO forecasts (
                    id, symbol, created_at, horizon_seconds, original_price, predicted_price,
                    confidence, parameters, state, resolved_at, actual_price, accuracy_score,
                    resolution_attempts
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
                &[
                    &record.id,
                    &record.symbol,
                    &record.created_at,
                    &record.horizon_seconds,
                    &record.original_price,
                    &record.predicted_price,
                    &record.confidence,
                    &parameters_json,
                    &record.state.as_str(),
                    &record.resolved_at,
                    &record.actual_price,
                    &record.accuracy_score,
                    &attempts,
                ],
            )
            .await
            .with_context(|| format!("failed to insert forecast {}", record.id))?;
        Ok(())
    }

    async fn get_pending_forecasts(&self) -> Result<Vec<ForecastRecord>> {
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT {} FROM forecasts WHERE state = 'pending' ORDER BY created_at, id",
                    FORECAST_COLUMNS
                ),
                &[],
            )
            .await
            .context("failed to load pending forecasts")?;
        rows.iter().map(Self::map_forecast_row).collect()
    }

    async fn persist_resolution(
        &self,
        id: &str,
        actual_price: f64,
        accuracy_score: f64,
        resolved_at: DateTime<Utc>,
    ) -> Result<ForecastRecord> {
        let row = self
            .client
            .query_opt(
                &format!(
                    "UPDATE forecasts
                     SET state = 'resolved', actual_price = $2, accuracy_score = $3, resolved_at = $4
                     WHERE id = $1 AND state = 'pending'
                     RETURNING {}",
                    FORECAST_COLUMNS
                ),
                &[&id, &actual_price, &accuracy_score, &resolved_at],
            )
            .await
            .with_context(|| format!("failed to resolve forecast {}", id))?;

        match row {
            Some(row) => Self::map_forecast_row(&row),
            None => {
                let id = id.to_string();
                let error = match self.find_forecast_state(&id).await? {
                    Some(ForecastState::Resolved) => CalibrationError::AlreadyResolved { id },
                    Some(ForecastState::Expired) => CalibrationError::Expired { id },
                    Some(ForecastState::Pending) => CalibrationError::PersistenceFailure {
                        id,
                        message: "pending forecast was not updated".to_string(),
                    },
                    None => CalibrationError::NotFound { id },
                };
                Err(error.into())
            }
        }
    }

    async fn load_recent_resolved(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<ForecastRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT {} FROM forecasts
                     WHERE symbol = $1 AND state = 'resolved'
                     ORDER BY resolved_at DESC, id DESC
                     LIMIT $2",
                    FORECAST_COLUMNS
                ),
                &[&symbol, &limit],
            )
            .await
            .with_context(|| format!("failed to load resolved forecasts for {}", symbol))?;
        rows.iter().map(Self::map_forecast_row).collect()
    }

    async fn record_unavailable_attempt(
        &self,
        id: &str,
        max_attempts: u32,
    ) -> Result<ForecastState> {
        let max_attempts = i32::try_from(max_attempts).unwrap_or(i32::MAX);
        let row = self
            .client
            .query_opt(
                "UPDATE forecasts
                 SET resolution_attempts = resolution_attempts + 1,
                     state = CASE WHEN resolution_attempts + 1 >= $2 THEN 'expired' ELSE state END
                 WHERE id = $1 AND state = 'pending'
                 RETURNING state",
                &[&id, &max_attempts],
            )
            .await
            .with_context(|| format!("failed to record resolution attempt for {}", id))?;

        match row {
            Some(row) => ForecastState::from_str(&row.get::<_, String>(0)),
            None => self
                .find_forecast_state(id)
                .await?
                .ok_or_else(|| CalibrationError::NotFound { id: id.to_string() }.into()),
        }
    }
}

#[async_trait]
impl PriceSource for Database {
    async fn get_current_price(&self, symbol: &str) -> Result<Option<PriceQuote>> {
        let row = self
            .client
            .query_opt(
                "SELECT close, date FROM candles WHERE ticker = $1 ORDER BY date DESC LIMIT 1",
                &[&symbol],
            )
            .await
            .with_context(|| format!("failed to load latest price for {}", symbol))?;
        Ok(row.map(|row| PriceQuote {
            price: row.get(0),
            as_of: row.get(1),
        }))
    }
}
