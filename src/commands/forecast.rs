use crate::commands::normalize_symbol;
use crate::config::MAX_FORECAST_HORIZON_MINUTES;
use crate::context::AppContext;
use crate::error::CalibrationError;
use crate::indicators::snapshot_from_candles;
use anyhow::{anyhow, Context, Result};
use chrono::Duration;
use log::info;

// Enough closes for MACD(26) and the signal line to settle.
const CANDLE_LOOKBACK: usize = 120;
const TREND_HISTORY_LEN: usize = 6;

pub async fn run(app: &AppContext, symbol: &str, horizon_minutes: Option<i64>) -> Result<()> {
    let symbol = normalize_symbol(symbol);
    let calibration = app.calibration().await?;

    let candles = calibration
        .database
        .get_recent_candles(&symbol, CANDLE_LOOKBACK)
        .await?;
    let snapshot = snapshot_from_candles(&candles).ok_or_else(|| {
        anyhow!(CalibrationError::DataUnavailable {
            symbol: symbol.clone()
        })
    })?;
    let closes: Vec<f64> = candles.iter().map(|candle| candle.close).collect();
    let current_price = *closes
        .last()
        .ok_or_else(|| anyhow!("no closing price for {}", symbol))?;
    let history = &closes[closes.len().saturating_sub(TREND_HISTORY_LEN)..];

    let horizon = match horizon_minutes {
        Some(minutes) if (1..=MAX_FORECAST_HORIZON_MINUTES).contains(&minutes) => {
            Duration::minutes(minutes)
        }
        Some(minutes) => {
            return Err(anyhow!(
                "--horizon-minutes must be between 1 and {} (got {})",
                MAX_FORECAST_HORIZON_MINUTES,
                minutes
            ))
        }
        None => calibration.settings.forecast_horizon(),
    };

    info!(
        "Generating {}-minute forecast for {} from {} candle(s)",
        horizon.num_minutes(),
        symbol,
        candles.len()
    );
    let record = calibration
        .service
        .generate_forecast(&symbol, current_price, &snapshot, history, horizon)
        .await?;

    let output = serde_json::to_string_pretty(&record).context("failed to serialize forecast")?;
    println!("{}", output);
    Ok(())
}
