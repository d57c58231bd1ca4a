use crate::commands::normalize_symbol;
use crate::context::AppContext;
use crate::models::{LearnedParameters, LearningState};
use crate::parameters::{derive_parameters, MIN_SAMPLES_FOR_LEARNING};
use anyhow::{Context, Result};
use log::info;
use serde::Serialize;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ParametersReport {
    symbol: String,
    cold_start: bool,
    learning_state: LearningState,
    parameters: LearnedParameters,
}

pub async fn run(app: &AppContext, symbol: &str, refresh: bool) -> Result<()> {
    let symbol = normalize_symbol(symbol);
    let calibration = app.calibration().await?;

    let learning_state = if refresh {
        info!("Reloading learning state for {} from history", symbol);
        calibration.learning.refresh(&symbol).await
    } else {
        calibration.learning.snapshot(&symbol).await
    };

    let report = ParametersReport {
        cold_start: learning_state.sample_count < MIN_SAMPLES_FOR_LEARNING,
        parameters: derive_parameters(&learning_state),
        learning_state,
        symbol,
    };
    let output =
        serde_json::to_string_pretty(&report).context("failed to serialize learned parameters")?;
    println!("{}", output);
    Ok(())
}
