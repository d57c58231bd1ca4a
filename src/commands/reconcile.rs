use crate::context::AppContext;
use anyhow::{Context, Result};
use log::{info, warn};
use std::sync::Arc;

pub async fn run(app: &AppContext, once: bool) -> Result<()> {
    let calibration = app.calibration().await?;
    let worker = Arc::new(calibration.reconciliation_worker());

    if once {
        let Some(report) = worker.run_once().await else {
            warn!("Reconciliation already in progress");
            return Ok(());
        };
        for item in &report.errors {
            warn!(
                "Forecast {} ({}) failed: {}",
                item.forecast_id, item.symbol, item.message
            );
        }
        let output =
            serde_json::to_string_pretty(&report).context("failed to serialize batch report")?;
        println!("{}", output);
        return Ok(());
    }

    let handle = worker.spawn();
    info!("Reconciliation worker running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutdown requested; waiting for the current batch to finish");
    handle.shutdown().await
}
