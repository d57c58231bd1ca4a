use anyhow::Result;
use clap::{Parser, Subcommand};
use forecast_engine::commands::{forecast, parameters, reconcile};
use forecast_engine::context::AppContext;
use log::info;
use std::env;

#[derive(Parser)]
#[command(name = "forecast-engine")]
#[command(about = "Short-horizon price forecasts that recalibrate from their own track record")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and store a forecast for a symbol from its latest candles
    Forecast {
        /// Ticker symbol
        symbol: String,
        /// Forecast horizon in minutes (defaults to FORECAST_HORIZON_MINUTES)
        #[arg(long)]
        horizon_minutes: Option<i64>,
    },
    /// Show the learning state and derived parameters for a symbol
    Parameters {
        /// Ticker symbol
        symbol: String,
        /// Reload the learning state from resolved history first
        #[arg(long)]
        refresh: bool,
    },
    /// Resolve pending forecasts against current prices
    Reconcile {
        /// Run a single batch instead of the periodic worker
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { command } = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let app_context = AppContext::initialize(env::var("DATABASE_URL").ok()).await?;
    info!("Starting forecast engine. Not financial advice.");

    match command {
        Commands::Forecast {
            symbol,
            horizon_minutes,
        } => {
            forecast::run(&app_context, &symbol, horizon_minutes).await?;
        }
        Commands::Parameters { symbol, refresh } => {
            parameters::run(&app_context, &symbol, refresh).await?;
        }
        Commands::Reconcile { once } => {
            reconcile::run(&app_context, once).await?;
        }
    }

    Ok(())
}
