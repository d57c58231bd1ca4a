pub mod commands;
pub mod config;
pub mod context;
pub mod database;
pub mod error;
pub mod forecaster;
pub mod indicators;
pub mod learning;
pub mod models;
pub mod modulator;
pub mod parameters;
pub mod reconciler;
mod retry;
pub mod service;
pub mod store;
pub mod worker_status;
