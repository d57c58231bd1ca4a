use crate::reconciler::BatchReport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub struct WorkerStatus {
    inner: Arc<Mutex<WorkerStatusData>>,
}

#[derive(Default)]
struct WorkerStatusData {
    is_running: bool,
    next_scheduled_run: Option<DateTime<Utc>>,
    last_run_started_at: Option<DateTime<Utc>>,
    completed_runs: u64,
    skipped_runs: u64,
    last_report: Option<BatchReport>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatusSnapshot {
    pub is_running: bool,
    pub next_scheduled_run: Option<DateTime<Utc>>,
    pub last_run_started_at: Option<DateTime<Utc>>,
    pub completed_runs: u64,
    pub skipped_runs: u64,
    pub last_report: Option<BatchReport>,
}

impl WorkerStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_started(&self, started_at: DateTime<Utc>) {
        if let Ok(mut data) = self.inner.lock() {
            data.is_running = true;
            data.last_run_started_at = Some(started_at);
        }
    }

    pub fn mark_finished(&self, report: BatchReport) {
        if let Ok(mut data) = self.inner.lock() {
            data.is_running = false;
            data.completed_runs += 1;
            data.last_report = Some(report);
        }
    }

    pub fn mark_idle(&self) {
        if let Ok(mut data) = self.inner.lock() {
            data.is_running = false;
        }
    }

    pub fn mark_skipped(&self) {
        if let Ok(mut data) = self.inner.lock() {
            data.skipped_runs += 1;
        }
    }

    pub fn set_next_scheduled_run(&self, next: Option<DateTime<Utc>>) {
        if let Ok(mut data) = self.inner.lock() {
            data.next_scheduled_run = next;
        }
    }

    pub fn snapshot(&self) -> WorkerStatusSnapshot {
        if let Ok(data) = self.inner.lock() {
            WorkerStatusSnapshot {
                is_running: data.is_running,
                next_scheduled_run: data.next_scheduled_run,
                last_run_started_at: data.last_run_started_at,
                completed_runs: data.completed_runs,
                skipped_runs: data.skipped_runs,
                last_report: data.last_report.clone(),
            }
        } else {
            WorkerStatusSnapshot {
                is_running: false,
                next_scheduled_run: None,
                last_run_started_at: None,
                completed_runs: 0,
                skipped_runs: 0,
                last_report: None,
            }
        }
    }
}
