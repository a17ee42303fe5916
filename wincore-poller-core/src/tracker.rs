//! Persistence boundary for per-target pipeline state.
//!
//! Every write is keyed by [`TargetKey`]. Operational log rows are mirrored to
//! `tracing`; losing a log row only produces a warning.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::contract::BuildStore;
use crate::model::{
    BuildHistoryEntry, BuildTrackingRecord, LogLevel, NewHistoryEntry, OperationType,
    PollingLogEntry, TargetKey, TrackingUpdate,
};

#[derive(Clone)]
pub struct BuildTracker {
    store: Arc<dyn BuildStore>,
}

impl BuildTracker {
    pub fn new(store: Arc<dyn BuildStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn BuildStore> {
        &self.store
    }

    pub fn tracking_record(&self, key: TargetKey) -> Result<Option<BuildTrackingRecord>> {
        self.store.get_tracking(key)
    }

    pub fn upsert(&self, key: TargetKey, update: &TrackingUpdate) -> Result<()> {
        debug!(
            target_key = %key,
            build = %update.build,
            download = update.download_status.as_db_str(),
            extraction = update.extraction_status.as_db_str(),
            "Updating tracking row"
        );
        self.store.upsert_tracking(key, update)
    }

    pub fn append_history(&self, key: TargetKey, entry: &NewHistoryEntry) -> Result<i64> {
        self.store.append_history(key, entry)
    }

    pub fn active_history(&self, key: TargetKey) -> Result<Vec<BuildHistoryEntry>> {
        self.store.list_active_history(key)
    }

    /// Emit a tracing event and persist a [`PollingLogEntry`].
    pub fn log(
        &self,
        level: LogLevel,
        operation: OperationType,
        target: Option<TargetKey>,
        message: impl Into<String>,
        duration: Option<Duration>,
    ) {
        let message = message.into();
        let duration_ms = duration.map(|d| d.as_millis() as u64);
        let key = target.map(|k| k.to_string());
        let op = operation.as_db_str();
        match level {
            LogLevel::Debug => debug!(target_key = ?key, operation = op, duration_ms, "{message}"),
            LogLevel::Info => info!(target_key = ?key, operation = op, duration_ms, "{message}"),
            LogLevel::Warning => warn!(target_key = ?key, operation = op, duration_ms, "{message}"),
            LogLevel::Error => error!(target_key = ?key, operation = op, duration_ms, "{message}"),
        }

        let entry = PollingLogEntry {
            level,
            message,
            target,
            operation,
            duration_ms,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.append_log(&entry) {
            warn!(error = %e, "Failed to persist polling log entry");
        }
    }
}
