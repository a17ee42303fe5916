//! Keep-last-N retention per target.
//!
//! Active history rows are ordered newest first; rows beyond the first `keep` are
//! retired by deleting their download file and extraction directory and then
//! marking the row deleted. Paths still referenced by a kept row or by the
//! target's tracking row are left alone, since every build of a target shares the
//! same deterministic paths. A row whose
//! files could not be deleted stays active and is counted as a failure.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::extract::disk_usage;
use crate::model::{BuildHistoryEntry, LogLevel, OperationType, PollingTarget};
use crate::tracker::BuildTracker;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub targets_processed: usize,
    pub builds_retired: usize,
    pub files_deleted: usize,
    pub failures: usize,
    pub bytes_freed: u64,
}

impl RetentionReport {
    pub fn merge(&mut self, other: RetentionReport) {
        self.targets_processed += other.targets_processed;
        self.builds_retired += other.builds_retired;
        self.files_deleted += other.files_deleted;
        self.failures += other.failures;
        self.bytes_freed += other.bytes_freed;
    }
}

#[derive(Clone)]
pub struct RetentionManager {
    tracker: BuildTracker,
}

impl RetentionManager {
    pub fn new(tracker: BuildTracker) -> Self {
        Self { tracker }
    }

    pub async fn enforce(&self, target: &PollingTarget, keep: usize) -> Result<RetentionReport> {
        let started = Instant::now();
        let key = target.key();
        let active = self.tracker.active_history(key)?;
        let mut report = RetentionReport {
            targets_processed: 1,
            ..Default::default()
        };
        if active.len() <= keep {
            debug!(target = %target.display_name(), active = active.len(), keep, "[RETENTION] Nothing to retire");
            return Ok(report);
        }

        let (kept, retired) = active.split_at(keep);
        let tracking = self.tracker.tracking_record(key)?;
        let mut protected: HashSet<&Path> = kept.iter().flat_map(row_paths).collect();
        if let Some(live) = &tracking {
            protected.extend(live.download_path.as_deref());
            protected.extend(live.extraction_path.as_deref());
        }

        for row in retired {
            let mut row_ok = true;
            for path in row_paths(row) {
                if protected.contains(path) {
                    debug!(path = %path.display(), build = %row.build, "[RETENTION] Path shared with a kept build");
                    continue;
                }
                match remove_path(path.to_path_buf()).await {
                    Ok(Some(bytes)) => {
                        report.files_deleted += 1;
                        report.bytes_freed += bytes;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(path = %path.display(), build = %row.build, error = %e, "[RETENTION] Delete failed");
                        report.failures += 1;
                        row_ok = false;
                    }
                }
            }
            if row_ok {
                self.tracker.store().mark_history_deleted(row.id)?;
                report.builds_retired += 1;
            }
        }

        self.tracker.log(
            if report.failures == 0 { LogLevel::Info } else { LogLevel::Warning },
            OperationType::Cleanup,
            Some(key),
            format!(
                "[RETENTION] {} kept {keep}, retired {} builds, freed {} bytes, {} failures",
                target.display_name(),
                report.builds_retired,
                report.bytes_freed,
                report.failures
            ),
            Some(started.elapsed()),
        );
        Ok(report)
    }

    /// Enforce retention on every target and aggregate the totals. A target whose
    /// history cannot be read counts as one failure.
    pub async fn sweep(&self, targets: &[PollingTarget], keep: usize) -> RetentionReport {
        let mut total = RetentionReport::default();
        for target in targets {
            match self.enforce(target, keep).await {
                Ok(report) => total.merge(report),
                Err(e) => {
                    warn!(target = %target.display_name(), error = %e, "[RETENTION] Target skipped");
                    total.failures += 1;
                }
            }
        }
        info!(
            targets = total.targets_processed,
            retired = total.builds_retired,
            files_deleted = total.files_deleted,
            failures = total.failures,
            bytes_freed = total.bytes_freed,
            "[RETENTION] Sweep finished"
        );
        total
    }
}

fn row_paths(row: &BuildHistoryEntry) -> impl Iterator<Item = &Path> {
    row.download_path
        .as_deref()
        .into_iter()
        .chain(row.extraction_path.as_deref())
}

/// Remove a file or directory tree. `Ok(None)` when nothing was there, otherwise the
/// number of bytes freed.
async fn remove_path(path: PathBuf) -> io::Result<Option<u64>> {
    tokio::task::spawn_blocking(move || {
        let meta = match std::fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if meta.is_dir() {
            let bytes = disk_usage(&path);
            std::fs::remove_dir_all(&path)?;
            Ok(Some(bytes))
        } else {
            std::fs::remove_file(&path)?;
            Ok(Some(meta.len()))
        }
    })
    .await
    .map_err(io::Error::other)?
}
