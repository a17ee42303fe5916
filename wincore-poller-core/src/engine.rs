//! # PollingEngine: the orchestrator
//!
//! Owns the bounded worker pool and fans each poll cycle out across the enabled
//! targets, one task per target, collecting results as they complete.
//!
//! ## Lifecycle
//! - [`PollingEngine::new`]: wire the engine from settings, a repository and a store.
//! - [`PollingEngine::start`]: check that repository and store are reachable.
//! - [`PollingEngine::poll_all_targets`]: one cycle over every enabled target.
//! - [`PollingEngine::run_continuous`]: cycle, then sleep, until stopped. Cycles never
//!   overlap, so at most one pipeline per target is ever in flight.
//! - [`PollingEngine::stop`]: cancel the loop and wait for in-flight pipelines.
//!
//! ## Worker pool
//! A [`Semaphore`] with `max_workers` permits bounds concurrency; tasks live in a
//! [`JoinSet`]. Stopping drains the pool by acquiring every permit, then closes it.
//!
//! ## Failure isolation
//! A target's failure becomes a [`TargetPollResult`] at the task boundary. Only
//! failing to list targets aborts a cycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDate};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineSettings;
use crate::contract::{ArtifactRepository, BuildStore, ConnectivityReport};
use crate::error::PollError;
use crate::model::{
    BuildTrackingRecord, LogLevel, OperationType, PollingLogEntry, PollingTarget, TargetKey,
};
use crate::pipeline::{TargetPipeline, TargetPollResult};
use crate::retention::RetentionReport;
use crate::tracker::BuildTracker;

/// Aggregate of one cycle. `new_builds` counts newer builds found, including those
/// whose download or extraction then failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub targets_polled: usize,
    pub new_builds: usize,
    pub failures: usize,
    pub skipped: usize,
    pub results: Vec<TargetPollResult>,
    pub duration_ms: u64,
}

impl CycleReport {
    fn record(&mut self, result: TargetPollResult) {
        self.targets_polled += 1;
        if result.new_build {
            self.new_builds += 1;
        }
        if result.state.is_failure() {
            self.failures += 1;
        }
        self.results.push(result);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetStatus {
    pub target: PollingTarget,
    pub tracking: Option<BuildTrackingRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub active_targets: usize,
    pub targets: Vec<TargetStatus>,
}

pub struct PollingEngine {
    settings: EngineSettings,
    repository: Arc<dyn ArtifactRepository>,
    tracker: BuildTracker,
    pipeline: Arc<TargetPipeline>,
    workers: Arc<Semaphore>,
    cancel: CancellationToken,
    last_polled: Mutex<HashMap<TargetKey, Instant>>,
    today: fn() -> NaiveDate,
}

impl PollingEngine {
    pub fn new(
        settings: EngineSettings,
        repository: Arc<dyn ArtifactRepository>,
        store: Arc<dyn BuildStore>,
    ) -> Result<Self, PollError> {
        let tracker = BuildTracker::new(store);
        let pipeline = TargetPipeline::new(repository.clone(), tracker.clone(), &settings)?;
        let max_workers = settings.max_workers.max(1);
        info!(max_workers, "Initialised polling engine");
        Ok(Self {
            workers: Arc::new(Semaphore::new(max_workers)),
            pipeline: Arc::new(pipeline),
            settings,
            repository,
            tracker,
            cancel: CancellationToken::new(),
            last_polled: Mutex::new(HashMap::new()),
            today: local_today,
        })
    }

    /// YAML defaults overlaid with the settings persisted in `store`.
    pub fn resolve_settings(
        defaults: EngineSettings,
        store: &dyn BuildStore,
    ) -> Result<EngineSettings, PollError> {
        Ok(defaults.with_overrides(&store.load_settings()?))
    }

    /// Replace the clock used to pick "today" for discovery.
    pub fn with_clock(mut self, today: fn() -> NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub async fn test_connectivity(&self) -> ConnectivityReport {
        self.repository.test_connectivity().await
    }

    /// Fail unless both the store and the repository answer.
    pub async fn start(&self) -> Result<(), PollError> {
        self.tracker
            .store()
            .ping()
            .map_err(|e| PollError::Connectivity(format!("store unreachable: {e:#}")))?;
        let report = self.repository.test_connectivity().await;
        if !report.reachable {
            self.tracker.log(
                LogLevel::Error,
                OperationType::Poll,
                None,
                format!("[POLL] Connectivity check failed: {}", report.message),
                None,
            );
            return Err(PollError::Connectivity(report.message));
        }
        info!(message = %report.message, "[POLL] Connectivity verified");
        Ok(())
    }

    /// One cycle over every enabled target.
    pub async fn poll_all_targets(&self) -> Result<CycleReport, PollError> {
        self.run_cycle(false).await
    }

    /// Poll until [`stop`](Self::stop) is called, sleeping `interval` after each cycle.
    /// Targets whose own interval has not yet elapsed are skipped.
    pub async fn run_continuous(&self, interval: Duration) {
        info!(interval_secs = interval.as_secs(), "[POLL] Continuous polling started");
        while !self.cancel.is_cancelled() {
            match self.start().await {
                Ok(()) => match self.run_cycle(true).await {
                    Ok(report) => debug!(
                        polled = report.targets_polled,
                        skipped = report.skipped,
                        "[POLL] Cycle done"
                    ),
                    Err(e) => error!(error = %e, "[POLL] Cycle aborted"),
                },
                Err(e) => error!(error = %e, "[POLL] Skipping cycle"),
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("[POLL] Continuous polling stopped");
    }

    /// Signal the loop to exit and wait for in-flight pipelines to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let permits = u32::try_from(self.settings.max_workers.max(1)).unwrap_or(u32::MAX);
        match self.workers.acquire_many(permits).await {
            Ok(_drained) => info!("[POLL] Worker pool drained"),
            Err(_) => debug!("[POLL] Worker pool already closed"),
        }
        self.workers.close();
    }

    /// Re-run the failed stage of one target. `Ok(None)` when nothing failed.
    pub async fn retry_target(&self, key: TargetKey) -> Result<Option<TargetPollResult>, PollError> {
        let target = self
            .tracker
            .store()
            .get_target(key)?
            .ok_or(PollError::UnknownTarget(key))?;
        let result = self.pipeline.retry_failed(&target).await;
        match &result {
            Some(r) => info!(key = %key, state = ?r.state, "[POLL] Operator retry finished"),
            None => info!(key = %key, "[POLL] Nothing to retry"),
        }
        Ok(result)
    }

    /// Retention sweep across every enabled target.
    pub async fn cleanup(&self) -> Result<RetentionReport, PollError> {
        let targets = self.tracker.store().list_targets(true)?;
        Ok(self
            .pipeline
            .retention()
            .sweep(&targets, self.pipeline.retention_count())
            .await)
    }

    pub fn status(&self) -> Result<EngineStatus, PollError> {
        let store = self.tracker.store();
        let targets = store.list_targets(true)?;
        let mut tracking: HashMap<TargetKey, BuildTrackingRecord> = store
            .list_tracking()?
            .into_iter()
            .map(|r| (r.key(), r))
            .collect();
        Ok(EngineStatus {
            active_targets: targets.len(),
            targets: targets
                .into_iter()
                .map(|target| TargetStatus {
                    tracking: tracking.remove(&target.key()),
                    target,
                })
                .collect(),
        })
    }

    pub fn recent_logs(&self, limit: usize) -> Result<Vec<PollingLogEntry>, PollError> {
        Ok(self.tracker.store().recent_logs(limit)?)
    }

    async fn run_cycle(&self, respect_intervals: bool) -> Result<CycleReport, PollError> {
        let started = Instant::now();
        let targets = self.tracker.store().list_targets(true)?;
        let mut report = CycleReport::default();

        let (due, skipped) = self.due_targets(targets, respect_intervals, Instant::now());
        report.skipped = skipped;
        info!(due = due.len(), skipped, "[POLL] Starting cycle");

        let today = (self.today)();
        let mut tasks = JoinSet::new();
        for target in due {
            let pipeline = self.pipeline.clone();
            let workers = self.workers.clone();
            let cancel = self.cancel.clone();
            tasks.spawn(async move {
                let _permit = match workers.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return None,
                };
                if cancel.is_cancelled() {
                    return None;
                }
                Some(pipeline.poll(&target, today).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(result)) => {
                    self.mark_polled(result.key, Instant::now());
                    report.record(result);
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    error!(error = %e, "[POLL] Target task panicked");
                    report.failures += 1;
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        self.tracker.log(
            if report.failures == 0 { LogLevel::Info } else { LogLevel::Warning },
            OperationType::Poll,
            None,
            format!(
                "[POLL] Cycle finished: {} polled, {} new builds, {} failures, {} skipped",
                report.targets_polled, report.new_builds, report.failures, report.skipped
            ),
            Some(Duration::from_millis(report.duration_ms)),
        );
        Ok(report)
    }

    fn due_targets(
        &self,
        targets: Vec<PollingTarget>,
        respect_intervals: bool,
        now: Instant,
    ) -> (Vec<PollingTarget>, usize) {
        if !respect_intervals {
            return (targets, 0);
        }
        let last = self.last_polled.lock().unwrap_or_else(|e| e.into_inner());
        let (due, waiting): (Vec<_>, Vec<_>) = targets.into_iter().partition(|t| {
            last.get(&t.key()).map_or(true, |at| {
                now.saturating_duration_since(*at) >= Duration::from_secs(t.polling_interval_secs)
            })
        });
        for t in &waiting {
            debug!(target = %t.display_name(), "[POLL] Not due yet");
        }
        (due, waiting.len())
    }

    fn mark_polled(&self, key: TargetKey, at: Instant) {
        match self.last_polled.lock() {
            Ok(mut last) => {
                last.insert(key, at);
            }
            Err(e) => warn!(error = %e, "Poll schedule lock poisoned"),
        }
    }
}

fn local_today() -> NaiveDate {
    Local::now().date_naive()
}
