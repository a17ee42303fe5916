//! Per-target pipeline: discover → download → extract → retain.
//!
//! One [`TargetPipeline::poll`] call drives a single target through its states and
//! always ends in a [`TargetPollResult`]; failures are recorded on the tracking row,
//! in history and in the log, never propagated to the caller.
//!
//! # States
//! `Idle → Discovering → (NoNewBuild | Found)`, `Found → Downloading → (Downloaded |
//! DownloadFailed)`, `Downloaded → Extracting → (Extracted | ExtractFailed)`,
//! `Extracted → RetentionApplied`. `Failed` covers errors outside the stages, such as
//! an unreadable store or an invalid URL pattern.
//!
//! # Retries
//! A stage recorded as failed is retried on its own: a failed download reruns the
//! whole chain, a failed extraction reuses the file already on disk. A newer build
//! found by discovery always wins over retrying an older one. Retention runs after
//! every appended history row, so repeated failures never grow the active set
//! beyond the retention count.
//!
//! # Idempotence
//! When nothing newer is published and nothing failed, no row is written.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::EngineSettings;
use crate::contract::ArtifactRepository;
use crate::discovery::{BuildDiscoverer, DiscoveryLimits};
use crate::download::{checksum_file, DownloadManager};
use crate::error::PollError;
use crate::extract::ExtractionManager;
use crate::layout::ArtifactLayout;
use crate::model::{
    BuildId, BuildTrackingRecord, DownloadStatus, ExtractionStatus, FailedStage, HistoryStatus,
    LogLevel, NewHistoryEntry, OperationType, PollingTarget, TargetKey, TrackingUpdate,
};
use crate::repository::ArtifactLocator;
use crate::retention::RetentionManager;
use crate::tracker::BuildTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Idle,
    Discovering,
    NoNewBuild,
    Found,
    Downloading,
    Downloaded,
    DownloadFailed,
    Extracting,
    Extracted,
    ExtractFailed,
    RetentionApplied,
    Failed,
}

impl PipelineState {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            PipelineState::DownloadFailed | PipelineState::ExtractFailed | PipelineState::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetPollResult {
    pub key: TargetKey,
    pub target_name: String,
    pub state: PipelineState,
    pub build: Option<BuildId>,
    pub new_build: bool,
    pub retried: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Where a build's artifact lives, remotely and on disk.
struct Artifact {
    build: BuildId,
    url: Url,
    download_path: PathBuf,
    extraction_path: PathBuf,
}

/// What a stage run ended in; converted to a [`TargetPollResult`] by the caller.
struct StageOutcome {
    state: PipelineState,
    build: BuildId,
    error: Option<String>,
}

pub struct TargetPipeline {
    repository: Arc<dyn ArtifactRepository>,
    locator: ArtifactLocator,
    layout: ArtifactLayout,
    downloads: DownloadManager,
    extractor: ExtractionManager,
    retention: RetentionManager,
    tracker: BuildTracker,
    limits: DiscoveryLimits,
    retention_count: usize,
}

impl TargetPipeline {
    pub fn new(
        repository: Arc<dyn ArtifactRepository>,
        tracker: BuildTracker,
        settings: &EngineSettings,
    ) -> Result<Self, PollError> {
        Ok(Self {
            locator: ArtifactLocator::from_settings(settings)?,
            layout: ArtifactLayout::new(&settings.base_drive),
            downloads: DownloadManager::new(
                repository.clone(),
                Duration::from_secs(settings.download_timeout_secs),
            ),
            extractor: ExtractionManager::new(),
            retention: RetentionManager::new(tracker.clone()),
            repository,
            tracker,
            limits: DiscoveryLimits::default(),
            retention_count: settings.retention_count,
        })
    }

    pub fn retention(&self) -> &RetentionManager {
        &self.retention
    }

    pub fn retention_count(&self) -> usize {
        self.retention_count
    }

    /// Run one full poll for `target`.
    pub async fn poll(&self, target: &PollingTarget, today: NaiveDate) -> TargetPollResult {
        let started = Instant::now();
        info!(target = %target.display_name(), key = %target.key(), "[POLL] Polling target");
        let outcome = self.poll_inner(target, today).await;
        self.finish(target, outcome, started)
    }

    /// Re-run only the failed stage recorded for `target`. `None` when the tracking
    /// row records no failure.
    pub async fn retry_failed(&self, target: &PollingTarget) -> Option<TargetPollResult> {
        let started = Instant::now();
        let record = match self.tracker.tracking_record(target.key()) {
            Ok(record) => record,
            Err(e) => return Some(self.finish(target, Err(e.into()), started)),
        };
        let (record, stage) = record.and_then(|r| r.failed_stage().map(|s| (r, s)))?;
        let outcome = self.retry_stage(target, &record, stage).await;
        Some(self.finish(target, outcome.map(|o| (Some(o), true)), started))
    }

    async fn poll_inner(
        &self,
        target: &PollingTarget,
        today: NaiveDate,
    ) -> Result<(Option<StageOutcome>, bool), PollError> {
        self.layout.check_target(target)?;
        let record = self.tracker.tracking_record(target.key())?;
        let current = record.as_ref().map(|r| r.build);

        let discovery = BuildDiscoverer::new(self.repository.as_ref(), &self.locator, self.limits)
            .discover(target, current, today)
            .await?;

        if let Some(build) = discovery.best.filter(|b| b.is_newer_than(current)) {
            info!(target = %target.display_name(), build = %build, "[POLL] New build found");
            let artifact = self.artifact(target, build)?;
            return Ok((Some(self.run_from_download(target, &artifact).await?), false));
        }

        match record.and_then(|r| r.failed_stage().map(|s| (r, s))) {
            Some((record, stage)) => {
                info!(target = %target.display_name(), build = %record.build, ?stage, "[POLL] Retrying failed stage");
                let outcome = self.retry_stage(target, &record, stage).await?;
                Ok((Some(outcome), true))
            }
            None => {
                debug!(target = %target.display_name(), "[POLL] No new build");
                Ok((None, false))
            }
        }
    }

    async fn retry_stage(
        &self,
        target: &PollingTarget,
        record: &BuildTrackingRecord,
        stage: FailedStage,
    ) -> Result<StageOutcome, PollError> {
        let artifact = self.artifact(target, record.build)?;
        match stage {
            FailedStage::Download => self.run_from_download(target, &artifact).await,
            FailedStage::Extraction => {
                let archive = record
                    .download_path
                    .clone()
                    .unwrap_or_else(|| artifact.download_path.clone());
                match checksum_file(&archive).await {
                    Ok((size, checksum)) => {
                        self.run_from_extraction(target, &artifact, size, Some(checksum))
                            .await
                    }
                    Err(e) => {
                        warn!(path = %archive.display(), error = %e, "[POLL] Downloaded archive unusable, downloading again");
                        self.run_from_download(target, &artifact).await
                    }
                }
            }
        }
    }

    async fn run_from_download(
        &self,
        target: &PollingTarget,
        artifact: &Artifact,
    ) -> Result<StageOutcome, PollError> {
        let key = target.key();
        self.track(
            key,
            artifact,
            DownloadStatus::Downloading,
            ExtractionStatus::Pending,
            None,
        )?;

        let started = Instant::now();
        match self
            .downloads
            .download(&artifact.url, &artifact.download_path)
            .await
        {
            Ok(downloaded) => {
                self.tracker.log(
                    LogLevel::Info,
                    OperationType::Download,
                    Some(key),
                    format!(
                        "[DOWNLOAD] {} {} ({} bytes)",
                        target.display_name(),
                        artifact.build,
                        downloaded.size_bytes
                    ),
                    Some(started.elapsed()),
                );
                self.run_from_extraction(
                    target,
                    artifact,
                    downloaded.size_bytes,
                    Some(downloaded.checksum),
                )
                .await
            }
            Err(e) => {
                let message = e.to_string();
                self.track(
                    key,
                    artifact,
                    DownloadStatus::Failed,
                    ExtractionStatus::Pending,
                    Some(message.clone()),
                )?;
                self.tracker.append_history(
                    key,
                    &NewHistoryEntry {
                        build: artifact.build,
                        source_url: artifact.url.to_string(),
                        download_path: None,
                        extraction_path: None,
                        file_size: 0,
                        checksum: None,
                        status: HistoryStatus::DownloadFailed,
                    },
                )?;
                self.tracker.log(
                    LogLevel::Error,
                    OperationType::Download,
                    Some(key),
                    format!("[DOWNLOAD] {} {} failed: {message}", target.display_name(), artifact.build),
                    Some(started.elapsed()),
                );
                self.apply_retention(target).await;
                Ok(StageOutcome {
                    state: PipelineState::DownloadFailed,
                    build: artifact.build,
                    error: Some(message),
                })
            }
        }
    }

    async fn run_from_extraction(
        &self,
        target: &PollingTarget,
        artifact: &Artifact,
        file_size: u64,
        checksum: Option<String>,
    ) -> Result<StageOutcome, PollError> {
        let key = target.key();
        self.track(
            key,
            artifact,
            DownloadStatus::Downloaded,
            ExtractionStatus::Extracting,
            None,
        )?;

        let started = Instant::now();
        let extracted = self
            .extractor
            .extract(&artifact.download_path, &artifact.extraction_path)
            .await;

        let (extraction_status, history_status, extraction_path, error) = match &extracted {
            Ok(_) => (
                ExtractionStatus::Extracted,
                HistoryStatus::Extracted,
                Some(artifact.extraction_path.clone()),
                None,
            ),
            Err(e) => (
                ExtractionStatus::Failed,
                HistoryStatus::ExtractionFailed,
                None,
                Some(e.to_string()),
            ),
        };

        self.track(
            key,
            artifact,
            DownloadStatus::Downloaded,
            extraction_status,
            error.clone(),
        )?;
        self.tracker.append_history(
            key,
            &NewHistoryEntry {
                build: artifact.build,
                source_url: artifact.url.to_string(),
                download_path: Some(artifact.download_path.clone()),
                extraction_path,
                file_size,
                checksum,
                status: history_status,
            },
        )?;

        let extracted = match extracted {
            Ok(extracted) => extracted,
            Err(_) => {
                let message = error.unwrap_or_default();
                self.tracker.log(
                    LogLevel::Error,
                    OperationType::Extraction,
                    Some(key),
                    format!("[EXTRACT] {} {} failed: {message}", target.display_name(), artifact.build),
                    Some(started.elapsed()),
                );
                self.apply_retention(target).await;
                return Ok(StageOutcome {
                    state: PipelineState::ExtractFailed,
                    build: artifact.build,
                    error: Some(message),
                });
            }
        };
        self.tracker.log(
            LogLevel::Info,
            OperationType::Extraction,
            Some(key),
            format!(
                "[EXTRACT] {} {} ({} files)",
                target.display_name(),
                artifact.build,
                extracted.files
            ),
            Some(started.elapsed()),
        );

        let state = if self.apply_retention(target).await {
            PipelineState::RetentionApplied
        } else {
            PipelineState::Extracted
        };
        Ok(StageOutcome {
            state,
            build: artifact.build,
            error: None,
        })
    }

    /// Trim the target's history after a row was appended, whatever the outcome.
    async fn apply_retention(&self, target: &PollingTarget) -> bool {
        match self.retention.enforce(target, self.retention_count).await {
            Ok(_) => true,
            Err(e) => {
                warn!(target = %target.display_name(), error = %e, "[RETENTION] Could not apply retention");
                false
            }
        }
    }

    fn artifact(&self, target: &PollingTarget, build: BuildId) -> Result<Artifact, PollError> {
        self.layout.check_target(target)?;
        Ok(Artifact {
            build,
            url: self.locator.build_url(target, &build)?,
            download_path: self.layout.download_path(target),
            extraction_path: self.layout.extraction_path(target),
        })
    }

    fn track(
        &self,
        key: TargetKey,
        artifact: &Artifact,
        download_status: DownloadStatus,
        extraction_status: ExtractionStatus,
        last_error: Option<String>,
    ) -> Result<(), PollError> {
        self.tracker.upsert(
            key,
            &TrackingUpdate {
                build: artifact.build,
                download_status,
                extraction_status,
                download_path: Some(artifact.download_path.clone()),
                extraction_path: Some(artifact.extraction_path.clone()),
                last_error,
            },
        )?;
        Ok(())
    }

    fn finish(
        &self,
        target: &PollingTarget,
        outcome: Result<(Option<StageOutcome>, bool), PollError>,
        started: Instant,
    ) -> TargetPollResult {
        let mut result = TargetPollResult {
            key: target.key(),
            target_name: target.display_name(),
            state: PipelineState::NoNewBuild,
            build: None,
            new_build: false,
            retried: false,
            error: None,
            duration_ms: 0,
        };
        match outcome {
            Ok((Some(stage), retried)) => {
                result.state = stage.state;
                result.build = Some(stage.build);
                result.new_build = !retried;
                result.retried = retried;
                result.error = stage.error;
            }
            Ok((None, _)) => {}
            Err(e) => {
                let message = e.to_string();
                self.tracker.log(
                    LogLevel::Error,
                    OperationType::Poll,
                    Some(target.key()),
                    format!("[POLL] {} failed: {message}", target.display_name()),
                    None,
                );
                result.state = PipelineState::Failed;
                result.error = Some(message);
            }
        }
        result.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            target = %result.target_name,
            state = ?result.state,
            build = ?result.build.map(|b| b.to_string()),
            duration_ms = result.duration_ms,
            "[POLL] Target finished"
        );
        result
    }
}
