//! Domain records shared by every stage of the polling pipeline.
//!
//! - [`PollingTarget`]: one (component, branch) pair to poll; read-only here.
//! - [`BuildTrackingRecord`]: the single mutable row per target.
//! - [`BuildHistoryEntry`]: append-only outcome of one processed build.
//! - [`PollingLogEntry`]: structured operational log row.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a polling target. Every persisted write is keyed by this pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetKey {
    pub component_id: i64,
    pub branch_id: i64,
}

impl TargetKey {
    pub fn new(component_id: i64, branch_id: i64) -> Self {
        Self {
            component_id,
            branch_id,
        }
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.component_id, self.branch_id)
    }
}

/// A (component, branch) pair configured for polling by the admin UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingTarget {
    pub component_id: i64,
    pub branch_id: i64,
    /// Filesystem namespace for everything this target downloads or extracts.
    pub component_guid: String,
    pub component_name: String,
    pub project_key: String,
    pub branch_name: String,
    pub polling_interval_secs: u64,
    pub enabled: bool,
    /// Overrides the engine-wide artifact URL pattern when set.
    pub url_pattern: Option<String>,
}

impl PollingTarget {
    pub fn key(&self) -> TargetKey {
        TargetKey::new(self.component_id, self.branch_id)
    }

    /// `project/component/branch`, used in logs and CLI output.
    pub fn display_name(&self) -> String {
        format!(
            "{}/{}/{}",
            self.project_key, self.component_name, self.branch_name
        )
    }
}

/// A published build: the (date, number) pair.
///
/// Field order matters: the derived ordering compares the date first and the
/// number second, which is exactly the "is newer" relation used by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildId {
    pub date: NaiveDate,
    pub number: u32,
}

impl BuildId {
    pub fn new(date: NaiveDate, number: u32) -> Self {
        Self { date, number }
    }

    /// `YYYYMMDD`, the form used in artifact URLs.
    pub fn date_stamp(&self) -> String {
        self.date.format("%Y%m%d").to_string()
    }

    /// True iff `self` is strictly newer than `current` (or nothing is tracked yet).
    pub fn is_newer_than(&self, current: Option<BuildId>) -> bool {
        current.map_or(true, |c| *self > c)
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Build{}.{}", self.date_stamp(), self.number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Downloaded,
    Failed,
}

impl DownloadStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Downloaded => "downloaded",
            DownloadStatus::Failed => "failed",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DownloadStatus::Pending),
            "downloading" => Some(DownloadStatus::Downloading),
            "downloaded" => Some(DownloadStatus::Downloaded),
            "failed" => Some(DownloadStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStatus {
    Pending,
    Extracting,
    Extracted,
    Failed,
}

impl ExtractionStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ExtractionStatus::Pending => "pending",
            ExtractionStatus::Extracting => "extracting",
            ExtractionStatus::Extracted => "extracted",
            ExtractionStatus::Failed => "failed",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExtractionStatus::Pending),
            "extracting" => Some(ExtractionStatus::Extracting),
            "extracted" => Some(ExtractionStatus::Extracted),
            "failed" => Some(ExtractionStatus::Failed),
            _ => None,
        }
    }
}

/// Mutable per-target state. At most one row per [`TargetKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTrackingRecord {
    pub component_id: i64,
    pub branch_id: i64,
    pub build: BuildId,
    pub download_status: DownloadStatus,
    pub extraction_status: ExtractionStatus,
    pub download_path: Option<PathBuf>,
    pub extraction_path: Option<PathBuf>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl BuildTrackingRecord {
    pub fn key(&self) -> TargetKey {
        TargetKey::new(self.component_id, self.branch_id)
    }

    /// The stage a retry has to re-run, if the last cycle left one failed.
    pub fn failed_stage(&self) -> Option<FailedStage> {
        if self.download_status == DownloadStatus::Failed {
            Some(FailedStage::Download)
        } else if self.extraction_status == ExtractionStatus::Failed {
            Some(FailedStage::Extraction)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailedStage {
    Download,
    Extraction,
}

/// Values written by [`crate::contract::BuildStore::upsert_tracking`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingUpdate {
    pub build: BuildId,
    pub download_status: DownloadStatus,
    pub extraction_status: ExtractionStatus,
    pub download_path: Option<PathBuf>,
    pub extraction_path: Option<PathBuf>,
    pub last_error: Option<String>,
}

/// Outcome recorded on a history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Extracted,
    DownloadFailed,
    ExtractionFailed,
}

impl HistoryStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            HistoryStatus::Extracted => "extracted",
            HistoryStatus::DownloadFailed => "download_failed",
            HistoryStatus::ExtractionFailed => "extraction_failed",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "extracted" => Some(HistoryStatus::Extracted),
            "download_failed" => Some(HistoryStatus::DownloadFailed),
            "extraction_failed" => Some(HistoryStatus::ExtractionFailed),
            _ => None,
        }
    }
}

/// Append-only record of one processed build outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildHistoryEntry {
    pub id: i64,
    pub component_id: i64,
    pub branch_id: i64,
    pub build: BuildId,
    pub source_url: String,
    pub download_path: Option<PathBuf>,
    pub extraction_path: Option<PathBuf>,
    pub file_size: u64,
    pub checksum: Option<String>,
    pub status: HistoryStatus,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
}

/// A history row before the store assigned it an id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewHistoryEntry {
    pub build: BuildId,
    pub source_url: String,
    pub download_path: Option<PathBuf>,
    pub extraction_path: Option<PathBuf>,
    pub file_size: u64,
    pub checksum: Option<String>,
    pub status: HistoryStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }

    pub fn from_db_str(s: &str) -> Self {
        match s {
            "debug" => LogLevel::Debug,
            "warning" => LogLevel::Warning,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Poll,
    Download,
    Extraction,
    Cleanup,
}

impl OperationType {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            OperationType::Poll => "poll",
            OperationType::Download => "download",
            OperationType::Extraction => "extraction",
            OperationType::Cleanup => "cleanup",
        }
    }

    pub fn from_db_str(s: &str) -> Self {
        match s {
            "download" => OperationType::Download,
            "extraction" => OperationType::Extraction,
            "cleanup" => OperationType::Cleanup,
            _ => OperationType::Poll,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingLogEntry {
    pub level: LogLevel,
    pub message: String,
    pub target: Option<TargetKey>,
    pub operation: OperationType,
    pub duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}
