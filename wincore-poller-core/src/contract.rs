//! # contract: seams between the polling engine and the outside world
//!
//! The engine talks to three collaborators it does not own:
//!
//! - [`CredentialProvider`]: hands out repository credentials (or none, for anonymous access).
//! - [`ArtifactRepository`]: the binary repository, reached over HTTP. Existence probes,
//!   connectivity checks and raw artifact fetches.
//! - [`BuildStore`]: the relational store holding polling targets, tracking rows, history rows,
//!   operational logs and persisted settings.
//!
//! ## Mocking & Testing
//! - All three traits are annotated for `mockall` so tests can script probe outcomes, artifact
//!   bodies and store failures. The mocks are exported behind the `test-export-mocks` feature for
//!   integration tests in other crates.
//! - Most store-backed tests use a real in-memory SQLite database instead; see
//!   [`crate::store::SqliteStore::in_memory`].
//!
//! ## Error Handling
//! - Probes never fail: "not found", unexpected statuses and network errors all answer `false`.
//! - Fetch failures are typed ([`RepositoryError`]); store failures are `anyhow` errors with context.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;
use url::Url;

use crate::error::RepositoryError;
use crate::model::{
    BuildHistoryEntry, BuildTrackingRecord, NewHistoryEntry, PollingLogEntry, PollingTarget,
    TargetKey, TrackingUpdate,
};

/// Repository username/password pair.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Supplies repository credentials. `None` means anonymous access.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
pub trait CredentialProvider: Send + Sync {
    fn get_credentials(&self) -> Option<Credentials>;
}

/// Result of pinging the repository health endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivityReport {
    pub reachable: bool,
    pub message: String,
}

/// The external binary repository.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ArtifactRepository: Send + Sync {
    /// Lightweight existence check. 200 => true; anything else => false.
    async fn probe(&self, url: &Url) -> bool;

    /// Ping the repository health endpoint.
    async fn test_connectivity(&self) -> ConnectivityReport;

    /// Start an authenticated GET for an artifact. The status code is left for the
    /// caller to judge; only transport failures are errors here.
    async fn fetch(&self, url: &Url) -> Result<reqwest::Response, RepositoryError>;
}

/// Persistent state for targets, tracking, history, logs and settings.
///
/// All writes are keyed by [`TargetKey`]; the single task processing a target in a
/// cycle is the only writer of that target's rows.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
pub trait BuildStore: Send + Sync {
    /// Cheap round trip used by connectivity checks.
    fn ping(&self) -> anyhow::Result<()>;

    fn list_targets(&self, enabled_only: bool) -> anyhow::Result<Vec<PollingTarget>>;

    fn get_target(&self, key: TargetKey) -> anyhow::Result<Option<PollingTarget>>;

    fn get_tracking(&self, key: TargetKey) -> anyhow::Result<Option<BuildTrackingRecord>>;

    fn list_tracking(&self) -> anyhow::Result<Vec<BuildTrackingRecord>>;

    /// Insert or replace the tracking row for `key`.
    fn upsert_tracking(&self, key: TargetKey, update: &TrackingUpdate) -> anyhow::Result<()>;

    /// Append a history row; returns its id.
    fn append_history(&self, key: TargetKey, entry: &NewHistoryEntry) -> anyhow::Result<i64>;

    /// Rows with `deleted = false`, newest first.
    fn list_active_history(&self, key: TargetKey) -> anyhow::Result<Vec<BuildHistoryEntry>>;

    /// Every row for the target, newest first.
    fn list_history(&self, key: TargetKey) -> anyhow::Result<Vec<BuildHistoryEntry>>;

    fn mark_history_deleted(&self, id: i64) -> anyhow::Result<()>;

    fn append_log(&self, entry: &PollingLogEntry) -> anyhow::Result<()>;

    fn recent_logs(&self, limit: usize) -> anyhow::Result<Vec<PollingLogEntry>>;

    /// Persisted key/value configuration.
    fn load_settings(&self) -> anyhow::Result<HashMap<String, String>>;

    fn put_setting(&self, key: &str, value: &str) -> anyhow::Result<()>;
}
