//! Error taxonomy for the polling pipeline.
//!
//! A discovery miss is not an error (probes answer `false`). Download and
//! extraction failures are kept apart so a retry can target the failed stage only.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("invalid URL pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid artifact URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("repository request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("repository answered HTTP {status} for {url}")]
    Status { status: u16, url: String },

    #[error("download did not finish within {secs}s")]
    Timeout { secs: u64 },

    #[error("transfer failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("could not write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("archive {0} does not exist")]
    MissingArchive(PathBuf),

    #[error("archive {path} is corrupt: {reason}")]
    CorruptArchive { path: PathBuf, reason: String },

    #[error("extraction into {path} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("extraction produced no files in {0}")]
    EmptyResult(PathBuf),
}

/// Umbrella error for engine-level operations.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("connectivity check failed: {0}")]
    Connectivity(String),

    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("unknown polling target {0}")]
    UnknownTarget(crate::model::TargetKey),

    #[error("polling target {key} cannot be laid out on disk: {reason}")]
    InvalidTarget {
        key: crate::model::TargetKey,
        reason: String,
    },
}
