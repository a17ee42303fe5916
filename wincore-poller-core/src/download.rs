//! Streams artifacts to their deterministic download path.
//!
//! The body is written to `<destination>.part` while a SHA-256 is computed in the same
//! pass; only a complete transfer is renamed onto the destination. A non-200 answer,
//! a timeout or an I/O error removes the partial file, so a failed download never
//! leaves anything that extraction could pick up.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, error, info};
use url::Url;

use crate::contract::ArtifactRepository;
use crate::error::DownloadError;

/// Write and hash granularity.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Progress is logged every this many bytes when the length is unknown.
const PROGRESS_STEP_UNKNOWN: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadedArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Lowercase hex SHA-256 of the file contents.
    pub checksum: String,
}

pub struct DownloadManager {
    repository: Arc<dyn ArtifactRepository>,
    timeout: Duration,
}

impl DownloadManager {
    pub fn new(repository: Arc<dyn ArtifactRepository>, timeout: Duration) -> Self {
        Self {
            repository,
            timeout,
        }
    }

    pub async fn download(
        &self,
        url: &Url,
        destination: &Path,
    ) -> Result<DownloadedArtifact, DownloadError> {
        let started = Instant::now();
        let partial = partial_path(destination);
        info!(url = %url, path = %destination.display(), "[DOWNLOAD] Starting");

        let transfer = match tokio::time::timeout(self.timeout, self.transfer(url, &partial)).await {
            Ok(result) => result,
            Err(_) => Err(DownloadError::Timeout {
                secs: self.timeout.as_secs(),
            }),
        };

        let (size_bytes, checksum) = match transfer {
            Ok(done) => done,
            Err(e) => {
                error!(url = %url, error = %e, "[DOWNLOAD] Failed");
                discard_partial(&partial).await;
                return Err(e);
            }
        };

        if let Err(source) = tokio::fs::rename(&partial, destination).await {
            discard_partial(&partial).await;
            return Err(DownloadError::Io {
                path: destination.to_path_buf(),
                source,
            });
        }

        info!(
            url = %url,
            path = %destination.display(),
            size_bytes,
            checksum = %checksum,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "[DOWNLOAD] Complete"
        );
        Ok(DownloadedArtifact {
            path: destination.to_path_buf(),
            size_bytes,
            checksum,
        })
    }

    async fn transfer(&self, url: &Url, partial: &Path) -> Result<(u64, String), DownloadError> {
        let response = self.repository.fetch(url).await?;
        if response.status() != StatusCode::OK {
            return Err(DownloadError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        let io_err = |source| DownloadError::Io {
            path: partial.to_path_buf(),
            source,
        };
        if let Some(parent) = partial.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let file = tokio::fs::File::create(partial).await.map_err(io_err)?;
        let mut writer = BufWriter::with_capacity(CHUNK_SIZE, file);
        let mut hasher = Sha256::new();
        let mut progress = Progress::new(response.content_length());
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for piece in chunk.chunks(CHUNK_SIZE) {
                hasher.update(piece);
                writer.write_all(piece).await.map_err(io_err)?;
            }
            progress.advance(chunk.len() as u64, url);
        }

        writer.flush().await.map_err(io_err)?;
        writer.get_ref().sync_all().await.map_err(io_err)?;
        Ok((progress.written, format!("{:x}", hasher.finalize())))
    }
}

/// Size and SHA-256 of a file already on disk.
pub async fn checksum_file(path: &Path) -> std::io::Result<(u64, String)> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut size = 0u64;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }
        Ok((size, format!("{:x}", hasher.finalize())))
    })
    .await
    .map_err(std::io::Error::other)?
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

async fn discard_partial(partial: &Path) {
    match tokio::fs::remove_file(partial).await {
        Ok(()) => debug!(path = %partial.display(), "[DOWNLOAD] Removed partial file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => error!(path = %partial.display(), error = %e, "[DOWNLOAD] Could not remove partial file"),
    }
}

struct Progress {
    total: Option<u64>,
    written: u64,
    next_report: u64,
}

impl Progress {
    fn new(total: Option<u64>) -> Self {
        let mut progress = Self {
            total: total.filter(|t| *t > 0),
            written: 0,
            next_report: 0,
        };
        progress.next_report = progress.step();
        progress
    }

    fn step(&self) -> u64 {
        self.total
            .map(|t| (t / 10).max(1))
            .unwrap_or(PROGRESS_STEP_UNKNOWN)
    }

    fn advance(&mut self, bytes: u64, url: &Url) {
        self.written += bytes;
        if self.written < self.next_report {
            return;
        }
        match self.total {
            Some(total) => debug!(
                url = %url,
                written = self.written,
                total,
                percent = self.written.saturating_mul(100) / total,
                "[DOWNLOAD] Progress"
            ),
            None => debug!(url = %url, written = self.written, "[DOWNLOAD] Progress"),
        }
        while self.next_report <= self.written {
            self.next_report += self.step();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::MockArtifactRepository;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    fn url() -> Url {
        Url::parse("https://repo/WIN/Core/main/Build20250101.1/Core.zip").unwrap()
    }

    fn serving(status: u16, body: &'static [u8]) -> Arc<dyn ArtifactRepository> {
        let mut repo = MockArtifactRepository::new();
        repo.expect_fetch().returning(move |_| {
            Ok(reqwest::Response::from(
                http::Response::builder()
                    .status(status)
                    .body(body.to_vec())
                    .unwrap(),
            ))
        });
        Arc::new(repo)
    }

    #[tokio::test]
    async fn test_identical_bytes_give_identical_checksum_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("guid").join("s").join("Core.zip");
        let manager = DownloadManager::new(serving(200, b"hello"), Duration::from_secs(5));

        let first = manager.download(&url(), &dest).await.unwrap();
        let second = manager.download(&url(), &dest).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.size_bytes, 5);
        assert_eq!(first.checksum, HELLO_SHA256);
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello");
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_large_body_is_hashed_across_chunks() {
        static BODY: [u8; 3 * CHUNK_SIZE + 17] = [7u8; 3 * CHUNK_SIZE + 17];
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("Core.zip");
        let manager = DownloadManager::new(serving(200, &BODY), Duration::from_secs(5));

        let artifact = manager.download(&url(), &dest).await.unwrap();
        let (size, checksum) = checksum_file(&dest).await.unwrap();
        assert_eq!(artifact.size_bytes, size);
        assert_eq!(artifact.checksum, checksum);
        assert_eq!(format!("{:x}", Sha256::digest(BODY)), checksum);
    }

    #[tokio::test]
    async fn test_non_200_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("Core.zip");
        let manager = DownloadManager::new(serving(404, b"missing"), Duration::from_secs(5));

        let err = manager.download(&url(), &dest).await.unwrap_err();
        assert!(matches!(err, DownloadError::Status { status: 404, .. }));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_stalled_body_times_out_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("Core.zip");
        let mut repo = MockArtifactRepository::new();
        repo.expect_fetch().returning(|_| {
            let stalled = futures::stream::pending::<Result<Vec<u8>, std::io::Error>>();
            Ok(reqwest::Response::from(
                http::Response::builder()
                    .status(200)
                    .body(reqwest::Body::wrap_stream(stalled))
                    .unwrap(),
            ))
        });
        let manager = DownloadManager::new(Arc::new(repo), Duration::from_millis(100));

        let err = manager.download(&url(), &dest).await.unwrap_err();
        assert!(matches!(err, DownloadError::Timeout { .. }));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }
}
