//! ZIP extraction into a target's extraction directory.
//!
//! The archive is opened and validated before the destination is touched. The
//! destination is then replaced wholesale, every entry is written under it, and the
//! result is checked to contain at least one file. A failed extraction removes what
//! it wrote so a half-populated directory is never reported as extracted.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::error::ExtractionError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedArtifact {
    pub path: PathBuf,
    pub files: usize,
    pub bytes: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ExtractionManager;

impl ExtractionManager {
    pub fn new() -> Self {
        Self
    }

    pub async fn extract(
        &self,
        archive: &Path,
        destination: &Path,
    ) -> Result<ExtractedArtifact, ExtractionError> {
        let started = Instant::now();
        let archive = archive.to_path_buf();
        let destination = destination.to_path_buf();
        info!(archive = %archive.display(), destination = %destination.display(), "[EXTRACT] Starting");

        let result = {
            let src = archive.clone();
            let dest = destination.clone();
            tokio::task::spawn_blocking(move || extract_blocking(&src, &dest))
                .await
                .map_err(|e| ExtractionError::Io {
                    path: destination.clone(),
                    source: io::Error::other(e),
                })?
        };

        match &result {
            Ok(done) => info!(
                archive = %archive.display(),
                files = done.files,
                bytes = done.bytes,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "[EXTRACT] Complete"
            ),
            Err(e) => error!(archive = %archive.display(), error = %e, "[EXTRACT] Failed"),
        }
        result
    }
}

fn extract_blocking(archive: &Path, destination: &Path) -> Result<ExtractedArtifact, ExtractionError> {
    if !archive.is_file() {
        return Err(ExtractionError::MissingArchive(archive.to_path_buf()));
    }
    let file = File::open(archive).map_err(|source| ExtractionError::Io {
        path: archive.to_path_buf(),
        source,
    })?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| corrupt(archive, e))?;

    clear_destination(destination)?;
    let unpacked = unpack(&mut zip, archive, destination).and_then(|_| summarize(destination));
    if unpacked.is_err() {
        if let Err(e) = fs::remove_dir_all(destination) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %destination.display(), error = %e, "[EXTRACT] Could not remove partial extraction");
            }
        }
    }
    unpacked
}

fn unpack(
    zip: &mut zip::ZipArchive<File>,
    archive: &Path,
    destination: &Path,
) -> Result<(), ExtractionError> {
    let io_err = |path: &Path, source| ExtractionError::Io {
        path: path.to_path_buf(),
        source,
    };
    fs::create_dir_all(destination).map_err(|e| io_err(destination, e))?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|e| corrupt(archive, e))?;
        let relative = entry.enclosed_name().ok_or_else(|| ExtractionError::CorruptArchive {
            path: archive.to_path_buf(),
            reason: format!("entry {:?} escapes the extraction directory", entry.name()),
        })?;
        let out = destination.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out).map_err(|e| io_err(&out, e))?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let mut target = File::create(&out).map_err(|e| io_err(&out, e))?;
        io::copy(&mut entry, &mut target).map_err(|e| io_err(&out, e))?;
    }
    Ok(())
}

fn clear_destination(destination: &Path) -> Result<(), ExtractionError> {
    match fs::remove_dir_all(destination) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ExtractionError::Io {
            path: destination.to_path_buf(),
            source,
        }),
    }
}

fn summarize(destination: &Path) -> Result<ExtractedArtifact, ExtractionError> {
    let mut files = 0;
    let mut bytes = 0;
    for entry in WalkDir::new(destination) {
        let entry = entry.map_err(|e| ExtractionError::Io {
            path: destination.to_path_buf(),
            source: e.into(),
        })?;
        if entry.file_type().is_file() {
            files += 1;
            bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    if files == 0 {
        return Err(ExtractionError::EmptyResult(destination.to_path_buf()));
    }
    Ok(ExtractedArtifact {
        path: destination.to_path_buf(),
        files,
        bytes,
    })
}

fn corrupt(archive: &Path, e: zip::result::ZipError) -> ExtractionError {
    ExtractionError::CorruptArchive {
        path: archive.to_path_buf(),
        reason: e.to_string(),
    }
}

/// Total size in bytes of a file or directory tree; missing paths count as zero.
pub fn disk_usage(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
