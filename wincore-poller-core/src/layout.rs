use std::path::{Component, Path, PathBuf};

use crate::error::PollError;
use crate::model::PollingTarget;

/// On-disk layout under the base drive:
///
/// - download: `{base}/{componentGUID}/s/{componentName}.zip`
/// - extraction: `{base}/{componentGUID}/a/{componentName}/`
///
/// Every build of a target maps to the same two paths.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    base_drive: PathBuf,
}

impl ArtifactLayout {
    pub fn new(base_drive: impl Into<PathBuf>) -> Self {
        Self {
            base_drive: base_drive.into(),
        }
    }

    pub fn base_drive(&self) -> &Path {
        &self.base_drive
    }

    /// Reject targets whose GUID or name would not stay a single directory level
    /// below the base drive.
    pub fn check_target(&self, target: &PollingTarget) -> Result<(), PollError> {
        for (field, value) in [
            ("component_guid", &target.component_guid),
            ("component_name", &target.component_name),
        ] {
            if !is_single_segment(value) {
                return Err(PollError::InvalidTarget {
                    key: target.key(),
                    reason: format!("{field} {value:?} is not a plain path segment"),
                });
            }
        }
        Ok(())
    }

    pub fn download_path(&self, target: &PollingTarget) -> PathBuf {
        self.base_drive
            .join(&target.component_guid)
            .join("s")
            .join(format!("{}.zip", target.component_name))
    }

    pub fn extraction_path(&self, target: &PollingTarget) -> PathBuf {
        self.base_drive
            .join(&target.component_guid)
            .join("a")
            .join(&target.component_name)
    }
}

fn is_single_segment(value: &str) -> bool {
    if value.is_empty() || value.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
