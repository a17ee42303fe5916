use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::repository::DEFAULT_URL_PATTERN;

pub const KEY_REPOSITORY_BASE_URL: &str = "repository_base_url";
pub const KEY_MAX_WORKERS: &str = "max_workers";
pub const KEY_POLLING_INTERVAL_SECS: &str = "polling_interval_secs";
pub const KEY_RETENTION_COUNT: &str = "retention_count";
pub const KEY_BASE_DRIVE: &str = "base_drive";
pub const KEY_URL_PATTERN: &str = "url_pattern";

/// Engine-wide settings. Persisted values in the store override these defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub repository_base_url: String,
    /// Health endpoint, relative to the base URL.
    pub health_path: String,
    pub max_workers: usize,
    pub polling_interval_secs: u64,
    pub retention_count: usize,
    pub base_drive: PathBuf,
    pub url_pattern: String,
    pub probe_timeout_secs: u64,
    pub download_timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            repository_base_url: "http://localhost:8081/artifactory/builds/".to_string(),
            health_path: "api/system/ping".to_string(),
            max_workers: 10,
            polling_interval_secs: 300,
            retention_count: 5,
            base_drive: PathBuf::from("./builds"),
            url_pattern: DEFAULT_URL_PATTERN.to_string(),
            probe_timeout_secs: 10,
            download_timeout_secs: 600,
        }
    }
}

impl EngineSettings {
    /// Apply persisted key/value settings on top of `self`. Unknown keys are
    /// ignored; unparsable values are logged and the current value is kept.
    pub fn with_overrides(mut self, persisted: &HashMap<String, String>) -> Self {
        for (key, value) in persisted {
            match key.as_str() {
                KEY_REPOSITORY_BASE_URL => self.repository_base_url = value.clone(),
                KEY_MAX_WORKERS => override_parsed(&mut self.max_workers, key, value),
                KEY_POLLING_INTERVAL_SECS => {
                    override_parsed(&mut self.polling_interval_secs, key, value)
                }
                KEY_RETENTION_COUNT => override_parsed(&mut self.retention_count, key, value),
                KEY_BASE_DRIVE => self.base_drive = PathBuf::from(value),
                KEY_URL_PATTERN => self.url_pattern = value.clone(),
                other => debug!(key = other, "Ignoring unknown persisted setting"),
            }
        }
        self.max_workers = self.max_workers.max(1);
        self
    }

    pub fn trace_loaded(&self) {
        info!(
            repository_base_url = %self.repository_base_url,
            max_workers = self.max_workers,
            polling_interval_secs = self.polling_interval_secs,
            retention_count = self.retention_count,
            base_drive = %self.base_drive.display(),
            "Loaded engine settings"
        );
        debug!(?self, "Engine settings loaded (full debug)");
    }
}

fn override_parsed<T: FromStr>(slot: &mut T, key: &str, value: &str) {
    match value.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value, "Invalid persisted setting, keeping default"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persisted_settings_override_defaults() {
        let persisted = HashMap::from([
            (KEY_MAX_WORKERS.to_string(), "250".to_string()),
            (KEY_RETENTION_COUNT.to_string(), "3".to_string()),
            (KEY_BASE_DRIVE.to_string(), "/mnt/d".to_string()),
        ]);
        let settings = EngineSettings::default().with_overrides(&persisted);
        assert_eq!(settings.max_workers, 250);
        assert_eq!(settings.retention_count, 3);
        assert_eq!(settings.base_drive, PathBuf::from("/mnt/d"));
        assert_eq!(settings.polling_interval_secs, 300);
    }

    #[test]
    fn test_invalid_values_keep_previous() {
        let persisted = HashMap::from([
            (KEY_MAX_WORKERS.to_string(), "lots".to_string()),
            (KEY_POLLING_INTERVAL_SECS.to_string(), "0".to_string()),
        ]);
        let settings = EngineSettings::default().with_overrides(&persisted);
        assert_eq!(settings.max_workers, 10);
        assert_eq!(settings.polling_interval_secs, 0);
    }

    #[test]
    fn test_worker_count_never_zero() {
        let persisted = HashMap::from([(KEY_MAX_WORKERS.to_string(), "0".to_string())]);
        assert_eq!(
            EngineSettings::default().with_overrides(&persisted).max_workers,
            1
        );
    }
}
