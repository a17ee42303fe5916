/// `load_config` module: loads the static YAML config for the poller CLI.
///
/// The YAML file carries no secrets. It names the SQLite database and the engine
/// defaults; values persisted in the database's settings table override those
/// defaults once the store is open (see `PollingEngine::resolve_settings`).
/// Repository credentials come from the environment (`REPOSITORY_USERNAME`,
/// `REPOSITORY_PASSWORD`), optionally via a `.env` file loaded at startup.
///
/// # Accepted YAML
/// ```yaml
/// database_path: ./data/poller.db
/// defaults:
///   repository_base_url: https://artifacts.example.com/artifactory/builds/
///   max_workers: 50
///   polling_interval_secs: 300
///   retention_count: 5
///   base_drive: /mnt/builds
/// ```
/// Every key under `defaults` is optional.
///
/// # Errors
/// Unreadable files, malformed YAML and invalid URL patterns surface as `anyhow::Error`.
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use wincore_poller_core::config::EngineSettings;
use wincore_poller_core::repository::validate_pattern;

#[derive(Debug, Clone, Deserialize)]
pub struct CliConfig {
    pub database_path: PathBuf,
    #[serde(default)]
    pub defaults: EngineSettings,
}

impl CliConfig {
    pub fn trace_loaded(&self) {
        info!(database_path = %self.database_path.display(), "Loaded CLI configuration");
        self.defaults.trace_loaded();
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CliConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let content = fs::read_to_string(path_ref).map_err(|e| {
        error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
        anyhow::anyhow!("Failed to read config file {:?}: {}", path_ref, e)
    })?;

    let config: CliConfig = serde_yaml::from_str(&content).map_err(|e| {
        error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
        anyhow::anyhow!("Failed to parse config YAML: {e}")
    })?;

    if config.database_path.as_os_str().is_empty() {
        bail!("database_path must not be empty");
    }
    validate_pattern(&config.defaults.url_pattern).context("Invalid defaults.url_pattern")?;

    info!(config_path = ?path_ref, "Parsed config YAML successfully");
    Ok(config)
}
