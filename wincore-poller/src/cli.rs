///
/// This module implements the CLI for wincore-poller: command parsing, engine
/// wiring and the user-visible output of every command.
///
/// All domain logic (discovery, download, extraction, retention, the engine) lives in
/// the [`wincore-poller-core`] crate. This module only builds the engine from the
/// loaded config and prints what it returns.
///
/// ## Commands
/// - `start`: continuous polling until Ctrl-C.
/// - `poll`: exactly one cycle, then a summary (`--json` for the full report).
/// - `test`: repository connectivity only.
/// - `cleanup`: retention sweep across all enabled targets.
/// - `status`: active target count and last known builds.
/// - `config`: effective non-secret configuration.
/// - `retry`: re-run the failed stage of one target.
/// - `logs`: most recent operational log rows.
///
/// Every command takes `--config <path>` pointing at the YAML file.
///
/// [`wincore-poller-core`]: ../../wincore-poller-core/
use crate::load_config::{load_config, CliConfig};
use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use wincore_poller_core::contract::CredentialProvider;
use wincore_poller_core::credentials::{CachedCredentials, EnvCredentialProvider};
use wincore_poller_core::engine::{CycleReport, PollingEngine};
use wincore_poller_core::model::TargetKey;
use wincore_poller_core::repository::HttpRepositoryClient;
use wincore_poller_core::store::SqliteStore;

/// CLI for wincore-poller: poll the artifact repository for new component builds.
#[derive(Parser)]
#[clap(
    name = "wincore-poller",
    version,
    about = "Discover, download, extract and retain component builds from the artifact repository"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct ConfigArg {
    /// Path to the YAML config file
    #[clap(long)]
    pub config: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the continuous polling loop until interrupted
    Start(ConfigArg),
    /// Run exactly one poll cycle and print a summary
    Poll {
        #[clap(flatten)]
        config: ConfigArg,
        /// Print the cycle report as JSON
        #[clap(long)]
        json: bool,
    },
    /// Test repository connectivity
    Test(ConfigArg),
    /// Apply retention to every enabled target
    Cleanup(ConfigArg),
    /// Print the active target count and last known builds
    Status {
        #[clap(flatten)]
        config: ConfigArg,
        /// Print the status as JSON
        #[clap(long)]
        json: bool,
    },
    /// Print the effective non-secret configuration
    Config(ConfigArg),
    /// Re-run the failed stage of one target
    Retry {
        #[clap(flatten)]
        config: ConfigArg,
        #[clap(long)]
        component_id: i64,
        #[clap(long)]
        branch_id: i64,
    },
    /// Print the most recent operational log entries
    Logs {
        #[clap(flatten)]
        config: ConfigArg,
        #[clap(long, default_value_t = 50)]
        limit: usize,
    },
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    // Emit a top-level 'trace_initialised' event at the very start
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Start(arg) => {
            let engine = Arc::new(build_engine(&load(&arg)?)?);
            engine.start().await?;
            let interval = Duration::from_secs(engine.settings().polling_interval_secs.max(1));
            let runner = {
                let engine = engine.clone();
                tokio::spawn(async move { engine.run_continuous(interval).await })
            };
            tokio::signal::ctrl_c().await?;
            tracing::info!(command = "start", "Shutdown requested, waiting for in-flight targets");
            engine.stop().await;
            runner.await?;
            println!("Polling stopped");
            Ok(())
        }
        Commands::Poll { config, json } => {
            let engine = build_engine(&load(&config)?)?;
            engine.start().await?;
            let report = engine.poll_all_targets().await?;
            tracing::info!(command = "poll", polled = report.targets_polled, "Poll cycle complete");
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_cycle(&report);
            }
            Ok(())
        }
        Commands::Test(arg) => {
            let engine = build_engine(&load(&arg)?)?;
            let report = engine.test_connectivity().await;
            if !report.reachable {
                tracing::error!(command = "test", message = %report.message, "Connectivity test failed");
                bail!("Connectivity test failed: {}", report.message);
            }
            println!("OK: {}", report.message);
            Ok(())
        }
        Commands::Cleanup(arg) => {
            let engine = build_engine(&load(&arg)?)?;
            let report = engine.cleanup().await?;
            println!(
                "Retention: {} targets, {} builds retired, {} paths deleted, {} failures, {} bytes freed",
                report.targets_processed,
                report.builds_retired,
                report.files_deleted,
                report.failures,
                report.bytes_freed
            );
            Ok(())
        }
        Commands::Status { config, json } => {
            let engine = build_engine(&load(&config)?)?;
            let status = engine.status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }
            println!("Active targets: {}", status.active_targets);
            for entry in status.targets {
                match entry.tracking {
                    Some(t) => println!(
                        "  {} [{}] {} download={} extraction={}{}",
                        entry.target.display_name(),
                        entry.target.key(),
                        t.build,
                        t.download_status.as_db_str(),
                        t.extraction_status.as_db_str(),
                        t.last_error.map(|e| format!(" error={e}")).unwrap_or_default()
                    ),
                    None => println!(
                        "  {} [{}] no build tracked yet",
                        entry.target.display_name(),
                        entry.target.key()
                    ),
                }
            }
            Ok(())
        }
        Commands::Config(arg) => {
            let config = load(&arg)?;
            let store = SqliteStore::open(&config.database_path)?;
            let settings = PollingEngine::resolve_settings(config.defaults.clone(), &store)?;
            println!("database_path: {}", config.database_path.display());
            println!("repository_base_url: {}", settings.repository_base_url);
            println!("health_path: {}", settings.health_path);
            println!("max_workers: {}", settings.max_workers);
            println!("polling_interval_secs: {}", settings.polling_interval_secs);
            println!("retention_count: {}", settings.retention_count);
            println!("base_drive: {}", settings.base_drive.display());
            println!("url_pattern: {}", settings.url_pattern);
            println!("probe_timeout_secs: {}", settings.probe_timeout_secs);
            println!("download_timeout_secs: {}", settings.download_timeout_secs);
            match EnvCredentialProvider.get_credentials() {
                Some(creds) => println!("repository_username: {}", mask(&creds.username)),
                None => println!("repository_username: (anonymous)"),
            }
            Ok(())
        }
        Commands::Retry {
            config,
            component_id,
            branch_id,
        } => {
            let engine = build_engine(&load(&config)?)?;
            let key = TargetKey::new(component_id, branch_id);
            match engine.retry_target(key).await? {
                Some(result) => {
                    println!(
                        "{} [{}] {:?}{}",
                        result.target_name,
                        result.key,
                        result.state,
                        result.error.map(|e| format!(": {e}")).unwrap_or_default()
                    );
                    if result.state.is_failure() {
                        bail!("Retry of {key} failed");
                    }
                }
                None => println!("Nothing to retry for {key}"),
            }
            Ok(())
        }
        Commands::Logs { config, limit } => {
            let engine = build_engine(&load(&config)?)?;
            for entry in engine.recent_logs(limit)? {
                println!(
                    "{} {:<7} {:<10} {}{}{}",
                    entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.level.as_db_str(),
                    entry.operation.as_db_str(),
                    entry.target.map(|t| format!("[{t}] ")).unwrap_or_default(),
                    entry.message,
                    entry.duration_ms.map(|d| format!(" ({d} ms)")).unwrap_or_default()
                );
            }
            Ok(())
        }
    }
}

fn load(arg: &ConfigArg) -> Result<CliConfig> {
    let config = load_config(&arg.config)?;
    config.trace_loaded();
    Ok(config)
}

/// Open the store, resolve settings and wire the engine.
fn build_engine(config: &CliConfig) -> Result<PollingEngine> {
    let store = Arc::new(SqliteStore::open(&config.database_path)?);
    let settings = PollingEngine::resolve_settings(config.defaults.clone(), store.as_ref())?;
    settings.trace_loaded();
    let credentials = Arc::new(CachedCredentials::new(Box::new(EnvCredentialProvider)));
    let repository = Arc::new(HttpRepositoryClient::new(&settings, credentials)?);
    Ok(PollingEngine::new(settings, repository, store)?)
}

fn print_cycle(report: &CycleReport) {
    println!(
        "Cycle: {} polled, {} new builds, {} failures, {} skipped in {} ms",
        report.targets_polled, report.new_builds, report.failures, report.skipped, report.duration_ms
    );
    for result in &report.results {
        println!(
            "  {} [{}] {:?}{}{}",
            result.target_name,
            result.key,
            result.state,
            result.build.map(|b| format!(" {b}")).unwrap_or_default(),
            result.error.as_ref().map(|e| format!(": {e}")).unwrap_or_default()
        );
    }
}

/// Keep the first character, hide the rest.
pub fn mask(value: &str) -> String {
    match value.chars().next() {
        Some(first) => format!("{first}{}", "*".repeat(value.chars().count().saturating_sub(1).max(3))),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::mask;

    #[test]
    fn test_mask_hides_all_but_first_char() {
        assert_eq!(mask("svc-poller"), "s*********");
        assert_eq!(mask("ab"), "a***");
        assert_eq!(mask(""), "");
    }
}
