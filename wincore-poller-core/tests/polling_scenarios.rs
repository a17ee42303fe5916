use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use tempfile::tempdir;
use url::Url;
use zip::write::SimpleFileOptions;

use wincore_poller_core::config::EngineSettings;
use wincore_poller_core::contract::{BuildStore, MockArtifactRepository};
use wincore_poller_core::engine::PollingEngine;
use wincore_poller_core::model::{
    BuildId, DownloadStatus, ExtractionStatus, HistoryStatus, PollingTarget,
};
use wincore_poller_core::pipeline::PipelineState;
use wincore_poller_core::store::SqliteStore;

fn jan_first() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
}

fn target(component_id: i64, name: &str) -> PollingTarget {
    PollingTarget {
        component_id,
        branch_id: 1,
        component_guid: format!("guid-{component_id}"),
        component_name: name.to_string(),
        project_key: "WIN".to_string(),
        branch_name: "main".to_string(),
        polling_interval_secs: 60,
        enabled: true,
        url_pattern: None,
    }
}

fn settings(base_drive: &Path) -> EngineSettings {
    EngineSettings {
        repository_base_url: "https://repo.example.com/builds/".to_string(),
        base_drive: base_drive.to_path_buf(),
        retention_count: 5,
        ..EngineSettings::default()
    }
}

fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, body) in files {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(body).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn response(status: u16, body: Vec<u8>) -> reqwest::Response {
    reqwest::Response::from(http::Response::builder().status(status).body(body).unwrap())
}

/// Probes succeed for builds 1..=`latest` of 2025-01-01, for every component.
fn publish_up_to(repo: &mut MockArtifactRepository, latest: u32) {
    repo.expect_probe().returning(move |url: &Url| {
        (1..=latest).any(|n| url.path().contains(&format!("/Build20250101.{n}/")))
    });
}

fn engine(
    repo: MockArtifactRepository,
    store: &Arc<SqliteStore>,
    base_drive: &Path,
) -> PollingEngine {
    PollingEngine::new(settings(base_drive), Arc::new(repo), store.clone())
        .unwrap()
        .with_clock(jan_first)
}

#[tokio::test]
async fn test_new_build_is_extracted_then_second_cycle_is_idempotent() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let core = target(1, "Core");
    store.upsert_target(&core).unwrap();

    let mut repo = MockArtifactRepository::new();
    publish_up_to(&mut repo, 3);
    let body = zip_bytes(&[("bin/core.dll", b"binary"), ("version.txt", b"3")]);
    repo.expect_fetch()
        .times(1)
        .withf(|url: &Url| url.path().ends_with("/WIN/Core/main/Build20250101.3/Core.zip"))
        .returning(move |_| Ok(response(200, body.clone())));
    let engine = engine(repo, &store, dir.path());

    let report = engine.poll_all_targets().await.unwrap();
    assert_eq!(report.targets_polled, 1);
    assert_eq!(report.new_builds, 1);
    assert_eq!(report.failures, 0);
    let result = &report.results[0];
    assert_eq!(result.state, PipelineState::RetentionApplied);
    assert_eq!(result.build, Some(BuildId::new(jan_first(), 3)));

    let tracking = store.get_tracking(core.key()).unwrap().unwrap();
    assert_eq!(tracking.build, BuildId::new(jan_first(), 3));
    assert_eq!(tracking.download_status, DownloadStatus::Downloaded);
    assert_eq!(tracking.extraction_status, ExtractionStatus::Extracted);
    assert_eq!(tracking.last_error, None);

    let extracted = dir.path().join("guid-1").join("a").join("Core");
    assert_eq!(std::fs::read(extracted.join("version.txt")).unwrap(), b"3");
    assert!(dir.path().join("guid-1").join("s").join("Core.zip").exists());

    let history = store.list_active_history(core.key()).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, HistoryStatus::Extracted);
    assert_eq!(history[0].file_size, tracking_size(dir.path()));
    assert_eq!(history[0].checksum.as_ref().map(String::len), Some(64));

    let second = engine.poll_all_targets().await.unwrap();
    assert_eq!(second.new_builds, 0);
    assert_eq!(second.results[0].state, PipelineState::NoNewBuild);
    assert!(!second.results[0].new_build);
    assert_eq!(store.get_tracking(core.key()).unwrap(), Some(tracking));
    assert_eq!(store.list_history(core.key()).unwrap().len(), 1);
}

fn tracking_size(base: &Path) -> u64 {
    std::fs::metadata(base.join("guid-1").join("s").join("Core.zip"))
        .unwrap()
        .len()
}

#[tokio::test]
async fn test_download_failure_does_not_block_other_target() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let broken = target(1, "Broken");
    let healthy = target(2, "Healthy");
    store.upsert_target(&broken).unwrap();
    store.upsert_target(&healthy).unwrap();

    let mut repo = MockArtifactRepository::new();
    publish_up_to(&mut repo, 1);
    let body = zip_bytes(&[("app.exe", b"MZ")]);
    repo.expect_fetch().returning(move |url: &Url| {
        if url.path().contains("/Broken/") {
            Ok(response(500, b"internal error".to_vec()))
        } else {
            Ok(response(200, body.clone()))
        }
    });
    let engine = engine(repo, &store, dir.path());

    let report = engine.poll_all_targets().await.unwrap();
    assert_eq!(report.targets_polled, 2);
    assert_eq!(report.failures, 1);
    // both targets found a newer build; only one got it onto disk
    assert_eq!(report.new_builds, 2);

    let state_of = |key| {
        report
            .results
            .iter()
            .find(|r| r.key == key)
            .map(|r| r.state)
            .unwrap()
    };
    assert_eq!(state_of(broken.key()), PipelineState::DownloadFailed);
    assert_eq!(state_of(healthy.key()), PipelineState::RetentionApplied);

    let failed = store.get_tracking(broken.key()).unwrap().unwrap();
    assert_eq!(failed.download_status, DownloadStatus::Failed);
    assert!(failed.last_error.unwrap().contains("500"));
    assert!(!dir.path().join("guid-1").join("s").join("Broken.zip").exists());

    let history = store.list_history(broken.key()).unwrap();
    assert_eq!(history[0].status, HistoryStatus::DownloadFailed);
}

#[tokio::test]
async fn test_operator_retry_reruns_failed_download() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let core = target(1, "Core");
    store.upsert_target(&core).unwrap();

    let mut repo = MockArtifactRepository::new();
    publish_up_to(&mut repo, 2);
    let calls = Arc::new(AtomicUsize::new(0));
    let body = zip_bytes(&[("core.dll", b"ok")]);
    {
        let calls = calls.clone();
        repo.expect_fetch().returning(move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(response(503, Vec::new()))
            } else {
                Ok(response(200, body.clone()))
            }
        });
    }
    let engine = engine(repo, &store, dir.path());

    let first = engine.poll_all_targets().await.unwrap();
    assert_eq!(first.results[0].state, PipelineState::DownloadFailed);

    let retried = engine.retry_target(core.key()).await.unwrap().unwrap();
    assert!(retried.retried);
    assert_eq!(retried.state, PipelineState::RetentionApplied);
    assert_eq!(retried.build, Some(BuildId::new(jan_first(), 2)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let tracking = store.get_tracking(core.key()).unwrap().unwrap();
    assert_eq!(tracking.extraction_status, ExtractionStatus::Extracted);
    assert_eq!(tracking.last_error, None);

    assert!(engine.retry_target(core.key()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_extraction_is_retried_without_downloading_again() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let core = target(1, "Core");
    store.upsert_target(&core).unwrap();

    let mut repo = MockArtifactRepository::new();
    publish_up_to(&mut repo, 1);
    repo.expect_fetch()
        .times(1)
        .returning(|_| Ok(response(200, b"definitely not a zip".to_vec())));
    let engine = engine(repo, &store, dir.path());

    let first = engine.poll_all_targets().await.unwrap();
    assert_eq!(first.results[0].state, PipelineState::ExtractFailed);
    let tracking = store.get_tracking(core.key()).unwrap().unwrap();
    assert_eq!(tracking.download_status, DownloadStatus::Downloaded);
    assert_eq!(tracking.extraction_status, ExtractionStatus::Failed);

    // repair the archive in place; the next cycle retries extraction only
    let archive = tracking.download_path.unwrap();
    std::fs::write(&archive, zip_bytes(&[("core.dll", b"fixed")])).unwrap();

    let second = engine.poll_all_targets().await.unwrap();
    let result = &second.results[0];
    assert!(result.retried);
    assert!(!result.new_build);
    assert_eq!(result.state, PipelineState::RetentionApplied);

    let statuses: Vec<_> = store
        .list_history(core.key())
        .unwrap()
        .iter()
        .map(|h| h.status)
        .collect();
    assert_eq!(
        statuses,
        vec![HistoryStatus::Extracted, HistoryStatus::ExtractionFailed]
    );
}

#[tokio::test]
async fn test_retention_keeps_newest_builds_across_cycles() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let core = target(1, "Core");
    store.upsert_target(&core).unwrap();

    let latest = Arc::new(AtomicU32::new(1));
    let mut repo = MockArtifactRepository::new();
    {
        let latest = latest.clone();
        repo.expect_probe().returning(move |url: &Url| {
            (1..=latest.load(Ordering::SeqCst))
                .any(|n| url.path().contains(&format!("/Build20250101.{n}/")))
        });
    }
    let body = zip_bytes(&[("core.dll", b"ok")]);
    repo.expect_fetch()
        .times(4)
        .returning(move |_| Ok(response(200, body.clone())));
    let mut settings = settings(dir.path());
    settings.retention_count = 2;
    let engine = PollingEngine::new(settings, Arc::new(repo), store.clone())
        .unwrap()
        .with_clock(jan_first);

    for n in 1..=4 {
        latest.store(n, Ordering::SeqCst);
        let report = engine.poll_all_targets().await.unwrap();
        assert_eq!(report.results[0].build, Some(BuildId::new(jan_first(), n)));
        assert_eq!(report.results[0].state, PipelineState::RetentionApplied);
    }

    let active: Vec<u32> = store
        .list_active_history(core.key())
        .unwrap()
        .iter()
        .map(|h| h.build.number)
        .collect();
    assert_eq!(active, vec![4, 3]);

    let retired: Vec<(u32, bool)> = store
        .list_history(core.key())
        .unwrap()
        .iter()
        .map(|h| (h.build.number, h.deleted))
        .collect();
    assert_eq!(retired, vec![(4, false), (3, false), (2, true), (1, true)]);

    // the newest build's files stay on disk
    let extracted = dir.path().join("guid-1").join("a").join("Core");
    assert!(extracted.join("core.dll").exists());

    let report = engine.cleanup().await.unwrap();
    assert_eq!(report.targets_processed, 1);
    assert_eq!(report.builds_retired, 0);
}

#[tokio::test]
async fn test_repeated_failures_stay_within_retention() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let core = target(1, "Core");
    store.upsert_target(&core).unwrap();

    let mut repo = MockArtifactRepository::new();
    publish_up_to(&mut repo, 1);
    repo.expect_fetch()
        .times(1)
        .returning(|_| Ok(response(200, b"still not a zip".to_vec())));
    let mut settings = settings(dir.path());
    settings.retention_count = 2;
    let engine = PollingEngine::new(settings, Arc::new(repo), store.clone())
        .unwrap()
        .with_clock(jan_first);

    for cycle in 0..6 {
        let report = engine.poll_all_targets().await.unwrap();
        assert_eq!(report.results[0].state, PipelineState::ExtractFailed);
        assert_eq!(report.results[0].retried, cycle > 0);
        let active = store.list_active_history(core.key()).unwrap();
        assert!(active.len() <= 2, "cycle {cycle}: {} active rows", active.len());
    }

    let history = store.list_history(core.key()).unwrap();
    assert_eq!(history.len(), 6);
    assert_eq!(history.iter().filter(|h| !h.deleted).count(), 2);
    // the two active rows are the two newest
    assert!(history[..2].iter().all(|h| !h.deleted));

    // the archive still backs the kept rows
    assert!(dir.path().join("guid-1").join("s").join("Core.zip").exists());
    assert_eq!(engine.cleanup().await.unwrap().builds_retired, 0);
}

#[tokio::test]
async fn test_target_escaping_base_drive_fails_without_io() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("builds");
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let mut rogue = target(1, "Core");
    rogue.component_name = "../../outside".to_string();
    store.upsert_target(&rogue).unwrap();

    // no probe or fetch expectation: any repository call panics the mock
    let engine = engine(MockArtifactRepository::new(), &store, &base);

    let report = engine.poll_all_targets().await.unwrap();
    assert_eq!(report.failures, 1);
    let result = &report.results[0];
    assert_eq!(result.state, PipelineState::Failed);
    assert!(result.error.as_ref().unwrap().contains("component_name"));
    assert!(store.get_tracking(rogue.key()).unwrap().is_none());
    assert!(!dir.path().join("outside").exists());
}

#[tokio::test]
async fn test_status_lists_targets_with_tracking() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    store.upsert_target(&target(1, "Core")).unwrap();
    let mut disabled = target(2, "Legacy");
    disabled.enabled = false;
    store.upsert_target(&disabled).unwrap();

    let engine = engine(MockArtifactRepository::new(), &store, dir.path());
    let status = engine.status().unwrap();
    assert_eq!(status.active_targets, 1);
    assert!(status.targets[0].tracking.is_none());
}
