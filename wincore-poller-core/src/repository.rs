//! Repository access: artifact URL templating and the HTTP client.
//!
//! [`ArtifactLocator`] turns a target and a build into an artifact URL by
//! substituting a path pattern. [`HttpRepositoryClient`] is the reqwest-backed
//! [`ArtifactRepository`]: HEAD probes, health pings and authenticated GETs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::EngineSettings;
use crate::contract::{ArtifactRepository, ConnectivityReport};
use crate::credentials::CachedCredentials;
use crate::error::RepositoryError;
use crate::model::{BuildId, PollingTarget};

pub const DEFAULT_URL_PATTERN: &str =
    "{ProjectKey}/{ComponentName}/{branch}/Build{date}.{buildNumber}/{componentName}.zip";

const PROJECT_PLACEHOLDERS: [&str; 2] = ["{ProjectKey}", "{ProjectShortKey}"];
const COMPONENT_PLACEHOLDERS: [&str; 2] = ["{ComponentName}", "{componentName}"];
const BRANCH_PLACEHOLDER: &str = "{branch}";
const DATE_PLACEHOLDER: &str = "{date}";
const BUILD_NUMBER_PLACEHOLDER: &str = "{buildNumber}";

/// Check that a pattern names the branch, date, build number and component.
pub fn validate_pattern(pattern: &str) -> Result<(), RepositoryError> {
    let invalid = |reason: &str| RepositoryError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    };
    for required in [BRANCH_PLACEHOLDER, DATE_PLACEHOLDER, BUILD_NUMBER_PLACEHOLDER] {
        if !pattern.contains(required) {
            return Err(invalid(&format!("missing {required}")));
        }
    }
    if !COMPONENT_PLACEHOLDERS.iter().any(|p| pattern.contains(p)) {
        return Err(invalid("missing {componentName}"));
    }
    Ok(())
}

/// Builds artifact URLs from the repository base URL and a path pattern.
#[derive(Debug, Clone)]
pub struct ArtifactLocator {
    base_url: Url,
    default_pattern: String,
}

impl ArtifactLocator {
    pub fn new(base_url: &str, default_pattern: &str) -> Result<Self, RepositoryError> {
        validate_pattern(default_pattern)?;
        Ok(Self {
            base_url: directory_url(base_url)?,
            default_pattern: default_pattern.to_string(),
        })
    }

    pub fn from_settings(settings: &EngineSettings) -> Result<Self, RepositoryError> {
        Self::new(&settings.repository_base_url, &settings.url_pattern)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Artifact URL for `build` of `target`. The target's own pattern wins over the
    /// default; every substituted value is percent-encoded as a single path segment.
    pub fn build_url(&self, target: &PollingTarget, build: &BuildId) -> Result<Url, RepositoryError> {
        let pattern = target
            .url_pattern
            .as_deref()
            .unwrap_or(&self.default_pattern);
        validate_pattern(pattern)?;

        let project = urlencoding::encode(&target.project_key);
        let component = urlencoding::encode(&target.component_name);
        let branch = urlencoding::encode(&target.branch_name);
        let date = build.date_stamp();
        let number = build.number.to_string();

        let mut path = pattern.trim_start_matches('/').to_string();
        for placeholder in PROJECT_PLACEHOLDERS {
            path = path.replace(placeholder, &project);
        }
        for placeholder in COMPONENT_PLACEHOLDERS {
            path = path.replace(placeholder, &component);
        }
        path = path
            .replace(BRANCH_PLACEHOLDER, &branch)
            .replace(DATE_PLACEHOLDER, &date)
            .replace(BUILD_NUMBER_PLACEHOLDER, &number);

        Ok(self.base_url.join(&path)?)
    }
}

/// Parse `raw` and make sure it ends in `/` so `join` appends instead of replacing.
fn directory_url(raw: &str) -> Result<Url, RepositoryError> {
    let mut url = Url::parse(raw)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// reqwest-backed [`ArtifactRepository`].
pub struct HttpRepositoryClient {
    client: Client,
    health_url: Url,
    credentials: Arc<CachedCredentials>,
    probe_timeout: Duration,
}

impl HttpRepositoryClient {
    pub fn new(
        settings: &EngineSettings,
        credentials: Arc<CachedCredentials>,
    ) -> Result<Self, RepositoryError> {
        let base_url = directory_url(&settings.repository_base_url)?;
        let health_url = base_url.join(settings.health_path.trim_start_matches('/'))?;
        let client = Client::builder()
            .user_agent(concat!("wincore-poller/", env!("CARGO_PKG_VERSION")))
            .build()?;
        info!(base_url = %base_url, health_url = %health_url, "Initialized repository client");
        Ok(Self {
            client,
            health_url,
            credentials,
            probe_timeout: Duration::from_secs(settings.probe_timeout_secs),
        })
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        match self.credentials.get() {
            Some(creds) => request.basic_auth(creds.username, Some(creds.password)),
            None => request,
        }
    }
}

#[async_trait]
impl ArtifactRepository for HttpRepositoryClient {
    async fn probe(&self, url: &Url) -> bool {
        let request = self
            .authed(self.client.head(url.clone()))
            .timeout(self.probe_timeout);
        match request.send().await {
            Ok(resp) => match resp.status() {
                StatusCode::OK => {
                    debug!(url = %url, "[PROBE] Artifact exists");
                    true
                }
                StatusCode::NOT_FOUND => {
                    debug!(url = %url, "[PROBE] Artifact not found");
                    false
                }
                status @ (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
                    warn!(url = %url, status = %status, "[PROBE] Repository rejected credentials");
                    self.credentials.invalidate();
                    false
                }
                status => {
                    warn!(url = %url, status = %status, "[PROBE] Unexpected status, treating as missing");
                    false
                }
            },
            Err(e) => {
                warn!(url = %url, error = %e, "[PROBE] Request failed, treating as missing");
                false
            }
        }
    }

    async fn test_connectivity(&self) -> ConnectivityReport {
        let request = self
            .authed(self.client.get(self.health_url.clone()))
            .timeout(self.probe_timeout);
        match request.send().await {
            Ok(resp) if resp.status().is_success() => ConnectivityReport {
                reachable: true,
                message: format!("Repository reachable at {} (HTTP {})", self.health_url, resp.status()),
            },
            Ok(resp) => ConnectivityReport {
                reachable: false,
                message: format!(
                    "Repository health check at {} answered HTTP {}",
                    self.health_url,
                    resp.status()
                ),
            },
            Err(e) => ConnectivityReport {
                reachable: false,
                message: format!("Repository unreachable at {}: {e}", self.health_url),
            },
        }
    }

    async fn fetch(&self, url: &Url) -> Result<reqwest::Response, RepositoryError> {
        let response = self.authed(self.client.get(url.clone())).send().await?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn target() -> PollingTarget {
        PollingTarget {
            component_id: 7,
            branch_id: 3,
            component_guid: "0f8fad5b-d9cb-469f-a165-70867728950e".into(),
            component_name: "Core Services".into(),
            project_key: "WIN".into(),
            branch_name: "release/2025".into(),
            polling_interval_secs: 300,
            enabled: true,
            url_pattern: None,
        }
    }

    fn build() -> BuildId {
        BuildId::new(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(), 3)
    }

    #[test]
    fn test_default_pattern_encodes_each_segment() {
        let locator =
            ArtifactLocator::new("https://repo.example.com/artifactory/builds", DEFAULT_URL_PATTERN)
                .unwrap();
        let url = locator.build_url(&target(), &build()).unwrap();
        assert_eq!(
            url.as_str(),
            "https://repo.example.com/artifactory/builds/WIN/Core%20Services/release%2F2025/Build20250101.3/Core%20Services.zip"
        );
    }

    #[test]
    fn test_target_pattern_overrides_default() {
        let locator = ArtifactLocator::new("https://repo/", DEFAULT_URL_PATTERN).unwrap();
        let mut t = target();
        t.branch_name = "main".into();
        t.url_pattern =
            Some("{ProjectShortKey}/{branch}/{date}/{buildNumber}/{ComponentName}.zip".into());
        let url = locator.build_url(&t, &build()).unwrap();
        assert_eq!(url.as_str(), "https://repo/WIN/main/20250101/3/Core%20Services.zip");
    }

    #[test]
    fn test_pattern_validation_table() {
        let cases = [
            (DEFAULT_URL_PATTERN, true),
            ("{branch}/{date}/{buildNumber}/{componentName}.zip", true),
            ("{branch}/{date}/{componentName}.zip", false),
            ("{date}/{buildNumber}/{componentName}.zip", false),
            ("{branch}/{buildNumber}/{componentName}.zip", false),
            ("{branch}/{date}/{buildNumber}/artifact.zip", false),
        ];
        for (pattern, ok) in cases {
            assert_eq!(validate_pattern(pattern).is_ok(), ok, "pattern {pattern}");
        }
    }

    #[test]
    fn test_invalid_target_pattern_is_rejected() {
        let locator = ArtifactLocator::new("https://repo/", DEFAULT_URL_PATTERN).unwrap();
        let mut t = target();
        t.url_pattern = Some("{branch}/latest.zip".into());
        assert!(matches!(
            locator.build_url(&t, &build()),
            Err(RepositoryError::InvalidPattern { .. })
        ));
    }

    mod http_client {
        use super::super::*;
        use crate::contract::{Credentials, MockCredentialProvider};
        use std::sync::Mutex;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        /// Answers every request with `status` and an empty body, recording the
        /// request heads it saw.
        async fn serve(status: &'static str) -> (String, Arc<Mutex<Vec<String>>>) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let seen = Arc::new(Mutex::new(Vec::new()));
            let log = seen.clone();
            tokio::spawn(async move {
                while let Ok((mut socket, _)) = listener.accept().await {
                    let log = log.clone();
                    tokio::spawn(async move {
                        let mut head = Vec::new();
                        let mut buf = [0u8; 1024];
                        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                            match socket.read(&mut buf).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => head.extend_from_slice(&buf[..n]),
                            }
                        }
                        log.lock().unwrap().push(String::from_utf8_lossy(&head).into_owned());
                        let reply = format!(
                            "HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                        );
                        let _ = socket.write_all(reply.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
            });
            (format!("http://{addr}/artifactory/builds/"), seen)
        }

        fn credentials(expected_lookups: usize) -> Arc<CachedCredentials> {
            let mut provider = MockCredentialProvider::new();
            provider
                .expect_get_credentials()
                .times(expected_lookups)
                .returning(|| {
                    Some(Credentials {
                        username: "svc-poller".into(),
                        password: "secret".into(),
                    })
                });
            Arc::new(CachedCredentials::new(Box::new(provider)))
        }

        fn client(base_url: &str, credentials: Arc<CachedCredentials>) -> HttpRepositoryClient {
            let settings = EngineSettings {
                repository_base_url: base_url.to_string(),
                probe_timeout_secs: 5,
                ..EngineSettings::default()
            };
            HttpRepositoryClient::new(&settings, credentials).unwrap()
        }

        fn artifact(base_url: &str) -> Url {
            Url::parse(base_url)
                .unwrap()
                .join("WIN/Core/main/Build20250101.1/Core.zip")
                .unwrap()
        }

        #[tokio::test]
        async fn test_existence_check_maps_status_codes() {
            let cases = [
                ("200 OK", true),
                ("404 Not Found", false),
                ("500 Internal Server Error", false),
                ("302 Found", false),
            ];
            for (status, exists) in cases {
                let (base, seen) = serve(status).await;
                let repo = client(&base, credentials(1));
                assert_eq!(repo.probe(&artifact(&base)).await, exists, "status {status}");

                let requests = seen.lock().unwrap();
                assert!(requests[0].starts_with("HEAD /artifactory/builds/WIN/Core/main/"));
                assert!(requests[0].to_ascii_lowercase().contains("authorization: basic "));
            }
        }

        #[tokio::test]
        async fn test_cached_credentials_reused_across_requests() {
            let (base, _) = serve("200 OK").await;
            let repo = client(&base, credentials(1));
            assert!(repo.probe(&artifact(&base)).await);
            assert!(repo.probe(&artifact(&base)).await);
        }

        #[tokio::test]
        async fn test_rejected_credentials_are_invalidated() {
            for status in ["401 Unauthorized", "403 Forbidden"] {
                let (base, _) = serve(status).await;
                // each rejection drops the cache, so the second probe asks again
                let repo = client(&base, credentials(2));
                assert!(!repo.probe(&artifact(&base)).await);
                assert!(!repo.probe(&artifact(&base)).await);
            }
        }

        #[tokio::test]
        async fn test_unreachable_repository() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base = format!("http://{}/builds/", listener.local_addr().unwrap());
            drop(listener);

            let repo = client(&base, credentials(1));
            assert!(!repo.probe(&artifact(&base)).await);
            let report = repo.test_connectivity().await;
            assert!(!report.reachable);
            assert!(report.message.contains("unreachable"));
        }

        #[tokio::test]
        async fn test_health_check_requires_success_status() {
            let (base, seen) = serve("200 OK").await;
            let report = client(&base, credentials(1)).test_connectivity().await;
            assert!(report.reachable, "{}", report.message);
            assert!(seen.lock().unwrap()[0].starts_with("GET /artifactory/builds/api/system/ping"));

            let (base, _) = serve("503 Service Unavailable").await;
            let report = client(&base, credentials(1)).test_connectivity().await;
            assert!(!report.reachable);
            assert!(report.message.contains("503"));
        }
    }

    #[test]
    fn test_base_url_gains_trailing_slash() {
        let locator = ArtifactLocator::new("https://repo/a/b", DEFAULT_URL_PATTERN).unwrap();
        assert_eq!(locator.base_url().as_str(), "https://repo/a/b/");
    }
}
