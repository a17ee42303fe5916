//! Repository credentials and the TTL cache in front of them.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::contract::{CredentialProvider, Credentials};

/// How long fetched credentials are reused before the provider is asked again.
pub const CREDENTIAL_TTL: Duration = Duration::from_secs(15 * 60);

pub const USERNAME_ENV: &str = "REPOSITORY_USERNAME";
pub const PASSWORD_ENV: &str = "REPOSITORY_PASSWORD";

/// A value plus the instant it stops being valid.
#[derive(Debug)]
pub struct TtlCache<T> {
    ttl: Duration,
    entry: Option<(T, Instant)>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entry: None }
    }

    /// Cached value if still fresh at `now`.
    pub fn get_at(&self, now: Instant) -> Option<T> {
        match &self.entry {
            Some((value, expires_at)) if now < *expires_at => Some(value.clone()),
            _ => None,
        }
    }

    pub fn insert_at(&mut self, value: T, now: Instant) {
        self.entry = Some((value, now + self.ttl));
    }

    /// Return the fresh value, or refresh it with `load` and cache the result.
    pub fn get_or_refresh_at<F>(&mut self, now: Instant, load: F) -> T
    where
        F: FnOnce() -> T,
    {
        if let Some(value) = self.get_at(now) {
            return value;
        }
        let value = load();
        self.insert_at(value.clone(), now);
        value
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }
}

/// Wraps a provider so it is consulted at most once per [`CREDENTIAL_TTL`].
pub struct CachedCredentials {
    provider: Box<dyn CredentialProvider>,
    cache: Mutex<TtlCache<Option<Credentials>>>,
}

impl CachedCredentials {
    pub fn new(provider: Box<dyn CredentialProvider>) -> Self {
        Self::with_ttl(provider, CREDENTIAL_TTL)
    }

    pub fn with_ttl(provider: Box<dyn CredentialProvider>, ttl: Duration) -> Self {
        Self {
            provider,
            cache: Mutex::new(TtlCache::new(ttl)),
        }
    }

    pub fn get(&self) -> Option<Credentials> {
        let Ok(mut cache) = self.cache.lock() else {
            warn!("Credential cache poisoned, asking provider directly");
            return self.provider.get_credentials();
        };
        cache.get_or_refresh_at(Instant::now(), || {
            debug!("Refreshing repository credentials");
            self.provider.get_credentials()
        })
    }

    /// Drop the cached value, e.g. after the repository rejected it.
    pub fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.invalidate();
        }
    }
}

/// Reads `REPOSITORY_USERNAME` / `REPOSITORY_PASSWORD` from the environment.
/// Either variable missing means anonymous access.
#[derive(Debug, Default)]
pub struct EnvCredentialProvider;

impl CredentialProvider for EnvCredentialProvider {
    fn get_credentials(&self) -> Option<Credentials> {
        match (std::env::var(USERNAME_ENV), std::env::var(PASSWORD_ENV)) {
            (Ok(username), Ok(password)) if !username.is_empty() => {
                info!(username = %username, "Repository credentials found in env");
                Some(Credentials { username, password })
            }
            _ => {
                info!("No repository credentials in env, using anonymous access");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::MockCredentialProvider;

    #[test]
    fn test_ttl_cache_expires() {
        let mut cache = TtlCache::new(Duration::from_secs(10));
        let start = Instant::now();
        cache.insert_at(1, start);
        assert_eq!(cache.get_at(start + Duration::from_secs(9)), Some(1));
        assert_eq!(cache.get_at(start + Duration::from_secs(10)), None);
    }

    #[test]
    fn test_ttl_cache_refreshes_on_access_after_expiry() {
        let mut cache = TtlCache::new(Duration::from_secs(10));
        let start = Instant::now();
        let mut loads = 0;
        let mut load = |v| {
            loads += 1;
            v
        };
        assert_eq!(cache.get_or_refresh_at(start, || load(1)), 1);
        assert_eq!(cache.get_or_refresh_at(start + Duration::from_secs(5), || load(2)), 1);
        assert_eq!(cache.get_or_refresh_at(start + Duration::from_secs(11), || load(3)), 3);
        assert_eq!(loads, 2);
    }

    #[test]
    fn test_cached_credentials_hit_provider_once() {
        let mut provider = MockCredentialProvider::new();
        provider.expect_get_credentials().times(1).returning(|| {
            Some(Credentials {
                username: "svc".into(),
                password: "secret".into(),
            })
        });
        let cached = CachedCredentials::new(Box::new(provider));
        assert_eq!(cached.get().map(|c| c.username), Some("svc".to_string()));
        assert_eq!(cached.get().map(|c| c.username), Some("svc".to_string()));
    }

    #[test]
    fn test_invalidate_forces_reload() {
        let mut provider = MockCredentialProvider::new();
        provider.expect_get_credentials().times(2).returning(|| None);
        let cached = CachedCredentials::new(Box::new(provider));
        assert!(cached.get().is_none());
        cached.invalidate();
        assert!(cached.get().is_none());
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials {
            username: "svc".into(),
            password: "hunter2".into(),
        };
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
