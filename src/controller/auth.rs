//! Vault token acquisition and caching
//!
//! Tokens are cached per `(vault namespace, auth mount, role, identity)`.
//! Each key owns an async mutex so concurrent reconciles needing the same
//! token collapse into one login, while different keys never wait on each
//! other. The outer map lock is only held to look up or create a slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::identity::IdentityTokenSource;
use crate::crd::KubeAuthConfiguration;
use crate::error::{Error, Result};
use crate::vault::{VaultApi, VaultToken};

/// Default share of a token's TTL below which it is renewed
pub const DEFAULT_RENEW_FRACTION: f64 = 0.1;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TokenCacheKey {
    pub vault_namespace: Option<String>,
    pub mount: String,
    pub role: String,
    /// `<namespace>/<service account>`
    pub identity: String,
}

impl TokenCacheKey {
    pub fn new(cfg: &KubeAuthConfiguration, namespace: &str) -> Self {
        Self {
            vault_namespace: cfg.namespace.clone().filter(|ns| !ns.is_empty()),
            mount: cfg.mount_path().to_string(),
            role: cfg.role.clone(),
            identity: format!("{namespace}/{}", cfg.service_account_name()),
        }
    }
}

#[derive(Clone)]
struct CachedToken {
    token: VaultToken,
    obtained_at: Instant,
    ttl: Duration,
}

impl CachedToken {
    fn is_fresh(&self, renew_fraction: f64, now: Instant) -> bool {
        if self.ttl.is_zero() {
            return true;
        }
        let remaining = self
            .ttl
            .saturating_sub(now.saturating_duration_since(self.obtained_at));
        remaining > self.ttl.mul_f64(renew_fraction)
    }
}

#[derive(Default)]
struct SlotState {
    token: Option<CachedToken>,
    /// Outcome of the latest login attempt when it failed
    failure: Option<Error>,
}

/// Per-key cache entry; `completed` counts finished login attempts
#[derive(Default)]
struct SlotInner {
    completed: AtomicU64,
    state: tokio::sync::Mutex<SlotState>,
}

type Slot = Arc<SlotInner>;

/// Token cache shared by all reconcile workers
pub struct AuthManager<V, I> {
    vault: Arc<V>,
    identity: Arc<I>,
    renew_fraction: f64,
    slots: Mutex<HashMap<TokenCacheKey, Slot>>,
}

impl<V, I> AuthManager<V, I>
where
    V: VaultApi,
    I: IdentityTokenSource,
{
    pub fn new(vault: Arc<V>, identity: Arc<I>, renew_fraction: f64) -> Self {
        Self {
            vault,
            identity,
            renew_fraction: renew_fraction.clamp(0.0, 1.0),
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &TokenCacheKey) -> Slot {
        let mut slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.entry(key.clone()).or_default().clone()
    }

    /// Return a valid token for `cfg`, logging in if the cache has none
    ///
    /// Callers that queued behind a login attempt receive that attempt's
    /// result, success or failure, instead of starting their own.
    pub async fn acquire(&self, cfg: &KubeAuthConfiguration, namespace: &str) -> Result<VaultToken> {
        let key = TokenCacheKey::new(cfg, namespace);
        let slot = self.slot(&key);
        let seen = slot.completed.load(Ordering::SeqCst);
        let mut state = slot.state.lock().await;

        if let Some(cached) = state.token.as_ref() {
            if cached.is_fresh(self.renew_fraction, Instant::now()) {
                return Ok(cached.token.clone());
            }
            debug!(mount = %key.mount, role = %key.role, "Cached Vault token is due for renewal");
        }
        if slot.completed.load(Ordering::SeqCst) != seen {
            if let Some(failure) = state.failure.as_ref() {
                debug!(mount = %key.mount, role = %key.role, "Sharing failed login with waiting caller");
                return Err(failure.replicate());
            }
        }
        state.token = None;

        let result = self.login(&key, cfg, namespace).await;
        match &result {
            Ok(token) => {
                state.token = Some(token.clone());
                state.failure = None;
            }
            Err(e) => state.failure = Some(e.replicate()),
        }
        slot.completed.fetch_add(1, Ordering::SeqCst);
        result.map(|cached| cached.token)
    }

    async fn login(
        &self,
        key: &TokenCacheKey,
        cfg: &KubeAuthConfiguration,
        namespace: &str,
    ) -> Result<CachedToken> {
        let jwt = self
            .identity
            .service_account_token(namespace, cfg.service_account_name())
            .await?;

        let login = self
            .vault
            .login(&key.mount, &key.role, &jwt, key.vault_namespace.as_deref())
            .await;

        #[cfg(feature = "metrics")]
        super::metrics::inc_login(login.is_ok());

        let login = login.map_err(|e| {
            warn!(mount = %key.mount, role = %key.role, identity = %key.identity, "Vault login failed: {}", e);
            e
        })?;

        info!(
            mount = %key.mount,
            role = %key.role,
            identity = %key.identity,
            ttl_secs = login.ttl.as_secs(),
            "Obtained Vault token"
        );
        Ok(CachedToken {
            token: login.token,
            obtained_at: Instant::now(),
            ttl: login.ttl,
        })
    }

    /// Drop the cached token for `cfg` if it is still the rejected one
    pub async fn evict(&self, cfg: &KubeAuthConfiguration, namespace: &str, rejected: &VaultToken) {
        let key = TokenCacheKey::new(cfg, namespace);
        let slot = self.slot(&key);
        let mut state = slot.state.lock().await;
        if state.token.as_ref().is_some_and(|c| &c.token == rejected) {
            debug!(mount = %key.mount, role = %key.role, "Evicted rejected Vault token");
            state.token = None;
        }
    }

    /// Drop every cached token
    pub fn clear(&self) {
        let mut slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.clear();
    }

    pub async fn is_cached(&self, cfg: &KubeAuthConfiguration, namespace: &str) -> bool {
        let key = TokenCacheKey::new(cfg, namespace);
        let slot = {
            let slots = match self.slots.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            slots.get(&key).cloned()
        };
        match slot {
            Some(slot) => slot.state.lock().await.token.is_some(),
            None => false,
        }
    }
}

/// Whether an error from an authenticated call means the token was refused
pub(crate) fn is_token_rejection(err: &Error) -> bool {
    matches!(err, Error::AuthRejected(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::{DeleteOutcome, LoginResponse, Payload, VaultPath};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingVault {
        logins: AtomicUsize,
        ttl: Duration,
        reject: bool,
    }

    impl CountingVault {
        fn new(ttl: Duration) -> Self {
            Self {
                logins: AtomicUsize::new(0),
                ttl,
                reject: false,
            }
        }
    }

    #[async_trait]
    impl VaultApi for CountingVault {
        async fn login(
            &self,
            mount: &str,
            role: &str,
            _jwt: &str,
            namespace: Option<&str>,
        ) -> Result<LoginResponse> {
            let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.reject {
                return Err(Error::AuthRejected("permission denied".to_string()));
            }
            Ok(LoginResponse {
                token: VaultToken::new(format!("{mount}-{role}-{n}"), namespace.map(String::from)),
                ttl: self.ttl,
                renewable: true,
            })
        }

        async fn read(&self, _: &VaultToken, _: &VaultPath) -> Result<Option<Payload>> {
            Ok(None)
        }

        async fn write(&self, _: &VaultToken, _: &VaultPath, _: &Payload) -> Result<()> {
            Ok(())
        }

        async fn delete(&self, _: &VaultToken, _: &VaultPath) -> Result<DeleteOutcome> {
            Ok(DeleteOutcome::NotFound)
        }
    }

    struct StaticJwt;

    #[async_trait]
    impl IdentityTokenSource for StaticJwt {
        async fn service_account_token(&self, _: &str, _: &str) -> Result<String> {
            Ok("jwt".to_string())
        }
    }

    fn cfg(role: &str) -> KubeAuthConfiguration {
        KubeAuthConfiguration {
            role: role.to_string(),
            ..Default::default()
        }
    }

    fn manager(vault: Arc<CountingVault>) -> Arc<AuthManager<CountingVault, StaticJwt>> {
        Arc::new(AuthManager::new(
            vault,
            Arc::new(StaticJwt),
            DEFAULT_RENEW_FRACTION,
        ))
    }

    #[tokio::test]
    async fn test_concurrent_acquire_logs_in_once() {
        let vault = Arc::new(CountingVault::new(Duration::from_secs(3600)));
        let auth = manager(vault.clone());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let auth = auth.clone();
                tokio::spawn(async move { auth.acquire(&cfg("app"), "team-a").await })
            })
            .collect();

        let mut tokens = Vec::new();
        for handle in handles {
            tokens.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(vault.logins.load(Ordering::SeqCst), 1);
        assert!(tokens.iter().all(|t| t == &tokens[0]));
    }

    #[tokio::test]
    async fn test_distinct_keys_log_in_separately() {
        let vault = Arc::new(CountingVault::new(Duration::from_secs(3600)));
        let auth = manager(vault.clone());

        let a = auth.acquire(&cfg("app"), "team-a").await.unwrap();
        let b = auth.acquire(&cfg("app"), "team-b").await.unwrap();
        let c = auth.acquire(&cfg("other"), "team-a").await.unwrap();

        assert_eq!(vault.logins.load(Ordering::SeqCst), 3);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renews_below_threshold() {
        let vault = Arc::new(CountingVault::new(Duration::from_secs(100)));
        let auth = manager(vault.clone());

        auth.acquire(&cfg("app"), "team-a").await.unwrap();
        tokio::time::advance(Duration::from_secs(80)).await;
        auth.acquire(&cfg("app"), "team-a").await.unwrap();
        assert_eq!(vault.logins.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(15)).await;
        auth.acquire(&cfg("app"), "team-a").await.unwrap();
        assert_eq!(vault.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_never_expires() {
        let vault = Arc::new(CountingVault::new(Duration::ZERO));
        let auth = manager(vault.clone());

        auth.acquire(&cfg("app"), "team-a").await.unwrap();
        tokio::time::advance(Duration::from_secs(86_400 * 365)).await;
        auth.acquire(&cfg("app"), "team-a").await.unwrap();
        assert_eq!(vault.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_evict_only_removes_matching_token() {
        let vault = Arc::new(CountingVault::new(Duration::from_secs(3600)));
        let auth = manager(vault.clone());

        let first = auth.acquire(&cfg("app"), "team-a").await.unwrap();
        auth.evict(&cfg("app"), "team-a", &first).await;
        assert!(!auth.is_cached(&cfg("app"), "team-a").await);

        let second = auth.acquire(&cfg("app"), "team-a").await.unwrap();
        auth.evict(&cfg("app"), "team-a", &first).await;
        assert!(auth.is_cached(&cfg("app"), "team-a").await);
        assert_eq!(auth.acquire(&cfg("app"), "team-a").await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_failed_login_leaves_slot_empty() {
        let vault = Arc::new(CountingVault {
            reject: true,
            ..CountingVault::new(Duration::from_secs(3600))
        });
        let auth = manager(vault.clone());

        let err = auth.acquire(&cfg("app"), "team-a").await.unwrap_err();
        assert!(is_token_rejection(&err));
        assert!(!auth.is_cached(&cfg("app"), "team-a").await);
    }

    #[tokio::test]
    async fn test_concurrent_failed_login_is_shared() {
        let vault = Arc::new(CountingVault {
            reject: true,
            ..CountingVault::new(Duration::from_secs(3600))
        });
        let auth = manager(vault.clone());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let auth = auth.clone();
                tokio::spawn(async move { auth.acquire(&cfg("app"), "team-a").await })
            })
            .collect();

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(is_token_rejection(&err));
        }
        assert_eq!(vault.logins.load(Ordering::SeqCst), 1);
        assert!(!auth.is_cached(&cfg("app"), "team-a").await);

        // A caller arriving after the failed attempt tries again
        auth.acquire(&cfg("app"), "team-a").await.unwrap_err();
        assert_eq!(vault.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_clear_drops_everything() {
        let vault = Arc::new(CountingVault::new(Duration::from_secs(3600)));
        let auth = manager(vault.clone());

        auth.acquire(&cfg("app"), "team-a").await.unwrap();
        auth.clear();
        assert!(!auth.is_cached(&cfg("app"), "team-a").await);
    }

    #[test]
    fn test_cache_key_includes_vault_namespace() {
        let mut with_ns = cfg("app");
        with_ns.namespace = Some("admin/team".to_string());
        assert_ne!(
            TokenCacheKey::new(&with_ns, "team-a"),
            TokenCacheKey::new(&cfg("app"), "team-a")
        );
        assert_eq!(TokenCacheKey::new(&cfg("app"), "team-a").identity, "team-a/default");
    }
}
