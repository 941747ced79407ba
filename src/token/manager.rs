//! Token cache and state machine
//!
//! Maps audiences to cached identity tokens. The map shape is guarded by a
//! reader/writer lock held only for lookup/insert; each entry carries its own
//! async mutex serializing every state-mutating operation, including the
//! network-bound mint. That per-entry lock is the chokepoint guaranteeing
//! at-most-one in-flight mint per audience while callers of other audiences
//! proceed independently.

use std::{collections::HashMap, fmt, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    Result,
    token::source::{SourceFactory, TokenSource},
};

/// Lifecycle state of a cached token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenState {
    /// Token not yet created
    New,
    /// Token cached and valid
    Cached,
    /// Token was refreshed
    Refreshed,
    /// Token expiring soon
    Expiring,
    /// Token expired
    Expired,
    /// Token rejected by upstream
    Rejected,
    /// Error getting token
    Error,
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Cached => "CACHED",
            Self::Refreshed => "REFRESHED",
            Self::Expiring => "EXPIRING",
            Self::Expired => "EXPIRED",
            Self::Rejected => "REJECTED",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Observable fields of a cache entry; snapshots are point-in-time copies
#[derive(Debug, Clone, PartialEq)]
pub struct TokenMetadata {
    /// Audience the token is scoped to
    pub audience: String,
    /// Current lifecycle state
    pub state: TokenState,
    /// The bearer string (empty until the first successful mint)
    pub token: String,
    /// Entry creation time
    pub issued_at: DateTime<Utc>,
    /// Expiry reported by the provider
    pub expires_at: DateTime<Utc>,
    /// Last time the token was handed to a request
    pub last_used: DateTime<Utc>,
    /// Successful mints for this audience
    pub refresh_count: u64,
    /// Upstream 401/403 rejections observed
    pub rejected_count: u64,
    /// Failed mint attempts
    pub error_count: u64,
    /// Last failure message (empty on success)
    pub last_error: String,
}

impl TokenMetadata {
    fn new(audience: &str) -> Self {
        let now = Utc::now();
        Self {
            audience: audience.to_string(),
            state: TokenState::New,
            token: String::new(),
            issued_at: now,
            expires_at: now,
            last_used: now,
            refresh_count: 0,
            rejected_count: 0,
            error_count: 0,
            last_error: String::new(),
        }
    }
}

/// Aggregate counters across all cache entries
#[derive(Debug, Clone, Default)]
pub struct TokenStats {
    /// Audiences with a cache entry
    pub tokens_cached: usize,
    /// Total successful mints
    pub tokens_refreshed: u64,
    /// Total upstream rejections
    pub tokens_rejected: u64,
    /// Total mint failures
    pub tokens_errors: u64,
    /// Creation time of the oldest entry
    pub oldest_token: Option<DateTime<Utc>>,
    /// Creation time of the newest entry
    pub newest_token: Option<DateTime<Utc>>,
}

/// One audience's cached token plus its source handle
struct TokenEntry {
    inner: Mutex<EntryInner>,
}

struct EntryInner {
    metadata: TokenMetadata,
    source: Option<Arc<dyn TokenSource>>,
}

impl TokenEntry {
    fn new(audience: &str) -> Self {
        Self {
            inner: Mutex::new(EntryInner {
                metadata: TokenMetadata::new(audience),
                source: None,
            }),
        }
    }
}

/// Handles token creation, caching, refresh, and invalidation
pub struct TokenManager {
    cache: RwLock<HashMap<String, Arc<TokenEntry>>>,
    factory: Arc<dyn SourceFactory>,
    refresh_skew: Duration,
}

impl TokenManager {
    /// Create a manager minting through `factory`, refreshing tokens
    /// `refresh_before_minutes` before their expiry.
    pub fn new(factory: Arc<dyn SourceFactory>, refresh_before_minutes: u64) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            factory,
            refresh_skew: Duration::minutes(refresh_before_minutes as i64),
        }
    }

    /// Return a currently-valid bearer string for `audience`, minting or
    /// refreshing as needed.
    ///
    /// The freshness check and mint run on a detached task: a mint, once
    /// begun, completes and populates the cache even when the requesting
    /// client goes away mid-flight.
    pub async fn get_token(&self, audience: &str) -> Result<String> {
        let entry = self.entry(audience);
        let factory = self.factory.clone();
        let refresh_skew = self.refresh_skew;
        let audience = audience.to_string();

        let task = tokio::spawn(async move {
            let mut inner = entry.inner.lock().await;

            if should_refresh(&mut inner, refresh_skew) {
                if let Err(err) = mint(&mut inner, factory.as_ref(), &audience).await {
                    inner.metadata.state = TokenState::Error;
                    inner.metadata.error_count += 1;
                    inner.metadata.last_error = err.to_string();
                    error!(
                        audience = %audience,
                        error = %err,
                        error_count = inner.metadata.error_count,
                        "Failed to get/refresh token"
                    );
                    return Err(err);
                }
            }

            inner.metadata.last_used = Utc::now();

            debug!(
                audience = %audience,
                state = %inner.metadata.state,
                refresh_count = inner.metadata.refresh_count,
                "Token retrieved"
            );

            Ok(inner.metadata.token.clone())
        });

        task.await
            .map_err(|e| crate::Error::Internal(format!("token task failed: {e}")))?
    }

    /// Signal that the most recently issued token for `audience` was rejected
    /// by the upstream. Clears the source handle so the next mint rebuilds it
    /// from the credential.
    pub async fn mark_rejected(&self, audience: &str) {
        let entry = { self.cache.read().get(audience).cloned() };
        let Some(entry) = entry else {
            return;
        };

        let mut inner = entry.inner.lock().await;
        inner.metadata.state = TokenState::Rejected;
        inner.metadata.rejected_count += 1;
        inner.source = None;

        warn!(
            audience = %audience,
            rejected_count = inner.metadata.rejected_count,
            "Token rejected by upstream"
        );
    }

    /// Point-in-time copy of one entry's observable fields
    pub async fn metadata(&self, audience: &str) -> Option<TokenMetadata> {
        let entry = { self.cache.read().get(audience).cloned() }?;
        let inner = entry.inner.lock().await;
        Some(inner.metadata.clone())
    }

    /// Point-in-time copies for every cached audience
    pub async fn all_metadata(&self) -> HashMap<String, TokenMetadata> {
        let entries: Vec<(String, Arc<TokenEntry>)> = {
            let cache = self.cache.read();
            cache.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut result = HashMap::with_capacity(entries.len());
        for (audience, entry) in entries {
            let inner = entry.inner.lock().await;
            result.insert(audience, inner.metadata.clone());
        }
        result
    }

    /// Aggregate counters across all entries
    pub async fn stats(&self) -> TokenStats {
        let mut stats = TokenStats::default();

        for meta in self.all_metadata().await.values() {
            stats.tokens_cached += 1;
            stats.tokens_refreshed += meta.refresh_count;
            stats.tokens_rejected += meta.rejected_count;
            stats.tokens_errors += meta.error_count;

            stats.oldest_token = Some(match stats.oldest_token {
                Some(oldest) if oldest <= meta.issued_at => oldest,
                _ => meta.issued_at,
            });
            stats.newest_token = Some(match stats.newest_token {
                Some(newest) if newest >= meta.issued_at => newest,
                _ => meta.issued_at,
            });
        }

        stats
    }

    /// Locate or lazily create the entry for `audience`.
    ///
    /// The cache lock is held for the map operation only, never across an
    /// await; entries are never removed once inserted.
    fn entry(&self, audience: &str) -> Arc<TokenEntry> {
        if let Some(entry) = self.cache.read().get(audience) {
            return entry.clone();
        }

        let mut cache = self.cache.write();
        cache
            .entry(audience.to_string())
            .or_insert_with(|| Arc::new(TokenEntry::new(audience)))
            .clone()
    }
}

/// Freshness predicate, evaluated under the entry lock
fn should_refresh(inner: &mut EntryInner, refresh_skew: Duration) -> bool {
    if inner.metadata.state == TokenState::New {
        return true;
    }

    if inner.source.is_none() {
        return true;
    }

    let now = Utc::now();
    let meta = &mut inner.metadata;

    if now >= meta.expires_at {
        meta.state = TokenState::Expired;
        return true;
    }

    if now + refresh_skew >= meta.expires_at {
        if meta.state != TokenState::Expiring {
            info!(
                audience = %meta.audience,
                expires_at = %meta.expires_at.to_rfc3339(),
                "Token expiring soon, will refresh"
            );
            meta.state = TokenState::Expiring;
        }
        return true;
    }

    false
}

/// Mint a fresh token, holding the entry lock across the provider call.
async fn mint(
    inner: &mut EntryInner,
    factory: &dyn SourceFactory,
    audience: &str,
) -> Result<()> {
    let started = std::time::Instant::now();
    let prior_state = inner.metadata.state;

    info!(
        audience = %audience,
        state = %prior_state,
        refresh_count = inner.metadata.refresh_count,
        "Refreshing token"
    );

    let source = match &inner.source {
        Some(source) => source.clone(),
        None => {
            let source = factory.new_source(audience)?;
            inner.source = Some(source.clone());
            source
        }
    };

    let minted = source.fetch().await?;

    let meta = &mut inner.metadata;
    meta.token = minted.jwt;
    meta.expires_at = minted.expires_at;
    meta.refresh_count += 1;
    meta.last_error.clear();
    meta.state = if prior_state == TokenState::New {
        TokenState::Cached
    } else {
        TokenState::Refreshed
    };

    info!(
        audience = %audience,
        state = %meta.state,
        expires_at = %meta.expires_at.to_rfc3339(),
        refresh_count = meta.refresh_count,
        duration_ms = started.elapsed().as_millis() as u64,
        "Token minted"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::{Error, token::source::IdentityToken};

    /// Shared observation point for the scripted factory below
    struct FakeState {
        fetches: AtomicU64,
        sources: AtomicU64,
        ttl_secs: AtomicI64,
        fail_next_fetch: AtomicBool,
    }

    impl FakeState {
        fn new(ttl_secs: i64) -> Arc<Self> {
            Arc::new(Self {
                fetches: AtomicU64::new(0),
                sources: AtomicU64::new(0),
                ttl_secs: AtomicI64::new(ttl_secs),
                fail_next_fetch: AtomicBool::new(false),
            })
        }
    }

    struct FakeFactory(Arc<FakeState>);

    impl SourceFactory for FakeFactory {
        fn new_source(&self, audience: &str) -> Result<Arc<dyn TokenSource>> {
            self.0.sources.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeSource {
                audience: audience.to_string(),
                state: self.0.clone(),
            }))
        }
    }

    struct FakeSource {
        audience: String,
        state: Arc<FakeState>,
    }

    #[async_trait]
    impl TokenSource for FakeSource {
        async fn fetch(&self) -> Result<IdentityToken> {
            if self.state.fail_next_fetch.swap(false, Ordering::SeqCst) {
                return Err(Error::Mint("scripted failure".to_string()));
            }

            let n = self.state.fetches.fetch_add(1, Ordering::SeqCst) + 1;
            let ttl = Duration::seconds(self.state.ttl_secs.load(Ordering::SeqCst));
            Ok(IdentityToken {
                jwt: format!("{}-T{n}", self.audience),
                expires_at: Utc::now() + ttl,
            })
        }
    }

    fn manager_with_ttl(ttl_secs: i64) -> (TokenManager, Arc<FakeState>) {
        let state = FakeState::new(ttl_secs);
        let manager = TokenManager::new(Arc::new(FakeFactory(state.clone())), 5);
        (manager, state)
    }

    #[tokio::test]
    async fn cold_start_mints_and_caches() {
        let (manager, state) = manager_with_ttl(3600);

        let token = manager.get_token("aud1").await.unwrap();
        assert_eq!(token, "aud1-T1");

        let meta = manager.metadata("aud1").await.unwrap();
        assert_eq!(meta.state, TokenState::Cached);
        assert_eq!(meta.refresh_count, 1);
        assert!(!meta.token.is_empty());
        assert!(meta.expires_at > meta.issued_at);
        assert_eq!(state.sources.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hot_path_reuses_cached_token() {
        let (manager, state) = manager_with_ttl(3600);

        let first = manager.get_token("aud1").await.unwrap();
        let before = manager.metadata("aud1").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        for _ in 0..5 {
            assert_eq!(manager.get_token("aud1").await.unwrap(), first);
        }

        let after = manager.metadata("aud1").await.unwrap();
        assert_eq!(state.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(after.refresh_count, 1);
        assert!(after.last_used > before.last_used);
    }

    #[tokio::test]
    async fn near_expiry_token_is_refreshed() {
        // Expiry within the 5-minute skew forces a refresh on next use.
        let (manager, state) = manager_with_ttl(120);

        assert_eq!(manager.get_token("aud1").await.unwrap(), "aud1-T1");
        assert_eq!(manager.get_token("aud1").await.unwrap(), "aud1-T2");

        let meta = manager.metadata("aud1").await.unwrap();
        assert_eq!(meta.state, TokenState::Refreshed);
        assert_eq!(meta.refresh_count, 2);
        assert_eq!(state.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expiry_exactly_at_skew_boundary_triggers_refresh() {
        let (manager, state) = manager_with_ttl(300);

        manager.get_token("aud1").await.unwrap();
        manager.get_token("aud1").await.unwrap();

        assert_eq!(state.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_token_is_recorded_then_reminted() {
        // A provider returning an already-expired token is still recorded;
        // the predicate catches it on the very next call.
        let (manager, _) = manager_with_ttl(-10);

        manager.get_token("aud1").await.unwrap();
        let meta = manager.metadata("aud1").await.unwrap();
        assert_eq!(meta.state, TokenState::Cached);
        assert_eq!(meta.refresh_count, 1);

        manager.get_token("aud1").await.unwrap();
        let meta = manager.metadata("aud1").await.unwrap();
        assert_eq!(meta.state, TokenState::Refreshed);
        assert_eq!(meta.refresh_count, 2);
    }

    #[tokio::test]
    async fn rejection_clears_source_and_forces_remint() {
        let (manager, state) = manager_with_ttl(3600);

        manager.get_token("aud1").await.unwrap();
        manager.mark_rejected("aud1").await;

        let meta = manager.metadata("aud1").await.unwrap();
        assert_eq!(meta.state, TokenState::Rejected);
        assert_eq!(meta.rejected_count, 1);
        assert_eq!(state.sources.load(Ordering::SeqCst), 1);

        let token = manager.get_token("aud1").await.unwrap();
        assert_eq!(token, "aud1-T2");

        let meta = manager.metadata("aud1").await.unwrap();
        assert_eq!(meta.state, TokenState::Refreshed);
        assert_eq!(meta.refresh_count, 2);
        // The source handle was reinstantiated from the factory.
        assert_eq!(state.sources.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn mark_rejected_for_unknown_audience_is_a_noop() {
        let (manager, _) = manager_with_ttl(3600);
        manager.mark_rejected("never-seen").await;
        assert!(manager.metadata("never-seen").await.is_none());
        assert_eq!(manager.stats().await.tokens_cached, 0);
    }

    #[tokio::test]
    async fn mint_failure_sets_error_state_and_propagates() {
        let (manager, state) = manager_with_ttl(3600);
        state.fail_next_fetch.store(true, Ordering::SeqCst);

        let err = manager.get_token("aud1").await.unwrap_err();
        assert!(matches!(err, Error::Mint(_)));

        let meta = manager.metadata("aud1").await.unwrap();
        assert_eq!(meta.state, TokenState::Error);
        assert_eq!(meta.error_count, 1);
        assert!(meta.last_error.contains("scripted failure"));
        assert!(meta.token.is_empty());

        // The next request retries implicitly and clears the error message.
        manager.get_token("aud1").await.unwrap();
        let meta = manager.metadata("aud1").await.unwrap();
        assert_eq!(meta.state, TokenState::Refreshed);
        assert!(meta.last_error.is_empty());
        assert_eq!(meta.refresh_count, 1);
    }

    #[tokio::test]
    async fn metadata_snapshots_without_mutation_compare_equal() {
        let (manager, _) = manager_with_ttl(3600);
        manager.get_token("aud1").await.unwrap();

        let a = manager.metadata("aud1").await.unwrap();
        let b = manager.metadata("aud1").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_callers_mint_once_per_audience() {
        let (manager, state) = manager_with_ttl(3600);
        let manager = Arc::new(manager);

        let mut handles = Vec::new();
        for i in 0..100 {
            let manager = manager.clone();
            let audience = if i % 2 == 0 { "audA" } else { "audB" };
            handles.push(tokio::spawn(async move {
                let token = manager.get_token(audience).await.unwrap();
                assert!(token.starts_with(audience));
                token
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // One mint per audience; every caller saw its own audience's token.
        assert_eq!(state.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(
            manager.metadata("audA").await.unwrap().refresh_count,
            1
        );
        assert_eq!(
            manager.metadata("audB").await.unwrap().refresh_count,
            1
        );
    }

    #[tokio::test]
    async fn stats_aggregate_across_audiences() {
        let (manager, state) = manager_with_ttl(3600);

        manager.get_token("aud1").await.unwrap();
        manager.get_token("aud2").await.unwrap();
        manager.mark_rejected("aud1").await;
        state.fail_next_fetch.store(true, Ordering::SeqCst);
        let _ = manager.get_token("aud1").await;

        let stats = manager.stats().await;
        assert_eq!(stats.tokens_cached, 2);
        assert_eq!(stats.tokens_refreshed, 2);
        assert_eq!(stats.tokens_rejected, 1);
        assert_eq!(stats.tokens_errors, 1);
        assert!(stats.oldest_token.is_some());
        assert!(stats.newest_token.is_some());
        assert!(stats.oldest_token <= stats.newest_token);
    }

    #[tokio::test]
    async fn empty_cache_stats_have_no_token_ages() {
        let (manager, _) = manager_with_ttl(3600);
        let stats = manager.stats().await;
        assert_eq!(stats.tokens_cached, 0);
        assert!(stats.oldest_token.is_none());
        assert!(stats.newest_token.is_none());
    }

    #[test]
    fn state_serializes_in_screaming_case() {
        assert_eq!(
            serde_json::to_string(&TokenState::Cached).unwrap(),
            "\"CACHED\""
        );
        assert_eq!(
            serde_json::to_string(&TokenState::Rejected).unwrap(),
            "\"REJECTED\""
        );
        assert_eq!(TokenState::Expiring.to_string(), "EXPIRING");
    }
}
