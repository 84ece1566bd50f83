//! Tiered cache: ordered tiers, promotion, scope checks and origin fetches

use crate::cache::backend::{ClaimStatus, DiskStore, MemoryRemote, MemoryStore, RemoteStore};
use crate::cache::claim::{Claim, ClaimTable, FetchFailure};
use crate::cache::key::CacheKey;
use crate::cache::tier::{CacheEntry, Tier};
use crate::config::Config;
use crate::error::{StrataError, StrataResult};
use crate::events::{Event, NullSink, SharedSink};
use crate::scope::{authorize_read, authorize_write, Caller, Classification, Content, ScopeClassifier};
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const MB: u64 = 1024 * 1024;

/// Authoritative source consulted on a miss in every tier
#[async_trait]
pub trait Origin: Send + Sync {
    /// Fetch the content behind `identity`. Fails with
    /// [`StrataError::OriginNotFound`] or [`StrataError::OriginTransient`].
    async fn fetch(&self, identity: &str) -> StrataResult<Content>;
}

/// Result of a lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Hit {
        payload: Vec<u8>,
        tier: String,
        /// Position of the tier, 0 being the fastest
        level: usize,
    },
    Miss,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit { .. })
    }
}

/// A tier that did not take a write
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierSkip {
    pub tier: String,
    pub reason: String,
}

/// What a put achieved in each tier
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PutOutcome {
    pub written: Vec<String>,
    pub skipped: Vec<TierSkip>,
}

impl PutOutcome {
    /// Some permitted tier failed to take the entry
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }

    pub fn is_stored(&self) -> bool {
        !self.written.is_empty()
    }
}

/// Counters for one tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub name: String,
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub used_bytes: u64,
    pub capacity: u64,
}

/// Snapshot of cache counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub tiers: Vec<TierStats>,
    pub origin_fetches: u64,
    pub coalesced_waits: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

struct RemoteLink {
    level: usize,
    store: Arc<dyn RemoteStore>,
}

enum RemoteClaim {
    Held,
    Filled(Vec<u8>),
    Unavailable,
}

/// Builder for [`TieredCache`]
pub struct TieredCacheBuilder {
    tiers: Vec<Tier>,
    remote: Option<RemoteLink>,
    classifier: ScopeClassifier,
    claim_timeout: Duration,
    remote_lease: Duration,
    remote_poll: Duration,
    default_ttl: Option<Duration>,
    sink: SharedSink,
}

impl TieredCacheBuilder {
    /// Append a tier; tiers are probed in the order they are added
    pub fn tier(mut self, tier: Tier) -> Self {
        self.tiers.push(tier);
        self
    }

    /// Append a shared remote tier
    ///
    /// `capacity` is this node's budget in the shared store. Each node
    /// accounts only for the entries it wrote or read through; an entry
    /// another node evicted reads as a miss.
    pub fn remote_tier<R: RemoteStore + 'static>(
        mut self,
        name: impl Into<String>,
        capacity: u64,
        store: Arc<R>,
    ) -> Self {
        self.remote = Some(RemoteLink {
            level: self.tiers.len(),
            store: store.clone(),
        });
        self.tiers.push(Tier::new(name, capacity, store).shared());
        self
    }

    pub fn claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    pub fn remote_lease(mut self, lease: Duration) -> Self {
        self.remote_lease = lease;
        self
    }

    pub fn remote_poll(mut self, poll: Duration) -> Self {
        self.remote_poll = poll;
        self
    }

    pub fn default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn build(self) -> TieredCache {
        let sink = self.sink;
        let tiers: Vec<Tier> = self
            .tiers
            .into_iter()
            .map(|tier| tier.with_sink(Arc::clone(&sink)))
            .collect();
        let counters = tiers.iter().map(|_| Counters::default()).collect();

        TieredCache {
            tiers,
            counters,
            remote: self.remote,
            classifier: self.classifier,
            claims: ClaimTable::new(self.claim_timeout),
            claim_timeout: self.claim_timeout,
            remote_lease: self.remote_lease,
            remote_poll: self.remote_poll,
            default_ttl: self.default_ttl,
            sink,
            origin_fetches: AtomicU64::new(0),
            coalesced_waits: AtomicU64::new(0),
        }
    }
}

/// Ordered set of tiers, fastest first
pub struct TieredCache {
    tiers: Vec<Tier>,
    counters: Vec<Counters>,
    remote: Option<RemoteLink>,
    classifier: ScopeClassifier,
    claims: ClaimTable,
    claim_timeout: Duration,
    remote_lease: Duration,
    remote_poll: Duration,
    default_ttl: Option<Duration>,
    sink: SharedSink,
    origin_fetches: AtomicU64,
    coalesced_waits: AtomicU64,
}

impl TieredCache {
    pub fn builder(classifier: ScopeClassifier) -> TieredCacheBuilder {
        TieredCacheBuilder {
            tiers: Vec::new(),
            remote: None,
            classifier,
            claim_timeout: Duration::from_secs(30),
            remote_lease: Duration::from_secs(120),
            remote_poll: Duration::from_millis(250),
            default_ttl: None,
            sink: Arc::new(NullSink),
        }
    }

    /// Memory and disk tiers, plus an in-process remote tier when configured
    ///
    /// The disk tier is loaded from what earlier processes left in `tier_dir`.
    pub async fn from_config(
        config: &Config,
        tier_dir: PathBuf,
        sink: SharedSink,
    ) -> StrataResult<Self> {
        let classifier = ScopeClassifier::from_config(&config.scope)?;
        let cache = &config.cache;

        let disk = Tier::new(
            "disk",
            cache.disk_capacity_mb * MB,
            Arc::new(DiskStore::new(tier_dir)),
        )
        .with_sink(Arc::clone(&sink))
        .load()
        .await?;

        let mut builder = Self::builder(classifier)
            .tier(Tier::new(
                "memory",
                cache.memory_capacity_mb * MB,
                Arc::new(MemoryStore::new()),
            ))
            .tier(disk)
            .claim_timeout(cache.claim_timeout())
            .remote_lease(cache.remote_lease())
            .remote_poll(cache.remote_poll())
            .default_ttl(cache.default_ttl())
            .sink(sink);

        if cache.remote_capacity_mb > 0 {
            builder = builder.remote_tier(
                "remote",
                cache.remote_capacity_mb * MB,
                Arc::new(MemoryRemote::new()),
            );
        }

        Ok(builder.build())
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub fn classifier(&self) -> &ScopeClassifier {
        &self.classifier
    }

    /// Look `key` up in every tier the caller may read, fastest first
    pub async fn get(&self, caller: &Caller, key: &CacheKey) -> StrataResult<Lookup> {
        authorize_read(caller, key.namespace())?;
        Ok(self.lookup(key).await)
    }

    async fn lookup(&self, key: &CacheKey) -> Lookup {
        let scope = key.namespace().scope();
        let id = key.to_string();

        for (level, tier) in self.tiers.iter().enumerate() {
            if !tier.permits(scope) {
                continue;
            }

            match tier.read(key).await {
                Ok(Some(read)) => {
                    self.counters[level].hits.fetch_add(1, Ordering::Relaxed);
                    self.sink.record(Event::TierHit {
                        tier: tier.name().to_string(),
                        level,
                        key: id.clone(),
                    });
                    self.promote(key, &read.payload, read.expires_in, level).await;
                    return Lookup::Hit {
                        payload: read.payload,
                        tier: tier.name().to_string(),
                        level,
                    };
                }
                Ok(None) => {}
                Err(e) => warn!("Tier {} failed reading {}: {}", tier.name(), id, e),
            }

            self.counters[level].misses.fetch_add(1, Ordering::Relaxed);
            self.sink.record(Event::TierMiss {
                tier: tier.name().to_string(),
                level,
                key: id.clone(),
            });
        }

        Lookup::Miss
    }

    /// Copy a hit into the faster tiers that may hold it. Best effort.
    async fn promote(&self, key: &CacheKey, payload: &[u8], ttl: Option<Duration>, from: usize) {
        let scope = key.namespace().scope();
        for (to, tier) in self.tiers[..from].iter().enumerate() {
            if !tier.permits(scope) {
                continue;
            }
            match tier.put(key, payload, ttl).await {
                Ok(()) => self.sink.record(Event::Promoted {
                    key: key.to_string(),
                    from_level: from,
                    to_level: to,
                }),
                Err(e) => debug!("Promotion of {} into {} skipped: {}", key, tier.name(), e),
            }
        }
    }

    /// Classify `content` and store it under `key` in every permitted tier
    ///
    /// Refused outright when the caller may not write the namespace or the
    /// content is too private for it. Per-tier failures are reported in the
    /// outcome.
    pub async fn put(
        &self,
        caller: &Caller,
        key: &CacheKey,
        content: &Content,
    ) -> StrataResult<PutOutcome> {
        authorize_write(caller, key.namespace())?;
        self.admit(key, content)?;
        Ok(self
            .store(key, &content.payload, content.ttl.or(self.default_ttl))
            .await)
    }

    fn admit(&self, key: &CacheKey, content: &Content) -> StrataResult<Classification> {
        let classification = self.classifier.classify(content);
        debug!(
            "Classified {} as {} ({})",
            content.name, classification.scope, classification.reason
        );
        self.sink.record(Event::ScopeDecision {
            name: content.name.clone(),
            scope: classification.scope,
            reason: classification.reason.to_string(),
        });

        if let Err(e) =
            self.classifier
                .check_placement(&content.name, &classification, key.namespace())
        {
            warn!("Refused {} for {}: {}", content.name, key, e);
            return Err(e);
        }
        Ok(classification)
    }

    async fn store(&self, key: &CacheKey, bytes: &[u8], ttl: Option<Duration>) -> PutOutcome {
        let scope = key.namespace().scope();
        let mut outcome = PutOutcome::default();

        for tier in self.tiers.iter().filter(|tier| tier.permits(scope)) {
            match tier.put(key, bytes, ttl).await {
                Ok(()) => outcome.written.push(tier.name().to_string()),
                Err(e) => {
                    warn!("Tier {} did not take {}: {}", tier.name(), key, e);
                    // An older payload left behind would be served in place of this one
                    if let Err(stale) = tier.remove(key).await {
                        warn!("Tier {} kept a stale copy of {}: {}", tier.name(), key, stale);
                    }
                    outcome.skipped.push(TierSkip {
                        tier: tier.name().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        outcome
    }

    /// Remove `key` from every tier, returning how many tiers held it
    pub async fn invalidate(&self, caller: &Caller, key: &CacheKey) -> StrataResult<usize> {
        authorize_write(caller, key.namespace())?;

        let mut removed = 0;
        let mut failure = None;
        for tier in &self.tiers {
            match tier.remove(key).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Tier {} failed removing {}: {}", tier.name(), key, e);
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    /// Remove expired entries from every tier
    pub async fn purge_expired(&self) -> StrataResult<usize> {
        let mut purged = 0;
        for tier in &self.tiers {
            purged += tier.purge_expired().await?;
        }
        Ok(purged)
    }

    /// Indexed entries per tier
    pub async fn entries(&self) -> Vec<(String, Vec<CacheEntry>)> {
        let mut listing = Vec::with_capacity(self.tiers.len());
        for tier in &self.tiers {
            listing.push((tier.name().to_string(), tier.entries().await));
        }
        listing
    }

    /// Return the payload for `key`, fetching it from `origin` on a miss
    ///
    /// Concurrent callers for the same key share a single origin fetch.
    pub async fn get_or_fetch(
        &self,
        caller: &Caller,
        key: &CacheKey,
        origin: &dyn Origin,
    ) -> StrataResult<Vec<u8>> {
        if let Lookup::Hit { payload, .. } = self.get(caller, key).await? {
            return Ok(payload);
        }

        let id = key.to_string();
        let mut retried = false;
        loop {
            match self.claims.claim(&id) {
                Claim::Leader(guard) => {
                    return match self.resolve_claim(key, origin).await {
                        Ok(payload) => {
                            let payload = Arc::new(payload);
                            guard.resolve(Ok(Arc::clone(&payload)));
                            Ok(Arc::unwrap_or_clone(payload))
                        }
                        Err(e) => {
                            guard.resolve(Err(FetchFailure::from_error(&e)));
                            Err(e)
                        }
                    };
                }
                Claim::Follower(waiter) => {
                    self.coalesced_waits.fetch_add(1, Ordering::Relaxed);
                    let outcome = waiter.wait(self.claim_timeout).await;
                    match outcome {
                        Ok(Ok(payload)) => return Ok(payload.as_ref().clone()),
                        Ok(Err(FetchFailure::Abandoned)) | Err(StrataError::ClaimTimeout { .. })
                            if !retried =>
                        {
                            debug!("Claim on {} did not resolve, claiming again", id);
                            retried = true;
                        }
                        Ok(Err(failure)) => return Err(failure.to_error(key)),
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    async fn resolve_claim(&self, key: &CacheKey, origin: &dyn Origin) -> StrataResult<Vec<u8>> {
        // The previous claimant may have filled the key since our miss
        if let Lookup::Hit { payload, .. } = self.lookup(key).await {
            return Ok(payload);
        }

        let remote = self
            .remote
            .as_ref()
            .filter(|remote| self.tiers[remote.level].permits(key.namespace().scope()));

        let holds_remote = match remote {
            Some(remote) => match self.claim_remote(key, remote).await? {
                RemoteClaim::Filled(payload) => return Ok(payload),
                RemoteClaim::Held => true,
                RemoteClaim::Unavailable => false,
            },
            None => false,
        };

        let result = self.fetch_origin(key, origin).await;

        if let (true, Some(remote)) = (holds_remote, remote) {
            if let Err(e) = remote.store.release_claim(&key.to_string()).await {
                warn!("Failed to release remote claim on {}: {}", key, e);
            }
        }
        result
    }

    /// Take the cross-node claim, or wait for the node holding it to fill the key
    async fn claim_remote(&self, key: &CacheKey, remote: &RemoteLink) -> StrataResult<RemoteClaim> {
        let id = key.to_string();
        let deadline = Instant::now() + self.remote_lease + self.remote_poll;

        loop {
            match remote.store.claim(&id, self.remote_lease).await {
                Ok(ClaimStatus::Granted) => return Ok(RemoteClaim::Held),
                Ok(ClaimStatus::AlreadyClaimed) => {
                    debug!("Another node is filling {}", id);
                }
                Err(e) => {
                    warn!("Remote claim on {} failed, fetching locally: {}", id, e);
                    return Ok(RemoteClaim::Unavailable);
                }
            }

            tokio::time::sleep(self.remote_poll).await;
            if let Lookup::Hit { payload, .. } = self.lookup(key).await {
                return Ok(RemoteClaim::Filled(payload));
            }
            if Instant::now() >= deadline {
                return Err(StrataError::ClaimTimeout {
                    key: id,
                    waited: self.remote_lease,
                });
            }
        }
    }

    async fn fetch_origin(&self, key: &CacheKey, origin: &dyn Origin) -> StrataResult<Vec<u8>> {
        let fetched = origin.fetch(key.identity()).await;
        self.origin_fetches.fetch_add(1, Ordering::Relaxed);
        self.sink.record(Event::OriginFetch {
            identity: key.identity().to_string(),
            ok: fetched.is_ok(),
        });

        let content = fetched?;
        info!("Fetched {} from origin ({} bytes)", key.identity(), content.payload.len());

        // Origin content is placed by the system, so only its classification gates it
        self.admit(key, &content)?;
        let outcome = self
            .store(key, &content.payload, content.ttl.or(self.default_ttl))
            .await;
        if !outcome.is_stored() {
            warn!("Fetched {} but no tier kept it", key.identity());
        }
        Ok(content.payload)
    }

    pub fn stats(&self) -> CacheStats {
        let tiers = self
            .tiers
            .iter()
            .zip(&self.counters)
            .map(|(tier, counters)| TierStats {
                name: tier.name().to_string(),
                hits: counters.hits.load(Ordering::Relaxed),
                misses: counters.misses.load(Ordering::Relaxed),
                entries: tier.len(),
                used_bytes: tier.used_bytes(),
                capacity: tier.capacity(),
            })
            .collect();

        CacheStats {
            tiers,
            origin_fetches: self.origin_fetches.load(Ordering::Relaxed),
            coalesced_waits: self.coalesced_waits.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::BlobStore;
    use crate::error::NOT_AVAILABLE;
    use crate::events::RecordingSink;
    use crate::scope::{Namespace, DEFAULT_SENSITIVE_PATTERNS};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn classifier() -> ScopeClassifier {
        ScopeClassifier::new(DEFAULT_SENSITIVE_PATTERNS).unwrap()
    }

    fn alice() -> Caller {
        Caller::new("alice")
    }

    /// Origin that counts fetches and answers slowly
    struct Registry {
        fetches: AtomicUsize,
        delay: Duration,
    }

    impl Registry {
        fn new(delay: Duration) -> Self {
            Self {
                fetches: AtomicUsize::new(0),
                delay,
            }
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Origin for Registry {
        async fn fetch(&self, identity: &str) -> StrataResult<Content> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if identity.starts_with("missing/") {
                return Err(StrataError::OriginNotFound {
                    identity: identity.to_string(),
                });
            }
            Ok(Content::distributable(
                identity,
                format!("tarball of {}", identity),
            ))
        }
    }

    /// Backend whose writes always fail
    struct BrokenStore;

    #[async_trait]
    impl BlobStore for BrokenStore {
        async fn read(&self, _key: &str) -> StrataResult<Option<Vec<u8>>> {
            Ok(None)
        }

        async fn write(&self, _key: &str, _bytes: &[u8]) -> StrataResult<()> {
            Err(StrataError::backend("broken", "disk full"))
        }

        async fn delete(&self, _key: &str) -> StrataResult<()> {
            Ok(())
        }
    }

    /// Backend that takes one write and fails every later one
    #[derive(Default)]
    struct WornStore {
        inner: MemoryStore,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl BlobStore for WornStore {
        async fn read(&self, key: &str) -> StrataResult<Option<Vec<u8>>> {
            self.inner.read(key).await
        }

        async fn write(&self, key: &str, bytes: &[u8]) -> StrataResult<()> {
            if self.writes.fetch_add(1, Ordering::SeqCst) > 0 {
                return Err(StrataError::backend("worn", "read-only"));
            }
            self.inner.write(key, bytes).await
        }

        async fn delete(&self, key: &str) -> StrataResult<()> {
            self.inner.delete(key).await
        }
    }

    fn node(remote: Arc<MemoryRemote>) -> TieredCache {
        TieredCache::builder(classifier())
            .tier(Tier::new("memory", 1024, Arc::new(MemoryStore::new())))
            .remote_tier("remote", 4096, remote)
            .remote_poll(Duration::from_millis(10))
            .build()
    }

    #[tokio::test]
    async fn hit_in_slower_tier_promotes_to_faster() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::new());
        let cache = TieredCache::builder(classifier())
            .tier(Tier::new("memory", 1024, Arc::new(MemoryStore::new())))
            .tier(Tier::new("disk", 4096, Arc::new(DiskStore::new(dir.path()))))
            .sink(sink.clone())
            .build();
        let key = CacheKey::global("pkg/left-pad/1.3.0");

        cache
            .put(&alice(), &key, &Content::distributable("left-pad", "module.exports"))
            .await
            .unwrap();
        cache.tiers()[0].remove(&key).await.unwrap();

        let first = cache.get(&alice(), &key).await.unwrap();
        assert!(matches!(first, Lookup::Hit { level: 1, .. }));
        assert!(cache.tiers()[0].contains(&key));

        let second = cache.get(&alice(), &key).await.unwrap();
        assert!(matches!(second, Lookup::Hit { level: 0, .. }));
        assert_eq!(
            sink.count(|e| matches!(e, Event::Promoted { from_level: 1, to_level: 0, .. })),
            1
        );

        let stats = cache.stats();
        assert_eq!(stats.tiers[0].hits, 1);
        assert_eq!(stats.tiers[0].misses, 1);
        assert_eq!(stats.tiers[1].hits, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_fetch_once() {
        let cache = Arc::new(
            TieredCache::builder(classifier())
                .tier(Tier::new("memory", 1 << 20, Arc::new(MemoryStore::new())))
                .build(),
        );
        let origin = Arc::new(Registry::new(Duration::from_millis(200)));
        let key = CacheKey::global("pkg/lodash/4.17.21");

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = Arc::clone(&cache);
            let origin = Arc::clone(&origin);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(&Caller::new("ci"), &key, origin.as_ref())
                    .await
            }));
        }

        for handle in handles {
            let payload = handle.await.unwrap().unwrap();
            assert_eq!(payload, b"tarball of pkg/lodash/4.17.21");
        }
        assert_eq!(origin.fetches(), 1);
        assert_eq!(cache.stats().origin_fetches, 1);
    }

    #[tokio::test]
    async fn sensitive_content_never_reaches_global_tier() {
        let cache = TieredCache::builder(classifier())
            .tier(Tier::new("memory", 1024, Arc::new(MemoryStore::new())))
            .remote_tier("remote", 1024, Arc::new(MemoryRemote::new()))
            .build();
        let key = CacheKey::global("project/.env");

        let result = cache
            .put(&alice(), &key, &Content::private(".env", "API_KEY=abc"))
            .await;

        assert!(matches!(result, Err(StrataError::SensitiveContent { .. })));
        for tier in cache.tiers() {
            assert!(!tier.contains(&key));
        }

        let owned = CacheKey::new(Namespace::owner("alice").unwrap(), "project/.env");
        let outcome = cache
            .put(&alice(), &owned, &Content::private(".env", "API_KEY=abc"))
            .await
            .unwrap();
        assert_eq!(outcome.written, vec!["memory".to_string()]);
        assert!(!cache.tiers()[1].contains(&owned));
    }

    #[tokio::test]
    async fn other_owners_cannot_read() {
        let cache = node(Arc::new(MemoryRemote::new()));
        let key = CacheKey::new(Namespace::owner("alice").unwrap(), "build/app");
        cache
            .put(&alice(), &key, &Content::private("app", "binary"))
            .await
            .unwrap();

        let err = cache.get(&Caller::new("mallory"), &key).await.unwrap_err();
        assert!(matches!(err, StrataError::Unauthorized { .. }));
        assert_eq!(err.public_message(), NOT_AVAILABLE);

        let err = cache
            .put(&Caller::new("mallory"), &key, &Content::private("app", "evil"))
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn failing_tier_yields_partial_put() {
        let cache = TieredCache::builder(classifier())
            .tier(Tier::new("memory", 1024, Arc::new(MemoryStore::new())))
            .tier(Tier::new("broken", 1024, Arc::new(BrokenStore)))
            .build();
        let key = CacheKey::global("pkg/react/18.2.0");

        let outcome = cache
            .put(&alice(), &key, &Content::distributable("react", "tarball"))
            .await
            .unwrap();

        assert!(outcome.is_partial());
        assert!(outcome.is_stored());
        assert_eq!(outcome.written, vec!["memory".to_string()]);
        assert_eq!(outcome.skipped[0].tier, "broken");
        assert!(cache.get(&alice(), &key).await.unwrap().is_hit());
    }

    #[tokio::test]
    async fn oversized_entry_skips_small_tier_only() {
        let cache = TieredCache::builder(classifier())
            .tier(Tier::new("memory", 4, Arc::new(MemoryStore::new())))
            .tier(Tier::new("large", 1024, Arc::new(MemoryStore::new())))
            .build();
        let key = CacheKey::global("pkg/big/1.0.0");

        let outcome = cache
            .put(&alice(), &key, &Content::distributable("big", vec![0u8; 64]))
            .await
            .unwrap();

        assert_eq!(outcome.written, vec!["large".to_string()]);
        assert_eq!(outcome.skipped.len(), 1);
        assert!(outcome.skipped[0].reason.contains("capacity"));
    }

    #[tokio::test]
    async fn refused_put_drops_older_copy() {
        let cache = TieredCache::builder(classifier())
            .tier(Tier::new("memory", 4, Arc::new(MemoryStore::new())))
            .tier(Tier::new("large", 1024, Arc::new(MemoryStore::new())))
            .build();
        let key = CacheKey::global("pkg/big/1.0.0");
        cache
            .put(&alice(), &key, &Content::distributable("big", "old"))
            .await
            .unwrap();
        assert!(cache.tiers()[0].contains(&key));

        let outcome = cache
            .put(&alice(), &key, &Content::distributable("big", vec![7u8; 64]))
            .await
            .unwrap();

        assert_eq!(outcome.written, vec!["large".to_string()]);
        assert!(!cache.tiers()[0].contains(&key));
        let Lookup::Hit { payload, level, .. } = cache.get(&alice(), &key).await.unwrap() else {
            panic!("expected a hit");
        };
        assert_eq!(level, 1);
        assert_eq!(payload, vec![7u8; 64]);
    }

    #[tokio::test]
    async fn failed_write_drops_older_copy() {
        let cache = TieredCache::builder(classifier())
            .tier(Tier::new("worn", 1024, Arc::new(WornStore::default())))
            .tier(Tier::new("memory", 1024, Arc::new(MemoryStore::new())))
            .build();
        let key = CacheKey::global("pkg/react/18.2.0");
        cache
            .put(&alice(), &key, &Content::distributable("react", "v1"))
            .await
            .unwrap();

        let outcome = cache
            .put(&alice(), &key, &Content::distributable("react", "v2"))
            .await
            .unwrap();

        assert_eq!(outcome.skipped[0].tier, "worn");
        assert!(!cache.tiers()[0].contains(&key));
        let Lookup::Hit { payload, level, .. } = cache.get(&alice(), &key).await.unwrap() else {
            panic!("expected a hit");
        };
        assert_eq!(level, 1);
        assert_eq!(payload, b"v2");
    }

    #[tokio::test]
    async fn global_put_is_served_to_another_caller() {
        let cache = node(Arc::new(MemoryRemote::new()));
        let origin = Registry::new(Duration::ZERO);
        let key = CacheKey::global("pkg/react/18.2.0");
        cache
            .put(
                &alice(),
                &key,
                &Content::distributable("react-18.2.0.tgz", "react tarball"),
            )
            .await
            .unwrap();

        let bob = Caller::new("bob");
        let Lookup::Hit { payload, .. } = cache.get(&bob, &key).await.unwrap() else {
            panic!("expected a hit");
        };
        assert_eq!(payload, b"react tarball");
        let fetched = cache.get_or_fetch(&bob, &key, &origin).await.unwrap();
        assert_eq!(fetched, b"react tarball");
        assert_eq!(origin.fetches(), 0);
    }

    #[tokio::test]
    async fn second_node_gets_package_without_origin() {
        let remote = Arc::new(MemoryRemote::new());
        let first = node(Arc::clone(&remote));
        let second = node(Arc::clone(&remote));
        let origin = Registry::new(Duration::from_millis(1));
        let key = CacheKey::global("pkg/react/18.2.0");

        let payload = first.get_or_fetch(&alice(), &key, &origin).await.unwrap();
        assert_eq!(payload, b"tarball of pkg/react/18.2.0");
        assert_eq!(origin.fetches(), 1);

        let bob = Caller::new("bob");
        let payload = second.get_or_fetch(&bob, &key, &origin).await.unwrap();
        assert_eq!(payload, b"tarball of pkg/react/18.2.0");
        assert_eq!(origin.fetches(), 1);

        let again = second.get(&bob, &key).await.unwrap();
        assert!(matches!(again, Lookup::Hit { level: 0, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_node_holding_remote_claim() {
        let remote = Arc::new(MemoryRemote::new());
        let first = Arc::new(node(Arc::clone(&remote)));
        let second = node(Arc::clone(&remote));
        let origin = Registry::new(Duration::ZERO);
        let key = CacheKey::global("pkg/vue/3.4.0");

        // First node has claimed remotely and is still downloading
        remote
            .claim(&key.to_string(), Duration::from_secs(120))
            .await
            .unwrap();
        let filler = {
            let first = Arc::clone(&first);
            let key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                first
                    .put(&alice(), &key, &Content::distributable("vue", "vue tarball"))
                    .await
                    .unwrap();
            })
        };

        let payload = second.get_or_fetch(&alice(), &key, &origin).await.unwrap();

        assert_eq!(payload, b"vue tarball");
        assert_eq!(origin.fetches(), 0);
        filler.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn followers_see_remote_claim_timeout() {
        let remote = Arc::new(MemoryRemote::new());
        let key = CacheKey::global("pkg/stuck/1.0.0");
        // Another node holds the claim and never fills the key
        remote
            .claim(&key.to_string(), Duration::from_secs(600))
            .await
            .unwrap();
        let cache = Arc::new(
            TieredCache::builder(classifier())
                .tier(Tier::new("memory", 1024, Arc::new(MemoryStore::new())))
                .remote_tier("remote", 4096, remote)
                .remote_lease(Duration::from_secs(1))
                .remote_poll(Duration::from_millis(100))
                .build(),
        );
        let origin = Arc::new(Registry::new(Duration::ZERO));

        let attempts: Vec<_> = (0..2)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let origin = Arc::clone(&origin);
                let key = key.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_fetch(&alice(), &key, origin.as_ref())
                        .await
                })
            })
            .collect();

        for attempt in attempts {
            let err = attempt.await.unwrap().unwrap_err();
            assert!(matches!(err, StrataError::ClaimTimeout { .. }), "{}", err);
            assert!(err.is_retryable());
        }
        assert_eq!(cache.stats().coalesced_waits, 1);
        assert_eq!(origin.fetches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_budget_is_per_node() {
        let remote = Arc::new(MemoryRemote::new());
        let budgeted = |remote: Arc<MemoryRemote>| {
            TieredCache::builder(classifier())
                .remote_tier("remote", 16, remote)
                .build()
        };
        let first = budgeted(Arc::clone(&remote));
        let second = budgeted(Arc::clone(&remote));
        let bob = Caller::new("bob");
        let pkg = |name: &str| CacheKey::global(format!("pkg/{}/1.0.0", name));
        let tarball = |name: &str| Content::distributable(name, vec![0u8; 8]);

        first.put(&alice(), &pkg("a"), &tarball("a")).await.unwrap();
        second.put(&bob, &pkg("b"), &tarball("b")).await.unwrap();
        tokio::time::advance(Duration::from_millis(5)).await;
        assert!(second.get(&bob, &pkg("a")).await.unwrap().is_hit());

        // Each node counts only what it wrote or read through
        assert_eq!(first.tiers()[0].used_bytes(), 8);
        assert_eq!(second.tiers()[0].used_bytes(), 16);

        tokio::time::advance(Duration::from_millis(5)).await;
        first.put(&alice(), &pkg("c"), &tarball("c")).await.unwrap();
        tokio::time::advance(Duration::from_millis(5)).await;
        first.put(&alice(), &pkg("d"), &tarball("d")).await.unwrap();
        assert!(remote.read(&pkg("a").to_string()).await.unwrap().is_none());

        // The second node still indexes the evicted entry; it reads as a miss
        assert!(second.tiers()[0].contains(&pkg("a")));
        assert!(!second.get(&bob, &pkg("a")).await.unwrap().is_hit());
        assert!(!second.tiers()[0].contains(&pkg("a")));
        assert_eq!(second.tiers()[0].used_bytes(), 8);
        assert!(second.get(&bob, &pkg("b")).await.unwrap().is_hit());
    }

    #[tokio::test]
    async fn from_config_reloads_disk_tier() {
        let dir = TempDir::new().unwrap();
        let config = Config::default();
        let key = CacheKey::new(Namespace::owner("alice").unwrap(), "build/app");

        let cache = TieredCache::from_config(&config, dir.path().to_path_buf(), Arc::new(NullSink))
            .await
            .unwrap();
        cache
            .put(&alice(), &key, &Content::private("app", "binary"))
            .await
            .unwrap();
        drop(cache);

        let reopened = TieredCache::from_config(&config, dir.path().to_path_buf(), Arc::new(NullSink))
            .await
            .unwrap();
        assert!(reopened.tiers()[1].contains(&key));
        assert_eq!(reopened.tiers()[1].used_bytes(), 6);
    }

    #[tokio::test]
    async fn origin_failure_is_reported_and_not_cached() {
        let cache = node(Arc::new(MemoryRemote::new()));
        let origin = Registry::new(Duration::ZERO);
        let key = CacheKey::global("missing/pkg");

        let err = cache.get_or_fetch(&alice(), &key, &origin).await.unwrap_err();

        assert!(matches!(err, StrataError::OriginNotFound { .. }));
        assert!(!cache.get(&alice(), &key).await.unwrap().is_hit());
        // The remote claim was released, so the next attempt fetches again
        let _ = cache.get_or_fetch(&alice(), &key, &origin).await;
        assert_eq!(origin.fetches(), 2);
    }

    #[tokio::test]
    async fn invalidate_removes_from_every_tier() {
        let cache = node(Arc::new(MemoryRemote::new()));
        let key = CacheKey::global("pkg/react/18.2.0");
        cache
            .put(&alice(), &key, &Content::distributable("react", "tarball"))
            .await
            .unwrap();

        assert_eq!(cache.invalidate(&alice(), &key).await.unwrap(), 2);
        assert!(!cache.get(&alice(), &key).await.unwrap().is_hit());
    }

    #[tokio::test]
    async fn scope_decisions_are_recorded() {
        let sink = Arc::new(RecordingSink::new());
        let cache = TieredCache::builder(classifier())
            .tier(Tier::new("memory", 1024, Arc::new(MemoryStore::new())))
            .sink(sink.clone())
            .build();
        let key = CacheKey::global("certs/server.pem");

        let _ = cache
            .put(&alice(), &key, &Content::private("server.pem", "-----BEGIN"))
            .await;

        let events = sink.events();
        assert!(events.iter().any(|e| matches!(
            e,
            Event::ScopeDecision { scope: crate::scope::Scope::Owner, .. }
        )));
    }
}
