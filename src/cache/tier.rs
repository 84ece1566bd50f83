//! A single cache tier: a backend plus an LRU index
//!
//! The index maps each key to its own async mutex. A read holds that mutex
//! across the backend read and the access-metadata update, so an eviction of
//! the same entry waits for the read to finish. Reads of different entries
//! never contend. Writes are admitted one at a time per tier so that the
//! capacity check and the evictions it triggers see a consistent total.
//!
//! Victim selection scans the index; entries whose mutex is held count as
//! just used.
//!
//! A tier over a persistent backend is seeded from what the backend already
//! holds by [`Tier::load`], and records each entry's expiry in the backend so
//! a later process honors it. Capacity is accounted per process; two
//! processes writing one directory at the same time can each fill it.

use crate::cache::backend::BlobStore;
use crate::cache::key::CacheKey;
use crate::error::{StrataError, StrataResult};
use crate::events::{Event, NullSink, SharedSink};
use crate::scope::Scope;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Metadata of one stored entry
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub size: u64,
    pub scope: Scope,
    pub created_at: DateTime<Utc>,
    pub last_access: Instant,
    pub access_count: u64,
    pub expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(key: String, size: u64, scope: Scope, ttl: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            key,
            size,
            scope,
            created_at: Utc::now(),
            last_access: now,
            access_count: 0,
            expires_at: ttl.map(|ttl| now + ttl),
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn expiring_at(mut self, expires_at: Option<Instant>) -> Self {
        self.expires_at = expires_at;
        self
    }

    fn touch(&mut self) {
        self.last_access = Instant::now();
        self.access_count += 1;
    }
}

/// Payload read from a tier together with its remaining lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierRead {
    pub payload: Vec<u8>,
    pub expires_in: Option<Duration>,
}

struct Slot {
    entry: CacheEntry,
    /// Set once the entry has left the tier; waiters treat it as a miss
    removed: bool,
}

type SlotRef = Arc<Mutex<Slot>>;

/// Expiry of an entry found in a persistent backend
enum Persisted {
    Live(Option<Instant>),
    Expired,
}

/// Wall-clock form of a TTL, as kept by persistent backends
fn wall_clock_expiry(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl?).ok()?;
    Utc::now().checked_add_signed(ttl)
}

/// One layer of a tiered cache
pub struct Tier {
    name: String,
    capacity: u64,
    shared: bool,
    backend: Arc<dyn BlobStore>,
    index: DashMap<String, SlotRef>,
    used: AtomicU64,
    admission: Mutex<()>,
    sink: SharedSink,
}

impl Tier {
    /// Create a node-local tier holding entries of any scope
    pub fn new(name: impl Into<String>, capacity: u64, backend: Arc<dyn BlobStore>) -> Self {
        Self {
            name: name.into(),
            capacity,
            shared: false,
            backend,
            index: DashMap::new(),
            used: AtomicU64::new(0),
            admission: Mutex::new(()),
            sink: Arc::new(NullSink),
        }
    }

    /// Mark the tier as shared between owners; it then refuses owner entries
    pub fn shared(mut self) -> Self {
        self.shared = true;
        self
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    /// Index every entry a persistent backend already holds
    ///
    /// Expired entries are deleted on the way. If the stored total is over
    /// capacity, entries are evicted until it fits.
    pub async fn load(self) -> StrataResult<Self> {
        if !self.backend.is_persistent() {
            return Ok(self);
        }

        let stored = self.backend.stored().await?;
        {
            let _admission = self.admission.lock().await;
            for (id, size) in stored {
                let key = match CacheKey::parse(&id) {
                    Ok(key) => key,
                    Err(_) => {
                        warn!("Ignoring unrecognised entry {} in tier {}", id, self.name);
                        continue;
                    }
                };
                let Persisted::Live(expires_at) = self.persisted_expiry(&id).await? else {
                    continue;
                };
                let entry = CacheEntry::new(id, size, key.namespace().scope(), None)
                    .expiring_at(expires_at);
                self.insert_slot(entry);
            }
            self.make_room(0, 0, "").await?;
        }

        debug!(
            "Loaded {} entries ({} bytes) into tier {}",
            self.len(),
            self.used_bytes(),
            self.name
        );
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Bytes currently accounted to this tier
    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.index.contains_key(&key.to_string())
    }

    /// Whether entries of `scope` may be stored here
    pub fn permits(&self, scope: Scope) -> bool {
        !self.shared || scope.is_shared()
    }

    fn slot(&self, id: &str) -> Option<SlotRef> {
        self.index.get(id).map(|slot| Arc::clone(slot.value()))
    }

    /// Read an entry, updating its access metadata
    pub async fn get(&self, key: &CacheKey) -> StrataResult<Option<Vec<u8>>> {
        Ok(self.read(key).await?.map(|read| read.payload))
    }

    /// Like [`Tier::get`], also reporting how long the entry has left
    pub async fn read(&self, key: &CacheKey) -> StrataResult<Option<TierRead>> {
        let id = key.to_string();

        loop {
            if let Some(slot) = self.slot(&id) {
                return self.read_slot(key, &id, slot).await;
            }

            if !self.backend.is_persistent() {
                return Ok(None);
            }

            // Stored by an earlier process; adopt it into the index
            let _admission = self.admission.lock().await;
            if self.index.contains_key(&id) {
                continue;
            }
            let Some(bytes) = self.backend.read(&id).await? else {
                return Ok(None);
            };
            let Persisted::Live(expires_at) = self.persisted_expiry(&id).await? else {
                return Ok(None);
            };
            let size = bytes.len() as u64;
            if size <= self.capacity {
                self.make_room(size, 0, &id).await?;
                let mut entry = CacheEntry::new(id.clone(), size, key.namespace().scope(), None)
                    .expiring_at(expires_at);
                entry.touch();
                self.insert_slot(entry);
                debug!("Adopted {} into tier {}", id, self.name);
            }
            return Ok(Some(TierRead {
                payload: bytes,
                expires_in: expires_at.map(|at| at.saturating_duration_since(Instant::now())),
            }));
        }
    }

    /// Expiry the backend recorded for `id`. An expired entry is deleted.
    async fn persisted_expiry(&self, id: &str) -> StrataResult<Persisted> {
        let Some(at) = self.backend.expiry(id).await? else {
            return Ok(Persisted::Live(None));
        };

        match (at - Utc::now()).to_std() {
            Ok(left) if !left.is_zero() => Ok(Persisted::Live(Some(Instant::now() + left))),
            _ => {
                debug!("Stored entry {} in tier {} has expired", id, self.name);
                self.backend.delete(id).await?;
                Ok(Persisted::Expired)
            }
        }
    }

    fn insert_slot(&self, entry: CacheEntry) {
        let size = entry.size;
        self.index.insert(
            entry.key.clone(),
            Arc::new(Mutex::new(Slot {
                entry,
                removed: false,
            })),
        );
        self.used.fetch_add(size, Ordering::SeqCst);
    }

    async fn read_slot(
        &self,
        key: &CacheKey,
        id: &str,
        slot: SlotRef,
    ) -> StrataResult<Option<TierRead>> {
        let mut guard = slot.lock().await;
        if guard.removed {
            return Ok(None);
        }

        let now = Instant::now();
        if guard.entry.is_expired(now) {
            debug!("Entry {} expired in tier {}", id, self.name);
            drop(guard);
            self.remove(key).await?;
            return Ok(None);
        }

        match self.backend.read(id).await? {
            Some(bytes) => {
                guard.entry.touch();
                Ok(Some(TierRead {
                    payload: bytes,
                    expires_in: guard.entry.expires_at.map(|at| at.saturating_duration_since(now)),
                }))
            }
            None => {
                if self.shared {
                    debug!("Entry {} was removed from shared tier {} by another node", id, self.name);
                } else {
                    warn!("Tier {} lost payload for {}", self.name, id);
                }
                self.retire(id, &slot, &mut guard);
                Ok(None)
            }
        }
    }

    /// Store an entry, evicting least-recently-used entries to make room
    ///
    /// An entry larger than the whole tier is refused and evicts nothing.
    pub async fn put(
        &self,
        key: &CacheKey,
        bytes: &[u8],
        ttl: Option<Duration>,
    ) -> StrataResult<()> {
        let size = bytes.len() as u64;
        if size > self.capacity {
            return Err(StrataError::CapacityExceeded {
                tier: self.name.clone(),
                size,
                capacity: self.capacity,
            });
        }

        let id = key.to_string();
        let _admission = self.admission.lock().await;

        match self.slot(&id) {
            Some(slot) => {
                let mut guard = slot.lock().await;
                let replacing = if guard.removed { 0 } else { guard.entry.size };
                self.make_room(size, replacing, &id).await?;
                self.backend.write(&id, bytes).await?;
                self.backend.set_expiry(&id, wall_clock_expiry(ttl)).await?;
                if guard.removed {
                    guard.removed = false;
                    guard.entry = CacheEntry::new(id.clone(), size, key.namespace().scope(), ttl);
                    self.index.insert(id.clone(), Arc::clone(&slot));
                    self.used.fetch_add(size, Ordering::SeqCst);
                } else {
                    self.used.fetch_sub(guard.entry.size, Ordering::SeqCst);
                    self.used.fetch_add(size, Ordering::SeqCst);
                    guard.entry.size = size;
                    guard.entry.expires_at = ttl.map(|ttl| Instant::now() + ttl);
                    guard.entry.last_access = Instant::now();
                }
            }
            None => {
                self.make_room(size, 0, &id).await?;
                self.backend.write(&id, bytes).await?;
                self.backend.set_expiry(&id, wall_clock_expiry(ttl)).await?;
                self.insert_slot(CacheEntry::new(id, size, key.namespace().scope(), ttl));
            }
        }

        Ok(())
    }

    /// Evict until `incoming` bytes fit once `replacing` bytes are released.
    /// Caller holds the admission lock.
    async fn make_room(&self, incoming: u64, replacing: u64, exclude: &str) -> StrataResult<()> {
        while self.used_bytes().saturating_sub(replacing) + incoming > self.capacity {
            let Some((victim_id, victim)) = self.lru_victim(exclude) else {
                return Err(StrataError::CapacityExceeded {
                    tier: self.name.clone(),
                    size: incoming,
                    capacity: self.capacity,
                });
            };

            let mut guard = victim.lock().await;
            if guard.removed {
                continue;
            }
            let size = guard.entry.size;
            self.backend.delete(&victim_id).await?;
            self.retire(&victim_id, &victim, &mut guard);

            debug!("Evicted {} ({} bytes) from tier {}", victim_id, size, self.name);
            self.sink.record(Event::Evicted {
                tier: self.name.clone(),
                key: victim_id,
                size,
            });
        }
        Ok(())
    }

    fn lru_victim(&self, exclude: &str) -> Option<(String, SlotRef)> {
        let now = Instant::now();
        self.index
            .iter()
            .filter(|item| item.key() != exclude)
            .map(|item| {
                let last_access = item
                    .value()
                    .try_lock()
                    .map(|slot| slot.entry.last_access)
                    .unwrap_or(now);
                (last_access, item.key().clone(), Arc::clone(item.value()))
            })
            .min_by_key(|(last_access, _, _)| *last_access)
            .map(|(_, id, slot)| (id, slot))
    }

    /// Drop an entry from the index and the byte count. The caller holds the
    /// entry's lock, so exactly one party retires it.
    fn retire(&self, id: &str, slot: &SlotRef, guard: &mut Slot) {
        if guard.removed {
            return;
        }
        guard.removed = true;
        self.index.remove_if(id, |_, current| Arc::ptr_eq(current, slot));
        self.used.fetch_sub(guard.entry.size, Ordering::SeqCst);
    }

    /// Remove an entry from the index and the backend
    pub async fn remove(&self, key: &CacheKey) -> StrataResult<bool> {
        let id = key.to_string();
        let Some(slot) = self.slot(&id) else {
            self.backend.delete(&id).await?;
            return Ok(false);
        };

        let mut guard = slot.lock().await;
        if guard.removed {
            return Ok(false);
        }
        self.backend.delete(&id).await?;
        self.retire(&id, &slot, &mut guard);
        Ok(true)
    }

    /// Remove every expired entry, returning how many were removed
    pub async fn purge_expired(&self) -> StrataResult<usize> {
        let now = Instant::now();
        let slots: Vec<(String, SlotRef)> = self
            .index
            .iter()
            .map(|item| (item.key().clone(), Arc::clone(item.value())))
            .collect();

        let mut purged = 0;
        for (id, slot) in slots {
            let mut guard = slot.lock().await;
            if !guard.removed && guard.entry.is_expired(now) {
                self.backend.delete(&id).await?;
                self.retire(&id, &slot, &mut guard);
                purged += 1;
            }
        }
        Ok(purged)
    }

    /// Snapshot of every indexed entry
    pub async fn entries(&self) -> Vec<CacheEntry> {
        let slots: Vec<SlotRef> = self
            .index
            .iter()
            .map(|item| Arc::clone(item.value()))
            .collect();

        let mut entries = Vec::with_capacity(slots.len());
        for slot in slots {
            let guard = slot.lock().await;
            if !guard.removed {
                entries.push(guard.entry.clone());
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }
}
