//! Storage backends behind cache tiers
//!
//! A backend only moves bytes; capacity accounting and LRU bookkeeping live
//! in [`crate::cache::Tier`]. Each call is a single attempt with a definite
//! outcome. Retrying transient failures is the backend's own business.

use crate::error::{StrataError, StrataResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::time::Instant;
use tracing::debug;

/// Byte store addressed by textual cache key
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read the bytes stored under `key`
    async fn read(&self, key: &str) -> StrataResult<Option<Vec<u8>>>;

    /// Store `bytes` under `key`, replacing any previous value
    async fn write(&self, key: &str, bytes: &[u8]) -> StrataResult<()>;

    /// Remove `key`; removing an absent key succeeds
    async fn delete(&self, key: &str) -> StrataResult<()>;

    /// Whether stored bytes outlive the process
    fn is_persistent(&self) -> bool {
        false
    }

    /// Remember when `key` expires, `None` meaning never. Stores that do not
    /// outlive the process leave expiry to the tier index.
    async fn set_expiry(&self, _key: &str, _expires_at: Option<DateTime<Utc>>) -> StrataResult<()> {
        Ok(())
    }

    /// Expiry remembered for `key`
    async fn expiry(&self, _key: &str) -> StrataResult<Option<DateTime<Utc>>> {
        Ok(None)
    }

    /// Every stored key with its size, for seeding a tier index on startup
    async fn stored(&self) -> StrataResult<Vec<(String, u64)>> {
        Ok(Vec::new())
    }
}

/// Outcome of a remote claim attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimStatus {
    Granted,
    AlreadyClaimed,
}

/// Shared store reachable from several nodes
#[async_trait]
pub trait RemoteStore: BlobStore {
    /// Conditionally take the right to fill `key`, held until `lease` elapses
    async fn claim(&self, key: &str, lease: Duration) -> StrataResult<ClaimStatus>;

    /// Give up a claim early
    async fn release_claim(&self, key: &str) -> StrataResult<()>;
}

/// In-process byte store
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: DashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn read(&self, key: &str) -> StrataResult<Option<Vec<u8>>> {
        Ok(self.blobs.get(key).map(|bytes| bytes.value().clone()))
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> StrataResult<()> {
        self.blobs.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> StrataResult<()> {
        self.blobs.remove(key);
        Ok(())
    }
}

/// Expiry sidecar kept next to a payload file
#[derive(Debug, Serialize, Deserialize)]
struct ExpiryRecord {
    expires_at: DateTime<Utc>,
}

/// Node-local store keeping one file per key
///
/// `owner/alice/<hex>` lives at `<root>/owner/alice/<hex[..2]>/<hex>`, with
/// its expiry, if any, in `<hex>.expiry` beside it.
/// Writes go to a temporary file first and are renamed into place, so a
/// reader never observes a partial payload.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StrataResult<PathBuf> {
        let mut segments: Vec<&str> = key.split('/').collect();
        let digest = segments
            .pop()
            .filter(|d| d.len() > 2)
            .ok_or_else(|| StrataError::InvalidKey(key.to_string()))?;
        if segments
            .iter()
            .any(|s| s.is_empty() || *s == "." || *s == "..")
        {
            return Err(StrataError::InvalidKey(key.to_string()));
        }

        let mut path = self.root.clone();
        for segment in segments {
            path.push(segment);
        }
        path.push(&digest[..2]);
        path.push(digest);
        Ok(path)
    }

    fn expiry_path(&self, key: &str) -> StrataResult<PathBuf> {
        Ok(self.path_for(key)?.with_extension("expiry"))
    }

    /// Every stored key with its size in bytes
    pub async fn list(&self) -> StrataResult<Vec<(String, u64)>> {
        let mut found = Vec::new();
        if !self.root.exists() {
            return Ok(found);
        }

        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|e| StrataError::io(format!("reading {}", dir.display()), e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StrataError::io("reading tier directory entry", e))?
            {
                let path = entry.path();
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| StrataError::io(format!("stat {}", path.display()), e))?;
                if meta.is_dir() {
                    pending.push(path);
                    continue;
                }
                if let Some(key) = self.key_for(&path) {
                    found.push((key, meta.len()));
                }
            }
        }

        found.sort();
        Ok(found)
    }

    /// Inverse of `path_for`; temporary and sidecar files map to nothing
    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut segments: Vec<String> = relative
            .iter()
            .map(|s| s.to_string_lossy().into_owned())
            .collect();
        let digest = segments.pop()?;
        if digest.contains('.') {
            return None;
        }
        // Drop the shard directory
        segments.pop()?;
        segments.push(digest);
        Some(segments.join("/"))
    }
}

#[async_trait]
impl BlobStore for DiskStore {
    async fn read(&self, key: &str) -> StrataResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StrataError::io(format!("reading {}", path.display()), e)),
        }
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> StrataResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StrataError::io(format!("creating {}", parent.display()), e))?;
        }

        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, bytes)
            .await
            .map_err(|e| StrataError::io(format!("writing {}", tmp.display()), e))?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(StrataError::io(format!("renaming into {}", path.display()), e));
        }

        debug!("Wrote {} bytes to {}", bytes.len(), path.display());
        Ok(())
    }

    async fn delete(&self, key: &str) -> StrataResult<()> {
        remove_if_present(&self.path_for(key)?).await?;
        remove_if_present(&self.expiry_path(key)?).await
    }

    fn is_persistent(&self) -> bool {
        true
    }

    async fn set_expiry(&self, key: &str, expires_at: Option<DateTime<Utc>>) -> StrataResult<()> {
        let path = self.expiry_path(key)?;
        let Some(expires_at) = expires_at else {
            return remove_if_present(&path).await;
        };

        let record = serde_json::to_vec(&ExpiryRecord { expires_at })?;
        fs::write(&path, record)
            .await
            .map_err(|e| StrataError::io(format!("writing {}", path.display()), e))
    }

    async fn expiry(&self, key: &str) -> StrataResult<Option<DateTime<Utc>>> {
        let path = self.expiry_path(key)?;
        match fs::read(&path).await {
            Ok(bytes) => {
                let record: ExpiryRecord = serde_json::from_slice(&bytes)?;
                Ok(Some(record.expires_at))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StrataError::io(format!("reading {}", path.display()), e)),
        }
    }

    async fn stored(&self) -> StrataResult<Vec<(String, u64)>> {
        self.list().await
    }
}

async fn remove_if_present(path: &Path) -> StrataResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StrataError::io(format!("deleting {}", path.display()), e)),
    }
}

/// Remote store kept in process memory
///
/// Stands in for a shared store on single-node deployments. Claims are
/// conditional inserts with a lease, as a real shared store would offer.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    blobs: MemoryStore,
    expiries: DashMap<String, DateTime<Utc>>,
    claims: DashMap<String, Instant>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryRemote {
    async fn read(&self, key: &str) -> StrataResult<Option<Vec<u8>>> {
        self.blobs.read(key).await
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> StrataResult<()> {
        self.blobs.write(key, bytes).await
    }

    async fn delete(&self, key: &str) -> StrataResult<()> {
        self.expiries.remove(key);
        self.blobs.delete(key).await
    }

    fn is_persistent(&self) -> bool {
        true
    }

    async fn set_expiry(&self, key: &str, expires_at: Option<DateTime<Utc>>) -> StrataResult<()> {
        match expires_at {
            Some(at) => {
                self.expiries.insert(key.to_string(), at);
            }
            None => {
                self.expiries.remove(key);
            }
        }
        Ok(())
    }

    async fn expiry(&self, key: &str) -> StrataResult<Option<DateTime<Utc>>> {
        Ok(self.expiries.get(key).map(|at| *at.value()))
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn claim(&self, key: &str, lease: Duration) -> StrataResult<ClaimStatus> {
        let now = Instant::now();
        let granted = match self.claims.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if *held.get() <= now {
                    held.insert(now + lease);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now + lease);
                true
            }
        };

        Ok(if granted {
            ClaimStatus::Granted
        } else {
            ClaimStatus::AlreadyClaimed
        })
    }

    async fn release_claim(&self, key: &str) -> StrataResult<()> {
        self.claims.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KEY: &str = "owner/alice/0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.read(KEY).await.unwrap().is_none());

        store.write(KEY, b"payload").await.unwrap();
        assert_eq!(store.read(KEY).await.unwrap().unwrap(), b"payload");

        store.delete(KEY).await.unwrap();
        assert!(store.read(KEY).await.unwrap().is_none());
        assert!(!store.is_persistent());
    }

    #[tokio::test]
    async fn disk_store_shards_by_digest() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::new(dir.path());

        store.write(KEY, b"payload").await.unwrap();

        let expected = dir
            .path()
            .join("owner/alice/01")
            .join(KEY.rsplit('/').next().unwrap());
        assert!(expected.is_file());
        assert_eq!(store.read(KEY).await.unwrap().unwrap(), b"payload");
    }

    #[tokio::test]
    async fn disk_store_survives_reopen_and_lists() {
        let dir = TempDir::new().unwrap();
        DiskStore::new(dir.path()).write(KEY, b"abc").await.unwrap();

        let reopened = DiskStore::new(dir.path());
        assert_eq!(reopened.read(KEY).await.unwrap().unwrap(), b"abc");
        assert_eq!(reopened.list().await.unwrap(), vec![(KEY.to_string(), 3)]);

        reopened.delete(KEY).await.unwrap();
        reopened.delete(KEY).await.unwrap();
        assert!(reopened.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disk_store_keeps_expiry_beside_payload() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::new(dir.path());
        let at = Utc::now() + chrono::Duration::hours(1);

        store.write(KEY, b"abc").await.unwrap();
        store.set_expiry(KEY, Some(at)).await.unwrap();

        let reopened = DiskStore::new(dir.path());
        assert_eq!(reopened.expiry(KEY).await.unwrap(), Some(at));
        // The sidecar is not listed as an entry of its own
        assert_eq!(reopened.stored().await.unwrap(), vec![(KEY.to_string(), 3)]);

        reopened.set_expiry(KEY, None).await.unwrap();
        assert_eq!(reopened.expiry(KEY).await.unwrap(), None);

        reopened.set_expiry(KEY, Some(at)).await.unwrap();
        reopened.delete(KEY).await.unwrap();
        assert_eq!(reopened.expiry(KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn disk_store_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::new(dir.path());
        assert!(store.write("owner/../../etc/passwd-digest", b"x").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_claim_is_exclusive_until_lease_expires() {
        let remote = MemoryRemote::new();
        let lease = Duration::from_secs(5);

        assert_eq!(remote.claim(KEY, lease).await.unwrap(), ClaimStatus::Granted);
        assert_eq!(
            remote.claim(KEY, lease).await.unwrap(),
            ClaimStatus::AlreadyClaimed
        );

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(remote.claim(KEY, lease).await.unwrap(), ClaimStatus::Granted);

        remote.release_claim(KEY).await.unwrap();
        assert_eq!(remote.claim(KEY, lease).await.unwrap(), ClaimStatus::Granted);
    }
}
