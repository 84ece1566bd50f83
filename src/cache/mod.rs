//! Tiered content-addressed cache
//!
//! Entries are addressed by a [`CacheKey`]: a namespace plus the SHA-256 of
//! everything that determines the content. A [`TieredCache`] probes its
//! tiers fastest first and promotes hits into faster tiers.
//!
//! # Tiers
//!
//! | Tier | Backend | Shared | Holds |
//! |------|---------|--------|-------|
//! | memory | [`MemoryStore`] | no | any scope |
//! | disk | [`DiskStore`] | no | any scope, survives restarts |
//! | remote | [`RemoteStore`] | yes | global and group scope only |
//!
//! Misses on every tier go to an [`Origin`]; concurrent misses on one key
//! share a single fetch through the [`claim`] table.

pub mod backend;
pub mod claim;
pub mod key;
pub mod store;
pub mod tier;

pub use backend::{BlobStore, ClaimStatus, DiskStore, MemoryRemote, MemoryStore, RemoteStore};
pub use key::{detect_lockfiles, CacheKey, Ecosystem, KeyBuilder, LockfileInfo};
pub use store::{CacheStats, Lookup, Origin, PutOutcome, TierSkip, TieredCache, TieredCacheBuilder};
pub use tier::{CacheEntry, Tier, TierRead};
