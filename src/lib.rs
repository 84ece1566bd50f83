//! Strata - tiered content-addressed cache with warm sandbox pools
//!
//! Build and dependency payloads are keyed by a SHA-256 digest of their
//! inputs, stored across a memory, disk and shared remote tier, and placed
//! in a `global`, `group` or `owner` namespace by a scope classifier that
//! refuses to share anything sensitive. Sandboxes that run the builds are
//! kept warm in per-category pools.

pub mod audit;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod pool;
pub mod scope;
pub mod ui;

pub use error::{StrataError, StrataResult};
