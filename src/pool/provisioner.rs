//! Provisioning abstraction
//!
//! The pool manager never creates, resets or destroys resources itself; it
//! drives an implementation of [`Provisioner`].

use crate::error::StrataResult;
use crate::pool::resource::{Health, PooledResource};
use async_trait::async_trait;

/// Creates, resets and destroys pooled resources
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create a resource for `category` and return its handle
    async fn create(&self, category: &str) -> StrataResult<String>;

    /// Clear all state a previous user left behind. An `Ok` must mean the
    /// reset was verified.
    async fn reset(&self, resource: &PooledResource) -> StrataResult<()>;

    /// Tear the resource down; destroying a missing resource succeeds
    async fn destroy(&self, resource: &PooledResource) -> StrataResult<()>;

    async fn health_check(&self, resource: &PooledResource) -> Health;

    /// Human-readable provisioner name for display
    fn name(&self) -> &'static str;
}
