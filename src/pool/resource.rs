//! Pooled resource records

use crate::error::{StrataError, StrataResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Lifecycle state of a pooled resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    Provisioning,
    Available,
    Acquired,
    Released,
    Expired,
    Destroyed,
}

impl ResourceState {
    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_become(self, next: ResourceState) -> bool {
        use ResourceState::*;
        matches!(
            (self, next),
            (Provisioning, Available)
                | (Provisioning, Destroyed)
                | (Available, Acquired)
                | (Available, Expired)
                | (Available, Destroyed)
                | (Acquired, Released)
                | (Acquired, Destroyed)
                | (Released, Available)
                | (Released, Destroyed)
                | (Expired, Destroyed)
        )
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Provisioning => "provisioning",
            Self::Available => "available",
            Self::Acquired => "acquired",
            Self::Released => "released",
            Self::Expired => "expired",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Result of a health check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Unhealthy(String),
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// A pre-provisioned resource such as a sandbox container
#[derive(Debug, Clone, Serialize)]
pub struct PooledResource {
    /// Handle returned by the provisioner
    pub id: String,

    /// Pool the resource belongs to
    pub category: String,

    pub created_at: DateTime<Utc>,

    /// When the resource was last reset for reuse
    pub last_reset: Option<DateTime<Utc>>,

    pub health: Health,

    state: ResourceState,

    #[serde(skip)]
    born: Instant,
}

impl PooledResource {
    pub fn new(id: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            category: category.into(),
            created_at: Utc::now(),
            last_reset: None,
            health: Health::Healthy,
            state: ResourceState::Provisioning,
            born: Instant::now(),
        }
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    /// Time since the resource was provisioned
    pub fn age(&self) -> Duration {
        self.born.elapsed()
    }

    /// Move to `next`, refusing transitions the lifecycle does not allow
    pub fn transition(&mut self, next: ResourceState) -> StrataResult<()> {
        if !self.state.can_become(next) {
            return Err(StrataError::Internal(format!(
                "resource {} cannot go from {} to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }
}
