//! Configuration schema for Strata
//!
//! Configuration is stored at `~/.config/strata/config.toml`

use crate::error::{StrataError, StrataResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Tiered cache settings
    pub cache: CacheConfig,

    /// Cache key derivation settings
    pub key: KeyConfig,

    /// Scope classification settings
    pub scope: ScopeConfig,

    /// Warm pool settings
    pub pool: PoolsConfig,
}

impl Config {
    /// Check cross-field constraints that serde defaults cannot express
    pub fn validate(&self) -> StrataResult<()> {
        self.pool.default.validate("pool.default")?;
        for (name, pool) in &self.pool.categories {
            pool.validate(&format!("pool.categories.{}", name))?;
        }
        for pattern in &self.scope.sensitive_patterns {
            regex::Regex::new(pattern).map_err(|e| StrataError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
        }
        if self.cache.claim_timeout_ms == 0 {
            return Err(StrataError::ConfigValue {
                key: "cache.claim_timeout_ms".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Enable audit logging
    pub audit_log: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            audit_log: true,
        }
    }
}

/// Tiered cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// In-process tier capacity in MB
    pub memory_capacity_mb: u64,

    /// Node-local disk tier capacity in MB
    pub disk_capacity_mb: u64,

    /// Directory for the node-local disk tier
    pub disk_dir: Option<PathBuf>,

    /// Shared remote tier capacity in MB (0 = no remote tier)
    pub remote_capacity_mb: u64,

    /// How long a caller waits on another caller's claim
    pub claim_timeout_ms: u64,

    /// Lease on a remote claim before another node may take it over
    pub remote_lease_secs: u64,

    /// Poll interval while another node holds the remote claim
    pub remote_poll_ms: u64,

    /// Default entry TTL in seconds (0 = no expiry)
    pub default_ttl_secs: u64,
}

impl CacheConfig {
    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }

    pub fn remote_lease(&self) -> Duration {
        Duration::from_secs(self.remote_lease_secs)
    }

    pub fn remote_poll(&self) -> Duration {
        Duration::from_millis(self.remote_poll_ms.max(1))
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        (self.default_ttl_secs > 0).then(|| Duration::from_secs(self.default_ttl_secs))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity_mb: 256,
            disk_capacity_mb: 10 * 1024,
            disk_dir: None,
            remote_capacity_mb: 0,
            claim_timeout_ms: 30_000,
            remote_lease_secs: 120,
            remote_poll_ms: 250,
            default_ttl_secs: 0,
        }
    }
}

/// Cache key derivation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// Only environment variables with one of these prefixes feed the key
    pub env_allow_prefixes: Vec<String>,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            env_allow_prefixes: vec![
                "NODE_ENV".to_string(),
                "RUSTFLAGS".to_string(),
                "CARGO_BUILD_".to_string(),
                "PYTHON_VERSION".to_string(),
                "GOOS".to_string(),
                "GOARCH".to_string(),
            ],
        }
    }
}

/// Scope classification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    /// Case-insensitive regexes marking content as sensitive
    pub sensitive_patterns: Vec<String>,

    /// Scan text bodies of distributable content too
    pub scan_distributable_bodies: bool,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            sensitive_patterns: crate::scope::DEFAULT_SENSITIVE_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            scan_distributable_bodies: false,
        }
    }
}

/// Warm pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolsConfig {
    /// Seconds between maintenance passes
    pub maintenance_interval_secs: u64,

    /// Settings for categories without an explicit entry
    pub default: PoolConfig,

    /// Per-category overrides
    pub categories: BTreeMap<String, PoolConfig>,
}

impl PoolsConfig {
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }

    /// Settings for a category, falling back to the default
    pub fn for_category(&self, category: &str) -> PoolConfig {
        self.categories
            .get(category)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            maintenance_interval_secs: 10,
            default: PoolConfig::default(),
            categories: BTreeMap::new(),
        }
    }
}

/// Settings of a single pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Never scale below this many owned resources
    pub min_size: usize,

    /// Never own more than this many idle or in-flight resources
    pub max_size: usize,

    /// Size to warm up to
    pub target_size: usize,

    /// Idle resources older than this are destroyed
    pub ttl_secs: u64,

    /// Acquire that leaves fewer idle resources than this triggers replenishment
    pub replenish_below: usize,

    /// Resources added or removed per scaling action
    pub scale_step: usize,

    /// Utilization at or above which the pool grows
    pub high_utilization: f64,

    /// Utilization at or below which the pool shrinks
    pub low_utilization: f64,

    /// Minimum seconds between scaling actions
    pub cooldown_secs: u64,

    /// Sandbox image for the Podman provisioner
    pub image: String,
}

impl PoolConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    fn validate(&self, key: &str) -> StrataResult<()> {
        let invalid = |reason: &str| StrataError::ConfigValue {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        if self.max_size == 0 {
            return Err(invalid("max_size must be at least 1"));
        }
        if self.min_size > self.max_size {
            return Err(invalid("min_size exceeds max_size"));
        }
        if self.target_size < self.min_size || self.target_size > self.max_size {
            return Err(invalid("target_size must lie between min_size and max_size"));
        }
        if !(0.0..=1.0).contains(&self.high_utilization)
            || !(0.0..=1.0).contains(&self.low_utilization)
        {
            return Err(invalid("utilization thresholds must lie in 0..=1"));
        }
        if self.low_utilization >= self.high_utilization {
            return Err(invalid("low_utilization must be below high_utilization"));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 5,
            target_size: 2,
            ttl_secs: 30 * 60,
            replenish_below: 1,
            scale_step: 1,
            high_utilization: 0.8,
            low_utilization: 0.2,
            cooldown_secs: 60,
            image: "fedora:41".to_string(),
        }
    }
}
