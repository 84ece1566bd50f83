//! Error types for Strata
//!
//! All modules use `StrataResult<T>` as their return type. A cache miss is
//! not an error; it is reported as [`crate::cache::Lookup::Miss`].

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for Strata operations
pub type StrataResult<T> = Result<T, StrataError>;

/// Message shown at the public boundary for both misses and denied reads.
pub const NOT_AVAILABLE: &str = "Cache entry not available";

/// All errors that can occur in Strata
#[derive(Error, Debug)]
pub enum StrataError {
    // Cache errors
    #[error("Tier {tier} cannot hold {size} bytes (capacity {capacity})")]
    CapacityExceeded {
        tier: String,
        size: u64,
        capacity: u64,
    },

    #[error("Timed out after {waited:?} waiting for claim on {key}")]
    ClaimTimeout { key: String, waited: Duration },

    #[error("Claim on {key} was abandoned before it resolved")]
    ClaimAbandoned { key: String },

    #[error("Tier backend error in {tier}: {reason}")]
    Backend { tier: String, reason: String },

    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    // Origin errors
    #[error("Origin has no payload for {identity}")]
    OriginNotFound { identity: String },

    #[error("Origin fetch failed for {identity}: {reason}")]
    OriginTransient { identity: String, reason: String },

    // Scope errors
    #[error("Caller {caller} may not access {namespace}")]
    Unauthorized { caller: String, namespace: String },

    #[error("Refusing to store sensitive content {name} in shared namespace {namespace}")]
    SensitiveContent { name: String, namespace: String },

    #[error("Content {name} is classified {scope} and cannot be stored in {namespace}")]
    ScopeViolation {
        name: String,
        scope: String,
        namespace: String,
    },

    #[error("Invalid sensitive pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    // Pool errors
    #[error("Failed to provision {category} resource: {reason}")]
    Provisioning { category: String, reason: String },

    #[error("Reset of resource {id} could not be verified: {reason}")]
    ResetVerification { id: String, reason: String },

    #[error("Unknown pool: {0}")]
    UnknownPool(String),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Invalid configuration value {key}: {reason}")]
    ConfigValue { key: String, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a tier backend error
    pub fn backend(tier: impl Into<String>, reason: impl ToString) -> Self {
        Self::Backend {
            tier: tier.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ClaimTimeout { .. }
                | Self::ClaimAbandoned { .. }
                | Self::OriginTransient { .. }
                | Self::Backend { .. }
                | Self::Provisioning { .. }
        )
    }

    /// Whether this error must look like a miss to an outside caller.
    ///
    /// Denied reads are folded into "not available" so that the existence of
    /// another owner's entry cannot be probed.
    pub fn is_not_available(&self) -> bool {
        matches!(self, Self::Unauthorized { .. } | Self::OriginNotFound { .. })
    }

    /// Message safe to return across a service boundary
    pub fn public_message(&self) -> String {
        if self.is_not_available() {
            NOT_AVAILABLE.to_string()
        } else {
            self.to_string()
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::ConfigInvalid { .. } | Self::ConfigValue { .. } => {
                Some("Run: strata config show, or strata config init --force")
            }
            Self::SensitiveContent { .. } => {
                Some("Store it under an owner namespace with --owner <id>")
            }
            Self::CommandFailed { .. } => Some("Is podman installed and on PATH?"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StrataError::SensitiveContent {
            name: ".env".to_string(),
            namespace: "global/".to_string(),
        };
        assert!(err.to_string().contains("sensitive content .env"));
    }

    #[test]
    fn error_hint() {
        let err = StrataError::command_failed(
            "podman ps",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert_eq!(err.hint(), Some("Is podman installed and on PATH?"));
    }

    #[test]
    fn error_retryable() {
        assert!(StrataError::ClaimTimeout {
            key: "global/ab".to_string(),
            waited: Duration::from_millis(10),
        }
        .is_retryable());
        assert!(!StrataError::InvalidKey("x".to_string()).is_retryable());
    }

    #[test]
    fn denied_read_looks_like_miss() {
        let denied = StrataError::Unauthorized {
            caller: "bob".to_string(),
            namespace: "owner/alice/".to_string(),
        };
        let missing = StrataError::OriginNotFound {
            identity: "pkg/left-pad".to_string(),
        };
        assert_eq!(denied.public_message(), missing.public_message());
        assert_eq!(denied.public_message(), NOT_AVAILABLE);
    }
}
