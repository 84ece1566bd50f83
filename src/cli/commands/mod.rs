//! CLI command implementations

pub mod cache;
pub mod classify;
pub mod config;
pub mod key;
pub mod pool;

pub use cache::execute as cache;
pub use classify::execute as classify;
pub use config::execute as config;
pub use key::execute as key;
pub use pool::execute as pool;

use crate::audit::{AuditLog, AuditSink};
use crate::config::Config;
use crate::events::{NullSink, SharedSink};
use std::sync::Arc;
use tracing::debug;

/// Audit writer for the lifetime of one command
struct AuditTrail {
    sink: Option<Arc<AuditSink>>,
}

impl AuditTrail {
    fn start(config: &Config) -> Self {
        let sink = config
            .general
            .audit_log
            .then(|| Arc::new(AuditLog::new(config).spawn()));
        Self { sink }
    }

    fn sink(&self) -> SharedSink {
        match &self.sink {
            Some(sink) => Arc::clone(sink) as SharedSink,
            None => Arc::new(NullSink),
        }
    }

    /// Wait for queued events to reach the log
    ///
    /// Everything holding [`AuditTrail::sink`] must be dropped first.
    async fn finish(self) {
        let Some(sink) = self.sink else {
            return;
        };
        match Arc::try_unwrap(sink) {
            Ok(sink) => sink.flush().await,
            Err(_) => debug!("Audit sink still in use, not waiting for it"),
        }
    }
}

/// Format bytes as human-readable size (e.g., "1.5 MB")
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    match bytes {
        b if b >= GB => format!("{:.1} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.1} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.1} KB", b as f64 / KB as f64),
        b => format!("{} B", b),
    }
}
