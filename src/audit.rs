//! Audit logging for cache and pool events
//!
//! Writes JSON lines to `~/.local/state/strata/audit.log`.
//! Events are handed to a writer task over a channel so that recording an
//! event never waits on the filesystem.

use crate::config::{schema::Config, ConfigManager};
use crate::events::{Event, EventSink};
use chrono::Utc;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// File-based audit logger that appends JSON lines
pub struct AuditLog {
    enabled: bool,
    path: PathBuf,
}

impl AuditLog {
    /// Create a new audit logger from config
    pub fn new(config: &Config) -> Self {
        Self {
            enabled: config.general.audit_log,
            path: ConfigManager::audit_log_path(),
        }
    }

    /// Create an audit logger writing to an explicit path
    pub fn at(path: PathBuf, enabled: bool) -> Self {
        Self { enabled, path }
    }

    /// Log an audit event as a JSON line
    ///
    /// Drops events on IO failure; audit logging must never crash the
    /// primary workflow.
    pub async fn log(&self, event: &str, data: &serde_json::Value) {
        if !self.enabled {
            return;
        }

        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event,
            "data": data,
        });

        let mut line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize audit event: {}", e);
                return;
            }
        };
        line.push('\n');

        if let Err(e) = self.append(&line).await {
            warn!("Failed to write audit log: {}", e);
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Start a writer task and return a sink feeding it
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self) -> AuditSink {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let writer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let data = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
                self.log(event.name(), &data).await;
            }
        });

        AuditSink {
            tx,
            writer: Some(writer),
        }
    }
}

/// Non-blocking [`EventSink`] backed by an [`AuditLog`] writer task
pub struct AuditSink {
    tx: mpsc::UnboundedSender<Event>,
    writer: Option<JoinHandle<()>>,
}

impl AuditSink {
    /// Close the channel and wait until every queued event is written
    pub async fn flush(mut self) {
        let writer = self.writer.take();
        drop(self);
        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }
}

impl EventSink for AuditSink {
    fn record(&self, event: Event) {
        // Writer gone means shutdown is in progress
        let _ = self.tx.send(event);
    }
}
