//! Cache and pool events
//!
//! Every hit, miss, scope decision and pool scaling action is reported to an
//! [`EventSink`]. Sinks are fire-and-forget: `record` must return without
//! waiting on IO so that the calling operation is never slowed down.

use crate::scope::Scope;
use serde::Serialize;
use std::sync::{Arc, Mutex};

/// Direction of a pool scaling action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleDirection {
    Up,
    Down,
}

/// An observable event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Event {
    TierHit {
        tier: String,
        level: usize,
        key: String,
    },
    TierMiss {
        tier: String,
        level: usize,
        key: String,
    },
    Promoted {
        key: String,
        from_level: usize,
        to_level: usize,
    },
    Evicted {
        tier: String,
        key: String,
        size: u64,
    },
    OriginFetch {
        identity: String,
        ok: bool,
    },
    ScopeDecision {
        name: String,
        scope: Scope,
        reason: String,
    },
    PoolScaled {
        category: String,
        direction: ScaleDirection,
        count: usize,
        size: usize,
    },
    ResourceProvisioned {
        category: String,
        id: String,
    },
    ResourceDestroyed {
        category: String,
        id: String,
        reason: String,
    },
    ResetAnomaly {
        category: String,
        id: String,
        reason: String,
    },
    ProvisioningFailed {
        category: String,
        reason: String,
    },
}

impl Event {
    /// Dotted event name used in the audit log
    pub fn name(&self) -> &'static str {
        match self {
            Self::TierHit { .. } => "cache.hit",
            Self::TierMiss { .. } => "cache.miss",
            Self::Promoted { .. } => "cache.promoted",
            Self::Evicted { .. } => "cache.evicted",
            Self::OriginFetch { .. } => "cache.origin_fetch",
            Self::ScopeDecision { .. } => "scope.decision",
            Self::PoolScaled { .. } => "pool.scaled",
            Self::ResourceProvisioned { .. } => "pool.provisioned",
            Self::ResourceDestroyed { .. } => "pool.destroyed",
            Self::ResetAnomaly { .. } => "pool.reset_anomaly",
            Self::ProvisioningFailed { .. } => "pool.provisioning_failed",
        }
    }
}

/// Receiver of events
pub trait EventSink: Send + Sync {
    /// Record an event without blocking the caller
    fn record(&self, event: Event);
}

/// Shared handle to a sink
pub type SharedSink = Arc<dyn EventSink>;

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn record(&self, _event: Event) {}
}

/// Sink that keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Count events matching a predicate
    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events
            .lock()
            .map(|events| events.iter().filter(|e| predicate(e)).count())
            .unwrap_or(0)
    }
}

impl EventSink for RecordingSink {
    fn record(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Sink that fans out to several sinks
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<SharedSink>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<SharedSink>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn record(&self, event: Event) {
        for sink in &self.sinks {
            sink.record(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names() {
        let event = Event::OriginFetch {
            identity: "pkg/react/18.2.0".to_string(),
            ok: true,
        };
        assert_eq!(event.name(), "cache.origin_fetch");
    }

    #[test]
    fn event_serializes_fields_only() {
        let event = Event::PoolScaled {
            category: "node".to_string(),
            direction: ScaleDirection::Down,
            count: 2,
            size: 3,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["category"], "node");
        assert_eq!(json["direction"], "down");
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(RecordingSink::new());
        let b = Arc::new(RecordingSink::new());
        let fanout = FanoutSink::new(vec![a.clone(), b.clone()]);

        fanout.record(Event::ProvisioningFailed {
            category: "python".to_string(),
            reason: "boom".to_string(),
        });

        assert_eq!(a.events().len(), 1);
        assert_eq!(b.count(|e| e.name() == "pool.provisioning_failed"), 1);
    }
}
