//! At-most-one origin fetch per key
//!
//! The first caller to miss on a key becomes its claimant; everyone else
//! waits on the claimant's published result. A claimant that goes away
//! without resolving publishes an "abandoned" failure from its drop. A claim
//! older than its lease may be taken over, which covers a claimant that is
//! stuck rather than gone.

use crate::cache::key::CacheKey;
use crate::error::{StrataError, StrataResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Why a claimed fetch failed, in a form every waiter can receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    NotFound,
    Transient(String),
    Abandoned,
    /// The claimant gave up waiting on another node's claim
    TimedOut(Duration),
    Refused(String),
}

impl FetchFailure {
    pub fn from_error(err: &StrataError) -> Self {
        match err {
            StrataError::OriginNotFound { .. } => Self::NotFound,
            StrataError::OriginTransient { reason, .. } => Self::Transient(reason.clone()),
            StrataError::ClaimAbandoned { .. } => Self::Abandoned,
            StrataError::ClaimTimeout { waited, .. } => Self::TimedOut(*waited),
            other => Self::Refused(other.to_string()),
        }
    }

    pub fn to_error(&self, key: &CacheKey) -> StrataError {
        match self {
            Self::NotFound => StrataError::OriginNotFound {
                identity: key.identity().to_string(),
            },
            Self::Transient(reason) => StrataError::OriginTransient {
                identity: key.identity().to_string(),
                reason: reason.clone(),
            },
            Self::Abandoned => StrataError::ClaimAbandoned {
                key: key.to_string(),
            },
            Self::TimedOut(waited) => StrataError::ClaimTimeout {
                key: key.to_string(),
                waited: *waited,
            },
            Self::Refused(reason) => StrataError::Internal(reason.clone()),
        }
    }
}

/// Result published by a claimant
pub type SharedOutcome = Result<Arc<Vec<u8>>, FetchFailure>;

struct Flight {
    tx: watch::Sender<Option<SharedOutcome>>,
    started: Instant,
}

/// Table of in-flight claims keyed by textual cache key
pub struct ClaimTable {
    flights: DashMap<String, Arc<Flight>>,
    lease: Duration,
}

/// Result of trying to claim a key
pub enum Claim<'a> {
    /// The caller must resolve the key
    Leader(ClaimGuard<'a>),
    /// Another caller is resolving the key
    Follower(ClaimWaiter),
}

impl ClaimTable {
    /// Claims older than `lease` can be taken over
    pub fn new(lease: Duration) -> Self {
        Self {
            flights: DashMap::new(),
            lease,
        }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Number of unresolved claims
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    pub fn claim(&self, key: &str) -> Claim<'_> {
        let fresh = || {
            let (tx, _) = watch::channel(None);
            Arc::new(Flight {
                tx,
                started: Instant::now(),
            })
        };

        let flight = match self.flights.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().started.elapsed() < self.lease {
                    return Claim::Follower(ClaimWaiter {
                        key: key.to_string(),
                        rx: held.get().tx.subscribe(),
                    });
                }
                debug!("Taking over stale claim on {}", key);
                let flight = fresh();
                held.insert(Arc::clone(&flight));
                flight
            }
            Entry::Vacant(slot) => {
                let flight = fresh();
                slot.insert(Arc::clone(&flight));
                flight
            }
        };

        Claim::Leader(ClaimGuard {
            table: self,
            key: key.to_string(),
            flight,
            resolved: false,
        })
    }
}

/// Exclusive right to resolve one key
pub struct ClaimGuard<'a> {
    table: &'a ClaimTable,
    key: String,
    flight: Arc<Flight>,
    resolved: bool,
}

impl ClaimGuard<'_> {
    /// Publish the outcome to every waiter and release the claim
    pub fn resolve(mut self, outcome: SharedOutcome) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: SharedOutcome) {
        self.resolved = true;
        self.flight.tx.send_replace(Some(outcome));
        let flight = &self.flight;
        self.table
            .flights
            .remove_if(&self.key, |_, current| Arc::ptr_eq(current, flight));
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            debug!("Claim on {} dropped without a result", self.key);
            self.finish(Err(FetchFailure::Abandoned));
        }
    }
}

/// Handle for waiting on someone else's claim
pub struct ClaimWaiter {
    key: String,
    rx: watch::Receiver<Option<SharedOutcome>>,
}

impl ClaimWaiter {
    /// Wait up to `timeout` for the claimant's outcome
    ///
    /// Giving up does not affect the claimant.
    pub async fn wait(mut self, timeout: Duration) -> StrataResult<SharedOutcome> {
        let published = tokio::time::timeout(timeout, async {
            match self.rx.wait_for(Option::is_some).await {
                Ok(outcome) => outcome.clone(),
                Err(_) => None,
            }
        })
        .await
        .map_err(|_| StrataError::ClaimTimeout {
            key: self.key.clone(),
            waited: timeout,
        })?;

        Ok(published.unwrap_or(Err(FetchFailure::Abandoned)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(bytes: &[u8]) -> SharedOutcome {
        Ok(Arc::new(bytes.to_vec()))
    }

    #[tokio::test]
    async fn second_claimant_follows() {
        let table = ClaimTable::new(Duration::from_secs(30));

        let Claim::Leader(guard) = table.claim("k") else {
            panic!("first claim must lead");
        };
        let Claim::Follower(waiter) = table.claim("k") else {
            panic!("second claim must follow");
        };
        assert_eq!(table.in_flight(), 1);

        guard.resolve(payload(b"v"));

        let outcome = waiter.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome.unwrap().as_slice(), b"v");
        assert_eq!(table.in_flight(), 0);
    }

    #[tokio::test]
    async fn dropped_guard_publishes_abandoned() {
        let table = ClaimTable::new(Duration::from_secs(30));
        let Claim::Leader(guard) = table.claim("k") else {
            panic!("first claim must lead");
        };
        let Claim::Follower(waiter) = table.claim("k") else {
            panic!("second claim must follow");
        };

        drop(guard);

        let outcome = waiter.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, Err(FetchFailure::Abandoned));
        assert!(matches!(table.claim("k"), Claim::Leader(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_times_out_without_affecting_claimant() {
        let table = ClaimTable::new(Duration::from_secs(30));
        let Claim::Leader(guard) = table.claim("k") else {
            panic!("first claim must lead");
        };
        let Claim::Follower(waiter) = table.claim("k") else {
            panic!("second claim must follow");
        };

        let result = waiter.wait(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(StrataError::ClaimTimeout { .. })));

        // Claimant is still in charge and can still publish
        assert_eq!(table.in_flight(), 1);
        guard.resolve(payload(b"late"));
        assert_eq!(table.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_claim_can_be_taken_over() {
        let table = ClaimTable::new(Duration::from_secs(5));
        let Claim::Leader(stale) = table.claim("k") else {
            panic!("first claim must lead");
        };

        tokio::time::advance(Duration::from_secs(6)).await;

        let Claim::Leader(fresh) = table.claim("k") else {
            panic!("stale claim must be taken over");
        };

        // Resolving the stale claim must not remove the fresh one
        stale.resolve(payload(b"old"));
        assert_eq!(table.in_flight(), 1);
        fresh.resolve(payload(b"new"));
        assert_eq!(table.in_flight(), 0);
    }

    #[test]
    fn failures_convert_back_to_errors() {
        let key = CacheKey::global("pkg/react/18.2.0");
        let failure = FetchFailure::from_error(&StrataError::OriginTransient {
            identity: "pkg/react/18.2.0".to_string(),
            reason: "503".to_string(),
        });
        assert_eq!(failure, FetchFailure::Transient("503".to_string()));
        assert!(matches!(
            failure.to_error(&key),
            StrataError::OriginTransient { ref reason, .. } if reason == "503"
        ));

        let timed_out = FetchFailure::from_error(&StrataError::ClaimTimeout {
            key: key.to_string(),
            waited: Duration::from_secs(120),
        });
        assert_eq!(timed_out, FetchFailure::TimedOut(Duration::from_secs(120)));
        let err = timed_out.to_error(&key);
        assert!(err.is_retryable());
        assert!(matches!(err, StrataError::ClaimTimeout { waited, .. } if waited == Duration::from_secs(120)));
    }
}
