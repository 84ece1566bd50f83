//! Warm pool lifecycle management
//!
//! Each category has its own pool with two locks. The state lock guards
//! list membership only and is never held across a provisioner call. The
//! resize lock serializes everything that changes the pool size on purpose
//! (warm-up, replenishment, maintenance), so two scaling decisions never
//! race across the min/max bounds.
//!
//! Pool size is `available + pending`, where pending counts creations and
//! resets in flight, including on-demand creations for callers. Acquired
//! resources do not count towards it. An acquire that finds the pool empty
//! and already at its maximum is refused rather than exceeding it.

use crate::config::{PoolConfig, PoolsConfig};
use crate::error::{StrataError, StrataResult};
use crate::events::{Event, ScaleDirection, SharedSink};
use crate::pool::provisioner::Provisioner;
use crate::pool::resource::{Health, PooledResource, ResourceState};
use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Default)]
struct PoolState {
    available: VecDeque<PooledResource>,
    acquired: HashMap<String, PooledResource>,
    pending: usize,
    last_scaled: Option<Instant>,
}

impl PoolState {
    fn size(&self) -> usize {
        self.available.len() + self.pending
    }

    fn utilization(&self) -> f64 {
        let total = self.available.len() + self.acquired.len();
        if total == 0 {
            0.0
        } else {
            1.0 - self.available.len() as f64 / total as f64
        }
    }
}

/// How an acquire will be served
enum Checkout {
    Ready(PooledResource),
    Create,
    Full(usize),
}

struct Pool {
    category: String,
    config: PoolConfig,
    state: Mutex<PoolState>,
    resize: Mutex<()>,
}

impl Pool {
    fn new(category: &str, config: PoolConfig) -> Self {
        Self {
            category: category.to_string(),
            config,
            state: Mutex::new(PoolState::default()),
            resize: Mutex::new(()),
        }
    }
}

/// Point-in-time view of one pool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub category: String,
    pub available: usize,
    pub acquired: usize,
    pub pending: usize,
    pub size: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub utilization: f64,
}

/// What one maintenance pass did to a pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub category: String,
    pub expired: usize,
    pub unhealthy: usize,
    pub provisioned: usize,
    pub scaled_down: usize,
}

impl MaintenanceReport {
    fn new(category: &str) -> Self {
        Self {
            category: category.to_string(),
            ..Default::default()
        }
    }

    pub fn is_noop(&self) -> bool {
        self.expired + self.unhealthy + self.provisioned + self.scaled_down == 0
    }
}

struct PoolInner {
    provisioner: Arc<dyn Provisioner>,
    config: PoolsConfig,
    pools: DashMap<String, Arc<Pool>>,
    sink: SharedSink,
    closed: AtomicBool,
}

/// Keeps warm pools of pre-provisioned resources per category
#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<PoolInner>,
}

/// Handle to the background maintenance loop
pub struct MaintenanceHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Stop the loop and wait for the current pass to finish
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!("Pool maintenance task failed: {}", e);
        }
    }
}

impl PoolManager {
    /// Create a manager; pools named in `config` exist from the start
    pub fn new(provisioner: Arc<dyn Provisioner>, config: PoolsConfig, sink: SharedSink) -> Self {
        let pools = DashMap::new();
        for (category, pool) in &config.categories {
            pools.insert(category.clone(), Arc::new(Pool::new(category, pool.clone())));
        }

        Self {
            inner: Arc::new(PoolInner {
                provisioner,
                config,
                pools,
                sink,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Make sure a pool exists for `category`
    pub fn register(&self, category: &str) {
        self.inner.pool(category);
    }

    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = self
            .inner
            .pools
            .iter()
            .map(|pool| pool.key().clone())
            .collect();
        categories.sort();
        categories
    }

    /// Provision every known pool up to its target size
    pub async fn warm_up(&self) -> usize {
        let pools = self.inner.all_pools();
        let mut provisioned = 0;
        for pool in pools {
            let _resize = pool.resize.lock().await;
            let deficit = {
                let state = pool.state.lock().await;
                pool.config.target_size.saturating_sub(state.size())
            };
            let added = self.inner.grow(&pool, deficit).await;
            info!("Warmed {} pool with {} resources", pool.category, added);
            provisioned += added;
        }
        provisioned
    }

    /// Take a ready resource, provisioning one if the pool is empty
    pub async fn acquire(&self, category: &str) -> StrataResult<PooledResource> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(StrataError::Provisioning {
                category: category.to_string(),
                reason: "pool manager is shut down".to_string(),
            });
        }

        let pool = self.inner.pool(category);
        let (checkout, drained) = {
            let mut state = pool.state.lock().await;
            let checkout = match state.available.pop_front() {
                Some(mut resource) => {
                    resource.transition(ResourceState::Acquired)?;
                    state
                        .acquired
                        .insert(resource.id.clone(), resource.clone());
                    Checkout::Ready(resource)
                }
                None if state.size() < pool.config.max_size => {
                    state.pending += 1;
                    Checkout::Create
                }
                None => Checkout::Full(state.pending),
            };
            (checkout, state.available.len() < pool.config.replenish_below)
        };

        if drained {
            self.spawn_replenish(&pool);
        }

        match checkout {
            Checkout::Ready(resource) => {
                debug!("Acquired {} resource {} from pool", category, resource.id);
                Ok(resource)
            }
            Checkout::Create => {
                debug!("Pool {} is empty, provisioning on demand", category);
                self.provision_for_caller(pool).await
            }
            Checkout::Full(in_flight) => Err(StrataError::Provisioning {
                category: category.to_string(),
                reason: format!(
                    "pool is at its maximum of {} with {} creations in flight",
                    pool.config.max_size, in_flight
                ),
            }),
        }
    }

    fn spawn_replenish(&self, pool: &Arc<Pool>) {
        let inner = Arc::clone(&self.inner);
        let pool = Arc::clone(pool);
        tokio::spawn(async move {
            inner.replenish(&pool).await;
        });
    }

    /// Provision in a detached task so that a caller who goes away does not
    /// waste the resource. The caller has already counted the creation as
    /// pending.
    async fn provision_for_caller(&self, pool: Arc<Pool>) -> StrataResult<PooledResource> {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let created = inner.provision(&pool).await;
            let result = {
                let mut state = pool.state.lock().await;
                state.pending -= 1;
                created.and_then(|mut resource| {
                    resource.transition(ResourceState::Acquired)?;
                    state
                        .acquired
                        .insert(resource.id.clone(), resource.clone());
                    Ok(resource)
                })
            };
            if let Err(Ok(orphan)) = tx.send(result) {
                inner.take_back(&pool, orphan).await;
            }
        });

        rx.await.map_err(|_| {
            StrataError::Internal("provisioning task ended without a result".to_string())
        })?
    }

    /// Return a resource to its pool
    ///
    /// The resource is reset and health checked before it becomes available
    /// again. If that cannot be verified it is destroyed and the reset error
    /// is returned. A full pool destroys the resource instead.
    pub async fn release(&self, mut resource: PooledResource) -> StrataResult<()> {
        let pool = self
            .inner
            .pools
            .get(&resource.category)
            .map(|pool| Arc::clone(pool.value()))
            .ok_or_else(|| StrataError::UnknownPool(resource.category.clone()))?;

        resource.transition(ResourceState::Released)?;

        let keep = {
            let mut state = pool.state.lock().await;
            if state.acquired.remove(&resource.id).is_none() {
                return Err(StrataError::Internal(format!(
                    "resource {} is not checked out of pool {}",
                    resource.id, pool.category
                )));
            }
            let keep =
                !self.inner.closed.load(Ordering::SeqCst) && state.size() < pool.config.max_size;
            if keep {
                state.pending += 1;
            }
            keep
        };

        if !keep {
            self.inner.destroy(&pool, resource, "pool full").await;
            return Ok(());
        }

        let recycled = self
            .inner
            .recycle(&mut resource)
            .await
            .and_then(|()| resource.transition(ResourceState::Available));

        let mut state = pool.state.lock().await;
        state.pending -= 1;
        match recycled {
            Ok(()) => {
                debug!("Returned {} resource {} to pool", pool.category, resource.id);
                state.available.push_back(resource);
                Ok(())
            }
            Err(e) => {
                drop(state);
                warn!("Reset of {} failed, destroying: {}", resource.id, e);
                self.inner.sink.record(Event::ResetAnomaly {
                    category: pool.category.clone(),
                    id: resource.id.clone(),
                    reason: e.to_string(),
                });
                self.inner.destroy(&pool, resource, "reset failed").await;
                Err(e)
            }
        }
    }

    /// Run one maintenance pass over every pool
    pub async fn maintain(&self) -> Vec<MaintenanceReport> {
        let pools = self.inner.all_pools();
        join_all(pools.iter().map(|pool| self.inner.maintain_pool(pool))).await
    }

    /// Run [`PoolManager::maintain`] every `interval` until the handle is shut down
    pub fn spawn_maintenance(&self, interval: Duration) -> MaintenanceHandle {
        let (stop, mut stopped) = watch::channel(false);
        let manager = self.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for report in manager.maintain().await {
                            if !report.is_noop() {
                                debug!("Maintenance of {}: {:?}", report.category, report);
                            }
                        }
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Pool maintenance stopped");
        });

        MaintenanceHandle { stop, task }
    }

    /// Stop handing out resources and destroy every idle one
    ///
    /// Resources still acquired are destroyed when released.
    pub async fn shutdown(&self) -> usize {
        self.inner.closed.store(true, Ordering::SeqCst);

        let mut destroyed = 0;
        for pool in self.inner.all_pools() {
            let _resize = pool.resize.lock().await;
            let idle: Vec<PooledResource> = pool.state.lock().await.available.drain(..).collect();
            for resource in idle {
                self.inner.destroy(&pool, resource, "shutdown").await;
                destroyed += 1;
            }
        }
        info!("Pool manager shut down, destroyed {} idle resources", destroyed);
        destroyed
    }

    /// Resources currently owned by a pool, idle ones first
    pub async fn inventory(&self, category: &str) -> Vec<PooledResource> {
        let Some(pool) = self.inner.existing(category) else {
            return Vec::new();
        };
        let state = pool.state.lock().await;
        let mut acquired: Vec<PooledResource> = state.acquired.values().cloned().collect();
        acquired.sort_by(|a, b| a.id.cmp(&b.id));
        state.available.iter().cloned().chain(acquired).collect()
    }

    pub async fn stats(&self, category: &str) -> Option<PoolStats> {
        let pool = self.inner.existing(category)?;
        Some(pool_stats(&pool).await)
    }

    pub async fn all_stats(&self) -> Vec<PoolStats> {
        let mut stats = Vec::new();
        for pool in self.inner.all_pools() {
            stats.push(pool_stats(&pool).await);
        }
        stats.sort_by(|a, b| a.category.cmp(&b.category));
        stats
    }
}

async fn pool_stats(pool: &Pool) -> PoolStats {
    let state = pool.state.lock().await;
    PoolStats {
        category: pool.category.clone(),
        available: state.available.len(),
        acquired: state.acquired.len(),
        pending: state.pending,
        size: state.size(),
        min_size: pool.config.min_size,
        max_size: pool.config.max_size,
        utilization: state.utilization(),
    }
}

impl PoolInner {
    fn pool(&self, category: &str) -> Arc<Pool> {
        if let Some(pool) = self.existing(category) {
            return pool;
        }
        let config = self.config.for_category(category);
        let pool = self.pools.entry(category.to_string()).or_insert_with(|| {
            debug!("Creating pool {} from default settings", category);
            Arc::new(Pool::new(category, config))
        });
        Arc::clone(pool.value())
    }

    fn existing(&self, category: &str) -> Option<Arc<Pool>> {
        self.pools.get(category).map(|pool| Arc::clone(pool.value()))
    }

    fn all_pools(&self) -> Vec<Arc<Pool>> {
        self.pools
            .iter()
            .map(|pool| Arc::clone(pool.value()))
            .collect()
    }

    async fn provision(&self, pool: &Pool) -> StrataResult<PooledResource> {
        match self.provisioner.create(&pool.category).await {
            Ok(id) => {
                let mut resource = PooledResource::new(id, &pool.category);
                resource.transition(ResourceState::Available)?;
                self.sink.record(Event::ResourceProvisioned {
                    category: pool.category.clone(),
                    id: resource.id.clone(),
                });
                Ok(resource)
            }
            Err(e) => {
                warn!("Provisioning for {} failed: {}", pool.category, e);
                self.sink.record(Event::ProvisioningFailed {
                    category: pool.category.clone(),
                    reason: e.to_string(),
                });
                Err(match e {
                    e @ StrataError::Provisioning { .. } => e,
                    other => StrataError::Provisioning {
                        category: pool.category.clone(),
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    /// Provision up to `wanted` resources without crossing max size.
    /// Caller holds the resize lock.
    async fn grow(&self, pool: &Pool, wanted: usize) -> usize {
        let count = {
            let mut state = pool.state.lock().await;
            let room = pool.config.max_size.saturating_sub(state.size());
            let count = wanted.min(room);
            state.pending += count;
            count
        };
        if count == 0 {
            return 0;
        }

        let results = join_all((0..count).map(|_| self.provision(pool))).await;

        let mut late = Vec::new();
        let mut added = 0;
        {
            let mut state = pool.state.lock().await;
            let closed = self.closed.load(Ordering::SeqCst);
            for result in results {
                state.pending -= 1;
                match result {
                    Ok(resource) if closed => late.push(resource),
                    Ok(resource) => {
                        state.available.push_back(resource);
                        added += 1;
                    }
                    Err(_) => {}
                }
            }
        }

        for resource in late {
            self.destroy(pool, resource, "shutdown").await;
        }
        added
    }

    /// Destroy up to `wanted` idle resources without crossing min size.
    /// Caller holds the resize lock.
    async fn shrink(&self, pool: &Pool, wanted: usize) -> usize {
        let victims: Vec<PooledResource> = {
            let mut state = pool.state.lock().await;
            let surplus = state.size().saturating_sub(pool.config.min_size);
            let count = wanted.min(surplus).min(state.available.len());
            (0..count)
                .filter_map(|_| state.available.pop_front())
                .collect()
        };

        let count = victims.len();
        for resource in victims {
            self.destroy(pool, resource, "scaled down").await;
        }
        count
    }

    async fn replenish(&self, pool: &Pool) {
        let _resize = pool.resize.lock().await;
        let deficit = {
            let state = pool.state.lock().await;
            pool.config.target_size.saturating_sub(state.size())
        };
        let added = self.grow(pool, deficit).await;
        if added > 0 {
            debug!("Replenished {} pool with {} resources", pool.category, added);
        }
    }

    /// Keep a resource whose caller went away, if the pool has room
    async fn take_back(&self, pool: &Pool, mut resource: PooledResource) {
        info!(
            "Caller for {} resource {} went away, returning it to the pool",
            pool.category, resource.id
        );
        let leftover = {
            let mut state = pool.state.lock().await;
            state.acquired.remove(&resource.id);
            let fits =
                !self.closed.load(Ordering::SeqCst) && state.size() < pool.config.max_size;
            let ready = resource.transition(ResourceState::Released).is_ok()
                && resource.transition(ResourceState::Available).is_ok();
            if fits && ready {
                state.available.push_back(resource);
                None
            } else {
                Some(resource)
            }
        };

        if let Some(resource) = leftover {
            self.destroy(pool, resource, "pool full").await;
        }
    }

    /// Reset and verify a released resource
    async fn recycle(&self, resource: &mut PooledResource) -> StrataResult<()> {
        self.provisioner
            .reset(resource)
            .await
            .map_err(|e| match e {
                e @ StrataError::ResetVerification { .. } => e,
                other => StrataError::ResetVerification {
                    id: resource.id.clone(),
                    reason: other.to_string(),
                },
            })?;

        let health = self.provisioner.health_check(resource).await;
        resource.health = health.clone();
        match health {
            Health::Healthy => {
                resource.last_reset = Some(Utc::now());
                Ok(())
            }
            Health::Unhealthy(reason) => Err(StrataError::ResetVerification {
                id: resource.id.clone(),
                reason: format!("unhealthy after reset: {}", reason),
            }),
        }
    }

    async fn destroy(&self, pool: &Pool, mut resource: PooledResource, reason: &str) {
        if let Err(e) = self.provisioner.destroy(&resource).await {
            warn!("Failed to destroy {} resource {}: {}", pool.category, resource.id, e);
        }
        if let Err(e) = resource.transition(ResourceState::Destroyed) {
            debug!("{}", e);
        }
        debug!("Destroyed {} resource {} ({})", pool.category, resource.id, reason);
        self.sink.record(Event::ResourceDestroyed {
            category: pool.category.clone(),
            id: resource.id,
            reason: reason.to_string(),
        });
    }

    async fn maintain_pool(&self, pool: &Arc<Pool>) -> MaintenanceReport {
        let _resize = pool.resize.lock().await;
        let mut report = MaintenanceReport::new(&pool.category);

        // Expire idle resources past their TTL
        let ttl = pool.config.ttl();
        if !ttl.is_zero() {
            let expired: Vec<PooledResource> = {
                let mut state = pool.state.lock().await;
                let (old, fresh): (VecDeque<_>, VecDeque<_>) =
                    state.available.drain(..).partition(|r| r.age() >= ttl);
                state.available = fresh;
                old.into_iter().collect()
            };
            for mut resource in expired {
                if let Err(e) = resource.transition(ResourceState::Expired) {
                    debug!("{}", e);
                }
                self.destroy(pool, resource, "expired").await;
                report.expired += 1;
            }
        }

        // Destroy idle resources that fail their health check
        let idle: Vec<PooledResource> = pool.state.lock().await.available.iter().cloned().collect();
        let mut sick = Vec::new();
        for resource in &idle {
            if let Health::Unhealthy(reason) = self.provisioner.health_check(resource).await {
                sick.push((resource.id.clone(), reason));
            }
        }
        if !sick.is_empty() {
            let removed: Vec<(PooledResource, String)> = {
                let mut state = pool.state.lock().await;
                sick.into_iter()
                    .filter_map(|(id, reason)| {
                        let pos = state.available.iter().position(|r| r.id == id)?;
                        state.available.remove(pos).map(|r| (r, reason))
                    })
                    .collect()
            };
            for (mut resource, reason) in removed {
                warn!("Idle {} resource {} is unhealthy: {}", pool.category, resource.id, reason);
                resource.health = Health::Unhealthy(reason);
                self.destroy(pool, resource, "unhealthy").await;
                report.unhealthy += 1;
            }
        }

        // Top up to the minimum; failures retry on the next pass
        let below_min = {
            let state = pool.state.lock().await;
            pool.config.min_size.saturating_sub(state.size())
        };
        report.provisioned += self.grow(pool, below_min).await;

        // Scale on utilization
        let (utilization, size, cooled) = {
            let state = pool.state.lock().await;
            let cooled = state
                .last_scaled
                .map_or(true, |at| at.elapsed() >= pool.config.cooldown());
            (state.utilization(), state.size(), cooled)
        };

        if utilization >= pool.config.high_utilization && size < pool.config.max_size {
            let added = self.grow(pool, pool.config.scale_step).await;
            if added > 0 {
                report.provisioned += added;
                self.record_scaling(pool, ScaleDirection::Up, added).await;
            }
        } else if utilization <= pool.config.low_utilization
            && size > pool.config.min_size
            && cooled
        {
            let removed = self.shrink(pool, pool.config.scale_step).await;
            if removed > 0 {
                report.scaled_down = removed;
                self.record_scaling(pool, ScaleDirection::Down, removed).await;
            }
        }

        report
    }

    async fn record_scaling(&self, pool: &Pool, direction: ScaleDirection, count: usize) {
        let size = {
            let mut state = pool.state.lock().await;
            state.last_scaled = Some(Instant::now());
            state.size()
        };
        info!(
            "Scaled {} pool {:?} by {} to {}",
            pool.category, direction, count, size
        );
        self.sink.record(Event::PoolScaled {
            category: pool.category.clone(),
            direction,
            count,
            size,
        });
    }
}
