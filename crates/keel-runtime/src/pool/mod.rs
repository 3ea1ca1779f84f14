//! Bounded pool of reusable resource handles.
//!
//! The pool holds at most `max_pool_size` live handles (idle plus leased).
//! Idle handles are health-checked before reuse, handles that accumulate
//! `error_eviction_threshold` errors are retired, and a background sweeper
//! closes handles idle longer than `idle_eviction_age`. Creation goes
//! through a circuit breaker so a broken backend fails fast instead of
//! being hammered by every waiting caller.

mod factory;
mod lease;

pub use factory::{ResourceError, ResourceFactory};
pub use lease::Lease;

use keel_core::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, PoolConfig};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::gate::{self, GateError};
use crate::lifecycle::Shutdown;

/// Errors returned by [`ResourcePool`].
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Pool is not running")]
    NotRunning,

    #[error("Pool is already running")]
    AlreadyRunning,

    /// The creation breaker is open; no handle was created.
    #[error("Resource creation unavailable: circuit '{breaker}' is open")]
    Unavailable { breaker: String },

    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub name: String,
    pub running: bool,
    pub max_size: usize,
    /// Live handles, idle plus leased
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    /// Creations in flight
    pub creating: usize,
    /// Leased handles left over from before the last stop
    pub retiring: usize,
    pub created: u64,
    pub reused: u64,
    pub errors: u64,
    pub evicted: u64,
    pub closed: u64,
    /// Times an acquire found the pool exhausted
    pub waits: u64,
    pub creation_gate: BreakerSnapshot,
}

struct Slot<H> {
    /// `None` exactly while leased.
    handle: Option<H>,
    last_used_at: Instant,
    error_count: u32,
    /// Leased across a stop; closed when its lease comes back.
    retiring: bool,
}

impl<H> Slot<H> {
    fn is_idle(&self) -> bool {
        self.handle.is_some()
    }
}

struct PoolState<H> {
    slots: BTreeMap<u64, Slot<H>>,
    creating: usize,
    running: bool,
    next_id: u64,
}

#[derive(Default)]
struct PoolCounters {
    created: AtomicU64,
    reused: AtomicU64,
    errors: AtomicU64,
    evicted: AtomicU64,
    closed: AtomicU64,
    waits: AtomicU64,
}

enum Step<H> {
    Reuse(u64, H),
    Create,
    Wait,
}

pub(crate) struct PoolInner<F: ResourceFactory> {
    name: String,
    factory: F,
    config: PoolConfig,
    gate: CircuitBreaker,
    state: Mutex<PoolState<F::Handle>>,
    available: Notify,
    counters: PoolCounters,
    sweeper: Mutex<Option<(Shutdown, JoinHandle<()>)>>,
}

impl<F: ResourceFactory> PoolInner<F> {
    /// Decide what an acquire attempt does next, under one lock.
    ///
    /// Idle handles over the error threshold are pulled out here and
    /// returned for closing.
    fn plan_acquire(&self) -> Result<(Step<F::Handle>, Vec<F::Handle>), PoolError> {
        let mut state = self.state.lock();
        if !state.running {
            return Err(PoolError::NotRunning);
        }

        let threshold = self.config.error_eviction_threshold;
        let worn: Vec<u64> = state
            .slots
            .iter()
            .filter(|(_, slot)| slot.is_idle() && slot.error_count >= threshold)
            .map(|(id, _)| *id)
            .collect();
        let mut retired = Vec::with_capacity(worn.len());
        for id in worn {
            if let Some(handle) = state.slots.remove(&id).and_then(|slot| slot.handle) {
                tracing::info!(pool = %self.name, handle_id = id, "Evicting handle over error threshold");
                retired.push(handle);
            }
        }
        self.counters
            .evicted
            .fetch_add(retired.len() as u64, Ordering::Relaxed);

        let now = Instant::now();
        let reuse = state.slots.iter_mut().find_map(|(id, slot)| {
            slot.handle.take().map(|handle| {
                slot.last_used_at = now;
                (*id, handle)
            })
        });
        if let Some((id, handle)) = reuse {
            return Ok((Step::Reuse(id, handle), retired));
        }

        if state.slots.len() + state.creating < self.config.max_pool_size {
            state.creating += 1;
            return Ok((Step::Create, retired));
        }

        Ok((Step::Wait, retired))
    }

    /// Take a handle back from a lease.
    fn check_in(self: &Arc<Self>, id: u64, handle: F::Handle, failed: bool) {
        let mut state = self.state.lock();
        let slot = if state.running {
            state.slots.get_mut(&id).filter(|slot| !slot.retiring)
        } else {
            None
        };

        if let Some(slot) = slot {
            if failed {
                slot.error_count += 1;
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
            }
            slot.last_used_at = Instant::now();
            slot.handle = Some(handle);
            drop(state);
            self.available.notify_one();
            return;
        }

        // Pool stopped (or restarted) while this handle was leased. The slot
        // kept counting toward capacity until now.
        state.slots.remove(&id);
        drop(state);
        tracing::debug!(pool = %self.name, handle_id = id, "Closing handle returned after stop");
        self.retire(handle);
        self.available.notify_one();
    }

    fn forget(&self, id: u64) {
        let removed = self.state.lock().slots.remove(&id).is_some();
        if removed {
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
            self.available.notify_one();
        }
    }

    fn insert(&self, state: &mut PoolState<F::Handle>, handle: Option<F::Handle>) -> u64 {
        state.next_id += 1;
        let id = state.next_id;
        state.slots.insert(
            id,
            Slot {
                handle,
                last_used_at: Instant::now(),
                error_count: 0,
                retiring: false,
            },
        );
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        id
    }

    async fn create_gated(&self) -> Result<F::Handle, PoolError> {
        match gate::guard(&self.gate, self.factory.create()).await {
            Ok(handle) => Ok(handle),
            Err(GateError::Failed(e)) => {
                tracing::warn!(pool = %self.name, kind = %self.factory.kind(), error = %e, "Handle creation failed");
                Err(PoolError::Resource(e))
            }
            Err(_) => Err(PoolError::Unavailable {
                breaker: self.gate.name().to_string(),
            }),
        }
    }

    async fn close_handle(&self, handle: F::Handle) {
        if let Err(e) = self.factory.close(handle).await {
            tracing::warn!(pool = %self.name, error = %e, "Error closing handle");
        }
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Close a handle from synchronous context.
    fn retire(self: &Arc<Self>, handle: F::Handle) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = self.clone();
                runtime.spawn(async move {
                    inner.close_handle(handle).await;
                });
            }
            Err(_) => {
                tracing::warn!(pool = %self.name, "No runtime to close handle, dropping it");
            }
        }
    }

    async fn cleanup_stale(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<F::Handle> = {
            let mut state = self.state.lock();
            let ids: Vec<u64> = state
                .slots
                .iter()
                .filter(|(_, slot)| {
                    slot.is_idle() && now.saturating_duration_since(slot.last_used_at) >= max_idle
                })
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.slots.remove(&id).and_then(|slot| slot.handle))
                .collect()
        };

        let count = stale.len();
        if count == 0 {
            return 0;
        }

        self.counters
            .evicted
            .fetch_add(count as u64, Ordering::Relaxed);
        for handle in stale {
            self.close_handle(handle).await;
        }
        self.available.notify_one();
        tracing::info!(pool = %self.name, evicted = count, "Evicted stale idle handles");
        count
    }
}

/// Releases a creation slot if the creating acquire is abandoned.
struct Reservation<'a, F: ResourceFactory> {
    inner: &'a PoolInner<F>,
    settled: bool,
}

impl<'a, F: ResourceFactory> Reservation<'a, F> {
    fn new(inner: &'a PoolInner<F>) -> Self {
        Self {
            inner,
            settled: false,
        }
    }

    /// Turn the reservation into a leased slot. `None` if the pool stopped
    /// while the handle was being created.
    fn commit(mut self) -> Option<u64> {
        self.settled = true;
        let mut state = self.inner.state.lock();
        state.creating -= 1;
        if !state.running {
            return None;
        }
        Some(self.inner.insert(&mut state, None))
    }
}

impl<F: ResourceFactory> Drop for Reservation<'_, F> {
    fn drop(&mut self) {
        if !self.settled {
            self.inner.state.lock().creating -= 1;
            self.inner.available.notify_one();
        }
    }
}

/// Bounded, health-checked pool of handles produced by a [`ResourceFactory`].
pub struct ResourcePool<F: ResourceFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ResourceFactory> Clone for ResourcePool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: ResourceFactory> ResourcePool<F> {
    /// Create a stopped pool. Call [`start`](Self::start) before acquiring.
    pub fn new(
        name: impl Into<String>,
        factory: F,
        config: PoolConfig,
        gate: CircuitBreakerConfig,
    ) -> Self {
        let name = name.into();
        let gate = CircuitBreaker::new(format!("{}-create", name), gate);
        Self::with_gate(name, factory, config, gate)
    }

    /// Create a stopped pool around an existing creation breaker.
    pub fn with_gate(
        name: impl Into<String>,
        factory: F,
        config: PoolConfig,
        gate: CircuitBreaker,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                factory,
                config,
                gate,
                state: Mutex::new(PoolState {
                    slots: BTreeMap::new(),
                    creating: 0,
                    running: false,
                    next_id: 0,
                }),
                available: Notify::new(),
                counters: PoolCounters::default(),
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Breaker gating handle creation.
    pub fn creation_gate(&self) -> &CircuitBreaker {
        &self.inner.gate
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Start the pool: create `warm_size` idle handles and launch the sweeper.
    ///
    /// A warm-up failure stops the pool again and is returned.
    pub async fn start(&self) -> Result<(), PoolError> {
        {
            let mut state = self.inner.state.lock();
            if state.running {
                return Err(PoolError::AlreadyRunning);
            }
            state.running = true;
        }

        for _ in 0..self.inner.config.warm_size {
            match self.inner.create_gated().await {
                Ok(handle) => {
                    let mut state = self.inner.state.lock();
                    self.inner.insert(&mut state, Some(handle));
                }
                Err(e) => {
                    tracing::error!(pool = %self.inner.name, error = %e, "Pool warm-up failed");
                    self.stop().await;
                    return Err(e);
                }
            }
        }

        self.spawn_sweeper();
        tracing::info!(
            pool = %self.inner.name,
            max_size = self.inner.config.max_pool_size,
            warm = self.inner.config.warm_size,
            "Resource pool started"
        );
        Ok(())
    }

    fn spawn_sweeper(&self) {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.subscribe();
        let pool: Weak<PoolInner<F>> = Arc::downgrade(&self.inner);
        let every = self.inner.config.sweep_interval;
        let max_idle = self.inner.config.idle_eviction_age;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = signal.triggered() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = pool.upgrade() else { break };
                        inner.cleanup_stale(max_idle).await;
                    }
                }
            }
        });

        *self.inner.sweeper.lock() = Some((shutdown, task));
    }

    /// Stop the pool.
    ///
    /// Idle handles are closed now; leased handles are closed as their
    /// leases come back and keep counting toward `max_pool_size` until then,
    /// even if the pool is restarted. Waiting acquirers fail with
    /// [`PoolError::NotRunning`].
    pub async fn stop(&self) {
        let sweeper = self.inner.sweeper.lock().take();
        if let Some((shutdown, task)) = sweeper {
            shutdown.trigger();
            if let Err(e) = task.await {
                tracing::warn!(pool = %self.inner.name, error = %e, "Sweeper task ended abnormally");
            }
        }

        let (idle, leased) = {
            let mut state = self.inner.state.lock();
            state.running = false;
            let mut idle = Vec::new();
            state.slots.retain(|_, slot| match slot.handle.take() {
                Some(handle) => {
                    idle.push(handle);
                    false
                }
                None => {
                    slot.retiring = true;
                    true
                }
            });
            (idle, state.slots.len())
        };

        let closed = idle.len();
        for handle in idle {
            self.inner.close_handle(handle).await;
        }
        self.inner.available.notify_waiters();

        tracing::info!(
            pool = %self.inner.name,
            closed,
            leased,
            "Resource pool stopped"
        );
    }

    /// Lease a handle, waiting while the pool is at capacity.
    ///
    /// Reuses a healthy idle handle when one exists, otherwise creates one if
    /// below `max_pool_size`, otherwise retries every
    /// `acquire_retry_interval` until a handle is released. Callers that
    /// cannot wait indefinitely should wrap this in a timeout.
    pub async fn acquire(&self) -> Result<Lease<F>, PoolError> {
        let inner = &self.inner;
        loop {
            let (step, retired) = inner.plan_acquire()?;
            for handle in retired {
                inner.close_handle(handle).await;
            }

            match step {
                Step::Reuse(id, handle) => {
                    let lease = Lease::new(inner.clone(), id, handle);
                    if inner.factory.health_check(&lease).await {
                        inner.counters.reused.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(pool = %inner.name, handle_id = id, "Reusing idle handle");
                        return Ok(lease);
                    }
                    tracing::warn!(pool = %inner.name, handle_id = id, "Idle handle failed health check, evicting");
                    lease.discard().await;
                }
                Step::Create => {
                    let reservation = Reservation::new(inner);
                    let handle = inner.create_gated().await?;
                    return match reservation.commit() {
                        Some(id) => {
                            tracing::debug!(pool = %inner.name, handle_id = id, "Created handle");
                            Ok(Lease::new(inner.clone(), id, handle))
                        }
                        None => {
                            inner.close_handle(handle).await;
                            Err(PoolError::NotRunning)
                        }
                    };
                }
                Step::Wait => {
                    inner.counters.waits.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(pool = %inner.name, "Pool exhausted, waiting for a release");
                    let _ = tokio::time::timeout(
                        inner.config.acquire_retry_interval,
                        inner.available.notified(),
                    )
                    .await;
                }
            }
        }
    }

    /// Return a leased handle. Same as [`Lease::release`].
    pub fn release(&self, lease: Lease<F>, failed: bool) {
        lease.release(failed);
    }

    /// Count an error against a leased handle without returning it.
    ///
    /// Returns `true` once the handle has reached the eviction threshold; it
    /// will be closed instead of reused after release.
    pub fn record_error(&self, lease: &Lease<F>) -> bool {
        let mut state = self.inner.state.lock();
        let Some(slot) = state.slots.get_mut(&lease.id()) else {
            return false;
        };
        slot.error_count += 1;
        self.inner.counters.errors.fetch_add(1, Ordering::Relaxed);

        let worn = slot.error_count >= self.inner.config.error_eviction_threshold;
        if worn {
            tracing::warn!(
                pool = %self.inner.name,
                handle_id = lease.id(),
                errors = slot.error_count,
                "Handle reached error threshold"
            );
        }
        worn
    }

    /// Close idle handles unused for at least `max_idle`. Leased handles are
    /// never touched. Returns how many were closed.
    pub async fn cleanup_stale(&self, max_idle: Duration) -> usize {
        self.inner.cleanup_stale(max_idle).await
    }

    pub fn metrics(&self) -> PoolMetrics {
        let (total, idle, retiring, creating, running) = {
            let state = self.inner.state.lock();
            let idle = state.slots.values().filter(|slot| slot.is_idle()).count();
            let retiring = state.slots.values().filter(|slot| slot.retiring).count();
            (state.slots.len(), idle, retiring, state.creating, state.running)
        };
        let counters = &self.inner.counters;

        PoolMetrics {
            name: self.inner.name.clone(),
            running,
            max_size: self.inner.config.max_pool_size,
            total,
            active: total - idle,
            idle,
            creating,
            retiring,
            created: counters.created.load(Ordering::Relaxed),
            reused: counters.reused.load(Ordering::Relaxed),
            errors: counters.errors.load(Ordering::Relaxed),
            evicted: counters.evicted.load(Ordering::Relaxed),
            closed: counters.closed.load(Ordering::Relaxed),
            waits: counters.waits.load(Ordering::Relaxed),
            creation_gate: self.inner.gate.snapshot(),
        }
    }
}
