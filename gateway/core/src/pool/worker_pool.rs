//! Session Worker Pool
//!
//! Bounded pool of heavyweight workers (automated browser sessions, derived
//! HTTP clients). Each worker is bound 1:1 to a credential checked out of a
//! [`CredentialPool`] for the worker's whole lifetime.
//!
//! # Worker Lifecycle
//!
//! ```text
//! Uninitialized ──► Initializing ──► Ready ◄──► InUse
//!                        │                        │
//!                        │ init failed            │ terminal failure /
//!                        ▼                        ▼ breaker tripped
//!                    Destroyed ◄──────────── Failed
//! ```
//!
//! `get()` never waits. When no worker is ready and capacity allows, it
//! starts creating one in the background and returns `None`; callers retry or
//! use [`SessionWorkerPool::acquire`] to wait for one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use super::breaker::{BreakerConfig, Verdict};
use super::credential::Credential;
use super::credential_pool::CredentialPool;
use crate::error::{GatewayError, Result};

/// Interval at which `acquire` re-polls when nothing signals readiness
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Worker Factory
// ============================================================================

/// Creates, resets and tears down workers for one backend
#[async_trait]
pub trait WorkerFactory: Send + Sync + 'static {
    /// The live session handle
    type Worker: Send + Sync + 'static;

    /// Establish a session for `credential`
    ///
    /// Harvested session material (cookies, keys, model selection) is written
    /// into `credential` and persisted by the pool.
    async fn initialize(&self, credential: &mut Credential) -> Result<Self::Worker>;

    /// Undo persisted session material after a failed initialization
    async fn rollback(&self, credential: &mut Credential) {
        credential.artifacts.cookies.clear();
        credential.artifacts.proxy = None;
    }

    /// Reset transient session state after a recoverable failure
    async fn recycle(&self, worker: &Self::Worker, credential: &mut Credential) -> Result<()>;

    /// Release the session's resources
    async fn shutdown(&self, _worker: Arc<Self::Worker>) {}
}

// ============================================================================
// Worker State
// ============================================================================

/// Lifecycle state of one worker slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    /// Slot reserved, initialization not yet started
    Uninitialized,
    /// Session being established
    Initializing,
    /// Idle and available
    Ready,
    /// Leased to a caller
    InUse,
    /// Failed and about to be destroyed
    Failed,
    /// Evicted
    Destroyed,
}

/// How to treat the bound credential when a worker is destroyed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DestroyMode {
    /// Return the credential untouched
    Release,
    /// Invalidate for the pool's cooldown
    Invalidate,
    /// Invalidate until the given window has passed
    RecheckAfter(Duration),
}

/// Counters for a worker pool
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerPoolStats {
    /// Configured maximum number of live workers
    pub capacity: usize,
    /// Workers reserved or initializing
    pub initializing: usize,
    /// Idle workers
    pub ready: usize,
    /// Leased workers
    pub in_use: usize,
}

impl WorkerPoolStats {
    /// Workers counting against capacity
    #[must_use]
    pub fn live(&self) -> usize {
        self.initializing + self.ready + self.in_use
    }
}

struct Slot<W> {
    id: String,
    state: WorkerState,
    credential_id: String,
    worker: Option<Arc<W>>,
    created_at: Instant,
    use_count: u64,
}

// ============================================================================
// Pool
// ============================================================================

struct Shared<F: WorkerFactory> {
    factory: F,
    credentials: Arc<CredentialPool>,
    capacity: usize,
    breaker: BreakerConfig,
    slots: Mutex<Vec<Slot<F::Worker>>>,
    ready: Notify,
}

/// Bounded pool of credential-bound session workers
pub struct SessionWorkerPool<F: WorkerFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: WorkerFactory> Clone for SessionWorkerPool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: WorkerFactory> std::fmt::Debug for SessionWorkerPool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionWorkerPool")
            .field("pool", &self.shared.credentials.name())
            .field("stats", &self.stats())
            .finish()
    }
}

impl<F: WorkerFactory> SessionWorkerPool<F> {
    /// Create a pool of at most `capacity` workers
    pub fn new(
        factory: F,
        credentials: Arc<CredentialPool>,
        capacity: usize,
        breaker: BreakerConfig,
    ) -> Self {
        if credentials.config().max_failures.is_none() {
            tracing::debug!(
                pool = %credentials.name(),
                "Credential pool has no failure maximum; tripped credentials stay eligible"
            );
        }
        Self {
            shared: Arc::new(Shared {
                factory,
                credentials,
                capacity,
                breaker,
                slots: Mutex::new(Vec::with_capacity(capacity)),
                ready: Notify::new(),
            }),
        }
    }

    /// The factory driving this pool
    #[must_use]
    pub fn factory(&self) -> &F {
        &self.shared.factory
    }

    /// The credential pool workers are bound to
    #[must_use]
    pub fn credentials(&self) -> &Arc<CredentialPool> {
        &self.shared.credentials
    }

    /// Circuit-breaking policy
    #[must_use]
    pub fn breaker(&self) -> &BreakerConfig {
        &self.shared.breaker
    }

    /// Lease a ready worker, or start creating one
    ///
    /// Must be called inside a Tokio runtime when capacity allows creating a
    /// worker.
    #[must_use]
    pub fn get(&self) -> Option<WorkerLease<F>> {
        let mut slots = self.shared.slots.lock();

        let ready = slots
            .iter()
            .position(|s| s.state == WorkerState::Ready && s.worker.is_some());
        if let Some(index) = ready {
            let slot = &mut slots[index];
            let worker = slot.worker.clone()?;
            slot.state = WorkerState::InUse;
            slot.use_count += 1;
            let slot_id = slot.id.clone();
            let credential_id = slot.credential_id.clone();
            drop(slots);

            let credential = self
                .shared
                .credentials
                .get_by_id(&credential_id)
                .unwrap_or_else(|| Credential {
                    id: credential_id.clone(),
                    ..Credential::sentinel()
                });
            tracing::debug!(
                pool = %self.shared.credentials.name(),
                worker = %slot_id,
                credential = %credential_id,
                "Worker leased"
            );
            return Some(WorkerLease {
                shared: Arc::clone(&self.shared),
                slot_id,
                worker,
                credential,
                settled: false,
            });
        }

        let live = slots
            .iter()
            .filter(|s| s.state != WorkerState::Destroyed)
            .count();
        if live >= self.shared.capacity {
            return None;
        }

        let credential = match self.shared.credentials.try_get() {
            Ok(credential) => credential,
            Err(e) => {
                tracing::debug!(pool = %self.shared.credentials.name(), error = %e, "No credential for a new worker");
                return None;
            }
        };

        let slot_id = Uuid::new_v4().to_string();
        slots.push(Slot {
            id: slot_id.clone(),
            state: WorkerState::Uninitialized,
            credential_id: credential.id.clone(),
            worker: None,
            created_at: Instant::now(),
            use_count: 0,
        });
        drop(slots);

        tracing::info!(
            pool = %self.shared.credentials.name(),
            worker = %slot_id,
            credential = %credential.id,
            live = live + 1,
            capacity = self.shared.capacity,
            "Creating worker"
        );
        tokio::spawn(initialize_slot(Arc::clone(&self.shared), slot_id, credential));
        None
    }

    /// Wait up to `wait` for a worker to become available
    pub async fn acquire(&self, wait: Duration) -> Option<WorkerLease<F>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.shared.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self.get() {
                return Some(lease);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }

            let poll = (tokio::time::Instant::now() + ACQUIRE_POLL_INTERVAL).min(deadline);
            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(poll) => {}
            }
        }
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> WorkerPoolStats {
        let slots = self.shared.slots.lock();
        let mut stats = WorkerPoolStats {
            capacity: self.shared.capacity,
            ..Default::default()
        };
        for slot in slots.iter() {
            match slot.state {
                WorkerState::Uninitialized | WorkerState::Initializing => stats.initializing += 1,
                WorkerState::Ready => stats.ready += 1,
                WorkerState::InUse | WorkerState::Failed => stats.in_use += 1,
                WorkerState::Destroyed => {}
            }
        }
        stats
    }

    /// State of every live worker, oldest first
    #[must_use]
    pub fn worker_states(&self) -> Vec<WorkerState> {
        let slots = self.shared.slots.lock();
        let mut ordered: Vec<_> = slots.iter().map(|s| (s.created_at, s.state)).collect();
        ordered.sort_by_key(|(created, _)| *created);
        ordered.into_iter().map(|(_, state)| state).collect()
    }

    /// Tear down every idle worker and release its credential
    pub async fn shutdown(&self) {
        let idle: Vec<Slot<F::Worker>> = {
            let mut slots = self.shared.slots.lock();
            let (idle, busy): (Vec<_>, Vec<_>) = slots
                .drain(..)
                .partition(|s| s.state == WorkerState::Ready);
            *slots = busy;
            idle
        };
        for slot in idle {
            self.shared.credentials.release(&slot.credential_id);
            if let Some(worker) = slot.worker {
                self.shared.factory.shutdown(worker).await;
            }
            tracing::info!(
                pool = %self.shared.credentials.name(),
                worker = %slot.id,
                uses = slot.use_count,
                "Worker shut down"
            );
        }
    }
}

async fn initialize_slot<F: WorkerFactory>(shared: Arc<Shared<F>>, slot_id: String, mut credential: Credential) {
    shared.set_state(&slot_id, WorkerState::Initializing);
    let pool = shared.credentials.name().to_string();

    match shared.factory.initialize(&mut credential).await {
        Ok(worker) => {
            shared.write_back(&credential);
            let installed = {
                let mut slots = shared.slots.lock();
                match slots.iter_mut().find(|s| s.id == slot_id) {
                    Some(slot) => {
                        slot.worker = Some(Arc::new(worker));
                        slot.state = WorkerState::Ready;
                        None
                    }
                    None => Some(worker),
                }
            };
            if let Some(orphan) = installed {
                // Slot vanished during initialization (pool shut down).
                shared.credentials.release(&credential.id);
                shared.factory.shutdown(Arc::new(orphan)).await;
                return;
            }
            tracing::info!(pool = %pool, worker = %slot_id, credential = %credential.id, "Worker ready");
            shared.ready.notify_waiters();
        }
        Err(e) => {
            tracing::warn!(
                pool = %pool,
                worker = %slot_id,
                credential = %credential.id,
                error = %e,
                "Worker initialization failed"
            );
            shared.factory.rollback(&mut credential).await;
            shared.write_back(&credential);
            if e.is_terminal() {
                shared.credentials.invalidate(&credential.id);
            } else {
                shared.credentials.record_failure(&credential.id);
                shared.credentials.release(&credential.id);
            }
            shared.remove_slot(&slot_id);
        }
    }
}

impl<F: WorkerFactory> Shared<F> {
    fn set_state(&self, slot_id: &str, state: WorkerState) {
        if let Some(slot) = self.slots.lock().iter_mut().find(|s| s.id == slot_id) {
            slot.state = state;
        }
    }

    fn remove_slot(&self, slot_id: &str) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.iter_mut().find(|s| s.id == slot_id) {
            slot.state = WorkerState::Destroyed;
        }
        slots.retain(|s| s.state != WorkerState::Destroyed);
        drop(slots);
        self.ready.notify_waiters();
    }

    /// Persist session material the worker may have changed
    fn write_back(&self, credential: &Credential) {
        self.credentials.update(&credential.id, |stored| {
            stored.artifacts = credential.artifacts.clone();
            stored.model = credential.model.clone();
            stored.use_count = stored.use_count.max(credential.use_count);
            stored.last_use_time = stored.last_use_time.max(credential.last_use_time);
        });
    }
}

// ============================================================================
// Lease
// ============================================================================

/// Exclusive use of one worker
///
/// Settle with exactly one of [`done`](Self::done),
/// [`succeed`](Self::succeed), [`fail`](Self::fail) or
/// [`destroy`](Self::destroy). Dropping an unsettled lease returns the worker
/// to `Ready`.
pub struct WorkerLease<F: WorkerFactory> {
    shared: Arc<Shared<F>>,
    slot_id: String,
    worker: Arc<F::Worker>,
    credential: Credential,
    settled: bool,
}

impl<F: WorkerFactory> std::fmt::Debug for WorkerLease<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("worker", &self.slot_id)
            .field("credential", &self.credential.id)
            .finish_non_exhaustive()
    }
}

impl<F: WorkerFactory> WorkerLease<F> {
    /// The leased worker
    #[must_use]
    pub fn worker(&self) -> &F::Worker {
        &self.worker
    }

    /// Worker slot id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.slot_id
    }

    /// The bound credential
    #[must_use]
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Mutable access to the bound credential; written back on settle
    pub fn credential_mut(&mut self) -> &mut Credential {
        &mut self.credential
    }

    /// Return the worker to `Ready`
    pub fn done(mut self) {
        self.settle_ready();
    }

    /// Reset the failure count and return the worker to `Ready`
    pub fn succeed(mut self) {
        self.shared.credentials.record_success(&self.credential.id);
        self.credential.failed_count = 0;
        self.settle_ready();
    }

    /// Evict the worker; a replacement is created lazily
    pub fn destroy(mut self, mode: DestroyMode) {
        self.settle_destroyed(mode);
    }

    /// Account for a failed interaction and apply the circuit breaker
    pub async fn fail(mut self, error: &GatewayError) -> Verdict {
        let pool = self.shared.credentials.name().to_string();
        self.shared.set_state(&self.slot_id, WorkerState::Failed);

        if error.is_terminal() {
            tracing::warn!(pool = %pool, worker = %self.slot_id, error = %error, "Terminal worker failure");
            self.settle_destroyed(DestroyMode::Invalidate);
            return Verdict::Destroy;
        }

        let failures = self.shared.credentials.record_failure(&self.credential.id);
        self.credential.failed_count = failures;
        let verdict = self.shared.breaker.verdict(failures);
        tracing::info!(
            pool = %pool,
            worker = %self.slot_id,
            failures,
            threshold = self.shared.breaker.failure_threshold,
            ?verdict,
            error = %error,
            "Worker interaction failed"
        );

        match verdict {
            Verdict::Destroy => {
                self.settle_destroyed(DestroyMode::Release);
                Verdict::Destroy
            }
            Verdict::Recycle => {
                let worker = Arc::clone(&self.worker);
                match self.shared.factory.recycle(&worker, &mut self.credential).await {
                    Ok(()) => {
                        self.settle_ready();
                        Verdict::Recycle
                    }
                    Err(e) => {
                        tracing::warn!(pool = %pool, worker = %self.slot_id, error = %e, "Worker recycle failed");
                        self.settle_destroyed(DestroyMode::Release);
                        Verdict::Destroy
                    }
                }
            }
        }
    }

    fn settle_ready(&mut self) {
        self.settled = true;
        self.shared.write_back(&self.credential);
        self.shared.set_state(&self.slot_id, WorkerState::Ready);
        self.shared.ready.notify_waiters();
    }

    fn settle_destroyed(&mut self, mode: DestroyMode) {
        self.settled = true;
        self.shared.write_back(&self.credential);
        let credentials = &self.shared.credentials;
        match mode {
            DestroyMode::Release => credentials.release(&self.credential.id),
            DestroyMode::Invalidate => credentials.invalidate(&self.credential.id),
            DestroyMode::RecheckAfter(window) => credentials.invalidate_for(&self.credential.id, window),
        }
        self.shared.remove_slot(&self.slot_id);
        tracing::info!(
            pool = %credentials.name(),
            worker = %self.slot_id,
            credential = %self.credential.id,
            ?mode,
            "Worker destroyed"
        );

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let shared = Arc::clone(&self.shared);
            let worker = Arc::clone(&self.worker);
            handle.spawn(async move { shared.factory.shutdown(worker).await });
        }
    }
}

impl<F: WorkerFactory> Drop for WorkerLease<F> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!(worker = %self.slot_id, "Worker lease dropped without settling; returning to pool");
            self.settle_ready();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::credential_pool::PoolConfig;
    use crate::test_utils::MockFactory;
    use pretty_assertions::assert_eq;

    fn credentials(n: usize, threshold: u32) -> Arc<CredentialPool> {
        let pool = CredentialPool::new("workers", PoolConfig::default().with_max_failures(threshold));
        pool.seed((0..n).map(|i| Credential::new(format!("tok-{i}"))));
        Arc::new(pool)
    }

    fn worker_pool(factory: MockFactory, n_credentials: usize, capacity: usize) -> SessionWorkerPool<MockFactory> {
        SessionWorkerPool::new(factory, credentials(n_credentials, 10), capacity, BreakerConfig::default())
    }

    #[tokio::test]
    async fn test_first_get_starts_initialization() {
        let pool = worker_pool(MockFactory::default(), 2, 1);
        assert!(pool.get().is_none());
        assert_eq!(pool.stats().initializing, 1);

        let lease = pool.acquire(Duration::from_secs(5)).await.unwrap();
        assert_eq!(lease.worker().generation, 1);
        assert!(pool.credentials().is_in_use(&lease.credential().id));
        lease.done();
        assert_eq!(pool.stats().ready, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_workers_never_exceed_capacity() {
        let factory = MockFactory::default().with_init_delay(Duration::from_millis(200));
        let pool = worker_pool(factory, 10, 3);

        for _ in 0..20 {
            let _ = pool.get();
            assert!(pool.stats().live() <= 3);
        }
        let mut leases = Vec::new();
        for _ in 0..3 {
            leases.push(pool.acquire(Duration::from_secs(5)).await.unwrap());
            assert!(pool.stats().live() <= 3);
        }
        assert!(pool.get().is_none());
        assert_eq!(pool.stats().in_use, 3);
        assert_eq!(pool.credentials().stats().in_use, 3);
    }

    #[tokio::test]
    async fn test_done_writes_back_model() {
        let pool = worker_pool(MockFactory::default(), 1, 1);
        let mut lease = pool.acquire(Duration::from_secs(5)).await.unwrap();
        lease.credential_mut().model = Some("net-gpt-4".into());
        let id = lease.credential().id.clone();
        lease.done();

        assert_eq!(
            pool.credentials().get_by_id(&id).unwrap().model.as_deref(),
            Some("net-gpt-4")
        );
        let again = pool.get().unwrap();
        assert_eq!(again.credential().model.as_deref(), Some("net-gpt-4"));
    }

    #[tokio::test]
    async fn test_failure_below_threshold_recycles() {
        let factory = MockFactory::default();
        let pool = worker_pool(factory.clone(), 1, 1);
        let lease = pool.acquire(Duration::from_secs(5)).await.unwrap();

        let verdict = lease.fail(&GatewayError::Stalled(Duration::from_secs(5))).await;
        assert_eq!(verdict, Verdict::Recycle);
        assert_eq!(factory.recycled(), 1);
        assert_eq!(pool.stats().ready, 1);
        assert_eq!(pool.credentials().list()[0].failed_count, 1);
    }

    #[tokio::test]
    async fn test_failure_at_threshold_destroys() {
        let pool = SessionWorkerPool::new(
            MockFactory::default(),
            credentials(1, 2),
            1,
            BreakerConfig {
                failure_threshold: 2,
                ..Default::default()
            },
        );
        let stall = GatewayError::Stalled(Duration::from_secs(5));

        let lease = pool.acquire(Duration::from_secs(5)).await.unwrap();
        assert_eq!(lease.fail(&stall).await, Verdict::Recycle);

        let lease = pool.get().unwrap();
        assert_eq!(lease.fail(&stall).await, Verdict::Destroy);
        assert_eq!(pool.stats().live(), 0);

        // Tripped credential is not handed to a replacement.
        assert!(pool.get().is_none());
        assert_eq!(pool.stats().live(), 0);
        assert!(pool.credentials().get().is_sentinel());
    }

    #[tokio::test]
    async fn test_terminal_failure_invalidates_credential() {
        let pool = worker_pool(MockFactory::default(), 1, 1);
        let lease = pool.acquire(Duration::from_secs(5)).await.unwrap();
        let id = lease.credential().id.clone();

        let verdict = lease
            .fail(&GatewayError::CredentialRejected("401".into()))
            .await;
        assert_eq!(verdict, Verdict::Destroy);
        assert!(pool.credentials().get_by_id(&id).unwrap().invalid);
        assert_eq!(pool.stats().live(), 0);
    }

    #[tokio::test]
    async fn test_init_failure_rolls_back_and_destroys() {
        let factory =
            MockFactory::default().failing_init(|| GatewayError::Automation("login marker missing".into()));
        let creds = credentials(1, 10);
        creds.update(&creds.list()[0].id, |c| {
            c.artifacts.cookies.push(crate::pool::Cookie::new("s", "v", "example.com"));
        });
        let pool = SessionWorkerPool::new(factory.clone(), creds, 1, BreakerConfig::default());

        assert!(pool.acquire(Duration::from_millis(300)).await.is_none());
        let stored = pool.credentials().list().remove(0);
        assert!(stored.invalid);
        assert!(stored.artifacts.cookies.is_empty());
        assert!(factory.initialized() >= 1);
        assert_eq!(pool.stats().live(), 0);
    }

    #[tokio::test]
    async fn test_destroy_recheck_after() {
        let pool = worker_pool(MockFactory::default(), 1, 1);
        let lease = pool.acquire(Duration::from_secs(5)).await.unwrap();
        let id = lease.credential().id.clone();
        lease.destroy(DestroyMode::RecheckAfter(Duration::from_secs(30 * 24 * 3600)));

        let stored = pool.credentials().get_by_id(&id).unwrap();
        assert!(stored.invalid);
        assert!(stored.cooldown_until.unwrap() > chrono::Utc::now() + chrono::Duration::days(29));
    }

    #[tokio::test]
    async fn test_dropped_lease_returns_to_ready() {
        let pool = worker_pool(MockFactory::default(), 1, 1);
        {
            let _lease = pool.acquire(Duration::from_secs(5)).await.unwrap();
            assert_eq!(pool.stats().in_use, 1);
        }
        assert_eq!(pool.stats().ready, 1);
    }

    #[tokio::test]
    async fn test_shutdown_releases_idle_workers() {
        let factory = MockFactory::default();
        let pool = worker_pool(factory.clone(), 2, 2);
        let lease = pool.acquire(Duration::from_secs(5)).await.unwrap();
        lease.done();
        pool.shutdown().await;
        assert_eq!(pool.stats().live(), 0);
        assert_eq!(pool.credentials().stats().in_use, 0);
        assert_eq!(factory.shut_down(), 1);
    }
}
