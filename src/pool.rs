//! Session pool: at most one live session per endpoint
//!
//! The pool keys sessions by [`EndpointId`]. Each entry sits behind its own
//! async mutex, so operations on one endpoint are serialized while distinct
//! endpoints proceed in parallel. A semaphore bounds the number of open
//! connections across all endpoints.
//!
//! [`SessionPool::acquire`] hands out a [`PooledSession`] guard; dropping the
//! guard returns the session to the pool.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{Notify, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AcquireMode, PoolConfig};
use crate::error::{FleetError, Result};
use crate::session::{Session, SessionState};
use crate::ssh::{Endpoint, EndpointId, RusshTransport, Transport};

/// Stand-in deadline for waits too long to represent
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// A session plus the connection slot it occupies
struct Entry {
    session: Session,
    permit: Option<OwnedSemaphorePermit>,
    /// When the last connect attempt gave up, and why
    last_failure: Option<(Instant, FleetError)>,
}

impl Entry {
    /// Failure of a connect attempt that ended after `since`, unless the
    /// session has recovered in the meantime
    fn failure_since(&self, since: Instant) -> Option<FleetError> {
        if self.session.is_ready() {
            return None;
        }
        match &self.last_failure {
            Some((at, err)) if *at >= since => Some(err.clone()),
            _ => None,
        }
    }

    /// Bring state and capacity accounting back in line after use
    fn settle(&mut self) {
        self.session.settle();
        if !self.session.has_connection() {
            self.permit = None;
        }
    }

    async fn shut(&mut self) -> Result<()> {
        let result = self.session.close().await;
        self.permit = None;
        result
    }
}

type Slot = Arc<tokio::sync::Mutex<Entry>>;

struct Shared {
    config: PoolConfig,
    transport: Arc<dyn Transport>,
    slots: Mutex<HashMap<EndpointId, Slot>>,
    capacity: Arc<Semaphore>,
    released: Notify,
    closed: AtomicBool,
    next_id: AtomicU64,
}

/// Connection counts at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Endpoints with a tracked session
    pub sessions: usize,
    /// Connection slots in use
    pub open_connections: usize,
    pub max_connections: usize,
}

/// Outcome of [`SessionPool::close_all`]
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Connections closed cleanly
    pub closed: usize,
    /// Sessions whose close failed or timed out
    pub failures: Vec<(EndpointId, FleetError)>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Pool of sessions, cheap to clone
#[derive(Clone)]
pub struct SessionPool {
    shared: Arc<Shared>,
}

impl SessionPool {
    pub fn new(config: PoolConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let capacity = Arc::new(Semaphore::new(config.max_concurrent_connections));
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                transport,
                slots: Mutex::new(HashMap::new()),
                capacity,
                released: Notify::new(),
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Pool backed by real SSH connections
    pub fn with_russh(config: PoolConfig) -> Result<Self> {
        Self::new(config, Arc::new(RusshTransport::new()))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<EndpointId, Slot>> {
        self.shared
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Vec<(EndpointId, Slot)> {
        self.slots()
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect()
    }

    fn slot_for(&self, endpoint: &Endpoint, id: &EndpointId) -> Slot {
        let mut slots = self.slots();
        let slot = slots.entry(id.clone()).or_insert_with(|| {
            let session = Session::new(
                self.shared.next_id.fetch_add(1, Ordering::Relaxed),
                endpoint.clone(),
                Arc::clone(&self.shared.transport),
                self.shared.config.session_settings(),
            );
            Arc::new(tokio::sync::Mutex::new(Entry {
                session,
                permit: None,
                last_failure: None,
            }))
        });
        Arc::clone(slot)
    }

    /// Forget `slot` unless it has already been replaced
    fn remove_slot(&self, id: &EndpointId, slot: &Slot) {
        let mut slots = self.slots();
        if slots.get(id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(id);
        }
    }

    /// Get the endpoint's session, connecting it if needed
    ///
    /// Concurrent callers for one endpoint queue on its lock; the first one
    /// connects and the others get the same session once it is released. If
    /// that connect fails, callers that were already waiting get the same
    /// error instead of trying again.
    pub async fn acquire(&self, endpoint: &Endpoint) -> Result<PooledSession> {
        let id = endpoint.id();
        let wait = self.shared.config.acquire_timeout;
        let waiting_since = Instant::now();
        let deadline = deadline_after(wait);

        loop {
            if self.is_closed() {
                return Err(FleetError::PoolClosed);
            }

            let slot = self.slot_for(endpoint, &id);
            let mut entry = timeout_at(deadline, slot.lock_owned())
                .await
                .map_err(|_| FleetError::timeout(wait))?;

            if let Some(err) = entry.failure_since(waiting_since) {
                debug!("Connect to {} failed while waiting: {}", id, err);
                return Err(err);
            }

            match entry.session.state() {
                SessionState::Ready => {
                    debug!("Reusing session {} for {}", entry.session.id(), id);
                }
                // Evicted or swept while we waited
                SessionState::Closing | SessionState::Closed => continue,
                SessionState::Disconnected => {
                    debug!("Connecting session {} for {}", entry.session.id(), id);
                    self.establish(&mut entry, &id, deadline).await?;
                }
                SessionState::Broken | SessionState::Connecting | SessionState::Executing => {
                    entry.settle();
                    info!("Reconnecting broken session {} for {}", entry.session.id(), id);
                    self.establish(&mut entry, &id, deadline).await?;
                }
            }

            return Ok(PooledSession {
                entry: Some(entry),
                shared: Arc::clone(&self.shared),
            });
        }
    }

    /// Connect and record the outcome for callers queued on the entry
    async fn establish(&self, entry: &mut Entry, id: &EndpointId, deadline: Instant) -> Result<()> {
        let result = self.connect_with_retries(entry, id, deadline).await;
        entry.last_failure = match &result {
            Ok(()) => None,
            Err(err) => Some((Instant::now(), err.clone())),
        };
        result
    }

    /// Connect with bounded retries and exponential backoff
    async fn connect_with_retries(
        &self,
        entry: &mut Entry,
        id: &EndpointId,
        deadline: Instant,
    ) -> Result<()> {
        let retry = self.shared.config.retry_policy();
        if entry.permit.is_none() {
            entry.permit = Some(self.reserve_capacity(id, deadline).await?);
        }

        let mut attempt = 0;
        loop {
            let err = match timeout_at(deadline, entry.session.connect()).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) => err,
                Err(_) => {
                    entry.session.mark_broken();
                    FleetError::timeout(self.shared.config.acquire_timeout)
                }
            };

            let delay = match retry.delay_for_attempt(attempt) {
                Some(delay) if err.is_retryable() && deadline_after(delay) < deadline => delay,
                _ => {
                    entry.permit = None;
                    return Err(err);
                }
            };

            attempt += 1;
            warn!(
                "Connect to {} failed (attempt {}/{}): {}; retrying in {}ms",
                id,
                attempt,
                retry.max_attempts(),
                err,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Take one connection slot, evicting an idle session of another endpoint
    /// if none is free
    async fn reserve_capacity(
        &self,
        id: &EndpointId,
        deadline: Instant,
    ) -> Result<OwnedSemaphorePermit> {
        let capacity = &self.shared.capacity;
        loop {
            match Arc::clone(capacity).try_acquire_owned() {
                Ok(permit) => return Ok(permit),
                Err(TryAcquireError::Closed) => return Err(FleetError::PoolClosed),
                Err(TryAcquireError::NoPermits) => {}
            }

            if self.evict_lru_idle(id).await {
                continue;
            }

            let max = self.shared.config.max_concurrent_connections;
            if self.shared.config.acquire_mode == AcquireMode::NonBlocking {
                return Err(FleetError::PoolExhausted(max));
            }

            debug!("All {} connection slots busy, {} waits", max, id);
            tokio::select! {
                permit = Arc::clone(capacity).acquire_owned() => {
                    return permit.map_err(|_| FleetError::PoolClosed);
                }
                _ = self.shared.released.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(FleetError::timeout(self.shared.config.acquire_timeout));
                }
            }
        }
    }

    /// Close the least recently used idle session that is not `exclude`
    async fn evict_lru_idle(&self, exclude: &EndpointId) -> bool {
        let mut oldest: Option<(EndpointId, Slot, OwnedMutexGuard<Entry>)> = None;

        for (id, slot) in self.snapshot() {
            if &id == exclude {
                continue;
            }
            // Locked means in use
            let Ok(entry) = Arc::clone(&slot).try_lock_owned() else {
                continue;
            };
            if !entry.session.is_ready() || entry.permit.is_none() {
                continue;
            }
            let older = match &oldest {
                Some((_, _, best)) => entry.session.last_activity() < best.session.last_activity(),
                None => true,
            };
            if older {
                oldest = Some((id, slot, entry));
            }
        }

        let Some((id, slot, mut entry)) = oldest else {
            return false;
        };

        info!("Evicting idle session for {} to free a connection slot", id);
        if let Err(e) = entry.shut().await {
            warn!("Error closing evicted session for {}: {}", id, e);
        }
        self.remove_slot(&id, &slot);
        true
    }

    /// Return a session to the pool
    ///
    /// Equivalent to dropping the guard.
    pub fn release(&self, session: PooledSession) {
        session.release();
    }

    /// Close and forget the session for `id`
    ///
    /// Waits for an in-flight operation on that endpoint to finish. Returns
    /// whether a session was tracked.
    pub async fn evict(&self, id: &EndpointId) -> Result<bool> {
        let tracked = self.slots().get(id).cloned();
        let Some(slot) = tracked else {
            return Ok(false);
        };

        let mut entry = Arc::clone(&slot).lock_owned().await;
        let result = entry.shut().await;
        self.remove_slot(id, &slot);
        drop(entry);
        self.shared.released.notify_one();

        info!("Evicted session for {}", id);
        result.map(|_| true)
    }

    /// Close broken sessions and sessions idle for longer than
    /// `idle_session_timeout`; returns how many were removed
    ///
    /// Sessions in use are skipped.
    pub async fn sweep(&self) -> usize {
        let idle_timeout = self.shared.config.idle_session_timeout;
        let mut removed = 0;

        for (id, slot) in self.snapshot() {
            let Ok(mut entry) = Arc::clone(&slot).try_lock_owned() else {
                continue;
            };

            entry.settle();
            let expired = match entry.session.state() {
                SessionState::Ready => entry.session.idle_for() >= idle_timeout,
                SessionState::Executing | SessionState::Connecting => false,
                _ => true,
            };
            if !expired {
                continue;
            }

            debug!(
                "Sweeping {} session {} for {}",
                entry.session.state(),
                entry.session.id(),
                id
            );
            if let Err(e) = entry.shut().await {
                debug!("Error closing swept session for {}: {}", id, e);
            }
            self.remove_slot(&id, &slot);
            removed += 1;
        }

        if removed > 0 {
            debug!("Sweep removed {} sessions", removed);
            self.shared.released.notify_one();
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `cancel` fires or the
    /// pool is closed
    pub fn spawn_sweeper(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if pool.is_closed() {
                            break;
                        }
                        pool.sweep().await;
                    }
                }
            }
            debug!("Session sweeper stopped");
        })
    }

    /// Close every session; later acquires fail with `PoolClosed`
    ///
    /// Sessions are closed concurrently. Failures are collected, never
    /// propagated, so shutdown always completes.
    pub async fn close_all(&self) -> ShutdownReport {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.capacity.close();

        let slots: Vec<(EndpointId, Slot)> = self.slots().drain().collect();
        let grace = self
            .shared
            .config
            .command_timeout
            .saturating_add(self.shared.config.connect_timeout);
        info!("Closing session pool ({} sessions)", slots.len());

        let results = join_all(slots.into_iter().map(|(id, slot)| async move {
            match timeout(grace, slot.lock_owned()).await {
                Ok(mut entry) => {
                    let was_open = entry.session.has_connection();
                    (id, was_open, entry.shut().await)
                }
                Err(_) => (id, false, Err(FleetError::timeout(grace))),
            }
        }))
        .await;

        let mut report = ShutdownReport::default();
        for (id, was_open, result) in results {
            match result {
                Ok(()) if was_open => report.closed += 1,
                Ok(()) => {}
                Err(e) => {
                    warn!("Failed to close session for {}: {}", id, e);
                    report.failures.push((id, e));
                }
            }
        }

        info!(
            "Session pool closed: {} connections closed, {} failures",
            report.closed,
            report.failures.len()
        );
        report
    }

    pub fn stats(&self) -> PoolStats {
        let max_connections = self.shared.config.max_concurrent_connections;
        let available = self.shared.capacity.available_permits();
        PoolStats {
            sessions: self.slots().len(),
            open_connections: max_connections.saturating_sub(available),
            max_connections,
        }
    }
}

fn deadline_after(wait: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(wait).unwrap_or_else(|| now + FAR_FUTURE)
}

impl fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Exclusive use of a pooled session
///
/// Dropping the guard releases the session. A session dropped in the middle
/// of an operation (cancelled future) is marked broken and reconnected on its
/// next acquire. Once the pool is closed, `close_all` closes the session as
/// soon as the guard is dropped.
pub struct PooledSession {
    entry: Option<OwnedMutexGuard<Entry>>,
    shared: Arc<Shared>,
}

impl PooledSession {
    /// Hand the session back to the pool
    pub fn release(self) {
        if let Some(entry) = &self.entry {
            debug!(
                "Releasing session {} ({})",
                entry.session.id(),
                entry.session.state()
            );
        }
    }
}

impl Deref for PooledSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        match &self.entry {
            Some(entry) => &entry.session,
            None => unreachable!("pooled session accessed after release"),
        }
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Session {
        match &mut self.entry {
            Some(entry) => &mut entry.session,
            None => unreachable!("pooled session accessed after release"),
        }
    }
}

impl fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entry {
            Some(entry) => f.debug_tuple("PooledSession").field(&entry.session).finish(),
            None => f.write_str("PooledSession(<released>)"),
        }
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        let Some(mut entry) = self.entry.take() else {
            return;
        };
        entry.settle();
        // Unlock before waking a waiter so it can evict this session
        drop(entry);
        self.shared.released.notify_one();
    }
}
