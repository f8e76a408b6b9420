//! Profile-keyed async connection pool.
//!
//! The pool owns every physical connection. Callers receive a [`Lease`], a
//! non-owning handle that goes back to the pool exactly once: through
//! [`ConnectionPool::release`], [`Lease::discard`], or on drop.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::sync::futures::OwnedNotified;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};

use crate::cancel::CancelToken;
use crate::driver::{BackendPid, DriverError, SqlConnection, SqlDriver};
use crate::profile::{ProfileId, ProfileStore};

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub max_per_profile: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    /// Reused connections idle at least this long are pinged first.
    pub probe_after: Duration,
    pub probe_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_profile: 5,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            probe_after: Duration::ZERO,
            probe_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("could not connect to '{profile}': {source}")]
    ConnectFailed {
        profile: ProfileId,
        #[source]
        source: DriverError,
    },
    #[error("no free connection for '{profile}' within {waited_ms}ms")]
    PoolExhausted { profile: ProfileId, waited_ms: u64 },
    #[error("acquire cancelled")]
    Cancelled,
    #[error("connection pool is closed")]
    Closed,
    #[error("unknown connection profile '{0}'")]
    UnknownProfile(ProfileId),
}

impl PoolError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::PoolExhausted { .. })
    }
}

struct Entry {
    profile: ProfileId,
    conn: Arc<dyn SqlConnection>,
    leased: bool,
    last_used: Instant,
}

#[derive(Default)]
struct ProfileSlot {
    pending: usize,
    available: Arc<Notify>,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<u64, Entry>,
    slots: HashMap<ProfileId, ProfileSlot>,
    next_id: u64,
    closed: bool,
}

impl PoolState {
    fn open_for(&self, profile: &str) -> usize {
        let live = self
            .entries
            .values()
            .filter(|entry| entry.profile == profile)
            .count();
        live + self.slots.get(profile).map_or(0, |slot| slot.pending)
    }

    fn take_free(&mut self, profile: &str) -> Option<(u64, Arc<dyn SqlConnection>, Duration)> {
        let (id, entry) = self
            .entries
            .iter_mut()
            .filter(|(_, entry)| !entry.leased && entry.profile == profile)
            .max_by_key(|(_, entry)| entry.last_used)?;
        entry.leased = true;
        Some((*id, Arc::clone(&entry.conn), entry.last_used.elapsed()))
    }

    fn slot(&mut self, profile: &str) -> &mut ProfileSlot {
        self.slots.entry(profile.to_string()).or_default()
    }
}

enum Step {
    Reuse {
        id: u64,
        conn: Arc<dyn SqlConnection>,
        idle: Duration,
    },
    Open,
    /// Registered before the state lock is released.
    Wait(Pin<Box<OwnedNotified>>),
}

#[derive(Default)]
struct Counters {
    acquires: AtomicU64,
    connects: AtomicU64,
    connect_failures: AtomicU64,
    exhausted: AtomicU64,
    discards: AtomicU64,
    probe_failures: AtomicU64,
    idle_closed: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct ProfilePoolStats {
    pub profile: ProfileId,
    pub leased: usize,
    pub free: usize,
    pub pending: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub acquires: u64,
    pub connects: u64,
    pub connect_failures: u64,
    pub exhausted: u64,
    pub discards: u64,
    pub probe_failures: u64,
    pub idle_closed: u64,
    pub profiles: Vec<ProfilePoolStats>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseFailure {
    pub profile: ProfileId,
    pub pid: BackendPid,
    pub error: DriverError,
}

/// Outcome of [`ConnectionPool::close_all`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloseReport {
    pub attempted: usize,
    pub failures: Vec<CloseFailure>,
}

pub struct ConnectionPool {
    config: PoolConfig,
    driver: Arc<dyn SqlDriver>,
    profiles: Arc<dyn ProfileStore>,
    state: Mutex<PoolState>,
    counters: Counters,
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        driver: Arc<dyn SqlDriver>,
        profiles: Arc<dyn ProfileStore>,
    ) -> Arc<Self> {
        let config = PoolConfig {
            max_per_profile: config.max_per_profile.max(1),
            ..config
        };
        Arc::new(Self {
            config,
            driver,
            profiles,
            state: Mutex::new(PoolState::default()),
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn acquire(self: &Arc<Self>, profile_id: &str) -> Result<Lease, PoolError> {
        self.acquire_with_cancel(profile_id, None).await
    }

    /// Leases a connection for `profile_id`, reusing a free one when it passes
    /// the liveness probe and opening a new one while under the per-profile
    /// cap. Waits up to `acquire_timeout` for a release otherwise.
    pub async fn acquire_with_cancel(
        self: &Arc<Self>,
        profile_id: &str,
        cancel: Option<&CancelToken>,
    ) -> Result<Lease, PoolError> {
        self.counters.acquires.fetch_add(1, Ordering::Relaxed);
        let profile = self
            .profiles
            .connection(profile_id)
            .ok_or_else(|| PoolError::UnknownProfile(profile_id.to_string()))?;
        let started = Instant::now();
        let deadline = started + self.config.acquire_timeout;
        loop {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(PoolError::Cancelled);
            }
            let step = {
                let mut state = self.lock();
                if state.closed {
                    return Err(PoolError::Closed);
                }
                if let Some((id, conn, idle)) = state.take_free(profile_id) {
                    Step::Reuse { id, conn, idle }
                } else if state.open_for(profile_id) < self.config.max_per_profile {
                    state.slot(profile_id).pending += 1;
                    Step::Open
                } else {
                    let mut waiter =
                        Box::pin(Arc::clone(&state.slot(profile_id).available).notified_owned());
                    waiter.as_mut().enable();
                    Step::Wait(waiter)
                }
            };

            let waiter = match step {
                Step::Reuse { id, conn, idle } => {
                    if let Some(lease) = self.probe(profile_id, id, conn, idle).await {
                        return Ok(lease);
                    }
                    continue;
                }
                Step::Open => return self.open(&profile).await,
                Step::Wait(waiter) => waiter,
            };

            let cancelled = async {
                match cancel {
                    Some(token) => token.cancelled().await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = waiter => {}
                _ = cancelled => return Err(PoolError::Cancelled),
                _ = sleep_until(deadline) => {
                    self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                    let waited_ms = started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64;
                    tracing::debug!(profile = profile_id, waited_ms, "connection pool exhausted");
                    return Err(PoolError::PoolExhausted {
                        profile: profile_id.to_string(),
                        waited_ms,
                    });
                }
            }
        }
    }

    async fn probe(
        self: &Arc<Self>,
        profile_id: &str,
        id: u64,
        conn: Arc<dyn SqlConnection>,
        idle: Duration,
    ) -> Option<Lease> {
        if idle >= self.config.probe_after {
            let healthy = matches!(
                timeout(self.config.probe_timeout, conn.ping()).await,
                Ok(Ok(()))
            );
            if !healthy {
                self.counters.probe_failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    profile = profile_id,
                    pid = conn.backend_pid(),
                    "dropping pooled connection that failed its liveness probe"
                );
                self.remove(id);
                let _ = conn.close().await;
                return None;
            }
        }
        Some(self.lease(id, profile_id, conn))
    }

    async fn open(
        self: &Arc<Self>,
        profile: &crate::profile::ConnectionProfile,
    ) -> Result<Lease, PoolError> {
        let connected = match timeout(self.config.connect_timeout, self.driver.connect(profile)).await
        {
            Ok(result) => result,
            Err(_) => Err(DriverError::Connect(format!(
                "timed out after {}ms",
                self.config.connect_timeout.as_millis()
            ))),
        };
        let registered = {
            let mut state = self.lock();
            let slot = state.slot(&profile.id);
            slot.pending = slot.pending.saturating_sub(1);
            match connected {
                Ok(conn) => {
                    let conn: Arc<dyn SqlConnection> = Arc::from(conn);
                    if state.closed {
                        Err(conn)
                    } else {
                        let id = state.next_id;
                        state.next_id += 1;
                        state.entries.insert(
                            id,
                            Entry {
                                profile: profile.id.clone(),
                                conn: Arc::clone(&conn),
                                leased: true,
                                last_used: Instant::now(),
                            },
                        );
                        Ok((id, conn))
                    }
                }
                Err(source) => {
                    state.slot(&profile.id).available.notify_one();
                    self.counters.connect_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(profile = %profile.id, error = %source, "connect failed");
                    return Err(PoolError::ConnectFailed {
                        profile: profile.id.clone(),
                        source,
                    });
                }
            }
        };
        match registered {
            Ok((id, conn)) => {
                self.counters.connects.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    profile = %profile.id,
                    pid = conn.backend_pid(),
                    driver = self.driver.name(),
                    "opened connection"
                );
                Ok(self.lease(id, &profile.id, conn))
            }
            Err(orphan) => {
                let _ = orphan.close().await;
                Err(PoolError::Closed)
            }
        }
    }

    fn lease(self: &Arc<Self>, id: u64, profile_id: &str, conn: Arc<dyn SqlConnection>) -> Lease {
        Lease {
            pool: Arc::clone(self),
            id,
            profile: profile_id.to_string(),
            conn: Some(conn),
        }
    }

    /// Returns a lease to the pool. Equivalent to dropping it.
    pub fn release(&self, lease: Lease) {
        drop(lease);
    }

    fn release_entry(&self, id: u64) {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(&id) else {
            return;
        };
        entry.leased = false;
        entry.last_used = Instant::now();
        let profile = entry.profile.clone();
        state.slot(&profile).available.notify_one();
    }

    fn remove(&self, id: u64) -> Option<Arc<dyn SqlConnection>> {
        let mut state = self.lock();
        let entry = state.entries.remove(&id)?;
        state.slot(&entry.profile).available.notify_one();
        Some(entry.conn)
    }

    /// Closes free connections idle past `idle_timeout`. Returns how many
    /// were closed.
    pub async fn sweep_idle(&self) -> usize {
        let expired: Vec<Arc<dyn SqlConnection>> = {
            let mut state = self.lock();
            let idle_timeout = self.config.idle_timeout;
            let ids: Vec<u64> = state
                .entries
                .iter()
                .filter(|(_, entry)| !entry.leased && entry.last_used.elapsed() >= idle_timeout)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.entries.remove(&id))
                .map(|entry| entry.conn)
                .collect()
        };
        let count = expired.len();
        for conn in expired {
            if let Err(err) = conn.close().await {
                tracing::debug!(pid = conn.backend_pid(), error = %err, "idle close failed");
            }
        }
        if count > 0 {
            self.counters
                .idle_closed
                .fetch_add(count as u64, Ordering::Relaxed);
            tracing::debug!(closed = count, "idle sweep");
        }
        count
    }

    /// Runs [`ConnectionPool::sweep_idle`] every `every` until the pool is
    /// dropped or closed.
    pub fn spawn_idle_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else {
                    break;
                };
                if pool.is_closed() {
                    break;
                }
                pool.sweep_idle().await;
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Closes every connection, leased or free. Individual failures are
    /// collected and logged; this never returns early.
    pub async fn close_all(&self) -> CloseReport {
        let drained: Vec<(ProfileId, Arc<dyn SqlConnection>)> = {
            let mut state = self.lock();
            state.closed = true;
            for slot in state.slots.values() {
                slot.available.notify_waiters();
            }
            state
                .entries
                .drain()
                .map(|(_, entry)| (entry.profile, entry.conn))
                .collect()
        };
        let mut report = CloseReport {
            attempted: drained.len(),
            failures: Vec::new(),
        };
        for (profile, conn) in drained {
            if let Err(error) = conn.close().await {
                report.failures.push(CloseFailure {
                    profile,
                    pid: conn.backend_pid(),
                    error,
                });
            }
        }
        for failure in &report.failures {
            tracing::warn!(
                profile = %failure.profile,
                pid = failure.pid,
                error = %failure.error,
                "failed to close connection during shutdown"
            );
        }
        tracing::info!(
            attempted = report.attempted,
            failed = report.failures.len(),
            "connection pool closed"
        );
        report
    }

    pub fn leased_count(&self, profile_id: &str) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|entry| entry.leased && entry.profile == profile_id)
            .count()
    }

    pub fn free_count(&self, profile_id: &str) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|entry| !entry.leased && entry.profile == profile_id)
            .count()
    }

    pub fn stats(&self) -> PoolStats {
        let mut profiles: HashMap<ProfileId, ProfilePoolStats> = HashMap::new();
        {
            let state = self.lock();
            for entry in state.entries.values() {
                let stats = profiles
                    .entry(entry.profile.clone())
                    .or_insert_with(|| ProfilePoolStats {
                        profile: entry.profile.clone(),
                        ..ProfilePoolStats::default()
                    });
                if entry.leased {
                    stats.leased += 1;
                } else {
                    stats.free += 1;
                }
            }
            for (profile, slot) in &state.slots {
                if slot.pending > 0 {
                    profiles
                        .entry(profile.clone())
                        .or_insert_with(|| ProfilePoolStats {
                            profile: profile.clone(),
                            ..ProfilePoolStats::default()
                        })
                        .pending = slot.pending;
                }
            }
        }
        let mut profiles: Vec<ProfilePoolStats> = profiles.into_values().collect();
        profiles.sort_by(|a, b| a.profile.cmp(&b.profile));
        PoolStats {
            acquires: self.counters.acquires.load(Ordering::Relaxed),
            connects: self.counters.connects.load(Ordering::Relaxed),
            connect_failures: self.counters.connect_failures.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
            discards: self.counters.discards.load(Ordering::Relaxed),
            probe_failures: self.counters.probe_failures.load(Ordering::Relaxed),
            idle_closed: self.counters.idle_closed.load(Ordering::Relaxed),
            profiles,
        }
    }
}

/// A leased connection that returns to its pool on drop.
pub struct Lease {
    pool: Arc<ConnectionPool>,
    id: u64,
    profile: ProfileId,
    conn: Option<Arc<dyn SqlConnection>>,
}

impl Lease {
    pub fn connection(&self) -> &dyn SqlConnection {
        match self.conn.as_deref() {
            Some(conn) => conn,
            // `conn` is only taken by `discard` and `drop`, both of which consume the lease.
            None => unreachable!("lease used after release"),
        }
    }

    pub fn backend_pid(&self) -> BackendPid {
        self.connection().backend_pid()
    }

    pub fn profile_id(&self) -> &str {
        &self.profile
    }

    /// Removes the connection from the pool and closes it instead of
    /// returning it for reuse.
    pub async fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.counters.discards.fetch_add(1, Ordering::Relaxed);
            self.pool.remove(self.id);
            tracing::debug!(profile = %self.profile, pid = conn.backend_pid(), "discarding connection");
            if let Err(err) = conn.close().await {
                tracing::debug!(pid = conn.backend_pid(), error = %err, "close after discard failed");
            }
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            self.pool.release_entry(self.id);
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("profile", &self.profile)
            .field("id", &self.id)
            .finish()
    }
}
