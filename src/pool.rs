//! Per-tool connection pool.
//!
//! Keeps between `min_size` and `max_size` connections per tool. Callers
//! check a [`PooledConnection`] out with [`ConnectionPool::acquire`] and hand
//! it back with [`ConnectionPool::release`]; the value moves between the
//! pool and its holder, so a connection is never held twice.
//!
//! A periodic health pass evicts idle connections and tops the pool back up
//! to `min_size`. Slots are reserved under the tool's lock before dialing so
//! concurrent acquires and health passes can never overshoot `max_size`.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use scopeguard::ScopeGuard;
use serde::Serialize;
use tokio::{
    sync::{watch, Notify},
    time::{interval, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    core::config::{PoolSettings, ToolConfig, ToolPoolLimits},
    error::{ResourceError, ResourceResult},
    executor::{Dependencies, ToolConnection},
    gate::{ensure_enabled, flags},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Available,
    InUse,
    Closed,
}

/// A connection checked out of (or parked in) the pool.
pub struct PooledConnection {
    id: String,
    tool: String,
    created_at: DateTime<Utc>,
    last_used: Instant,
    use_count: u64,
    status: ConnectionStatus,
    link: Arc<dyn ToolConnection>,
}

impl PooledConnection {
    fn new(tool: &str, link: Arc<dyn ToolConnection>, status: ConnectionStatus) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tool: tool.to_string(),
            created_at: Utc::now(),
            last_used: Instant::now(),
            use_count: 0,
            status,
            link,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn link(&self) -> &Arc<dyn ToolConnection> {
        &self.link
    }

    fn checkout(&mut self) {
        self.status = ConnectionStatus::InUse;
        self.use_count += 1;
        self.last_used = Instant::now();
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("tool", &self.tool)
            .field("use_count", &self.use_count)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PoolCounters {
    created: u64,
    destroyed: u64,
    borrowed: u64,
    returned: u64,
    errors: u64,
}

/// Pool state for one tool. Guarded by its own mutex.
struct ToolPool {
    limits: ToolPoolLimits,
    available: VecDeque<PooledConnection>,
    in_use: HashMap<String, DateTime<Utc>>,
    /// Slots reserved for connections currently being dialed
    pending: usize,
    counters: PoolCounters,
}

impl ToolPool {
    fn new(limits: ToolPoolLimits) -> Self {
        Self {
            limits,
            available: VecDeque::new(),
            in_use: HashMap::new(),
            pending: 0,
            counters: PoolCounters::default(),
        }
    }

    fn size(&self) -> usize {
        self.available.len() + self.in_use.len() + self.pending
    }

    fn lend(&mut self, mut conn: PooledConnection) -> PooledConnection {
        conn.checkout();
        self.in_use.insert(conn.id.clone(), conn.created_at);
        self.counters.borrowed += 1;
        conn
    }
}

/// Slots counted in `pending` while their connections are being dialed.
struct SlotReservation<'a> {
    pool: &'a Mutex<ToolPool>,
    released: &'a Notify,
    slots: usize,
}

/// Hands back every slot not yet settled when dropped, so an acquire or
/// health pass cancelled mid-dial never leaks capacity.
type ReservationGuard<'a> = ScopeGuard<SlotReservation<'a>, fn(SlotReservation<'a>)>;

impl<'a> SlotReservation<'a> {
    /// Reserve `slots` under an already held lock.
    fn reserve(
        pool: &'a Mutex<ToolPool>,
        released: &'a Notify,
        state: &mut ToolPool,
        slots: usize,
    ) -> ReservationGuard<'a> {
        state.pending += slots;
        scopeguard::guard(
            Self {
                pool,
                released,
                slots,
            },
            Self::cancel as fn(SlotReservation<'a>),
        )
    }

    /// Consume one slot; the caller either parks a connection or records
    /// the failure in the same critical section.
    fn settle(&mut self, state: &mut ToolPool) {
        if self.slots > 0 {
            self.slots -= 1;
            state.pending -= 1;
        }
    }

    fn cancel(self) {
        if self.slots == 0 {
            return;
        }
        {
            let mut state = self.pool.lock();
            state.pending = state.pending.saturating_sub(self.slots);
        }
        self.released.notify_waiters();
    }
}

/// Point-in-time view of one tool's pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub tool: String,
    pub available: usize,
    pub in_use: usize,
    pub pending: usize,
    pub size: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub idle_timeout_secs: u64,
    pub created: u64,
    pub destroyed: u64,
    pub borrowed: u64,
    pub returned: u64,
    pub errors: u64,
}

/// Outcome of one health pass across all tools.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PoolHealthReport {
    pub evicted: usize,
    pub replenished: usize,
    pub failed: usize,
}

pub struct ConnectionPool {
    deps: Dependencies,
    settings: PoolSettings,
    pools: DashMap<String, Arc<Mutex<ToolPool>>>,
    released: Notify,
    draining: AtomicBool,
}

impl ConnectionPool {
    pub fn new(deps: Dependencies, settings: PoolSettings) -> Self {
        Self {
            deps,
            settings,
            pools: DashMap::new(),
            released: Notify::new(),
            draining: AtomicBool::new(false),
        }
    }

    /// Register tools. Re-initializing a tool updates its limits and keeps
    /// its connections.
    pub fn initialize(&self, tools: &[ToolConfig]) {
        for tool in tools {
            self.pools
                .entry(tool.name.clone())
                .and_modify(|pool| pool.lock().limits = tool.pool)
                .or_insert_with(|| Arc::new(Mutex::new(ToolPool::new(tool.pool))));
            debug!(
                tool = %tool.name,
                min_size = tool.pool.min_size,
                max_size = tool.pool.max_size,
                "Initialized connection pool"
            );
        }
    }

    pub fn has_tool(&self, tool: &str) -> bool {
        self.pools.contains_key(tool)
    }

    fn tool_pool(&self, tool: &str) -> ResourceResult<Arc<Mutex<ToolPool>>> {
        self.pools
            .get(tool)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ResourceError::UnknownTool(tool.to_string()))
    }

    /// Dial a new connection. The result is not inserted into the pool.
    pub async fn create_connection(&self, tool: &str) -> ResourceResult<PooledConnection> {
        let link = self.dial(tool).await?;
        Ok(PooledConnection::new(tool, link, ConnectionStatus::Available))
    }

    async fn dial(&self, tool: &str) -> ResourceResult<Arc<dyn ToolConnection>> {
        let timeout = self.settings.connect_timeout();
        match tokio::time::timeout(timeout, self.deps.connector.connect(tool)).await {
            Ok(result) => result,
            Err(_) => Err(ResourceError::ConnectionFailed {
                tool: tool.to_string(),
                attempts: 1,
                details: format!("connect timed out after {:?}", timeout),
            }),
        }
    }

    /// Check out a connection, dialing one on demand while below `max_size`.
    ///
    /// Returns [`ResourceError::PoolExhausted`] at capacity. A failed dial is
    /// not retried here; the next health pass replaces missing connections.
    pub async fn acquire(&self, tool: &str) -> ResourceResult<PooledConnection> {
        ensure_enabled(self.deps.gate.as_ref(), flags::CONNECTION_POOL)?;
        if self.draining.load(Ordering::Acquire) {
            return Err(ResourceError::Disabled(format!(
                "{} (draining)",
                flags::CONNECTION_POOL
            )));
        }
        let pool = self.tool_pool(tool)?;

        let mut reservation = {
            let mut state = pool.lock();
            if let Some(conn) = state.available.pop_back() {
                return Ok(state.lend(conn));
            }
            if state.size() >= state.limits.max_size {
                debug!(tool, size = state.size(), "Connection pool exhausted");
                return Err(ResourceError::PoolExhausted(tool.to_string()));
            }
            SlotReservation::reserve(&pool, &self.released, &mut state, 1)
        };

        match self.dial(tool).await {
            Ok(link) => {
                let conn = PooledConnection::new(tool, link, ConnectionStatus::Available);
                let mut state = pool.lock();
                reservation.settle(&mut state);
                state.counters.created += 1;
                debug!(tool, connection = %conn.id, "Created connection on demand");
                Ok(state.lend(conn))
            }
            Err(e) => {
                {
                    let mut state = pool.lock();
                    reservation.settle(&mut state);
                    state.counters.errors += 1;
                }
                // The freed slot may let a waiter dial
                self.released.notify_waiters();
                self.deps
                    .error_sink
                    .handle_error(&e, "connection_pool.acquire");
                Err(match e {
                    ResourceError::ConnectionFailed { .. } => e,
                    other => ResourceError::ConnectionFailed {
                        tool: tool.to_string(),
                        attempts: 1,
                        details: other.to_string(),
                    },
                })
            }
        }
    }

    /// Like [`acquire`](Self::acquire) but waits up to `wait` for a release
    /// when the pool is at capacity.
    pub async fn acquire_timeout(
        &self,
        tool: &str,
        wait: Duration,
    ) -> ResourceResult<PooledConnection> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.acquire(tool).await {
                Err(ResourceError::PoolExhausted(_)) => {}
                other => return other,
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(ResourceError::PoolExhausted(tool.to_string()));
            }
        }
    }

    /// Return a checked-out connection to the pool.
    pub async fn release(&self, mut conn: PooledConnection) {
        let pool = match self.tool_pool(&conn.tool) {
            Ok(pool) => pool,
            Err(_) => {
                warn!(tool = %conn.tool, "Released connection for unknown tool, closing");
                conn.link.close().await;
                return;
            }
        };

        let to_close = {
            let mut state = pool.lock();
            if state.in_use.remove(&conn.id).is_none() {
                warn!(
                    tool = %conn.tool,
                    connection = %conn.id,
                    "Released connection not checked out from this pool"
                );
                return;
            }

            if self.draining.load(Ordering::Acquire) || !conn.link.is_open() {
                state.counters.destroyed += 1;
                conn.status = ConnectionStatus::Closed;
                Some(conn)
            } else {
                conn.status = ConnectionStatus::Available;
                conn.last_used = Instant::now();
                state.counters.returned += 1;
                state.available.push_back(conn);
                None
            }
        };

        if let Some(conn) = to_close {
            debug!(tool = %conn.tool, connection = %conn.id, "Destroying released connection");
            conn.link.close().await;
        }
        self.released.notify_waiters();
    }

    /// Evict idle or closed connections, then refill every tool to `min_size`.
    pub async fn run_health_check(&self) -> PoolHealthReport {
        let mut report = PoolHealthReport::default();
        if self.draining.load(Ordering::Acquire) {
            return report;
        }

        let pools: Vec<(String, Arc<Mutex<ToolPool>>)> = self
            .pools
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        for (tool, pool) in pools {
            let (evicted, mut reservation) = {
                let mut state = pool.lock();
                let now = Instant::now();
                let idle_timeout = state.limits.idle_timeout();

                let (keep, evicted): (VecDeque<_>, VecDeque<_>) =
                    state.available.drain(..).partition(|conn| {
                        conn.link.is_open() && now.duration_since(conn.last_used) <= idle_timeout
                    });
                state.available = keep;
                state.counters.destroyed += evicted.len() as u64;

                let size = state.size();
                let deficit = state
                    .limits
                    .min_size
                    .saturating_sub(size)
                    .min(state.limits.max_size.saturating_sub(size));
                let reservation =
                    SlotReservation::reserve(&pool, &self.released, &mut state, deficit);
                (evicted, reservation)
            };

            if !evicted.is_empty() {
                info!(tool = %tool, count = evicted.len(), "Evicted idle connections");
            }
            report.evicted += evicted.len();
            for conn in evicted {
                conn.link.close().await;
            }

            let deficit = reservation.slots;
            if deficit == 0 {
                continue;
            }

            let results = join_all((0..deficit).map(|_| self.dial(&tool))).await;
            let mut failures = Vec::new();
            {
                let mut state = pool.lock();
                for result in results {
                    reservation.settle(&mut state);
                    match result {
                        Ok(link) => {
                            state.counters.created += 1;
                            state
                                .available
                                .push_back(PooledConnection::new(&tool, link, ConnectionStatus::Available));
                            report.replenished += 1;
                        }
                        Err(e) => {
                            state.counters.errors += 1;
                            report.failed += 1;
                            failures.push(e);
                        }
                    }
                }
            }

            for e in &failures {
                self.deps
                    .error_sink
                    .handle_error(e, "connection_pool.health_check");
            }
            if report.replenished > 0 {
                self.released.notify_waiters();
            }
        }

        if report != PoolHealthReport::default() {
            debug!(
                evicted = report.evicted,
                replenished = report.replenished,
                failed = report.failed,
                "Pool health pass complete"
            );
        }
        report
    }

    pub fn get_pool_stats(&self, tool: &str) -> Option<PoolStats> {
        let pool = self.pools.get(tool)?;
        let state = pool.lock();
        Some(PoolStats {
            tool: tool.to_string(),
            available: state.available.len(),
            in_use: state.in_use.len(),
            pending: state.pending,
            size: state.size(),
            min_size: state.limits.min_size,
            max_size: state.limits.max_size,
            idle_timeout_secs: state.limits.idle_timeout,
            created: state.counters.created,
            destroyed: state.counters.destroyed,
            borrowed: state.counters.borrowed,
            returned: state.counters.returned,
            errors: state.counters.errors,
        })
    }

    pub fn get_all_pool_stats(&self) -> BTreeMap<String, PoolStats> {
        let tools: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        tools
            .into_iter()
            .filter_map(|tool| self.get_pool_stats(&tool).map(|stats| (tool, stats)))
            .collect()
    }

    /// Close all parked connections and refuse new checkouts. Connections
    /// still checked out are closed as they are released.
    pub async fn shutdown(&self) -> usize {
        self.draining.store(true, Ordering::Release);

        let mut closing = Vec::new();
        let mut outstanding = 0;
        for entry in self.pools.iter() {
            let mut state = entry.value().lock();
            state.counters.destroyed += state.available.len() as u64;
            outstanding += state.in_use.len();
            closing.extend(state.available.drain(..));
        }

        let closed = closing.len();
        for conn in closing {
            conn.link.close().await;
        }
        info!(closed, outstanding, "Connection pool drained");
        self.released.notify_waiters();
        closed
    }

    /// Periodic health loop; stops when `shutdown_rx` changes.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval_timer = interval(self.settings.health_check_interval());
        info!(
            "Starting connection pool health task with {:?} interval",
            self.settings.health_check_interval()
        );

        loop {
            tokio::select! {
                _ = interval_timer.tick() => {
                    self.run_health_check().await;
                }
                _ = shutdown_rx.changed() => {
                    info!("Connection pool health task received shutdown signal");
                    break;
                }
            }
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("tools", &self.pools.len())
            .field("draining", &self.draining.load(Ordering::Relaxed))
            .finish()
    }
}
