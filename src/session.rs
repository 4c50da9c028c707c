//! Logical sessions with backend tools.
//!
//! A session is one conversational context with a tool. It checks a
//! connection out of the [`ConnectionPool`] when it opens and holds it until
//! it closes, so the pool's `max_size` also bounds concurrent sessions per
//! tool.
//!
//! Lifecycle: `initializing -> connected -> healthy`, or
//! `initializing -> failed` when every connection attempt fails. Active
//! sessions end in `closing -> closed`, either on request or when the
//! periodic health check finds them idle or failing too often. A closed
//! session is never reopened.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::watch,
    time::{interval, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    core::{
        config::SessionSettings,
        history::BoundedHistory,
        metrics::{running_mean, CommandMetrics, CommandMetricsSnapshot, LatencySnapshot},
        reconnect::ReconnectionManager,
    },
    error::{ResourceError, ResourceResult},
    executor::{execute_isolated, Command, Dependencies, ExecutionOutput},
    gate::{ensure_enabled, flags},
    pool::{ConnectionPool, PooledConnection},
};

pub type SessionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Connecting. Never visible through the manager: a session is only
    /// stored once its connection is up.
    Initializing,
    Connected,
    Healthy,
    /// Connection lost; the health check tries to replace it
    Degraded,
    /// Every connection attempt failed. Reported to the caller as
    /// [`ResourceError::ConnectionFailed`] and counted in
    /// `failed_sessions`; no session is stored.
    Failed,
    Closing,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Connected => "connected",
            SessionStatus::Healthy => "healthy",
            SessionStatus::Degraded => "degraded",
            SessionStatus::Failed => "failed",
            SessionStatus::Closing => "closing",
            SessionStatus::Closed => "closed",
        }
    }

    pub fn accepts_commands(&self) -> bool {
        matches!(self, SessionStatus::Connected | SessionStatus::Healthy)
    }

    /// Still tracked by the health check.
    fn is_active(&self) -> bool {
        matches!(
            self,
            SessionStatus::Connected | SessionStatus::Healthy | SessionStatus::Degraded
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionOptions {
    /// Overrides `session.max_connection_attempts` for this session
    pub max_connection_attempts: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Requested,
    Idle,
    Unhealthy,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandRecord {
    pub command: Command,
    pub success: bool,
    pub duration_ms: u64,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounters {
    pub command_count: u64,
    pub error_count: u64,
    pub total_duration_ms: u64,
}

impl SessionCounters {
    pub fn error_rate(&self) -> f64 {
        if self.command_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.command_count as f64
        }
    }
}

struct Session {
    id: SessionId,
    tool: String,
    /// Creation order, for stable listings
    seq: u64,
    created_at: DateTime<Utc>,
    opened: Instant,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    status: SessionStatus,
    connection_attempts: u32,
    max_connection_attempts: u32,
    health_check_count: u64,
    history: BoundedHistory<CommandRecord>,
    counters: SessionCounters,
    connection: Option<PooledConnection>,
}

impl Session {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            tool: self.tool.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity_at,
            status: self.status,
            connection_attempts: self.connection_attempts,
            max_connection_attempts: self.max_connection_attempts,
            health_check_count: self.health_check_count,
            connection_id: self.connection.as_ref().map(|c| c.id().to_string()),
            metrics: self.counters,
            history: self.history.iter().cloned().collect(),
        }
    }
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub tool: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub status: SessionStatus,
    pub connection_attempts: u32,
    pub max_connection_attempts: u32,
    pub health_check_count: u64,
    pub connection_id: Option<String>,
    pub metrics: SessionCounters,
    /// Most recent commands, oldest first
    pub history: Vec<CommandRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosedSession {
    pub id: SessionId,
    pub tool: String,
    pub reason: CloseReason,
    pub duration_ms: u64,
    pub metrics: SessionCounters,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionHealthReport {
    pub checked: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub recovered: usize,
    pub closed_idle: usize,
    pub closed_unhealthy: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionMetrics {
    pub active_sessions: usize,
    pub total_created: u64,
    pub total_closed: u64,
    pub failed_sessions: u64,
    pub auto_closed_idle: u64,
    pub auto_closed_unhealthy: u64,
    pub recovered: u64,
    pub average_session_duration_ms: f64,
    pub commands: CommandMetricsSnapshot,
    /// Command latency per tool
    pub tool_latencies: BTreeMap<String, LatencySnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionManagerStatus {
    pub enabled: bool,
    pub active_sessions: usize,
    pub sessions_by_tool: BTreeMap<String, usize>,
    pub sessions_by_status: BTreeMap<SessionStatus, usize>,
    pub health_checks_run: u64,
    pub last_health_check: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct SessionAggregates {
    total_created: u64,
    total_closed: u64,
    failed_sessions: u64,
    auto_closed_idle: u64,
    auto_closed_unhealthy: u64,
    recovered: u64,
    average_session_duration_ms: f64,
    health_checks_run: u64,
    last_health_check: Option<DateTime<Utc>>,
}

enum HealthAction {
    Healthy,
    Close(CloseReason),
    Recover {
        tool: String,
        dead: Option<PooledConnection>,
    },
}

pub struct SessionManager {
    deps: Dependencies,
    pool: Arc<ConnectionPool>,
    settings: SessionSettings,
    sessions: DashMap<SessionId, Arc<Mutex<Session>>>,
    next_seq: AtomicU64,
    aggregates: Mutex<SessionAggregates>,
    command_metrics: CommandMetrics,
}

impl SessionManager {
    pub fn new(deps: Dependencies, pool: Arc<ConnectionPool>, settings: SessionSettings) -> Self {
        Self {
            deps,
            pool,
            settings,
            sessions: DashMap::new(),
            next_seq: AtomicU64::new(0),
            aggregates: Mutex::new(SessionAggregates::default()),
            command_metrics: CommandMetrics::new(),
        }
    }

    fn reconnection(&self, max_attempts: u32) -> ReconnectionManager {
        ReconnectionManager::new(
            max_attempts,
            Duration::from_millis(self.settings.retry_base_delay_ms),
            Duration::from_millis(self.settings.retry_max_delay_ms),
        )
    }

    /// Open a session, retrying the pooled connection up to the attempt cap.
    pub async fn create_session(
        &self,
        tool: &str,
        options: SessionOptions,
    ) -> ResourceResult<SessionId> {
        ensure_enabled(self.deps.gate.as_ref(), flags::SESSION_MANAGER)?;
        if !self.pool.has_tool(tool) {
            return Err(ResourceError::UnknownTool(tool.to_string()));
        }

        let max_attempts = options
            .max_connection_attempts
            .unwrap_or(self.settings.max_connection_attempts)
            .max(1);
        let attempts = AtomicU32::new(0);
        let attempts_made = &attempts;
        let pool = &self.pool;

        debug!(tool, max_attempts, "Opening session");
        let connected = self
            .reconnection(max_attempts)
            .connect(tool, move |attempt| {
                attempts_made.store(attempt, Ordering::Relaxed);
                pool.acquire(tool)
            })
            .await;

        let connection = match connected {
            Ok(conn) => conn,
            Err(e) => {
                self.aggregates.lock().failed_sessions += 1;
                warn!(
                    tool,
                    attempts = attempts.load(Ordering::Relaxed),
                    error = %e,
                    "Session failed to connect"
                );
                self.deps
                    .error_sink
                    .handle_error(&e, "session_manager.create_session");
                return Err(e);
            }
        };

        let id = uuid::Uuid::new_v4().to_string();
        let now = Instant::now();
        let session = Session {
            id: id.clone(),
            tool: tool.to_string(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            created_at: Utc::now(),
            opened: now,
            last_activity: now,
            last_activity_at: Utc::now(),
            status: SessionStatus::Connected,
            connection_attempts: attempts.load(Ordering::Relaxed),
            max_connection_attempts: max_attempts,
            health_check_count: 0,
            history: BoundedHistory::new(self.settings.history_limit),
            counters: SessionCounters::default(),
            connection: Some(connection),
        };
        self.sessions
            .insert(id.clone(), Arc::new(Mutex::new(session)));
        self.aggregates.lock().total_created += 1;

        info!(tool, session_id = %id, "Session connected");
        Ok(id)
    }

    /// Run a command in the context of an open session.
    ///
    /// A command that fails on the tool side is still `Ok`, with
    /// `success: false`; it counts toward the session's error rate.
    pub async fn execute_in_session(
        &self,
        session_id: &str,
        command: Command,
    ) -> ResourceResult<ExecutionOutput> {
        ensure_enabled(self.deps.gate.as_ref(), flags::SESSION_MANAGER)?;
        let session = self
            .sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ResourceError::SessionNotFound(session_id.to_string()))?;

        let tool = {
            let mut s = session.lock();
            if !s.status.accepts_commands() {
                return Err(ResourceError::SessionUnavailable {
                    id: session_id.to_string(),
                    status: s.status.to_string(),
                });
            }
            s.touch();
            s.tool.clone()
        };

        self.command_metrics.record_start();
        let started = Instant::now();
        let execution =
            execute_isolated(&self.deps, &tool, &command, "session_manager.execute").await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let output = execution.output;
        self.command_metrics
            .record_end(&tool, output.success, duration_ms);
        if execution.faulted {
            self.command_metrics.record_executor_error();
        }

        let mut s = session.lock();
        if matches!(s.status, SessionStatus::Closing | SessionStatus::Closed) {
            debug!(session_id, "Session closed while command was in flight");
            return Ok(output);
        }
        s.touch();
        s.counters.command_count += 1;
        s.counters.total_duration_ms += duration_ms;
        if !output.success {
            s.counters.error_count += 1;
        }
        s.history.push(CommandRecord {
            command,
            success: output.success,
            duration_ms,
            at: Utc::now(),
            error: output.error.clone(),
        });

        Ok(output)
    }

    fn is_unhealthy(&self, counters: &SessionCounters) -> bool {
        counters.command_count > self.settings.min_commands_for_health
            && counters.error_rate() > self.settings.max_error_rate
    }

    /// Evaluate every active session once: close idle or failing sessions,
    /// replace lost connections, mark the rest healthy.
    pub async fn run_health_check(&self) -> SessionHealthReport {
        let sessions: Vec<(SessionId, Arc<Mutex<Session>>)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        let threshold = self.settings.inactive_threshold();
        let mut report = SessionHealthReport::default();

        for (id, session) in sessions {
            let action = {
                let mut s = session.lock();
                if !s.status.is_active() {
                    continue;
                }
                s.health_check_count += 1;
                report.checked += 1;

                let connection_open = s
                    .connection
                    .as_ref()
                    .is_some_and(|conn| conn.link().is_open());
                if Instant::now().duration_since(s.last_activity) > threshold {
                    HealthAction::Close(CloseReason::Idle)
                } else if self.is_unhealthy(&s.counters) {
                    HealthAction::Close(CloseReason::Unhealthy)
                } else if !connection_open {
                    s.status = SessionStatus::Degraded;
                    HealthAction::Recover {
                        tool: s.tool.clone(),
                        dead: s.connection.take(),
                    }
                } else {
                    s.status = SessionStatus::Healthy;
                    HealthAction::Healthy
                }
            };

            match action {
                HealthAction::Healthy => report.healthy += 1,
                HealthAction::Close(reason) => {
                    if self.close_with_reason(&id, reason).await.is_ok() {
                        match reason {
                            CloseReason::Idle => report.closed_idle += 1,
                            _ => report.closed_unhealthy += 1,
                        }
                    }
                }
                HealthAction::Recover { tool, dead } => {
                    if self.recover(&id, &session, &tool, dead).await {
                        report.recovered += 1;
                    } else {
                        report.degraded += 1;
                    }
                }
            }
        }

        {
            let mut agg = self.aggregates.lock();
            agg.health_checks_run += 1;
            agg.last_health_check = Some(Utc::now());
        }
        if report.closed_idle + report.closed_unhealthy + report.degraded > 0 {
            info!(
                checked = report.checked,
                closed_idle = report.closed_idle,
                closed_unhealthy = report.closed_unhealthy,
                degraded = report.degraded,
                "Session health check complete"
            );
        }
        report
    }

    /// Swap a lost connection for a fresh one from the pool.
    async fn recover(
        &self,
        id: &str,
        session: &Arc<Mutex<Session>>,
        tool: &str,
        dead: Option<PooledConnection>,
    ) -> bool {
        if let Some(conn) = dead {
            self.pool.release(conn).await;
        }

        let conn = match self.pool.acquire(tool).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(tool, session_id = id, error = %e, "Session recovery failed");
                self.deps
                    .error_sink
                    .handle_error(&e, "session_manager.recover");
                return false;
            }
        };

        let leftover = {
            let mut s = session.lock();
            if s.status == SessionStatus::Degraded {
                s.connection = Some(conn);
                s.status = SessionStatus::Healthy;
                None
            } else {
                Some(conn)
            }
        };

        match leftover {
            Some(conn) => {
                self.pool.release(conn).await;
                false
            }
            None => {
                self.aggregates.lock().recovered += 1;
                info!(tool, session_id = id, "Session recovered with a new connection");
                true
            }
        }
    }

    pub async fn close_session(&self, session_id: &str) -> ResourceResult<ClosedSession> {
        self.close_with_reason(session_id, CloseReason::Requested)
            .await
    }

    async fn close_with_reason(
        &self,
        session_id: &str,
        reason: CloseReason,
    ) -> ResourceResult<ClosedSession> {
        let (_, session) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| ResourceError::SessionNotFound(session_id.to_string()))?;

        let (connection, closed) = {
            let mut s = session.lock();
            s.status = SessionStatus::Closing;
            let closed = ClosedSession {
                id: s.id.clone(),
                tool: s.tool.clone(),
                reason,
                duration_ms: s.opened.elapsed().as_millis() as u64,
                metrics: s.counters,
            };
            (s.connection.take(), closed)
        };

        if let Some(conn) = connection {
            self.pool.release(conn).await;
        }
        session.lock().status = SessionStatus::Closed;

        {
            let mut agg = self.aggregates.lock();
            agg.total_closed += 1;
            agg.average_session_duration_ms = running_mean(
                agg.average_session_duration_ms,
                closed.duration_ms as f64,
                agg.total_closed,
            );
            match reason {
                CloseReason::Idle => agg.auto_closed_idle += 1,
                CloseReason::Unhealthy => agg.auto_closed_unhealthy += 1,
                CloseReason::Requested | CloseReason::Shutdown => {}
            }
        }

        info!(
            tool = %closed.tool,
            session_id,
            reason = ?reason,
            duration_ms = closed.duration_ms,
            "Session closed"
        );
        Ok(closed)
    }

    /// Close every session one after another. In-flight commands finish but
    /// their results no longer update the closed session.
    pub async fn close_all_sessions(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for id in ids {
            if self
                .close_with_reason(&id, CloseReason::Shutdown)
                .await
                .is_ok()
            {
                closed += 1;
            }
        }
        info!(closed, "Closed all sessions");
        closed
    }

    fn snapshot_sessions(&self) -> Vec<(u64, SessionInfo)> {
        let sessions: Vec<Arc<Mutex<Session>>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut infos: Vec<(u64, SessionInfo)> = sessions
            .iter()
            .map(|session| {
                let s = session.lock();
                (s.seq, s.info())
            })
            .collect();
        infos.sort_by_key(|(seq, _)| *seq);
        infos
    }

    /// Active sessions in creation order.
    pub fn get_active_sessions(&self) -> Vec<SessionInfo> {
        self.snapshot_sessions()
            .into_iter()
            .map(|(_, info)| info)
            .collect()
    }

    pub fn get_session(&self, session_id: &str) -> Option<SessionInfo> {
        let session = self.sessions.get(session_id)?;
        let info = session.lock().info();
        Some(info)
    }

    pub fn get_session_metrics(&self) -> SessionMetrics {
        let agg = self.aggregates.lock();
        SessionMetrics {
            active_sessions: self.sessions.len(),
            total_created: agg.total_created,
            total_closed: agg.total_closed,
            failed_sessions: agg.failed_sessions,
            auto_closed_idle: agg.auto_closed_idle,
            auto_closed_unhealthy: agg.auto_closed_unhealthy,
            recovered: agg.recovered,
            average_session_duration_ms: agg.average_session_duration_ms,
            commands: self.command_metrics.snapshot(),
            tool_latencies: self.command_metrics.tool_latencies(),
        }
    }

    pub fn command_metrics(&self) -> &CommandMetrics {
        &self.command_metrics
    }

    pub fn get_status(&self) -> SessionManagerStatus {
        let mut sessions_by_tool = BTreeMap::new();
        let mut sessions_by_status = BTreeMap::new();
        let sessions = self.snapshot_sessions();
        for (_, info) in &sessions {
            *sessions_by_tool.entry(info.tool.clone()).or_insert(0) += 1;
            *sessions_by_status.entry(info.status).or_insert(0) += 1;
        }

        let agg = self.aggregates.lock();
        SessionManagerStatus {
            enabled: self.deps.gate.is_enabled(flags::SESSION_MANAGER),
            active_sessions: sessions.len(),
            sessions_by_tool,
            sessions_by_status,
            health_checks_run: agg.health_checks_run,
            last_health_check: agg.last_health_check,
        }
    }

    /// Periodic health-check loop; stops when `shutdown_rx` changes.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval_timer = interval(self.settings.health_check_interval());
        info!(
            "Starting session health task with {:?} interval",
            self.settings.health_check_interval()
        );

        loop {
            tokio::select! {
                _ = interval_timer.tick() => {
                    self.run_health_check().await;
                }
                _ = shutdown_rx.changed() => {
                    info!("Session health task received shutdown signal");
                    break;
                }
            }
        }
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("active_sessions", &self.sessions.len())
            .finish()
    }
}
