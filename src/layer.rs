//! Composition of the four managers.
//!
//! [`ResourceLayer`] owns one instance of each manager, built once from a
//! [`ResourceConfig`] and a shared set of [`Dependencies`]. Background loops
//! run only after [`ResourceLayer::start`]; the returned [`LayerHandle`]
//! stops them.
//!
//! When construction fails a host can fall back to [`ResourceLayer::inert`]:
//! same API, no tools, every gate closed.

use std::{collections::BTreeMap, sync::Arc};

use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, info, warn};

use crate::{
    cache::{CacheManager, CacheStats},
    core::config::ResourceConfig,
    error::ResourceResult,
    executor::Dependencies,
    gate::{AllDisabled, LayeredGate, StaticFeatureGate},
    pool::{ConnectionPool, PoolStats},
    queue::{CommandQueue, QueueStatus},
    session::{SessionInfo, SessionManager, SessionManagerStatus, SessionMetrics},
};

/// Aggregated read-only snapshot of every manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerStatus {
    pub tools: Vec<String>,
    pub sessions: SessionManagerStatus,
    pub active_sessions: Vec<SessionInfo>,
    pub session_metrics: SessionMetrics,
    pub queues: BTreeMap<String, QueueStatus>,
    pub pools: BTreeMap<String, PoolStats>,
    pub caches: BTreeMap<String, CacheStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownSummary {
    pub sessions_closed: usize,
    pub queue_items_dropped: usize,
    pub connections_closed: usize,
}

pub struct ResourceLayer {
    config: ResourceConfig,
    deps: Dependencies,
    pool: Arc<ConnectionPool>,
    queue: Arc<CommandQueue>,
    cache: Arc<CacheManager>,
    sessions: Arc<SessionManager>,
}

impl ResourceLayer {
    /// Validate `config` and build every manager with its tools initialized.
    pub fn new(config: ResourceConfig, deps: Dependencies) -> ResourceResult<Self> {
        config.validate()?;

        let deps = if config.features.disabled.is_empty() {
            deps
        } else {
            let gate = LayeredGate::new(
                StaticFeatureGate::from_config(&config.features),
                Arc::clone(&deps.gate),
            );
            deps.with_gate(Arc::new(gate))
        };

        let layer = Self::build(config, deps);
        info!(tools = ?layer.config.tool_names(), "Resource layer initialized");
        Ok(layer)
    }

    /// A layer with no tools and every feature disabled.
    pub fn inert(deps: Dependencies) -> Self {
        Self::build(
            ResourceConfig::default(),
            deps.with_gate(Arc::new(AllDisabled)),
        )
    }

    /// [`new`](Self::new), falling back to [`inert`](Self::inert) on error.
    /// The construction error is reported to the error sink.
    pub fn new_or_inert(config: ResourceConfig, deps: Dependencies) -> Self {
        match Self::new(config, deps.clone()) {
            Ok(layer) => layer,
            Err(e) => {
                warn!(error = %e, "Resource layer construction failed, using inert layer");
                deps.error_sink.handle_error(&e, "resource_layer.new");
                Self::inert(deps)
            }
        }
    }

    fn build(config: ResourceConfig, deps: Dependencies) -> Self {
        let pool = Arc::new(ConnectionPool::new(deps.clone(), config.pool.clone()));
        let queue = Arc::new(CommandQueue::new(deps.clone(), config.queue.clone()));
        let cache = Arc::new(CacheManager::new(deps.clone(), config.cache.clone()));
        let sessions = Arc::new(SessionManager::new(
            deps.clone(),
            Arc::clone(&pool),
            config.session.clone(),
        ));

        pool.initialize(&config.tools);
        queue.initialize(&config.tools);
        cache.initialize(&config.tools);

        Self {
            config,
            deps,
            pool,
            queue,
            cache,
            sessions,
        }
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn dependencies(&self) -> &Dependencies {
        &self.deps
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Spawn the pool health, dispatch, cache sweep and session health loops.
    pub fn start(&self) -> LayerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(Arc::clone(&self.pool).run(shutdown_rx.clone())),
            tokio::spawn(Arc::clone(&self.queue).run(shutdown_rx.clone())),
            tokio::spawn(Arc::clone(&self.cache).run(shutdown_rx.clone())),
            tokio::spawn(Arc::clone(&self.sessions).run(shutdown_rx)),
        ];
        info!("Resource layer background tasks started");

        LayerHandle {
            shutdown_tx,
            tasks,
            pool: Arc::clone(&self.pool),
            queue: Arc::clone(&self.queue),
            sessions: Arc::clone(&self.sessions),
        }
    }

    /// Close every session, drop queued work and drain the pool.
    pub async fn shutdown(&self) -> ShutdownSummary {
        drain(&self.sessions, &self.queue, &self.pool).await
    }

    pub fn status(&self) -> LayerStatus {
        LayerStatus {
            tools: self.config.tool_names(),
            sessions: self.sessions.get_status(),
            active_sessions: self.sessions.get_active_sessions(),
            session_metrics: self.sessions.get_session_metrics(),
            queues: self.queue.get_all_queue_statuses(),
            pools: self.pool.get_all_pool_stats(),
            caches: self.cache.get_all_cache_stats(),
        }
    }
}

impl std::fmt::Debug for ResourceLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLayer")
            .field("tools", &self.config.tool_names())
            .finish_non_exhaustive()
    }
}

async fn drain(
    sessions: &SessionManager,
    queue: &CommandQueue,
    pool: &ConnectionPool,
) -> ShutdownSummary {
    let sessions_closed = sessions.close_all_sessions().await;
    let queue_items_dropped = queue.clear_all_queues();
    let connections_closed = pool.shutdown().await;
    info!(
        sessions_closed,
        queue_items_dropped, connections_closed, "Resource layer drained"
    );
    ShutdownSummary {
        sessions_closed,
        queue_items_dropped,
        connections_closed,
    }
}

/// Running background tasks of a started layer.
pub struct LayerHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    pool: Arc<ConnectionPool>,
    queue: Arc<CommandQueue>,
    sessions: Arc<SessionManager>,
}

impl LayerHandle {
    /// Stop the background loops, then drain the layer.
    pub async fn shutdown(self) -> ShutdownSummary {
        if self.shutdown_tx.send(true).is_err() {
            warn!("Background tasks already stopped");
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Background task ended abnormally");
            }
        }
        drain(&self.sessions, &self.queue, &self.pool).await
    }
}
