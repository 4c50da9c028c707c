//! Resource layer for applications that drive external command-line tools.
//!
//! Each named tool gets a connection pool, a priority command queue, a
//! result cache and session tracking. The managers share injected
//! collaborators: a [`CommandExecutor`] that actually runs commands, an
//! [`ErrorSink`] for absorbed faults and a [`FeatureGate`].
//!
//! ## Modules
//!
//! - [`pool`]: bounded per-tool connection pools with idle eviction
//! - [`queue`]: priority dispatch under concurrency and rate limits
//! - [`cache`]: TTL cache with least-used eviction
//! - [`session`]: session lifecycle and health checks
//! - [`layer`]: composition, background tasks and status snapshots
//! - [`process`]: executor and connector backed by local programs

// Shared types (used across modules)
pub mod core;
pub mod error;
pub mod executor;
pub mod gate;
pub mod logging;

// Managers
pub mod cache;
pub mod pool;
pub mod queue;
pub mod session;

pub mod layer;
pub mod process;

pub use core::{
    BoundedHistory, CommandMetrics, CommandMetricsSnapshot, ResourceConfig, ToolConfig,
};
pub use error::{ExecutorError, ResourceError, ResourceResult};
pub use executor::{
    Command, CommandExecutor, Connector, Dependencies, ErrorSink, ExecutionOutput,
    ToolConnection, TracingErrorSink,
};
pub use gate::{flags, AlwaysEnabled, FeatureGate, StaticFeatureGate};

pub use cache::{CacheManager, CacheStats};
pub use layer::{LayerHandle, LayerStatus, ResourceLayer, ShutdownSummary};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use process::{ProcessConnector, ProcessExecutor};
pub use queue::{CommandQueue, EnqueueOptions, QueueId, QueueItem, QueueItemStatus, QueueStatus};
pub use session::{
    SessionId, SessionInfo, SessionManager, SessionMetrics, SessionOptions, SessionStatus,
};
