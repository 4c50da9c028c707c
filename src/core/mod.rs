//! Shared infrastructure used by all four managers.

pub mod config;
pub mod history;
pub mod metrics;
pub mod reconnect;

pub use config::{
    CacheSettings, FeatureConfig, PoolSettings, QueueSettings, ResourceConfig, SessionSettings,
    ToolCacheLimits, ToolConfig, ToolPoolLimits, ToolQueueLimits,
};
pub use history::BoundedHistory;
pub use metrics::{CommandMetrics, CommandMetricsSnapshot, LatencySnapshot};
pub use reconnect::ReconnectionManager;
