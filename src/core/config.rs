//! Resource layer configuration types.
//!
//! Defines per-tool limits for the pool, queue and cache, plus the global
//! settings of each manager. Every field has a serde default so a partial
//! YAML document (or an empty one) is valid.

use std::{collections::HashSet, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{ResourceError, ResourceResult};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ResourceConfig {
    /// Backend tools managed by the layer
    #[serde(default)]
    pub tools: Vec<ToolConfig>,

    /// Connection pool settings shared by all tools
    #[serde(default)]
    pub pool: PoolSettings,

    /// Command queue settings shared by all tools
    #[serde(default)]
    pub queue: QueueSettings,

    /// Cache sweep settings
    #[serde(default)]
    pub cache: CacheSettings,

    /// Session lifecycle and health settings
    #[serde(default)]
    pub session: SessionSettings,

    /// Feature gate overrides
    #[serde(default)]
    pub features: FeatureConfig,
}

/// A single backend tool and its resource limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolConfig {
    pub name: String,

    /// Executable used by the process-backed executor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,

    /// Arguments prepended to every command for this tool
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Upper bound on a single command run by the process executor (seconds)
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,

    #[serde(default)]
    pub pool: ToolPoolLimits,

    #[serde(default)]
    pub queue: ToolQueueLimits,

    #[serde(default)]
    pub cache: ToolCacheLimits,
}

impl ToolConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: None,
            args: Vec::new(),
            command_timeout: default_command_timeout(),
            pool: ToolPoolLimits::default(),
            queue: ToolQueueLimits::default(),
            cache: ToolCacheLimits::default(),
        }
    }

    pub fn with_pool(mut self, pool: ToolPoolLimits) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_queue(mut self, queue: ToolQueueLimits) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_cache(mut self, cache: ToolCacheLimits) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout)
    }
}

/// Per-tool connection pool bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ToolPoolLimits {
    /// Connections kept warm by the health pass
    #[serde(default = "default_min_size")]
    pub min_size: usize,

    /// Hard cap on open connections (available + in use)
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Idle timeout before an available connection is closed (seconds)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl ToolPoolLimits {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }
}

/// Per-tool queue limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ToolQueueLimits {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Dispatches allowed per sliding minute; `None` disables the limit
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: Option<usize>,

    /// Pending items accepted before `enqueue` rejects
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

/// Per-tool cache limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ToolCacheLimits {
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,

    /// Entry time-to-live (seconds)
    #[serde(default = "default_ttl")]
    pub ttl: u64,
}

impl ToolCacheLimits {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolSettings {
    /// Interval between pool health passes (seconds)
    #[serde(default = "default_pool_health_interval")]
    pub health_check_interval: u64,

    /// Upper bound on a single connection attempt (seconds)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl PoolSettings {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueSettings {
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,

    /// Completed items retained per tool
    #[serde(default = "default_completed_history")]
    pub completed_history: usize,

    /// Failed items retained per tool
    #[serde(default = "default_failed_history")]
    pub failed_history: usize,
}

impl QueueSettings {
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheSettings {
    /// Interval between expired-entry sweeps (seconds)
    #[serde(default = "default_cache_cleanup_interval")]
    pub cleanup_interval: u64,
}

impl CacheSettings {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionSettings {
    #[serde(default = "default_max_connection_attempts")]
    pub max_connection_attempts: u32,

    /// Interval between session health checks (seconds)
    #[serde(default = "default_session_health_interval")]
    pub health_check_interval: u64,

    /// Inactivity before a session is reclaimed (seconds)
    #[serde(default = "default_inactive_threshold")]
    pub inactive_threshold: u64,

    /// Command records retained per session
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Commands required before the error rate is considered
    #[serde(default = "default_min_commands_for_health")]
    pub min_commands_for_health: u64,

    /// Error ratio above which a session is closed as unhealthy
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,
}

impl SessionSettings {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }

    pub fn inactive_threshold(&self) -> Duration {
        Duration::from_secs(self.inactive_threshold)
    }
}

/// Feature gate overrides; every flag not listed is enabled.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FeatureConfig {
    #[serde(default)]
    pub disabled: Vec<String>,
}

// Default value functions
fn default_command_timeout() -> u64 {
    30
}

fn default_min_size() -> usize {
    1
}

fn default_max_size() -> usize {
    5
}

fn default_idle_timeout() -> u64 {
    300 // 5 minutes
}

fn default_max_concurrent() -> usize {
    3
}

fn default_rate_limit() -> Option<usize> {
    Some(60)
}

fn default_max_pending() -> usize {
    1000
}

fn default_cache_max_size() -> usize {
    100
}

fn default_ttl() -> u64 {
    300 // 5 minutes
}

fn default_pool_health_interval() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_dispatch_interval_ms() -> u64 {
    2000
}

fn default_completed_history() -> usize {
    100
}

fn default_failed_history() -> usize {
    50
}

fn default_cache_cleanup_interval() -> u64 {
    60
}

fn default_max_connection_attempts() -> u32 {
    3
}

fn default_session_health_interval() -> u64 {
    30
}

fn default_inactive_threshold() -> u64 {
    300 // 5 minutes
}

fn default_history_limit() -> usize {
    100
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    5000
}

fn default_min_commands_for_health() -> u64 {
    5
}

fn default_max_error_rate() -> f64 {
    0.5
}

// Default implementations
impl Default for ToolPoolLimits {
    fn default() -> Self {
        Self {
            min_size: default_min_size(),
            max_size: default_max_size(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

impl Default for ToolQueueLimits {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            rate_limit_per_minute: default_rate_limit(),
            max_pending: default_max_pending(),
        }
    }
}

impl Default for ToolCacheLimits {
    fn default() -> Self {
        Self {
            max_size: default_cache_max_size(),
            ttl: default_ttl(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            health_check_interval: default_pool_health_interval(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            dispatch_interval_ms: default_dispatch_interval_ms(),
            completed_history: default_completed_history(),
            failed_history: default_failed_history(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cleanup_interval: default_cache_cleanup_interval(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_connection_attempts: default_max_connection_attempts(),
            health_check_interval: default_session_health_interval(),
            inactive_threshold: default_inactive_threshold(),
            history_limit: default_history_limit(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            min_commands_for_health: default_min_commands_for_health(),
            max_error_rate: default_max_error_rate(),
        }
    }
}

impl ResourceConfig {
    /// Load configuration from a YAML file
    pub async fn from_file(path: impl AsRef<std::path::Path>) -> ResourceResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> ResourceResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn tool(&self, name: &str) -> Option<&ToolConfig> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }

    pub fn validate(&self) -> ResourceResult<()> {
        let mut seen = HashSet::new();
        for tool in &self.tools {
            if tool.name.trim().is_empty() {
                return Err(ResourceError::Config("tool name must not be empty".into()));
            }
            if !seen.insert(tool.name.as_str()) {
                return Err(ResourceError::Config(format!(
                    "duplicate tool '{}'",
                    tool.name
                )));
            }
            if tool.pool.max_size == 0 {
                return Err(ResourceError::Config(format!(
                    "tool '{}': pool.max_size must be at least 1",
                    tool.name
                )));
            }
            if tool.pool.min_size > tool.pool.max_size {
                return Err(ResourceError::Config(format!(
                    "tool '{}': pool.min_size ({}) exceeds pool.max_size ({})",
                    tool.name, tool.pool.min_size, tool.pool.max_size
                )));
            }
            if tool.queue.max_concurrent == 0 {
                return Err(ResourceError::Config(format!(
                    "tool '{}': queue.max_concurrent must be at least 1",
                    tool.name
                )));
            }
            if tool.queue.rate_limit_per_minute == Some(0) {
                return Err(ResourceError::Config(format!(
                    "tool '{}': queue.rate_limit_per_minute must be at least 1 (omit or null for no limit)",
                    tool.name
                )));
            }
            if tool.queue.max_pending == 0 {
                return Err(ResourceError::Config(format!(
                    "tool '{}': queue.max_pending must be at least 1",
                    tool.name
                )));
            }
            if tool.command_timeout == 0 {
                return Err(ResourceError::Config(format!(
                    "tool '{}': command_timeout must be at least 1 second",
                    tool.name
                )));
            }
            if tool.cache.max_size == 0 {
                return Err(ResourceError::Config(format!(
                    "tool '{}': cache.max_size must be at least 1",
                    tool.name
                )));
            }
        }

        if !(0.0..=1.0).contains(&self.session.max_error_rate) {
            return Err(ResourceError::Config(format!(
                "session.max_error_rate must be within 0..=1, got {}",
                self.session.max_error_rate
            )));
        }
        if self.session.max_connection_attempts == 0 {
            return Err(ResourceError::Config(
                "session.max_connection_attempts must be at least 1".into(),
            ));
        }

        // Each background loop ticks on one of these
        let intervals = [
            ("pool.health_check_interval", self.pool.health_check_interval),
            ("queue.dispatch_interval_ms", self.queue.dispatch_interval_ms),
            ("cache.cleanup_interval", self.cache.cleanup_interval),
            ("session.health_check_interval", self.session.health_check_interval),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(ResourceError::Config(format!("{} must be non-zero", name)));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tool_limits() {
        let tool = ToolConfig::new("amf");
        assert_eq!(tool.pool.min_size, 1);
        assert_eq!(tool.pool.max_size, 5);
        assert_eq!(tool.pool.idle_timeout(), Duration::from_secs(300));
        assert_eq!(tool.queue.max_concurrent, 3);
        assert_eq!(tool.queue.rate_limit_per_minute, Some(60));
        assert_eq!(tool.cache.ttl(), Duration::from_secs(300));
        assert_eq!(tool.command_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_default_manager_settings() {
        let config = ResourceConfig::default();
        assert_eq!(config.queue.dispatch_interval(), Duration::from_secs(2));
        assert_eq!(config.queue.completed_history, 100);
        assert_eq!(config.queue.failed_history, 50);
        assert_eq!(config.session.health_check_interval(), Duration::from_secs(30));
        assert_eq!(config.session.inactive_threshold(), Duration::from_secs(300));
        assert_eq!(config.pool.health_check_interval(), Duration::from_secs(60));
        assert_eq!(config.cache.cleanup_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_yaml_empty_document() {
        let config = ResourceConfig::from_yaml_str("{}").expect("empty config parses");
        assert!(config.tools.is_empty());
        assert_eq!(config.session.max_connection_attempts, 3);
    }

    #[test]
    fn test_yaml_full_config() {
        let yaml = r#"
tools:
  - name: amf
    program: /usr/local/bin/amf-cli
    args: ["--batch"]
    pool:
      min_size: 2
      max_size: 4
      idle_timeout: 120
    queue:
      max_concurrent: 2
      rate_limit_per_minute: null
  - name: smf
    cache:
      max_size: 10
      ttl: 30

session:
  inactive_threshold: 60
  max_error_rate: 0.25

features:
  disabled: ["cache_manager"]
"#;

        let config = ResourceConfig::from_yaml_str(yaml).expect("Failed to parse YAML");
        assert_eq!(config.tools.len(), 2);

        let amf = config.tool("amf").unwrap();
        assert_eq!(amf.program.as_deref(), Some("/usr/local/bin/amf-cli"));
        assert_eq!(amf.args, vec!["--batch".to_string()]);
        assert_eq!(amf.pool.min_size, 2);
        assert_eq!(amf.pool.max_size, 4);
        assert_eq!(amf.queue.max_concurrent, 2);
        assert_eq!(amf.queue.rate_limit_per_minute, None);
        assert_eq!(amf.queue.max_pending, 1000);

        let smf = config.tool("smf").unwrap();
        assert_eq!(smf.cache.max_size, 10);
        assert_eq!(smf.cache.ttl(), Duration::from_secs(30));
        assert_eq!(smf.pool, ToolPoolLimits::default());

        assert_eq!(config.session.inactive_threshold, 60);
        assert_eq!(config.session.history_limit, 100);
        assert_eq!(config.features.disabled, vec!["cache_manager".to_string()]);
        assert_eq!(config.tool_names(), vec!["amf", "smf"]);
    }

    #[test]
    fn test_validation_rejects_duplicate_tools() {
        let yaml = r#"
tools:
  - name: amf
  - name: amf
"#;
        let err = ResourceConfig::from_yaml_str(yaml).unwrap_err();
        assert_eq!(err.reason(), "config_error");
        assert!(err.to_string().contains("duplicate tool 'amf'"));
    }

    #[test]
    fn test_validation_rejects_inverted_pool_bounds() {
        let config = ResourceConfig {
            tools: vec![ToolConfig::new("upf").with_pool(ToolPoolLimits {
                min_size: 4,
                max_size: 2,
                idle_timeout: 10,
            })],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("min_size (4) exceeds pool.max_size (2)"));
    }

    #[test]
    fn test_validation_rejects_zero_intervals() {
        for (yaml, field) in [
            ("pool: { health_check_interval: 0 }", "pool.health_check_interval"),
            ("queue: { dispatch_interval_ms: 0 }", "queue.dispatch_interval_ms"),
            ("cache: { cleanup_interval: 0 }", "cache.cleanup_interval"),
            ("session: { health_check_interval: 0 }", "session.health_check_interval"),
        ] {
            let err = ResourceConfig::from_yaml_str(yaml).unwrap_err();
            assert_eq!(err.reason(), "config_error", "{}", yaml);
            assert!(err.to_string().contains(field), "{}: {}", yaml, err);
        }
    }

    #[test]
    fn test_validation_rejects_zero_queue_limits() {
        let yaml = r#"
tools:
  - name: amf
    queue: { rate_limit_per_minute: 0 }
"#;
        let err = ResourceConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("rate_limit_per_minute"));

        let yaml = r#"
tools:
  - name: amf
    queue: { max_pending: 0 }
"#;
        let err = ResourceConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("max_pending"));
    }

    #[test]
    fn test_validation_rejects_error_rate_out_of_range() {
        let mut config = ResourceConfig::default();
        config.session.max_error_rate = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let config = ResourceConfig {
            tools: vec![ToolConfig::new("amf").with_queue(ToolQueueLimits {
                max_concurrent: 0,
                ..Default::default()
            })],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_invalid_type_is_config_error() {
        let err = ResourceConfig::from_yaml_str("tools: 42").unwrap_err();
        assert_eq!(err.reason(), "config_error");
    }
}
