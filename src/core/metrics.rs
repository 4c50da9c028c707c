//! Command execution metrics for commands run inside sessions.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use serde::Serialize;

/// Lock-free counters for command executions, keyed by tool for latency.
pub struct CommandMetrics {
    total_commands: AtomicU64,
    successful_commands: AtomicU64,
    failed_commands: AtomicU64,
    active_executions: AtomicU64,
    executor_errors: AtomicU64,

    // Per-tool latency tracking
    tool_latencies: DashMap<String, LatencyStats>,
}

impl CommandMetrics {
    pub fn new() -> Self {
        Self {
            total_commands: AtomicU64::new(0),
            successful_commands: AtomicU64::new(0),
            failed_commands: AtomicU64::new(0),
            active_executions: AtomicU64::new(0),
            executor_errors: AtomicU64::new(0),
            tool_latencies: DashMap::new(),
        }
    }

    /// Record the start of a command.
    pub fn record_start(&self) {
        self.total_commands.fetch_add(1, Ordering::Relaxed);
        self.active_executions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the end of a command.
    pub fn record_end(&self, tool: &str, success: bool, duration_ms: u64) {
        self.active_executions.fetch_sub(1, Ordering::Relaxed);

        if success {
            self.successful_commands.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_commands.fetch_add(1, Ordering::Relaxed);
        }

        self.tool_latencies
            .entry(tool.to_string())
            .or_insert_with(LatencyStats::new)
            .record(duration_ms);
    }

    /// Record an executor fault (error return or panic), not a `success: false` result.
    pub fn record_executor_error(&self) {
        self.executor_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CommandMetricsSnapshot {
        CommandMetricsSnapshot {
            total_commands: self.total_commands.load(Ordering::Relaxed),
            successful_commands: self.successful_commands.load(Ordering::Relaxed),
            failed_commands: self.failed_commands.load(Ordering::Relaxed),
            active_executions: self.active_executions.load(Ordering::Relaxed),
            executor_errors: self.executor_errors.load(Ordering::Relaxed),
        }
    }

    /// Latency stats for all tools, keyed by tool name.
    pub fn tool_latencies(&self) -> BTreeMap<String, LatencySnapshot> {
        self.tool_latencies
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }
}

impl Default for CommandMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-tool latency statistics.
pub struct LatencyStats {
    count: AtomicU64,
    total_ms: AtomicU64,
    min_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyStats {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_ms: AtomicU64::new(0),
            min_ms: AtomicU64::new(u64::MAX),
            max_ms: AtomicU64::new(0),
        }
    }

    fn record(&self, ms: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.min_ms.fetch_min(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total = self.total_ms.load(Ordering::Relaxed);
        let min = self.min_ms.load(Ordering::Relaxed);
        let max = self.max_ms.load(Ordering::Relaxed);

        LatencySnapshot {
            count,
            avg_ms: if count > 0 { total / count } else { 0 },
            min_ms: if min == u64::MAX { 0 } else { min },
            max_ms: max,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandMetricsSnapshot {
    pub total_commands: u64,
    pub successful_commands: u64,
    pub failed_commands: u64,
    pub active_executions: u64,
    pub executor_errors: u64,
}

impl CommandMetricsSnapshot {
    /// Success rate as a percentage; 100 when nothing has completed yet.
    pub fn success_rate(&self) -> f64 {
        let completed = self.successful_commands + self.failed_commands;
        if completed == 0 {
            100.0
        } else {
            (self.successful_commands as f64 / completed as f64) * 100.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LatencySnapshot {
    pub count: u64,
    pub avg_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}

/// Running mean update: `avg + (sample - avg) / n`.
pub(crate) fn running_mean(current: f64, sample: f64, count: u64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    current + (sample - current) / count as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_metrics() {
        let metrics = CommandMetrics::new();

        metrics.record_start();
        assert_eq!(metrics.snapshot().total_commands, 1);
        assert_eq!(metrics.snapshot().active_executions, 1);

        metrics.record_end("amf", true, 100);
        assert_eq!(metrics.snapshot().successful_commands, 1);
        assert_eq!(metrics.snapshot().active_executions, 0);

        metrics.record_start();
        metrics.record_end("amf", false, 50);
        assert_eq!(metrics.snapshot().failed_commands, 1);
    }

    #[test]
    fn test_latency_stats() {
        let metrics = CommandMetrics::new();
        for ms in [100, 200, 150] {
            metrics.record_start();
            metrics.record_end("smf", true, ms);
        }

        let latencies = metrics.tool_latencies();
        let latency = &latencies["smf"];
        assert_eq!(latency.count, 3);
        assert_eq!(latency.avg_ms, 150);
        assert_eq!(latency.min_ms, 100);
        assert_eq!(latency.max_ms, 200);
        assert!(!latencies.contains_key("upf"));
    }

    #[test]
    fn test_success_rate() {
        let metrics = CommandMetrics::new();
        assert_eq!(metrics.snapshot().success_rate(), 100.0);

        for _ in 0..3 {
            metrics.record_start();
            metrics.record_end("amf", true, 10);
        }
        metrics.record_start();
        metrics.record_end("amf", false, 10);

        assert!((metrics.snapshot().success_rate() - 75.0).abs() < 0.1);
    }

    #[test]
    fn test_tool_latencies_sorted() {
        let metrics = CommandMetrics::new();
        for tool in ["upf", "amf"] {
            metrics.record_start();
            metrics.record_end(tool, true, 1);
        }
        let names: Vec<_> = metrics.tool_latencies().into_keys().collect();
        assert_eq!(names, vec!["amf", "upf"]);
    }

    #[test]
    fn test_running_mean() {
        let mut avg = 0.0;
        for (i, sample) in [10.0, 20.0, 30.0].into_iter().enumerate() {
            avg = running_mean(avg, sample, i as u64 + 1);
        }
        assert!((avg - 20.0).abs() < f64::EPSILON);
        assert_eq!(running_mean(5.0, 1.0, 0), 0.0);
    }
}
