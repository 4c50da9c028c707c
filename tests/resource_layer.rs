//! End-to-end behaviour of the composed resource layer.

use std::{
    io::Write,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use cli_resources::{
    core::config::{ToolCacheLimits, ToolPoolLimits, ToolQueueLimits},
    Command, CommandExecutor, Connector, Dependencies, EnqueueOptions, ErrorSink,
    ExecutionOutput, ExecutorError, QueueItemStatus, ResourceConfig, ResourceError,
    ResourceLayer, ResourceResult, SessionOptions, SessionStatus, ToolConfig, ToolConnection,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Notify;

/// Behaviour chosen by command name: `fail` reports failure, `panic`
/// panics, `block` waits for `release`, anything else succeeds.
#[derive(Default)]
struct ScriptedExecutor {
    release: Notify,
    calls: AtomicUsize,
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute_command(
        &self,
        tool: &str,
        command: &Command,
    ) -> Result<ExecutionOutput, ExecutorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match command.name.as_str() {
            "fail" => Ok(ExecutionOutput::failure("tool rejected command")),
            "panic" => panic!("executor crashed"),
            "block" => {
                self.release.notified().await;
                Ok(ExecutionOutput::ok("released"))
            }
            _ => Ok(ExecutionOutput::ok(json!({ "tool": tool, "command": command.name }))),
        }
    }
}

struct Link {
    open: AtomicBool,
}

#[async_trait]
impl ToolConnection for Link {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FlakyConnector {
    down: AtomicBool,
}

#[async_trait]
impl Connector for FlakyConnector {
    async fn connect(&self, tool: &str) -> ResourceResult<Arc<dyn ToolConnection>> {
        if self.down.load(Ordering::SeqCst) {
            return Err(ResourceError::ConnectionFailed {
                tool: tool.to_string(),
                attempts: 1,
                details: "backend unreachable".into(),
            });
        }
        Ok(Arc::new(Link {
            open: AtomicBool::new(true),
        }))
    }
}

#[derive(Default)]
struct RecordingSink {
    contexts: Mutex<Vec<String>>,
}

impl ErrorSink for RecordingSink {
    fn handle_error(&self, _error: &dyn std::error::Error, context: &str) {
        self.contexts.lock().push(context.to_string());
    }
}

struct Fixture {
    layer: ResourceLayer,
    executor: Arc<ScriptedExecutor>,
    connector: Arc<FlakyConnector>,
    sink: Arc<RecordingSink>,
}

fn fixture(config: ResourceConfig) -> Fixture {
    let executor = Arc::new(ScriptedExecutor::default());
    let connector = Arc::new(FlakyConnector::default());
    let sink = Arc::new(RecordingSink::default());
    let deps = Dependencies::new(Arc::clone(&executor) as Arc<dyn CommandExecutor>)
        .with_connector(Arc::clone(&connector) as Arc<dyn Connector>)
        .with_error_sink(Arc::clone(&sink) as Arc<dyn ErrorSink>);
    Fixture {
        layer: ResourceLayer::new(config, deps).expect("valid config"),
        executor,
        connector,
        sink,
    }
}

fn single_tool(tool: ToolConfig) -> ResourceConfig {
    ResourceConfig {
        tools: vec![tool],
        ..Default::default()
    }
}

#[tokio::test]
async fn dispatch_follows_priority_order() {
    let f = fixture(single_tool(ToolConfig::new("amf").with_queue(ToolQueueLimits {
        max_concurrent: 3,
        rate_limit_per_minute: None,
        max_pending: 100,
    })));
    let queue = f.layer.queue();

    for priority in [5, 1, 3, 2, 4] {
        queue
            .enqueue("amf", Command::new("block"), EnqueueOptions::priority(priority))
            .unwrap();
    }
    assert_eq!(queue.dispatch_tick(), 3);

    let status = queue.get_queue_status("amf").unwrap();
    let processing: Vec<u8> = status.processing.iter().map(|i| i.priority).collect();
    let pending: Vec<u8> = status.pending.iter().map(|i| i.priority).collect();
    assert_eq!(processing, vec![1, 2, 3]);
    assert_eq!(pending, vec![4, 5]);
}

#[tokio::test(start_paused = true)]
async fn cache_entries_expire_after_ttl() {
    let f = fixture(single_tool(
        ToolConfig::new("amf").with_cache(ToolCacheLimits { max_size: 10, ttl: 60 }),
    ));
    let cache = f.layer.cache();

    cache.set("amf", "k", json!({"registered": 12})).unwrap();
    assert_eq!(cache.get("amf", "k"), Some(json!({"registered": 12})));
    assert_eq!(cache.get_cache_stats("amf").unwrap().size, 1);

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(cache.get("amf", "k"), None);
    assert_eq!(cache.get_cache_stats("amf").unwrap().size, 0);
}

#[tokio::test]
async fn cache_evicts_least_used_entry() {
    let f = fixture(single_tool(
        ToolConfig::new("amf").with_cache(ToolCacheLimits { max_size: 3, ttl: 300 }),
    ));
    let cache = f.layer.cache();

    for key in ["a", "b", "c"] {
        cache.set("amf", key, json!(key)).unwrap();
    }
    cache.get("amf", "a");
    cache.get("amf", "c");
    cache.get("amf", "c");

    cache.set("amf", "d", json!("d")).unwrap();

    let stats = cache.get_cache_stats("amf").unwrap();
    assert_eq!(stats.size, 3);
    assert_eq!(stats.evictions, 1);
    assert!(cache.get("amf", "b").is_none());
    for key in ["a", "c", "d"] {
        assert!(cache.get("amf", key).is_some(), "{} should survive", key);
    }
}

#[tokio::test]
async fn failing_session_closed_by_health_check() {
    let f = fixture(single_tool(ToolConfig::new("amf")));
    let sessions = f.layer.sessions();

    let id = sessions
        .create_session("amf", SessionOptions::default())
        .await
        .unwrap();
    for name in ["fail", "ok", "fail", "fail", "ok", "fail", "fail"] {
        sessions
            .execute_in_session(&id, Command::new(name))
            .await
            .unwrap();
    }

    let report = sessions.run_health_check().await;
    assert_eq!(report.closed_unhealthy, 1);
    assert!(sessions.get_active_sessions().iter().all(|s| s.id != id));

    let err = sessions
        .execute_in_session(&id, Command::new("ok"))
        .await
        .unwrap_err();
    assert_eq!(err.reason(), "session_not_found");
}

#[tokio::test(start_paused = true)]
async fn idle_session_reclaimed() {
    let mut config = single_tool(ToolConfig::new("amf"));
    config.session.inactive_threshold = 120;
    let f = fixture(config);
    let sessions = f.layer.sessions();

    let idle = sessions
        .create_session("amf", SessionOptions::default())
        .await
        .unwrap();
    sessions
        .execute_in_session(&idle, Command::new("ok"))
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(100)).await;
    let busy = sessions
        .create_session("amf", SessionOptions::default())
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(30)).await;

    let report = sessions.run_health_check().await;
    assert_eq!(report.closed_idle, 1);
    let active: Vec<_> = sessions.get_active_sessions().into_iter().map(|s| s.id).collect();
    assert_eq!(active, vec![busy.clone()]);
    assert_eq!(
        sessions.get_session(&busy).unwrap().status,
        SessionStatus::Healthy
    );
}

#[tokio::test(start_paused = true)]
async fn pool_stays_within_bounds() {
    let f = fixture(single_tool(ToolConfig::new("amf").with_pool(ToolPoolLimits {
        min_size: 2,
        max_size: 4,
        idle_timeout: 30,
    })));
    let pool = f.layer.pool();

    pool.run_health_check().await;
    assert_eq!(pool.get_pool_stats("amf").unwrap().size, 2);

    for round in 0..5 {
        let mut held = Vec::new();
        loop {
            match pool.acquire("amf").await {
                Ok(conn) => held.push(conn),
                Err(e) => {
                    assert_eq!(e.reason(), "pool_exhausted");
                    break;
                }
            }
            assert!(pool.get_pool_stats("amf").unwrap().size <= 4);
        }
        assert_eq!(held.len(), 4, "round {}", round);

        for conn in held {
            pool.release(conn).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        pool.run_health_check().await;

        let stats = pool.get_pool_stats("amf").unwrap();
        assert!(stats.size >= 2 && stats.size <= 4, "round {}: {:?}", round, stats);
    }
}

#[tokio::test]
async fn pool_reports_dial_failures_to_sink() {
    let f = fixture(single_tool(ToolConfig::new("amf")));
    f.connector.down.store(true, Ordering::SeqCst);

    let report = f.layer.pool().run_health_check().await;
    assert_eq!(report.failed, 1);
    assert_eq!(f.layer.pool().get_pool_stats("amf").unwrap().errors, 1);
    assert_eq!(
        f.sink.contexts.lock().as_slice(),
        ["connection_pool.health_check"]
    );
}

#[tokio::test]
async fn status_snapshots_are_idempotent() {
    let f = fixture(ResourceConfig {
        tools: vec![ToolConfig::new("amf"), ToolConfig::new("smf")],
        ..Default::default()
    });
    let layer = &f.layer;

    let id = layer
        .sessions()
        .create_session("amf", SessionOptions::default())
        .await
        .unwrap();
    layer
        .sessions()
        .execute_in_session(&id, Command::new("ok"))
        .await
        .unwrap();
    layer.cache().set("smf", "status", json!("up")).unwrap();
    layer
        .queue()
        .enqueue("smf", Command::new("ok"), EnqueueOptions::default())
        .unwrap();

    let first = layer.status();
    let second = layer.status();
    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_value(&first).unwrap(),
        serde_json::to_value(&second).unwrap()
    );
    assert_eq!(layer.sessions().get_status(), layer.sessions().get_status());
    assert_eq!(
        layer.queue().get_all_queue_statuses(),
        layer.queue().get_all_queue_statuses()
    );
    assert_eq!(layer.pool().get_all_pool_stats(), layer.pool().get_all_pool_stats());
    assert_eq!(layer.cache().get_all_cache_stats(), layer.cache().get_all_cache_stats());
    assert_eq!(
        layer.sessions().get_session_metrics(),
        layer.sessions().get_session_metrics()
    );
}

#[tokio::test]
async fn queued_panic_is_recorded_as_failure() {
    let f = fixture(single_tool(ToolConfig::new("amf")));
    let queue = f.layer.queue();

    let id = queue
        .enqueue("amf", Command::new("panic"), EnqueueOptions::default())
        .unwrap();
    queue.dispatch_tick();

    let item = queue
        .wait_for_result(&id, Duration::from_secs(5))
        .await
        .expect("item finished");
    assert_eq!(item.status, QueueItemStatus::Failed);
    assert!(item.result.is_some_and(|r| !r.success));
    assert_eq!(
        f.sink.contexts.lock().as_slice(),
        ["command_queue.dispatch"]
    );
}

#[tokio::test]
async fn clearing_queues_discards_in_flight_results() {
    let f = fixture(single_tool(ToolConfig::new("amf")));
    let queue = f.layer.queue();

    queue
        .enqueue("amf", Command::new("block"), EnqueueOptions::default())
        .unwrap();
    queue.dispatch_tick();
    assert_eq!(queue.clear_all_queues(), 1);

    f.executor.release.notify_one();
    for _ in 0..100 {
        if queue.get_queue_status("amf").unwrap().metrics.discarded_results > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let status = queue.get_queue_status("amf").unwrap();
    assert_eq!(status.metrics.discarded_results, 1);
    assert_eq!(status.completed_count, 0);
    assert_eq!(f.executor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn background_tasks_dispatch_and_shut_down() {
    let mut config = single_tool(ToolConfig::new("amf"));
    config.queue.dispatch_interval_ms = 50;
    let f = fixture(config);
    let handle = f.layer.start();

    let id = f
        .layer
        .queue()
        .enqueue("amf", Command::new("status"), EnqueueOptions::priority(1))
        .unwrap();
    let item = f
        .layer
        .queue()
        .wait_for_result(&id, Duration::from_secs(5))
        .await
        .expect("dispatched by the background loop");
    assert_eq!(item.status, QueueItemStatus::Completed);
    assert_eq!(
        item.result.and_then(|r| r.data),
        Some(json!({"tool": "amf", "command": "status"}))
    );

    f.layer
        .sessions()
        .create_session("amf", SessionOptions::default())
        .await
        .unwrap();

    let summary = handle.shutdown().await;
    assert_eq!(summary.sessions_closed, 1);
    assert!(f.layer.sessions().get_active_sessions().is_empty());
    assert_eq!(f.layer.pool().get_pool_stats("amf").unwrap().size, 0);
}

#[tokio::test]
async fn config_file_round_trip() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
tools:
  - name: amf
    pool: {{ min_size: 0, max_size: 2 }}
    queue: {{ max_concurrent: 1 }}
  - name: smf
queue:
  dispatch_interval_ms: 500
features:
  disabled: [command_queue]
"#
    )
    .unwrap();

    let config = ResourceConfig::from_file(file.path()).await.unwrap();
    assert_eq!(config.tool_names(), vec!["amf", "smf"]);

    let f = fixture(config);
    let err = f
        .layer
        .queue()
        .enqueue("amf", Command::new("status"), EnqueueOptions::default())
        .unwrap_err();
    assert_eq!(err.reason(), "disabled");
    assert_eq!(f.layer.pool().get_pool_stats("amf").unwrap().max_size, 2);
}

#[tokio::test]
async fn missing_config_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = ResourceConfig::from_file(dir.path().join("absent.yaml"))
        .await
        .unwrap_err();
    assert_eq!(err.reason(), "io_error");
}
