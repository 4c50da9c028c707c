//! Per-tool priority command queue.
//!
//! Commands are accepted immediately by [`CommandQueue::enqueue`] and
//! dispatched later by [`CommandQueue::dispatch_tick`], which runs on a
//! fixed interval and whenever new work or free capacity appears. Lower
//! priority values dispatch first; ties keep enqueue order.
//!
//! Each dispatched command runs on its own task. On completion the task
//! re-locks the tool's state and files the item as completed or failed.
//! Failed items are never re-enqueued.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::{watch, Notify},
    time::{interval, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    core::{
        config::{QueueSettings, ToolConfig, ToolQueueLimits},
        history::BoundedHistory,
        metrics::running_mean,
    },
    error::{ResourceError, ResourceResult},
    executor::{execute_isolated, Command, Dependencies, ExecutionOutput},
    gate::{ensure_enabled, flags},
};

pub type QueueId = String;

pub const DEFAULT_PRIORITY: u8 = 5;

const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnqueueOptions {
    /// Lower values dispatch first
    pub priority: u8,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
        }
    }
}

impl EnqueueOptions {
    pub fn priority(priority: u8) -> Self {
        Self { priority }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueItem {
    pub id: QueueId,
    pub tool: String,
    pub command: Command,
    pub priority: u8,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: QueueItemStatus,
    pub result: Option<ExecutionOutput>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueMetrics {
    pub total_enqueued: u64,
    pub total_rejected: u64,
    pub total_processed: u64,
    pub total_failed: u64,
    /// Results that arrived after `clear_all_queues` dropped their item
    pub discarded_results: u64,
    pub average_processing_time_ms: f64,
}

/// Point-in-time view of one tool's queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    pub tool: String,
    pub max_concurrent: usize,
    pub max_pending: usize,
    pub rate_limit_per_minute: Option<usize>,
    /// Pending items in dispatch order
    pub pending: Vec<QueueItem>,
    /// Processing items in dispatch order
    pub processing: Vec<QueueItem>,
    pub completed_count: usize,
    pub failed_count: usize,
    pub metrics: QueueMetrics,
}

/// Sliding one-minute window of dispatch timestamps.
#[derive(Debug, Default)]
struct DispatchWindow {
    dispatches: VecDeque<Instant>,
}

impl DispatchWindow {
    fn cleanup(&mut self, now: Instant) {
        while let Some(&oldest) = self.dispatches.front() {
            if now.duration_since(oldest) >= RATE_WINDOW {
                self.dispatches.pop_front();
            } else {
                break;
            }
        }
    }

    fn has_room(&mut self, limit: Option<usize>, now: Instant) -> bool {
        let Some(max) = limit else {
            return true;
        };
        self.cleanup(now);
        self.dispatches.len() < max
    }

    fn record(&mut self, now: Instant) {
        self.dispatches.push_back(now);
    }
}

struct ToolQueue {
    limits: ToolQueueLimits,
    pending: BTreeMap<(u8, u64), QueueItem>,
    processing: Vec<QueueItem>,
    completed: BoundedHistory<QueueItem>,
    failed: BoundedHistory<QueueItem>,
    window: DispatchWindow,
    next_seq: u64,
    /// Bumped by `clear_all_queues`; completions from an older generation are dropped
    generation: u64,
    metrics: QueueMetrics,
}

impl ToolQueue {
    fn new(limits: ToolQueueLimits, settings: &QueueSettings) -> Self {
        Self {
            limits,
            pending: BTreeMap::new(),
            processing: Vec::new(),
            completed: BoundedHistory::new(settings.completed_history),
            failed: BoundedHistory::new(settings.failed_history),
            window: DispatchWindow::default(),
            next_seq: 0,
            generation: 0,
            metrics: QueueMetrics::default(),
        }
    }

    fn find(&self, id: &str) -> Option<&QueueItem> {
        self.pending
            .values()
            .chain(self.processing.iter())
            .chain(self.completed.iter())
            .chain(self.failed.iter())
            .find(|item| item.id == id)
    }
}

struct Dispatch {
    tool: String,
    id: QueueId,
    command: Command,
    generation: u64,
}

pub struct CommandQueue {
    deps: Dependencies,
    settings: QueueSettings,
    queues: DashMap<String, Arc<Mutex<ToolQueue>>>,
    /// Wakes the dispatch loop on enqueue and completion
    wake: Notify,
    /// Signals callers waiting on a result
    finished: Notify,
}

impl CommandQueue {
    pub fn new(deps: Dependencies, settings: QueueSettings) -> Self {
        Self {
            deps,
            settings,
            queues: DashMap::new(),
            wake: Notify::new(),
            finished: Notify::new(),
        }
    }

    pub fn initialize(&self, tools: &[ToolConfig]) {
        for tool in tools {
            self.queues
                .entry(tool.name.clone())
                .and_modify(|queue| queue.lock().limits = tool.queue)
                .or_insert_with(|| {
                    Arc::new(Mutex::new(ToolQueue::new(tool.queue, &self.settings)))
                });
            debug!(
                tool = %tool.name,
                max_concurrent = tool.queue.max_concurrent,
                rate_limit = ?tool.queue.rate_limit_per_minute,
                "Initialized command queue"
            );
        }
    }

    fn tool_queue(&self, tool: &str) -> ResourceResult<Arc<Mutex<ToolQueue>>> {
        self.queues
            .get(tool)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ResourceError::UnknownTool(tool.to_string()))
    }

    /// Accept a command for later dispatch. Never executes inline.
    pub fn enqueue(
        &self,
        tool: &str,
        command: Command,
        options: EnqueueOptions,
    ) -> ResourceResult<QueueId> {
        ensure_enabled(self.deps.gate.as_ref(), flags::COMMAND_QUEUE)?;
        let queue = self.tool_queue(tool)?;

        let id = uuid::Uuid::new_v4().to_string();
        {
            let mut state = queue.lock();
            let depth = state.pending.len();
            if depth >= state.limits.max_pending {
                state.metrics.total_rejected += 1;
                warn!(tool, depth, "Command queue full, rejecting");
                return Err(ResourceError::QueueFull {
                    tool: tool.to_string(),
                    depth,
                });
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            state.metrics.total_enqueued += 1;
            state.pending.insert(
                (options.priority, seq),
                QueueItem {
                    id: id.clone(),
                    tool: tool.to_string(),
                    command,
                    priority: options.priority,
                    queued_at: Utc::now(),
                    started_at: None,
                    completed_at: None,
                    status: QueueItemStatus::Pending,
                    result: None,
                },
            );
        }

        debug!(tool, queue_id = %id, priority = options.priority, "Command enqueued");
        self.wake.notify_one();
        Ok(id)
    }

    /// Move pending items into processing for every tool, up to each tool's
    /// concurrency cap and rate limit. Returns the number dispatched.
    pub fn dispatch_tick(self: &Arc<Self>) -> usize {
        let queues: Vec<(String, Arc<Mutex<ToolQueue>>)> = self
            .queues
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut dispatched = Vec::new();
        for (tool, queue) in queues {
            let mut state = queue.lock();
            let now = Instant::now();
            while state.processing.len() < state.limits.max_concurrent {
                let limit = state.limits.rate_limit_per_minute;
                if state.pending.is_empty() || !state.window.has_room(limit, now) {
                    break;
                }
                let Some((_, mut item)) = state.pending.pop_first() else {
                    break;
                };
                item.status = QueueItemStatus::Processing;
                item.started_at = Some(Utc::now());
                state.window.record(now);

                dispatched.push(Dispatch {
                    tool: tool.clone(),
                    id: item.id.clone(),
                    command: item.command.clone(),
                    generation: state.generation,
                });
                state.processing.push(item);
            }
        }

        let count = dispatched.len();
        for dispatch in dispatched {
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                let started = Instant::now();
                let execution = execute_isolated(
                    &queue.deps,
                    &dispatch.tool,
                    &dispatch.command,
                    "command_queue.dispatch",
                )
                .await;
                queue.complete(&dispatch, execution.output, started.elapsed());
            });
        }

        if count > 0 {
            debug!(count, "Dispatched queued commands");
        }
        count
    }

    fn complete(&self, dispatch: &Dispatch, output: ExecutionOutput, elapsed: Duration) {
        let Ok(queue) = self.tool_queue(&dispatch.tool) else {
            return;
        };

        {
            let mut state = queue.lock();
            let position = if state.generation == dispatch.generation {
                state.processing.iter().position(|item| item.id == dispatch.id)
            } else {
                None
            };
            let Some(position) = position else {
                state.metrics.discarded_results += 1;
                debug!(
                    tool = %dispatch.tool,
                    queue_id = %dispatch.id,
                    "Discarding result for cleared queue item"
                );
                return;
            };

            let mut item = state.processing.remove(position);
            item.completed_at = Some(Utc::now());
            let success = output.success;
            item.result = Some(output);

            let metrics = &mut state.metrics;
            metrics.total_processed += 1;
            metrics.average_processing_time_ms = running_mean(
                metrics.average_processing_time_ms,
                elapsed.as_secs_f64() * 1000.0,
                metrics.total_processed,
            );

            if success {
                item.status = QueueItemStatus::Completed;
                state.completed.push(item);
            } else {
                item.status = QueueItemStatus::Failed;
                state.metrics.total_failed += 1;
                warn!(tool = %dispatch.tool, queue_id = %dispatch.id, "Queued command failed");
                state.failed.push(item);
            }
        }

        self.finished.notify_waiters();
        self.wake.notify_one();
    }

    pub fn get_queue_status(&self, tool: &str) -> Option<QueueStatus> {
        let queue = self.queues.get(tool)?;
        let state = queue.lock();
        Some(QueueStatus {
            tool: tool.to_string(),
            max_concurrent: state.limits.max_concurrent,
            max_pending: state.limits.max_pending,
            rate_limit_per_minute: state.limits.rate_limit_per_minute,
            pending: state.pending.values().cloned().collect(),
            processing: state.processing.clone(),
            completed_count: state.completed.len(),
            failed_count: state.failed.len(),
            metrics: state.metrics.clone(),
        })
    }

    pub fn get_all_queue_statuses(&self) -> BTreeMap<String, QueueStatus> {
        let tools: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        tools
            .into_iter()
            .filter_map(|tool| self.get_queue_status(&tool).map(|status| (tool, status)))
            .collect()
    }

    /// Look up an item in any state.
    pub fn get_item(&self, queue_id: &str) -> Option<QueueItem> {
        self.queues
            .iter()
            .find_map(|entry| entry.value().lock().find(queue_id).cloned())
    }

    /// Wait until the item reaches `Completed` or `Failed`, up to `wait`.
    /// Returns `None` on timeout or when the item no longer exists.
    pub async fn wait_for_result(&self, queue_id: &str, wait: Duration) -> Option<QueueItem> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let item = self.get_item(queue_id)?;
            if matches!(
                item.status,
                QueueItemStatus::Completed | QueueItemStatus::Failed
            ) {
                return Some(item);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Drop all pending and processing bookkeeping. In-flight executor calls
    /// keep running; their results are discarded when they arrive.
    pub fn clear_all_queues(&self) -> usize {
        let mut dropped = 0;
        for entry in self.queues.iter() {
            let mut state = entry.value().lock();
            dropped += state.pending.len() + state.processing.len();
            state.pending.clear();
            state.processing.clear();
            state.generation += 1;
        }
        info!(dropped, "Cleared all command queues");
        self.finished.notify_waiters();
        dropped
    }

    /// Dispatch loop: ticks on the configured interval and on every wake-up.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval_timer = interval(self.settings.dispatch_interval());
        info!(
            "Starting command queue dispatch task with {:?} interval",
            self.settings.dispatch_interval()
        );

        loop {
            tokio::select! {
                _ = interval_timer.tick() => {}
                _ = self.wake.notified() => {}
                _ = shutdown_rx.changed() => {
                    info!("Command queue dispatch task received shutdown signal");
                    break;
                }
            }
            self.dispatch_tick();
        }
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("tools", &self.queues.len())
            .finish()
    }
}
