//! Seams to the outside world.
//!
//! The managers never talk to a tool process directly. Commands go through a
//! [`CommandExecutor`], connections come from a [`Connector`], faults are
//! reported to an [`ErrorSink`] and mutating operations consult a
//! [`FeatureGate`]. All four are injected once through [`Dependencies`].

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::{
    error::{ExecutorError, ResourceResult},
    gate::{AlwaysEnabled, FeatureGate},
};

/// A command addressed to a backend tool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Stable key for caching results of query-like commands.
    pub fn cache_key(&self) -> String {
        if self.args.is_empty() {
            self.name.clone()
        } else {
            format!("{}\u{1f}{}", self.name, self.args.join("\u{1f}"))
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Outcome reported by the executor for one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionOutput {
    pub fn ok(data: impl Into<Value>) -> Self {
        Self {
            success: true,
            data: Some(data.into()),
            error: None,
        }
    }

    pub fn empty() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Low-level executor that actually talks to a tool.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute_command(
        &self,
        tool: &str,
        command: &Command,
    ) -> Result<ExecutionOutput, ExecutorError>;
}

/// Opaque handle to an established tool connection.
#[async_trait]
pub trait ToolConnection: Send + Sync {
    /// Whether the underlying link is still usable.
    fn is_open(&self) -> bool {
        true
    }

    async fn close(&self) {}
}

/// Establishes connections to tools for the pool.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, tool: &str) -> ResourceResult<Arc<dyn ToolConnection>>;
}

/// Receives faults that managers absorb instead of propagating.
pub trait ErrorSink: Send + Sync {
    fn handle_error(&self, error: &dyn std::error::Error, context: &str);
}

/// Default sink: logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn handle_error(&self, error: &dyn std::error::Error, context: &str) {
        error!(context, error = %error, "Resource layer fault");
    }
}

/// Connection handle that carries no transport; always open.
#[derive(Debug, Default)]
pub struct NullConnection;

#[async_trait]
impl ToolConnection for NullConnection {}

/// Connector for tools that need no transport setup.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullConnector;

#[async_trait]
impl Connector for NullConnector {
    async fn connect(&self, _tool: &str) -> ResourceResult<Arc<dyn ToolConnection>> {
        Ok(Arc::new(NullConnection))
    }
}

/// Executor that fails every command; backs the inert layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableExecutor;

#[async_trait]
impl CommandExecutor for UnavailableExecutor {
    async fn execute_command(
        &self,
        tool: &str,
        _command: &Command,
    ) -> Result<ExecutionOutput, ExecutorError> {
        Err(ExecutorError::Unavailable(tool.to_string()))
    }
}

/// Collaborators injected into every manager.
#[derive(Clone)]
pub struct Dependencies {
    pub executor: Arc<dyn CommandExecutor>,
    pub connector: Arc<dyn Connector>,
    pub error_sink: Arc<dyn ErrorSink>,
    pub gate: Arc<dyn FeatureGate>,
}

impl Dependencies {
    /// Executor plus defaults: null connector, tracing sink, all features on.
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            connector: Arc::new(NullConnector),
            error_sink: Arc::new(TracingErrorSink),
            gate: Arc::new(AlwaysEnabled),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_error_sink(mut self, error_sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = error_sink;
        self
    }

    pub fn with_gate(mut self, gate: Arc<dyn FeatureGate>) -> Self {
        self.gate = gate;
        self
    }
}

impl fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependencies").finish_non_exhaustive()
    }
}

/// Result of an isolated executor call.
pub(crate) struct IsolatedExecution {
    pub output: ExecutionOutput,
    /// The executor returned an error or panicked.
    pub faulted: bool,
}

/// Run one command on its own task so an executor panic cannot unwind into
/// the caller. Errors and panics are reported to the sink and folded into a
/// failed [`ExecutionOutput`].
pub(crate) async fn execute_isolated(
    deps: &Dependencies,
    tool: &str,
    command: &Command,
    context: &str,
) -> IsolatedExecution {
    let executor = Arc::clone(&deps.executor);
    let task_tool = tool.to_string();
    let task_command = command.clone();

    let joined = tokio::spawn(async move {
        executor
            .execute_command(&task_tool, &task_command)
            .await
    })
    .await;

    let err = match joined {
        Ok(Ok(output)) => {
            return IsolatedExecution {
                output,
                faulted: false,
            }
        }
        Ok(Err(err)) => err,
        Err(join_err) => ExecutorError::Panicked(join_err.to_string()),
    };

    deps.error_sink.handle_error(&err, context);
    IsolatedExecution {
        output: ExecutionOutput::failure(err.to_string()),
        faulted: true,
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        contexts: Mutex<Vec<String>>,
    }

    impl ErrorSink for RecordingSink {
        fn handle_error(&self, _error: &dyn std::error::Error, context: &str) {
            self.contexts.lock().push(context.to_string());
        }
    }

    struct PanickingExecutor;

    #[async_trait]
    impl CommandExecutor for PanickingExecutor {
        async fn execute_command(
            &self,
            _tool: &str,
            _command: &Command,
        ) -> Result<ExecutionOutput, ExecutorError> {
            panic!("tool process crashed");
        }
    }

    struct EchoExecutor;

    #[async_trait]
    impl CommandExecutor for EchoExecutor {
        async fn execute_command(
            &self,
            tool: &str,
            command: &Command,
        ) -> Result<ExecutionOutput, ExecutorError> {
            Ok(ExecutionOutput::ok(format!("{}: {}", tool, command)))
        }
    }

    #[test]
    fn test_command_builder_and_display() {
        let cmd = Command::new("show").arg("ue").args(["--id", "7"]);
        assert_eq!(cmd.args, vec!["ue", "--id", "7"]);
        assert_eq!(cmd.to_string(), "show ue --id 7");
    }

    #[test]
    fn test_cache_key_distinguishes_argument_boundaries() {
        let a = Command::new("show").args(["a b"]);
        let b = Command::new("show").args(["a", "b"]);
        assert_ne!(a.cache_key(), b.cache_key());
        assert_eq!(Command::new("status").cache_key(), "status");
    }

    #[test]
    fn test_execution_output_serialization() {
        let json = serde_json::to_value(ExecutionOutput::failure("boom")).unwrap();
        assert_eq!(json, serde_json::json!({"success": false, "error": "boom"}));
    }

    #[tokio::test]
    async fn test_execute_isolated_success() {
        let deps = Dependencies::new(Arc::new(EchoExecutor));
        let result = execute_isolated(&deps, "amf", &Command::new("status"), "test").await;
        assert!(!result.faulted);
        assert_eq!(result.output, ExecutionOutput::ok("amf: status"));
    }

    #[tokio::test]
    async fn test_execute_isolated_contains_panic() {
        let sink = Arc::new(RecordingSink::default());
        let deps = Dependencies::new(Arc::new(PanickingExecutor))
            .with_error_sink(Arc::clone(&sink) as Arc<dyn ErrorSink>);

        let result = execute_isolated(&deps, "amf", &Command::new("status"), "queue.dispatch").await;

        assert!(result.faulted);
        assert!(!result.output.success);
        assert_eq!(sink.contexts.lock().as_slice(), ["queue.dispatch"]);
    }

    #[tokio::test]
    async fn test_unavailable_executor_reports_to_sink() {
        let sink = Arc::new(RecordingSink::default());
        let deps = Dependencies::new(Arc::new(UnavailableExecutor))
            .with_error_sink(Arc::clone(&sink) as Arc<dyn ErrorSink>);

        let result = execute_isolated(&deps, "smf", &Command::new("ping"), "session.execute").await;
        assert!(result.faulted);
        assert!(result.output.error.unwrap().contains("unavailable"));
        assert_eq!(sink.contexts.lock().len(), 1);
    }
}
