//! Process-backed executor and connector.
//!
//! Each tool maps to a local program. A command runs as
//! `program [tool args...] <command name> [command args...]` with a timeout;
//! the child is killed if the timeout fires.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::{
    core::config::{ResourceConfig, ToolConfig},
    error::{ExecutorError, ResourceError, ResourceResult},
    executor::{Command, CommandExecutor, Connector, ExecutionOutput, ToolConnection},
};

/// Maximum captured bytes per output stream
const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
struct ToolProgram {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

fn programs(tools: &[ToolConfig]) -> HashMap<String, ToolProgram> {
    tools
        .iter()
        .filter_map(|tool| {
            tool.program.as_ref().map(|program| {
                (
                    tool.name.clone(),
                    ToolProgram {
                        program: program.clone(),
                        args: tool.args.clone(),
                        timeout: tool.command_timeout(),
                    },
                )
            })
        })
        .collect()
}

/// Truncate output to max bytes on a UTF-8 boundary
fn truncate_output(output: &[u8], max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return String::from_utf8_lossy(output).into_owned();
    }
    let mut end = max_bytes;
    while end > 0 && (output[end] & 0xC0) == 0x80 {
        end -= 1;
    }
    String::from_utf8_lossy(&output[..end]).into_owned()
}

/// stdout as JSON when it parses, otherwise as a trimmed string.
fn parse_stdout(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    tools: HashMap<String, ToolProgram>,
}

impl ProcessExecutor {
    /// Tools without a `program` are skipped; commands for them fail as
    /// unavailable.
    pub fn new(tools: &[ToolConfig]) -> Self {
        Self {
            tools: programs(tools),
        }
    }

    pub fn from_config(config: &ResourceConfig) -> Self {
        Self::new(&config.tools)
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute_command(
        &self,
        tool: &str,
        command: &Command,
    ) -> Result<ExecutionOutput, ExecutorError> {
        let entry = self.tools.get(tool).ok_or_else(|| {
            ExecutorError::Unavailable(format!("no program configured for '{}'", tool))
        })?;

        let mut cmd = tokio::process::Command::new(&entry.program);
        cmd.args(&entry.args)
            .arg(&command.name)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(tool, program = %entry.program, command = %command, "Spawning tool process");
        let output = match tokio::time::timeout(entry.timeout, cmd.output()).await {
            Ok(result) => result?,
            // The child is dropped (and killed) with the future
            Err(_) => return Err(ExecutorError::Timeout(entry.timeout.as_secs())),
        };

        let stdout = truncate_output(&output.stdout, MAX_OUTPUT_BYTES);
        if output.status.success() {
            return Ok(ExecutionOutput::ok(parse_stdout(&stdout)));
        }

        let stderr = truncate_output(&output.stderr, MAX_OUTPUT_BYTES);
        let message = match stderr.trim() {
            "" => match output.status.code() {
                Some(code) => format!("exited with status {}", code),
                None => "terminated by signal".to_string(),
            },
            text => text.to_string(),
        };
        Ok(ExecutionOutput::failure(message))
    }
}

/// Handle for a tool whose program has been located.
#[derive(Debug)]
pub struct ProcessLink {
    program: PathBuf,
    open: AtomicBool,
}

impl ProcessLink {
    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl ToolConnection for ProcessLink {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// Connector that confirms a tool's program exists before handing out a link.
#[derive(Debug, Clone, Default)]
pub struct ProcessConnector {
    tools: HashMap<String, ToolProgram>,
}

impl ProcessConnector {
    pub fn new(tools: &[ToolConfig]) -> Self {
        Self {
            tools: programs(tools),
        }
    }

    pub fn from_config(config: &ResourceConfig) -> Self {
        Self::new(&config.tools)
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

/// Resolve `program` directly when it contains a path separator, otherwise
/// through `PATH`.
async fn resolve_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_file(candidate).await.then(|| candidate.to_path_buf());
    }

    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let full = dir.join(program);
        if is_file(&full).await {
            return Some(full);
        }
    }
    None
}

#[async_trait]
impl Connector for ProcessConnector {
    async fn connect(&self, tool: &str) -> ResourceResult<Arc<dyn ToolConnection>> {
        let entry = self
            .tools
            .get(tool)
            .ok_or_else(|| ResourceError::UnknownTool(tool.to_string()))?;

        match resolve_program(&entry.program).await {
            Some(program) => Ok(Arc::new(ProcessLink {
                program,
                open: AtomicBool::new(true),
            })),
            None => Err(ResourceError::ConnectionFailed {
                tool: tool.to_string(),
                attempts: 1,
                details: format!("program not found: {}", entry.program),
            }),
        }
    }
}
