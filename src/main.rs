//! Operator CLI for the resource layer
//!
//! Usage:
//!   cli-resources --config tools.yaml check
//!   cli-resources --config tools.yaml exec --tool amf show ue --id 7
//!   cli-resources --config tools.yaml exec --tool amf --queue --priority 1 status
//!   cli-resources --config tools.yaml status

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing::info;

use cli_resources::{
    logging::init_tracing, Command, Dependencies, EnqueueOptions, ProcessConnector,
    ProcessExecutor, ResourceConfig, ResourceLayer, SessionOptions,
};

#[derive(Parser)]
#[command(name = "cli-resources")]
#[command(about = "Run commands against external CLI tools through pooled sessions and queues")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Resource layer configuration (YAML)
    #[arg(long, short, env = "CLI_RESOURCES_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace). Default is warn.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and list its tools
    Check,
    /// Run one command against a tool
    Exec {
        /// Tool name from the configuration
        #[arg(long, short)]
        tool: String,

        /// Submit through the priority queue instead of a session
        #[arg(long)]
        queue: bool,

        /// Queue priority; lower runs first
        #[arg(long, default_value_t = cli_resources::queue::DEFAULT_PRIORITY)]
        priority: u8,

        /// Seconds to wait for a queued command
        #[arg(long, default_value_t = 60)]
        wait: u64,

        /// Command name
        command: String,

        /// Command arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Print the layer status snapshot as JSON
    Status,
}

fn directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "cli_resources=warn",
        1 => "cli_resources=info",
        2 => "cli_resources=debug",
        _ => "cli_resources=trace",
    }
}

async fn load_config(path: Option<PathBuf>) -> Result<ResourceConfig> {
    let path = path.context("no configuration given (use --config or CLI_RESOURCES_CONFIG)")?;
    ResourceConfig::from_file(&path)
        .await
        .with_context(|| format!("failed to load {}", path.display()))
}

fn build_layer(config: ResourceConfig) -> Result<ResourceLayer> {
    let executor = Arc::new(ProcessExecutor::from_config(&config));
    let connector = Arc::new(ProcessConnector::from_config(&config));
    let deps = Dependencies::new(executor).with_connector(connector);
    Ok(ResourceLayer::new(config, deps)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(directive(cli.verbose))?;

    let config = load_config(cli.config).await?;

    match cli.command {
        Commands::Check => {
            for tool in &config.tools {
                println!(
                    "{}: program={} pool={}..{} max_concurrent={} cache={}@{}s",
                    tool.name,
                    tool.program.as_deref().unwrap_or("-"),
                    tool.pool.min_size,
                    tool.pool.max_size,
                    tool.queue.max_concurrent,
                    tool.cache.max_size,
                    tool.cache.ttl,
                );
            }
            println!("{} tool(s), configuration OK", config.tools.len());
        }
        Commands::Status => {
            let layer = build_layer(config)?;
            println!("{}", serde_json::to_string_pretty(&layer.status())?);
        }
        Commands::Exec {
            tool,
            queue,
            priority,
            wait,
            command,
            args,
        } => {
            let layer = build_layer(config)?;
            let handle = layer.start();
            let command = Command::new(command).args(args);

            let output = if queue {
                let id = layer
                    .queue()
                    .enqueue(&tool, command, EnqueueOptions::priority(priority))?;
                info!(queue_id = %id, "Command queued");
                match layer
                    .queue()
                    .wait_for_result(&id, Duration::from_secs(wait))
                    .await
                {
                    Some(item) => item.result,
                    None => {
                        handle.shutdown().await;
                        bail!("queued command {} did not finish within {}s", id, wait);
                    }
                }
            } else {
                let session_id = layer
                    .sessions()
                    .create_session(&tool, SessionOptions::default())
                    .await?;
                let output = layer
                    .sessions()
                    .execute_in_session(&session_id, command)
                    .await?;
                layer.sessions().close_session(&session_id).await?;
                Some(output)
            };

            println!("{}", serde_json::to_string_pretty(&output)?);
            println!("{}", serde_json::to_string_pretty(&layer.status())?);
            handle.shutdown().await;
        }
    }

    Ok(())
}
