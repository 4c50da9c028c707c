//! Tracing subscriber setup for hosts and the bundled binary.

use tracing_subscriber::{
    filter::Directive, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::error::{ResourceError, ResourceResult};

/// `RUST_LOG` when set and non-empty, otherwise `default_directive` alone.
fn build_filter(default_directive: &str, rust_log: Option<&str>) -> ResourceResult<EnvFilter> {
    let directive: Directive = default_directive
        .parse()
        .map_err(|e| ResourceError::Config(format!("invalid log directive: {}", e)))?;

    match rust_log.map(str::trim).filter(|v| !v.is_empty()) {
        Some(env) => EnvFilter::try_new(env)
            .map_err(|e| ResourceError::Config(format!("invalid RUST_LOG: {}", e))),
        None => Ok(EnvFilter::default().add_directive(directive)),
    }
}

/// Install a global subscriber writing to stderr.
///
/// `RUST_LOG` replaces `default_directive` (for example
/// `"cli_resources=info"`) when it is set. Set `LOG_FORMAT=json` for
/// structured output. Fails if a global subscriber is already set.
pub fn init_tracing(default_directive: &str) -> ResourceResult<()> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(default_directive, rust_log.as_deref())?;

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .try_init()
    };

    installed.map_err(|e| ResourceError::Config(format!("tracing already initialized: {}", e)))
}
