use crate::error::{Error, Result};

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Dependencies that are only interesting when something is wrong with them.
const QUIET_DEPENDENCIES: &[&str] = &["hyper=warn", "h2=warn", "rustls=warn", "notify=warn"];

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn env_filter(log_filter: &str) -> Result<EnvFilter> {
    let directives = QUIET_DEPENDENCIES
        .iter()
        .copied()
        .chain(std::iter::once(log_filter))
        .collect::<Vec<_>>()
        .join(",");

    EnvFilter::try_new(&directives)
        .map_err(|e| Error::Telemetry(format!("invalid log filter {log_filter:?}: {e}")))
}

/// Install the global subscriber. `log_filter` follows `EnvFilter` syntax and
/// takes precedence over the defaults for noisy dependencies.
pub fn init(log_filter: &str, log_format: LogFormat) -> Result<()> {
    let filter = env_filter(log_filter)?;

    let collector = Registry::default().with(filter);
    let installed = match log_format {
        LogFormat::Json => collector.with(fmt::layer().json()).try_init(),
        LogFormat::Text => collector.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Telemetry(format!("cannot install log subscriber: {e}")))
}
