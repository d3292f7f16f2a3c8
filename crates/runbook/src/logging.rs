//! Tracing subscriber setup

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::cli::LogFormat;

/// Environment variable holding a log filter
pub const LOG_ENV: &str = "RUNBOOK_LOG";

const DEFAULT_LEVEL: &str = "info";

/// Pick the filter directive: flag, then `RUNBOOK_LOG`, then config, then `info`
pub fn filter_directive(
    flag: Option<&str>,
    env: Option<&str>,
    config: Option<&str>,
) -> String {
    [flag, env, config]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|level| !level.is_empty())
        .unwrap_or(DEFAULT_LEVEL)
        .to_string()
}

/// Install the global subscriber; logs go to stderr
///
/// # Errors
/// Returns error if the directive is invalid or a subscriber is already set
pub fn init(directive: &str, format: LogFormat) -> eyre::Result<()> {
    let filter = EnvFilter::try_new(directive)
        .map_err(|e| eyre::eyre!("invalid log filter {directive:?}: {e}"))?;

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()?,
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?,
    }
    Ok(())
}
