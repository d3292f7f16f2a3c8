//! runbook CLI
//!
//! Runs one automation script: top-level code, then each named entry point.

use std::process::ExitCode;

use clap::Parser;
use color_eyre::Result;
use runbook_core::{ExecutionController, RunState, ScriptSource, SecretsFile};
use runbook_exec::SecretStore;
use tokio::runtime::Handle;
use tracing::{debug, warn};

mod cli;
mod config;
mod logging;

use cli::Cli;
use config::Config;

/// Process exit status for a final run state
fn exit_status(state: RunState) -> u8 {
    match state {
        RunState::Completed => 0,
        RunState::Aborted => 130,
        RunState::Created | RunState::Running | RunState::Failed => 1,
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let (mut config, config_path) = Config::load_default(cli.config.as_deref())?;
    config.apply_cli(&cli);

    let env_level = std::env::var(logging::LOG_ENV).ok();
    logging::init(
        &logging::filter_directive(
            cli.log_level.as_deref(),
            env_level.as_deref(),
            config.runtime.log_level.as_deref(),
        ),
        cli.log_format,
    )?;
    match &config_path {
        Some(path) => debug!(config = %path.display(), "configuration loaded"),
        None => debug!("no config file found, using defaults"),
    }

    let source = match &config.runtime.script {
        Some(path) => ScriptSource::from_file(path),
        None => ScriptSource::default_in(&std::env::current_dir()?),
    };
    let secrets = match &config.runtime.secrets {
        Some(path) => SecretsFile::load(path)?.into_store()?,
        None => SecretStore::new(),
    };

    let controller = ExecutionController::with_runtime(config.run_config(), Handle::current());
    let handle = controller.start(source, secrets, cli.entry_points)?;

    let abort = handle.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, aborting run");
            abort.abort();
        }
    });

    let report = handle.wait().await;
    if let Some(error) = &report.error {
        eprintln!("runbook: {} ({})", error, report.state);
    }
    Ok(ExitCode::from(exit_status(report.state)))
}
