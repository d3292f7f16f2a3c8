//! Native operations exposed to scripts
//!
//! A [`HostBridge`] belongs to exactly one run. It carries that run's
//! context, local runner, remote connector and working directory, and
//! registers every operation into the run's engine. Each operation checks
//! the cancellation token first and reports failures as thrown
//! `#{kind, message}` values.

mod archive;
mod fs;
mod hash;
mod http;
mod secrets;
mod shell;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use rhai::{Dynamic, Engine, EvalAltResult, Map};
use runbook_exec::{LocalRunner, RemoteConnector, SshConnector};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::config::RunConfig;
use crate::context::ExecutionContext;
use crate::error::RunError;

/// Result type of registered native functions
pub(crate) type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

/// Tracing target for script output
pub const SCRIPT_LOG_TARGET: &str = "runbook::script";

/// Native side of one run
pub struct HostBridge {
    ctx: Arc<ExecutionContext>,
    runtime: Handle,
    runner: LocalRunner,
    remote: Arc<dyn RemoteConnector>,
    cwd: Mutex<PathBuf>,
}

impl std::fmt::Debug for HostBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBridge")
            .field("run_id", &self.ctx.run_id())
            .field("runner", &self.runner)
            .field("cwd", &self.cwd())
            .finish_non_exhaustive()
    }
}

impl HostBridge {
    /// Create a bridge for `ctx` using the SSH connector
    #[must_use]
    pub fn new(ctx: Arc<ExecutionContext>, config: &RunConfig, runtime: Handle) -> Self {
        let runner = LocalRunner::new()
            .with_shell(config.shell.clone())
            .with_secrets(Arc::clone(ctx.secrets()));
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            ctx,
            runtime,
            runner,
            remote: Arc::new(SshConnector::new()),
            cwd: Mutex::new(cwd),
        }
    }

    /// Replace the remote connector
    #[must_use]
    pub fn with_remote(mut self, remote: Arc<dyn RemoteConnector>) -> Self {
        self.remote = remote;
        self
    }

    /// Start in `dir` instead of the process working directory
    #[must_use]
    pub fn with_cwd(self, dir: impl Into<PathBuf>) -> Self {
        *self.cwd.lock().unwrap_or_else(PoisonError::into_inner) = dir.into();
        self
    }

    /// Context of the run this bridge serves
    #[must_use]
    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.ctx
    }

    /// Register every native operation and output hook into `engine`
    pub fn register(self: &Arc<Self>, engine: &mut Engine) {
        register_logging(engine, self);
        shell::register(engine, self);
        secrets::register(engine, self);
        fs::register(engine, self);
        archive::register(engine, self);
        hash::register(engine, self);
        http::register(engine, self);
    }

    /// Run a bridged operation: abort check, then `f`, with errors thrown
    /// into the script
    pub(crate) fn invoke<T>(
        &self,
        op: &str,
        f: impl FnOnce() -> Result<T, RunError>,
    ) -> ScriptResult<T> {
        self.ctx.ensure_active().map_err(|e| e.to_script())?;
        f().map_err(|e| {
            debug!(run_id = %self.ctx.run_id(), op = op, error = %e, "bridged call failed");
            e.to_script()
        })
    }

    /// Drive an async operation to completion from the engine thread
    ///
    /// Abort wins: the operation is dropped and `RunError::Aborted` returned.
    pub(crate) fn block_on<T>(
        &self,
        fut: impl Future<Output = Result<T, RunError>>,
    ) -> Result<T, RunError> {
        let token = self.ctx.cancel_token().clone();
        self.runtime.block_on(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => Err(RunError::Aborted),
                result = fut => result,
            }
        })
    }

    /// Current working directory of the run
    pub(crate) fn cwd(&self) -> PathBuf {
        self.cwd
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Change the working directory; relative paths are taken from the current one
    pub(crate) fn set_cwd(&self, dir: &str) -> Result<PathBuf, RunError> {
        let target = self.resolve_path(dir);
        let metadata = std::fs::metadata(&target)
            .map_err(|e| RunError::NotFound(format!("{}: {e}", target.display())))?;
        if !metadata.is_dir() {
            return Err(RunError::Execution(format!(
                "{} is not a directory",
                target.display()
            )));
        }
        let target = fs::normalize(&target);
        *self.cwd.lock().unwrap_or_else(PoisonError::into_inner) = target.clone();
        Ok(target)
    }

    /// Absolute form of `path` relative to the run's working directory
    pub(crate) fn resolve_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd().join(path)
        }
    }
}

/// Options argument: unit means none, anything else must be a map
pub(crate) fn options_map(op: &str, value: &Dynamic) -> Result<Map, RunError> {
    if value.is_unit() {
        return Ok(Map::new());
    }
    value
        .read_lock::<Map>()
        .map(|m| m.clone())
        .ok_or_else(|| {
            RunError::Type(format!(
                "{op}: expected options map, found {}",
                value.type_name()
            ))
        })
}

fn register_logging(engine: &mut Engine, bridge: &Arc<HostBridge>) {
    let run_id = bridge.ctx.run_id();

    engine.on_print(|text| println!("{text}"));
    engine.on_debug(move |text, source, pos| {
        debug!(
            target: SCRIPT_LOG_TARGET,
            run_id = %run_id,
            source = source.unwrap_or_default(),
            position = %pos,
            "{text}"
        );
    });

    let b = Arc::clone(bridge);
    engine.register_fn("log_info", move |msg: Dynamic| {
        b.invoke("log_info", || {
            info!(target: SCRIPT_LOG_TARGET, run_id = %run_id, "{msg}");
            Ok(())
        })
    });
    let b = Arc::clone(bridge);
    engine.register_fn("log_warn", move |msg: Dynamic| {
        b.invoke("log_warn", || {
            warn!(target: SCRIPT_LOG_TARGET, run_id = %run_id, "{msg}");
            Ok(())
        })
    });
    let b = Arc::clone(bridge);
    engine.register_fn("log_error", move |msg: Dynamic| {
        b.invoke("log_error", || {
            error!(target: SCRIPT_LOG_TARGET, run_id = %run_id, "{msg}");
            Ok(())
        })
    });
}
