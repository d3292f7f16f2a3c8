//! Run lifecycle: one engine per run on its own worker thread
//!
//! [`ExecutionController::start`] spawns the worker and returns a
//! [`RunHandle`]. The worker compiles the script, registers the bridge, runs
//! top-level code and then each entry point in order. Whatever happens, the
//! run's context is closed once and exactly one [`RunReport`] is published.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rhai::{CallFnOptions, Dynamic, Engine, Scope};
use runbook_exec::{RemoteConnector, SecretStore};
use serde::Serialize;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bridge::HostBridge;
use crate::config::RunConfig;
use crate::context::ExecutionContext;
use crate::error::RunError;
use crate::state::RunState;

/// Entry point invoked when the caller names none
pub const DEFAULT_ENTRY_POINT: &str = "main";

/// Script file looked up when none is given
pub const DEFAULT_SCRIPT: &str = "Runbook";

/// Fallback for [`DEFAULT_SCRIPT`]
pub const DEFAULT_SCRIPT_FALLBACK: &str = "Runbook.rhai";

/// Callback invoked once per finished run
pub type DoneCallback = Arc<dyn Fn(&RunReport) + Send + Sync>;

/// Where the script comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    File(PathBuf),
    Inline { name: String, code: String },
}

impl ScriptSource {
    /// Script read from `path` when the run starts
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        ScriptSource::File(path.into())
    }

    /// Script given as text
    pub fn inline(code: impl Into<String>) -> Self {
        ScriptSource::Inline {
            name: "<inline>".to_string(),
            code: code.into(),
        }
    }

    /// `Runbook` in `dir`, or `Runbook.rhai` if only that exists
    #[must_use]
    pub fn default_in(dir: &Path) -> Self {
        let primary = dir.join(DEFAULT_SCRIPT);
        let fallback = dir.join(DEFAULT_SCRIPT_FALLBACK);
        if !primary.exists() && fallback.exists() {
            ScriptSource::File(fallback)
        } else {
            ScriptSource::File(primary)
        }
    }

    /// Name used in logs and error messages
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            ScriptSource::File(path) => path.display().to_string(),
            ScriptSource::Inline { name, .. } => name.clone(),
        }
    }

    fn load(&self) -> Result<String, RunError> {
        match self {
            ScriptSource::File(path) => std::fs::read_to_string(path).map_err(|e| {
                RunError::NotFound(format!("script file {}: {e}", path.display()))
            }),
            ScriptSource::Inline { code, .. } => Ok(code.clone()),
        }
    }
}

/// Outcome of one run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub state: RunState,
    /// Terminating error for `Failed` and `Aborted` runs
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<RunError>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

fn serialize_error<S: serde::Serializer>(
    error: &Option<RunError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

impl RunReport {
    /// Whether the run completed without error
    #[must_use]
    pub fn success(&self) -> bool {
        self.state == RunState::Completed
    }
}

/// One-shot completion signal usable from async and blocking code
#[derive(Default)]
struct DoneSignal {
    report: Mutex<Option<RunReport>>,
    cond: Condvar,
    notify: Notify,
}

impl DoneSignal {
    fn lock(&self) -> MutexGuard<'_, Option<RunReport>> {
        self.report.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store the report; `false` if one was already published
    fn publish(&self, report: RunReport) -> bool {
        {
            let mut slot = self.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(report);
        }
        self.cond.notify_all();
        self.notify.notify_waiters();
        true
    }

    fn get(&self) -> Option<RunReport> {
        self.lock().clone()
    }

    async fn wait(&self) -> RunReport {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(report) = self.get() {
                return report;
            }
            notified.await;
        }
    }

    fn wait_blocking(&self) -> RunReport {
        let mut slot = self.lock();
        loop {
            if let Some(report) = slot.as_ref() {
                return report.clone();
            }
            slot = self
                .cond
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// State shared between a handle and its worker
struct RunShared {
    ctx: Arc<ExecutionContext>,
    state: Mutex<RunState>,
    done: DoneSignal,
}

impl RunShared {
    fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: RunState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.can_transition_to(next) {
            debug!(run_id = %self.ctx.run_id(), from = %*state, to = %next, "run state change");
            *state = next;
        } else {
            warn!(run_id = %self.ctx.run_id(), from = %*state, to = %next, "ignored invalid run transition");
        }
    }
}

/// Cloneable abort trigger for a run
#[derive(Clone)]
pub struct AbortHandle {
    ctx: Arc<ExecutionContext>,
}

impl AbortHandle {
    /// Request cancellation
    pub fn abort(&self) {
        info!(run_id = %self.ctx.run_id(), "abort requested");
        self.ctx.abort();
    }
}

impl std::fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortHandle")
            .field("run_id", &self.ctx.run_id())
            .finish()
    }
}

/// Caller's view of a started run
pub struct RunHandle {
    shared: Arc<RunShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl RunHandle {
    /// Run ID
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.shared.ctx.run_id()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> RunState {
        self.shared.state()
    }

    /// Request cancellation; the run ends `Aborted` at the next statement
    /// boundary or bridged call
    pub fn abort(&self) {
        self.abort_handle().abort();
    }

    /// Abort trigger that can outlive borrows of this handle
    #[must_use]
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            ctx: Arc::clone(&self.shared.ctx),
        }
    }

    /// Report if the run has finished
    #[must_use]
    pub fn try_report(&self) -> Option<RunReport> {
        self.shared.done.get()
    }

    /// Wait for the run to finish
    pub async fn wait(&self) -> RunReport {
        self.shared.done.wait().await
    }

    /// Wait for the run to finish, blocking the current thread
    ///
    /// Must not be called from inside an async task.
    pub fn wait_blocking(&self) -> RunReport {
        let report = self.shared.done.wait_blocking();
        self.join();
        report
    }

    fn join(&self) {
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread
            && thread.join().is_err()
        {
            error!(run_id = %self.id(), "run worker thread panicked");
        }
    }
}

/// Starts and supervises script runs
pub struct ExecutionController {
    config: RunConfig,
    runtime: Handle,
    /// Kept alive for the controller's lifetime when built by [`Self::new`]
    owned_runtime: Option<Arc<Runtime>>,
    remote: Option<Arc<dyn RemoteConnector>>,
    cwd: Option<PathBuf>,
    on_done: Option<DoneCallback>,
}

impl std::fmt::Debug for ExecutionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionController")
            .field("config", &self.config)
            .field("owns_runtime", &self.owned_runtime.is_some())
            .finish_non_exhaustive()
    }
}

impl ExecutionController {
    /// Create a controller with its own multi-threaded runtime
    ///
    /// # Errors
    /// Returns `RunError::Configuration` if the runtime cannot be built.
    pub fn new(config: RunConfig) -> Result<Self, RunError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("runbook-io")
            .build()
            .map_err(|e| RunError::Configuration(format!("failed to start runtime: {e}")))?;
        let handle = runtime.handle().clone();
        Ok(Self {
            owned_runtime: Some(Arc::new(runtime)),
            ..Self::with_runtime(config, handle)
        })
    }

    /// Create a controller driving native operations on an existing runtime
    ///
    /// The runtime must keep running while runs are in progress; a
    /// multi-threaded runtime is expected.
    #[must_use]
    pub fn with_runtime(config: RunConfig, runtime: Handle) -> Self {
        Self {
            config,
            runtime,
            owned_runtime: None,
            remote: None,
            cwd: None,
            on_done: None,
        }
    }

    /// Use `remote` instead of SSH for remote operations
    #[must_use]
    pub fn with_remote(mut self, remote: Arc<dyn RemoteConnector>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Start runs in `dir`
    #[must_use]
    pub fn with_cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Invoke `callback` once for every finished run
    #[must_use]
    pub fn on_done(mut self, callback: impl Fn(&RunReport) + Send + Sync + 'static) -> Self {
        self.on_done = Some(Arc::new(callback));
        self
    }

    /// Runtime settings
    #[must_use]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Start a run
    ///
    /// `entry_points` are invoked in order after top-level code; an empty
    /// list means `main`. The run owns `secrets` and closes them at the end.
    ///
    /// # Errors
    /// Returns `RunError::Execution` if the worker thread cannot be spawned.
    pub fn start(
        &self,
        source: ScriptSource,
        secrets: SecretStore,
        entry_points: Vec<String>,
    ) -> Result<RunHandle, RunError> {
        let ctx = Arc::new(ExecutionContext::new(secrets));
        let run_id = ctx.run_id();

        let mut bridge = HostBridge::new(Arc::clone(&ctx), &self.config, self.runtime.clone());
        if let Some(remote) = &self.remote {
            bridge = bridge.with_remote(Arc::clone(remote));
        }
        if let Some(dir) = &self.cwd {
            bridge = bridge.with_cwd(dir.clone());
        }

        let shared = Arc::new(RunShared {
            ctx,
            state: Mutex::new(RunState::Created),
            done: DoneSignal::default(),
        });

        let entry_points = if entry_points.is_empty() {
            vec![DEFAULT_ENTRY_POINT.to_string()]
        } else {
            entry_points
        };

        let worker = Worker {
            shared: Arc::clone(&shared),
            bridge: Arc::new(bridge),
            config: self.config.clone(),
            source,
            entry_points,
            on_done: self.on_done.clone(),
            _runtime: self.owned_runtime.clone(),
        };

        info!(run_id = %run_id, script = %worker.source.name(), "starting run");

        let thread = std::thread::Builder::new()
            .name(format!("runbook-run-{}", &run_id.simple().to_string()[..8]))
            .spawn(move || worker.run())
            .map_err(|e| {
                shared.ctx.close();
                RunError::Execution(format!("failed to spawn run thread: {e}"))
            })?;

        Ok(RunHandle {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Request cancellation of `handle`'s run
    pub fn abort(&self, handle: &RunHandle) {
        handle.abort();
    }
}

/// Everything the worker thread owns
struct Worker {
    shared: Arc<RunShared>,
    bridge: Arc<HostBridge>,
    config: RunConfig,
    source: ScriptSource,
    entry_points: Vec<String>,
    on_done: Option<DoneCallback>,
    _runtime: Option<Arc<Runtime>>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl Worker {
    fn run(self) {
        let started_at = Utc::now();
        let start = Instant::now();
        let run_id = self.shared.ctx.run_id();

        let outcome = catch_unwind(AssertUnwindSafe(|| self.execute()));
        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(run_id = %run_id, panic = %message, "native operation panicked");
                Some(RunError::Execution(format!("panic: {message}")))
            }
        };

        let state = match &error {
            None => RunState::Completed,
            Some(RunError::Aborted) => RunState::Aborted,
            Some(_) => RunState::Failed,
        };

        // Resources first, so waiters observe a torn-down context
        self.shared.ctx.close();
        self.shared.transition(state);

        let report = RunReport {
            run_id,
            state,
            error,
            started_at,
            duration: start.elapsed(),
        };

        match &report.error {
            None => info!(run_id = %run_id, duration = ?report.duration, "run completed"),
            Some(e) => warn!(run_id = %run_id, state = %state, error = %e, "run ended"),
        }

        if let Some(callback) = &self.on_done
            && catch_unwind(AssertUnwindSafe(|| callback(&report))).is_err()
        {
            error!(run_id = %run_id, "completion callback panicked");
        }
        self.shared.done.publish(report);
    }

    fn engine(&self) -> Engine {
        let mut engine = Engine::new();
        engine.set_max_operations(self.config.max_operations);

        let token = self.shared.ctx.cancel_token().clone();
        engine.on_progress(move |_ops| token.is_cancelled().then_some(Dynamic::UNIT));

        self.bridge.register(&mut engine);
        engine
    }

    fn execute(&self) -> Result<(), RunError> {
        let ctx = &self.shared.ctx;
        ctx.ensure_active()?;

        let name = self.source.name();
        let code = self.source.load()?;

        let engine = self.engine();
        let mut ast = engine
            .compile(&code)
            .map_err(|e| RunError::Compile(format!("{name}: {e}")))?;
        ast.set_source(name.as_str());

        // Every entry point must exist before anything runs
        for entry in &self.entry_points {
            let found = ast
                .iter_functions()
                .any(|f| f.name == entry.as_str() && f.params.is_empty());
            if !found {
                return Err(RunError::NotFound(format!(
                    "entry point {entry}() not defined in {name}"
                )));
            }
        }

        self.shared.transition(RunState::Running);
        debug!(run_id = %ctx.run_id(), "running top-level code");

        let mut scope = Scope::new();
        engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|e| RunError::from_script(&e))?;

        for entry in &self.entry_points {
            ctx.ensure_active()?;
            info!(run_id = %ctx.run_id(), entry = %entry, "invoking entry point");
            engine
                .call_fn_with_options::<Dynamic>(
                    CallFnOptions::new().eval_ast(false).rewind_scope(false),
                    &mut scope,
                    &ast,
                    entry,
                    (),
                )
                .map_err(|e| RunError::from_script(&e))?;
        }
        Ok(())
    }
}
