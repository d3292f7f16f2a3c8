//! runbook-core: Script execution runtime
//!
//! Hosts one script engine per run, exposes the native operations scripts
//! call (shell, SSH, secrets, files, archives, hashing, HTTP, logging) and
//! manages the lifecycle of each run.

pub mod bridge;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod state;
pub mod value;

pub use bridge::HostBridge;
pub use config::{RunConfig, SecretDefinition, SecretsFile};
pub use context::ExecutionContext;
pub use controller::{ExecutionController, RunHandle, RunReport, ScriptSource};
pub use error::{ErrorKind, RunError};
pub use state::RunState;
pub use value::{Fields, ScriptValue};
