//! runbook-exec: Local and remote command execution
//!
//! Provides the secret store, the local shell runner, and the SSH session
//! (exec, SFTP transfer, port forwarding) used by the script bridge.

pub mod error;
pub mod local;
pub mod result;
pub mod secrets;
pub mod ssh;
pub mod target;
pub mod traits;

pub use error::ExecError;
pub use local::LocalRunner;
pub use result::{CommandOptions, ShellResult};
pub use secrets::{ResolvedSecret, Secret, SecretError, SecretKind, SecretStore, SshCredentials, UserPassword};
pub use ssh::{SshConnector, SshSession, Tunnel};
pub use target::{RemoteTarget, ResolvedTarget, SshAuth};
pub use traits::{CommandRunner, RemoteConnector};
