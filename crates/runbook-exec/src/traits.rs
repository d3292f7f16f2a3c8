//! Executor traits used by the script bridge

use std::path::Path;

use async_trait::async_trait;

use crate::error::ExecError;
use crate::result::{CommandOptions, ShellResult};
use crate::ssh::Tunnel;
use crate::target::ResolvedTarget;

/// Runs commands on the local machine
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `cmd` through the configured shell
    async fn run(&self, cmd: &str, options: &CommandOptions) -> Result<ShellResult, ExecError>;

    /// Get the runner type name (for logging)
    fn runner_type(&self) -> &'static str;
}

/// Performs operations against a remote host
///
/// Every method receives fully resolved credentials; secret lookup happens
/// before the connector is reached.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Run a command on the remote host
    async fn exec(&self, target: &ResolvedTarget, cmd: &str) -> Result<ShellResult, ExecError>;

    /// Copy a local file to the remote host, returning the bytes written
    async fn upload(
        &self,
        target: &ResolvedTarget,
        local: &Path,
        remote: &str,
    ) -> Result<u64, ExecError>;

    /// Copy a remote file to the local machine, returning the bytes written
    async fn download(
        &self,
        target: &ResolvedTarget,
        remote: &str,
        local: &Path,
    ) -> Result<u64, ExecError>;

    /// Forward a local port to `remote_host:remote_port` through the target
    async fn open_tunnel(
        &self,
        target: &ResolvedTarget,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Tunnel, ExecError>;
}
