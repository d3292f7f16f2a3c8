//! Local command execution using `tokio::process`

use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, error, instrument, warn};

use crate::error::ExecError;
use crate::result::{CommandOptions, ShellResult};
use crate::secrets::SecretStore;
use crate::traits::CommandRunner;

/// Shell used when neither the options nor the runner name one
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Local command runner
///
/// Executes commands on the local machine as `<shell> -c <command>`.
#[derive(Debug, Clone)]
pub struct LocalRunner {
    /// Interpreter used when `CommandOptions::shell` is unset
    default_shell: String,
    /// Store used to resolve `CommandOptions::secret_id`
    secrets: Option<Arc<SecretStore>>,
}

impl LocalRunner {
    /// Create a new local runner using `/bin/sh`
    #[must_use]
    pub fn new() -> Self {
        Self {
            default_shell: DEFAULT_SHELL.to_string(),
            secrets: None,
        }
    }

    /// Set the default shell
    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.default_shell = shell.into();
        self
    }

    /// Resolve `secret_id` options against this store
    #[must_use]
    pub fn with_secrets(mut self, secrets: Arc<SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Build the environment overlay: secret-derived entries, then explicit ones
    fn environment(&self, options: &CommandOptions) -> Result<Vec<(String, String)>, ExecError> {
        let mut env = Vec::new();
        if let Some(id) = options.secret_id.as_deref() {
            let store = self.secrets.as_ref().ok_or_else(|| {
                ExecError::ConfigError(format!("secret {id} requested but no secret store is set"))
            })?;
            env.extend(store.resolve(id)?.command_env());
        }
        env.extend(options.env.iter().cloned());
        Ok(env)
    }

    /// Internal method to execute command
    #[instrument(skip(self, options), level = "debug")]
    async fn execute(&self, cmd: &str, options: &CommandOptions) -> Result<ShellResult, ExecError> {
        let start = Instant::now();
        let shell = options.shell.as_deref().unwrap_or(&self.default_shell);

        debug!(command = %cmd, shell = %shell, "executing local command");

        let mut command = Command::new(shell);
        command
            .arg("-c")
            .arg(cmd)
            .envs(self.environment(options)?)
            .stdin(if options.has_input() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &options.cwd {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| ExecError::SpawnError(format!("{shell}: {e}")))?;

        // Feed stdin from its own task so a chatty child can't block on a full
        // stdout pipe while we are still writing
        if let Some(mut stdin) = child.stdin.take() {
            let lines: Vec<String> = options.input_lines().map(|l| format!("{l}\n")).collect();
            tokio::spawn(async move {
                for line in lines {
                    if let Err(e) = stdin.write_all(line.as_bytes()).await {
                        debug!(error = %e, "stdin write failed, ignoring");
                        break;
                    }
                }
            });
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        let duration = start.elapsed();

        // Killed by signal => no code
        let code = output.status.code().unwrap_or(1);
        let out = String::from_utf8_lossy(&output.stdout).to_string();
        let err = String::from_utf8_lossy(&output.stderr).to_string();

        debug!(
            command = %cmd,
            code = code,
            duration = ?duration,
            "command completed"
        );

        if code != 0 {
            warn!(
                command = %cmd,
                code = code,
                stderr = %err,
                "command exited non-zero"
            );
        }

        Ok(ShellResult {
            code,
            out,
            err,
            duration,
        })
    }
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    #[instrument(skip(self, options), level = "debug")]
    async fn run(&self, cmd: &str, options: &CommandOptions) -> Result<ShellResult, ExecError> {
        let Some(limit) = options.timeout else {
            return self.execute(cmd, options).await;
        };

        let start = Instant::now();
        debug!(command = %cmd, timeout = ?limit, "executing with timeout");

        // Dropping the timed-out future drops the child, which kills it
        match timeout(limit, self.execute(cmd, options)).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    command = %cmd,
                    timeout = ?limit,
                    elapsed = ?start.elapsed(),
                    "command timed out"
                );
                Err(ExecError::Timeout { timeout: limit })
            }
        }
    }

    fn runner_type(&self) -> &'static str {
        "local"
    }
}
