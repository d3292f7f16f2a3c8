//! Result and option types for command execution

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Result of a single command execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellResult {
    /// Exit code (0 for success)
    pub code: i32,
    /// stdout output
    pub out: String,
    /// stderr output
    pub err: String,
    /// Time taken to execute
    #[serde(default)]
    pub duration: Duration,
}

impl ShellResult {
    /// Check if command succeeded (exit code 0)
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Combine stdout and stderr
    #[must_use]
    pub fn combined_output(&self) -> String {
        if self.err.is_empty() {
            self.out.clone()
        } else {
            format!("{}\n{}", self.out, self.err)
        }
    }
}

/// How to run a local command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOptions {
    /// Alternate shell interpreter (runner default when unset)
    pub shell: Option<String>,
    /// Single line written to stdin
    pub stdin_line: Option<String>,
    /// Lines written to stdin after `stdin_line`
    pub stdin_lines: Vec<String>,
    /// Extra environment, applied in order over the inherited environment
    pub env: Vec<(String, String)>,
    /// Deadline for the whole command (`None` = no timeout)
    pub timeout: Option<Duration>,
    /// Secret whose derived environment is injected before `env`
    pub secret_id: Option<String>,
    /// Working directory (inherited when unset)
    pub cwd: Option<PathBuf>,
}

impl CommandOptions {
    /// Create default options
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific shell
    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    /// Set timeout; a zero duration disables it
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Append an environment entry
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the first stdin line
    #[must_use]
    pub fn with_stdin_line(mut self, line: impl Into<String>) -> Self {
        self.stdin_line = Some(line.into());
        self
    }

    /// Append a stdin line after any already queued
    #[must_use]
    pub fn push_stdin_line(mut self, line: impl Into<String>) -> Self {
        self.stdin_lines.push(line.into());
        self
    }

    /// Inject the environment derived from a secret
    #[must_use]
    pub fn with_secret(mut self, secret_id: impl Into<String>) -> Self {
        self.secret_id = Some(secret_id.into());
        self
    }

    /// Run in `dir`
    #[must_use]
    pub fn with_cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// All stdin lines in write order
    pub fn input_lines(&self) -> impl Iterator<Item = &str> {
        self.stdin_line
            .iter()
            .chain(self.stdin_lines.iter())
            .map(String::as_str)
    }

    /// Whether any stdin input was requested
    #[must_use]
    pub fn has_input(&self) -> bool {
        self.stdin_line.is_some() || !self.stdin_lines.is_empty()
    }
}
