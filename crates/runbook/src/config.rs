//! Configuration loading and types

use std::path::{Path, PathBuf};

use runbook_core::RunConfig;
use runbook_exec::local::DEFAULT_SHELL;
use serde::{Deserialize, Serialize};

use crate::cli::Cli;

/// Top-level configuration for the runbook CLI
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Run settings
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// `[runtime]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Script file; unset means `Runbook` then `Runbook.rhai` in the working directory
    #[serde(default)]
    pub script: Option<PathBuf>,
    /// Secrets file
    #[serde(default)]
    pub secrets: Option<PathBuf>,
    /// Shell used by `sh`
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Log level or filter directive
    #[serde(default)]
    pub log_level: Option<String>,
    /// Engine operation limit per run (0 = unlimited)
    #[serde(default)]
    pub max_operations: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            script: None,
            secrets: None,
            shell: default_shell(),
            log_level: None,
            max_operations: 0,
        }
    }
}

fn default_shell() -> String {
    DEFAULT_SHELL.to_string()
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("reading {}: {e}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| eyre::eyre!("parsing {}: {e}", path.display()))?;
        Ok(config)
    }

    /// First config file found in the default locations
    pub fn find_default() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("RUNBOOK_CONFIG")
            && !path.is_empty()
        {
            return Some(PathBuf::from(path));
        }

        let paths = [
            Some(PathBuf::from("runbook.toml")),
            dirs::config_dir().map(|p| p.join("runbook/runbook.toml")),
        ];
        paths.into_iter().flatten().find(|p| p.exists())
    }

    /// Load `explicit`, else the first default location, else defaults
    ///
    /// Returns the path that was loaded, if any.
    ///
    /// # Errors
    /// Returns error if a selected file cannot be read or parsed
    pub fn load_default(explicit: Option<&Path>) -> eyre::Result<(Self, Option<PathBuf>)> {
        let path = explicit.map(Path::to_path_buf).or_else(Self::find_default);
        match path {
            Some(path) => Ok((Self::load(&path)?, Some(path))),
            None => Ok((Config::default(), None)),
        }
    }

    /// Apply command-line overrides
    pub fn apply_cli(&mut self, cli: &Cli) {
        let runtime = &mut self.runtime;
        if let Some(file) = &cli.file {
            runtime.script = Some(file.clone());
        }
        if let Some(secrets) = &cli.secrets {
            runtime.secrets = Some(secrets.clone());
        }
        if let Some(shell) = &cli.shell {
            runtime.shell = shell.clone();
        }
        if let Some(max) = cli.max_operations {
            runtime.max_operations = max;
        }
    }

    /// Settings for the execution controller
    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            shell: self.runtime.shell.clone(),
            max_operations: self.runtime.max_operations,
        }
    }
}
