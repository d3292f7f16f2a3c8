//! Runtime settings and secrets file loading

use std::path::Path;

use runbook_exec::{Secret, SecretStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::RunError;

/// Settings shared by every run started from one controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Default interpreter for `sh`
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Engine operation limit per run (0 = unlimited)
    #[serde(default)]
    pub max_operations: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            max_operations: 0,
        }
    }
}

fn default_shell() -> String {
    runbook_exec::local::DEFAULT_SHELL.to_string()
}

/// Problems reading a secrets file
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid secrets file {path}: {message}")]
    Parse { path: String, message: String },

    #[error("secret {id}: {message}")]
    InvalidSecret { id: String, message: String },
}

impl From<ConfigError> for RunError {
    fn from(err: ConfigError) -> Self {
        RunError::Configuration(err.to_string())
    }
}

/// Contents of a secrets file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecretsFile {
    #[serde(default)]
    pub secrets: Vec<SecretDefinition>,
}

/// One entry of a secrets file, tagged by `type`
#[derive(Clone, Deserialize)]
#[serde(tag = "type")]
pub enum SecretDefinition {
    #[serde(rename = "text")]
    Text { id: String, text: String },
    #[serde(rename = "ssh")]
    Ssh {
        id: String,
        user: String,
        #[serde(rename = "privateKey", alias = "private_key")]
        private_key: String,
        #[serde(default)]
        passphrase: Option<String>,
    },
    #[serde(rename = "userpass")]
    UserPassword {
        id: String,
        user: String,
        password: String,
    },
}

impl std::fmt::Debug for SecretDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretDefinition")
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

impl SecretDefinition {
    /// Secret ID
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            SecretDefinition::Text { id, .. }
            | SecretDefinition::Ssh { id, .. }
            | SecretDefinition::UserPassword { id, .. } => id,
        }
    }

    fn into_secret(self) -> (String, Secret) {
        match self {
            SecretDefinition::Text { id, text } => (id, Secret::text(text)),
            SecretDefinition::Ssh {
                id,
                user,
                private_key,
                passphrase,
            } => (id, Secret::ssh_identity(user, private_key, passphrase)),
            SecretDefinition::UserPassword { id, user, password } => {
                (id, Secret::user_password(user, password))
            }
        }
    }
}

impl SecretsFile {
    /// Parse JSON secrets
    ///
    /// # Errors
    /// Returns `ConfigError::Parse` for malformed input or an unknown `type`.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse {
            path: "<json>".to_string(),
            message: e.to_string(),
        })
    }

    /// Parse TOML secrets (`[[secrets]]` tables)
    ///
    /// # Errors
    /// Returns `ConfigError::Parse` for malformed input or an unknown `type`.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: "<toml>".to_string(),
            message: e.to_string(),
        })
    }

    /// Load a secrets file; `.toml` files are TOML, anything else JSON
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;

        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let parsed = if is_toml {
            Self::from_toml(&content)
        } else {
            Self::from_json(&content)
        };

        parsed.map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: display,
                message,
            },
            other => other,
        })
    }

    /// Build a store holding every secret; later duplicates win
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidSecret` for an empty ID.
    pub fn into_store(self) -> Result<SecretStore, ConfigError> {
        let store = SecretStore::new();
        for definition in self.secrets {
            let (id, secret) = definition.into_secret();
            if id.trim().is_empty() {
                return Err(ConfigError::InvalidSecret {
                    id,
                    message: "empty secret id".to_string(),
                });
            }
            store
                .add(id.clone(), secret)
                .map_err(|e| ConfigError::InvalidSecret {
                    id,
                    message: e.to_string(),
                })?;
        }
        Ok(store)
    }
}
