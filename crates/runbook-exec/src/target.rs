//! Remote target description and credential resolution

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ExecError;
use crate::secrets::{ResolvedSecret, SecretError, SecretKind, SecretStore};

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Remote host as described by a script
///
/// Either inline credentials or a `secret_id` naming an `ssh` or `userpass`
/// secret. When both are present the secret wins for the credential and the
/// inline `user` wins for the user name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTarget {
    /// `host:port` (port optional)
    pub address: String,
    /// SSH user
    pub user: Option<String>,
    /// Password for password authentication
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Path to a private key file
    pub private_key_file: Option<PathBuf>,
    /// Private key passphrase
    #[serde(skip_serializing)]
    pub passphrase: Option<String>,
    /// Secret to take credentials from
    pub secret_id: Option<String>,
}

/// Authentication method for a resolved target
#[derive(Clone, PartialEq, Eq)]
pub enum SshAuth {
    /// Password authentication
    Password(String),
    /// Public key authentication
    PrivateKey {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

impl std::fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SshAuth::Password(_) => f.write_str("Password(..)"),
            SshAuth::PrivateKey { path, .. } => f
                .debug_struct("PrivateKey")
                .field("path", path)
                .finish_non_exhaustive(),
        }
    }
}

/// Target with concrete host, port, user and credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// Host name or IP
    pub host: String,
    /// Port
    pub port: u16,
    /// SSH user
    pub user: String,
    /// Credentials
    pub auth: SshAuth,
}

impl ResolvedTarget {
    /// `host:port` for logging
    #[must_use]
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl RemoteTarget {
    /// Create a target for `address` and `user`
    pub fn new(address: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            user: Some(user.into()),
            ..Self::default()
        }
    }

    /// Use password authentication
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Use a private key file
    #[must_use]
    pub fn with_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key_file = Some(path.into());
        self
    }

    /// Take credentials from a secret
    #[must_use]
    pub fn with_secret(mut self, secret_id: impl Into<String>) -> Self {
        self.secret_id = Some(secret_id.into());
        self
    }

    /// Resolve address and credentials
    ///
    /// `secrets` is consulted only when `secret_id` is set.
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` for a missing address, user or
    /// credential, and `ExecError::Secret` when the secret is absent or is a
    /// text secret.
    pub fn resolve(&self, secrets: Option<&SecretStore>) -> Result<ResolvedTarget, ExecError> {
        let (host, port) = parse_address(&self.address)?;

        let (secret_user, auth) = match self.secret_id.as_deref() {
            Some(id) => {
                let store = secrets.ok_or_else(|| {
                    ExecError::ConfigError(format!(
                        "target uses secret {id} but no secret store is available"
                    ))
                })?;
                match store.resolve(id)? {
                    ResolvedSecret::Ssh(creds) => (
                        Some(creds.user),
                        SshAuth::PrivateKey {
                            path: creds.private_key_file,
                            passphrase: creds.passphrase,
                        },
                    ),
                    ResolvedSecret::UserPassword(pair) => {
                        (Some(pair.user), SshAuth::Password(pair.password))
                    }
                    ResolvedSecret::Text(_) => {
                        return Err(SecretError::WrongType {
                            id: id.to_string(),
                            expected: SecretKind::Ssh,
                            actual: SecretKind::Text,
                        }
                        .into());
                    }
                }
            }
            None => (None, self.inline_auth()?),
        };

        let user = self
            .user
            .clone()
            .filter(|u| !u.is_empty())
            .or(secret_user)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ExecError::ConfigError("target user not set".to_string()))?;

        Ok(ResolvedTarget {
            host,
            port,
            user,
            auth,
        })
    }

    /// Password first, then key file
    fn inline_auth(&self) -> Result<SshAuth, ExecError> {
        if let Some(password) = self.password.as_ref().filter(|p| !p.is_empty()) {
            return Ok(SshAuth::Password(password.clone()));
        }
        if let Some(path) = &self.private_key_file {
            return Ok(SshAuth::PrivateKey {
                path: path.clone(),
                passphrase: self.passphrase.clone().filter(|p| !p.is_empty()),
            });
        }
        Err(ExecError::ConfigError(
            "target has no password, private key file or secret".to_string(),
        ))
    }
}

/// Split `host[:port]`, accepting bracketed IPv6 literals
fn parse_address(address: &str) -> Result<(String, u16), ExecError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(ExecError::ConfigError(
            "target address not set".to_string(),
        ));
    }

    let invalid = || ExecError::ConfigError(format!("invalid target address: {address}"));

    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| invalid())?,
            None if tail.is_empty() => DEFAULT_SSH_PORT,
            None => return Err(invalid()),
        };
        return Ok((host.to_string(), port));
    }

    match address.rsplit_once(':') {
        // Bare IPv6 literal without port
        Some((host, _)) if host.contains(':') => Ok((address.to_string(), DEFAULT_SSH_PORT)),
        Some((host, port)) => Ok((host.to_string(), port.parse().map_err(|_| invalid())?)),
        None => Ok((address.to_string(), DEFAULT_SSH_PORT)),
    }
}
