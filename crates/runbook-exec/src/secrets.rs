//! Secret store and SSH key materialization
//!
//! Secrets live in memory for the lifetime of one run. SSH identities are
//! written to owner-only files inside a per-store temporary directory the
//! first time they are resolved, and those files are removed when the store
//! is closed or dropped.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions, Permissions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Variant tag of a stored secret
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecretKind {
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "ssh")]
    Ssh,
    #[serde(rename = "userpass")]
    UserPassword,
}

impl SecretKind {
    /// Name used in secrets files and error messages
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SecretKind::Text => "text",
            SecretKind::Ssh => "ssh",
            SecretKind::UserPassword => "userpass",
        }
    }
}

impl fmt::Display for SecretKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored credential
///
/// Secret material is wiped from memory when the value is dropped.
#[derive(Clone)]
pub enum Secret {
    /// Opaque text value
    Text { value: Zeroizing<String> },
    /// SSH user with private key material
    SshIdentity {
        user: String,
        private_key: Zeroizing<String>,
        passphrase: Option<Zeroizing<String>>,
    },
    /// User name and password
    UserPassword {
        user: String,
        password: Zeroizing<String>,
    },
}

impl Secret {
    /// Create a text secret
    pub fn text(value: impl Into<String>) -> Self {
        Secret::Text {
            value: Zeroizing::new(value.into()),
        }
    }

    /// Create an SSH identity; an empty passphrase means none
    pub fn ssh_identity(
        user: impl Into<String>,
        private_key: impl Into<String>,
        passphrase: Option<String>,
    ) -> Self {
        Secret::SshIdentity {
            user: user.into(),
            private_key: Zeroizing::new(private_key.into()),
            passphrase: passphrase.filter(|p| !p.is_empty()).map(Zeroizing::new),
        }
    }

    /// Create a user/password secret
    pub fn user_password(user: impl Into<String>, password: impl Into<String>) -> Self {
        Secret::UserPassword {
            user: user.into(),
            password: Zeroizing::new(password.into()),
        }
    }

    /// Variant tag
    #[must_use]
    pub fn kind(&self) -> SecretKind {
        match self {
            Secret::Text { .. } => SecretKind::Text,
            Secret::SshIdentity { .. } => SecretKind::Ssh,
            Secret::UserPassword { .. } => SecretKind::UserPassword,
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Secret::Text { .. } => f.debug_struct("Text").finish_non_exhaustive(),
            Secret::SshIdentity { user, .. } => f
                .debug_struct("SshIdentity")
                .field("user", user)
                .finish_non_exhaustive(),
            Secret::UserPassword { user, .. } => f
                .debug_struct("UserPassword")
                .field("user", user)
                .finish_non_exhaustive(),
        }
    }
}

/// SSH identity ready for use: the key lives on disk, not in this value
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct SshCredentials {
    /// Remote user
    pub user: String,
    /// Materialized private key file (mode 600)
    pub private_key_file: PathBuf,
    /// Key passphrase, if any
    pub passphrase: Option<String>,
}

impl fmt::Debug for SshCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshCredentials")
            .field("user", &self.user)
            .field("private_key_file", &self.private_key_file)
            .field("has_passphrase", &self.passphrase.is_some())
            .finish()
    }
}

/// User/password pair
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct UserPassword {
    /// User name
    pub user: String,
    /// Password
    pub password: String,
}

impl fmt::Debug for UserPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserPassword")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Result of resolving a secret ID
#[derive(Clone, PartialEq, Eq)]
pub enum ResolvedSecret {
    Text(String),
    Ssh(SshCredentials),
    UserPassword(UserPassword),
}

impl ResolvedSecret {
    /// Variant tag
    #[must_use]
    pub fn kind(&self) -> SecretKind {
        match self {
            ResolvedSecret::Text(_) => SecretKind::Text,
            ResolvedSecret::Ssh(_) => SecretKind::Ssh,
            ResolvedSecret::UserPassword(_) => SecretKind::UserPassword,
        }
    }

    /// Environment entries injected into local commands that reference this secret
    ///
    /// SSH identities produce a `GIT_SSH_COMMAND` pointing at the materialized
    /// key file so that `git` and friends pick it up without further setup.
    #[must_use]
    pub fn command_env(&self) -> Vec<(String, String)> {
        match self {
            ResolvedSecret::Text(value) => {
                vec![("RUNBOOK_SECRET_TEXT".to_string(), value.clone())]
            }
            ResolvedSecret::Ssh(creds) => {
                let key = creds.private_key_file.display().to_string();
                vec![
                    (
                        "GIT_SSH_COMMAND".to_string(),
                        format!(
                            "ssh -i '{key}' -o IdentitiesOnly=yes -o StrictHostKeyChecking=no"
                        ),
                    ),
                    ("RUNBOOK_SSH_KEY_FILE".to_string(), key),
                    ("RUNBOOK_SSH_USER".to_string(), creds.user.clone()),
                ]
            }
            ResolvedSecret::UserPassword(pair) => vec![
                ("RUNBOOK_SECRET_USER".to_string(), pair.user.clone()),
                ("RUNBOOK_SECRET_PASSWORD".to_string(), pair.password.clone()),
            ],
        }
    }
}

impl fmt::Debug for ResolvedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedSecret::Text(_) => f.write_str("Text(..)"),
            ResolvedSecret::Ssh(creds) => f.debug_tuple("Ssh").field(creds).finish(),
            ResolvedSecret::UserPassword(pair) => {
                f.debug_tuple("UserPassword").field(pair).finish()
            }
        }
    }
}

/// Secret store errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SecretError {
    #[error("secret not found: {0}")]
    NotFound(String),

    #[error("secret {id} is not a {expected} secret (found {actual})")]
    WrongType {
        id: String,
        expected: SecretKind,
        actual: SecretKind,
    },

    #[error("secret store is closed")]
    Closed,

    #[error("secret I/O error: {0}")]
    Io(String),
}

struct Entry {
    secret: Secret,
    /// Set once an SSH identity has been materialized
    key_file: Option<PathBuf>,
}

#[derive(Default)]
struct StoreInner {
    entries: HashMap<String, Entry>,
    key_dir: Option<TempDir>,
    closed: bool,
}

/// In-memory secret table owned by one execution context
///
/// All methods take `&self`; a single mutex guards the table so concurrent
/// resolution of the same SSH identity materializes its key exactly once.
#[derive(Default)]
pub struct SecretStore {
    inner: Mutex<StoreInner>,
}

impl fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("SecretStore")
            .field("secrets", &inner.entries.len())
            .field("closed", &inner.closed)
            .finish_non_exhaustive()
    }
}

impl SecretStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a secret, replacing any previous value for `id`
    ///
    /// # Errors
    /// Returns `SecretError::Closed` once the store has been closed.
    pub fn add(&self, id: impl Into<String>, secret: Secret) -> Result<(), SecretError> {
        let id = id.into();
        let mut inner = self.lock();
        if inner.closed {
            return Err(SecretError::Closed);
        }

        debug!(secret_id = %id, kind = %secret.kind(), "registering secret");

        let previous = inner.entries.insert(
            id,
            Entry {
                secret,
                key_file: None,
            },
        );
        if let Some(Entry {
            key_file: Some(path),
            ..
        }) = previous
        {
            remove_key_file(&path);
        }
        Ok(())
    }

    /// Number of registered secrets
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the store holds no secrets
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `close` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Directory holding materialized keys, once one has been created
    #[must_use]
    pub fn key_dir(&self) -> Option<PathBuf> {
        self.lock().key_dir.as_ref().map(|d| d.path().to_path_buf())
    }

    /// Resolve a secret by ID
    ///
    /// SSH identities are materialized on first resolution; later calls return
    /// the same file path.
    ///
    /// # Errors
    /// Returns `SecretError::NotFound` for unknown IDs, `SecretError::Closed`
    /// after teardown, and `SecretError::Io` if the key file cannot be written.
    pub fn resolve(&self, id: &str) -> Result<ResolvedSecret, SecretError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(SecretError::Closed);
        }

        let StoreInner {
            entries, key_dir, ..
        } = &mut *inner;
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| SecretError::NotFound(id.to_string()))?;

        match &entry.secret {
            Secret::Text { value } => Ok(ResolvedSecret::Text(value.to_string())),
            Secret::UserPassword { user, password } => {
                Ok(ResolvedSecret::UserPassword(UserPassword {
                    user: user.clone(),
                    password: password.to_string(),
                }))
            }
            Secret::SshIdentity {
                user,
                private_key,
                passphrase,
            } => {
                let private_key_file = match &entry.key_file {
                    Some(path) if path.exists() => path.clone(),
                    _ => {
                        let path = materialize(key_dir, private_key)?;
                        debug!(secret_id = %id, path = %path.display(), "materialized SSH key");
                        entry.key_file = Some(path.clone());
                        path
                    }
                };
                Ok(ResolvedSecret::Ssh(SshCredentials {
                    user: user.clone(),
                    private_key_file,
                    passphrase: passphrase.as_ref().map(|p| p.to_string()),
                }))
            }
        }
    }

    /// Resolve a text secret
    ///
    /// # Errors
    /// Returns `SecretError::WrongType` if `id` holds another variant.
    pub fn resolve_text(&self, id: &str) -> Result<String, SecretError> {
        match self.resolve_expecting(id, SecretKind::Text)? {
            ResolvedSecret::Text(value) => Ok(value),
            other => Err(wrong_type(id, SecretKind::Text, other.kind())),
        }
    }

    /// Resolve an SSH identity, materializing its key file
    ///
    /// # Errors
    /// Returns `SecretError::WrongType` if `id` holds another variant.
    pub fn resolve_ssh(&self, id: &str) -> Result<SshCredentials, SecretError> {
        match self.resolve_expecting(id, SecretKind::Ssh)? {
            ResolvedSecret::Ssh(creds) => Ok(creds),
            other => Err(wrong_type(id, SecretKind::Ssh, other.kind())),
        }
    }

    /// Resolve a user/password secret
    ///
    /// # Errors
    /// Returns `SecretError::WrongType` if `id` holds another variant.
    pub fn resolve_userpass(&self, id: &str) -> Result<UserPassword, SecretError> {
        match self.resolve_expecting(id, SecretKind::UserPassword)? {
            ResolvedSecret::UserPassword(pair) => Ok(pair),
            other => Err(wrong_type(id, SecretKind::UserPassword, other.kind())),
        }
    }

    /// Check the variant before resolving so a mismatch never materializes a key
    fn resolve_expecting(
        &self,
        id: &str,
        expected: SecretKind,
    ) -> Result<ResolvedSecret, SecretError> {
        let actual = {
            let inner = self.lock();
            if inner.closed {
                return Err(SecretError::Closed);
            }
            inner
                .entries
                .get(id)
                .map(|e| e.secret.kind())
                .ok_or_else(|| SecretError::NotFound(id.to_string()))?
        };
        if actual != expected {
            return Err(wrong_type(id, expected, actual));
        }
        self.resolve(id)
    }

    /// Remove every materialized key file and forget all secrets
    ///
    /// Idempotent. Later calls to `add` or `resolve` fail with
    /// `SecretError::Closed`.
    ///
    /// # Errors
    /// Returns `SecretError::Io` if the key directory cannot be removed.
    pub fn close(&self) -> Result<(), SecretError> {
        let mut inner = self.lock();
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        inner.entries.clear();

        if let Some(dir) = inner.key_dir.take() {
            let path = dir.path().display().to_string();
            dir.close()
                .map_err(|e| SecretError::Io(format!("failed to remove {path}: {e}")))?;
            debug!(path = %path, "removed key directory");
        }
        Ok(())
    }
}

fn wrong_type(id: &str, expected: SecretKind, actual: SecretKind) -> SecretError {
    SecretError::WrongType {
        id: id.to_string(),
        expected,
        actual,
    }
}

/// Write key material into the store's key directory, creating it on demand
fn materialize(slot: &mut Option<TempDir>, key: &str) -> Result<PathBuf, SecretError> {
    let dir = match slot.take() {
        Some(dir) => dir,
        None => create_key_dir()?,
    };
    let written = write_key_file(dir.path(), key);
    *slot = Some(dir);
    written
}

fn create_key_dir() -> Result<TempDir, SecretError> {
    let dir = tempfile::Builder::new()
        .prefix("runbook-keys-")
        .tempdir()
        .map_err(|e| SecretError::Io(format!("failed to create key directory: {e}")))?;
    fs::set_permissions(dir.path(), Permissions::from_mode(0o700))
        .map_err(|e| SecretError::Io(format!("failed to restrict key directory: {e}")))?;
    Ok(dir)
}

fn write_key_file(dir: &Path, key: &str) -> Result<PathBuf, SecretError> {
    let path = dir.join(format!("key-{}", Uuid::new_v4().simple()));
    let io_err = |e: std::io::Error| SecretError::Io(format!("{}: {e}", path.display()));

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&path)
        .map_err(io_err)?;
    file.write_all(key.as_bytes()).map_err(io_err)?;
    if !key.ends_with('\n') {
        file.write_all(b"\n").map_err(io_err)?;
    }
    file.sync_all().map_err(io_err)?;

    // Set 600 permissions regardless of umask
    fs::set_permissions(&path, Permissions::from_mode(0o600)).map_err(io_err)?;

    Ok(path)
}

fn remove_key_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "failed to remove stale key file");
    }
}
