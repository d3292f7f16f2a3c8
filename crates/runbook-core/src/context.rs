//! Per-run execution context

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use runbook_exec::{SecretStore, Tunnel};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RunError;

/// Resources owned by one run
///
/// Closed exactly once: the first [`ExecutionContext::close`] stops every
/// tunnel and wipes the secret store, later calls do nothing.
#[derive(Debug)]
pub struct ExecutionContext {
    run_id: Uuid,
    secrets: Arc<SecretStore>,
    cancel: CancellationToken,
    closed: AtomicBool,
    next_tunnel: AtomicI64,
    tunnels: Mutex<HashMap<i64, Tunnel>>,
}

impl ExecutionContext {
    /// Create a context owning `secrets`
    #[must_use]
    pub fn new(secrets: SecretStore) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            secrets: Arc::new(secrets),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            next_tunnel: AtomicI64::new(1),
            tunnels: Mutex::new(HashMap::new()),
        }
    }

    /// Unique ID of this run
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Secrets visible to this run
    #[must_use]
    pub fn secrets(&self) -> &Arc<SecretStore> {
        &self.secrets
    }

    /// Token cancelled on abort
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request cooperative cancellation
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Whether abort was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the context has been torn down
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fail with `Aborted` once cancelled or closed
    ///
    /// # Errors
    /// Returns `RunError::Aborted`.
    pub fn ensure_active(&self) -> Result<(), RunError> {
        if self.is_cancelled() || self.is_closed() {
            Err(RunError::Aborted)
        } else {
            Ok(())
        }
    }

    fn tunnels(&self) -> MutexGuard<'_, HashMap<i64, Tunnel>> {
        self.tunnels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a tunnel and return its script-visible ID
    ///
    /// # Errors
    /// Returns `RunError::Aborted` if the context is closed; the tunnel is
    /// stopped in that case.
    pub fn register_tunnel(&self, tunnel: Tunnel) -> Result<i64, RunError> {
        let mut tunnels = self.tunnels();
        // Checked under the lock so close() cannot miss the entry
        if self.is_closed() {
            drop(tunnel);
            return Err(RunError::Aborted);
        }
        let id = self.next_tunnel.fetch_add(1, Ordering::Relaxed);
        tunnels.insert(id, tunnel);
        Ok(id)
    }

    /// Stop tracking a tunnel so the caller can close it
    pub fn take_tunnel(&self, id: i64) -> Option<Tunnel> {
        self.tunnels().remove(&id)
    }

    /// Tear down run resources; returns `true` on the call that did it
    ///
    /// Tunnels are stopped by dropping them, so this works from any thread
    /// without a runtime.
    pub fn close(&self) -> bool {
        let tunnels: Vec<Tunnel> = {
            let mut guard = self.tunnels();
            if self.closed.swap(true, Ordering::AcqRel) {
                return false;
            }
            guard.drain().map(|(_, t)| t).collect()
        };
        self.cancel.cancel();

        if !tunnels.is_empty() {
            debug!(run_id = %self.run_id, count = tunnels.len(), "closing tunnels");
        }
        drop(tunnels);

        if let Err(e) = self.secrets.close() {
            warn!(run_id = %self.run_id, error = %e, "failed to clean up secrets");
        }
        debug!(run_id = %self.run_id, "execution context closed");
        true
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use runbook_exec::Secret;

    use super::*;

    #[test]
    fn test_close_exactly_once() {
        let store = SecretStore::new();
        store
            .add("k", Secret::ssh_identity("u", "KEY", None))
            .unwrap();
        let ctx = ExecutionContext::new(store);
        ctx.secrets().resolve_ssh("k").unwrap();
        let key_dir = ctx.secrets().key_dir().unwrap();
        assert!(key_dir.exists());

        assert!(ctx.ensure_active().is_ok());
        assert!(ctx.close());
        assert!(!ctx.close());

        assert!(!key_dir.exists());
        assert!(ctx.is_closed());
        assert_eq!(ctx.ensure_active(), Err(RunError::Aborted));
        assert!(ctx.secrets().resolve("k").is_err());
    }

    #[test]
    fn test_abort_marks_inactive() {
        let ctx = ExecutionContext::new(SecretStore::new());
        ctx.abort();
        assert!(ctx.is_cancelled());
        assert!(!ctx.is_closed());
        assert_eq!(ctx.ensure_active(), Err(RunError::Aborted));
    }
}
