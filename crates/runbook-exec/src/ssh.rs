//! SSH sessions using the russh crate
//!
//! An [`SshSession`] is one authenticated connection. Commands, SFTP
//! transfers and forwarded connections each open their own channel on it.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::keys::ssh_key;
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key};
use russh::{ChannelMsg, Disconnect, client};
use russh_sftp::client::SftpSession;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::ExecError;
use crate::result::ShellResult;
use crate::target::{ResolvedTarget, SshAuth};
use crate::traits::RemoteConnector;

/// Delay before retrying a failed tunnel accept
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Accept all server keys (like StrictHostKeyChecking=no)
        Ok(true)
    }
}

type SessionHandle = client::Handle<SshClientHandler>;

/// Authenticated SSH connection
///
/// Created connected by [`SshSession::dial`]; [`SshSession::close`] moves it
/// to closed, after which every operation fails with
/// `ExecError::NotConnected`.
pub struct SshSession {
    /// `host:port` for logging
    address: String,
    /// Live connection shared with tunnel relays
    handle: Arc<SessionHandle>,
    /// Parent token of every tunnel started from this session
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("address", &self.address)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl SshSession {
    /// Connect and authenticate
    ///
    /// # Errors
    /// Returns `ExecError::ConnectionFailed` if the host is unreachable,
    /// `ExecError::SshKeyError` if the key cannot be loaded, and
    /// `ExecError::AuthenticationFailed` if the server rejects the credentials.
    #[instrument(skip(target), fields(host = %target.address()))]
    pub async fn dial(target: &ResolvedTarget) -> Result<Self, ExecError> {
        let address = target.address();

        info!(
            host = %target.host,
            port = target.port,
            user = %target.user,
            "connecting to SSH"
        );

        let config = Arc::new(client::Config::default());
        let mut session = client::connect(
            config,
            (target.host.as_str(), target.port),
            SshClientHandler,
        )
        .await
        .map_err(|e| ExecError::ConnectionFailed(format!("{address}: {e}")))?;

        let auth_res = match &target.auth {
            SshAuth::Password(password) => session
                .authenticate_password(&target.user, password)
                .await
                .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?,
            SshAuth::PrivateKey { path, passphrase } => {
                let key_pair = load_secret_key(path, passphrase.as_deref())
                    .map_err(|e| ExecError::SshKeyError(format!("{}: {e}", path.display())))?;

                let hash_alg = session
                    .best_supported_rsa_hash()
                    .await
                    .ok()
                    .flatten()
                    .flatten();
                session
                    .authenticate_publickey(
                        &target.user,
                        PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg),
                    )
                    .await
                    .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?
            }
        };

        if !auth_res.success() {
            return Err(ExecError::AuthenticationFailed(format!(
                "server rejected credentials for {}@{address}",
                target.user
            )));
        }

        info!(host = %address, "SSH connected and authenticated");

        Ok(Self {
            address,
            handle: Arc::new(session),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Whether the session is still usable
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.handle.is_closed()
    }

    fn ensure_connected(&self) -> Result<(), ExecError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ExecError::NotConnected)
        }
    }

    /// Run a command on one fresh channel
    ///
    /// The result code is 1 when anything was written to stderr and 0
    /// otherwise; the remote exit status is logged but not propagated.
    ///
    /// # Errors
    /// Returns `ExecError::IoError` if the channel fails.
    #[instrument(skip(self, cmd), fields(host = %self.address))]
    pub async fn exec(&self, cmd: &str) -> Result<ShellResult, ExecError> {
        self.ensure_connected()?;

        debug!(command = %cmd, "executing remote command");

        let start = Instant::now();

        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        channel
            .exec(true, cmd)
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        let mut exit_status = None;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    stdout.extend_from_slice(&data);
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if ext == 1 {
                        // stderr
                        stderr.extend_from_slice(&data);
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                    exit_status = Some(status);
                }
                None => break,
                _ => {}
            }
        }

        let duration = start.elapsed();
        let out = String::from_utf8_lossy(&stdout).to_string();
        let err = String::from_utf8_lossy(&stderr).to_string();
        let code = i32::from(!err.is_empty());

        debug!(
            command = %cmd,
            code = code,
            exit_status = ?exit_status,
            duration = ?duration,
            "remote command completed"
        );

        Ok(ShellResult {
            code,
            out,
            err,
            duration,
        })
    }

    /// Open the SFTP subsystem on a new channel
    async fn sftp(&self) -> Result<SftpSession, ExecError> {
        self.ensure_connected()?;

        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| ExecError::TransferFailed(format!("sftp subsystem: {e}")))
    }

    /// Copy a local file to `remote`
    ///
    /// A failure mid-transfer leaves a partial remote file.
    ///
    /// # Errors
    /// Returns `ExecError::IoError` for local file problems and
    /// `ExecError::TransferFailed` for SFTP failures.
    #[instrument(skip(self, local), fields(host = %self.address, local = %local.display()))]
    pub async fn upload(&self, local: &Path, remote: &str) -> Result<u64, ExecError> {
        let metadata = tokio::fs::metadata(local)
            .await
            .map_err(|e| ExecError::io(local.display(), e))?;
        if metadata.is_dir() {
            return Err(ExecError::ConfigError(format!(
                "{} is a directory",
                local.display()
            )));
        }

        let mut source = tokio::fs::File::open(local)
            .await
            .map_err(|e| ExecError::io(local.display(), e))?;

        let sftp = self.sftp().await?;
        let transfer = async {
            let mut dest = sftp
                .create(remote)
                .await
                .map_err(|e| ExecError::transfer(remote, e))?;
            let written = tokio::io::copy(&mut source, &mut dest)
                .await
                .map_err(|e| ExecError::transfer(remote, e))?;
            dest.shutdown()
                .await
                .map_err(|e| ExecError::transfer(remote, e))?;
            Ok::<_, ExecError>(written)
        }
        .await;
        close_sftp(&sftp).await;

        let written = transfer?;
        info!(remote = %remote, bytes = written, "upload complete");
        Ok(written)
    }

    /// Copy `remote` to a local file
    ///
    /// A failure mid-transfer leaves a partial local file.
    ///
    /// # Errors
    /// Returns `ExecError::IoError` for local file problems and
    /// `ExecError::TransferFailed` for SFTP failures.
    #[instrument(skip(self, local), fields(host = %self.address, local = %local.display()))]
    pub async fn download(&self, remote: &str, local: &Path) -> Result<u64, ExecError> {
        let sftp = self.sftp().await?;
        let transfer = async {
            let mut source = sftp
                .open(remote)
                .await
                .map_err(|e| ExecError::transfer(remote, e))?;
            let mut dest = tokio::fs::File::create(local)
                .await
                .map_err(|e| ExecError::io(local.display(), e))?;
            let written = tokio::io::copy(&mut source, &mut dest)
                .await
                .map_err(|e| ExecError::transfer(remote, e))?;
            dest.sync_all()
                .await
                .map_err(|e| ExecError::io(local.display(), e))?;
            Ok::<_, ExecError>(written)
        }
        .await;
        close_sftp(&sftp).await;

        let written = transfer?;
        info!(remote = %remote, bytes = written, "download complete");
        Ok(written)
    }

    /// Listen on `127.0.0.1:local_port` and forward every accepted connection
    /// to `remote_host:remote_port` through this session
    ///
    /// Port 0 picks a free port; see [`Tunnel::local_addr`].
    ///
    /// # Errors
    /// Returns `ExecError::IoError` if the local port cannot be bound.
    #[instrument(skip(self), fields(host = %self.address))]
    pub async fn forward_tunnel(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Tunnel, ExecError> {
        self.ensure_connected()?;

        let listener = TcpListener::bind(("127.0.0.1", local_port))
            .await
            .map_err(|e| ExecError::IoError(format!("bind 127.0.0.1:{local_port}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        info!(
            local = %local_addr,
            remote = %format!("{remote_host}:{remote_port}"),
            "tunnel listening"
        );

        let shutdown = self.shutdown.child_token();
        let task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.handle),
            remote_host.to_string(),
            remote_port,
            shutdown.clone(),
        ));

        Ok(Tunnel {
            local_addr,
            shutdown,
            task: Some(task),
            session: None,
        })
    }

    /// Disconnect and stop every tunnel started from this session
    ///
    /// Idempotent.
    ///
    /// # Errors
    /// Returns `ExecError::IoError` if disconnection fails
    pub async fn close(&self) -> Result<(), ExecError> {
        self.shutdown.cancel();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;
        info!(host = %self.address, "SSH disconnected");
        Ok(())
    }
}

async fn close_sftp(sftp: &SftpSession) {
    if let Err(e) = sftp.close().await {
        debug!(error = %e, "sftp close failed");
    }
}

async fn accept_loop(
    listener: TcpListener,
    handle: Arc<SessionHandle>,
    remote_host: String,
    remote_port: u16,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let handle = Arc::clone(&handle);
                    let remote_host = remote_host.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            relay(&handle, socket, peer, &remote_host, remote_port, &shutdown).await
                        {
                            warn!(peer = %peer, error = %e, "forwarded connection failed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "tunnel accept failed");
                    if !accept_backoff(&shutdown).await {
                        break;
                    }
                }
            }
        }
    }
    debug!("tunnel listener stopped");
}

/// Pause after a failed accept; false when the tunnel was closed meanwhile
async fn accept_backoff(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => false,
        () = tokio::time::sleep(ACCEPT_BACKOFF) => true,
    }
}

/// Pump bytes between one local connection and one direct-tcpip channel
async fn relay(
    handle: &SessionHandle,
    mut socket: TcpStream,
    peer: SocketAddr,
    remote_host: &str,
    remote_port: u16,
    shutdown: &CancellationToken,
) -> Result<(), ExecError> {
    let channel = handle
        .channel_open_direct_tcpip(
            remote_host,
            u32::from(remote_port),
            peer.ip().to_string(),
            u32::from(peer.port()),
        )
        .await
        .map_err(|e| ExecError::ConnectionFailed(format!("{remote_host}:{remote_port}: {e}")))?;
    let mut stream = channel.into_stream();

    tokio::select! {
        () = shutdown.cancelled() => {}
        copied = tokio::io::copy_bidirectional(&mut socket, &mut stream) => {
            let (sent, received) = copied.map_err(|e| ExecError::IoError(e.to_string()))?;
            debug!(peer = %peer, sent, received, "forwarded connection closed");
        }
    }
    Ok(())
}

/// Running port forward
///
/// Dropping the tunnel stops its listener and relays.
pub struct Tunnel {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
    /// Session owned by this tunnel, closed with it
    session: Option<Arc<SshSession>>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("local_addr", &self.local_addr)
            .field("stopped", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Tunnel {
    /// Address the listener is bound to
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Make the tunnel own its session so the connection closes with it
    #[must_use]
    pub fn with_session(mut self, session: Arc<SshSession>) -> Self {
        self.session = Some(session);
        self
    }

    /// Stop listening, drop forwarded connections and close an owned session
    pub async fn close(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            debug!(error = %e, "tunnel task ended abnormally");
        }
        if let Some(session) = self.session.take()
            && let Err(e) = session.close().await
        {
            debug!(error = %e, "tunnel session close failed");
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Connector that dials a fresh session for every operation
#[derive(Debug, Clone, Default)]
pub struct SshConnector;

impl SshConnector {
    /// Create a new connector
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

/// Close a per-operation session, keeping the operation's result
async fn finish<T>(session: SshSession, result: Result<T, ExecError>) -> Result<T, ExecError> {
    if let Err(e) = session.close().await {
        debug!(host = %session.address, error = %e, "SSH close failed");
    }
    result
}

#[async_trait]
impl RemoteConnector for SshConnector {
    async fn exec(&self, target: &ResolvedTarget, cmd: &str) -> Result<ShellResult, ExecError> {
        let session = SshSession::dial(target).await?;
        let result = session.exec(cmd).await;
        finish(session, result).await
    }

    async fn upload(
        &self,
        target: &ResolvedTarget,
        local: &Path,
        remote: &str,
    ) -> Result<u64, ExecError> {
        let session = SshSession::dial(target).await?;
        let result = session.upload(local, remote).await;
        finish(session, result).await
    }

    async fn download(
        &self,
        target: &ResolvedTarget,
        remote: &str,
        local: &Path,
    ) -> Result<u64, ExecError> {
        let session = SshSession::dial(target).await?;
        let result = session.download(remote, local).await;
        finish(session, result).await
    }

    async fn open_tunnel(
        &self,
        target: &ResolvedTarget,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Tunnel, ExecError> {
        let session = Arc::new(SshSession::dial(target).await?);
        match session
            .forward_tunnel(local_port, remote_host, remote_port)
            .await
        {
            Ok(tunnel) => Ok(tunnel.with_session(session)),
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    debug!(error = %close_err, "SSH close failed");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    //! These tests require an SSH server reachable with the credentials in
    //! `RUNBOOK_TEST_SSH_ADDR`, `RUNBOOK_TEST_SSH_USER` and either
    //! `RUNBOOK_TEST_SSH_PASSWORD` or `RUNBOOK_TEST_SSH_KEY`.

    use std::path::PathBuf;

    use super::*;

    #[tokio::test]
    async fn test_accept_backoff_waits_until_closed() {
        let shutdown = CancellationToken::new();
        let start = Instant::now();
        assert!(accept_backoff(&shutdown).await);
        assert!(start.elapsed() >= ACCEPT_BACKOFF);

        shutdown.cancel();
        let start = Instant::now();
        assert!(!accept_backoff(&shutdown).await);
        assert!(start.elapsed() < ACCEPT_BACKOFF);
    }

    fn test_target() -> ResolvedTarget {
        let var = |name: &str| std::env::var(name).unwrap_or_default();
        let address = var("RUNBOOK_TEST_SSH_ADDR");
        let (host, port) = address.rsplit_once(':').unwrap_or((&address, "22"));
        let auth = match std::env::var("RUNBOOK_TEST_SSH_PASSWORD") {
            Ok(password) => SshAuth::Password(password),
            Err(_) => SshAuth::PrivateKey {
                path: PathBuf::from(var("RUNBOOK_TEST_SSH_KEY")),
                passphrase: None,
            },
        };
        ResolvedTarget {
            host: host.to_string(),
            port: port.parse().unwrap(),
            user: var("RUNBOOK_TEST_SSH_USER"),
            auth,
        }
    }

    #[tokio::test]
    #[ignore = "requires SSH server"]
    async fn test_exec_reports_stderr_as_failure() {
        let session = SshSession::dial(&test_target()).await.unwrap();

        let ok = session.exec("echo hi").await.unwrap();
        assert_eq!(ok.code, 0);
        assert_eq!(ok.out, "hi\n");

        let failed = session.exec("echo oops >&2").await.unwrap();
        assert_eq!(failed.code, 1);

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert!(matches!(
            session.exec("true").await,
            Err(ExecError::NotConnected)
        ));
    }

    #[tokio::test]
    #[ignore = "requires SSH server"]
    async fn test_upload_download_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.bin");
        let copy = dir.path().join("c.bin");
        let payload: Vec<u8> = (0..=255u8).cycle().take(200_000).collect();
        std::fs::write(&source, &payload).unwrap();

        let connector = SshConnector::new();
        let target = test_target();
        let remote = format!("/tmp/runbook-roundtrip-{}", std::process::id());

        let up = connector.upload(&target, &source, &remote).await.unwrap();
        let down = connector.download(&target, &remote, &copy).await.unwrap();
        connector
            .exec(&target, &format!("rm -f {remote}"))
            .await
            .unwrap();

        assert_eq!(up, payload.len() as u64);
        assert_eq!(down, up);
        assert_eq!(std::fs::read(&copy).unwrap(), payload);
    }

    #[tokio::test]
    #[ignore = "requires SSH server"]
    async fn test_tunnel_stops_on_session_close() {
        let session = SshSession::dial(&test_target()).await.unwrap();
        let tunnel = session.forward_tunnel(0, "127.0.0.1", 22).await.unwrap();
        let addr = tunnel.local_addr();

        let mut conn = TcpStream::connect(addr).await.unwrap();
        let mut banner = [0u8; 4];
        tokio::io::AsyncReadExt::read_exact(&mut conn, &mut banner)
            .await
            .unwrap();
        assert_eq!(&banner, b"SSH-");

        session.close().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
