//! SSH server implementation using russh.
//!
//! Handles:
//! - Public key authentication against an authorized_keys file
//! - Session channels (pty, env, shell, exec, subsystem, signals)
//! - Pumping program I/O between SSH channels and containers
//! - Connection teardown and graceful shutdown

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use russh::keys::PublicKey;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodKind, MethodSet, Sig};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::{AuthorizedKeys, compute_fingerprint_from_pubkey};
use crate::config::GatewayConfig;
use crate::docker::{
    self, ConnectionHandler, ExitWatcher, ProgramIo, ProgramOutput, SessionChannel,
};
use crate::error::HandlerError;
use crate::logging::TracingLogger;
use crate::metrics::BackendMetrics;

/// Shared state for the SSH server.
pub struct ServerState {
    pub config: Arc<GatewayConfig>,
    pub metrics: BackendMetrics,
    pub authorized_keys: AuthorizedKeys,
    /// Live connections by connection ID, for shutdown.
    connections: Mutex<HashMap<String, ConnectionHandler>>,
}

impl ServerState {
    pub fn new(
        config: Arc<GatewayConfig>,
        metrics: BackendMetrics,
        authorized_keys: AuthorizedKeys,
    ) -> Self {
        Self {
            config,
            metrics,
            authorized_keys,
            connections: Mutex::new(HashMap::new()),
        }
    }
}

/// Per-connection russh handler.
struct SshConnection {
    server: Arc<ServerState>,
    handler: ConnectionHandler,
    channels: HashMap<ChannelId, ChannelEntry>,
}

struct ChannelEntry {
    session: SessionChannel,
    /// Channel for sending data to the program; dropped on EOF.
    stdin_tx: Option<mpsc::Sender<Vec<u8>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ProgramRequest {
    Shell,
    Exec(String),
    Subsystem(String),
}

fn reject() -> Auth {
    Auth::Reject {
        proceed_with_methods: None,
        partial_success: false,
    }
}

/// SSH signal name without the `SIG` prefix, as the backend expects it.
fn signal_name(signal: &Sig) -> String {
    match signal {
        Sig::Custom(name) => name.trim_start_matches("SIG").to_string(),
        other => format!("{other:?}"),
    }
}

impl SshConnection {
    fn new(server: Arc<ServerState>, handler: ConnectionHandler) -> Self {
        Self {
            server,
            handler,
            channels: HashMap::new(),
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        self.handler.client_addr()
    }

    async fn start_program(
        &mut self,
        channel_id: ChannelId,
        request: ProgramRequest,
        session: &mut Session,
    ) -> Result<()> {
        let Some(entry) = self.channels.get_mut(&channel_id) else {
            warn!("{:?} on unknown channel {:?}", request, channel_id);
            session.channel_failure(channel_id)?;
            return Ok(());
        };

        let started = match request {
            ProgramRequest::Shell => entry.session.shell().await,
            ProgramRequest::Exec(ref command) => entry.session.exec(command).await,
            ProgramRequest::Subsystem(ref name) => entry.session.subsystem(name).await,
        };
        let started =
            started.and_then(|io| entry.session.exit_watcher().map(|exit| (io, exit)));

        match started {
            Ok((io, exit)) => {
                entry.stdin_tx = Some(spawn_pump(channel_id, io, exit, session.handle()));
                session.channel_success(channel_id)?;
            }
            Err(e) => {
                warn!(
                    "Failed to start {:?} on channel {:?} for {}: {}",
                    request,
                    channel_id,
                    self.peer_addr(),
                    e
                );
                session.channel_failure(channel_id)?;
            }
        }
        Ok(())
    }
}

impl Handler for SshConnection {
    type Error = anyhow::Error;

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!("Public key offered by user '{}' from {}", user, self.peer_addr());
        if self.server.authorized_keys.contains(public_key) {
            Ok(Auth::Accept)
        } else {
            Ok(reject())
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = compute_fingerprint_from_pubkey(public_key);
        if !self.server.authorized_keys.contains(public_key) {
            info!("Rejected key {} for user '{}'", fingerprint, user);
            return Ok(reject());
        }

        if let Err(e) = self.handler.on_handshake_success(user).await {
            warn!("Handshake for '{}' on a closed connection: {}", user, e);
            return Ok(reject());
        }
        info!(
            "Accepted key {} for user '{}' from {} (connection {})",
            fingerprint,
            user,
            self.peer_addr(),
            self.handler.connection_id()
        );
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let channel_id = channel.id();
        debug!("Session channel opened: {:?}", channel_id);

        match self.handler.open_session_channel(u32::from(channel_id)).await {
            Ok(session) => {
                self.channels.insert(
                    channel_id,
                    ChannelEntry {
                        session,
                        stdin_tx: None,
                    },
                );
                Ok(true)
            }
            Err(e) => {
                warn!("Rejecting session channel from {}: {}", self.peer_addr(), e);
                Ok(false)
            }
        }
    }

    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "PTY request: channel={:?}, term={}, cols={}, rows={}",
            channel_id, term, col_width, row_height
        );
        let result = match self.channels.get_mut(&channel_id) {
            Some(entry) => entry.session.request_pty(term, col_width, row_height).await,
            None => Err(HandlerError::ProtocolViolation(
                "pty request on unknown channel".to_string(),
            )),
        };
        match result {
            Ok(()) => session.channel_success(channel_id)?,
            Err(e) => {
                warn!("PTY request refused: {}", e);
                session.channel_failure(channel_id)?;
            }
        }
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel_id: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Env request: channel={:?}, {}", channel_id, variable_name);
        let accepted = match self.channels.get_mut(&channel_id) {
            Some(entry) => entry
                .session
                .set_env(variable_name, variable_value)
                .await
                .inspect_err(|e| warn!("Env request refused: {}", e))
                .is_ok(),
            None => false,
        };
        if accepted {
            session.channel_success(channel_id)?;
        } else {
            session.channel_failure(channel_id)?;
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        info!("Shell request on channel {:?}", channel_id);
        self.start_program(channel_id, ProgramRequest::Shell, session)
            .await
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).to_string();
        info!("Exec request on channel {:?}: {}", channel_id, command);
        self.start_program(channel_id, ProgramRequest::Exec(command), session)
            .await
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        info!("Subsystem request on channel {:?}: {}", channel_id, name);
        self.start_program(
            channel_id,
            ProgramRequest::Subsystem(name.to_string()),
            session,
        )
        .await
    }

    async fn window_change_request(
        &mut self,
        channel_id: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Window change: channel={:?}, cols={}, rows={}",
            channel_id, col_width, row_height
        );
        if let Some(entry) = self.channels.get_mut(&channel_id) {
            if let Err(e) = entry.session.window_change(col_width, row_height).await {
                warn!("Failed to resize channel {:?}: {}", channel_id, e);
            }
        }
        Ok(())
    }

    async fn signal(
        &mut self,
        channel_id: ChannelId,
        signal: Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let name = signal_name(&signal);
        debug!("Signal {} on channel {:?}", name, channel_id);
        if let Some(entry) = self.channels.get(&channel_id) {
            if let Err(e) = entry.session.signal(&name).await {
                warn!("Failed to deliver {} on channel {:?}: {}", name, channel_id, e);
            }
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(tx) = self
            .channels
            .get(&channel_id)
            .and_then(|entry| entry.stdin_tx.as_ref())
        {
            let _ = tx.send(data.to_vec()).await;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel EOF: {:?}", channel_id);
        // Dropping the sender closes the program's stdin.
        if let Some(entry) = self.channels.get_mut(&channel_id) {
            entry.stdin_tx = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel closed: {:?}", channel_id);
        if let Some(mut entry) = self.channels.remove(&channel_id) {
            entry.session.close().await;
        }
        Ok(())
    }
}

/// Connect a started program to its SSH channel. Returns the stdin sender.
fn spawn_pump(
    channel_id: ChannelId,
    io: ProgramIo,
    exit: ExitWatcher,
    handle: Handle,
) -> mpsc::Sender<Vec<u8>> {
    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(32);
    let ProgramIo {
        mut output,
        mut input,
    } = io;

    tokio::spawn(async move {
        let stdin_task = tokio::spawn(async move {
            while let Some(data) = stdin_rx.recv().await {
                if input.write_all(&data).await.is_err() {
                    return;
                }
            }
            let _ = input.shutdown().await;
        });

        while let Some(chunk) = output.next().await {
            let sent = match chunk {
                Ok(ProgramOutput::Stdout(data)) => {
                    handle
                        .data(channel_id, CryptoVec::from_slice(&data))
                        .await
                }
                Ok(ProgramOutput::Stderr(data)) => {
                    handle
                        .extended_data(
                            channel_id,
                            1, // SSH_EXTENDED_DATA_STDERR
                            CryptoVec::from_slice(&data),
                        )
                        .await
                }
                Err(e) => {
                    warn!("Program output error on channel {:?}: {}", channel_id, e);
                    break;
                }
            };
            if sent.is_err() {
                break;
            }
        }

        let exit_status = match exit.wait().await {
            Ok(code) => code,
            Err(e) => {
                warn!("Failed to read exit status on channel {:?}: {}", channel_id, e);
                255
            }
        };
        let _ = handle.exit_status_request(channel_id, exit_status).await;
        let _ = handle.eof(channel_id).await;
        let _ = handle.close(channel_id).await;
        stdin_task.abort();
    });

    stdin_tx
}

/// Run the SSH server until SIGINT or SIGTERM.
pub async fn run_server(server: Arc<ServerState>) -> Result<()> {
    let config = server.config.clone();
    let key = load_or_generate_host_key(&config.host_key_path).await?;

    let russh_config = Arc::new(russh::server::Config {
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        methods: MethodSet::from(&[MethodKind::PublicKey][..]),
        keys: vec![key],
        ..Default::default()
    });

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.listen_addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("SSH server listening on {}", listener.local_addr()?);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = &mut shutdown => break,
        };
        let server = server.clone();
        let russh_config = russh_config.clone();
        tokio::spawn(async move {
            serve_connection(server, russh_config, stream, peer_addr).await;
        });
    }

    let handlers: Vec<ConnectionHandler> = server
        .connections
        .lock()
        .await
        .values()
        .cloned()
        .collect();
    info!("Shutting down, tearing down {} connection(s)", handlers.len());
    let deadline = config.shutdown_timeout();
    futures::future::join_all(handlers.iter().map(|h| h.on_shutdown(deadline))).await;

    info!(
        "{}={} {}={}",
        server.metrics.requests.name(),
        server.metrics.requests.value(),
        server.metrics.failures.name(),
        server.metrics.failures.value()
    );
    Ok(())
}

async fn serve_connection(
    server: Arc<ServerState>,
    russh_config: Arc<russh::server::Config>,
    stream: tokio::net::TcpStream,
    peer_addr: SocketAddr,
) {
    let connection_id = Uuid::new_v4().simple().to_string();
    let logger = Arc::new(TracingLogger::new(connection_id.clone(), peer_addr));
    let handler = match docker::new(
        peer_addr,
        connection_id.clone(),
        server.config.docker.clone(),
        logger,
        server.metrics.requests.clone(),
        server.metrics.failures.clone(),
    ) {
        Ok(handler) => handler,
        Err(e) => {
            error!("Refusing connection from {}: {}", peer_addr, e);
            return;
        }
    };
    debug!("Connection {} from {}", connection_id, peer_addr);

    server
        .connections
        .lock()
        .await
        .insert(connection_id.clone(), handler.clone());

    let ssh = SshConnection::new(server.clone(), handler.clone());
    match russh::server::run_stream(russh_config, stream, ssh).await {
        Ok(session) => {
            if let Err(e) = session.await {
                warn!("SSH session error: {}", e);
            }
        }
        Err(e) => {
            warn!("SSH connection error: {}", e);
        }
    }

    handler.on_disconnect().await;
    server.connections.lock().await.remove(&connection_id);
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install SIGINT handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Load host key from file or generate a new one.
async fn load_or_generate_host_key(path: &std::path::Path) -> Result<russh::keys::PrivateKey> {
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::{Algorithm, LineEnding};

    if path.exists() {
        info!("Loading host key from {}", path.display());
        let key = russh::keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {}", path.display()))?;
        return Ok(key);
    }

    info!("Generating new Ed25519 host key");
    let key = russh::keys::PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .context("Failed to generate host key")?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let encoded = key
        .to_openssh(LineEnding::LF)
        .context("Failed to encode host key")?;
    tokio::fs::write(path, encoded.as_bytes()).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    info!("Saved host key to {}", path.display());
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_name() {
        assert_eq!(signal_name(&Sig::TERM), "TERM");
        assert_eq!(signal_name(&Sig::INT), "INT");
        assert_eq!(signal_name(&Sig::USR1), "USR1");
        assert_eq!(signal_name(&Sig::Custom("SIGWINCH".to_string())), "WINCH");
        assert_eq!(signal_name(&Sig::Custom("USR2".to_string())), "USR2");
    }

    #[tokio::test]
    async fn test_host_key_is_generated_then_reused() {
        let dir = std::env::temp_dir().join(format!("sshbox-hostkey-{}", Uuid::new_v4()));
        let path = dir.join("nested").join("host_key");

        let generated = load_or_generate_host_key(&path).await.unwrap();
        assert!(path.exists());
        let loaded = load_or_generate_host_key(&path).await.unwrap();
        assert_eq!(generated.public_key(), loaded.public_key());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
