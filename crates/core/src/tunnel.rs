// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 RDP Tunnel Contributors

// RDP Tunnel - Tunnel Module
// Session lifecycle: dial, keepalive, local listener, forwarding and viewer supervision

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::client::Handle;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::{close, AuthConfig, ClientHandler};
use crate::certificate::CertificateBundle;
use crate::config::TunnelOptions;
use crate::error::{Error, NetworkError, Result};
use crate::network::{format_host_port, normalize_ssh_addr, LocalPort};
use crate::viewer::{ViewerLauncher, ViewerTarget};

const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Receives human-readable progress lines; may be called from any task
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Sink that only relies on the `tracing` events every session line produces
pub fn tracing_sink() -> LogSink {
    Arc::new(|_: &str| {})
}

/// Wrap a closure as a [`LogSink`]
pub fn log_sink<F>(f: F) -> LogSink
where
    F: Fn(&str) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Clone)]
struct SessionLog {
    sink: LogSink,
    session: Uuid,
}

impl SessionLog {
    fn line(&self, message: &str) {
        info!(session = %self.session, "{}", message);
        (self.sink)(message);
    }
}

/// Lifecycle of the (single) tunnel session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    /// No session has run yet
    Idle,
    /// Dialing and authenticating the SSH transport
    Connecting,
    /// Listener is up and forwarding
    Active {
        /// Where the viewer should connect
        local_addr: SocketAddr,
    },
    /// Teardown in progress
    Closing,
    /// Ended normally or by cancellation
    Closed,
    /// Ended with an error; carries its message
    Failed(String),
}

impl TunnelState {
    /// A session is in progress and owns the local port
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            TunnelState::Connecting | TunnelState::Active { .. } | TunnelState::Closing
        )
    }

    /// One-line status for display, e.g. "Status: Connected to bastion"
    pub fn status_text(&self, host: &str) -> String {
        match self {
            TunnelState::Idle | TunnelState::Closed => "Status: Disconnected".to_string(),
            TunnelState::Connecting => "Status: Connecting...".to_string(),
            TunnelState::Active { .. } => format!("Status: Connected to {}", host),
            TunnelState::Closing => "Status: Disconnecting...".to_string(),
            TunnelState::Failed(_) => "Status: Connection Error".to_string(),
        }
    }
}

/// Event sent when the session changes state
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// A session started dialing
    Connecting {
        /// Session identifier, shared by all events of one session
        id: Uuid,
    },
    /// The local listener accepts connections
    Ready {
        id: Uuid,
        /// Bound listener address
        local_addr: SocketAddr,
    },
    /// Session ended normally or was cancelled
    Closed {
        id: Uuid,
        /// Ended by `cancel()` rather than by the viewer or the server
        cancelled: bool,
    },
    /// Session ended with an error
    Failed {
        id: Uuid,
        /// Display form of the error
        error: String,
    },
}

/// Validated connect parameters
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    host: String,
    username: String,
    local_port: LocalPort,
}

impl ConnectRequest {
    /// Trim and validate; errors carry the input message shown to the user
    pub fn new(host: &str, username: &str, local_port: &str) -> Result<Self> {
        let host = host.trim();
        if host.is_empty() {
            return Err(Error::Input("remote host is required".to_string()));
        }
        let username = username.trim();
        if username.is_empty() {
            return Err(Error::Input("ssh username is required".to_string()));
        }
        let local_port = LocalPort::parse(local_port)?;

        Ok(Self {
            host: host.to_string(),
            username: username.to_string(),
            local_port,
        })
    }

    /// Remote host as entered, port included if one was given
    pub fn host(&self) -> &str {
        &self.host
    }

    /// SSH login name
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Validated listener port
    pub fn local_port(&self) -> LocalPort {
        self.local_port
    }

    /// SSH address with the default port filled in
    pub fn ssh_addr(&self) -> String {
        normalize_ssh_addr(&self.host)
    }
}

/// Caller's view of one running session
pub struct SessionHandle {
    id: Uuid,
    ready_rx: Option<oneshot::Receiver<SocketAddr>>,
    local_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Resolves once the local listener is bound, before the viewer starts.
    /// `None` if the session ended first.
    pub async fn ready(&mut self) -> Option<SocketAddr> {
        if let Some(rx) = self.ready_rx.take() {
            self.local_addr = rx.await.ok();
        }
        self.local_addr
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Terminal outcome: `Ok` on a normal close, `Err(Cancelled)` after a cancel
    pub async fn wait(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(Error::Cancelled),
            Err(e) => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("session task failed: {}", e),
            ))),
        }
    }
}

struct ManagerState {
    status: TunnelState,
    session: Option<Uuid>,
    cancel: Option<CancellationToken>,
}

/// Owns the single tunnel session of the process
#[derive(Clone)]
pub struct TunnelManager {
    state: Arc<RwLock<ManagerState>>,
    /// Event broadcaster
    event_tx: broadcast::Sender<TunnelEvent>,
    options: Arc<TunnelOptions>,
    viewer: Arc<dyn ViewerLauncher>,
    log_sink: LogSink,
}

impl TunnelManager {
    pub fn new(options: TunnelOptions, viewer: Arc<dyn ViewerLauncher>, log_sink: LogSink) -> Self {
        let (event_tx, _) = broadcast::channel(32);
        Self {
            state: Arc::new(RwLock::new(ManagerState {
                status: TunnelState::Idle,
                session: None,
                cancel: None,
            })),
            event_tx,
            options: Arc::new(options),
            viewer,
            log_sink,
        }
    }

    pub fn options(&self) -> &TunnelOptions {
        &self.options
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.event_tx.subscribe()
    }

    pub async fn status(&self) -> TunnelState {
        self.state.read().await.status.clone()
    }

    /// Start a session in the background
    pub async fn connect(
        &self,
        request: ConnectRequest,
        bundle: &CertificateBundle,
    ) -> Result<SessionHandle> {
        let auth = AuthConfig::build(request.username(), bundle, &self.options)?;

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        {
            let mut state = self.state.write().await;
            if state.status.is_busy() {
                return Err(Error::SessionActive);
            }
            state.status = TunnelState::Connecting;
            state.session = Some(id);
            state.cancel = Some(cancel.clone());
        }
        emit(&self.event_tx, TunnelEvent::Connecting { id });
        info!("Starting session {} to {}", id, request.ssh_addr());

        let (ready_tx, ready_rx) = oneshot::channel();
        let session = Session {
            id,
            request,
            auth,
            options: self.options.clone(),
            viewer: self.viewer.clone(),
            log: SessionLog {
                sink: self.log_sink.clone(),
                session: id,
            },
            state: self.state.clone(),
            event_tx: self.event_tx.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(session.run(ready_tx));

        Ok(SessionHandle {
            id,
            ready_rx: Some(ready_rx),
            local_addr: None,
            cancel,
            task,
        })
    }

    /// Cancel the running session; false when there is none
    pub async fn disconnect(&self) -> bool {
        let state = self.state.read().await;
        match &state.cancel {
            Some(cancel) => {
                info!("Disconnect requested");
                cancel.cancel();
                true
            }
            None => false,
        }
    }
}

fn emit(event_tx: &broadcast::Sender<TunnelEvent>, event: TunnelEvent) {
    if let Err(e) = event_tx.send(event) {
        debug!("No subscribers for tunnel event: {}", e);
    }
}

struct Session {
    id: Uuid,
    request: ConnectRequest,
    auth: AuthConfig,
    options: Arc<TunnelOptions>,
    viewer: Arc<dyn ViewerLauncher>,
    log: SessionLog,
    state: Arc<RwLock<ManagerState>>,
    event_tx: broadcast::Sender<TunnelEvent>,
    cancel: CancellationToken,
}

impl Session {
    async fn run(self, ready_tx: oneshot::Sender<SocketAddr>) -> Result<()> {
        let result = match self.drive(ready_tx).await {
            // Anything that fails once cancel has fired is fallout from the cancel
            Err(e) if !e.is_cancellation() && self.cancel.is_cancelled() => {
                debug!("Error after cancellation: {}", e);
                Err(Error::Cancelled)
            }
            other => other,
        };
        self.finish(&result).await;
        result
    }

    async fn drive(&self, ready_tx: oneshot::Sender<SocketAddr>) -> Result<()> {
        let addr = self.request.ssh_addr();
        self.log.line(&format!("Dialing SSH to {}...", addr));

        let transport = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            result = self.auth.connect(&addr) => result?,
        };
        let transport = Arc::new(transport);
        self.log.line("SSH connection established.");

        let bind_addr = self.request.local_port().loopback_addr();
        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(source) => {
                close(&transport).await;
                return Err(NetworkError::Listen {
                    addr: bind_addr.to_string(),
                    source,
                }
                .into());
            }
        };
        let local_addr = listener.local_addr().unwrap_or(bind_addr);

        let target = Arc::new(ForwardTarget {
            host: self.options.remote_target_host.clone(),
            port: self.options.remote_target_port,
        });
        self.log.line(&format!(
            "Tunnel listening on {} -> remote:{}",
            local_addr,
            format_host_port(&target.host, target.port)
        ));

        // Everything below lives in `scope`; cancelling the session cancels it too
        let scope = self.cancel.child_token();
        let mut keepalive = tokio::spawn(keepalive_loop(
            transport.clone(),
            self.options.keepalive_interval(),
            scope.clone(),
            self.log.clone(),
        ));
        let accept = tokio::spawn(accept_loop(
            listener,
            transport.clone(),
            target,
            scope.clone(),
            self.log.clone(),
        ));

        self.set_status(TunnelState::Active { local_addr }).await;
        emit(
            &self.event_tx,
            TunnelEvent::Ready {
                id: self.id,
                local_addr,
            },
        );
        if ready_tx.send(local_addr).is_err() {
            debug!("Session handle dropped before readiness");
        }

        let viewer_target = ViewerTarget {
            address: local_addr,
            username: self.request.username().to_string(),
        };
        let outcome = match self.viewer.launch(&viewer_target) {
            Ok(mut viewer) => {
                self.log.line("Launching Remote Desktop Client...");
                let outcome = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(Error::Cancelled),
                    result = &mut keepalive => match result {
                        Ok(Ok(())) => Err(Error::Cancelled),
                        Ok(Err(e)) => Err(e),
                        Err(e) => Err(NetworkError::Keepalive(e.to_string()).into()),
                    },
                    status = viewer.wait() => {
                        self.log.line("Remote Desktop Client exited.");
                        match status {
                            Ok(status) if status.success() => Ok(()),
                            Ok(status) => Err(Error::Process(format!(
                                "Remote Desktop Client exited with {}",
                                status
                            ))),
                            Err(e) => Err(e),
                        }
                    }
                };
                viewer.terminate().await;
                outcome
            }
            Err(e) => Err(e),
        };

        self.set_status(TunnelState::Closing).await;
        scope.cancel();
        keepalive.abort();
        if let Err(e) = accept.await {
            warn!("Accept loop ended abnormally: {}", e);
        }
        close(&transport).await;

        outcome
    }

    async fn set_status(&self, status: TunnelState) {
        let mut state = self.state.write().await;
        if state.session == Some(self.id) {
            state.status = status;
        }
    }

    async fn finish(&self, result: &Result<()>) {
        let (status, event) = match result {
            Ok(()) => {
                self.log.line("Tunnel closed.");
                (
                    TunnelState::Closed,
                    TunnelEvent::Closed {
                        id: self.id,
                        cancelled: false,
                    },
                )
            }
            Err(Error::Cancelled) => {
                self.log.line("Tunnel closed by user.");
                (
                    TunnelState::Closed,
                    TunnelEvent::Closed {
                        id: self.id,
                        cancelled: true,
                    },
                )
            }
            Err(e) => {
                error!(session = %self.id, "Tunnel failed: {}", e);
                self.log.line(&format!("Tunnel error: {}", e));
                (
                    TunnelState::Failed(e.to_string()),
                    TunnelEvent::Failed {
                        id: self.id,
                        error: e.to_string(),
                    },
                )
            }
        };

        {
            let mut state = self.state.write().await;
            if state.session == Some(self.id) {
                state.status = status;
                state.session = None;
                state.cancel = None;
            }
        }
        emit(&self.event_tx, event);
    }
}

async fn keepalive_loop(
    transport: Arc<Handle<ClientHandler>>,
    period: Duration,
    scope: CancellationToken,
    log: SessionLog,
) -> Result<()> {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            biased;
            _ = scope.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                if let Err(e) = transport.send_keepalive(true).await {
                    log.line(&format!("Keep-alive failed: {}", e));
                    return Err(NetworkError::Keepalive(e.to_string()).into());
                }
                debug!("Keep-alive sent");
            }
        }
    }
}

/// Fixed endpoint every forwarded connection is opened to
struct ForwardTarget {
    host: String,
    port: u16,
}

async fn accept_loop(
    listener: TcpListener,
    transport: Arc<Handle<ClientHandler>>,
    target: Arc<ForwardTarget>,
    scope: CancellationToken,
    log: SessionLog,
) {
    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = scope.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            },
        };

        let connection = ForwardedConnection {
            peer,
            transport: transport.clone(),
            target: target.clone(),
            stop: scope.child_token(),
            log: log.clone(),
        };
        tokio::spawn(async move {
            let log = connection.log.clone();
            if let Err(e) = connection.run(stream).await {
                log.line(&e.to_string());
            }
        });
    }

    // Subsequent local connects are refused
    drop(listener);
    debug!("Local listener closed");
}

/// One accepted local connection paired with one SSH channel
struct ForwardedConnection {
    peer: SocketAddr,
    transport: Arc<Handle<ClientHandler>>,
    target: Arc<ForwardTarget>,
    stop: CancellationToken,
    log: SessionLog,
}

impl ForwardedConnection {
    async fn run(self, stream: TcpStream) -> std::result::Result<(), NetworkError> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", self.peer, e);
        }

        let channel = self
            .transport
            .channel_open_direct_tcpip(
                self.target.host.as_str(),
                u32::from(self.target.port),
                self.peer.ip().to_string(),
                u32::from(self.peer.port()),
            )
            .await
            .map_err(|e| NetworkError::Forward(format!("Failed to dial remote RDP port: {}", e)))?;

        self.log
            .line(&format!("Accepted connection from {}", self.peer));

        let (local_read, local_write) = stream.into_split();
        let (remote_read, remote_write) = tokio::io::split(channel.into_stream());

        let upstream = async {
            let bytes = pump(local_read, remote_write, self.stop.clone()).await;
            self.log.line(&format!(
                "Tunnel connection closed (Local->Remote). Bytes: {}",
                bytes
            ));
        };
        let downstream = async {
            let bytes = pump(remote_read, local_write, self.stop.clone()).await;
            self.log.line(&format!(
                "Tunnel connection closed (Remote->Local). Bytes: {}",
                bytes
            ));
        };
        tokio::join!(upstream, downstream);

        Ok(())
    }
}

/// Copy until EOF, error or `stop`; then stop the opposite direction too
async fn pump<R, W>(mut reader: R, mut writer: W, stop: CancellationToken) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = stop.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("Read failed: {}", e);
                    break;
                }
            },
        };

        let written = tokio::select! {
            _ = stop.cancelled() => break,
            written = writer.write_all(&buf[..n]) => written,
        };
        if let Err(e) = written {
            debug!("Write failed: {}", e);
            break;
        }
        total += n as u64;
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Shutdown failed: {}", e);
    }
    stop.cancel();
    total
}
