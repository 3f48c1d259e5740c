//! Plugin and tunnel connection management
//!
//! Each role owns at most one live transport at a time. Installing a new
//! transport first retires the previous generation (cancel its scope, wait for
//! its loops to drain) so two poll loops never race on the same role.

use async_trait::async_trait;
use futures::SinkExt;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use tunrelay_proto::{CodecError, Frame, FrameCodec, Request, RequestError, Role};

use crate::config::{RelayAddresses, RelayConfig};
use crate::keepalive::{monitor_tunnel, LastReceipt};
use crate::poller::{poll_plugin, poll_tunnel};

/// Connection errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] RequestError),

    #[error("Connection closed by peer")]
    Closed,

    #[error("No traffic from tunnel peer for {0:?}")]
    KeepaliveTimeout(Duration),

    #[error("Failed to dial {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out dialing {address} after {timeout:?}")]
    DialTimeout { address: String, timeout: Duration },

    #[error("Frame write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("Frame write failed: {0}")]
    Write(CodecError),

    #[error("{0} connection not established")]
    NotEstablished(Role),
}

/// A fault raised by a poll loop or the keepalive monitor
#[derive(Debug)]
pub struct RoleFault {
    pub role: Role,
    /// Generation of the connection that raised the fault
    pub generation: u64,
    pub error: ConnectionError,
}

/// A request tagged with the connection that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub role: Role,
    pub generation: u64,
    pub request: Request,
}

/// Any byte stream a role can run over
pub trait RelayStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RelayStream for T {}

pub type BoxedStream = Box<dyn RelayStream>;
pub type FrameReader = FramedRead<Box<dyn AsyncRead + Send + Unpin>, FrameCodec>;
pub type FrameWriter = Arc<Mutex<FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, FrameCodec>>>;

/// Establishes plugin and tunnel transports
#[async_trait]
pub trait Dialer: Send + Sync + Debug {
    async fn dial(&self, address: &str) -> std::io::Result<BoxedStream>;
}

/// Plain TCP dialer
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, address: &str) -> std::io::Result<BoxedStream> {
        let stream = tokio::net::TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Write one frame, bounded by `timeout`
pub async fn send_frame(
    writer: &FrameWriter,
    frame: Frame,
    timeout: Duration,
) -> Result<(), ConnectionError> {
    let mut sink = writer.lock().await;
    match tokio::time::timeout(timeout, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Write(e)),
        Err(_) => Err(ConnectionError::WriteTimeout(timeout)),
    }
}

/// Channels and shared state handed to every loop
#[derive(Clone)]
pub(crate) struct LoopContext {
    pub requests: mpsc::Sender<Inbound>,
    pub plugin_faults: mpsc::UnboundedSender<RoleFault>,
    pub tunnel_faults: mpsc::UnboundedSender<RoleFault>,
    pub last_receipt: Arc<LastReceipt>,
    pub config: Arc<RelayConfig>,
}

impl LoopContext {
    /// Deliver a fault on the role's error-signal channel
    pub fn report(&self, fault: RoleFault) {
        let faults = match fault.role {
            Role::Plugin => &self.plugin_faults,
            Role::Tunnel => &self.tunnel_faults,
        };
        if let Err(e) = faults.send(fault) {
            debug!(role = %e.0.role, "Dispatcher gone, dropping fault");
        }
    }
}

struct ConnectionState {
    address: String,
    writer: Option<FrameWriter>,
    scope: Option<CancellationToken>,
    generation: u64,
}

/// Bookkeeping for one role
pub struct ManagedConnection {
    role: Role,
    state: Mutex<ConnectionState>,
    /// Counts the loops of the current generation
    tracker: TaskTracker,
}

impl ManagedConnection {
    fn new(role: Role, address: String) -> Self {
        Self {
            role,
            state: Mutex::new(ConnectionState {
                address,
                writer: None,
                scope: None,
                generation: 0,
            }),
            tracker: TaskTracker::new(),
        }
    }

    /// Cancel the current generation and wait for its loops to exit
    async fn retire(&self, state: &mut ConnectionState) {
        if let Some(scope) = state.scope.take() {
            debug!(role = %self.role, generation = state.generation, "Retiring connection");
            scope.cancel();
        }
        state.writer = None;

        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

/// Owns dialing, replacing and tearing down the plugin and tunnel connections
pub struct ConnectionManager {
    plugin: ManagedConnection,
    tunnel: ManagedConnection,
    dialer: Arc<dyn Dialer>,
    root: CancellationToken,
    ctx: LoopContext,
}

impl ConnectionManager {
    pub(crate) fn new(
        addresses: &RelayAddresses,
        dialer: Arc<dyn Dialer>,
        root: CancellationToken,
        ctx: LoopContext,
    ) -> Self {
        Self {
            plugin: ManagedConnection::new(Role::Plugin, addresses.plugin.clone()),
            tunnel: ManagedConnection::new(Role::Tunnel, addresses.tunnel.clone()),
            dialer,
            root,
            ctx,
        }
    }

    fn managed(&self, role: Role) -> &ManagedConnection {
        match role {
            Role::Plugin => &self.plugin,
            Role::Tunnel => &self.tunnel,
        }
    }

    /// Dial the role's address and install the new connection
    ///
    /// An empty address means the role is disabled and succeeds without doing
    /// anything. A failed dial leaves the current connection untouched.
    pub async fn setup(&self, role: Role) -> Result<(), ConnectionError> {
        let managed = self.managed(role);
        let mut state = managed.state.lock().await;

        if state.address.is_empty() {
            debug!(role = %role, "No address configured, skipping setup");
            return Ok(());
        }

        let address = state.address.clone();
        info!(role = %role, address = %address, "Connecting");
        let stream = self.dial(&address).await?;

        self.install(managed, &mut state, stream).await;
        info!(
            role = %role,
            address = %address,
            generation = state.generation,
            "Connected"
        );
        Ok(())
    }

    /// Install an externally established stream for the role
    pub async fn attach<S>(&self, role: Role, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let managed = self.managed(role);
        let mut state = managed.state.lock().await;
        self.install(managed, &mut state, stream).await;
        info!(role = %role, generation = state.generation, "Attached connection");
    }

    /// Tear the role down; it stays down until the next setup or attach
    pub async fn retire(&self, role: Role) {
        let managed = self.managed(role);
        let mut state = managed.state.lock().await;
        managed.retire(&mut state).await;
    }

    /// Tear down both roles
    pub async fn retire_all(&self) {
        self.retire(Role::Plugin).await;
        self.retire(Role::Tunnel).await;
    }

    pub async fn set_address(&self, role: Role, address: impl Into<String>) {
        self.managed(role).state.lock().await.address = address.into();
    }

    pub async fn address(&self, role: Role) -> String {
        self.managed(role).state.lock().await.address.clone()
    }

    /// Writer of the live connection, if any
    pub async fn writer(&self, role: Role) -> Option<FrameWriter> {
        self.managed(role).state.lock().await.writer.clone()
    }

    pub async fn generation(&self, role: Role) -> u64 {
        self.managed(role).state.lock().await.generation
    }

    /// Whether `generation` is the installed, not yet retired connection
    pub async fn is_live(&self, role: Role, generation: u64) -> bool {
        let state = self.managed(role).state.lock().await;
        state.scope.is_some() && state.generation == generation
    }

    /// Whether a fault still describes the role's current state
    ///
    /// Faults from a replaced or retired generation are dropped. Generation 0
    /// stands for "nothing installed yet" and is accepted until the first
    /// install.
    pub async fn accepts_fault(&self, fault: &RoleFault) -> bool {
        let state = self.managed(fault.role).state.lock().await;
        if fault.generation != state.generation {
            return false;
        }
        state.scope.is_some() || state.generation == 0
    }

    /// Number of loops still running for the role
    pub fn active_loops(&self, role: Role) -> usize {
        self.managed(role).tracker.len()
    }

    async fn dial(&self, address: &str) -> Result<BoxedStream, ConnectionError> {
        let timeout = self.ctx.config.dial_timeout;
        match tokio::time::timeout(timeout, self.dialer.dial(address)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ConnectionError::Dial {
                address: address.to_string(),
                source,
            }),
            Err(_) => Err(ConnectionError::DialTimeout {
                address: address.to_string(),
                timeout,
            }),
        }
    }

    async fn install<S>(&self, managed: &ManagedConnection, state: &mut ConnectionState, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        managed.retire(state).await;

        if self.root.is_cancelled() {
            warn!(role = %managed.role, "Server shutting down, not starting loops");
            return;
        }

        let (read_half, write_half) = tokio::io::split(stream);
        let reader: FrameReader = FramedRead::new(Box::new(read_half), FrameCodec::new());
        let writer: FrameWriter = Arc::new(Mutex::new(FramedWrite::new(
            Box::new(write_half),
            FrameCodec::new(),
        )));

        let scope = self.root.child_token();
        state.generation += 1;
        let generation = state.generation;

        match managed.role {
            Role::Plugin => {
                managed.tracker.spawn(poll_plugin(
                    reader,
                    scope.clone(),
                    generation,
                    self.ctx.clone(),
                ));
            }
            Role::Tunnel => {
                managed.tracker.spawn(poll_tunnel(
                    reader,
                    scope.clone(),
                    generation,
                    self.ctx.clone(),
                ));
                managed.tracker.spawn(monitor_tunnel(
                    writer.clone(),
                    scope.clone(),
                    generation,
                    self.ctx.clone(),
                ));
            }
        }

        state.writer = Some(writer);
        state.scope = Some(scope);
    }
}
