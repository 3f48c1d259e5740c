//! Relay server: dispatch loop and tunnel reconnection

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};
use tunrelay_proto::{Frame, PluginTag, Request, RequestKind, Role, TunnelTag};

use crate::config::{ConfigError, RelayAddresses, RelayConfig};
use crate::connection::{
    send_frame, ConnectionError, ConnectionManager, Dialer, Inbound, LoopContext, RoleFault,
    TcpDialer,
};
use crate::connector::{ConnectRequest, ConnectorRegistry, DataConnector};
use crate::keepalive::LastReceipt;

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to set up plugin connection: {0}")]
    SetupPlugin(#[source] ConnectionError),

    #[error("Tunnel reconnect failed: {0}")]
    Reconnect(#[source] ConnectionError),

    #[error("{0} connection is down")]
    RoleDown(Role),

    #[error("Failed to forward to {role}: {source}")]
    Forward {
        role: Role,
        #[source]
        source: ConnectionError,
    },

    #[error("Dispatch loop already running")]
    AlreadyRunning,
}

struct Receivers {
    requests: mpsc::Receiver<Inbound>,
    plugin_faults: mpsc::UnboundedReceiver<RoleFault>,
    tunnel_faults: mpsc::UnboundedReceiver<RoleFault>,
}

/// Builder for Server
pub struct ServerBuilder {
    addresses: RelayAddresses,
    config: RelayConfig,
    dialer: Arc<dyn Dialer>,
    connectors: ConnectorRegistry,
}

impl ServerBuilder {
    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn connectors(mut self, connectors: ConnectorRegistry) -> Self {
        self.connectors = connectors;
        self
    }

    pub fn connector(mut self, kind: RequestKind, connector: Arc<dyn DataConnector>) -> Self {
        self.connectors.register(kind, connector);
        self
    }

    /// Build the server and set up the plugin connection
    ///
    /// The tunnel is not dialed here: a pending tunnel fault is queued so the
    /// dispatch loop brings it up through the regular reconnect path.
    pub async fn build(self) -> Result<Server, ServerError> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let (requests_tx, requests) = mpsc::channel(config.request_buffer);
        let (plugin_faults_tx, plugin_faults) = mpsc::unbounded_channel();
        let (tunnel_faults_tx, tunnel_faults) = mpsc::unbounded_channel();

        let root = CancellationToken::new();
        let ctx = LoopContext {
            requests: requests_tx,
            plugin_faults: plugin_faults_tx,
            tunnel_faults: tunnel_faults_tx,
            last_receipt: Arc::new(LastReceipt::new()),
            config: config.clone(),
        };
        let connections =
            ConnectionManager::new(&self.addresses, self.dialer, root.clone(), ctx.clone());

        let server = Server {
            config,
            data_addr: self.addresses.data.clone(),
            root,
            connections,
            connectors: Arc::new(self.connectors),
            flows: TaskTracker::new(),
            tunnel_ready: AtomicBool::new(false),
            ctx,
            receivers: Mutex::new(Some(Receivers {
                requests,
                plugin_faults,
                tunnel_faults,
            })),
        };

        server
            .connections
            .setup(Role::Plugin)
            .await
            .map_err(ServerError::SetupPlugin)?;

        server.ctx.report(RoleFault {
            role: Role::Tunnel,
            generation: 0,
            error: ConnectionError::NotEstablished(Role::Tunnel),
        });

        info!(
            plugin = %self.addresses.plugin,
            tunnel = %self.addresses.tunnel,
            data = %self.addresses.data,
            "Relay server created"
        );
        Ok(server)
    }
}

/// Bridges the plugin channel and the tunnel channel
pub struct Server {
    config: Arc<RelayConfig>,
    data_addr: String,
    root: CancellationToken,
    connections: ConnectionManager,
    connectors: Arc<ConnectorRegistry>,
    /// Data connections in flight
    flows: TaskTracker,
    tunnel_ready: AtomicBool,
    ctx: LoopContext,
    receivers: Mutex<Option<Receivers>>,
}

impl Server {
    pub fn builder(addresses: RelayAddresses) -> ServerBuilder {
        ServerBuilder {
            addresses,
            config: RelayConfig::default(),
            dialer: Arc::new(TcpDialer),
            connectors: ConnectorRegistry::new(),
        }
    }

    /// Build a server with the default configuration and no data connectors
    pub async fn new(addresses: RelayAddresses) -> Result<Self, ServerError> {
        Self::builder(addresses).build().await
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Run the dispatch loop until the server is shut down
    ///
    /// Returns once every poll loop, monitor and data connection has exited.
    pub async fn run(&self) -> Result<(), ServerError> {
        let mut rx = self
            .receivers
            .lock()
            .await
            .take()
            .ok_or(ServerError::AlreadyRunning)?;

        info!("Dispatch loop started");

        loop {
            tokio::select! {
                biased;
                _ = self.root.cancelled() => break,
                Some(fault) = rx.tunnel_faults.recv() => {
                    if let Err(e) = self.handle_tunnel_fault(fault).await {
                        warn!(error = %e, "Tunnel remains down until the next setup");
                    }
                }
                Some(fault) = rx.plugin_faults.recv() => {
                    self.handle_plugin_fault(fault).await;
                }
                Some(inbound) = rx.requests.recv() => {
                    let kind = inbound.request.kind;
                    if let Err(e) = self.handle_inbound(inbound).await {
                        warn!(kind = ?kind, error = %e, "Request failed");
                    }
                }
            }
        }

        info!("Dispatch loop stopping");
        self.drain().await;
        info!("Dispatch loop stopped");
        Ok(())
    }

    /// Cancel everything and wait for all loops and data connections to exit
    pub async fn shutdown(&self) {
        info!("Shutting down relay server");
        self.root.cancel();
        self.drain().await;
    }

    async fn drain(&self) {
        self.connections.retire_all().await;
        self.flows.close();
        self.flows.wait().await;
    }

    async fn handle_inbound(&self, inbound: Inbound) -> Result<(), ServerError> {
        // A handshake queued by a generation that has since been retired
        // must not mark the tunnel ready
        if inbound.request.kind == RequestKind::TunnelConnectOk
            && !self.connections.is_live(inbound.role, inbound.generation).await
        {
            debug!(generation = inbound.generation, "Ignoring handshake from a retired tunnel");
            return Ok(());
        }
        self.handle_request(inbound.request).await
    }

    /// Route one request by kind
    pub async fn handle_request(&self, request: Request) -> Result<(), ServerError> {
        match request.kind {
            RequestKind::CreateShadowsocksConnect
            | RequestKind::CreateSocks5Connect
            | RequestKind::CreateHttpConnect
            | RequestKind::CreateDirectConnect => {
                self.spawn_flow(request.kind, request.task());
                Ok(())
            }
            RequestKind::PushTask => {
                self.forward(Role::Tunnel, Frame::new(TunnelTag::Task, request.task()))
                    .await
            }
            RequestKind::TaskResult => {
                self.forward(Role::Plugin, Frame::new(PluginTag::TaskResult, request.task()))
                    .await
            }
            RequestKind::TunnelConnectOk => {
                self.tunnel_ready.store(true, Ordering::SeqCst);
                info!("Tunnel ready");
                Ok(())
            }
            RequestKind::Ping => {
                trace!("Keepalive from tunnel peer");
                Ok(())
            }
        }
    }

    fn spawn_flow(&self, kind: RequestKind, task: bytes::Bytes) {
        let request = ConnectRequest {
            kind,
            task,
            data_addr: self.data_addr.clone(),
            dial_timeout: self.config.dial_timeout,
            shutdown: self.root.child_token(),
        };
        let connectors = self.connectors.clone();

        self.flows.spawn(async move {
            match connectors.create(request).await {
                Ok(()) => debug!(kind = ?kind, "Data connection finished"),
                Err(e) => warn!(kind = ?kind, error = %e, "Data connection failed"),
            }
        });
    }

    async fn forward(&self, role: Role, frame: Frame) -> Result<(), ServerError> {
        let writer = self
            .connections
            .writer(role)
            .await
            .ok_or(ServerError::RoleDown(role))?;
        send_frame(&writer, frame, self.config.write_timeout)
            .await
            .map_err(|source| ServerError::Forward { role, source })
    }

    async fn handle_tunnel_fault(&self, fault: RoleFault) -> Result<(), ServerError> {
        if !self.connections.accepts_fault(&fault).await {
            debug!(
                generation = fault.generation,
                error = %fault.error,
                "Ignoring fault from a retired tunnel"
            );
            return Ok(());
        }

        self.tunnel_ready.store(false, Ordering::SeqCst);
        warn!(generation = fault.generation, error = %fault.error, "Tunnel down, reconnecting");

        // The surviving loop of the dead generation must not fault again
        self.connections.retire(Role::Tunnel).await;
        self.reconnect_tunnel().await
    }

    /// Make exactly one attempt to re-establish the tunnel
    ///
    /// On failure the plugin receives a single reconnect-failed notification
    /// and the tunnel stays down until the next external setup.
    pub async fn reconnect_tunnel(&self) -> Result<(), ServerError> {
        match self.connections.setup(Role::Tunnel).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, "Tunnel reconnect failed, notifying plugin");
                self.notify_plugin(Frame::empty(PluginTag::TunnelReconnectFailed))
                    .await;
                Err(ServerError::Reconnect(e))
            }
        }
    }

    async fn notify_plugin(&self, frame: Frame) {
        if let Err(e) = self.forward(Role::Plugin, frame).await {
            warn!(error = %e, "Could not notify plugin");
        }
    }

    async fn handle_plugin_fault(&self, fault: RoleFault) {
        if !self.connections.accepts_fault(&fault).await {
            debug!(generation = fault.generation, "Ignoring fault from a retired plugin");
            return;
        }

        error!(
            generation = fault.generation,
            error = %fault.error,
            "Plugin connection failed, waiting for external setup"
        );
        self.connections.retire(Role::Plugin).await;
    }

    /// Re-establish a role from its configured address
    pub async fn setup(&self, role: Role) -> Result<(), ConnectionError> {
        self.connections.setup(role).await
    }

    /// Install an externally established stream for a role
    pub async fn attach<S>(&self, role: Role, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.connections.attach(role, stream).await
    }

    pub async fn set_address(&self, role: Role, address: impl Into<String>) {
        self.connections.set_address(role, address).await
    }

    pub fn is_tunnel_ready(&self) -> bool {
        self.tunnel_ready.load(Ordering::SeqCst)
    }

    pub fn active_loops(&self, role: Role) -> usize {
        self.connections.active_loops(role)
    }

    pub async fn generation(&self, role: Role) -> u64 {
        self.connections.generation(role).await
    }

    /// Token cancelled when the server shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.root.clone()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
