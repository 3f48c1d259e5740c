//! Data connection factories
//!
//! The server does not know how a proxied flow is carried; it looks up a
//! [`DataConnector`] by request kind and hands it the task payload.

use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tunrelay_proto::{CodecError, Frame, FrameCodec, RequestKind};

/// Connector errors
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("No connector registered for {0:?}")]
    Unsupported(RequestKind),

    #[error("{0:?} request carries no task data")]
    EmptyTask(RequestKind),

    #[error("No data address configured")]
    NoDataAddress,

    #[error("Invalid target in task data: {0}")]
    InvalidTarget(String),

    #[error("Failed to dial {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out dialing {0}")]
    DialTimeout(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a connector gets for one flow
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub kind: RequestKind,
    pub task: Bytes,
    /// Data address the server was built with
    pub data_addr: String,
    pub dial_timeout: Duration,
    /// Cancelled when the server shuts down
    pub shutdown: CancellationToken,
}

/// Establishes the data connection for one connection-creation request
#[async_trait]
pub trait DataConnector: Send + Sync + Debug {
    async fn connect(&self, request: ConnectRequest) -> Result<(), ConnectorError>;
}

/// Connectors keyed by request kind
#[derive(Debug, Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<RequestKind, Arc<dyn DataConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: RequestKind, connector: Arc<dyn DataConnector>) {
        self.connectors.insert(kind, connector);
    }

    pub fn with(mut self, kind: RequestKind, connector: Arc<dyn DataConnector>) -> Self {
        self.register(kind, connector);
        self
    }

    pub fn is_registered(&self, kind: RequestKind) -> bool {
        self.connectors.contains_key(&kind)
    }

    pub async fn create(&self, request: ConnectRequest) -> Result<(), ConnectorError> {
        let connector = self
            .connectors
            .get(&request.kind)
            .ok_or(ConnectorError::Unsupported(request.kind))?;

        if request.task.is_empty() {
            return Err(ConnectorError::EmptyTask(request.kind));
        }

        connector.connect(request).await
    }
}

/// Splices a plain TCP target onto a data connection
///
/// The task payload is the UTF-8 `host:port` of the target. The data
/// connection is opened to the data address and announced with one frame
/// carrying the task, then both streams are copied until either side closes.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectConnector;

impl DirectConnector {
    async fn dial(address: &str, timeout: Duration) -> Result<TcpStream, ConnectorError> {
        match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ConnectorError::Dial {
                address: address.to_string(),
                source,
            }),
            Err(_) => Err(ConnectorError::DialTimeout(address.to_string())),
        }
    }
}

#[async_trait]
impl DataConnector for DirectConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<(), ConnectorError> {
        if request.data_addr.is_empty() {
            return Err(ConnectorError::NoDataAddress);
        }

        let target = std::str::from_utf8(&request.task)
            .map_err(|e| ConnectorError::InvalidTarget(e.to_string()))?
            .trim()
            .to_string();
        if !target.contains(':') {
            return Err(ConnectorError::InvalidTarget(target));
        }

        let data = Self::dial(&request.data_addr, request.dial_timeout).await?;
        let mut framed = Framed::new(data, FrameCodec::new());
        let announce_tag = request
            .kind
            .plugin_tag()
            .ok_or(ConnectorError::Unsupported(request.kind))?;
        framed
            .send(Frame::new(announce_tag, request.task.clone()))
            .await?;

        // Bytes read past the announcement belong to the flow
        let parts = framed.into_parts();
        let mut data = parts.io;
        let mut target_stream = Self::dial(&target, request.dial_timeout).await?;
        if !parts.read_buf.is_empty() {
            target_stream.write_all(&parts.read_buf).await?;
        }

        debug!(target = %target, data_addr = %request.data_addr, "Splicing data connection");

        tokio::select! {
            _ = request.shutdown.cancelled() => {
                debug!(target = %target, "Data connection cancelled");
            }
            result = tokio::io::copy_bidirectional(&mut data, &mut target_stream) => {
                let (to_target, to_data) = result?;
                debug!(target = %target, to_target, to_data, "Data connection closed");
            }
        }

        Ok(())
    }
}
