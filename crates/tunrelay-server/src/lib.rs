//! Relay server
//!
//! Keeps a plugin connection and a tunnel connection alive, turns the frames
//! they carry into requests, and routes each request from a single dispatch
//! loop. A tunnel that fails (peer closed, protocol error, missed keepalive) is
//! redialed once; if that fails the plugin is told.

pub mod config;
pub mod connection;
pub mod connector;
pub mod keepalive;
mod poller;
pub mod server;

pub use config::{ConfigError, RelayAddresses, RelayConfig, RelayConfigBuilder};
pub use connection::{
    send_frame, BoxedStream, ConnectionError, ConnectionManager, Dialer, Inbound, RelayStream,
    RoleFault, TcpDialer,
};
pub use connector::{
    ConnectRequest, ConnectorError, ConnectorRegistry, DataConnector, DirectConnector,
};
pub use keepalive::LastReceipt;
pub use server::{Server, ServerBuilder, ServerError};
