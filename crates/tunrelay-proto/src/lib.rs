//! Relay Protocol Definitions
//!
//! This crate defines the wire framing shared by the plugin and tunnel channels
//! and the request model the relay server dispatches on.

pub mod codec;
pub mod messages;
pub mod request;

pub use codec::{CodecError, Frame, FrameCodec};
pub use messages::{PluginTag, Role, TunnelTag, UnknownTag};
pub use request::{Request, RequestError, RequestKind};

/// Maximum frame payload size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
