//! Tag spaces for the plugin and tunnel channels
//!
//! Both channels share the frame layout but not the tag values: a tag is only
//! meaningful together with the channel it was read from.

use std::fmt;
use thiserror::Error;

/// The two managed peer roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Local control connection that supplies work and receives status
    Plugin,
    /// Connection to the remote peer carrying task results and keepalives
    Tunnel,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Plugin => "plugin",
            Role::Tunnel => "tunnel",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tag value not defined for the channel it arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Unknown {role} tag: {tag:#04x}")]
pub struct UnknownTag {
    pub role: Role,
    pub tag: u8,
}

/// Plugin channel tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PluginTag {
    PushTask = 0x01,
    /// Server -> plugin: a task result relayed from the tunnel
    TaskResult = 0x02,
    CreateShadowsocksConnect = 0x10,
    CreateSocks5Connect = 0x11,
    CreateHttpConnect = 0x12,
    CreateDirectConnect = 0x13,
    /// Server -> plugin: the tunnel is down and one reconnect attempt failed
    TunnelReconnectFailed = 0xF0,
}

impl PluginTag {
    /// Whether the plugin is allowed to send this tag to the server
    pub fn is_inbound(&self) -> bool {
        !matches!(self, PluginTag::TaskResult | PluginTag::TunnelReconnectFailed)
    }
}

impl TryFrom<u8> for PluginTag {
    type Error = UnknownTag;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PluginTag::PushTask),
            0x02 => Ok(PluginTag::TaskResult),
            0x10 => Ok(PluginTag::CreateShadowsocksConnect),
            0x11 => Ok(PluginTag::CreateSocks5Connect),
            0x12 => Ok(PluginTag::CreateHttpConnect),
            0x13 => Ok(PluginTag::CreateDirectConnect),
            0xF0 => Ok(PluginTag::TunnelReconnectFailed),
            tag => Err(UnknownTag {
                role: Role::Plugin,
                tag,
            }),
        }
    }
}

impl From<PluginTag> for u8 {
    fn from(tag: PluginTag) -> u8 {
        tag as u8
    }
}

/// Tunnel channel tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TunnelTag {
    Task = 0x01,
    /// Keepalive probe, zero-length, sent in both directions
    Ping = 0x02,
}

impl TryFrom<u8> for TunnelTag {
    type Error = UnknownTag;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(TunnelTag::Task),
            0x02 => Ok(TunnelTag::Ping),
            tag => Err(UnknownTag {
                role: Role::Tunnel,
                tag,
            }),
        }
    }
}

impl From<TunnelTag> for u8 {
    fn from(tag: TunnelTag) -> u8 {
        tag as u8
    }
}
