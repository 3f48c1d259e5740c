//! Channel-agnostic requests handed to the dispatcher

use bytes::Bytes;
use std::ops::Range;
use thiserror::Error;

use crate::codec::Frame;
use crate::messages::{PluginTag, Role, TunnelTag, UnknownTag};

/// Request kinds
///
/// The connection-creation kinds form a contiguous range that ends at
/// [`RequestKind::TYPE_END`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestKind {
    PushTask = 0,
    TaskResult = 1,
    TunnelConnectOk = 2,
    Ping = 3,
    CreateShadowsocksConnect = 4,
    CreateSocks5Connect = 5,
    CreateHttpConnect = 6,
    CreateDirectConnect = 7,
}

impl RequestKind {
    /// One past the last connection-creation kind
    pub const TYPE_END: u8 = RequestKind::CreateDirectConnect as u8 + 1;

    /// Discriminant range of the connection-creation kinds
    pub const CONNECT_RANGE: Range<u8> = RequestKind::CreateShadowsocksConnect as u8..Self::TYPE_END;

    pub fn is_connect(&self) -> bool {
        Self::CONNECT_RANGE.contains(&(*self as u8))
    }

    /// Iterate over every connection-creation kind
    pub fn connect_kinds() -> impl Iterator<Item = RequestKind> {
        Self::CONNECT_RANGE.filter_map(|value| RequestKind::try_from(value).ok())
    }

    /// Plugin tag carrying this kind
    pub fn plugin_tag(&self) -> Option<PluginTag> {
        match self {
            RequestKind::PushTask => Some(PluginTag::PushTask),
            RequestKind::TaskResult => Some(PluginTag::TaskResult),
            RequestKind::CreateShadowsocksConnect => Some(PluginTag::CreateShadowsocksConnect),
            RequestKind::CreateSocks5Connect => Some(PluginTag::CreateSocks5Connect),
            RequestKind::CreateHttpConnect => Some(PluginTag::CreateHttpConnect),
            RequestKind::CreateDirectConnect => Some(PluginTag::CreateDirectConnect),
            RequestKind::TunnelConnectOk | RequestKind::Ping => None,
        }
    }
}

impl TryFrom<u8> for RequestKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RequestKind::PushTask),
            1 => Ok(RequestKind::TaskResult),
            2 => Ok(RequestKind::TunnelConnectOk),
            3 => Ok(RequestKind::Ping),
            4 => Ok(RequestKind::CreateShadowsocksConnect),
            5 => Ok(RequestKind::CreateSocks5Connect),
            6 => Ok(RequestKind::CreateHttpConnect),
            7 => Ok(RequestKind::CreateDirectConnect),
            other => Err(other),
        }
    }
}

/// Frame that cannot be turned into a request on the channel it was read from
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error(transparent)]
    UnknownTag(#[from] UnknownTag),

    #[error("{tag:?} is not accepted on the {role} channel")]
    UnexpectedTag { role: Role, tag: PluginTag },
}

/// Decoded request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub kind: RequestKind,
    pub task_data: Option<Bytes>,
}

impl Request {
    pub fn new(kind: RequestKind, task_data: Bytes) -> Self {
        Self {
            kind,
            task_data: Some(task_data),
        }
    }

    /// Request without task data (handshake, keepalive)
    pub fn signal(kind: RequestKind) -> Self {
        Self {
            kind,
            task_data: None,
        }
    }

    /// Translate a frame read from the plugin channel
    pub fn from_plugin_frame(frame: Frame) -> Result<Self, RequestError> {
        let tag = PluginTag::try_from(frame.tag)?;
        let kind = match tag {
            PluginTag::PushTask => RequestKind::PushTask,
            PluginTag::CreateShadowsocksConnect => RequestKind::CreateShadowsocksConnect,
            PluginTag::CreateSocks5Connect => RequestKind::CreateSocks5Connect,
            PluginTag::CreateHttpConnect => RequestKind::CreateHttpConnect,
            PluginTag::CreateDirectConnect => RequestKind::CreateDirectConnect,
            PluginTag::TaskResult | PluginTag::TunnelReconnectFailed => {
                return Err(RequestError::UnexpectedTag {
                    role: Role::Plugin,
                    tag,
                })
            }
        };
        Ok(Self::new(kind, frame.payload))
    }

    /// Translate a frame read from the tunnel channel
    pub fn from_tunnel_frame(frame: Frame) -> Result<Self, RequestError> {
        match TunnelTag::try_from(frame.tag)? {
            TunnelTag::Task => Ok(Self::new(RequestKind::TaskResult, frame.payload)),
            TunnelTag::Ping => Ok(Self::signal(RequestKind::Ping)),
        }
    }

    /// Task data, empty when absent
    pub fn task(&self) -> Bytes {
        self.task_data.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_range() {
        let kinds: Vec<_> = RequestKind::connect_kinds().collect();
        assert_eq!(
            kinds,
            vec![
                RequestKind::CreateShadowsocksConnect,
                RequestKind::CreateSocks5Connect,
                RequestKind::CreateHttpConnect,
                RequestKind::CreateDirectConnect,
            ]
        );
        assert!(kinds.iter().all(RequestKind::is_connect));
        assert!(!RequestKind::PushTask.is_connect());
        assert!(!RequestKind::Ping.is_connect());
        assert!(RequestKind::try_from(RequestKind::TYPE_END).is_err());
    }

    #[test]
    fn test_plugin_push_task() {
        let frame = Frame::new(PluginTag::PushTask, Bytes::from_static(&[2]));
        let request = Request::from_plugin_frame(frame).unwrap();
        assert_eq!(
            request,
            Request::new(RequestKind::PushTask, Bytes::from_static(&[2]))
        );
    }

    #[test]
    fn test_plugin_connect_kinds_follow_tags() {
        for kind in RequestKind::connect_kinds() {
            let tag = kind.plugin_tag().unwrap();
            let request = Request::from_plugin_frame(Frame::empty(tag)).unwrap();
            assert_eq!(request.kind, kind);
        }
    }

    #[test]
    fn test_plugin_rejects_outbound_tags() {
        let result = Request::from_plugin_frame(Frame::empty(PluginTag::TunnelReconnectFailed));
        assert!(matches!(
            result,
            Err(RequestError::UnexpectedTag {
                role: Role::Plugin,
                ..
            })
        ));
    }

    #[test]
    fn test_plugin_unknown_tag() {
        let result = Request::from_plugin_frame(Frame::new(0xFFu8, Bytes::from_static(&[2])));
        assert!(matches!(result, Err(RequestError::UnknownTag(_))));
    }

    #[test]
    fn test_tunnel_frames() {
        let task = Request::from_tunnel_frame(Frame::new(TunnelTag::Task, Bytes::from("r")));
        assert_eq!(
            task.unwrap(),
            Request::new(RequestKind::TaskResult, Bytes::from("r"))
        );

        let ping = Request::from_tunnel_frame(Frame::empty(TunnelTag::Ping)).unwrap();
        assert_eq!(ping, Request::signal(RequestKind::Ping));
        assert!(ping.task().is_empty());
    }

    #[test]
    fn test_tunnel_unknown_tag() {
        let result = Request::from_tunnel_frame(Frame::empty(0x10u8));
        assert_eq!(
            result,
            Err(RequestError::UnknownTag(UnknownTag {
                role: Role::Tunnel,
                tag: 0x10
            }))
        );
    }
}
