//! Poll loops turning plugin and tunnel frames into requests

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};
use tunrelay_proto::{Frame, Request, RequestError, RequestKind, Role};

use crate::connection::{ConnectionError, FrameReader, Inbound, LoopContext, RoleFault};

pub(crate) async fn poll_plugin(
    frames: FrameReader,
    scope: CancellationToken,
    generation: u64,
    ctx: LoopContext,
) {
    poll(Role::Plugin, frames, scope, generation, ctx).await
}

/// Announces the freshly attached tunnel before reading anything
pub(crate) async fn poll_tunnel(
    frames: FrameReader,
    scope: CancellationToken,
    generation: u64,
    ctx: LoopContext,
) {
    let handshake = Inbound {
        role: Role::Tunnel,
        generation,
        request: Request::signal(RequestKind::TunnelConnectOk),
    };
    if !forward(&scope, &ctx, handshake).await {
        return;
    }
    poll(Role::Tunnel, frames, scope, generation, ctx).await
}

async fn poll(
    role: Role,
    mut frames: FrameReader,
    scope: CancellationToken,
    generation: u64,
    ctx: LoopContext,
) {
    let read_timeout = ctx.config.read_timeout;

    loop {
        let next = tokio::select! {
            biased;
            _ = scope.cancelled() => {
                debug!(role = %role, generation, "Poll loop cancelled");
                return;
            }
            next = tokio::time::timeout(read_timeout, frames.next()) => next,
        };

        let frame = match next {
            // Deadline elapsed without a frame, check for cancellation again
            Err(_) => continue,
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => return fail(role, generation, &ctx, e.into()),
            Ok(None) => return fail(role, generation, &ctx, ConnectionError::Closed),
        };

        let request = match decode(role, frame) {
            Ok(request) => request,
            Err(e) => return fail(role, generation, &ctx, e.into()),
        };

        if role == Role::Tunnel {
            ctx.last_receipt.touch();
        }

        trace!(role = %role, generation, kind = ?request.kind, "Received request");
        let inbound = Inbound {
            role,
            generation,
            request,
        };
        if !forward(&scope, &ctx, inbound).await {
            return;
        }
    }
}

fn decode(role: Role, frame: Frame) -> Result<Request, RequestError> {
    match role {
        Role::Plugin => Request::from_plugin_frame(frame),
        Role::Tunnel => Request::from_tunnel_frame(frame),
    }
}

/// Hand a request to the dispatcher; false when the loop should stop
async fn forward(scope: &CancellationToken, ctx: &LoopContext, inbound: Inbound) -> bool {
    tokio::select! {
        biased;
        _ = scope.cancelled() => false,
        sent = ctx.requests.send(inbound) => {
            if sent.is_err() {
                debug!("Dispatcher gone, stopping poll loop");
            }
            sent.is_ok()
        }
    }
}

fn fail(role: Role, generation: u64, ctx: &LoopContext, error: ConnectionError) {
    error!(role = %role, generation, error = %error, "Poll loop failed");
    ctx.report(RoleFault {
        role,
        generation,
        error,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::keepalive::LastReceipt;
    use bytes::Bytes;
    use futures::SinkExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;
    use tokio_util::codec::{FramedRead, FramedWrite};
    use tunrelay_proto::{FrameCodec, PluginTag, TunnelTag};

    struct Harness {
        ctx: LoopContext,
        requests: mpsc::Receiver<Inbound>,
        plugin_faults: mpsc::UnboundedReceiver<RoleFault>,
        tunnel_faults: mpsc::UnboundedReceiver<RoleFault>,
    }

    fn harness() -> Harness {
        let config = RelayConfig::builder()
            .read_timeout(Duration::from_millis(1))
            .build()
            .unwrap();
        let (requests_tx, requests) = mpsc::channel(16);
        let (plugin_tx, plugin_faults) = mpsc::unbounded_channel();
        let (tunnel_tx, tunnel_faults) = mpsc::unbounded_channel();
        Harness {
            ctx: LoopContext {
                requests: requests_tx,
                plugin_faults: plugin_tx,
                tunnel_faults: tunnel_tx,
                last_receipt: Arc::new(LastReceipt::new()),
                config: Arc::new(config),
            },
            requests,
            plugin_faults,
            tunnel_faults,
        }
    }

    fn pipe() -> (FrameReader, FramedWrite<DuplexStream, FrameCodec>) {
        let (local, remote) = tokio::io::duplex(1024);
        let reader: FrameReader = FramedRead::new(Box::new(local), FrameCodec::new());
        (reader, FramedWrite::new(remote, FrameCodec::new()))
    }

    #[tokio::test]
    async fn test_poll_plugin() {
        let mut h = harness();
        let (reader, mut peer) = pipe();
        let scope = CancellationToken::new();
        let task = tokio::spawn(poll_plugin(reader, scope, 1, h.ctx.clone()));

        peer.send(Frame::new(PluginTag::PushTask, Bytes::from_static(&[2])))
            .await
            .unwrap();
        let expect = Request::new(RequestKind::PushTask, Bytes::from_static(&[2]));
        let inbound = h.requests.recv().await.unwrap();
        assert_eq!(inbound.role, Role::Plugin);
        assert_eq!(inbound.generation, 1);
        assert_eq!(inbound.request, expect);

        // Unknown tag ends the loop with exactly one fault
        peer.send(Frame::new(0xFFu8, Bytes::from_static(&[2])))
            .await
            .unwrap();
        let fault = h.plugin_faults.recv().await.unwrap();
        assert_eq!(fault.role, Role::Plugin);
        assert_eq!(fault.generation, 1);
        assert!(matches!(
            fault.error,
            ConnectionError::Protocol(RequestError::UnknownTag(_))
        ));
        task.await.unwrap();

        assert!(h.plugin_faults.try_recv().is_err());
        assert!(h.requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_poll_plugin_cancelled() {
        let mut h = harness();
        let (reader, _peer) = pipe();
        let scope = CancellationToken::new();
        let task = tokio::spawn(poll_plugin(reader, scope.clone(), 1, h.ctx.clone()));

        scope.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(h.plugin_faults.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_poll_plugin_peer_closed() {
        let mut h = harness();
        let (reader, peer) = pipe();
        let task = tokio::spawn(poll_plugin(reader, CancellationToken::new(), 4, h.ctx.clone()));

        drop(peer);
        let fault = h.plugin_faults.recv().await.unwrap();
        assert!(matches!(fault.error, ConnectionError::Closed));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_deadline_is_not_an_error() {
        let mut h = harness();
        let (reader, mut peer) = pipe();
        let scope = CancellationToken::new();
        let task = tokio::spawn(poll_plugin(reader, scope.clone(), 1, h.ctx.clone()));

        // Many read deadlines pass with no data
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.plugin_faults.try_recv().is_err());

        peer.send(Frame::new(PluginTag::CreateDirectConnect, Bytes::from("a:1")))
            .await
            .unwrap();
        let inbound = h.requests.recv().await.unwrap();
        assert_eq!(inbound.request.kind, RequestKind::CreateDirectConnect);

        scope.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_tunnel() {
        let mut h = harness();
        let (reader, mut peer) = pipe();
        let scope = CancellationToken::new();
        let task = tokio::spawn(poll_tunnel(reader, scope, 2, h.ctx.clone()));

        // Handshake comes first, before the peer sends anything
        let handshake = h.requests.recv().await.unwrap();
        assert_eq!(handshake.generation, 2);
        assert_eq!(handshake.request, Request::signal(RequestKind::TunnelConnectOk));
        assert!(h.ctx.last_receipt.get().is_none());

        peer.send(Frame::new(TunnelTag::Task, Bytes::from_static(&[2])))
            .await
            .unwrap();
        let expect = Request::new(RequestKind::TaskResult, Bytes::from_static(&[2]));
        assert_eq!(h.requests.recv().await.unwrap().request, expect);
        let first = h.ctx.last_receipt.get().expect("timestamp not updated");

        peer.send(Frame::empty(TunnelTag::Ping)).await.unwrap();
        assert_eq!(
            h.requests.recv().await.unwrap().request,
            Request::signal(RequestKind::Ping)
        );
        assert!(h.ctx.last_receipt.get().unwrap() >= first);

        peer.send(Frame::new(0xFFu8, Bytes::from_static(&[2])))
            .await
            .unwrap();
        let fault = h.tunnel_faults.recv().await.unwrap();
        assert_eq!(fault.role, Role::Tunnel);
        assert_eq!(fault.generation, 2);
        task.await.unwrap();
        assert!(h.requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_poll_tunnel_cancelled() {
        let mut h = harness();
        let (reader, _peer) = pipe();
        let scope = CancellationToken::new();
        let task = tokio::spawn(poll_tunnel(reader, scope.clone(), 1, h.ctx.clone()));

        assert_eq!(
            h.requests.recv().await.unwrap().request.kind,
            RequestKind::TunnelConnectOk
        );
        scope.cancel();
        task.await.unwrap();
        assert!(h.tunnel_faults.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_unblocks_full_request_channel() {
        let mut h = harness();
        let (requests_tx, _requests) = mpsc::channel(1);
        h.ctx.requests = requests_tx;
        let (reader, mut peer) = pipe();
        let scope = CancellationToken::new();
        let task = tokio::spawn(poll_plugin(reader, scope.clone(), 1, h.ctx.clone()));

        for _ in 0..3 {
            peer.send(Frame::new(PluginTag::PushTask, Bytes::from_static(&[1])))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        scope.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(h.plugin_faults.try_recv().is_err());
    }
}
