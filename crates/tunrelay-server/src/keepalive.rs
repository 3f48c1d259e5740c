//! Tunnel keepalive monitoring

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use tunrelay_proto::{Frame, Role, TunnelTag};

use crate::connection::{send_frame, ConnectionError, FrameWriter, LoopContext, RoleFault};

/// Time of the last frame received from the tunnel peer
///
/// Stored as an offset from a fixed origin; zero means nothing was received
/// yet. Updates only ever move it forward.
#[derive(Debug)]
pub struct LastReceipt {
    origin: Instant,
    offset_nanos: AtomicU64,
}

impl LastReceipt {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset_nanos: AtomicU64::new(0),
        }
    }

    /// Record a receipt now
    pub fn touch(&self) {
        let offset = self.origin.elapsed().as_nanos() as u64 + 1;
        self.offset_nanos.fetch_max(offset, Ordering::AcqRel);
    }

    pub fn get(&self) -> Option<Instant> {
        match self.offset_nanos.load(Ordering::Acquire) {
            0 => None,
            offset => Some(self.origin + Duration::from_nanos(offset - 1)),
        }
    }
}

impl Default for LastReceipt {
    fn default() -> Self {
        Self::new()
    }
}

/// Probe the tunnel every `probe_interval` and raise a keepalive fault once
/// nothing has been received for `probe_timeout`.
///
/// Silence is measured from the later of the monitor's own start and the last
/// receipt, so a receipt from an older connection never counts for this one.
pub(crate) async fn monitor_tunnel(
    writer: FrameWriter,
    scope: CancellationToken,
    generation: u64,
    ctx: LoopContext,
) {
    let interval = ctx.config.probe_interval;
    let window = ctx.config.probe_timeout;
    let started = Instant::now();

    let mut ticker = interval_at(started + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = scope.cancelled() => {
                debug!(generation, "Keepalive monitor cancelled");
                return;
            }
            _ = ticker.tick() => {}
        }

        let baseline = match ctx.last_receipt.get() {
            Some(at) if at > started => at,
            _ => started,
        };
        let silence = baseline.elapsed();

        if silence >= window {
            error!(generation, silence = ?silence, "Tunnel keepalive timed out");
            ctx.report(RoleFault {
                role: Role::Tunnel,
                generation,
                error: ConnectionError::KeepaliveTimeout(window),
            });
            return;
        }

        let probe = send_frame(
            &writer,
            Frame::empty(TunnelTag::Ping),
            ctx.config.write_timeout,
        );
        let result = tokio::select! {
            biased;
            _ = scope.cancelled() => return,
            result = probe => result,
        };

        match result {
            Ok(()) => debug!(generation, "Sent keepalive probe"),
            Err(e) => {
                warn!(generation, error = %e, "Keepalive probe failed");
                ctx.report(RoleFault {
                    role: Role::Tunnel,
                    generation,
                    error: e,
                });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use futures::StreamExt;
    use std::sync::Arc;
    use tokio::sync::{mpsc, Mutex};
    use tokio_util::codec::{FramedRead, FramedWrite};
    use tunrelay_proto::FrameCodec;

    fn context(
        interval: Duration,
        window: Duration,
    ) -> (LoopContext, mpsc::UnboundedReceiver<RoleFault>) {
        let config = RelayConfig::builder()
            .probe_interval(interval)
            .probe_timeout(window)
            .build()
            .unwrap();
        let (requests, _) = mpsc::channel(4);
        let (plugin_faults, _) = mpsc::unbounded_channel();
        let (tunnel_faults, faults) = mpsc::unbounded_channel();
        let ctx = LoopContext {
            requests,
            plugin_faults,
            tunnel_faults,
            last_receipt: Arc::new(LastReceipt::new()),
            config: Arc::new(config),
        };
        (ctx, faults)
    }

    fn writer(io: tokio::io::DuplexStream) -> FrameWriter {
        Arc::new(Mutex::new(FramedWrite::new(Box::new(io), FrameCodec::new())))
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_receipt_is_monotonic() {
        let receipt = LastReceipt::new();
        assert!(receipt.get().is_none());

        receipt.touch();
        let first = receipt.get().unwrap();

        tokio::time::advance(Duration::from_millis(5)).await;
        receipt.touch();
        let second = receipt.get().unwrap();

        assert!(second >= first);
        assert_eq!(second - first, Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probes_then_timeout() {
        const EXPECT_PROBES: u32 = 5;
        let interval = Duration::from_millis(1);
        let (ctx, mut faults) = context(interval, interval * (EXPECT_PROBES + 1));

        let (local, remote) = tokio::io::duplex(1024);
        let scope = CancellationToken::new();
        let monitor = tokio::spawn(monitor_tunnel(writer(local), scope, 7, ctx));

        let mut peer = FramedRead::new(remote, FrameCodec::new());
        for _ in 0..EXPECT_PROBES {
            let frame = peer.next().await.unwrap().unwrap();
            assert_eq!(frame, Frame::empty(TunnelTag::Ping));
        }

        let fault = faults.recv().await.unwrap();
        assert_eq!(fault.role, Role::Tunnel);
        assert_eq!(fault.generation, 7);
        assert!(matches!(fault.error, ConnectionError::KeepaliveTimeout(_)));
        monitor.await.unwrap();

        // No probe was sent after the timeout
        assert!(peer.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_keeps_tunnel_alive() {
        let interval = Duration::from_millis(10);
        let (ctx, mut faults) = context(interval, interval * 3);
        let receipt = ctx.last_receipt.clone();

        let (local, remote) = tokio::io::duplex(64 * 1024);
        let scope = CancellationToken::new();
        let monitor = tokio::spawn(monitor_tunnel(writer(local), scope.clone(), 1, ctx));

        // Receipts every interval for well past the window
        for _ in 0..10 {
            tokio::time::sleep(interval).await;
            receipt.touch();
        }
        assert!(faults.try_recv().is_err());

        scope.cancel();
        monitor.await.unwrap();
        assert!(faults.try_recv().is_err());
        drop(remote);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_silent() {
        let (ctx, mut faults) = context(Duration::from_secs(1), Duration::from_secs(3));
        let (local, _remote) = tokio::io::duplex(1024);
        let scope = CancellationToken::new();

        let monitor = tokio::spawn(monitor_tunnel(writer(local), scope.clone(), 1, ctx));
        scope.cancel();
        monitor.await.unwrap();

        assert!(faults.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_write_failure_is_a_fault() {
        let (ctx, mut faults) = context(Duration::from_millis(1), Duration::from_millis(10));
        let (local, remote) = tokio::io::duplex(1024);
        drop(remote);

        let monitor = tokio::spawn(monitor_tunnel(
            writer(local),
            CancellationToken::new(),
            3,
            ctx,
        ));

        let fault = faults.recv().await.unwrap();
        assert!(matches!(fault.error, ConnectionError::Write(_)));
        monitor.await.unwrap();
    }
}
