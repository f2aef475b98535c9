//! Congestion control seam between the reliable-delivery core and a pluggable bandwidth
//!  estimator.
//!
//! The protocol core asks for transmission grants and reports per-packet outcomes; the
//!  controller owns the pacing policy. [WindowedController] is the default implementation, an
//!  AIMD window over packet counts with an EWMA round-trip estimate.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::status::{Status, StatusResult};

/// Bookkeeping record for one transmitted packet, returned to the controller when the packet's
///  fate is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentPacket {
    pub seq: u64,
    pub size: usize,
    pub sent_at: Instant,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait CongestionControl: Send + Sync {
    /// Suspends until the controller authorizes exactly one packet transmission. Every grant
    ///  must be consumed by a send (an ack-only packet counts). Returns an error once the
    ///  controller has shut down.
    async fn request_transmit(&self) -> StatusResult<()>;

    /// One batch of delivery outcomes, as reported by a single incoming ack frame. `ack_delay`
    ///  is the peer's declared processing delay, to be subtracted from round-trip samples.
    async fn on_ack(&self, ack_delay: Duration, acked: Vec<SentPacket>, nacked: Vec<SentPacket>);

    /// Current round-trip estimate, fed into routing metrics.
    async fn rtt(&self) -> Duration;

    /// Fails all pending and future transmit requests.
    async fn shutdown(&self);
}

const INITIAL_WINDOW: u32 = 10;
const MIN_WINDOW: u32 = 2;
const INITIAL_RTT: Duration = Duration::from_millis(100);

struct WindowedControllerInner {
    cwnd: u32,
    cwnd_cnt: u32,
    in_flight: u32,
    srtt: Duration,
    has_rtt_sample: bool,
    closed: bool,
}

/// AIMD congestion window over packet counts: one additive increment per fully-used window's
///  worth of acks, halving on any nack. Deliberately coarse; a bandwidth-probing controller can
///  replace it behind [CongestionControl] without touching the protocol core.
pub struct WindowedController {
    inner: Mutex<WindowedControllerInner>,
    transmit_possible: Notify,
}

impl WindowedController {
    pub fn new() -> WindowedController {
        WindowedController {
            inner: Mutex::new(WindowedControllerInner {
                cwnd: INITIAL_WINDOW,
                cwnd_cnt: 0,
                in_flight: 0,
                srtt: INITIAL_RTT,
                has_rtt_sample: false,
                closed: false,
            }),
            transmit_possible: Notify::new(),
        }
    }

    #[cfg(test)]
    fn window(&self) -> u32 {
        self.inner.lock().unwrap().cwnd
    }
}

impl Default for WindowedController {
    fn default() -> Self {
        WindowedController::new()
    }
}

#[async_trait]
impl CongestionControl for WindowedController {
    async fn request_transmit(&self) -> StatusResult<()> {
        loop {
            // register before checking so a grant between check and await is not lost
            let notified = self.transmit_possible.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.closed {
                    return Err(Status::cancelled());
                }
                if inner.in_flight < inner.cwnd {
                    inner.in_flight += 1;
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    async fn on_ack(&self, ack_delay: Duration, acked: Vec<SentPacket>, nacked: Vec<SentPacket>) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }

        let outcomes = (acked.len() + nacked.len()) as u32;
        inner.in_flight = inner.in_flight.saturating_sub(outcomes);

        for packet in &acked {
            let sample = now.duration_since(packet.sent_at).saturating_sub(ack_delay);
            if inner.has_rtt_sample {
                // EWMA with alpha 1/8
                inner.srtt = (inner.srtt * 7 + sample) / 8;
            }
            else {
                inner.srtt = sample;
                inner.has_rtt_sample = true;
            }
        }

        if !nacked.is_empty() {
            inner.cwnd = (inner.cwnd / 2).max(MIN_WINDOW);
            inner.cwnd_cnt = 0;
            debug!("loss -> adjusting window down to {} packets", inner.cwnd);
        }
        else if !acked.is_empty() {
            inner.cwnd_cnt += acked.len() as u32;
            while inner.cwnd_cnt >= inner.cwnd {
                inner.cwnd_cnt -= inner.cwnd;
                inner.cwnd += 1;
            }
            trace!("ack batch of {} -> window {} packets", acked.len(), inner.cwnd);
        }

        if inner.in_flight < inner.cwnd {
            self.transmit_possible.notify_waiters();
        }
    }

    async fn rtt(&self) -> Duration {
        self.inner.lock().unwrap().srtt
    }

    async fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.transmit_possible.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::timeout;

    fn sent(seq: u64, sent_at: Instant) -> SentPacket {
        SentPacket { seq, size: 100, sent_at }
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_window_limits_grants() {
        let controller = WindowedController::new();
        for _ in 0..INITIAL_WINDOW {
            controller.request_transmit().await.unwrap();
        }
        let blocked = timeout(Duration::from_secs(1), controller.request_transmit()).await;
        assert!(blocked.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_frees_window_space() {
        let controller = Arc::new(WindowedController::new());
        let sent_at = Instant::now();
        for _ in 0..INITIAL_WINDOW {
            controller.request_transmit().await.unwrap();
        }

        let waiting = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.request_transmit().await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        controller.on_ack(Duration::ZERO, vec![sent(1, sent_at)], vec![]).await;
        timeout(Duration::from_secs(1), waiting).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_nack_halves_window() {
        let controller = WindowedController::new();
        controller.request_transmit().await.unwrap();
        controller.on_ack(Duration::ZERO, vec![], vec![sent(1, Instant::now())]).await;
        assert_eq!(controller.window(), INITIAL_WINDOW / 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_never_shrinks_below_minimum() {
        let controller = WindowedController::new();
        for seq in 0..10 {
            controller.request_transmit().await.unwrap();
            controller.on_ack(Duration::ZERO, vec![], vec![sent(seq, Instant::now())]).await;
        }
        assert_eq!(controller.window(), MIN_WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_window_of_acks_grows_window() {
        let controller = WindowedController::new();
        let sent_at = Instant::now();
        let mut acked = Vec::new();
        for seq in 0..INITIAL_WINDOW as u64 {
            controller.request_transmit().await.unwrap();
            acked.push(sent(seq, sent_at));
        }
        controller.on_ack(Duration::ZERO, acked, vec![]).await;
        assert_eq!(controller.window(), INITIAL_WINDOW + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rtt_sample_subtracts_ack_delay() {
        let controller = WindowedController::new();
        controller.request_transmit().await.unwrap();
        let sent_at = Instant::now();
        tokio::time::advance(Duration::from_millis(80)).await;

        controller.on_ack(Duration::from_millis(30), vec![sent(1, sent_at)], vec![]).await;
        assert_eq!(controller.rtt().await, Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_waiters() {
        let controller = Arc::new(WindowedController::new());
        for _ in 0..INITIAL_WINDOW {
            controller.request_transmit().await.unwrap();
        }
        let waiting = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.request_transmit().await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        controller.shutdown().await;
        let result = timeout(Duration::from_secs(1), waiting).await.unwrap().unwrap();
        assert_eq!(result, Err(Status::cancelled()));
    }
}
