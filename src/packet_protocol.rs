//! The reliable-delivery core of a single link.
//!
//! Every wire packet carries a sequence number, an optional embedded ack frame and an optional
//!  payload. This module owns both directions of that exchange: the send side assigns sequence
//!  numbers, paces packets through the congestion controller and tracks outstanding packets
//!  until their fate is known; the receive side deduplicates by sequence number, decides when
//!  and how urgently to ack, and applies the peer's ack frames to the outstanding deque.
//!
//! Payload semantics live above this layer. A lost packet is reported to its sender exactly
//!  once (cancelled), never retransmitted here; sequence numbers are never reused.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bit_set::BitSet;
use bytes::{Buf, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
#[cfg(test)] use mockall::automock;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::OvernetConfig;
use crate::congestion::{CongestionControl, SentPacket};
use crate::labels::SeqNum;
use crate::status::{Status, StatusResult};
use crate::wire::ack_frame::AckFrame;

pub type AckCallback = oneshot::Sender<StatusResult<()>>;

/// Builds a payload no larger than the given budget. Called once, at the moment the congestion
///  controller authorizes the send, so the payload reflects the freshest state.
pub type PayloadFactory = Box<dyn FnOnce(usize) -> Bytes + Send>;

/// The seam towards the framing layer below: hands over a fully assembled packet body plus the
///  wire form of its sequence number.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketSender: Send + Sync {
    async fn send_packet(&self, seq: SeqNum, packet: Bytes) -> StatusResult<()>;
}

struct QueuedPacket {
    factory: PayloadFactory,
    on_ack: AckCallback,
}

struct OutstandingPacket {
    /// receive-side watermark embedded in this packet; once the peer acks it, receive state
    ///  below this point can be forgotten
    watermark: u64,
    sent: Option<SentPacket>,
    on_ack: Option<AckCallback>,
}

struct Inner {
    closed: bool,

    // send side: outstanding[i] has absolute sequence number send_tip + i
    send_tip: u64,
    outstanding: VecDeque<OutstandingPacket>,
    queue: VecDeque<QueuedPacket>,

    // receive side: bit slots are relative to recv_tip
    recv_tip: u64,
    received: BitSet,
    frozen: BitSet,
    max_seen: u64,
    max_seen_at: Option<Instant>,
    last_acked_watermark: u64,
    unacked_receives: usize,
    ack_task: Option<JoinHandle<()>>,
}

pub struct PacketProtocol {
    config: Arc<OvernetConfig>,
    congestion: Arc<dyn CongestionControl>,
    sender: Arc<dyn PacketSender>,
    inner: Arc<Mutex<Inner>>,
    queued_work: Arc<Notify>,
    pump: JoinHandle<()>,
}

impl PacketProtocol {
    pub fn new(
        config: Arc<OvernetConfig>,
        congestion: Arc<dyn CongestionControl>,
        sender: Arc<dyn PacketSender>,
    ) -> PacketProtocol {
        let inner = Arc::new(Mutex::new(Inner {
            closed: false,
            send_tip: 1,
            outstanding: VecDeque::new(),
            queue: VecDeque::new(),
            recv_tip: 1,
            received: BitSet::with_capacity(config.lookahead_window),
            frozen: BitSet::with_capacity(config.lookahead_window),
            max_seen: 0,
            max_seen_at: None,
            last_acked_watermark: 1,
            unacked_receives: 0,
            ack_task: None,
        }));
        let queued_work = Arc::new(Notify::new());

        let pump = tokio::spawn(Self::pump_loop(
            config.clone(),
            congestion.clone(),
            sender.clone(),
            inner.clone(),
            queued_work.clone(),
        ));

        PacketProtocol { config, congestion, sender, inner, queued_work, pump }
    }

    /// Enqueues a payload for transmission. `on_ack` fires exactly once: `Ok` when the peer
    ///  acknowledged the packet, an error when the packet was lost, refused or the protocol
    ///  closed underneath it.
    pub async fn send(&self, factory: PayloadFactory, on_ack: AckCallback) -> StatusResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            let _ = on_ack.send(Err(Status::cancelled()));
            return Err(Status::failed_precondition("protocol is closed"));
        }
        inner.queue.push_back(QueuedPacket { factory, on_ack });
        self.queued_work.notify_one();
        Ok(())
    }

    /// Handles one received packet body. Returns the absolute sequence number and payload if
    ///  the packet carried one, `None` for duplicates and ack-only packets.
    pub async fn process(&self, seq: SeqNum, mut data: Bytes) -> StatusResult<Option<(u64, Bytes)>> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(Status::cancelled());
        }

        let seq = seq.reconstruct(inner.recv_tip);
        if seq < inner.recv_tip {
            trace!("dropping packet {} below the receive tip {}", seq, inner.recv_tip);
            return Ok(None);
        }
        if seq >= inner.recv_tip + self.config.lookahead_window as u64 {
            // the peer is far ahead of what we have acked; push an ack out to resync it
            if let Err(status) = self.send_ack_only(&mut inner).await {
                debug!("failed to send resync ack: {}", status);
            }
            return Err(Status::failed_precondition(format!(
                "packet {} is beyond the lookahead window at {}", seq, inner.recv_tip)));
        }

        let slot = (seq - inner.recv_tip) as usize;
        if inner.frozen.contains(slot) {
            trace!("dropping packet {}, slot already processed or given up on", seq);
            return Ok(None);
        }
        inner.received.insert(slot);
        inner.frozen.insert(slot);
        if seq > inner.max_seen {
            inner.max_seen = seq;
            inner.max_seen_at = Some(Instant::now());
        }

        let ack_len = data.try_get_u64_varint()
            .map_err(|_| Status::invalid_argument("truncated ack length"))? as usize;
        if data.remaining() < ack_len {
            return Err(Status::invalid_argument("ack length exceeds the packet"));
        }
        if ack_len > 0 {
            let mut ack_data = data.split_to(ack_len);
            let ack = AckFrame::deser(&mut ack_data)?;
            self.handle_ack(&mut inner, &ack).await?;
        }

        if data.is_empty() {
            // ack-only packets never trigger a responding ack, that would ping-pong forever
            return Ok(None);
        }

        inner.unacked_receives += 1;
        if inner.unacked_receives >= self.config.max_unacked_receives {
            if let Err(status) = self.send_ack_only(&mut inner).await {
                debug!("failed to send forced ack: {}", status);
            }
        }
        else {
            self.schedule_ack(&mut inner);
        }
        Ok(Some((seq, data)))
    }

    /// Round-trip estimate of the underlying congestion controller, for routing metrics.
    pub async fn round_trip_time(&self) -> Duration {
        self.congestion.rtt().await
    }

    /// Closes the protocol: all queued and outstanding completions fire with `Cancelled`, the
    ///  congestion controller shuts down. Idempotent.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return;
        }
        debug!("closing packet protocol, {} outstanding, {} queued",
            inner.outstanding.len(), inner.queue.len());
        inner.closed = true;
        if let Some(task) = inner.ack_task.take() {
            task.abort();
        }
        for queued in inner.queue.drain(..) {
            let _ = queued.on_ack.send(Err(Status::cancelled()));
        }
        for mut outstanding in inner.outstanding.drain(..) {
            if let Some(on_ack) = outstanding.on_ack.take() {
                let _ = on_ack.send(Err(Status::cancelled()));
            }
        }
        self.congestion.shutdown().await;
        self.queued_work.notify_waiters();
    }

    async fn pump_loop(
        config: Arc<OvernetConfig>,
        congestion: Arc<dyn CongestionControl>,
        sender: Arc<dyn PacketSender>,
        inner: Arc<Mutex<Inner>>,
        queued_work: Arc<Notify>,
    ) {
        loop {
            let notified = queued_work.notified();
            let queued = {
                let mut locked = inner.lock().await;
                if locked.closed {
                    return;
                }
                locked.queue.pop_front()
            };

            let Some(queued) = queued else {
                notified.await;
                continue;
            };

            if let Err(status) = congestion.request_transmit().await {
                // the controller is gone, later sends must fail fast instead of queueing
                let _ = queued.on_ack.send(Err(status.or_cancelled()));
                let mut locked = inner.lock().await;
                locked.closed = true;
                if let Some(task) = locked.ack_task.take() {
                    task.abort();
                }
                for queued in locked.queue.drain(..) {
                    let _ = queued.on_ack.send(Err(Status::cancelled()));
                }
                for mut outstanding in locked.outstanding.drain(..) {
                    if let Some(on_ack) = outstanding.on_ack.take() {
                        let _ = on_ack.send(Err(Status::cancelled()));
                    }
                }
                return;
            }

            let mut locked = inner.lock().await;
            if locked.closed {
                let _ = queued.on_ack.send(Err(Status::cancelled()));
                return;
            }
            Self::send_granted(&config, congestion.as_ref(), sender.as_ref(), &mut locked, queued).await;
        }
    }

    /// Assembles and transmits one packet under an already-obtained congestion grant.
    async fn send_granted(
        config: &OvernetConfig,
        congestion: &dyn CongestionControl,
        sender: &dyn PacketSender,
        inner: &mut Inner,
        queued: QueuedPacket,
    ) {
        let seq = inner.send_tip + inner.outstanding.len() as u64;
        let wire_seq = SeqNum::new(seq, inner.send_tip);

        let mut body = BytesMut::with_capacity(config.mss);
        match Self::build_ack(config, inner) {
            Some(ack) => {
                let mut ack_bytes = BytesMut::new();
                ack.ser(&mut ack_bytes);
                body.put_u64_varint(ack_bytes.len() as u64);
                body.extend_from_slice(&ack_bytes);
            }
            None => {
                body.put_u64_varint(0);
            }
        }

        // leave room for the framing layer's op byte and sequence number
        let budget = config.mss.saturating_sub(body.len() + 16);
        let payload = (queued.factory)(budget);
        assert!(payload.len() <= budget, "payload factory exceeded its budget");
        body.extend_from_slice(&payload);
        let body = body.freeze();

        inner.outstanding.push_back(OutstandingPacket {
            watermark: inner.last_acked_watermark,
            sent: Some(SentPacket { seq, size: body.len(), sent_at: Instant::now() }),
            on_ack: Some(queued.on_ack),
        });

        if let Err(status) = sender.send_packet(wire_seq, body).await {
            debug!("packet {} failed to send: {}", seq, status);
            let mut failed = inner.outstanding.pop_back()
                .expect("the entry was pushed right above");
            if let Some(on_ack) = failed.on_ack.take() {
                let _ = on_ack.send(Err(status));
            }
            if let Some(sent) = failed.sent.take() {
                congestion.on_ack(Duration::ZERO, vec![], vec![sent]).await;
            }
        }
    }

    /// Applies a peer's ack frame to the outstanding deque. Completions fire strictly in
    ///  sequence order; nacked entries fire `Cancelled` but are removed only by the cumulative
    ///  watermark like everything else.
    async fn handle_ack(&self, inner: &mut Inner, ack: &AckFrame) -> StatusResult<()> {
        let ack_to = ack.ack_to_seq();
        if ack_to < inner.send_tip {
            trace!("stale ack up to {}, send tip is already {}", ack_to, inner.send_tip);
            return Ok(());
        }
        let limit = inner.send_tip + inner.outstanding.len() as u64;
        if ack_to > limit {
            return Err(Status::invalid_argument(format!(
                "ack up to {} acknowledges packets that were never sent (limit {})", ack_to, limit)));
        }

        let mut nacked = Vec::new();
        for &seq in ack.nack_seqs() {
            if seq < inner.send_tip {
                continue;
            }
            let send_tip = inner.send_tip;
            let entry = &mut inner.outstanding[(seq - send_tip) as usize];
            if let Some(on_ack) = entry.on_ack.take() {
                let _ = on_ack.send(Err(Status::cancelled()));
            }
            if let Some(sent) = entry.sent.take() {
                nacked.push(sent);
            }
        }

        let mut acked = Vec::new();
        let mut confirmed_watermark = None;
        while inner.send_tip < ack_to {
            let mut entry = inner.outstanding.pop_front()
                .expect("ack_to is bounded by the deque length");
            inner.send_tip += 1;
            if let Some(on_ack) = entry.on_ack.take() {
                let _ = on_ack.send(Ok(()));
            }
            if let Some(sent) = entry.sent.take() {
                acked.push(sent);
            }
            confirmed_watermark = Some(entry.watermark);
        }

        // the peer has seen our acks up to the confirmed watermark, so receive-side state below
        //  it can be dropped
        if let Some(watermark) = confirmed_watermark {
            if watermark > inner.recv_tip {
                let shift = (watermark - inner.recv_tip) as usize;
                Self::shift_bits(&mut inner.received, shift);
                Self::shift_bits(&mut inner.frozen, shift);
                inner.recv_tip = watermark;
            }
        }

        if !acked.is_empty() || !nacked.is_empty() {
            self.congestion
                .on_ack(Duration::from_micros(ack.ack_delay_us()), acked, nacked)
                .await;
        }
        Ok(())
    }

    fn shift_bits(bits: &mut BitSet, by: usize) {
        let shifted = bits.iter()
            .filter(|&i| i >= by)
            .map(|i| i - by)
            .collect();
        *bits = shifted;
    }

    /// Builds the current outgoing ack frame, or `None` if there is nothing new to ack. Gaps
    ///  below the watermark become nacks and their slots freeze, a late arrival for them is a
    ///  duplicate from then on.
    fn build_ack(config: &OvernetConfig, inner: &mut Inner) -> Option<AckFrame> {
        let watermark = inner.max_seen + 1;
        if watermark <= inner.last_acked_watermark {
            return None;
        }
        let delay_us = inner.max_seen_at
            .map(|at| at.elapsed().as_micros() as u64)
            .unwrap_or(0);

        let window_slots = config.lookahead_window as u64 - (watermark - inner.recv_tip);
        let mut frame = AckFrame::new(watermark, delay_us)
            .with_window_grant(window_slots * config.mss as u64);

        for seq in (inner.recv_tip..inner.max_seen).rev() {
            let slot = (seq - inner.recv_tip) as usize;
            if !inner.received.contains(slot) {
                frame.add_nack(seq);
                inner.frozen.insert(slot);
            }
        }

        inner.last_acked_watermark = watermark;
        inner.unacked_receives = 0;
        if let Some(task) = inner.ack_task.take() {
            task.abort();
        }
        Some(frame)
    }

    /// Transmits an ack without payload. Ack-only packets consume a sequence number but are not
    ///  congestion-gated and are invisible to the controller.
    async fn send_ack_only(&self, inner: &mut Inner) -> StatusResult<()> {
        let Some(ack) = Self::build_ack(&self.config, inner) else {
            return Ok(());
        };
        let seq = inner.send_tip + inner.outstanding.len() as u64;
        let wire_seq = SeqNum::new(seq, inner.send_tip);

        let mut ack_bytes = BytesMut::new();
        ack.ser(&mut ack_bytes);
        let mut body = BytesMut::with_capacity(ack_bytes.len() + 2);
        body.put_u64_varint(ack_bytes.len() as u64);
        body.extend_from_slice(&ack_bytes);

        inner.outstanding.push_back(OutstandingPacket {
            watermark: inner.last_acked_watermark,
            sent: None,
            on_ack: None,
        });
        trace!("sending ack-only packet {} acking up to {}", seq, ack.ack_to_seq());
        self.sender.send_packet(wire_seq, body.freeze()).await
    }

    /// Starts the debounce timer unless one is already running. The timer coalesces the acks of
    ///  a receive burst into a single frame.
    fn schedule_ack(&self, inner: &mut Inner) {
        if inner.ack_task.is_some() {
            return;
        }
        let deadline = Instant::now() + self.config.ack_send_delay;
        let this_inner = self.inner.clone();
        let config = self.config.clone();
        let sender = self.sender.clone();
        inner.ack_task = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let mut inner = this_inner.lock().await;
            inner.ack_task = None;
            if inner.closed {
                return;
            }
            let Some(ack) = Self::build_ack(&config, &mut inner) else {
                return;
            };
            let seq = inner.send_tip + inner.outstanding.len() as u64;
            let wire_seq = SeqNum::new(seq, inner.send_tip);
            let mut ack_bytes = BytesMut::new();
            ack.ser(&mut ack_bytes);
            let mut body = BytesMut::new();
            body.put_u64_varint(ack_bytes.len() as u64);
            body.extend_from_slice(&ack_bytes);
            let watermark = inner.last_acked_watermark;
            inner.outstanding.push_back(OutstandingPacket {
                watermark,
                sent: None,
                on_ack: None,
            });
            if let Err(status) = sender.send_packet(wire_seq, body.freeze()).await {
                warn!("scheduled ack failed to send: {}", status);
            }
        }));
    }
}

impl Drop for PacketProtocol {
    fn drop(&mut self) {
        self.pump.abort();
        if let Ok(mut inner) = self.inner.try_lock() {
            if let Some(task) = inner.ack_task.take() {
                task.abort();
            }
        }
    }
}
