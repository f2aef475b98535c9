//! Packet assembly for one peer-to-peer link.
//!
//! Outbound, arbitrary-size [RoutableMessage]s are greedily packed into MTU-bounded packet
//!  payloads as length-prefixed segments; a message that does not fit is split at a byte
//!  boundary and its remainder leads the next packet. Inbound, payloads coming out of the
//!  [PacketProtocol] are cut back into segments (stitching split ones together when the
//!  sequence numbers line up) and delivered upward.
//!
//! Wire form of a full packet: `op:u8 (0 = data), seq:SeqNum, <protocol body>`; the protocol
//!  body's payload is `continuation_length:varint, continuation_bytes,
//!  {segment_length:varint, segment_bytes}*`. The continuation bytes resume the segment split
//!  at the end of the previous packet (length zero when there is none); the explicit length
//!  lets a receiver that lost the opening packet skip them instead of misreading them as a
//!  fresh length prefix.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
#[cfg(test)] use mockall::automock;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::OvernetConfig;
use crate::labels::{NodeId, SeqNum};
use crate::packet_protocol::{AckCallback, PacketProtocol};
use crate::status::{recv_status, Status, StatusResult};
use crate::wire::routable_message::RoutableMessage;

pub const OP_DATA: u8 = 0;

/// slack for the routing header on top of a payload of the configured maximum message size
const MAX_SEGMENT_OVERHEAD: usize = 4 * 1024;

/// Where fully parsed inbound messages go (the router, in production).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, message: RoutableMessage) -> StatusResult<()>;
}

struct PendingMessage {
    bytes: Bytes,
    /// fires when the packet carrying the message's final byte is acked
    on_ack: Option<AckCallback>,
}

struct Continuation {
    expected_seq: u64,
    needed: usize,
    buffer: BytesMut,
}

struct LinkState {
    closed: bool,
    queue: VecDeque<PendingMessage>,
    /// remainder of a split message, takes priority over the queue
    stash: Option<PendingMessage>,
    continuation: Option<Continuation>,
}

impl LinkState {
    fn has_outbound_work(&self) -> bool {
        self.stash.is_some() || !self.queue.is_empty()
    }

    fn cancel_outbound(&mut self) {
        for mut pending in self.queue.drain(..) {
            if let Some(on_ack) = pending.on_ack.take() {
                let _ = on_ack.send(Err(Status::cancelled()));
            }
        }
        if let Some(mut stash) = self.stash.take() {
            if let Some(on_ack) = stash.on_ack.take() {
                let _ = on_ack.send(Err(Status::cancelled()));
            }
        }
    }
}

pub struct PacketLink {
    config: Arc<OvernetConfig>,
    local: NodeId,
    peer: NodeId,
    protocol: Arc<PacketProtocol>,
    sink: Arc<dyn MessageSink>,
    state: Arc<Mutex<LinkState>>,
    outbound_work: Arc<Notify>,
    worker: JoinHandle<()>,
}

impl PacketLink {
    pub fn new(
        config: Arc<OvernetConfig>,
        local: NodeId,
        peer: NodeId,
        protocol: Arc<PacketProtocol>,
        sink: Arc<dyn MessageSink>,
    ) -> PacketLink {
        let state = Arc::new(Mutex::new(LinkState {
            closed: false,
            queue: VecDeque::new(),
            stash: None,
            continuation: None,
        }));
        let outbound_work = Arc::new(Notify::new());

        let worker = tokio::spawn(Self::outbound_loop(
            config.clone(),
            protocol.clone(),
            state.clone(),
            outbound_work.clone(),
        ));

        PacketLink { config, local, peer, protocol, sink, state, outbound_work, worker }
    }

    pub fn peer(&self) -> NodeId {
        self.peer
    }

    pub async fn round_trip_time(&self) -> std::time::Duration {
        self.protocol.round_trip_time().await
    }

    /// Queues a message for transmission. The returned channel fires once the packet carrying
    ///  the message's final byte is acked (or the message is lost or the link closes).
    pub fn forward(&self, message: RoutableMessage) -> oneshot::Receiver<StatusResult<()>> {
        let (tx, rx) = oneshot::channel();

        let mut serialized = BytesMut::new();
        message.ser(self.local, self.peer, &mut serialized);

        let mut state = self.state.lock().unwrap();
        if state.closed {
            let _ = tx.send(Err(Status::cancelled()));
            return rx;
        }
        state.queue.push_back(PendingMessage {
            bytes: serialized.freeze(),
            on_ack: Some(tx),
        });
        self.outbound_work.notify_one();
        rx
    }

    /// Handles one raw inbound packet, op byte and all.
    pub async fn process(&self, mut packet: Bytes) -> StatusResult<()> {
        if packet.is_empty() {
            return Err(Status::invalid_argument("empty packet"));
        }
        let op = packet.get_u8();
        if op != OP_DATA {
            warn!("dropping packet with unexpected op {} from {}", op, self.peer);
            return Ok(());
        }
        let seq = SeqNum::deser(&mut packet)?;

        let Some((seq, payload)) = self.protocol.process(seq, packet).await? else {
            return Ok(());
        };

        let segments = {
            let mut state = self.state.lock().unwrap();
            cut_segments(&self.config, &mut state, seq, payload)?
        };
        for segment in segments {
            let message = RoutableMessage::deser(segment, self.local, self.peer)?;
            self.sink.deliver(message).await?;
        }
        Ok(())
    }

    /// Closes the link: queued and stashed messages are cancelled, the protocol underneath
    ///  shuts down. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            debug!("closing link to {}", self.peer);
            state.closed = true;
            state.cancel_outbound();
            state.continuation = None;
        }
        self.outbound_work.notify_waiters();
        self.protocol.close().await;
    }

    /// Issues one protocol send per needed packet, strictly one at a time: the next send is
    ///  requested only after the previous packet's payload was actually built, so the factory
    ///  always sees the freshest queue and a drained queue never produces empty packets.
    async fn outbound_loop(
        config: Arc<OvernetConfig>,
        protocol: Arc<PacketProtocol>,
        state: Arc<Mutex<LinkState>>,
        outbound_work: Arc<Notify>,
    ) {
        loop {
            // the lock scope must close before the await below, so the check result is
            //  carried out of it
            let notified = outbound_work.notified();
            let has_work = {
                let state = state.lock().unwrap();
                if state.closed {
                    return;
                }
                state.has_outbound_work()
            };
            if !has_work {
                notified.await;
                continue;
            }

            let carried: Arc<Mutex<Vec<AckCallback>>> = Arc::new(Mutex::new(Vec::new()));
            let (packet_tx, packet_rx) = oneshot::channel();
            let (built_tx, built_rx) = oneshot::channel();
            let factory = {
                let config = config.clone();
                let state = state.clone();
                let carried = carried.clone();
                Box::new(move |budget: usize| {
                    let mut state = state.lock().unwrap();
                    let mut carried = carried.lock().unwrap();
                    let payload = build_payload(&config, &mut state, &mut carried, budget);
                    let _ = built_tx.send(());
                    payload
                })
            };

            if protocol.send(factory, packet_tx).await.is_err() {
                state.lock().unwrap().cancel_outbound();
                return;
            }

            let carried = carried.clone();
            tokio::spawn(async move {
                let result = recv_status(packet_rx.await);
                for on_ack in carried.lock().unwrap().drain(..) {
                    let _ = on_ack.send(result.clone());
                }
            });

            // wait until the payload was built before deciding whether more packets are needed
            let _ = built_rx.await;
        }
    }
}

impl Drop for PacketLink {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

fn varint_len(value: u64) -> usize {
    let mut scratch = BytesMut::new();
    scratch.put_u64_varint(value);
    scratch.len()
}

/// Greedy packet assembly: stash first, then whole queued messages, then at most one split.
///  The payload always opens with the length of the carried continuation bytes, zero when the
///  previous packet ended on a segment boundary.
fn build_payload(
    config: &OvernetConfig,
    state: &mut LinkState,
    carried: &mut Vec<AckCallback>,
    budget: usize,
) -> Bytes {
    let mut out = BytesMut::with_capacity(budget);
    if budget == 0 {
        return out.freeze();
    }

    match state.stash.take() {
        Some(mut stash) => {
            let mut take = stash.bytes.len().min(budget);
            while varint_len(take as u64) + take > budget {
                take -= 1;
            }
            out.put_u64_varint(take as u64);
            if take == stash.bytes.len() {
                out.extend_from_slice(&stash.bytes);
                if let Some(on_ack) = stash.on_ack.take() {
                    carried.push(on_ack);
                }
            }
            else {
                let part = stash.bytes.split_to(take);
                out.extend_from_slice(&part);
                state.stash = Some(stash);
                return out.freeze();
            }
        }
        None => out.put_u64_varint(0),
    }

    while let Some(front) = state.queue.front() {
        let remaining = budget - out.len();
        let prefix = varint_len(front.bytes.len() as u64);
        if prefix + front.bytes.len() <= remaining {
            let mut pending = state.queue.pop_front()
                .expect("front() was Some");
            out.put_u64_varint(pending.bytes.len() as u64);
            out.extend_from_slice(&pending.bytes);
            if let Some(on_ack) = pending.on_ack.take() {
                carried.push(on_ack);
            }
            continue;
        }
        if remaining < config.min_mss {
            break;
        }
        // split: the length prefix declares the full message, the remainder leads the next
        //  packet
        let mut pending = state.queue.pop_front()
            .expect("front() was Some");
        out.put_u64_varint(pending.bytes.len() as u64);
        let part = pending.bytes.split_to(remaining - prefix);
        out.extend_from_slice(&part);
        state.stash = Some(pending);
        break;
    }
    out.freeze()
}

/// Cuts a packet payload into message segments. The payload's leading varint declares how many
///  bytes continue a segment split in the previous packet; they are stitched onto the stored
///  continuation when the sequence numbers line up and skipped when its opening packet was
///  lost.
fn cut_segments(
    config: &OvernetConfig,
    state: &mut LinkState,
    seq: u64,
    mut data: Bytes,
) -> StatusResult<Vec<Bytes>> {
    let mut segments = Vec::new();

    let cont_len = data.try_get_u64_varint()
        .map_err(|_| Status::invalid_argument("truncated continuation length"))? as usize;
    if cont_len > data.remaining() {
        return Err(Status::invalid_argument("continuation length exceeds the packet"));
    }

    match state.continuation.take() {
        Some(mut continuation) if continuation.expected_seq == seq && cont_len > 0 => {
            let missing = continuation.needed - continuation.buffer.len();
            if cont_len > missing {
                return Err(Status::invalid_argument(
                    "continuation is longer than the open segment"));
            }
            continuation.buffer.extend_from_slice(&data.split_to(cont_len));
            if continuation.buffer.len() == continuation.needed {
                segments.push(continuation.buffer.freeze());
            }
            else if data.has_remaining() {
                return Err(Status::invalid_argument(
                    "unfinished continuation followed by fresh segments"));
            }
            else {
                continuation.expected_seq = seq + 1;
                state.continuation = Some(continuation);
                return Ok(segments);
            }
        }
        Some(continuation) => {
            // a packet in between was lost or reordered, the partial message is gone
            warn!("dropping partially received message, expected continuation in packet {}, got {}",
                continuation.expected_seq, seq);
            data.advance(cont_len);
        }
        None => {
            if cont_len > 0 {
                // the packet that opened this split never arrived
                warn!("skipping {} orphaned continuation bytes in packet {}", cont_len, seq);
                data.advance(cont_len);
            }
        }
    }

    let segment_limit = config.max_message_size as usize + MAX_SEGMENT_OVERHEAD;
    while data.has_remaining() {
        let len = data.try_get_u64_varint()
            .map_err(|_| Status::invalid_argument("truncated segment length"))? as usize;
        if len == 0 {
            return Err(Status::invalid_argument("zero-length segment"));
        }
        if len > segment_limit {
            return Err(Status::invalid_argument(format!(
                "declared segment length {} exceeds the limit {}", len, segment_limit)));
        }
        if data.remaining() >= len {
            segments.push(data.split_to(len));
        }
        else {
            let mut buffer = BytesMut::with_capacity(len);
            let available = data.remaining();
            buffer.extend_from_slice(&data.split_to(available));
            state.continuation = Some(Continuation {
                expected_seq: seq + 1,
                needed: len,
                buffer,
            });
            break;
        }
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::congestion::WindowedController;
    use crate::labels::StreamId;
    use crate::packet_protocol::PacketSender;
    use crate::status::StatusCode;
    use crate::wire::ack_frame::AckFrame;

    struct RecordingSender {
        packets: Mutex<Vec<(SeqNum, Bytes)>>,
    }

    impl RecordingSender {
        fn new() -> Arc<RecordingSender> {
            Arc::new(RecordingSender { packets: Mutex::new(Vec::new()) })
        }

        /// packets framed the way the transport puts them on the wire
        fn framed(&self) -> Vec<Bytes> {
            self.packets.lock().unwrap().iter()
                .map(|(seq, body)| {
                    let mut packet = BytesMut::new();
                    packet.extend_from_slice(&[OP_DATA]);
                    seq.ser(&mut packet);
                    packet.extend_from_slice(body);
                    packet.freeze()
                })
                .collect()
        }

        fn bodies(&self) -> Vec<Bytes> {
            self.packets.lock().unwrap().iter().map(|(_, body)| body.clone()).collect()
        }
    }

    #[async_trait]
    impl PacketSender for RecordingSender {
        async fn send_packet(&self, seq: SeqNum, packet: Bytes) -> StatusResult<()> {
            self.packets.lock().unwrap().push((seq, packet));
            Ok(())
        }
    }

    struct CollectingSink {
        messages: Mutex<Vec<RoutableMessage>>,
    }

    impl CollectingSink {
        fn new() -> Arc<CollectingSink> {
            Arc::new(CollectingSink { messages: Mutex::new(Vec::new()) })
        }

        fn delivered(&self) -> Vec<RoutableMessage> {
            self.messages.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageSink for CollectingSink {
        async fn deliver(&self, message: RoutableMessage) -> StatusResult<()> {
            self.messages.lock().unwrap().push(message);
            Ok(())
        }
    }

    fn node(raw: u64) -> NodeId {
        NodeId::from_raw(raw)
    }

    fn link_with(
        config: OvernetConfig,
        local: NodeId,
        peer: NodeId,
        sender: Arc<RecordingSender>,
        sink: Arc<dyn MessageSink>,
    ) -> PacketLink {
        let config = Arc::new(config);
        let protocol = Arc::new(PacketProtocol::new(
            config.clone(),
            Arc::new(WindowedController::new()),
            sender,
        ));
        PacketLink::new(config, local, peer, protocol, sink)
    }

    fn data_message(src: u64, dst: u64, payload: &[u8]) -> RoutableMessage {
        let mut message = RoutableMessage::new_data(node(src));
        message.add_destination(node(dst), StreamId::from_raw(1), SeqNum::new(1, 0));
        message.payload = Bytes::copy_from_slice(payload);
        message
    }

    /// an ack-only peer packet acknowledging everything below `ack_to`
    fn ack_packet(seq: u64, ack_to: u64) -> Bytes {
        let mut ack = BytesMut::new();
        AckFrame::new(ack_to, 0).ser(&mut ack);
        let mut packet = BytesMut::from(&[OP_DATA][..]);
        SeqNum::new(seq, 1).ser(&mut packet);
        packet.put_u64_varint(ack.len() as u64);
        packet.extend_from_slice(&ack);
        packet.freeze()
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_produces_a_length_prefixed_segment() {
        let sender = RecordingSender::new();
        let sink = CollectingSink::new();
        let link = link_with(OvernetConfig::default(), node(1), node(2), sender.clone(), sink);

        link.forward(data_message(1, 2, b"hello"));
        tokio::time::sleep(Duration::from_millis(1)).await;

        let bodies = sender.bodies();
        assert_eq!(bodies.len(), 1);
        let mut body = bodies[0].clone();
        assert_eq!(body.try_get_u64_varint().unwrap(), 0); // no embedded ack
        assert_eq!(body.try_get_u64_varint().unwrap(), 0); // no leading continuation
        let segment_len = body.try_get_u64_varint().unwrap() as usize;
        assert_eq!(segment_len, body.remaining());

        let message = RoutableMessage::deser(body, node(2), node(1)).unwrap();
        assert_eq!(message.payload.as_ref(), b"hello");
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_messages_shares_one_packet() {
        let sender = RecordingSender::new();
        let sink = CollectingSink::new();
        let link = link_with(OvernetConfig::default(), node(1), node(2), sender.clone(), sink);

        let first = link.forward(data_message(1, 2, b"first"));
        let second = link.forward(data_message(1, 2, b"second"));
        tokio::time::sleep(Duration::from_millis(1)).await;

        let bodies = sender.bodies();
        assert_eq!(bodies.len(), 1);

        // the packet delivers both messages to the peer
        let peer_sink = CollectingSink::new();
        let peer = link_with(
            OvernetConfig::default(), node(2), node(1), RecordingSender::new(), peer_sink.clone());
        for packet in sender.framed() {
            peer.process(packet).await.unwrap();
        }
        let delivered = peer_sink.delivered();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].payload.as_ref(), b"first");
        assert_eq!(delivered[1].payload.as_ref(), b"second");

        // acking the one packet completes both messages
        link.process(ack_packet(1, 2)).await.unwrap();
        assert_eq!(recv_status(first.await), Ok(()));
        assert_eq!(recv_status(second.await), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_message_is_split_and_reassembled() {
        let mut config = OvernetConfig::default();
        config.mss = 120;
        let sender = RecordingSender::new();
        let link = link_with(config.clone(), node(1), node(2), sender.clone(), CollectingSink::new());

        let big = vec![0x5a; 200];
        link.forward(data_message(1, 2, &big));
        link.forward(data_message(1, 2, b"tail"));
        tokio::time::sleep(Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        let framed = sender.framed();
        assert!(framed.len() >= 2, "a 200 byte message cannot fit one 120 byte packet");

        let peer_sink = CollectingSink::new();
        let peer = link_with(config, node(2), node(1), RecordingSender::new(), peer_sink.clone());
        for packet in framed {
            peer.process(packet).await.unwrap();
        }

        let delivered = peer_sink.delivered();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].payload.as_ref(), big.as_slice());
        assert_eq!(delivered[1].payload.as_ref(), b"tail");
    }

    #[tokio::test(start_paused = true)]
    async fn test_split_message_completes_when_its_last_packet_is_acked() {
        let mut config = OvernetConfig::default();
        config.mss = 120;
        let sender = RecordingSender::new();
        let link = link_with(config, node(1), node(2), sender.clone(), CollectingSink::new());

        let big = vec![0x5a; 200];
        let mut rx = link.forward(data_message(1, 2, &big));
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let packets = sender.bodies().len() as u64;
        assert!(packets >= 2, "a 200 byte message cannot fit one 120 byte packet");

        // acking everything but the last packet does not complete the message
        link.process(ack_packet(1, packets)).await.unwrap();
        assert!(rx.try_recv().is_err());

        link.process(ack_packet(2, packets + 1)).await.unwrap();
        assert_eq!(recv_status(rx.await), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_op_byte_is_ignored() {
        let sender = RecordingSender::new();
        let sink = CollectingSink::new();
        let link = link_with(OvernetConfig::default(), node(1), node(2), sender, sink.clone());

        link.process(Bytes::from_static(&[9, 1, 2, 3])).await.unwrap();
        assert!(sink.delivered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_packet_is_invalid() {
        let sender = RecordingSender::new();
        let link = link_with(OvernetConfig::default(), node(1), node(2), sender, CollectingSink::new());
        let result = link.process(Bytes::new()).await;
        assert_eq!(result.unwrap_err().code, StatusCode::InvalidArgument);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_queued_messages() {
        let sender = RecordingSender::new();
        let link = link_with(OvernetConfig::default(), node(1), node(2), sender, CollectingSink::new());

        let queued = {
            let mut state = link.state.lock().unwrap();
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(PendingMessage {
                bytes: Bytes::from_static(b"stuck"),
                on_ack: Some(tx),
            });
            rx
        };
        link.close().await;
        assert_eq!(recv_status(queued.await), Err(Status::cancelled()));

        let refused = link.forward(data_message(1, 2, b"late"));
        assert_eq!(recv_status(refused.await), Err(Status::cancelled()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_declared_segment_length_is_refused() {
        let sender = RecordingSender::new();
        let sink = CollectingSink::new();
        let link = link_with(OvernetConfig::default(), node(1), node(2), sender, sink.clone());

        // a hostile peer declares an absurd segment length with one byte behind it
        let mut packet = BytesMut::from(&[OP_DATA][..]);
        SeqNum::new(1, 1).ser(&mut packet);
        packet.put_u64_varint(0); // no embedded ack
        packet.put_u64_varint(0); // no leading continuation
        packet.put_u64_varint(u64::MAX);
        packet.extend_from_slice(&[0x55]);

        let result = link.process(packet.freeze()).await;
        assert_eq!(result.unwrap_err().code, StatusCode::InvalidArgument);
        assert!(sink.delivered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_orphaned_continuation_bytes_are_skipped() {
        let mut config = OvernetConfig::default();
        config.mss = 120;
        let sender = RecordingSender::new();
        let link = link_with(config.clone(), node(1), node(2), sender.clone(), CollectingSink::new());

        let big = vec![0x5a; 200];
        link.forward(data_message(1, 2, &big));
        link.forward(data_message(1, 2, b"tail"));
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let framed = sender.framed();
        assert!(framed.len() >= 2, "a 200 byte message cannot fit one 120 byte packet");

        // the opening packet of the split never arrives; its continuations must not be
        //  misread as fresh length prefixes
        let peer_sink = CollectingSink::new();
        let peer = link_with(config, node(2), node(1), RecordingSender::new(), peer_sink.clone());
        for packet in framed.into_iter().skip(1) {
            peer.process(packet).await.unwrap();
        }

        let delivered = peer_sink.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].payload.as_ref(), b"tail");
    }
}
