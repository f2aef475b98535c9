//! Message-level send and receive on top of routed fragments.
//!
//! A datagram stream binds one (peer, stream id) pair on the local router. Outgoing messages
//!  are numbered from 1 and travel as [MessageFragment] chunks; incoming chunks are reassembled
//!  per message, gated through the stream's [ReceiveMode] discipline, and handed out through
//!  [DatagramStream::receive] once complete.
//!
//! Closing is a small state machine: a local close tells the receive mode to stop, sends a
//!  `StreamEnd` fragment (retried while the transport reports `Unavailable`), and the stream is
//!  fully closed once both sides' end frames have been seen.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::config::OvernetConfig;
use crate::labels::{NodeId, SeqNum, StreamId};
use crate::receive_mode::{ParameterizedReceiveMode, ReceiveMode, ReliabilityAndOrdering};
use crate::router::{Router, StreamHandler};
use crate::status::{recv_status, Status, StatusCode, StatusResult};
use crate::wire::message_fragment::{FragmentBody, MessageFragment};
use crate::wire::routable_message::RoutableMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamPhase {
    Open,
    LocalCloseRequested,
    RemoteClosed,
    ClosingProtocol,
    Closed,
}

#[derive(Default)]
struct IncomingMessage {
    admitted: bool,
    delivered: bool,
    aborted: Option<Status>,
    chunks: BTreeMap<u64, Bytes>,
    total_len: Option<u64>,
}

struct RemoteEnd {
    message: u64,
    status: Status,
    admitted: bool,
}

struct StreamState {
    phase: StreamPhase,
    receive_mode: ParameterizedReceiveMode,
    incoming: FxHashMap<u64, IncomingMessage>,
    unclaimed: VecDeque<Bytes>,
    waiting: VecDeque<oneshot::Sender<StatusResult<Bytes>>>,
    next_send_message: u64,
    highest_send_message: u64,
    last_sent_seq: u64,
    remote_end: Option<RemoteEnd>,
    terminal_status: Option<Status>,
}

struct StreamCore {
    local: NodeId,
    peer: NodeId,
    stream_id: StreamId,
    reliability: ReliabilityAndOrdering,
    router: Arc<Router>,
    config: Arc<OvernetConfig>,
    state: Mutex<StreamState>,
}

/// adapter registered with the router; keeps the core reachable for spawned admission watchers
struct IncomingSink {
    core: Arc<StreamCore>,
}

#[async_trait]
impl StreamHandler for IncomingSink {
    async fn handle_message(&self, src: NodeId, _seq: Option<SeqNum>, payload: Bytes) -> StatusResult<()> {
        if src != self.core.peer {
            return Err(Status::internal(format!(
                "message from {} on a stream bound to {}", src, self.core.peer)));
        }
        StreamCore::handle_fragment(&self.core, payload)
    }
}

impl StreamCore {
    fn handle_fragment(core: &Arc<StreamCore>, payload: Bytes) -> StatusResult<()> {
        let fragment = MessageFragment::deser(payload)?;
        match fragment.body {
            FragmentBody::Chunk { offset, end_of_message, data } => {
                Self::handle_chunk(core, fragment.message, offset, end_of_message, data)?;
            }
            FragmentBody::MessageAbort(status) => Self::handle_abort(core, fragment.message, status),
            FragmentBody::StreamEnd(status) => Self::handle_stream_end(core, fragment.message, status),
        }
        Ok(())
    }

    fn handle_chunk(
        core: &Arc<StreamCore>,
        message: u64,
        offset: u64,
        end_of_message: bool,
        data: Bytes,
    ) -> StatusResult<()> {
        // wire-supplied ranges are validated before they reach the reassembly buffers
        let end = offset.checked_add(data.len() as u64)
            .ok_or_else(|| Status::invalid_argument("chunk range overflows"))?;
        if end > core.config.max_message_size {
            return Err(Status::invalid_argument(format!(
                "chunk of message {} ends at {}, beyond the message size limit {}",
                message, end, core.config.max_message_size)));
        }

        let mut watch = None;
        {
            let mut state = core.state.lock().unwrap();
            if state.phase == StreamPhase::Closed {
                trace!("dropping chunk for message {} on a closed stream", message);
                return Ok(());
            }
            let state = &mut *state;
            let entry = match state.incoming.contains_key(&message) {
                true => state.incoming.get_mut(&message).unwrap(),
                false => {
                    let (tx, rx) = oneshot::channel();
                    state.receive_mode.begin(message, tx);
                    watch = Some(rx);
                    state.incoming.entry(message).or_default()
                }
            };
            if entry.delivered || entry.aborted.is_some() {
                trace!("dropping chunk for finished message {}", message);
            }
            else {
                let data_len = data.len() as u64;
                entry.chunks.insert(offset, data);
                if end_of_message {
                    let total = offset + data_len;
                    match entry.total_len {
                        Some(known) if known != total => {
                            warn!("conflicting end-of-message lengths for message {}: {} vs {}",
                                message, known, total);
                        }
                        _ => entry.total_len = Some(total),
                    }
                }
                Self::try_deliver(state, message);
            }
        }
        if let Some(rx) = watch {
            Self::watch_admission(core, message, rx);
        }
        Ok(())
    }

    fn handle_abort(core: &Arc<StreamCore>, message: u64, status: Status) {
        let mut watch = None;
        {
            let mut state = core.state.lock().unwrap();
            let state = &mut *state;
            let entry = match state.incoming.contains_key(&message) {
                true => state.incoming.get_mut(&message).unwrap(),
                false => {
                    let (tx, rx) = oneshot::channel();
                    state.receive_mode.begin(message, tx);
                    watch = Some(rx);
                    state.incoming.entry(message).or_default()
                }
            };
            if entry.delivered {
                warn!("abort for already delivered message {} - ignoring", message);
            }
            else if entry.aborted.is_none() {
                debug!("message {} aborted by the peer: {}", message, status);
                entry.chunks.clear();
                entry.total_len = None;
                entry.aborted = Some(status.clone());
                if entry.admitted {
                    state.receive_mode.completed(message, status);
                }
            }
        }
        if let Some(rx) = watch {
            Self::watch_admission(core, message, rx);
        }
    }

    fn handle_stream_end(core: &Arc<StreamCore>, message: u64, status: Status) {
        let rx = {
            let mut state = core.state.lock().unwrap();
            if let Some(end) = &state.remote_end {
                if end.message != message || end.status != status {
                    warn!("conflicting stream end frames (message {} vs {}) - keeping the first",
                        end.message, message);
                }
                return;
            }
            state.remote_end = Some(RemoteEnd { message, status, admitted: false });
            let (tx, rx) = oneshot::channel();
            state.receive_mode.begin(message, tx);
            rx
        };
        Self::watch_admission(core, message, rx);
    }

    fn watch_admission(core: &Arc<StreamCore>, message: u64, rx: oneshot::Receiver<StatusResult<()>>) {
        let core = core.clone();
        tokio::spawn(async move {
            let result = recv_status(rx.await);
            core.admission_decided(message, result);
        });
    }

    fn admission_decided(&self, message: u64, result: StatusResult<()>) {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;

        if state.remote_end.as_ref().map(|end| end.message) == Some(message) {
            match result {
                Ok(()) => Self::apply_remote_end(state),
                Err(status) => trace!("stream end frame refused: {}", status),
            }
            return;
        }

        match result {
            Ok(()) => {
                let aborted = match state.incoming.get_mut(&message) {
                    Some(entry) => {
                        entry.admitted = true;
                        entry.aborted.clone()
                    }
                    None => return,
                };
                match aborted {
                    Some(status) => state.receive_mode.completed(message, status),
                    None => Self::try_deliver(state, message),
                }
            }
            Err(status) => {
                trace!("message {} refused by the receive mode: {}", message, status);
                state.incoming.remove(&message);
            }
        }
    }

    /// Hands the message out once it is admitted and its chunks cover `0..total_len` without
    ///  gaps. Overlapping retransmitted chunks are tolerated.
    fn try_deliver(state: &mut StreamState, message: u64) {
        let Some(entry) = state.incoming.get_mut(&message) else { return };
        if !entry.admitted || entry.delivered || entry.aborted.is_some() {
            return;
        }
        let Some(total) = entry.total_len else { return };

        let mut assembled = BytesMut::with_capacity(total as usize);
        let mut next = 0u64;
        for (offset, chunk) in &entry.chunks {
            if *offset > next {
                return;
            }
            let chunk_end = offset + chunk.len() as u64;
            if chunk_end > next {
                assembled.extend_from_slice(&chunk[(next - offset) as usize..]);
                next = chunk_end;
            }
        }
        if next != total {
            if next > total {
                warn!("chunks of message {} overrun the declared length {}", message, total);
            }
            return;
        }

        trace!("message {} complete ({} bytes)", message, total);
        entry.delivered = true;
        entry.chunks.clear();
        let bytes = assembled.freeze();
        match state.waiting.pop_front() {
            Some(tx) => {
                let _ = tx.send(Ok(bytes));
            }
            None => state.unclaimed.push_back(bytes),
        }
        state.receive_mode.completed(message, Status::ok());
    }

    fn apply_remote_end(state: &mut StreamState) {
        let end = state.remote_end.as_mut().expect("caller matched the end frame");
        if end.admitted {
            return;
        }
        end.admitted = true;
        let message = end.message;
        let status = end.status.clone();
        debug!("peer closed the stream after message {}: {}", message.saturating_sub(1), status);

        state.terminal_status.get_or_insert(status.clone());
        state.phase = match state.phase {
            StreamPhase::Open => StreamPhase::RemoteClosed,
            StreamPhase::ClosingProtocol => StreamPhase::Closed,
            other => other,
        };
        state.receive_mode.completed(message, Status::ok());

        let flush = status.or_cancelled();
        for tx in state.waiting.drain(..) {
            let _ = tx.send(Err(flush.clone()));
        }
    }

    async fn forward_fragment(&self, message_id: u64, fragment: &MessageFragment) -> StatusResult<()> {
        let routable = {
            let mut state = self.state.lock().unwrap();
            // retransmits of an older message keep the base below its id
            let seq = SeqNum::new(message_id, state.last_sent_seq.min(message_id));
            state.last_sent_seq = state.last_sent_seq.max(message_id);
            let mut routable = RoutableMessage::new_data(self.local);
            routable.add_destination(self.peer, self.stream_id, seq);
            let mut buf = BytesMut::new();
            fragment.ser(&mut buf);
            routable.payload = buf.freeze();
            routable
        };
        self.router.forward(routable).await
    }

    fn check_sendable(&self) -> StatusResult<()> {
        let state = self.state.lock().unwrap();
        match state.phase {
            StreamPhase::Open | StreamPhase::RemoteClosed => Ok(()),
            _ => Err(Status::failed_precondition("the stream is closed")),
        }
    }

    async fn close(&self, status: Status) -> StatusResult<()> {
        let end_message = {
            let mut state = self.state.lock().unwrap();
            match state.phase {
                StreamPhase::Open | StreamPhase::RemoteClosed => {}
                _ => return Ok(()),
            }
            debug!("closing stream {} to {}: {}", self.stream_id, self.peer, status);
            state.phase = StreamPhase::LocalCloseRequested;
            state.terminal_status.get_or_insert(status.clone());
            state.receive_mode.close(status.clone());
            let flush = status.or_cancelled();
            for tx in state.waiting.drain(..) {
                let _ = tx.send(Err(flush.clone()));
            }
            let id = state.next_send_message;
            state.next_send_message += 1;
            id
        };

        let fragment = MessageFragment::stream_end(end_message, status);
        loop {
            match self.forward_fragment(end_message, &fragment).await {
                Ok(()) => break,
                Err(error) if error.code == StatusCode::Unavailable => {
                    trace!("close frame unavailable, retrying");
                    tokio::time::sleep(self.config.send_retry_delay).await;
                }
                Err(error) => {
                    debug!("giving up on the close frame: {}", error);
                    break;
                }
            }
        }

        let mut state = self.state.lock().unwrap();
        state.phase = match state.remote_end.as_ref().map(|end| end.admitted) {
            Some(true) => StreamPhase::Closed,
            _ => StreamPhase::ClosingProtocol,
        };
        Ok(())
    }
}

/// One in-progress outgoing message with a declared total length. Chunks are pushed in offset
///  order; the retry policy on transient failure follows the stream's reliability mode.
pub struct SendOp {
    core: Arc<StreamCore>,
    message: u64,
    payload_length: u64,
    offset: u64,
}

impl SendOp {
    pub fn message(&self) -> u64 {
        self.message
    }

    pub async fn push(&mut self, data: Bytes, end_of_message: bool) -> StatusResult<()> {
        if self.offset + data.len() as u64 > self.payload_length {
            return Err(Status::invalid_argument(format!(
                "push of {} bytes at offset {} exceeds the declared length {}",
                data.len(), self.offset, self.payload_length)));
        }

        let fragment = MessageFragment::chunk(self.message, self.offset, end_of_message, data.clone());
        loop {
            self.core.check_sendable()?;
            match self.core.forward_fragment(self.message, &fragment).await {
                Ok(()) => {
                    self.offset += data.len() as u64;
                    return Ok(());
                }
                Err(status) if status.code == StatusCode::Unavailable && self.retries() => {
                    trace!("chunk of message {} unavailable, retrying", self.message);
                    tokio::time::sleep(self.core.config.send_retry_delay).await;
                }
                Err(status) => {
                    return match self.core.reliability {
                        ReliabilityAndOrdering::UnreliableOrdered
                        | ReliabilityAndOrdering::UnreliableUnordered => {
                            debug!("send failed on an unreliable stream, closing: {}", status);
                            let _ = self.core.close(status.clone()).await;
                            Err(status)
                        }
                        _ => Err(status),
                    };
                }
            }
        }
    }

    /// Aborts the message on the receiving side without closing the stream.
    pub async fn abort(self, status: Status) -> StatusResult<()> {
        let fragment = MessageFragment::message_abort(self.message, status);
        self.core.forward_fragment(self.message, &fragment).await
    }

    fn retries(&self) -> bool {
        match self.core.reliability {
            ReliabilityAndOrdering::ReliableOrdered | ReliabilityAndOrdering::ReliableUnordered => true,
            // only the newest outstanding message is worth retrying
            ReliabilityAndOrdering::TailReliable => {
                self.core.state.lock().unwrap().highest_send_message == self.message
            }
            ReliabilityAndOrdering::UnreliableOrdered
            | ReliabilityAndOrdering::UnreliableUnordered => false,
        }
    }
}

pub struct DatagramStream {
    core: Arc<StreamCore>,
}

impl DatagramStream {
    /// Binds a stream to `(peer, stream_id)` on the router. Fails if that pair already has a
    ///  registered handler.
    pub async fn create(
        router: Arc<Router>,
        peer: NodeId,
        stream_id: StreamId,
        reliability: ReliabilityAndOrdering,
        config: Arc<OvernetConfig>,
    ) -> StatusResult<DatagramStream> {
        let core = Arc::new(StreamCore {
            local: router.node_id(),
            peer,
            stream_id,
            reliability,
            router: router.clone(),
            config: config.clone(),
            state: Mutex::new(StreamState {
                phase: StreamPhase::Open,
                receive_mode: ParameterizedReceiveMode::new(reliability, config.lookahead_window),
                incoming: FxHashMap::default(),
                unclaimed: VecDeque::new(),
                waiting: VecDeque::new(),
                next_send_message: 1,
                highest_send_message: 0,
                last_sent_seq: 0,
                remote_end: None,
                terminal_status: None,
            }),
        });
        router.register_stream(peer, stream_id, Arc::new(IncomingSink { core: core.clone() })).await?;
        Ok(DatagramStream { core })
    }

    pub fn peer(&self) -> NodeId {
        self.core.peer
    }

    pub fn stream_id(&self) -> StreamId {
        self.core.stream_id
    }

    pub fn reliability(&self) -> ReliabilityAndOrdering {
        self.core.reliability
    }

    /// Starts an outgoing message of exactly `payload_length` bytes.
    pub fn send_op(&self, payload_length: u64) -> SendOp {
        let mut state = self.core.state.lock().unwrap();
        let message = state.next_send_message;
        state.next_send_message += 1;
        state.highest_send_message = message;
        SendOp { core: self.core.clone(), message, payload_length, offset: 0 }
    }

    /// Sends one complete message as a single chunk.
    pub async fn send(&self, payload: Bytes) -> StatusResult<()> {
        let mut op = self.send_op(payload.len() as u64);
        op.push(payload, true).await
    }

    /// Returns the next complete incoming message, in the order the stream's receive mode
    ///  releases them. Fails once the stream has been closed from either side.
    pub async fn receive(&self) -> StatusResult<Bytes> {
        let rx = {
            let mut state = self.core.state.lock().unwrap();
            if let Some(bytes) = state.unclaimed.pop_front() {
                return Ok(bytes);
            }
            if state.phase != StreamPhase::Open {
                let status = state.terminal_status.clone().unwrap_or_else(Status::cancelled);
                return Err(status.or_cancelled());
            }
            let (tx, rx) = oneshot::channel();
            state.waiting.push_back(tx);
            rx
        };
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Status::cancelled()),
        }
    }

    /// Ends the stream locally: stops the receive mode, flushes pending receives, and sends a
    ///  `StreamEnd` frame, retrying while the transport is unavailable.
    pub async fn close(&self, status: Status) -> StatusResult<()> {
        self.core.close(status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::LinkSender;
    use std::time::Duration;

    struct CapturingLink {
        sent: Mutex<Vec<RoutableMessage>>,
        fail_with: Mutex<VecDeque<Status>>,
    }

    impl CapturingLink {
        fn new() -> Arc<CapturingLink> {
            Arc::new(CapturingLink {
                sent: Mutex::new(Vec::new()),
                fail_with: Mutex::new(VecDeque::new()),
            })
        }

        fn fail_next(&self, status: Status) {
            self.fail_with.lock().unwrap().push_back(status);
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }

        fn fragment(&self, index: usize) -> MessageFragment {
            let payload = self.sent.lock().unwrap()[index].payload.clone();
            MessageFragment::deser(payload).unwrap()
        }
    }

    #[async_trait]
    impl LinkSender for CapturingLink {
        async fn forward(&self, message: RoutableMessage) -> StatusResult<()> {
            if let Some(status) = self.fail_with.lock().unwrap().pop_front() {
                return Err(status);
            }
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }

    fn node(raw: u64) -> NodeId {
        NodeId::from_raw(raw)
    }

    fn stream_id() -> StreamId {
        StreamId::from_raw(7)
    }

    async fn harness(reliability: ReliabilityAndOrdering) -> (Arc<Router>, Arc<CapturingLink>, DatagramStream) {
        let config = Arc::new(OvernetConfig::default());
        let router = Arc::new(Router::new(node(1), config.clone()));
        let link = CapturingLink::new();
        router.register_link(node(2), link.clone()).await.unwrap();
        let stream = DatagramStream::create(router.clone(), node(2), stream_id(), reliability, config)
            .await
            .unwrap();
        (router, link, stream)
    }

    async fn inject(router: &Router, fragment: MessageFragment) {
        let mut buf = BytesMut::new();
        fragment.ser(&mut buf);
        let mut message = RoutableMessage::new_data(node(2));
        message.add_destination(node(1), stream_id(), SeqNum::new(fragment.message, 0));
        message.payload = buf.freeze();
        router.forward(message).await.unwrap();
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test]
    async fn test_single_send_produces_one_terminal_chunk() {
        let (_router, link, stream) = harness(ReliabilityAndOrdering::UnreliableUnordered).await;

        stream.send(Bytes::from_static(b"abc")).await.unwrap();

        assert_eq!(link.sent_count(), 1);
        let fragment = link.fragment(0);
        assert_eq!(fragment, MessageFragment::chunk(1, 0, true, Bytes::from_static(b"abc")));
        let destinations = link.sent.lock().unwrap()[0].destinations().to_vec();
        assert_eq!(destinations[0].dst, node(2));
        assert!(destinations[0].seq.is_some());
    }

    #[tokio::test]
    async fn test_sends_are_numbered_sequentially() {
        let (_router, link, stream) = harness(ReliabilityAndOrdering::ReliableOrdered).await;

        stream.send(Bytes::from_static(b"one")).await.unwrap();
        stream.send(Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(link.fragment(0).message, 1);
        assert_eq!(link.fragment(1).message, 2);
    }

    #[tokio::test]
    async fn test_push_beyond_declared_length_is_refused() {
        let (_router, link, stream) = harness(ReliabilityAndOrdering::ReliableOrdered).await;

        let mut op = stream.send_op(3);
        let result = op.push(Bytes::from_static(b"toolong"), true).await;

        assert_eq!(result.unwrap_err().code, StatusCode::InvalidArgument);
        assert_eq!(link.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_multi_chunk_send_tracks_offsets() {
        let (_router, link, stream) = harness(ReliabilityAndOrdering::ReliableOrdered).await;

        let mut op = stream.send_op(6);
        op.push(Bytes::from_static(b"abc"), false).await.unwrap();
        op.push(Bytes::from_static(b"def"), true).await.unwrap();

        assert_eq!(link.fragment(0), MessageFragment::chunk(1, 0, false, Bytes::from_static(b"abc")));
        assert_eq!(link.fragment(1), MessageFragment::chunk(1, 3, true, Bytes::from_static(b"def")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reliable_send_retries_on_unavailable() {
        let (_router, link, stream) = harness(ReliabilityAndOrdering::ReliableOrdered).await;
        link.fail_next(Status::unavailable("glitch"));

        stream.send(Bytes::from_static(b"kept")).await.unwrap();

        assert_eq!(link.sent_count(), 1);
        assert_eq!(link.fragment(0).message, 1);
    }

    #[tokio::test]
    async fn test_unreliable_send_failure_closes_the_stream() {
        let (_router, link, stream) = harness(ReliabilityAndOrdering::UnreliableUnordered).await;
        link.fail_next(Status::internal("broken"));

        let result = stream.send(Bytes::from_static(b"lost")).await;
        assert_eq!(result.unwrap_err().code, StatusCode::Internal);

        // the failure triggered a local close with a stream end frame
        assert!(matches!(link.fragment(0).body, FragmentBody::StreamEnd(_)));
        let result = stream.send(Bytes::from_static(b"after")).await;
        assert_eq!(result.unwrap_err().code, StatusCode::FailedPrecondition);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tail_reliable_retries_only_the_newest_message() {
        let (_router, link, stream) = harness(ReliabilityAndOrdering::TailReliable).await;

        let mut superseded = stream.send_op(3);
        let mut newest = stream.send_op(3);

        link.fail_next(Status::unavailable("glitch"));
        let result = superseded.push(Bytes::from_static(b"old"), true).await;
        assert_eq!(result.unwrap_err().code, StatusCode::Unavailable);
        assert_eq!(link.sent_count(), 0);

        link.fail_next(Status::unavailable("glitch"));
        newest.push(Bytes::from_static(b"new"), true).await.unwrap();
        assert_eq!(link.sent_count(), 1);
        assert_eq!(link.fragment(0).message, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_delivers_assembled_message() {
        let (router, _link, stream) = harness(ReliabilityAndOrdering::ReliableOrdered).await;

        inject(&router, MessageFragment::chunk(1, 0, false, Bytes::from_static(b"hel"))).await;
        inject(&router, MessageFragment::chunk(1, 3, true, Bytes::from_static(b"lo"))).await;
        settle().await;

        assert_eq!(stream.receive().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_beyond_the_message_size_limit_is_refused() {
        let (router, _link, stream) = harness(ReliabilityAndOrdering::ReliableOrdered).await;

        // a hostile chunk declares an end far beyond anything a message may hold
        let mut buf = BytesMut::new();
        MessageFragment::chunk(1, 1 << 40, true, Bytes::from_static(b"x")).ser(&mut buf);
        let mut message = RoutableMessage::new_data(node(2));
        message.add_destination(node(1), stream_id(), SeqNum::new(1, 0));
        message.payload = buf.freeze();
        let result = router.forward(message).await;
        assert_eq!(result.unwrap_err().code, StatusCode::InvalidArgument);

        // the stream is unharmed, a well formed retry of the message still delivers
        inject(&router, MessageFragment::chunk(1, 0, true, Bytes::from_static(b"ok"))).await;
        settle().await;
        assert_eq!(stream.receive().await.unwrap(), Bytes::from_static(b"ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ordered_stream_releases_messages_in_order() {
        let (router, _link, stream) = harness(ReliabilityAndOrdering::ReliableOrdered).await;

        inject(&router, MessageFragment::chunk(2, 0, true, Bytes::from_static(b"second"))).await;
        settle().await;

        let waiting = {
            let stream = stream.core.clone();
            tokio::spawn(async move {
                let stream = DatagramStream { core: stream };
                stream.receive().await
            })
        };
        settle().await;

        inject(&router, MessageFragment::chunk(1, 0, true, Bytes::from_static(b"first"))).await;
        settle().await;

        assert_eq!(waiting.await.unwrap().unwrap(), Bytes::from_static(b"first"));
        assert_eq!(stream.receive().await.unwrap(), Bytes::from_static(b"second"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_abort_discards_partial_message() {
        let (router, _link, stream) = harness(ReliabilityAndOrdering::UnreliableOrdered).await;

        inject(&router, MessageFragment::chunk(1, 0, false, Bytes::from_static(b"par"))).await;
        settle().await;
        inject(&router, MessageFragment::message_abort(1, Status::unavailable("gone"))).await;
        inject(&router, MessageFragment::chunk(2, 0, true, Bytes::from_static(b"whole"))).await;
        settle().await;

        assert_eq!(stream.receive().await.unwrap(), Bytes::from_static(b"whole"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end_closes_the_remote_side() {
        let (router, _link, stream) = harness(ReliabilityAndOrdering::ReliableOrdered).await;

        inject(&router, MessageFragment::stream_end(1, Status::ok())).await;
        settle().await;

        let result = stream.receive().await;
        assert_eq!(result.unwrap_err().code, StatusCode::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_before_stream_end_are_still_delivered() {
        let (router, _link, stream) = harness(ReliabilityAndOrdering::ReliableOrdered).await;

        inject(&router, MessageFragment::chunk(1, 0, true, Bytes::from_static(b"last words"))).await;
        inject(&router, MessageFragment::stream_end(2, Status::ok())).await;
        settle().await;

        assert_eq!(stream.receive().await.unwrap(), Bytes::from_static(b"last words"));
        let result = stream.receive().await;
        assert_eq!(result.unwrap_err().code, StatusCode::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflicting_stream_end_keeps_the_first() {
        let (router, _link, stream) = harness(ReliabilityAndOrdering::ReliableOrdered).await;

        inject(&router, MessageFragment::stream_end(1, Status::internal("first"))).await;
        settle().await;
        inject(&router, MessageFragment::stream_end(5, Status::unknown("second"))).await;
        settle().await;

        let result = stream.receive().await;
        assert_eq!(result.unwrap_err().code, StatusCode::Internal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_sends_stream_end_and_retries() {
        let (_router, link, stream) = harness(ReliabilityAndOrdering::ReliableOrdered).await;
        link.fail_next(Status::unavailable("glitch"));

        stream.close(Status::ok()).await.unwrap();

        assert_eq!(link.sent_count(), 1);
        let fragment = link.fragment(0);
        assert_eq!(fragment.message, 1);
        assert!(matches!(fragment.body, FragmentBody::StreamEnd(ref status) if status.is_ok()));

        // closing again is a no-op
        stream.close(Status::ok()).await.unwrap();
        assert_eq!(link.sent_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_flushes_waiting_receives() {
        let (_router, _link, stream) = harness(ReliabilityAndOrdering::ReliableOrdered).await;

        let waiting = {
            let core = stream.core.clone();
            tokio::spawn(async move {
                let stream = DatagramStream { core };
                stream.receive().await
            })
        };
        settle().await;

        stream.close(Status::ok()).await.unwrap();
        let result = waiting.await.unwrap();
        assert_eq!(result.unwrap_err().code, StatusCode::Cancelled);
    }
}
