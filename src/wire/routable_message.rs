use bytes::{BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::labels::{NodeId, SeqNum, StreamId};
use crate::status::{Status, StatusResult};

/// the flags varint packs `destination_count << 4 | is_control | is_local << 1`
const FLAG_CONTROL: u64 = 0x01;
const FLAG_LOCAL: u64 = 0x02;
const FLAG_RESERVED: u64 = 0x0c;
const DESTINATION_COUNT_SHIFT: u64 = 4;

pub const MAX_DESTINATION_COUNT: usize = 128;

/// One delivery target of a routable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub dst: NodeId,
    pub stream_id: StreamId,
    /// stream-level sequence number; present iff the message is not a control message
    pub seq: Option<SeqNum>,
}

/// The routing header plus payload that travels between nodes.
///
/// A message is exclusively owned by whichever component currently holds it (router, link or
///  stream) and is moved between them, never aliased: payload bytes may be rewritten in place
///  while forwarding.
///
/// Wire form: `flags:varint, [src:NodeId if !local], {[dst:NodeId if !local] stream_id:varint
///  [seq:SeqNum if !control]}*, payload = remainder`. The "local" fast path applies when the
///  writer itself is the source and the link's peer is the sole destination - both node ids are
///  then omitted and reconstructed by the receiver from the link identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutableMessage {
    src: NodeId,
    is_control: bool,
    destinations: Vec<Destination>,
    pub payload: Bytes,
}

impl RoutableMessage {
    pub fn new_data(src: NodeId) -> RoutableMessage {
        RoutableMessage { src, is_control: false, destinations: Vec::new(), payload: Bytes::new() }
    }

    pub fn new_control(src: NodeId) -> RoutableMessage {
        RoutableMessage { src, is_control: true, destinations: Vec::new(), payload: Bytes::new() }
    }

    pub fn src(&self) -> NodeId {
        self.src
    }

    pub fn is_control(&self) -> bool {
        self.is_control
    }

    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    /// Narrows the message to a subset of its destinations (multicast grouping by next hop).
    pub fn with_destinations(&self, destinations: Vec<Destination>) -> RoutableMessage {
        assert!(!destinations.is_empty());
        RoutableMessage {
            src: self.src,
            is_control: self.is_control,
            destinations,
            payload: self.payload.clone(),
        }
    }

    /// Only valid for non-control messages; control destinations carry no sequence number.
    pub fn add_destination(&mut self, dst: NodeId, stream_id: StreamId, seq: SeqNum) {
        assert!(!self.is_control, "sequenced destinations are for data messages");
        self.destinations.push(Destination { dst, stream_id, seq: Some(seq) });
    }

    /// Only valid for control messages.
    pub fn add_control_destination(&mut self, dst: NodeId, stream_id: StreamId) {
        assert!(self.is_control, "unsequenced destinations are for control messages");
        self.destinations.push(Destination { dst, stream_id, seq: None });
    }

    fn is_local(&self, writer: NodeId, target: NodeId) -> bool {
        self.src == writer
            && self.destinations.len() == 1
            && self.destinations[0].dst == target
    }

    /// Serializes for transmission by `writer` over a link whose peer is `target`.
    pub fn ser(&self, writer: NodeId, target: NodeId, buf: &mut BytesMut) {
        assert!(!self.destinations.is_empty());
        assert!(self.destinations.len() <= MAX_DESTINATION_COUNT);

        let local = self.is_local(writer, target);
        let mut flags = (self.destinations.len() as u64) << DESTINATION_COUNT_SHIFT;
        if self.is_control {
            flags |= FLAG_CONTROL;
        }
        if local {
            flags |= FLAG_LOCAL;
        }
        buf.put_u64_varint(flags);

        if !local {
            self.src.ser(buf);
        }
        for destination in &self.destinations {
            if !local {
                destination.dst.ser(buf);
            }
            destination.stream_id.ser(buf);
            if !self.is_control {
                destination.seq
                    .expect("data destinations always carry a sequence number")
                    .ser(buf);
            }
        }
        buf.put_slice(&self.payload);
    }

    /// Parses a message received by `reader` over a link whose peer is `writer`. The payload is
    ///  whatever remains after the header.
    pub fn deser(mut data: Bytes, reader: NodeId, writer: NodeId) -> StatusResult<RoutableMessage> {
        let flags = data.try_get_u64_varint()
            .map_err(|_| Status::invalid_argument("truncated routing header"))?;
        if flags & FLAG_RESERVED != 0 {
            return Err(Status::invalid_argument("reserved routing flags set"));
        }
        let is_control = flags & FLAG_CONTROL != 0;
        let local = flags & FLAG_LOCAL != 0;
        let destination_count = (flags >> DESTINATION_COUNT_SHIFT) as usize;
        if destination_count == 0 || destination_count > MAX_DESTINATION_COUNT {
            return Err(Status::invalid_argument(format!("destination count {} out of range", destination_count)));
        }
        if local && destination_count != 1 {
            return Err(Status::invalid_argument("local messages have exactly one destination"));
        }

        let src = if local { writer } else { NodeId::deser(&mut data)? };

        let mut destinations = Vec::with_capacity(destination_count);
        for _ in 0..destination_count {
            let dst = if local { reader } else { NodeId::deser(&mut data)? };
            let stream_id = StreamId::deser(&mut data)?;
            let seq = if is_control { None } else { Some(SeqNum::deser(&mut data)?) };
            destinations.push(Destination { dst, stream_id, seq });
        }

        Ok(RoutableMessage { src, is_control, destinations, payload: data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn node(raw: u64) -> NodeId {
        NodeId::from_raw(raw)
    }

    #[test]
    fn test_local_fast_path_omits_node_ids() {
        let mut message = RoutableMessage::new_data(node(1));
        message.add_destination(node(2), StreamId::from_raw(7), SeqNum::new(3, 0));
        message.payload = Bytes::from_static(b"hi");

        let mut buf = BytesMut::new();
        message.ser(node(1), node(2), &mut buf);
        // flags (count 1, local), stream id, seq width+bits, payload - no node ids
        assert_eq!(buf.as_ref(), &[0x12, 7, 1, 3, b'h', b'i']);

        let parsed = RoutableMessage::deser(buf.freeze(), node(2), node(1)).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_non_local_carries_node_ids() {
        let mut message = RoutableMessage::new_data(node(1));
        message.add_destination(node(3), StreamId::from_raw(7), SeqNum::new(3, 0));
        message.payload = Bytes::from_static(b"x");

        let mut buf = BytesMut::new();
        // writing toward node 2, but the destination is node 3: not local
        message.ser(node(1), node(2), &mut buf);
        assert_eq!(buf.as_ref(), &[
            0x10,
            1, 0, 0, 0, 0, 0, 0, 0,
            3, 0, 0, 0, 0, 0, 0, 0,
            7, 1, 3,
            b'x',
        ]);

        let parsed = RoutableMessage::deser(buf.freeze(), node(2), node(1)).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_control_round_trip() {
        let mut message = RoutableMessage::new_control(node(5));
        message.add_control_destination(node(6), StreamId::from_raw(0));
        message.payload = Bytes::from_static(&[9, 9]);

        let mut buf = BytesMut::new();
        message.ser(node(5), node(6), &mut buf);
        assert_eq!(buf.as_ref(), &[0x13, 0, 9, 9]);

        let parsed = RoutableMessage::deser(buf.freeze(), node(6), node(5)).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_multicast_round_trip() {
        let mut message = RoutableMessage::new_data(node(1));
        message.add_destination(node(2), StreamId::from_raw(4), SeqNum::new(10, 0));
        message.add_destination(node(3), StreamId::from_raw(5), SeqNum::new(11, 0));
        message.payload = Bytes::from_static(b"multi");

        let mut buf = BytesMut::new();
        message.ser(node(1), node(2), &mut buf);
        let parsed = RoutableMessage::deser(buf.freeze(), node(2), node(1)).unwrap();
        assert_eq!(parsed, message);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::zero_destinations(vec![0x00])]
    #[case::reserved_flags(vec![0x14])]
    #[case::local_with_two_destinations(vec![0x22])]
    #[case::truncated_src(vec![0x10, 1, 2, 3])]
    #[case::too_many_destinations({
        let mut buf = BytesMut::new();
        buf.put_u64_varint(129 << DESTINATION_COUNT_SHIFT);
        buf.to_vec()
    })]
    fn test_corrupt_input_rejected(#[case] bytes: Vec<u8>) {
        assert!(RoutableMessage::deser(Bytes::from(bytes), node(1), node(2)).is_err());
    }

    #[test]
    #[should_panic]
    fn test_control_destination_on_data_message_panics() {
        RoutableMessage::new_data(node(1)).add_control_destination(node(2), StreamId::from_raw(0));
    }

    #[test]
    #[should_panic]
    fn test_sequenced_destination_on_control_message_panics() {
        RoutableMessage::new_control(node(1)).add_destination(node(2), StreamId::from_raw(0), SeqNum::new(1, 0));
    }
}
