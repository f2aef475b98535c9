use std::fmt::{Display, Formatter};
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::status::{Status, StatusResult};

/// Opaque identifier of an overlay node. The total ordering is load-bearing: it breaks symmetry
///  during connection establishment (the numerically lower node initiates).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeId(u64);

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[[{}]]", self.0)
    }
}

impl NodeId {
    pub const SERIALIZED_LEN: usize = 8;

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.0);
    }

    pub fn deser(buf: &mut impl Buf) -> StatusResult<NodeId> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(Status::invalid_argument("truncated node id"));
        }
        Ok(NodeId(buf.get_u64_le()))
    }
}

/// Identifier of a message stream, scoped to a (source, destination) node pair.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct StreamId(u64);

impl Display for StreamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl StreamId {
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64_varint(self.0);
    }

    pub fn deser(buf: &mut impl Buf) -> StatusResult<StreamId> {
        buf.try_get_u64_varint()
            .map(StreamId)
            .map_err(|_| Status::invalid_argument("truncated stream id"))
    }
}

/// A per-link packet sequence number in compressed wire form.
///
/// Absolute sequence numbers are monotonically increasing `u64`s, never reused; on the wire only
///  the low bytes travel, and the receiver reconstructs the absolute value against a base it
///  already knows (its receive tip). The sender picks the width so that the encoded window is
///  more than twice the distance from the base, making reconstruction unambiguous.
///
/// Wire form: `num_bytes:u8 (1..=8), low bytes of the sequence number (LE)`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct SeqNum {
    bits: u64,
    num_bytes: u8,
}

impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bits, self.num_bytes)
    }
}

impl SeqNum {
    /// Builds the wire form of `seq` for a receiver whose known base is `base`.
    pub fn new(seq: u64, base: u64) -> SeqNum {
        assert!(seq >= base, "sequence numbers are assigned above the window base");
        let distance = seq - base;

        let mut num_bytes = 1u8;
        while num_bytes < 8 {
            let half_window = 1u64 << (8 * num_bytes - 1);
            if distance < half_window {
                break;
            }
            num_bytes += 1;
        }

        SeqNum { bits: seq, num_bytes }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.num_bytes);
        for i in 0..self.num_bytes {
            buf.put_u8((self.bits >> (8 * i)) as u8);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> StatusResult<SeqNum> {
        if buf.remaining() < 1 {
            return Err(Status::invalid_argument("truncated sequence number"));
        }
        let num_bytes = buf.get_u8();
        if num_bytes == 0 || num_bytes > 8 {
            return Err(Status::invalid_argument("invalid sequence number width"));
        }
        if buf.remaining() < num_bytes as usize {
            return Err(Status::invalid_argument("truncated sequence number"));
        }
        let mut bits = 0u64;
        for i in 0..num_bytes {
            bits |= (buf.get_u8() as u64) << (8 * i);
        }
        Ok(SeqNum { bits, num_bytes })
    }

    /// Recovers the absolute sequence number: of all values whose low bytes match the wire form,
    ///  the one closest to `base`.
    pub fn reconstruct(&self, base: u64) -> u64 {
        if self.num_bytes == 8 {
            return self.bits;
        }
        let window = 1u64 << (8 * self.num_bytes);
        let mask = window - 1;

        let candidate = (base & !mask) | (self.bits & mask);
        let mut best = candidate;
        let mut best_distance = candidate.abs_diff(base);

        if let Some(lower) = candidate.checked_sub(window) {
            if lower.abs_diff(base) < best_distance {
                best = lower;
                best_distance = lower.abs_diff(base);
            }
        }
        if let Some(upper) = candidate.checked_add(window) {
            if upper.abs_diff(base) < best_distance {
                best = upper;
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_node_id_round_trip() {
        let mut buf = BytesMut::new();
        NodeId::from_raw(0x0102030405060708).ser(&mut buf);
        assert_eq!(buf.as_ref(), &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(NodeId::deser(&mut buf.freeze()).unwrap(), NodeId::from_raw(0x0102030405060708));
    }

    #[test]
    fn test_node_id_truncated() {
        let mut buf: &[u8] = &[1, 2, 3];
        assert!(NodeId::deser(&mut buf).is_err());
    }

    #[rstest]
    #[case::zero(0, vec![0])]
    #[case::small(5, vec![5])]
    #[case::large(300, vec![172, 2])]
    fn test_stream_id_ser(#[case] raw: u64, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        StreamId::from_raw(raw).ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(StreamId::deser(&mut buf.freeze()).unwrap(), StreamId::from_raw(raw));
    }

    #[rstest]
    #[case::one_from_zero(1, 0, vec![1, 1])]
    #[case::at_half_window_boundary(127, 0, vec![1, 127])]
    #[case::needs_two_bytes(128, 0, vec![2, 128, 0])]
    #[case::small_delta_high_base(100_000, 99_999, vec![1, 160])]
    fn test_seq_num_width_selection(#[case] seq: u64, #[case] base: u64, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        SeqNum::new(seq, base).ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
    }

    #[rstest]
    #[case::exact(1, 0, 0)]
    #[case::ahead_of_base(260, 256, 250)]
    #[case::behind_base(250, 200, 260)]
    #[case::wide(1 << 40, 1 << 40, (1 << 40) - 3)]
    fn test_seq_num_reconstruct(#[case] seq: u64, #[case] sender_base: u64, #[case] receiver_base: u64) {
        let mut buf = BytesMut::new();
        SeqNum::new(seq, sender_base).ser(&mut buf);
        let parsed = SeqNum::deser(&mut buf.freeze()).unwrap();
        assert_eq!(parsed.reconstruct(receiver_base), seq);
    }
}
