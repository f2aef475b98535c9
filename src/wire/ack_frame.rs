use bytes::{Buf, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::status::{Status, StatusResult};

/// Selective acknowledgment frame.
///
/// `ack_to_seq` is the cumulative watermark: every sequence number *below* it is acknowledged.
///  `nack_seqs` lists explicit losses within that acked range, strictly decreasing.
///
/// Wire form: `ack_to_seq:varint, ack_delay_us:varint, window_grant_bytes:varint,
///  {nack_offset:varint}*` where each nack is `base - offset` with `base` starting at
///  `ack_to_seq` and updated to each decoded nack in turn. Delta-encoding against the previous
///  element keeps offsets small and makes corruption detectable: a decode that fails to move
///  the running base strictly downward is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    ack_to_seq: u64,
    ack_delay_us: u64,
    window_grant_bytes: u64,
    nack_seqs: Vec<u64>,
}

impl AckFrame {
    pub fn new(ack_to_seq: u64, ack_delay_us: u64) -> AckFrame {
        assert!(ack_to_seq > 0, "ack_to_seq 0 would acknowledge nothing");
        AckFrame {
            ack_to_seq,
            ack_delay_us,
            window_grant_bytes: 0,
            nack_seqs: Vec::new(),
        }
    }

    pub fn with_window_grant(mut self, window_grant_bytes: u64) -> AckFrame {
        self.window_grant_bytes = window_grant_bytes;
        self
    }

    pub fn ack_to_seq(&self) -> u64 {
        self.ack_to_seq
    }

    pub fn ack_delay_us(&self) -> u64 {
        self.ack_delay_us
    }

    pub fn window_grant_bytes(&self) -> u64 {
        self.window_grant_bytes
    }

    pub fn nack_seqs(&self) -> &[u64] {
        &self.nack_seqs
    }

    /// Adds an explicit loss. Callers must add nacks in strictly decreasing order, all below
    ///  `ack_to_seq` - this is an API precondition, not lazily validated on the wire path.
    pub fn add_nack(&mut self, seq: u64) {
        assert!(seq < self.ack_to_seq, "nack {} is not inside the acked range (< {})", seq, self.ack_to_seq);
        if let Some(&last) = self.nack_seqs.last() {
            assert!(seq < last, "nacks must be added in strictly decreasing order ({} after {})", seq, last);
        }
        self.nack_seqs.push(seq);
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64_varint(self.ack_to_seq);
        buf.put_u64_varint(self.ack_delay_us);
        buf.put_u64_varint(self.window_grant_bytes);

        let mut base = self.ack_to_seq;
        for &nack in &self.nack_seqs {
            buf.put_u64_varint(base - nack);
            base = nack;
        }
    }

    /// Parses a frame, consuming the buffer to its end: everything after the three header
    ///  varints is nack offsets.
    pub fn deser(buf: &mut impl Buf) -> StatusResult<AckFrame> {
        let ack_to_seq = buf.try_get_u64_varint()
            .map_err(|_| Status::invalid_argument("truncated ack frame"))?;
        if ack_to_seq == 0 {
            return Err(Status::invalid_argument("ack_to_seq 0"));
        }
        let ack_delay_us = buf.try_get_u64_varint()
            .map_err(|_| Status::invalid_argument("truncated ack frame"))?;
        let window_grant_bytes = buf.try_get_u64_varint()
            .map_err(|_| Status::invalid_argument("truncated ack frame"))?;

        let mut nack_seqs = Vec::new();
        let mut base = ack_to_seq;
        while buf.has_remaining() {
            let offset = buf.try_get_u64_varint()
                .map_err(|_| Status::invalid_argument("truncated nack offset"))?;
            let seq = base.checked_sub(offset)
                .ok_or_else(|| Status::invalid_argument("nack offset underflows the running base"))?;
            if seq >= base {
                return Err(Status::invalid_argument("nack sequence fails to decrease"));
            }
            nack_seqs.push(seq);
            base = seq;
        }

        Ok(AckFrame { ack_to_seq, ack_delay_us, window_grant_bytes, nack_seqs })
    }
}
