use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::status::{Status, StatusCode, StatusResult};

const TYPE_MASK: u8 = 0x0f;
const TYPE_CHUNK: u8 = 0;
const TYPE_MESSAGE_ABORT: u8 = 1;
const TYPE_STREAM_END: u8 = 2;
const FLAG_END_OF_MESSAGE: u8 = 0x80;
const RESERVED_MASK: u8 = 0x70;

/// A stream-level unit travelling inside a datagram stream's packets.
///
/// `Chunk` carries a byte range of one application message, `MessageAbort` cancels a single
///  in-flight message, `StreamEnd` declares the sender's last message id and terminates the
///  stream. All three are keyed by a 1-based message id; id 0 never appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentBody {
    Chunk {
        offset: u64,
        end_of_message: bool,
        data: Bytes,
    },
    MessageAbort(Status),
    StreamEnd(Status),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFragment {
    pub message: u64,
    pub body: FragmentBody,
}

impl MessageFragment {
    pub fn chunk(message: u64, offset: u64, end_of_message: bool, data: Bytes) -> MessageFragment {
        assert!(message != 0, "message ids are 1-based");
        MessageFragment { message, body: FragmentBody::Chunk { offset, end_of_message, data } }
    }

    pub fn message_abort(message: u64, status: Status) -> MessageFragment {
        assert!(message != 0, "message ids are 1-based");
        MessageFragment { message, body: FragmentBody::MessageAbort(status) }
    }

    pub fn stream_end(last_message: u64, status: Status) -> MessageFragment {
        assert!(last_message != 0, "message ids are 1-based");
        MessageFragment { message: last_message, body: FragmentBody::StreamEnd(status) }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        match &self.body {
            FragmentBody::Chunk { offset, end_of_message, data } => {
                let mut flags = TYPE_CHUNK;
                if *end_of_message {
                    flags |= FLAG_END_OF_MESSAGE;
                }
                buf.put_u8(flags);
                buf.put_u64_varint(self.message);
                buf.put_u64_varint(*offset);
                buf.put_slice(data);
            }
            FragmentBody::MessageAbort(status) => {
                buf.put_u8(TYPE_MESSAGE_ABORT);
                buf.put_u64_varint(self.message);
                Self::ser_status(status, buf);
            }
            FragmentBody::StreamEnd(status) => {
                buf.put_u8(TYPE_STREAM_END);
                buf.put_u64_varint(self.message);
                Self::ser_status(status, buf);
            }
        }
    }

    fn ser_status(status: &Status, buf: &mut BytesMut) {
        buf.put_u8(status.code as u8);
        buf.put_u64_varint(status.message.len() as u64);
        buf.put_slice(status.message.as_bytes());
    }

    /// Parses a fragment, consuming the buffer: a chunk's payload is whatever remains after the
    ///  offset varint.
    pub fn deser(mut data: Bytes) -> StatusResult<MessageFragment> {
        if data.is_empty() {
            return Err(Status::invalid_argument("empty fragment"));
        }
        let flags = data.get_u8();
        if flags & RESERVED_MASK != 0 {
            return Err(Status::invalid_argument("reserved fragment flags set"));
        }
        let fragment_type = flags & TYPE_MASK;
        if fragment_type != TYPE_CHUNK && flags & FLAG_END_OF_MESSAGE != 0 {
            return Err(Status::invalid_argument("end-of-message flag outside a chunk"));
        }
        let message = data.try_get_u64_varint()
            .map_err(|_| Status::invalid_argument("truncated message id"))?;
        if message == 0 {
            return Err(Status::invalid_argument("message id 0"));
        }

        let body = match fragment_type {
            TYPE_CHUNK => {
                let offset = data.try_get_u64_varint()
                    .map_err(|_| Status::invalid_argument("truncated chunk offset"))?;
                FragmentBody::Chunk {
                    offset,
                    end_of_message: flags & FLAG_END_OF_MESSAGE != 0,
                    data,
                }
            }
            TYPE_MESSAGE_ABORT => FragmentBody::MessageAbort(Self::deser_status(&mut data)?),
            TYPE_STREAM_END => FragmentBody::StreamEnd(Self::deser_status(&mut data)?),
            other => {
                return Err(Status::invalid_argument(format!("unknown fragment type {}", other)));
            }
        };
        Ok(MessageFragment { message, body })
    }

    fn deser_status(data: &mut Bytes) -> StatusResult<Status> {
        if data.is_empty() {
            return Err(Status::invalid_argument("truncated status"));
        }
        let code = StatusCode::try_from(data.get_u8())
            .map_err(|_| Status::invalid_argument("unknown status code"))?;
        let reason_len = data.try_get_u64_varint()
            .map_err(|_| Status::invalid_argument("truncated status reason"))? as usize;
        if data.remaining() < reason_len {
            return Err(Status::invalid_argument("truncated status reason"));
        }
        let reason = data.split_to(reason_len);
        let message = String::from_utf8(reason.to_vec())
            .map_err(|_| Status::invalid_argument("status reason is not utf-8"))?;
        Ok(Status::new(code, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::mid_chunk(
        MessageFragment::chunk(1, 10, false, Bytes::from_static(b"abc")),
        vec![0x00, 1, 10, b'a', b'b', b'c'])]
    #[case::final_chunk(
        MessageFragment::chunk(2, 0, true, Bytes::from_static(b"z")),
        vec![0x80, 2, 0, b'z'])]
    #[case::empty_final_chunk(
        MessageFragment::chunk(3, 5, true, Bytes::new()),
        vec![0x80, 3, 5])]
    #[case::abort(
        MessageFragment::message_abort(4, Status::new(StatusCode::Cancelled, "no")),
        vec![0x01, 4, 1, 2, b'n', b'o'])]
    #[case::stream_end_ok(
        MessageFragment::stream_end(7, Status::ok()),
        vec![0x02, 7, 0, 0])]
    fn test_round_trip(#[case] fragment: MessageFragment, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        fragment.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(MessageFragment::deser(buf.freeze()).unwrap(), fragment);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::reserved_flags(vec![0x10, 1, 0])]
    #[case::end_of_message_on_abort(vec![0x81, 1, 0, 0])]
    #[case::message_id_zero(vec![0x00, 0, 0])]
    #[case::unknown_type(vec![0x03, 1])]
    #[case::truncated_offset(vec![0x00, 1])]
    #[case::abort_without_status(vec![0x01, 1])]
    #[case::bad_status_code(vec![0x01, 1, 200, 0])]
    #[case::reason_longer_than_buffer(vec![0x02, 1, 0, 5, b'x'])]
    fn test_corrupt_input_rejected(#[case] bytes: Vec<u8>) {
        let result = MessageFragment::deser(Bytes::from(bytes));
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().code, StatusCode::InvalidArgument);
    }

    #[test]
    #[should_panic]
    fn test_message_id_zero_panics() {
        MessageFragment::chunk(0, 0, true, Bytes::new());
    }
}
