//! Wire encodings of the protocol's three frame families: selective acknowledgments
//!  ([ack_frame::AckFrame]), routing headers ([routable_message::RoutableMessage]) and
//!  stream-level fragments ([message_fragment::MessageFragment]).
//!
//! All variable-width integers use unsigned LEB128 varints; node ids travel as 8-byte LE.

pub mod ack_frame;
pub mod message_fragment;
pub mod routable_message;
