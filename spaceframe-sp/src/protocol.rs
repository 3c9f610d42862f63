//! The pattern engines.
//!
//! One module per messaging pattern. Each engine implements
//! [`Protocol`](crate::proto::Protocol) and provides a `socket()`
//! constructor returning a ready-to-use [`Socket`](crate::socket::Socket).

pub mod bus;
pub mod pair;
pub mod publish;
pub mod pull;
pub mod push;
pub mod rep;
pub mod req;
pub mod respondent;
pub mod subscribe;
pub mod surveyor;

use spaceframe_core::Message;

/// Append a 32-bit ID, big-endian, to the message header.
pub(crate) fn append_id(msg: &mut Message, id: u32) {
    msg.header_mut().extend_from_slice(&id.to_be_bytes());
}

/// The 32-bit ID at the front of `bytes`, if there is room for one.
pub(crate) fn leading_id(bytes: &[u8]) -> Option<u32> {
    Some(u32::from_be_bytes(bytes.get(..4)?.try_into().ok()?))
}
