//! SP wire-level constants: protocol numbers and the connection header.
//!
//! Every stream connection opens with an eight-byte header exchange:
//!
//! ```text
//! [0]    0x00
//! [1..3] "SP"
//! [3]    version (0)
//! [4..6] protocol number, big-endian
//! [6..8] reserved (0)
//! ```
//!
//! Each side sends its own protocol number and checks that the peer's is
//! exactly the one it expects; any mismatch tears the connection down before
//! application traffic can flow.

use spaceframe_core::{Error, Result};

pub const PROTO_PAIR: u16 = 1 * 16;
pub const PROTO_PUB: u16 = 2 * 16;
pub const PROTO_SUB: u16 = 2 * 16 + 1;
pub const PROTO_REQ: u16 = 3 * 16;
pub const PROTO_REP: u16 = 3 * 16 + 1;
pub const PROTO_PUSH: u16 = 5 * 16;
pub const PROTO_PULL: u16 = 5 * 16 + 1;
pub const PROTO_SURVEYOR: u16 = 6 * 16 + 2;
pub const PROTO_RESPONDENT: u16 = 6 * 16 + 3;
pub const PROTO_BUS: u16 = 7 * 16;

/// Experimental; the number is reserved but no engine ships for it.
pub const PROTO_STAR: u16 = 100 * 16;

/// The textual name for a protocol number, or "unknown".
#[must_use]
pub fn proto_name(number: u16) -> &'static str {
    match number {
        PROTO_PAIR => "pair",
        PROTO_PUB => "pub",
        PROTO_SUB => "sub",
        PROTO_REQ => "req",
        PROTO_REP => "rep",
        PROTO_PUSH => "push",
        PROTO_PULL => "pull",
        PROTO_SURVEYOR => "surveyor",
        PROTO_RESPONDENT => "respondent",
        PROTO_BUS => "bus",
        PROTO_STAR => "star",
        _ => "unknown",
    }
}

/// The connection header is always exactly eight bytes.
pub const HANDSHAKE_SIZE: usize = 8;

const SP_VERSION: u8 = 0;

/// Build the header advertising `proto` as our protocol number.
#[must_use]
pub fn encode_handshake(proto: u16) -> [u8; HANDSHAKE_SIZE] {
    let p = proto.to_be_bytes();
    [0, b'S', b'P', SP_VERSION, p[0], p[1], 0, 0]
}

/// Validate a received header against the protocol number we require of the
/// peer. Field checks run in fixed order: frame bytes, then version, then
/// protocol number.
pub fn check_handshake(buf: &[u8; HANDSHAKE_SIZE], want_peer: u16) -> Result<()> {
    if buf[0] != 0 || buf[1] != b'S' || buf[2] != b'P' || buf[6] != 0 || buf[7] != 0 {
        return Err(Error::BadHeader);
    }
    if buf[3] != SP_VERSION {
        return Err(Error::BadVersion);
    }
    if u16::from_be_bytes([buf[4], buf[5]]) != want_peer {
        return Err(Error::BadProto);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_layout() {
        let h = encode_handshake(PROTO_REQ);
        assert_eq!(h, [0x00, b'S', b'P', 0x00, 0x00, 0x30, 0x00, 0x00]);
    }

    #[test]
    fn accepts_expected_peer() {
        let h = encode_handshake(PROTO_REP);
        assert!(check_handshake(&h, PROTO_REP).is_ok());
    }

    #[test]
    fn rejects_in_field_order() {
        let mut h = encode_handshake(PROTO_PAIR);
        h[0] = 1;
        assert!(matches!(
            check_handshake(&h, PROTO_PAIR),
            Err(Error::BadHeader)
        ));

        let mut h = encode_handshake(PROTO_PAIR);
        h[3] = 9;
        assert!(matches!(
            check_handshake(&h, PROTO_PAIR),
            Err(Error::BadVersion)
        ));

        let h = encode_handshake(PROTO_PAIR);
        assert!(matches!(
            check_handshake(&h, PROTO_PUB),
            Err(Error::BadProto)
        ));

        // Reserved bytes are part of the frame check.
        let mut h = encode_handshake(PROTO_PAIR);
        h[7] = 1;
        assert!(matches!(
            check_handshake(&h, PROTO_PAIR),
            Err(Error::BadHeader)
        ));
    }

    #[test]
    fn names() {
        assert_eq!(proto_name(PROTO_SURVEYOR), "surveyor");
        assert_eq!(proto_name(0x9999), "unknown");
    }
}
