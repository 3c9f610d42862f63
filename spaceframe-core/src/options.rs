//! Socket, transport, and protocol option plumbing.
//!
//! Options are set and read through a single string-keyed surface, the way
//! the wire protocol's sibling implementations do it; the value side is the
//! typed [`OptionValue`] enum. Each layer (socket core, transport, engine)
//! recognizes its own names and answers [`Error::BadOption`] for the rest,
//! which is what lets the socket chain the lookups together.

use crate::error::{Error, Result};
use std::time::Duration;

/// Enable raw mode. Raw-mode engines leave headers entirely to the
/// application and keep no per-request state. Value is a bool; default
/// false.
pub const OPT_RAW: &str = "RAW";

/// Deadline for receive operations. Zero means wait forever. Value is a
/// duration; default zero.
pub const OPT_RECV_DEADLINE: &str = "RECV-DEADLINE";

/// Deadline for send operations. Zero means wait forever. Value is a
/// duration; default zero.
pub const OPT_SEND_DEADLINE: &str = "SEND-DEADLINE";

/// REQ only: how long to wait for a reply before resending the request to
/// an available peer. Zero disables the retry. Value is a duration; default
/// one minute.
pub const OPT_RETRY_TIME: &str = "RETRY-TIME";

/// SUB only: add a subscription prefix. Value is bytes or a string.
pub const OPT_SUBSCRIBE: &str = "SUBSCRIBE";

/// SUB only: remove a previously added prefix. Unknown prefixes are
/// `BadValue`. Value is bytes or a string.
pub const OPT_UNSUBSCRIBE: &str = "UNSUBSCRIBE";

/// SURVEYOR only: how long responses to the current survey are accepted.
/// Zero leaves the survey open. Value is a duration; default one second.
pub const OPT_SURVEY_TIME: &str = "SURVEY-TIME";

/// Depth of the socket send queue. Only settable while the socket has never
/// dialed or listened. Value is an int; default 128.
pub const OPT_WRITEQ_LEN: &str = "WRITEQ-LEN";

/// Depth of the socket receive queue. Only settable while the socket has
/// never dialed or listened. Value is an int; default 128.
pub const OPT_READQ_LEN: &str = "READQ-LEN";

/// TCP transport: enable keepalive probes. Value is a bool; default true.
pub const OPT_KEEPALIVE: &str = "KEEPALIVE";

/// TCP transport: disable Nagle's algorithm. Value is a bool; default true.
pub const OPT_NO_DELAY: &str = "NO-DELAY";

/// How long `close` waits for queued messages to drain. Value is a
/// duration; default one second.
pub const OPT_LINGER: &str = "LINGER";

/// Maximum hop count for routed requests; messages that have traversed more
/// peers are dropped. Value is an int in 1..=255; default 8.
pub const OPT_TTL: &str = "TTL";

/// Largest inbound frame a pipe will accept, counting protocol headers.
/// Zero disables the limit. Value is an int; default 1 MiB.
pub const OPT_MAX_RECV_SIZE: &str = "MAX-RCV-SIZE";

/// Initial interval between connection attempts. Value is a duration;
/// default 100 ms. Set before starting any dialer.
pub const OPT_RECONNECT_TIME: &str = "RECONNECT-TIME";

/// Ceiling for the reconnect interval. Zero disables exponential backoff;
/// otherwise the wait doubles per failed attempt up to this value. Value is
/// a duration; default zero.
pub const OPT_MAX_RECONNECT_TIME: &str = "MAX-RECONNECT-TIME";

/// Make sends non-blocking: when the send queue is full the message is
/// silently dropped instead. Value is a bool; default false.
pub const OPT_BEST_EFFORT: &str = "BEST-EFFORT";

/// Pipe property: the local address of the connection, in URL form.
pub const PROP_LOCAL_ADDR: &str = "LOCAL-ADDR";

/// Pipe property: the remote address of the connection, in URL form.
pub const PROP_REMOTE_ADDR: &str = "REMOTE-ADDR";

/// A typed option (or property) value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Duration(Duration),
    Bytes(Vec<u8>),
    Str(String),
}

impl OptionValue {
    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Self::Bool(b) => Ok(*b),
            _ => Err(Error::BadValue),
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        match self {
            Self::Int(i) => Ok(*i),
            _ => Err(Error::BadValue),
        }
    }

    pub fn as_duration(&self) -> Result<Duration> {
        match self {
            Self::Duration(d) => Ok(*d),
            _ => Err(Error::BadValue),
        }
    }

    /// Byte-typed options also accept strings, for subscription ergonomics.
    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Self::Bytes(b) => Ok(b),
            Self::Str(s) => Ok(s.as_bytes()),
            _ => Err(Error::BadValue),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<Duration> for OptionValue {
    fn from(v: Duration) -> Self {
        Self::Duration(v)
    }
}

impl From<&[u8]> for OptionValue {
    fn from(v: &[u8]) -> Self {
        Self::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for OptionValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}
