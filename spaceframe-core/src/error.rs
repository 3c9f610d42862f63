/// Spaceframe Error Types
///
/// The single error surface shared by sockets, transports, and protocol
/// engines.
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Main error type for spaceframe operations.
///
/// Values are cheap to clone; sockets latch them to disable an operation and
/// hand copies out to every caller that trips over the latch.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The socket, pipe, dialer, or listener was closed
    #[error("object closed")]
    Closed,

    /// Address scheme does not match any registered transport
    #[error("invalid or unsupported transport")]
    BadTran,

    /// Address could not be parsed for the selected transport
    #[error("invalid address")]
    BadAddr,

    /// Peer sent a malformed connection header
    #[error("invalid protocol header received")]
    BadHeader,

    /// Peer requested a protocol version we do not speak
    #[error("invalid protocol version received")]
    BadVersion,

    /// Peer is running an incompatible protocol
    #[error("incompatible peer protocol")]
    BadProto,

    /// Option name is not recognized in this context
    #[error("invalid or unsupported option")]
    BadOption,

    /// Option value has the wrong type or is out of range
    #[error("invalid option value")]
    BadValue,

    /// Property name is not present on this port
    #[error("invalid or unsupported property")]
    BadProperty,

    /// Local address is already in use
    #[error("address in use")]
    AddrInUse,

    /// Remote peer refused the connection
    #[error("connection refused")]
    ConnRefused,

    /// Inbound frame exceeds the configured receive limit
    #[error("message too long")]
    TooLong,

    /// Send deadline expired before the message could be queued
    #[error("timeout sending message")]
    SendTimeout,

    /// Receive deadline expired before a message arrived
    #[error("timeout receiving message")]
    RecvTimeout,

    /// Operation is never valid for this protocol (e.g. send on SUB)
    #[error("protocol does not support operation")]
    ProtoOp,

    /// Operation is not valid in the current protocol state
    #[error("incorrect protocol state")]
    ProtoState,

    /// A TLS transport was used without supplying a configuration
    #[error("missing TLS configuration")]
    TlsNoConfig,

    /// A TLS listener was started without a certificate
    #[error("missing TLS certificate")]
    TlsNoCert,

    /// Underlying stream I/O failure
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),
}

/// Result type alias for spaceframe operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::AddrInUse => Self::AddrInUse,
            io::ErrorKind::ConnectionRefused => Self::ConnRefused,
            _ => Self::Io(Arc::new(e)),
        }
    }
}

impl Error {
    /// True for errors that indicate a dead connection rather than a
    /// configuration or state problem. The dialer supervisor uses this to
    /// decide whether an attempt is worth retrying.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Closed | Self::ConnRefused | Self::Io(_) | Self::TooLong
        )
    }

    /// True for errors surfaced synchronously from a setter.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::BadOption | Self::BadValue | Self::BadTran | Self::BadAddr
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_kind_mapping() {
        let e: Error = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert!(matches!(e, Error::ConnRefused));

        let e: Error = io::Error::from(io::ErrorKind::AddrInUse).into();
        assert!(matches!(e, Error::AddrInUse));

        let e: Error = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert!(matches!(e, Error::Io(_)));
    }

    #[test]
    fn classification() {
        assert!(Error::ConnRefused.is_connection_error());
        assert!(!Error::BadOption.is_connection_error());
        assert!(Error::BadValue.is_config_error());
        assert!(!Error::Closed.is_config_error());
    }

    #[test]
    fn clones_are_cheap() {
        let e: Error = io::Error::other("boom").into();
        let c = e.clone();
        assert!(matches!(c, Error::Io(_)));
    }
}
