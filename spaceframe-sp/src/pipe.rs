//! Framed SP connections over byte streams.
//!
//! A pipe is one SP connection: the eight-byte handshake followed by
//! length-prefixed message frames, full-duplex and order-preserving per
//! direction. Transports hand the socket a [`RawPipe`] — independently owned
//! send and receive halves plus an out-of-band closer — so the send worker
//! and receive worker never contend for the stream.
//!
//! Two framings share the handshake. Plain framing is a big-endian `u64`
//! length followed by `header‖body`. The IPC framing prefixes each frame
//! with a `0x01` type byte for compatibility with the C implementation's
//! control-byte scheme.

use async_trait::async_trait;
use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use spaceframe_core::options::{OptionValue, PROP_LOCAL_ADDR, PROP_REMOTE_ADDR};
use spaceframe_core::{Error, Message, Result};
use tracing::trace;

use crate::wire::{check_handshake, encode_handshake, HANDSHAKE_SIZE};

/// Per-message framing variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// `[len u64 BE][header‖body]`
    Plain,
    /// `[0x01][len u64 BE][header‖body]`
    Ipc,
}

/// Settings a transport needs to finish constructing a pipe.
#[derive(Debug, Clone, Copy)]
pub struct PipeConfig {
    /// Protocol number we advertise in the handshake.
    pub local_proto: u16,
    /// Protocol number the peer must advertise.
    pub peer_proto: u16,
    /// Largest inbound frame accepted; zero means unbounded.
    pub max_recv_size: usize,
}

/// Sending half of a pipe.
#[async_trait(?Send)]
pub trait PipeTx {
    /// Write one message. Expired messages are dropped and reported as
    /// success; expiry is only ever observed here on the send path.
    async fn send_msg(&mut self, msg: Message) -> Result<()>;
}

/// Receiving half of a pipe.
#[async_trait(?Send)]
pub trait PipeRx {
    /// Read one complete message, blocking until a frame arrives or the
    /// stream dies.
    async fn recv_msg(&mut self) -> Result<Message>;
}

/// Out-of-band close for a pipe: forces both directions down so workers
/// blocked in I/O observe the closure.
pub trait PipeCloser {
    fn close(&self);
}

/// Read-only, transport-supplied facts about one connection.
#[derive(Debug, Clone)]
pub struct PipeProps {
    pub local_addr: String,
    pub remote_addr: String,
}

impl PipeProps {
    pub fn get(&self, name: &str) -> Result<OptionValue> {
        match name {
            PROP_LOCAL_ADDR => Ok(OptionValue::Str(self.local_addr.clone())),
            PROP_REMOTE_ADDR => Ok(OptionValue::Str(self.remote_addr.clone())),
            _ => Err(Error::BadProperty),
        }
    }
}

/// A fully constructed connection, ready for the socket to adopt.
pub struct RawPipe {
    pub tx: Box<dyn PipeTx>,
    pub rx: Box<dyn PipeRx>,
    pub closer: Box<dyn PipeCloser>,
    pub props: PipeProps,
}

/// Exchange connection headers on a fresh stream. Ours goes out first, then
/// the peer's is read and validated. The caller must discard the stream on
/// error; no traffic may follow a failed exchange.
pub async fn handshake<S>(stream: &mut S, config: &PipeConfig) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let BufResult(res, _) = stream
        .write_all(encode_handshake(config.local_proto).to_vec())
        .await;
    res?;

    let hdr = [0u8; HANDSHAKE_SIZE];
    let BufResult(res, hdr) = stream.read_exact(hdr).await;
    res?;

    check_handshake(&hdr, config.peer_proto)?;
    trace!(
        local = config.local_proto,
        peer = config.peer_proto,
        "connection headers exchanged"
    );
    Ok(())
}

/// Stream-backed sending half, shared by the TCP and IPC transports.
pub struct StreamTx<W> {
    stream: W,
    format: WireFormat,
}

impl<W> StreamTx<W> {
    pub fn new(stream: W, format: WireFormat) -> Self {
        Self { stream, format }
    }
}

#[async_trait(?Send)]
impl<W> PipeTx for StreamTx<W>
where
    W: AsyncWrite + Unpin,
{
    async fn send_msg(&mut self, msg: Message) -> Result<()> {
        if msg.expired() {
            return Ok(());
        }

        let BufResult(res, _) = self.stream.write_all(encode_frame(&msg, self.format)).await;
        res?;
        Ok(())
    }
}

/// Serialize one message under the given framing: optional type byte,
/// length, header bytes, body bytes.
fn encode_frame(msg: &Message, format: WireFormat) -> Vec<u8> {
    let len = msg.wire_len() as u64;
    let mut frame = Vec::with_capacity(1 + 8 + msg.wire_len());
    if format == WireFormat::Ipc {
        frame.push(0x01);
    }
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(msg.header());
    frame.extend_from_slice(msg.body());
    frame
}

/// Stream-backed receiving half, shared by the TCP and IPC transports.
pub struct StreamRx<R> {
    stream: R,
    format: WireFormat,
    max_recv: u64,
}

impl<R> StreamRx<R> {
    pub fn new(stream: R, format: WireFormat, max_recv: usize) -> Self {
        Self {
            stream,
            format,
            max_recv: max_recv as u64,
        }
    }
}

#[async_trait(?Send)]
impl<R> PipeRx for StreamRx<R>
where
    R: AsyncRead + Unpin,
{
    async fn recv_msg(&mut self) -> Result<Message> {
        if self.format == WireFormat::Ipc {
            let tag = [0u8; 1];
            let BufResult(res, _tag) = self.stream.read_exact(tag).await;
            res?;
        }

        let lenbuf = [0u8; 8];
        let BufResult(res, lenbuf) = self.stream.read_exact(lenbuf).await;
        res?;
        let len = u64::from_be_bytes(lenbuf);

        // A length with the top bit set cannot be a real frame; treat it the
        // same as one over the configured limit.
        if len > i64::MAX as u64 || (self.max_recv > 0 && len > self.max_recv) {
            return Err(Error::TooLong);
        }

        let len = len as usize;
        let mut msg = Message::with_capacity(len);
        if len > 0 {
            let body = vec![0u8; len];
            let BufResult(res, body) = self.stream.read_exact(body).await;
            res?;
            msg.body_mut().extend_from_slice(&body);
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_frame_layout() {
        let mut m = Message::from_body(b"body");
        m.header_mut().extend_from_slice(b"hd");

        let f = encode_frame(&m, WireFormat::Plain);
        assert_eq!(&f[..8], &6u64.to_be_bytes());
        assert_eq!(&f[8..], b"hdbody");
    }

    #[test]
    fn ipc_frame_carries_type_byte() {
        let m = Message::from_body(b"x");
        let f = encode_frame(&m, WireFormat::Ipc);
        assert_eq!(f[0], 0x01);
        assert_eq!(&f[1..9], &1u64.to_be_bytes());
        assert_eq!(&f[9..], b"x");
    }

    #[test]
    fn empty_message_frames() {
        let m = Message::with_capacity(0);
        let f = encode_frame(&m, WireFormat::Plain);
        assert_eq!(f, 0u64.to_be_bytes());
    }

    #[test]
    fn unknown_property_is_rejected() {
        let props = PipeProps {
            local_addr: "tcp://127.0.0.1:1".into(),
            remote_addr: "tcp://127.0.0.1:2".into(),
        };
        assert!(props.get(PROP_LOCAL_ADDR).is_ok());
        assert!(matches!(props.get("NOPE"), Err(Error::BadProperty)));
    }
}
