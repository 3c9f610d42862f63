//! TCP transport.
//!
//! Addresses look like `tcp://host:port`; a leading `*` (or empty) host
//! means all interfaces. Streams are tuned per the `NO-DELAY` and
//! `KEEPALIVE` options, both on by default. The two pipe workers each hold
//! their own handle to the connection, and the closer shuts the descriptor
//! down in both directions so a blocked reader wakes immediately.

use async_trait::async_trait;
use compio::net::{TcpListener, TcpStream};
use std::cell::RefCell;
use std::net::SocketAddr;
use tracing::debug;

use spaceframe_core::options::{OPT_KEEPALIVE, OPT_NO_DELAY};
use spaceframe_core::{tcp, Error, OptionValue, Result};

use crate::pipe::{
    handshake, PipeCloser, PipeConfig, PipeProps, RawPipe, StreamRx, StreamTx, WireFormat,
};
use crate::transport::{strip_scheme, TranDialer, TranListener, Transport};

/// Parse the host:port part of a TCP address, mapping the nanomsg wildcard
/// host to all interfaces.
fn parse_addr(rest: &str) -> Result<SocketAddr> {
    let rest = rest.strip_prefix('*').unwrap_or(rest);
    let rest = if rest.starts_with(':') {
        format!("0.0.0.0{rest}")
    } else {
        rest.to_string()
    };
    rest.parse().map_err(|_| Error::BadAddr)
}

#[derive(Debug, Clone)]
struct TcpOpts {
    no_delay: bool,
    keepalive: bool,
}

impl Default for TcpOpts {
    fn default() -> Self {
        Self {
            no_delay: true,
            keepalive: true,
        }
    }
}

impl TcpOpts {
    fn set(&mut self, name: &str, value: &OptionValue) -> Result<()> {
        match name {
            OPT_NO_DELAY => {
                self.no_delay = value.as_bool()?;
                Ok(())
            }
            OPT_KEEPALIVE => {
                self.keepalive = value.as_bool()?;
                Ok(())
            }
            _ => Err(Error::BadOption),
        }
    }

    fn get(&self, name: &str) -> Result<OptionValue> {
        match name {
            OPT_NO_DELAY => Ok(OptionValue::Bool(self.no_delay)),
            OPT_KEEPALIVE => Ok(OptionValue::Bool(self.keepalive)),
            _ => Err(Error::BadOption),
        }
    }

    fn apply(&self, stream: &TcpStream) -> Result<()> {
        tcp::set_nodelay(stream, self.no_delay)?;
        tcp::set_keepalive(stream, self.keepalive)?;
        Ok(())
    }
}

struct TcpPipeCloser {
    stream: TcpStream,
}

impl PipeCloser for TcpPipeCloser {
    fn close(&self) {
        let _ = tcp::shutdown(&self.stream);
    }
}

/// Finish a freshly connected stream: tuning, handshake, split into halves.
async fn make_pipe(mut stream: TcpStream, opts: &TcpOpts, config: &PipeConfig) -> Result<RawPipe> {
    opts.apply(&stream)?;
    handshake(&mut stream, config).await?;

    let props = PipeProps {
        local_addr: stream
            .local_addr()
            .map(|a| format!("tcp://{a}"))
            .unwrap_or_default(),
        remote_addr: stream
            .peer_addr()
            .map(|a| format!("tcp://{a}"))
            .unwrap_or_default(),
    };

    let reader = stream.clone();
    let closer = stream.clone();
    Ok(RawPipe {
        tx: Box::new(StreamTx::new(stream, WireFormat::Plain)),
        rx: Box::new(StreamRx::new(
            reader,
            WireFormat::Plain,
            config.max_recv_size,
        )),
        closer: Box::new(TcpPipeCloser { stream: closer }),
        props,
    })
}

struct TcpDialer {
    addr: SocketAddr,
    opts: TcpOpts,
}

#[async_trait(?Send)]
impl TranDialer for TcpDialer {
    async fn dial(&self, config: &PipeConfig) -> Result<RawPipe> {
        let stream = TcpStream::connect(self.addr).await?;
        debug!(addr = %self.addr, "tcp connected");
        make_pipe(stream, &self.opts, config).await
    }

    fn set_option(&mut self, name: &str, value: OptionValue) -> Result<()> {
        self.opts.set(name, &value)
    }

    fn get_option(&self, name: &str) -> Result<OptionValue> {
        self.opts.get(name)
    }
}

struct TcpTranListener {
    addr: SocketAddr,
    bound: Option<TcpListener>,
    bound_addr: Option<SocketAddr>,
    opts: TcpOpts,
    close_tx: RefCell<Option<flume::Sender<()>>>,
    close_rx: flume::Receiver<()>,
}

#[async_trait(?Send)]
impl TranListener for TcpTranListener {
    async fn bind(&mut self, _config: &PipeConfig) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.bound_addr = listener.local_addr().ok();
        debug!(addr = ?self.bound_addr, "tcp listening");
        self.bound = Some(listener);
        Ok(())
    }

    async fn accept(&self, config: &PipeConfig) -> Result<RawPipe> {
        use futures::FutureExt;

        let listener = self.bound.as_ref().ok_or(Error::Closed)?;
        let closed = self.close_rx.clone();

        futures::select! {
            res = Box::pin(listener.accept()).fuse() => {
                let (stream, peer) = res?;
                debug!(%peer, "tcp accepted");
                make_pipe(stream, &self.opts, config).await
            }
            _ = closed.recv_async().fuse() => Err(Error::Closed),
        }
    }

    fn close(&self) {
        self.close_tx.borrow_mut().take();
    }

    fn address(&self) -> String {
        match self.bound_addr.or(Some(self.addr)) {
            Some(a) => format!("tcp://{a}"),
            None => String::new(),
        }
    }

    fn set_option(&mut self, name: &str, value: OptionValue) -> Result<()> {
        self.opts.set(name, &value)
    }

    fn get_option(&self, name: &str) -> Result<OptionValue> {
        self.opts.get(name)
    }
}

/// The `tcp://` transport.
pub struct TcpTransport;

impl Transport for TcpTransport {
    fn scheme(&self) -> &'static str {
        "tcp"
    }

    fn new_dialer(&self, addr: &str) -> Result<Box<dyn TranDialer>> {
        let rest = strip_scheme(self.scheme(), addr)?;
        Ok(Box::new(TcpDialer {
            addr: parse_addr(rest)?,
            opts: TcpOpts::default(),
        }))
    }

    fn new_listener(&self, addr: &str) -> Result<Box<dyn TranListener>> {
        let rest = strip_scheme(self.scheme(), addr)?;
        let (close_tx, close_rx) = flume::bounded(1);
        Ok(Box::new(TcpTranListener {
            addr: parse_addr(rest)?,
            bound: None,
            bound_addr: None,
            opts: TcpOpts::default(),
            close_tx: RefCell::new(Some(close_tx)),
            close_rx,
        }))
    }
}
