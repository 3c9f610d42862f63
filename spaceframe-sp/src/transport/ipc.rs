//! IPC transport over Unix domain sockets.
//!
//! Addresses look like `ipc:///path/to/socket`. Framing differs from TCP in
//! the single `0x01` type byte ahead of each frame, which keeps the stream
//! compatible with the C implementation's control-byte scheme. A stale
//! socket file left by a dead process is removed before binding.

#![allow(unsafe_code)]

use async_trait::async_trait;
use compio::net::{UnixListener, UnixStream};
use std::cell::RefCell;
use std::path::PathBuf;
use tracing::debug;

use spaceframe_core::{Error, OptionValue, Result};

use crate::pipe::{
    handshake, PipeCloser, PipeConfig, PipeProps, RawPipe, StreamRx, StreamTx, WireFormat,
};
use crate::transport::{strip_scheme, TranDialer, TranListener, Transport};

fn shutdown_unix(stream: &UnixStream) {
    use std::os::unix::io::{AsRawFd, FromRawFd};
    let fd = stream.as_raw_fd();
    let sock = unsafe { socket2::Socket::from_raw_fd(fd) };
    let _ = sock.shutdown(std::net::Shutdown::Both);
    std::mem::forget(sock); // Don't close the fd
}

struct IpcPipeCloser {
    stream: UnixStream,
}

impl PipeCloser for IpcPipeCloser {
    fn close(&self) {
        shutdown_unix(&self.stream);
    }
}

async fn make_pipe(mut stream: UnixStream, path: &str, config: &PipeConfig) -> Result<RawPipe> {
    handshake(&mut stream, config).await?;

    let props = PipeProps {
        local_addr: format!("ipc://{path}"),
        remote_addr: format!("ipc://{path}"),
    };

    let reader = stream.clone();
    let closer = stream.clone();
    Ok(RawPipe {
        tx: Box::new(StreamTx::new(stream, WireFormat::Ipc)),
        rx: Box::new(StreamRx::new(reader, WireFormat::Ipc, config.max_recv_size)),
        closer: Box::new(IpcPipeCloser { stream: closer }),
        props,
    })
}

struct IpcDialer {
    path: PathBuf,
    path_str: String,
}

#[async_trait(?Send)]
impl TranDialer for IpcDialer {
    async fn dial(&self, config: &PipeConfig) -> Result<RawPipe> {
        let stream = UnixStream::connect(&self.path).await?;
        debug!(path = %self.path_str, "ipc connected");
        make_pipe(stream, &self.path_str, config).await
    }
}

struct IpcTranListener {
    path: PathBuf,
    path_str: String,
    bound: Option<UnixListener>,
    close_tx: RefCell<Option<flume::Sender<()>>>,
    close_rx: flume::Receiver<()>,
}

#[async_trait(?Send)]
impl TranListener for IpcTranListener {
    async fn bind(&mut self, _config: &PipeConfig) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).map_err(Error::from)?;
        }
        let listener = UnixListener::bind(&self.path).await?;
        debug!(path = %self.path_str, "ipc listening");
        self.bound = Some(listener);
        Ok(())
    }

    async fn accept(&self, config: &PipeConfig) -> Result<RawPipe> {
        use futures::FutureExt;

        let listener = self.bound.as_ref().ok_or(Error::Closed)?;
        let closed = self.close_rx.clone();

        futures::select! {
            res = Box::pin(listener.accept()).fuse() => {
                let (stream, _peer) = res?;
                debug!(path = %self.path_str, "ipc accepted");
                make_pipe(stream, &self.path_str, config).await
            }
            _ = closed.recv_async().fuse() => Err(Error::Closed),
        }
    }

    fn close(&self) {
        self.close_tx.borrow_mut().take();
        let _ = std::fs::remove_file(&self.path);
    }

    fn address(&self) -> String {
        format!("ipc://{}", self.path_str)
    }
}

/// The `ipc://` transport.
pub struct IpcTransport;

impl Transport for IpcTransport {
    fn scheme(&self) -> &'static str {
        "ipc"
    }

    fn new_dialer(&self, addr: &str) -> Result<Box<dyn TranDialer>> {
        let rest = strip_scheme(self.scheme(), addr)?;
        if rest.is_empty() {
            return Err(Error::BadAddr);
        }
        Ok(Box::new(IpcDialer {
            path: PathBuf::from(rest),
            path_str: rest.to_string(),
        }))
    }

    fn new_listener(&self, addr: &str) -> Result<Box<dyn TranListener>> {
        let rest = strip_scheme(self.scheme(), addr)?;
        if rest.is_empty() {
            return Err(Error::BadAddr);
        }
        let (close_tx, close_rx) = flume::bounded(1);
        Ok(Box::new(IpcTranListener {
            path: PathBuf::from(rest),
            path_str: rest.to_string(),
            bound: None,
            close_tx: RefCell::new(Some(close_tx)),
            close_rx,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_validation() {
        let t = IpcTransport;
        assert!(t.new_dialer("ipc:///tmp/sf-test.sock").is_ok());
        assert!(matches!(t.new_dialer("ipc://"), Err(Error::BadAddr)));
        assert!(matches!(
            t.new_dialer("tcp://127.0.0.1:1"),
            Err(Error::BadAddr)
        ));
    }

    #[test]
    fn ipc_options_are_not_a_thing() {
        let t = IpcTransport;
        let mut d = t.new_dialer("ipc:///tmp/sf-test2.sock").unwrap();
        assert!(matches!(
            d.set_option("NO-DELAY", OptionValue::Bool(true)),
            Err(Error::BadOption)
        ));
        assert!(matches!(d.get_option("NO-DELAY"), Err(Error::BadOption)));
    }
}
