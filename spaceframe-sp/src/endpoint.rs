//! Endpoints: a protocol engine's handle to one live pipe.
//!
//! The socket wraps every adopted [`RawPipe`](crate::pipe::RawPipe) in an
//! [`Endpoint`] carrying its 31-bit registration ID. Engines drive the two
//! halves from their worker tasks; a send or receive failure closes the
//! endpoint, which unregisters it from the socket, notifies the engine, and
//! wakes the owning dialer so it can go back to connecting.
//!
//! An endpoint is also the "port" surfaced to the application's port hook:
//! read-only identity, addresses, and transport properties.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use spaceframe_core::{Message, OptionValue, Result};
use tracing::debug;

use crate::pipe::{PipeCloser, PipeProps, PipeRx, PipeTx, RawPipe};
use crate::socket::SocketCore;

/// Whether a port is being attached to or detached from the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortAction {
    Add,
    Remove,
}

/// Called synchronously as pipes come and go. Returning false for
/// [`PortAction::Add`] rejects the pipe, which is closed before any engine
/// sees it.
pub type PortHook = Rc<dyn Fn(PortAction, &Endpoint) -> bool>;

struct EndpointInner {
    id: u32,
    addr: String,
    client: bool,
    local_proto: u16,
    peer_proto: u16,
    tx: RefCell<Box<dyn PipeTx>>,
    rx: RefCell<Box<dyn PipeRx>>,
    closer: Box<dyn PipeCloser>,
    props: PipeProps,
    open: Cell<bool>,
    sock: Weak<SocketCore>,
    /// Held while the pipe lives; dropped on close so the dialer that
    /// created it observes the disconnect.
    dial_gate: RefCell<Option<flume::Sender<()>>>,
}

/// One registered pipe. Clones share the same connection.
#[derive(Clone)]
pub struct Endpoint {
    inner: Rc<EndpointInner>,
}

impl Endpoint {
    pub(crate) fn new(
        sock: Weak<SocketCore>,
        id: u32,
        raw: RawPipe,
        addr: String,
        client: bool,
        local_proto: u16,
        peer_proto: u16,
        dial_gate: Option<flume::Sender<()>>,
    ) -> Self {
        Self {
            inner: Rc::new(EndpointInner {
                id,
                addr,
                client,
                local_proto,
                peer_proto,
                tx: RefCell::new(raw.tx),
                rx: RefCell::new(raw.rx),
                closer: raw.closer,
                props: raw.props,
                open: Cell::new(true),
                sock,
                dial_gate: RefCell::new(dial_gate),
            }),
        }
    }

    /// The unique 31-bit ID assigned at registration.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Write one message to the peer. On failure the endpoint is closed.
    ///
    /// Only one task may be sending on an endpoint at a time; engines uphold
    /// this by giving each endpoint a single send worker.
    pub async fn send_msg(&self, msg: Message) -> Result<()> {
        if !self.inner.open.get() {
            return Err(spaceframe_core::Error::Closed);
        }
        let res = {
            let mut tx = self.inner.tx.borrow_mut();
            tx.send_msg(msg).await
        };
        if res.is_err() {
            self.close();
        }
        res
    }

    /// Read one message from the peer, stamped with this endpoint's ID.
    /// Returns `None` once the pipe is dead; the endpoint closes itself
    /// first so the caller only has to exit its loop.
    pub async fn recv_msg(&self) -> Option<Message> {
        if !self.inner.open.get() {
            return None;
        }
        let res = {
            let mut rx = self.inner.rx.borrow_mut();
            rx.recv_msg().await
        };
        match res {
            Ok(mut m) => {
                m.set_pipe(self.inner.id);
                Some(m)
            }
            Err(e) => {
                debug!(pipe = self.inner.id, error = %e, "pipe receive failed");
                self.close();
                None
            }
        }
    }

    /// Tear the pipe down: force both stream directions closed, unregister
    /// from the socket, and wake the owning dialer. Safe to call more than
    /// once; only the first call acts.
    pub fn close(&self) {
        if !self.inner.open.replace(false) {
            return;
        }
        debug!(pipe = self.inner.id, "closing pipe");
        self.inner.closer.close();
        self.inner.dial_gate.borrow_mut().take();
        if let Some(core) = self.inner.sock.upgrade() {
            SocketCore::rem_pipe(&core, self.inner.id);
        }
    }

    // Port surface, consumed by port hooks and diagnostics.

    /// The dial or listen address this pipe came from.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.inner.addr
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.open.get()
    }

    /// True when this side initiated the connection.
    #[must_use]
    pub fn is_client(&self) -> bool {
        self.inner.client
    }

    /// True when this side accepted the connection.
    #[must_use]
    pub fn is_server(&self) -> bool {
        !self.inner.client
    }

    #[must_use]
    pub fn local_protocol(&self) -> u16 {
        self.inner.local_proto
    }

    #[must_use]
    pub fn remote_protocol(&self) -> u16 {
        self.inner.peer_proto
    }

    /// Transport-specific read-only properties, e.g. addresses.
    pub fn get_prop(&self, name: &str) -> Result<OptionValue> {
        self.inner.props.get(name)
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.inner.id)
            .field("addr", &self.inner.addr)
            .field("client", &self.inner.client)
            .field("open", &self.inner.open.get())
            .finish()
    }
}
