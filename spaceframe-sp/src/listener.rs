//! The accept supervisor.
//!
//! `listen` binds synchronously so address errors reach the caller, then an
//! accept loop runs for the life of the socket. Transient accept failures
//! (a peer that botches its handshake, a connection reset between accept
//! and adoption) are logged and skipped; only a closed listener stops the
//! loop. That keeps one misbehaving client from costing everyone else the
//! service.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use tracing::{debug, trace};

use spaceframe_core::{Error, OptionValue, Result};

use crate::socket::SocketCore;
use crate::transport::TranListener;

struct ListenerInner {
    sock: Weak<SocketCore>,
    addr: String,
    tl: RefCell<Box<dyn TranListener>>,
    started: Cell<bool>,
    closed: Cell<bool>,
}

/// Handle to one accept supervisor. Clones share the supervisor.
#[derive(Clone)]
pub struct Listener {
    inner: Rc<ListenerInner>,
}

impl Listener {
    pub(crate) fn new(sock: Weak<SocketCore>, addr: String, tl: Box<dyn TranListener>) -> Self {
        Self {
            inner: Rc::new(ListenerInner {
                sock,
                addr,
                tl: RefCell::new(tl),
                started: Cell::new(false),
                closed: Cell::new(false),
            }),
        }
    }

    /// Bind the address and start accepting. Bind failures surface here.
    pub async fn listen(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.get() {
            return Err(Error::Closed);
        }
        if inner.started.replace(true) {
            return Err(Error::AddrInUse);
        }

        let core = inner.sock.upgrade().ok_or(Error::Closed)?;
        let config = core.pipe_config();
        inner.tl.borrow_mut().bind(&config).await?;

        core.mark_active();
        core.register_listener(self.clone());
        drop(core);

        debug!(addr = %self.inner.addr, "listener started");
        compio::runtime::spawn(serve(Rc::clone(inner))).detach();
        Ok(())
    }

    /// Stop accepting. Repeated closes report `Closed`.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.replace(true) {
            return Err(Error::Closed);
        }
        self.close_transport();
        Ok(())
    }

    /// The bound address, which reflects OS-assigned ports after `listen`.
    #[must_use]
    pub fn address(&self) -> String {
        self.inner.tl.borrow().address()
    }

    /// Transport-level option on this listener. Only usable before
    /// `listen`.
    pub fn set_option(&self, name: &str, value: OptionValue) -> Result<()> {
        if self.inner.started.get() {
            return Err(Error::Closed);
        }
        self.inner.tl.borrow_mut().set_option(name, value)
    }

    pub fn get_option(&self, name: &str) -> Result<OptionValue> {
        self.inner.tl.borrow().get_option(name)
    }

    /// Close the transport listener without the handle bookkeeping; the
    /// socket uses this during its own shutdown.
    pub(crate) fn close_transport(&self) {
        self.inner.tl.borrow().close();
    }
}

async fn serve(inner: Rc<ListenerInner>) {
    // Held for the life of the loop; the handle only takes shared borrows
    // once started.
    let tl = inner.tl.borrow();

    loop {
        let Some(core) = inner.sock.upgrade() else { return };
        if core.is_closing() {
            return;
        }
        let config = core.pipe_config();
        drop(core);

        match tl.accept(&config).await {
            Ok(raw) => {
                if let Some(core) = inner.sock.upgrade() {
                    SocketCore::add_pipe(&core, raw, inner.addr.clone(), false, None);
                }
            }
            Err(Error::Closed) => {
                debug!(addr = %inner.addr, "listener closed");
                return;
            }
            Err(e) => {
                // Per-connection failures don't take the service down.
                trace!(addr = %inner.addr, error = %e, "accept failed");
            }
        }
    }
}
