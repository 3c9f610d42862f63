//! The dial supervisor.
//!
//! One dialer maintains one outbound address for the life of its socket:
//! connect, hand the pipe over, wait for it to die, back off, connect again.
//! The backoff interval doubles per failed attempt up to the configured
//! ceiling and resets on every successful connection. Closing the dialer is
//! terminal but deliberately leaves any live pipe alone; pipes belong to
//! the socket.

use futures::FutureExt;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use tracing::{debug, trace};

use spaceframe_core::backoff::Backoff;
use spaceframe_core::{Error, OptionValue, Result};

use crate::socket::SocketCore;
use crate::transport::TranDialer;

/// Where the supervisor currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialState {
    Idle,
    Connecting,
    Connected,
    Backoff,
    Closed,
}

struct DialerInner {
    sock: Weak<SocketCore>,
    addr: String,
    td: RefCell<Box<dyn TranDialer>>,
    state: Cell<DialState>,
    closed: Cell<bool>,
    close_tx: RefCell<Option<flume::Sender<()>>>,
    close_rx: flume::Receiver<()>,
}

/// Handle to one dial supervisor. Clones share the supervisor.
#[derive(Clone)]
pub struct Dialer {
    inner: Rc<DialerInner>,
}

impl Dialer {
    pub(crate) fn new(sock: Weak<SocketCore>, addr: String, td: Box<dyn TranDialer>) -> Self {
        let (close_tx, close_rx) = flume::bounded(0);
        Self {
            inner: Rc::new(DialerInner {
                sock,
                addr,
                td: RefCell::new(td),
                state: Cell::new(DialState::Idle),
                closed: Cell::new(false),
                close_tx: RefCell::new(Some(close_tx)),
                close_rx,
            }),
        }
    }

    /// Start the supervisor. A dialer runs at most once; starting it again
    /// reports `AddrInUse`.
    pub fn dial(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.get() {
            return Err(Error::Closed);
        }
        if inner.state.get() != DialState::Idle {
            return Err(Error::AddrInUse);
        }
        let core = inner.sock.upgrade().ok_or(Error::Closed)?;
        core.mark_active();
        inner.state.set(DialState::Connecting);

        let inner = Rc::clone(inner);
        compio::runtime::spawn(run(inner)).detach();
        Ok(())
    }

    /// Stop redialing. The first close wins; repeats report `Closed`.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.replace(true) {
            return Err(Error::Closed);
        }
        self.inner.close_tx.borrow_mut().take();
        Ok(())
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.inner.addr
    }

    #[must_use]
    pub fn state(&self) -> DialState {
        self.inner.state.get()
    }

    /// Transport-level option on this dialer. Only usable before `dial`.
    pub fn set_option(&self, name: &str, value: OptionValue) -> Result<()> {
        if self.inner.state.get() != DialState::Idle {
            return Err(Error::Closed);
        }
        self.inner.td.borrow_mut().set_option(name, value)
    }

    pub fn get_option(&self, name: &str) -> Result<OptionValue> {
        if self.inner.state.get() != DialState::Idle {
            return Err(Error::Closed);
        }
        self.inner.td.borrow().get_option(name)
    }
}

async fn run(inner: Rc<DialerInner>) {
    let Some(core) = inner.sock.upgrade() else {
        inner.state.set(DialState::Closed);
        return;
    };
    let (base, max) = core.reconnect_times();
    let mut backoff = Backoff::new(base, max);
    let sock_closed = core.close_watch();
    let dialer_closed = inner.close_rx.clone();
    // The supervisor holds this borrow for its whole life; the handle only
    // touches the transport dialer while idle.
    let td = inner.td.borrow();
    drop(core);

    loop {
        inner.state.set(DialState::Connecting);

        let attempt = {
            let Some(core) = inner.sock.upgrade() else { break };
            if core.is_closing() {
                break;
            }
            let config = core.pipe_config();
            drop(core);
            td.dial(&config).await
        };

        match attempt {
            Ok(raw) => {
                backoff.reset();
                if inner.closed.get() {
                    raw.closer.close();
                    break;
                }
                let Some(core) = inner.sock.upgrade() else { break };
                let (gate_tx, gate_rx) = flume::bounded::<()>(0);
                let adopted = SocketCore::add_pipe(
                    &core,
                    raw,
                    inner.addr.clone(),
                    true,
                    Some(gate_tx),
                );
                drop(core);

                if adopted.is_some() {
                    inner.state.set(DialState::Connected);
                    debug!(addr = %inner.addr, "dialer connected");
                    futures::select! {
                        _ = sock_closed.recv_async().fuse() => break,
                        _ = dialer_closed.recv_async().fuse() => break,
                        _ = gate_rx.recv_async().fuse() => {
                            trace!(addr = %inner.addr, "pipe lost, redialing");
                        }
                    }
                }
            }
            Err(e) => {
                trace!(addr = %inner.addr, error = %e, "dial attempt failed");
            }
        }

        inner.state.set(DialState::Backoff);
        let delay = backoff.next_delay();
        futures::select! {
            _ = dialer_closed.recv_async().fuse() => break,
            _ = sock_closed.recv_async().fuse() => break,
            _ = Box::pin(compio::time::sleep(delay)).fuse() => {}
        }
    }

    inner.state.set(DialState::Closed);
}
