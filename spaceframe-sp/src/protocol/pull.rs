//! PULL: the reading side of the pipeline pattern.
//!
//! Sending is disabled. Each peer's receive worker pushes inbound messages
//! straight into the socket receive queue, blocking when the application
//! falls behind so upstream PUSH sockets feel the backpressure.

use futures::FutureExt;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

use spaceframe_core::options::OPT_RAW;
use spaceframe_core::{Error, Message, OptionValue, Result};

use crate::endpoint::Endpoint;
use crate::proto::{Protocol, ProtocolSocket};
use crate::socket::Socket;
use crate::wire::{PROTO_PULL, PROTO_PUSH};

struct PullState {
    sock: RefCell<Option<ProtocolSocket>>,
    raw: Cell<bool>,
}

/// The PULL engine.
pub struct Pull {
    state: Rc<PullState>,
}

impl Default for Pull {
    fn default() -> Self {
        Self {
            state: Rc::new(PullState {
                sock: RefCell::new(None),
                raw: Cell::new(false),
            }),
        }
    }
}

/// A new socket speaking PULL.
#[must_use]
pub fn socket() -> Socket {
    Socket::new(Pull::default())
}

async fn receiver(psock: ProtocolSocket, ep: Endpoint) {
    let closed = psock.closed();
    let Some(rq) = psock.recv_queue() else {
        return;
    };

    loop {
        let Some(m) = ep.recv_msg().await else {
            return;
        };
        futures::select! {
            res = rq.send_async(m).fuse() => {
                if res.is_err() {
                    return;
                }
            }
            _ = closed.recv_async().fuse() => return,
        }
    }
}

impl Protocol for Pull {
    fn init(&self, sock: ProtocolSocket) {
        sock.set_send_error(Some(Error::ProtoOp));
        *self.state.sock.borrow_mut() = Some(sock);
    }

    fn shutdown(&self, _deadline: Instant) -> futures::future::LocalBoxFuture<'static, ()> {
        // No senders to drain.
        Box::pin(async {})
    }

    fn add_endpoint(&self, ep: Endpoint) {
        let Some(psock) = self.state.sock.borrow().clone() else {
            ep.close();
            return;
        };
        compio::runtime::spawn(receiver(psock, ep)).detach();
    }

    fn remove_endpoint(&self, _id: u32) {}

    fn number(&self) -> u16 {
        PROTO_PULL
    }

    fn peer_number(&self) -> u16 {
        PROTO_PUSH
    }

    fn name(&self) -> &'static str {
        "pull"
    }

    fn peer_name(&self) -> &'static str {
        "push"
    }

    fn set_option(&self, name: &str, value: OptionValue) -> Result<()> {
        match name {
            OPT_RAW => {
                self.state.raw.set(value.as_bool()?);
                Ok(())
            }
            _ => Err(Error::BadOption),
        }
    }

    fn get_option(&self, name: &str) -> Result<OptionValue> {
        match name {
            OPT_RAW => Ok(OptionValue::Bool(self.state.raw.get())),
            _ => Err(Error::BadOption),
        }
    }

    fn has_send_hook(&self) -> bool {
        true
    }

    /// Sends can never make it to the wire on this pattern.
    fn send_hook(&self, _msg: &mut Message) -> bool {
        false
    }
}
