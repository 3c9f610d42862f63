//! SUB: the receiving side of publish/subscribe.
//!
//! Sending is disabled. Each peer gets a receive worker that filters
//! against the subscription prefix list before forwarding upward; anything
//! that matches no prefix is dropped at the engine, and a full receive
//! queue also drops rather than applying backpressure to the publisher.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

use spaceframe_core::options::{OPT_RAW, OPT_SUBSCRIBE, OPT_UNSUBSCRIBE};
use spaceframe_core::subscription::SubscriptionList;
use spaceframe_core::{Error, OptionValue, Result};

use crate::endpoint::Endpoint;
use crate::proto::{Protocol, ProtocolSocket};
use crate::socket::Socket;
use crate::wire::{PROTO_PUB, PROTO_SUB};

struct SubState {
    sock: RefCell<Option<ProtocolSocket>>,
    subs: RefCell<SubscriptionList>,
    raw: Cell<bool>,
}

/// The SUB engine.
pub struct Sub {
    state: Rc<SubState>,
}

impl Default for Sub {
    fn default() -> Self {
        Self {
            state: Rc::new(SubState {
                sock: RefCell::new(None),
                subs: RefCell::new(SubscriptionList::new()),
                raw: Cell::new(false),
            }),
        }
    }
}

/// A new socket speaking SUB.
#[must_use]
pub fn socket() -> Socket {
    Socket::new(Sub::default())
}

async fn receiver(state: Rc<SubState>, psock: ProtocolSocket, ep: Endpoint) {
    let Some(rq) = psock.recv_queue() else {
        return;
    };

    loop {
        let Some(m) = ep.recv_msg().await else {
            return;
        };
        if !state.subs.borrow().matches(m.body()) {
            continue;
        }
        // Best effort upward: drop rather than stall the pipe.
        let _ = rq.try_send(m);
    }
}

impl Protocol for Sub {
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
        compio::runtime::spawn(receiver(Rc::clone(&self.state), psock, ep)).detach();
    }

    fn remove_endpoint(&self, _id: u32) {}

    fn number(&self) -> u16 {
        PROTO_SUB
    }

    fn peer_number(&self) -> u16 {
        PROTO_PUB
    }

    fn name(&self) -> &'static str {
        "sub"
    }

    fn peer_name(&self) -> &'static str {
        "pub"
    }

    fn set_option(&self, name: &str, value: OptionValue) -> Result<()> {
        match name {
            OPT_RAW => {
                self.state.raw.set(value.as_bool()?);
                Ok(())
            }
            OPT_SUBSCRIBE => {
                self.state.subs.borrow_mut().subscribe(value.as_bytes()?);
                Ok(())
            }
            OPT_UNSUBSCRIBE => self.state.subs.borrow_mut().unsubscribe(value.as_bytes()?),
            _ => Err(Error::BadOption),
        }
    }

    fn get_option(&self, name: &str) -> Result<OptionValue> {
        match name {
            OPT_RAW => Ok(OptionValue::Bool(self.state.raw.get())),
            _ => Err(Error::BadOption),
        }
    }
}
