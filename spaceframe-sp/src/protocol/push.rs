//! PUSH: the writing side of the pipeline pattern.
//!
//! Receiving is disabled. Every peer gets a send worker and the workers
//! race for messages on the shared socket send queue, which yields cheap
//! load balancing with exactly the fairness the queue provides and no more.

use futures::FutureExt;
use hashbrown::HashMap;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

use spaceframe_core::options::OPT_RAW;
use spaceframe_core::waiter::Waiter;
use spaceframe_core::{Error, OptionValue, Result};

use crate::endpoint::Endpoint;
use crate::proto::{null_recv, Protocol, ProtocolSocket};
use crate::socket::Socket;
use crate::wire::{PROTO_PULL, PROTO_PUSH};

struct PushState {
    sock: RefCell<Option<ProtocolSocket>>,
    peers: RefCell<HashMap<u32, flume::Sender<()>>>,
    raw: Cell<bool>,
    waiter: Waiter,
}

/// The PUSH engine.
pub struct Push {
    state: Rc<PushState>,
}

impl Default for Push {
    fn default() -> Self {
        Self {
            state: Rc::new(PushState {
                sock: RefCell::new(None),
                peers: RefCell::new(HashMap::new()),
                raw: Cell::new(false),
                waiter: Waiter::new(),
            }),
        }
    }
}

/// A new socket speaking PUSH.
#[must_use]
pub fn socket() -> Socket {
    Socket::new(Push::default())
}

async fn sender(
    psock: ProtocolSocket,
    ep: Endpoint,
    cq: flume::Receiver<()>,
    _guard: spaceframe_core::waiter::WaitGuard,
) {
    let closed = psock.closed();
    let Some(mut sq) = psock.send_queue() else {
        return;
    };

    loop {
        futures::select! {
            _ = closed.recv_async().fuse() => return,
            _ = cq.recv_async().fuse() => return,
            m = sq.recv_async().fuse() => match m {
                Ok(m) => {
                    if ep.send_msg(m).await.is_err() {
                        return;
                    }
                }
                Err(_) => match psock.send_queue() {
                    Some(q) => sq = q,
                    None => return,
                },
            },
        }
    }
}

impl Protocol for Push {
    fn init(&self, sock: ProtocolSocket) {
        sock.set_recv_error(Some(Error::ProtoOp));
        *self.state.sock.borrow_mut() = Some(sock);
    }

    fn shutdown(&self, deadline: Instant) -> futures::future::LocalBoxFuture<'static, ()> {
        let waiter = self.state.waiter.clone();
        Box::pin(async move {
            waiter.wait_deadline(deadline).await;
        })
    }

    fn add_endpoint(&self, ep: Endpoint) {
        let Some(psock) = self.state.sock.borrow().clone() else {
            ep.close();
            return;
        };
        let (cq_tx, cq_rx) = flume::bounded(0);
        self.state.peers.borrow_mut().insert(ep.id(), cq_tx);

        let guard = self.state.waiter.guard();
        compio::runtime::spawn(sender(psock, ep.clone(), cq_rx, guard)).detach();
        compio::runtime::spawn(null_recv(ep)).detach();
    }

    fn remove_endpoint(&self, id: u32) {
        self.state.peers.borrow_mut().remove(&id);
    }

    fn number(&self) -> u16 {
        PROTO_PUSH
    }

    fn peer_number(&self) -> u16 {
        PROTO_PULL
    }

    fn name(&self) -> &'static str {
        "push"
    }

    fn peer_name(&self) -> &'static str {
        "pull"
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
}
