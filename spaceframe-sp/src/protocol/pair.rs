//! PAIR: 1:1 peering.
//!
//! Exactly one peer at a time; any further connection is closed on arrival.
//! One send worker moves messages from the socket queue to the peer, one
//! receive worker moves them the other way.

use futures::FutureExt;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

use spaceframe_core::options::OPT_RAW;
use spaceframe_core::waiter::Waiter;
use spaceframe_core::{Error, OptionValue, Result};

use crate::endpoint::Endpoint;
use crate::proto::{Protocol, ProtocolSocket};
use crate::socket::Socket;
use crate::wire::PROTO_PAIR;

struct PairState {
    sock: RefCell<Option<ProtocolSocket>>,
    peer: RefCell<Option<PairPeer>>,
    raw: Cell<bool>,
    waiter: Waiter,
}

struct PairPeer {
    id: u32,
    // Dropped on removal; both workers watch the receiving side.
    _cq_tx: flume::Sender<()>,
}

/// The PAIR engine.
pub struct Pair {
    state: Rc<PairState>,
}

impl Default for Pair {
    fn default() -> Self {
        Self {
            state: Rc::new(PairState {
                sock: RefCell::new(None),
                peer: RefCell::new(None),
                raw: Cell::new(false),
                waiter: Waiter::new(),
            }),
        }
    }
}

/// A new socket speaking PAIR.
#[must_use]
pub fn socket() -> Socket {
    Socket::new(Pair::default())
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

    // Only one peer at a time, so the send queue is consumed directly; a
    // message that fails to write is simply gone.
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

impl Protocol for Pair {
    fn init(&self, sock: ProtocolSocket) {
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
        {
            let mut peer = self.state.peer.borrow_mut();
            if peer.is_some() {
                drop(peer);
                ep.close();
                return;
            }
            *peer = Some(PairPeer {
                id: ep.id(),
                _cq_tx: cq_tx,
            });
        }

        let guard = self.state.waiter.guard();
        compio::runtime::spawn(sender(psock.clone(), ep.clone(), cq_rx, guard)).detach();
        compio::runtime::spawn(receiver(psock, ep)).detach();
    }

    fn remove_endpoint(&self, id: u32) {
        let mut peer = self.state.peer.borrow_mut();
        if peer.as_ref().is_some_and(|p| p.id == id) {
            peer.take();
        }
    }

    fn number(&self) -> u16 {
        PROTO_PAIR
    }

    fn peer_number(&self) -> u16 {
        PROTO_PAIR
    }

    fn name(&self) -> &'static str {
        "pair"
    }

    fn peer_name(&self) -> &'static str {
        "pair"
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
