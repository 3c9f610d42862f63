//! PUB: the sending side of publish/subscribe.
//!
//! The distributor duplicates every outbound message into each peer's
//! bounded queue, dropping for peers that are full so one slow subscriber
//! never stalls the rest. Receiving is disabled; inbound bytes from peers
//! are drained and discarded purely so disconnects are noticed.

use futures::FutureExt;
use hashbrown::HashMap;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

use spaceframe_core::options::OPT_RAW;
use spaceframe_core::waiter::{drain_queue, Waiter};
use spaceframe_core::{Error, Message, OptionValue, Result};

use crate::endpoint::Endpoint;
use crate::proto::{null_recv, Protocol, ProtocolSocket};
use crate::socket::Socket;
use crate::wire::{PROTO_PUB, PROTO_SUB};

struct PubState {
    sock: RefCell<Option<ProtocolSocket>>,
    peers: RefCell<HashMap<u32, flume::Sender<Message>>>,
    raw: Cell<bool>,
    waiter: Waiter,
}

/// The PUB engine.
pub struct Pub {
    state: Rc<PubState>,
}

impl Default for Pub {
    fn default() -> Self {
        Self {
            state: Rc::new(PubState {
                sock: RefCell::new(None),
                peers: RefCell::new(HashMap::new()),
                raw: Cell::new(false),
                waiter: Waiter::new(),
            }),
        }
    }
}

/// A new socket speaking PUB.
#[must_use]
pub fn socket() -> Socket {
    Socket::new(Pub::default())
}

/// Top half: fan each message out to every peer queue.
async fn distributor(
    state: Rc<PubState>,
    psock: ProtocolSocket,
    _guard: spaceframe_core::waiter::WaitGuard,
) {
    let closed = psock.closed();
    let Some(mut sq) = psock.send_queue() else {
        return;
    };

    loop {
        futures::select! {
            _ = closed.recv_async().fuse() => return,
            m = sq.recv_async().fuse() => match m {
                Ok(m) => {
                    let peers = state.peers.borrow();
                    for q in peers.values() {
                        // Full peer queue: that subscriber misses out.
                        let _ = q.try_send(m.dup());
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

/// Bottom half: drain one peer's queue onto its pipe.
async fn peer_sender(ep: Endpoint, q: flume::Receiver<Message>) {
    while let Ok(m) = q.recv_async().await {
        if ep.send_msg(m).await.is_err() {
            return;
        }
    }
}

impl Protocol for Pub {
    fn init(&self, sock: ProtocolSocket) {
        sock.set_recv_error(Some(Error::ProtoOp));
        *self.state.sock.borrow_mut() = Some(sock.clone());

        let guard = self.state.waiter.guard();
        compio::runtime::spawn(distributor(Rc::clone(&self.state), sock, guard)).detach();
    }

    fn shutdown(&self, deadline: Instant) -> futures::future::LocalBoxFuture<'static, ()> {
        let state = Rc::clone(&self.state);
        Box::pin(async move {
            state.waiter.wait_deadline(deadline).await;
            let peers: Vec<_> = state.peers.borrow_mut().drain().collect();
            for (_, q) in peers {
                drain_queue(&q, deadline).await;
            }
        })
    }

    fn add_endpoint(&self, ep: Endpoint) {
        let Some(psock) = self.state.sock.borrow().clone() else {
            ep.close();
            return;
        };
        let (q_tx, q_rx) = flume::bounded(psock.peer_queue_depth());
        self.state.peers.borrow_mut().insert(ep.id(), q_tx);

        compio::runtime::spawn(peer_sender(ep.clone(), q_rx)).detach();
        compio::runtime::spawn(null_recv(ep)).detach();
    }

    fn remove_endpoint(&self, id: u32) {
        self.state.peers.borrow_mut().remove(&id);
    }

    fn number(&self) -> u16 {
        PROTO_PUB
    }

    fn peer_number(&self) -> u16 {
        PROTO_SUB
    }

    fn name(&self) -> &'static str {
        "pub"
    }

    fn peer_name(&self) -> &'static str {
        "sub"
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
