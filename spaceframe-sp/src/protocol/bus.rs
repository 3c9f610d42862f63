//! BUS: every participant sends to all of its peers.
//!
//! Outbound messages fan out to every peer except the one they originally
//! arrived from: a message entering the send path with a 32-bit pipe ID at
//! the head of its header is a rebroadcast, and that pipe is skipped.
//! Inbound messages get their origin pipe ID prepended for exactly that
//! purpose; in cooked mode the ID is stripped again before the application
//! sees the message.

use futures::FutureExt;
use hashbrown::HashMap;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

use spaceframe_core::options::OPT_RAW;
use spaceframe_core::waiter::{drain_queue, Waiter};
use spaceframe_core::{Error, Message, OptionValue, Result};

use crate::endpoint::Endpoint;
use crate::proto::{Protocol, ProtocolSocket};
use crate::protocol::{append_id, leading_id};
use crate::socket::Socket;
use crate::wire::PROTO_BUS;

struct BusState {
    sock: RefCell<Option<ProtocolSocket>>,
    peers: RefCell<HashMap<u32, flume::Sender<Message>>>,
    raw: Cell<bool>,
    waiter: Waiter,
}

/// The BUS engine.
pub struct Bus {
    state: Rc<BusState>,
}

impl Default for Bus {
    fn default() -> Self {
        Self {
            state: Rc::new(BusState {
                sock: RefCell::new(None),
                peers: RefCell::new(HashMap::new()),
                raw: Cell::new(false),
                waiter: Waiter::new(),
            }),
        }
    }
}

/// A new socket speaking BUS.
#[must_use]
pub fn socket() -> Socket {
    Socket::new(Bus::default())
}

fn broadcast(state: &BusState, m: &Message, origin: u32) {
    let peers = state.peers.borrow();
    for (&id, q) in peers.iter() {
        if id == origin {
            continue;
        }
        // Full peer queue: that peer misses the broadcast.
        let _ = q.try_send(m.dup());
    }
}

async fn distributor(
    state: Rc<BusState>,
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
                Ok(mut m) => {
                    // A leading header ID marks a rebroadcast; it names the
                    // pipe the message came in on.
                    let mut origin = 0;
                    if let Some(id) = leading_id(m.header()) {
                        origin = id;
                        let _ = m.header_mut().split_to(4);
                    }
                    broadcast(&state, &m, origin);
                }
                Err(_) => match psock.send_queue() {
                    Some(q) => sq = q,
                    None => return,
                },
            },
        }
    }
}

async fn peer_sender(ep: Endpoint, q: flume::Receiver<Message>) {
    while let Ok(m) = q.recv_async().await {
        if ep.send_msg(m).await.is_err() {
            return;
        }
    }
}

async fn receiver(psock: ProtocolSocket, ep: Endpoint) {
    let Some(rq) = psock.recv_queue() else {
        return;
    };

    loop {
        let Some(mut m) = ep.recv_msg().await else {
            return;
        };
        append_id(&mut m, ep.id());
        // Best effort upward; a stalled application drops broadcasts.
        let _ = rq.try_send(m);
    }
}

impl Protocol for Bus {
    fn init(&self, sock: ProtocolSocket) {
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
        compio::runtime::spawn(receiver(psock, ep)).detach();
    }

    fn remove_endpoint(&self, id: u32) {
        self.state.peers.borrow_mut().remove(&id);
    }

    fn number(&self) -> u16 {
        PROTO_BUS
    }

    fn peer_number(&self) -> u16 {
        PROTO_BUS
    }

    fn name(&self) -> &'static str {
        "bus"
    }

    fn peer_name(&self) -> &'static str {
        "bus"
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

    fn has_recv_hook(&self) -> bool {
        true
    }

    fn recv_hook(&self, msg: &mut Message) -> bool {
        if !self.state.raw.get() && msg.header().len() >= 4 {
            let _ = msg.header_mut().split_to(4);
        }
        true
    }
}
