//! REP: the answering side of request/reply.
//!
//! Inbound requests carry a backtrace: the stack of 32-bit peer IDs pushed
//! by each hop on the way here, terminated by the originator's request ID
//! (high bit set). The receive worker moves that stack from the body into
//! the header, bounded by the TTL, and prepends the arriving pipe's own ID
//! so the reply can be routed back out the way the request came in.
//!
//! In cooked mode the engine holds the backtrace aside between receive and
//! send, and refuses sends that have no request outstanding. Raw mode
//! leaves the header to the application.

use futures::FutureExt;
use hashbrown::HashMap;
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

use spaceframe_core::options::{OPT_RAW, OPT_TTL};
use spaceframe_core::waiter::{drain_queue, Waiter};
use spaceframe_core::{Error, Message, OptionValue, Result};

use crate::endpoint::Endpoint;
use crate::proto::{Protocol, ProtocolSocket};
use crate::protocol::{append_id, leading_id};
use crate::socket::Socket;
use crate::wire::{PROTO_REP, PROTO_REQ};

/// Routing headers are a handful of 32-bit words; keep them off the heap.
type Backtrace = SmallVec<[u8; 32]>;

/// Hop limit default, per the SP request/reply RFC.
const DEFAULT_TTL: usize = 8;

struct RepState {
    sock: RefCell<Option<ProtocolSocket>>,
    peers: RefCell<HashMap<u32, flume::Sender<Message>>>,
    backtrace: RefCell<Option<Backtrace>>,
    raw: Cell<bool>,
    ttl: Cell<usize>,
    waiter: Waiter,
}

/// The REP engine.
pub struct Rep {
    state: Rc<RepState>,
}

impl Default for Rep {
    fn default() -> Self {
        Self {
            state: Rc::new(RepState {
                sock: RefCell::new(None),
                peers: RefCell::new(HashMap::new()),
                backtrace: RefCell::new(None),
                raw: Cell::new(false),
                ttl: Cell::new(DEFAULT_TTL),
                waiter: Waiter::new(),
            }),
        }
    }
}

/// A new socket speaking REP.
#[must_use]
pub fn socket() -> Socket {
    Socket::new(Rep::default())
}

/// Engine-level distributor: take each reply off the socket send queue and
/// route it to the peer named by the leading header ID.
async fn route_replies(
    state: Rc<RepState>,
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
                    let Some(id) = leading_id(m.header()) else {
                        continue;
                    };
                    let _ = m.header_mut().split_to(4);
                    let peers = state.peers.borrow();
                    if let Some(q) = peers.get(&id) {
                        // Full peer queue: the initiator will retry.
                        let _ = q.try_send(m);
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

/// Per-peer drain of routed replies onto the pipe.
async fn peer_sender(ep: Endpoint, q: flume::Receiver<Message>) {
    while let Ok(m) = q.recv_async().await {
        if ep.send_msg(m).await.is_err() {
            return;
        }
    }
}

async fn receiver(state: Rc<RepState>, psock: ProtocolSocket, ep: Endpoint) {
    let closed = psock.closed();
    let Some(rq) = psock.recv_queue() else {
        return;
    };

    'msgs: loop {
        let Some(mut m) = ep.recv_msg().await else {
            return;
        };

        append_id(&mut m, ep.id());

        // Shift the backtrace out of the body, one 32-bit word per hop,
        // until the request ID (high bit) comes across.
        let ttl = state.ttl.get();
        let mut hops = 0;
        loop {
            if hops >= ttl || m.body().len() < 4 {
                // Too many hops, or a garbled request.
                continue 'msgs;
            }
            hops += 1;
            let word = m.body_mut().split_to(4);
            let done = word[0] & 0x80 != 0;
            m.header_mut().extend_from_slice(&word);
            if done {
                break;
            }
        }

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

impl Protocol for Rep {
    fn init(&self, sock: ProtocolSocket) {
        sock.set_send_error(Some(Error::ProtoState));
        *self.state.sock.borrow_mut() = Some(sock.clone());

        let guard = self.state.waiter.guard();
        compio::runtime::spawn(route_replies(Rc::clone(&self.state), sock, guard)).detach();
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
        // Partners run request/reply in lockstep, so a couple of slots is
        // all a healthy peer can use.
        let (q_tx, q_rx) = flume::bounded(2);
        self.state.peers.borrow_mut().insert(ep.id(), q_tx);

        compio::runtime::spawn(receiver(Rc::clone(&self.state), psock, ep.clone())).detach();
        compio::runtime::spawn(peer_sender(ep, q_rx)).detach();
    }

    fn remove_endpoint(&self, id: u32) {
        self.state.peers.borrow_mut().remove(&id);
    }

    fn number(&self) -> u16 {
        PROTO_REP
    }

    fn peer_number(&self) -> u16 {
        PROTO_REQ
    }

    fn name(&self) -> &'static str {
        "rep"
    }

    fn peer_name(&self) -> &'static str {
        "req"
    }

    fn set_option(&self, name: &str, value: OptionValue) -> Result<()> {
        match name {
            OPT_RAW => {
                let raw = value.as_bool()?;
                self.state.raw.set(raw);
                if let Some(psock) = self.state.sock.borrow().clone() {
                    psock.set_send_error(if raw { None } else { Some(Error::ProtoState) });
                }
                Ok(())
            }
            OPT_TTL => {
                let ttl = value.as_int()?;
                if !(1..=255).contains(&ttl) {
                    return Err(Error::BadValue);
                }
                self.state.ttl.set(ttl as usize);
                Ok(())
            }
            _ => Err(Error::BadOption),
        }
    }

    fn get_option(&self, name: &str) -> Result<OptionValue> {
        match name {
            OPT_RAW => Ok(OptionValue::Bool(self.state.raw.get())),
            OPT_TTL => Ok(OptionValue::Int(self.state.ttl.get() as i64)),
            _ => Err(Error::BadOption),
        }
    }

    fn has_send_hook(&self) -> bool {
        true
    }

    fn has_recv_hook(&self) -> bool {
        true
    }

    /// Cooked mode: attach the held backtrace to the outgoing reply. With
    /// no request outstanding there is nobody to reply to, so the message
    /// is dropped and sends latch shut again.
    fn send_hook(&self, msg: &mut Message) -> bool {
        if self.state.raw.get() {
            return true;
        }
        if let Some(psock) = self.state.sock.borrow().clone() {
            psock.set_send_error(Some(Error::ProtoState));
        }
        match self.state.backtrace.borrow_mut().take() {
            Some(bt) => {
                let h = msg.header_mut();
                h.clear();
                h.extend_from_slice(&bt);
                true
            }
            None => false,
        }
    }

    /// Cooked mode: hold the backtrace aside and present a clean header.
    /// Receiving again before replying discards the previous request.
    fn recv_hook(&self, msg: &mut Message) -> bool {
        if self.state.raw.get() {
            return true;
        }
        if let Some(psock) = self.state.sock.borrow().clone() {
            psock.set_send_error(None);
        }
        *self.state.backtrace.borrow_mut() = Some(SmallVec::from_slice(msg.header()));
        msg.header_mut().clear();
        true
    }
}
