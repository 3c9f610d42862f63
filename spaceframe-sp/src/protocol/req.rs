//! REQ: the asking side of request/reply.
//!
//! Each request gets a fresh 32-bit request ID (high bit set) appended to
//! its header. Send workers race for the socket queue the way PUSH does,
//! so the request reaches one available peer. Replies are matched against
//! the outstanding ID and everything else is filtered out. A retry timer
//! resends the request to an available peer when no reply has arrived
//! within the configured window.

use futures::FutureExt;
use hashbrown::HashMap;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use spaceframe_core::options::{OPT_RAW, OPT_RETRY_TIME, OPT_TTL};
use spaceframe_core::waiter::Waiter;
use spaceframe_core::{Error, Message, OptionValue, Result};

use crate::endpoint::Endpoint;
use crate::proto::{Protocol, ProtocolSocket};
use crate::protocol::{append_id, leading_id};
use crate::socket::Socket;
use crate::wire::{PROTO_REP, PROTO_REQ};

const DEFAULT_RETRY: Duration = Duration::from_secs(60);

/// Hop limit bookkeeping, kept for symmetry with the answering side.
const DEFAULT_TTL: usize = 8;

struct ReqState {
    sock: RefCell<Option<ProtocolSocket>>,
    peers: RefCell<HashMap<u32, flume::Sender<()>>>,
    raw: Cell<bool>,
    retry_time: Cell<Duration>,
    ttl: Cell<usize>,
    next_id: Cell<u32>,
    req_id: Cell<u32>,
    pending: RefCell<Option<Message>>,
    resend_tx: flume::Sender<Message>,
    resend_rx: flume::Receiver<Message>,
    rearm_tx: flume::Sender<u32>,
    rearm_rx: flume::Receiver<u32>,
    waiter: Waiter,
}

/// The REQ engine.
pub struct Req {
    state: Rc<ReqState>,
}

impl Default for Req {
    fn default() -> Self {
        let (resend_tx, resend_rx) = flume::bounded(1);
        let (rearm_tx, rearm_rx) = flume::unbounded();
        Self {
            state: Rc::new(ReqState {
                sock: RefCell::new(None),
                peers: RefCell::new(HashMap::new()),
                raw: Cell::new(false),
                retry_time: Cell::new(DEFAULT_RETRY),
                ttl: Cell::new(DEFAULT_TTL),
                next_id: Cell::new(0),
                req_id: Cell::new(0),
                pending: RefCell::new(None),
                resend_tx,
                resend_rx,
                rearm_tx,
                rearm_rx,
                waiter: Waiter::new(),
            }),
        }
    }
}

/// A new socket speaking REQ.
#[must_use]
pub fn socket() -> Socket {
    Socket::new(Req::default())
}

/// Stable copy of a request for the retry path; the original is consumed
/// by whichever pipe wins it.
fn archive_copy(m: &Message) -> Message {
    let mut c = Message::with_capacity(m.body().len());
    c.header_mut().extend_from_slice(m.header());
    c.body_mut().extend_from_slice(m.body());
    c
}

async fn sender(
    state: Rc<ReqState>,
    psock: ProtocolSocket,
    ep: Endpoint,
    cq: flume::Receiver<()>,
    _guard: spaceframe_core::waiter::WaitGuard,
) {
    let closed = psock.closed();
    let Some(mut sq) = psock.send_queue() else {
        return;
    };
    let resend = state.resend_rx.clone();

    loop {
        futures::select! {
            _ = closed.recv_async().fuse() => return,
            _ = cq.recv_async().fuse() => return,
            m = resend.recv_async().fuse() => match m {
                Ok(m) => {
                    if ep.send_msg(m).await.is_err() {
                        return;
                    }
                }
                Err(_) => return,
            },
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
        let Some(mut m) = ep.recv_msg().await else {
            return;
        };
        if m.body().len() < 4 {
            continue;
        }
        // Surface the reply's request ID in the header for matching.
        let id = m.body_mut().split_to(4);
        m.header_mut().extend_from_slice(&id);

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

/// Resend outstanding requests whenever a retry window elapses without a
/// matching reply.
async fn retrier(
    state: Rc<ReqState>,
    psock: ProtocolSocket,
    _guard: spaceframe_core::waiter::WaitGuard,
) {
    let closed = psock.closed();
    let rearm = state.rearm_rx.clone();

    'idle: loop {
        let mut armed_id = futures::select! {
            _ = closed.recv_async().fuse() => return,
            id = rearm.recv_async().fuse() => match id {
                Ok(id) => id,
                Err(_) => return,
            },
        };

        loop {
            let window = state.retry_time.get();
            if window.is_zero() {
                continue 'idle;
            }
            futures::select! {
                _ = closed.recv_async().fuse() => return,
                id = rearm.recv_async().fuse() => match id {
                    Ok(id) => armed_id = id,
                    Err(_) => return,
                },
                _ = Box::pin(compio::time::sleep(window)).fuse() => {
                    if state.req_id.get() != armed_id {
                        continue 'idle;
                    }
                    let again = state.pending.borrow().as_ref().map(archive_copy);
                    match again {
                        // Full resend slot just means a retry is already
                        // waiting for a peer.
                        Some(m) => {
                            let _ = state.resend_tx.try_send(m);
                        }
                        None => continue 'idle,
                    }
                }
            }
        }
    }
}

impl Protocol for Req {
    fn init(&self, sock: ProtocolSocket) {
        *self.state.sock.borrow_mut() = Some(sock.clone());
        let guard = self.state.waiter.guard();
        compio::runtime::spawn(retrier(Rc::clone(&self.state), sock, guard)).detach();
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
        compio::runtime::spawn(sender(
            Rc::clone(&self.state),
            psock.clone(),
            ep.clone(),
            cq_rx,
            guard,
        ))
        .detach();
        compio::runtime::spawn(receiver(psock, ep)).detach();
    }

    fn remove_endpoint(&self, id: u32) {
        self.state.peers.borrow_mut().remove(&id);
    }

    fn number(&self) -> u16 {
        PROTO_REQ
    }

    fn peer_number(&self) -> u16 {
        PROTO_REP
    }

    fn name(&self) -> &'static str {
        "req"
    }

    fn peer_name(&self) -> &'static str {
        "rep"
    }

    fn set_option(&self, name: &str, value: OptionValue) -> Result<()> {
        match name {
            OPT_RAW => {
                self.state.raw.set(value.as_bool()?);
                Ok(())
            }
            OPT_RETRY_TIME => {
                self.state.retry_time.set(value.as_duration()?);
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
            OPT_RETRY_TIME => Ok(OptionValue::Duration(self.state.retry_time.get())),
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

    /// Cooked mode: stamp a fresh request ID and keep a copy for retries.
    /// A new request supersedes any unanswered one.
    fn send_hook(&self, msg: &mut Message) -> bool {
        if self.state.raw.get() {
            return true;
        }
        let id = self.state.next_id.get() | 0x8000_0000;
        self.state.next_id.set(self.state.next_id.get().wrapping_add(1));
        append_id(msg, id);

        self.state.req_id.set(id);
        *self.state.pending.borrow_mut() = Some(archive_copy(msg));
        if !self.state.retry_time.get().is_zero() {
            let _ = self.state.rearm_tx.send(id);
        }
        true
    }

    /// Cooked mode: admit only the reply to the outstanding request.
    fn recv_hook(&self, msg: &mut Message) -> bool {
        if self.state.raw.get() {
            return true;
        }
        let outstanding = self.state.req_id.get();
        if outstanding == 0 {
            return false;
        }
        match leading_id(msg.header()) {
            Some(id) if id == outstanding => {
                let _ = msg.header_mut().split_to(4);
                self.state.req_id.set(0);
                self.state.pending.borrow_mut().take();
                true
            }
            _ => false,
        }
    }
}
