//! SURVEYOR: broadcast a question, gather answers for a bounded window.
//!
//! Each survey gets a fresh 32-bit ID (high bit set) appended to its
//! header and goes out to every peer at once. While the survey window is
//! open, responses bearing the current ID come through and everything else
//! is silently dropped; when the window expires, receives report that the
//! survey is over. Starting a new survey abandons the old one.

use futures::FutureExt;
use hashbrown::HashMap;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use spaceframe_core::options::{OPT_RAW, OPT_SURVEY_TIME, OPT_TTL};
use spaceframe_core::waiter::{drain_queue, Waiter};
use spaceframe_core::{Error, Message, OptionValue, Result};

use crate::endpoint::Endpoint;
use crate::proto::{Protocol, ProtocolSocket};
use crate::protocol::{append_id, leading_id};
use crate::socket::Socket;
use crate::wire::{PROTO_RESPONDENT, PROTO_SURVEYOR};

const DEFAULT_SURVEY_TIME: Duration = Duration::from_secs(1);

struct SurveyorState {
    sock: RefCell<Option<ProtocolSocket>>,
    peers: RefCell<HashMap<u32, flume::Sender<Message>>>,
    raw: Cell<bool>,
    next_id: Cell<u32>,
    survey_id: Cell<u32>,
    duration: Cell<Duration>,
    ttl: Cell<usize>,
    rearm_tx: flume::Sender<(u32, Duration)>,
    rearm_rx: flume::Receiver<(u32, Duration)>,
    waiter: Waiter,
}

/// The SURVEYOR engine.
pub struct Surveyor {
    state: Rc<SurveyorState>,
}

impl Default for Surveyor {
    fn default() -> Self {
        let (rearm_tx, rearm_rx) = flume::unbounded();
        Self {
            state: Rc::new(SurveyorState {
                sock: RefCell::new(None),
                peers: RefCell::new(HashMap::new()),
                raw: Cell::new(false),
                next_id: Cell::new(0),
                survey_id: Cell::new(0),
                duration: Cell::new(DEFAULT_SURVEY_TIME),
                ttl: Cell::new(8),
                rearm_tx,
                rearm_rx,
                waiter: Waiter::new(),
            }),
        }
    }
}

/// A new socket speaking SURVEYOR.
#[must_use]
pub fn socket() -> Socket {
    Socket::new(Surveyor::default())
}

async fn distributor(
    state: Rc<SurveyorState>,
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
                        // A peer still chewing on the last survey misses
                        // this one.
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

async fn peer_sender(ep: Endpoint, q: flume::Receiver<Message>) {
    while let Ok(m) = q.recv_async().await {
        if ep.send_msg(m).await.is_err() {
            return;
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
        // The survey ID travels up in the header; matching happens at the
        // receive hook under the engine state.
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

/// Close the receive window when a survey's timer fires, unless a newer
/// survey has been started since it was armed.
async fn window_timer(
    state: Rc<SurveyorState>,
    psock: ProtocolSocket,
    _guard: spaceframe_core::waiter::WaitGuard,
) {
    let closed = psock.closed();
    let rearm = state.rearm_rx.clone();

    'idle: loop {
        let (mut armed_id, mut window) = futures::select! {
            _ = closed.recv_async().fuse() => return,
            a = rearm.recv_async().fuse() => match a {
                Ok(a) => a,
                Err(_) => return,
            },
        };

        loop {
            futures::select! {
                _ = closed.recv_async().fuse() => return,
                a = rearm.recv_async().fuse() => match a {
                    Ok((id, d)) => {
                        armed_id = id;
                        window = d;
                    }
                    Err(_) => return,
                },
                _ = Box::pin(compio::time::sleep(window)).fuse() => {
                    if state.survey_id.get() == armed_id && !state.raw.get() {
                        psock.set_recv_error(Some(Error::ProtoState));
                    }
                    continue 'idle;
                }
            }
        }
    }
}

impl Protocol for Surveyor {
    fn init(&self, sock: ProtocolSocket) {
        sock.set_recv_error(Some(Error::ProtoState));
        *self.state.sock.borrow_mut() = Some(sock.clone());

        let g1 = self.state.waiter.guard();
        compio::runtime::spawn(distributor(Rc::clone(&self.state), sock.clone(), g1)).detach();
        let g2 = self.state.waiter.guard();
        compio::runtime::spawn(window_timer(Rc::clone(&self.state), sock, g2)).detach();
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
        let (q_tx, q_rx) = flume::bounded(1);
        self.state.peers.borrow_mut().insert(ep.id(), q_tx);

        compio::runtime::spawn(receiver(psock, ep.clone())).detach();
        compio::runtime::spawn(peer_sender(ep, q_rx)).detach();
    }

    fn remove_endpoint(&self, id: u32) {
        self.state.peers.borrow_mut().remove(&id);
    }

    fn number(&self) -> u16 {
        PROTO_SURVEYOR
    }

    fn peer_number(&self) -> u16 {
        PROTO_RESPONDENT
    }

    fn name(&self) -> &'static str {
        "surveyor"
    }

    fn peer_name(&self) -> &'static str {
        "respondent"
    }

    fn set_option(&self, name: &str, value: OptionValue) -> Result<()> {
        match name {
            OPT_RAW => {
                let raw = value.as_bool()?;
                self.state.raw.set(raw);
                if let Some(psock) = self.state.sock.borrow().clone() {
                    psock.set_recv_error(if raw { None } else { Some(Error::ProtoState) });
                }
                Ok(())
            }
            OPT_SURVEY_TIME => {
                self.state.duration.set(value.as_duration()?);
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
            OPT_SURVEY_TIME => Ok(OptionValue::Duration(self.state.duration.get())),
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

    /// Cooked mode: open a new survey window.
    fn send_hook(&self, msg: &mut Message) -> bool {
        if self.state.raw.get() {
            return true;
        }
        let id = self.state.next_id.get() | 0x8000_0000;
        self.state.next_id.set(self.state.next_id.get().wrapping_add(1));
        self.state.survey_id.set(id);
        append_id(msg, id);

        if let Some(psock) = self.state.sock.borrow().clone() {
            psock.set_recv_error(None);
        }
        let window = self.state.duration.get();
        if !window.is_zero() {
            let _ = self.state.rearm_tx.send((id, window));
        }
        true
    }

    /// Cooked mode: admit only responses to the current survey.
    fn recv_hook(&self, msg: &mut Message) -> bool {
        if self.state.raw.get() {
            return true;
        }
        match leading_id(msg.header()) {
            Some(id) if id == self.state.survey_id.get() => {
                let _ = msg.header_mut().split_to(4);
                true
            }
            _ => false,
        }
    }
}
