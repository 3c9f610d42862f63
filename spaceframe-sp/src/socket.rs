//! The socket core.
//!
//! A socket couples one protocol engine to any number of pipes. The core
//! itself is pattern-blind: it owns the two application-facing bounded
//! queues, the option store, the transport registry, the pipe registry with
//! its 31-bit IDs, and the close machinery. Everything pattern-specific
//! lives behind the [`Protocol`] trait.
//!
//! Blocking points are explicit: queue transfers, the close gate, and the
//! per-operation deadline timers. State shared between tasks sits in one
//! `RefCell` that is never held across an await.

use futures::future::Either;
use futures::FutureExt;
use hashbrown::HashMap;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

use spaceframe_core::options::{
    OPT_BEST_EFFORT, OPT_LINGER, OPT_MAX_RECONNECT_TIME, OPT_MAX_RECV_SIZE, OPT_READQ_LEN,
    OPT_RECONNECT_TIME, OPT_RECV_DEADLINE, OPT_SEND_DEADLINE, OPT_WRITEQ_LEN,
};
use spaceframe_core::waiter::drain_queue;
use spaceframe_core::{Error, Message, OptionValue, Result};

use crate::dialer::Dialer;
use crate::endpoint::{Endpoint, PortAction, PortHook};
use crate::listener::Listener;
use crate::pipe::{PipeConfig, RawPipe};
use crate::proto::{Protocol, ProtocolSocket};
use crate::transport::Transport;

/// Default depth for the send and receive queues.
const DEFAULT_QLEN: usize = 128;

/// Default inbound frame limit.
const DEFAULT_MAX_RECV_SIZE: usize = 1024 * 1024;

pub(crate) struct State {
    wq: (flume::Sender<Message>, flume::Receiver<Message>),
    rq: (flume::Sender<Message>, flume::Receiver<Message>),
    wq_len: usize,
    rq_len: usize,
    close_tx: Option<flume::Sender<()>>,
    closing: bool,
    active: bool,
    best_effort: bool,
    send_err: Option<Error>,
    recv_err: Option<Error>,
    rdeadline: Duration,
    wdeadline: Duration,
    reconn_time: Duration,
    reconn_max: Duration,
    linger: Duration,
    max_recv_size: usize,
    next_pipe_id: u32,
    pipes: HashMap<u32, Endpoint>,
    listeners: Vec<Listener>,
    transports: HashMap<&'static str, Rc<dyn Transport>>,
    port_hook: Option<PortHook>,
}

pub struct SocketCore {
    proto: Box<dyn Protocol>,
    self_weak: Weak<SocketCore>,
    close_rx: flume::Receiver<()>,
    recverrq_tx: flume::Sender<()>,
    recverrq_rx: flume::Receiver<()>,
    send_hooked: Cell<bool>,
    recv_hooked: Cell<bool>,
    state: RefCell<State>,
}

/// The application-facing socket handle. Clones refer to the same socket.
#[derive(Clone)]
pub struct Socket {
    core: Rc<SocketCore>,
}

impl Socket {
    /// Bind `proto` into a fresh socket with the built-in transports
    /// registered. The engine's `init` runs before this returns.
    pub fn new(proto: impl Protocol + 'static) -> Self {
        Self::with_protocol(Box::new(proto))
    }

    pub fn with_protocol(proto: Box<dyn Protocol>) -> Self {
        let (close_tx, close_rx) = flume::bounded(0);
        let (recverrq_tx, recverrq_rx) = flume::bounded(1);

        let mut transports: HashMap<&'static str, Rc<dyn Transport>> = HashMap::new();
        for t in crate::transport::defaults() {
            transports.insert(t.scheme(), t);
        }

        let core = Rc::new_cyclic(|weak: &Weak<SocketCore>| SocketCore {
            proto,
            self_weak: weak.clone(),
            close_rx,
            recverrq_tx,
            recverrq_rx,
            send_hooked: Cell::new(false),
            recv_hooked: Cell::new(false),
            state: RefCell::new(State {
                wq: flume::bounded(DEFAULT_QLEN),
                rq: flume::bounded(DEFAULT_QLEN),
                wq_len: DEFAULT_QLEN,
                rq_len: DEFAULT_QLEN,
                close_tx: Some(close_tx),
                closing: false,
                active: false,
                best_effort: false,
                send_err: None,
                recv_err: None,
                rdeadline: Duration::ZERO,
                wdeadline: Duration::ZERO,
                reconn_time: Duration::from_millis(100),
                reconn_max: Duration::ZERO,
                linger: Duration::from_secs(1),
                max_recv_size: DEFAULT_MAX_RECV_SIZE,
                next_pipe_id: 0,
                pipes: HashMap::new(),
                listeners: Vec::new(),
                transports,
                port_hook: None,
            }),
        });

        // Hook capabilities are queried exactly once, here.
        core.send_hooked.set(core.proto.has_send_hook());
        core.recv_hooked.set(core.proto.has_recv_hook());
        core.proto.init(ProtocolSocket::new(core.self_weak.clone()));

        Self { core }
    }

    /// Register (or replace) a transport for its scheme.
    pub fn add_transport(&self, t: Rc<dyn Transport>) {
        self.core.state.borrow_mut().transports.insert(t.scheme(), t);
    }

    /// The engine bound to this socket.
    #[must_use]
    pub fn protocol(&self) -> &dyn Protocol {
        self.core.proto.as_ref()
    }

    /// Create a dialer for `addr` without starting it.
    pub fn new_dialer(&self, addr: &str, opts: &[(&str, OptionValue)]) -> Result<Dialer> {
        let t = self.core.lookup_transport(addr)?;
        let mut td = t.new_dialer(addr)?;
        for (name, value) in opts {
            td.set_option(name, value.clone())?;
        }
        Ok(Dialer::new(self.core.self_weak.clone(), addr.to_string(), td))
    }

    /// Dial `addr` and keep redialing whenever the connection drops.
    pub fn dial(&self, addr: &str) -> Result<()> {
        self.dial_options(addr, &[])
    }

    pub fn dial_options(&self, addr: &str, opts: &[(&str, OptionValue)]) -> Result<()> {
        self.new_dialer(addr, opts)?.dial()
    }

    /// Create a listener for `addr` without binding it.
    pub fn new_listener(&self, addr: &str, opts: &[(&str, OptionValue)]) -> Result<Listener> {
        let t = self.core.lookup_transport(addr)?;
        let mut tl = t.new_listener(addr)?;
        for (name, value) in opts {
            tl.set_option(name, value.clone())?;
        }
        Ok(Listener::new(
            self.core.self_weak.clone(),
            addr.to_string(),
            tl,
        ))
    }

    /// Bind `addr` and start accepting peers. Bind errors surface here;
    /// accept errors are the supervisor's problem.
    pub async fn listen(&self, addr: &str) -> Result<()> {
        self.listen_options(addr, &[]).await
    }

    pub async fn listen_options(&self, addr: &str, opts: &[(&str, OptionValue)]) -> Result<()> {
        self.new_listener(addr, opts)?.listen().await
    }

    /// Send a copy of `body` as one message.
    pub async fn send(&self, body: &[u8]) -> Result<()> {
        self.send_msg(Message::from_body(body)).await
    }

    /// Send a message, header included. Ownership passes to the socket.
    pub async fn send_msg(&self, mut msg: Message) -> Result<()> {
        let core = &self.core;

        if let Some(e) = core.state.borrow().send_err.clone() {
            return Err(e);
        }

        if core.send_hooked.get() && !core.proto.send_hook(&mut msg) {
            // The engine ate it; that is success.
            return Ok(());
        }

        let (best_effort, wdeadline, wq_tx) = {
            let st = core.state.borrow();
            (st.best_effort, st.wdeadline, st.wq.0.clone())
        };

        msg.set_expire(if wdeadline.is_zero() {
            None
        } else {
            Some(Instant::now() + wdeadline)
        });

        let closed = core.close_rx.clone();

        if best_effort {
            if core.state.borrow().closing {
                return Err(Error::Closed);
            }
            // Full queue means silent drop.
            let _ = wq_tx.try_send(msg);
            return Ok(());
        }

        let timer = match wdeadline.is_zero() {
            true => Either::Left(futures::future::pending::<()>()),
            false => Either::Right(Box::pin(compio::time::sleep(wdeadline))),
        };
        futures::pin_mut!(timer);

        futures::select! {
            _ = timer.fuse() => Err(Error::SendTimeout),
            _ = closed.recv_async().fuse() => Err(Error::Closed),
            res = wq_tx.send_async(msg).fuse() => res.map_err(|_| Error::Closed),
        }
    }

    /// Receive the body of the next message.
    pub async fn recv(&self) -> Result<Vec<u8>> {
        let msg = self.recv_msg().await?;
        Ok(msg.body().to_vec())
    }

    /// Receive the next message whole, header and all. Useful in raw mode.
    pub async fn recv_msg(&self) -> Result<Message> {
        let core = &self.core;

        // One deadline budget for the whole call, however many messages the
        // engine's hook rejects along the way.
        let rdeadline = core.state.borrow().rdeadline;
        let timer = match rdeadline.is_zero() {
            true => Either::Left(futures::future::pending::<()>()),
            false => Either::Right(Box::pin(compio::time::sleep(rdeadline))),
        };
        futures::pin_mut!(timer);
        let mut timer = timer.fuse();

        let closed = core.close_rx.clone();
        let errq = core.recverrq_rx.clone();

        loop {
            if let Some(e) = core.state.borrow().recv_err.clone() {
                return Err(e);
            }

            let rq_rx = core.state.borrow().rq.1.clone();

            futures::select! {
                _ = timer => return Err(Error::RecvTimeout),
                _ = closed.recv_async().fuse() => return Err(Error::Closed),
                _ = errq.recv_async().fuse() => continue,
                m = rq_rx.recv_async().fuse() => match m {
                    Ok(mut m) => {
                        if core.recv_hooked.get() && !core.proto.recv_hook(&mut m) {
                            continue;
                        }
                        return Ok(m);
                    }
                    // Queue replaced under us; fetch the new one next pass.
                    Err(_) => continue,
                },
            }
        }
    }

    /// Linger-aware close. Waits up to the linger budget for queued sends
    /// to drain, lets the engine flush, then tears down every pipe.
    /// A second call reports `Closed`.
    pub async fn close(&self) -> Result<()> {
        let core = &self.core;

        let (linger, wq_tx) = {
            let st = core.state.borrow();
            (st.linger, st.wq.0.clone())
        };
        let fin = Instant::now() + linger;

        drain_queue(&wq_tx, fin).await;

        let (listeners, pipes) = {
            let mut st = core.state.borrow_mut();
            if st.closing {
                return Err(Error::Closed);
            }
            st.closing = true;
            st.close_tx.take();
            (
                std::mem::take(&mut st.listeners),
                st.pipes.values().cloned().collect::<Vec<_>>(),
            )
        };
        debug!(pipes = pipes.len(), "socket closing");

        for l in &listeners {
            l.close_transport();
        }

        drain_queue(&wq_tx, fin).await;

        core.proto.shutdown(fin).await;

        for p in pipes {
            p.close();
        }
        Ok(())
    }

    /// Set an option, engine first, socket table second.
    pub fn set_option(&self, name: &str, value: impl Into<OptionValue>) -> Result<()> {
        let value = value.into();
        let matched = match self.core.proto.set_option(name, value.clone()) {
            Ok(()) => true,
            Err(Error::BadOption) => false,
            Err(e) => return Err(e),
        };
        match self.core.set_socket_option(name, &value) {
            Ok(()) => Ok(()),
            Err(Error::BadOption) if matched => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Read an option, engine first, socket table second.
    pub fn get_option(&self, name: &str) -> Result<OptionValue> {
        match self.core.proto.get_option(name) {
            Ok(v) => Ok(v),
            Err(Error::BadOption) => self.core.get_socket_option(name),
            Err(e) => Err(e),
        }
    }

    /// Install a port hook, returning the previous one.
    pub fn set_port_hook(&self, hook: Option<PortHook>) -> Option<PortHook> {
        std::mem::replace(&mut self.core.state.borrow_mut().port_hook, hook)
    }
}

impl SocketCore {
    // --- engine-facing surface -------------------------------------------

    pub(crate) fn send_queue_rx(&self) -> flume::Receiver<Message> {
        self.state.borrow().wq.1.clone()
    }

    pub(crate) fn recv_queue_tx(&self) -> flume::Sender<Message> {
        self.state.borrow().rq.0.clone()
    }

    pub(crate) fn close_watch(&self) -> flume::Receiver<()> {
        self.close_rx.clone()
    }

    pub(crate) fn set_send_error(&self, err: Option<Error>) {
        self.state.borrow_mut().send_err = err;
    }

    pub(crate) fn set_recv_error(&self, err: Option<Error>) {
        self.state.borrow_mut().recv_err = err;
        // Wake a receive already parked on the queue.
        let _ = self.recverrq_tx.try_send(());
    }

    // --- supervisor-facing surface ---------------------------------------

    pub(crate) fn is_closing(&self) -> bool {
        self.state.borrow().closing
    }

    pub(crate) fn mark_active(&self) {
        self.state.borrow_mut().active = true;
    }

    pub(crate) fn reconnect_times(&self) -> (Duration, Duration) {
        let st = self.state.borrow();
        (st.reconn_time, st.reconn_max)
    }

    pub(crate) fn pipe_config(&self) -> PipeConfig {
        PipeConfig {
            local_proto: self.proto.number(),
            peer_proto: self.proto.peer_number(),
            max_recv_size: self.state.borrow().max_recv_size,
        }
    }

    pub(crate) fn register_listener(&self, l: Listener) {
        self.state.borrow_mut().listeners.push(l);
    }

    /// Adopt a connected pipe: consult the port hook, assign an ID, record
    /// it, and hand it to the engine. Returns `None` when the pipe was
    /// rejected (already closed) or the socket is shutting down.
    pub(crate) fn add_pipe(
        core: &Rc<Self>,
        raw: RawPipe,
        addr: String,
        client: bool,
        dial_gate: Option<flume::Sender<()>>,
    ) -> Option<Endpoint> {
        let (id, hook) = {
            let mut st = core.state.borrow_mut();
            if st.closing {
                drop(st);
                raw.closer.close();
                return None;
            }
            (Self::next_pipe_id(&mut st), st.port_hook.clone())
        };

        let ep = Endpoint::new(
            core.self_weak.clone(),
            id,
            raw,
            addr,
            client,
            core.proto.number(),
            core.proto.peer_number(),
            dial_gate,
        );

        if let Some(hook) = hook {
            if !hook(PortAction::Add, &ep) {
                debug!(pipe = id, "pipe vetoed by port hook");
                ep.close();
                return None;
            }
        }

        core.state.borrow_mut().pipes.insert(id, ep.clone());
        debug!(pipe = id, addr = ep.address(), client, "pipe registered");
        core.proto.add_endpoint(ep.clone());
        Some(ep)
    }

    /// Unregister a pipe after it closed: the engine first, then the
    /// registry, then the port hook.
    pub(crate) fn rem_pipe(core: &Rc<Self>, id: u32) {
        core.proto.remove_endpoint(id);
        let (removed, hook) = {
            let mut st = core.state.borrow_mut();
            (st.pipes.remove(&id), st.port_hook.clone())
        };
        if let Some(ep) = removed {
            debug!(pipe = id, "pipe unregistered");
            if let Some(hook) = hook {
                let _ = hook(PortAction::Remove, &ep);
            }
        }
    }

    fn next_pipe_id(st: &mut State) -> u32 {
        loop {
            st.next_pipe_id = st.next_pipe_id.wrapping_add(1) & 0x7FFF_FFFF;
            if st.next_pipe_id != 0 && !st.pipes.contains_key(&st.next_pipe_id) {
                return st.next_pipe_id;
            }
        }
    }

    fn lookup_transport(&self, addr: &str) -> Result<Rc<dyn Transport>> {
        let scheme = addr.split_once("://").map(|(s, _)| s).ok_or(Error::BadTran)?;
        self.state
            .borrow()
            .transports
            .get(scheme)
            .cloned()
            .ok_or(Error::BadTran)
    }

    // --- option tables ----------------------------------------------------

    pub(crate) fn set_socket_option(&self, name: &str, value: &OptionValue) -> Result<()> {
        let mut st = self.state.borrow_mut();
        match name {
            OPT_RECV_DEADLINE => {
                st.rdeadline = value.as_duration()?;
                Ok(())
            }
            OPT_SEND_DEADLINE => {
                st.wdeadline = value.as_duration()?;
                Ok(())
            }
            OPT_LINGER => {
                st.linger = value.as_duration()?;
                Ok(())
            }
            OPT_RECONNECT_TIME => {
                st.reconn_time = value.as_duration()?;
                Ok(())
            }
            OPT_MAX_RECONNECT_TIME => {
                st.reconn_max = value.as_duration()?;
                Ok(())
            }
            OPT_WRITEQ_LEN => {
                if st.active {
                    return Err(Error::BadOption);
                }
                let len = value.as_int()?;
                if len < 0 {
                    return Err(Error::BadValue);
                }
                st.wq_len = len as usize;
                // Replacing the pair disconnects the old queue; engines
                // notice and re-fetch.
                st.wq = flume::bounded(st.wq_len);
                Ok(())
            }
            OPT_READQ_LEN => {
                if st.active {
                    return Err(Error::BadOption);
                }
                let len = value.as_int()?;
                if len < 0 {
                    return Err(Error::BadValue);
                }
                st.rq_len = len as usize;
                st.rq = flume::bounded(st.rq_len);
                Ok(())
            }
            OPT_MAX_RECV_SIZE => {
                let sz = value.as_int()?;
                if sz < 0 {
                    return Err(Error::BadValue);
                }
                st.max_recv_size = sz as usize;
                Ok(())
            }
            OPT_BEST_EFFORT => {
                st.best_effort = value.as_bool()?;
                Ok(())
            }
            _ => Err(Error::BadOption),
        }
    }

    pub(crate) fn get_socket_option(&self, name: &str) -> Result<OptionValue> {
        let st = self.state.borrow();
        match name {
            OPT_RECV_DEADLINE => Ok(OptionValue::Duration(st.rdeadline)),
            OPT_SEND_DEADLINE => Ok(OptionValue::Duration(st.wdeadline)),
            OPT_LINGER => Ok(OptionValue::Duration(st.linger)),
            OPT_RECONNECT_TIME => Ok(OptionValue::Duration(st.reconn_time)),
            OPT_MAX_RECONNECT_TIME => Ok(OptionValue::Duration(st.reconn_max)),
            OPT_WRITEQ_LEN => Ok(OptionValue::Int(st.wq_len as i64)),
            OPT_READQ_LEN => Ok(OptionValue::Int(st.rq_len as i64)),
            OPT_MAX_RECV_SIZE => Ok(OptionValue::Int(st.max_recv_size as i64)),
            OPT_BEST_EFFORT => Ok(OptionValue::Bool(st.best_effort)),
            _ => Err(Error::BadOption),
        }
    }
}
