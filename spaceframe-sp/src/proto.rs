//! The protocol engine seam.
//!
//! Every messaging pattern is one [`Protocol`] implementation bound to a
//! socket at construction. The socket core stays pattern-agnostic: it moves
//! messages between the application and the engine through bounded queues,
//! and the engine moves them between those queues and its endpoints.
//!
//! Engines talk back to their socket exclusively through the
//! [`ProtocolSocket`] handle: fetching the current queues, watching the
//! close gate, latching errors, and reading socket options. The queue
//! accessors return `None` once the socket is gone; the queues themselves
//! disconnect when replaced, and an engine that observes a disconnect
//! re-fetches before concluding anything.

use futures::future::LocalBoxFuture;
use std::rc::Weak;
use std::time::Instant;

use spaceframe_core::{Error, Message, OptionValue, Result};

use crate::endpoint::Endpoint;
use crate::socket::SocketCore;

/// A messaging pattern state machine.
pub trait Protocol {
    /// Bind to the socket. Called exactly once, before any traffic; engines
    /// keep the handle and usually start their distributor task here.
    fn init(&self, sock: ProtocolSocket);

    /// Drain toward `deadline` during socket close: wait for worker tasks,
    /// then flush and drop remaining per-peer queues. The returned future
    /// owns everything it needs so the engine stays callable meanwhile.
    fn shutdown(&self, deadline: Instant) -> LocalBoxFuture<'static, ()>;

    /// Adopt a newly registered pipe. The engine spawns whatever workers
    /// the pattern needs; an unwanted pipe is closed instead.
    fn add_endpoint(&self, ep: Endpoint);

    /// Forget a pipe that closed or was vetoed. Must tolerate IDs it never
    /// adopted.
    fn remove_endpoint(&self, id: u32);

    /// Our 16-bit SP protocol number.
    fn number(&self) -> u16;

    /// The SP protocol number peers must present.
    fn peer_number(&self) -> u16;

    fn name(&self) -> &'static str;

    fn peer_name(&self) -> &'static str;

    /// Engine-specific options; unrecognized names are `BadOption` so the
    /// socket can fall through to its own table.
    fn set_option(&self, _name: &str, _value: OptionValue) -> Result<()> {
        Err(Error::BadOption)
    }

    fn get_option(&self, _name: &str) -> Result<OptionValue> {
        Err(Error::BadOption)
    }

    /// Whether [`send_hook`](Self::send_hook) should be invoked. The socket
    /// asks once at bind time and never again.
    fn has_send_hook(&self) -> bool {
        false
    }

    /// Whether [`recv_hook`](Self::recv_hook) should be invoked. The socket
    /// asks once at bind time and never again.
    fn has_recv_hook(&self) -> bool {
        false
    }

    /// Runs on the application's send path before queueing. Returning false
    /// swallows the message; the send still reports success.
    fn send_hook(&self, _msg: &mut Message) -> bool {
        true
    }

    /// Runs on the application's receive path after dequeueing. Returning
    /// false drops the message and the receive keeps waiting.
    fn recv_hook(&self, _msg: &mut Message) -> bool {
        true
    }
}

/// The engine's view of its socket.
#[derive(Clone)]
pub struct ProtocolSocket {
    core: Weak<SocketCore>,
}

impl ProtocolSocket {
    pub(crate) fn new(core: Weak<SocketCore>) -> Self {
        Self { core }
    }

    /// The consuming side of the application send queue. Re-fetch after a
    /// disconnected read: the queue is replaced when its depth option
    /// changes, and `None` means the socket itself is gone.
    #[must_use]
    pub fn send_queue(&self) -> Option<flume::Receiver<Message>> {
        self.core.upgrade().map(|c| c.send_queue_rx())
    }

    /// The producing side of the application receive queue. Same re-fetch
    /// contract as [`send_queue`](Self::send_queue).
    #[must_use]
    pub fn recv_queue(&self) -> Option<flume::Sender<Message>> {
        self.core.upgrade().map(|c| c.recv_queue_tx())
    }

    /// A receiver that errors out as soon as the socket starts closing.
    /// Every engine worker selects on this and exits promptly.
    #[must_use]
    pub fn closed(&self) -> flume::Receiver<()> {
        match self.core.upgrade() {
            Some(c) => c.close_watch(),
            None => {
                let (_, rx) = flume::bounded(0);
                rx
            }
        }
    }

    /// Latch (or with `None`, clear) the error every subsequent send
    /// reports immediately.
    pub fn set_send_error(&self, err: Option<Error>) {
        if let Some(c) = self.core.upgrade() {
            c.set_send_error(err);
        }
    }

    /// Latch (or clear) the error every subsequent receive reports. Also
    /// wakes a receive already in progress.
    pub fn set_recv_error(&self, err: Option<Error>) {
        if let Some(c) = self.core.upgrade() {
            c.set_recv_error(err);
        }
    }

    /// Read a socket-level option, e.g. the write queue depth engines use
    /// to size per-peer queues.
    pub fn get_option(&self, name: &str) -> Result<OptionValue> {
        match self.core.upgrade() {
            Some(c) => c.get_socket_option(name),
            None => Err(Error::Closed),
        }
    }

    /// The per-peer queue depth in force: the socket's write queue length,
    /// or the engine default of 16.
    #[must_use]
    pub fn peer_queue_depth(&self) -> usize {
        self.get_option(spaceframe_core::options::OPT_WRITEQ_LEN)
            .ok()
            .and_then(|v| v.as_int().ok())
            .map_or(16, |n| n.max(0) as usize)
    }
}

/// Receive and discard until the pipe dies. Send-only engines run this per
/// endpoint so a disconnect is still noticed without any inbound traffic
/// being surfaced.
pub async fn null_recv(ep: Endpoint) {
    while ep.recv_msg().await.is_some() {}
}
