//! In-process transport.
//!
//! Addresses look like `inproc://name`. A process-wide registry maps each
//! name to the listener currently bound to it; dialers wait until that
//! listener has queued an accepter slot, then wire the two ends together
//! with a pair of rendezvous channels, one per direction.
//!
//! There is no handshake on this transport, but protocol compatibility is
//! still enforced against the listener's registration before a slot is
//! taken. Every send allocates a fresh message with the header and body
//! concatenated, severing ownership between the two sockets exactly as a
//! byte stream would.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

use spaceframe_core::{Error, Message, Result};

use crate::pipe::{PipeCloser, PipeConfig, PipeProps, PipeRx, PipeTx, RawPipe};
use crate::transport::{strip_scheme, TranDialer, TranListener, Transport};

/// One accepter slot pre-queued by a listener: the dialer-facing channel
/// ends plus the signal that tells the accepter its slot was taken.
struct Slot {
    to_server: flume::Sender<Message>,
    from_server: flume::Receiver<Message>,
    ready: flume::Sender<()>,
}

#[derive(Clone)]
struct Entry {
    listener_id: u64,
    local_proto: u16,
    peer_proto: u16,
    slots: flume::Receiver<Slot>,
}

static REGISTRY: Lazy<DashMap<String, Entry>> = Lazy::new(DashMap::new);

static LISTENER_IDS: AtomicU64 = AtomicU64::new(1);

/// Per-side close signal. Dropping the sender wakes everything selecting on
/// the receiver.
#[derive(Clone)]
struct Gate {
    tx: Arc<Mutex<Option<flume::Sender<()>>>>,
    rx: flume::Receiver<()>,
}

impl Gate {
    fn new() -> Self {
        let (tx, rx) = flume::bounded(1);
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
            rx,
        }
    }

    fn close(&self) {
        self.tx.lock().expect("inproc gate poisoned").take();
    }
}

struct InprocTx {
    tx: flume::Sender<Message>,
    gate: Gate,
}

#[async_trait(?Send)]
impl PipeTx for InprocTx {
    async fn send_msg(&mut self, msg: Message) -> Result<()> {
        if msg.expired() {
            return Ok(());
        }

        // Receivers expect to split header from body themselves, so flatten
        // into a fresh buffer the peer owns outright.
        let mut fresh = Message::with_capacity(msg.wire_len());
        fresh.body_mut().extend_from_slice(msg.header());
        fresh.body_mut().extend_from_slice(msg.body());

        let closed = self.gate.rx.clone();
        futures::select! {
            res = self.tx.send_async(fresh).fuse() => res.map_err(|_| Error::Closed),
            _ = closed.recv_async().fuse() => Err(Error::Closed),
        }
    }
}

struct InprocRx {
    rx: flume::Receiver<Message>,
    gate: Gate,
}

#[async_trait(?Send)]
impl PipeRx for InprocRx {
    async fn recv_msg(&mut self) -> Result<Message> {
        let closed = self.gate.rx.clone();
        futures::select! {
            res = self.rx.recv_async().fuse() => res.map_err(|_| Error::Closed),
            _ = closed.recv_async().fuse() => Err(Error::Closed),
        }
    }
}

struct InprocCloser {
    gate: Gate,
}

impl PipeCloser for InprocCloser {
    fn close(&self) {
        self.gate.close();
    }
}

fn make_pipe(
    name: &str,
    tx: flume::Sender<Message>,
    rx: flume::Receiver<Message>,
) -> RawPipe {
    let gate = Gate::new();
    let addr = format!("inproc://{name}");
    RawPipe {
        tx: Box::new(InprocTx {
            tx,
            gate: gate.clone(),
        }),
        rx: Box::new(InprocRx {
            rx,
            gate: gate.clone(),
        }),
        closer: Box::new(InprocCloser { gate }),
        props: PipeProps {
            local_addr: addr.clone(),
            remote_addr: addr,
        },
    }
}

struct InprocDialer {
    name: String,
}

#[async_trait(?Send)]
impl TranDialer for InprocDialer {
    async fn dial(&self, config: &PipeConfig) -> Result<RawPipe> {
        loop {
            // Revalidated on every pass: the listener can vanish while we
            // wait for a slot.
            let (slots, local, peer) = match REGISTRY.get(&self.name) {
                Some(e) => (e.slots.clone(), e.local_proto, e.peer_proto),
                None => return Err(Error::ConnRefused),
            };
            if config.local_proto != peer || config.peer_proto != local {
                return Err(Error::BadProto);
            }

            let Ok(slot) = slots.recv_async().await else {
                continue;
            };
            if slot.ready.send(()).is_err() {
                // The accepter abandoned this slot; try for another.
                continue;
            }
            debug!(name = %self.name, "inproc connected");
            return Ok(make_pipe(&self.name, slot.to_server, slot.from_server));
        }
    }
}

struct InprocTranListener {
    name: String,
    id: u64,
    slots_tx: flume::Sender<Slot>,
    slots_rx: flume::Receiver<Slot>,
    closed: Gate,
}

#[async_trait(?Send)]
impl TranListener for InprocTranListener {
    async fn bind(&mut self, config: &PipeConfig) -> Result<()> {
        let entry = Entry {
            listener_id: self.id,
            local_proto: config.local_proto,
            peer_proto: config.peer_proto,
            slots: self.slots_rx.clone(),
        };
        match REGISTRY.entry(self.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::AddrInUse),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(entry);
                debug!(name = %self.name, "inproc bound");
                Ok(())
            }
        }
    }

    async fn accept(&self, _config: &PipeConfig) -> Result<RawPipe> {
        let (c2s_tx, c2s_rx) = flume::bounded::<Message>(0);
        let (s2c_tx, s2c_rx) = flume::bounded::<Message>(0);
        let (ready_tx, ready_rx) = flume::bounded::<()>(1);

        let slot = Slot {
            to_server: c2s_tx,
            from_server: s2c_rx,
            ready: ready_tx,
        };
        self.slots_tx.send(slot).map_err(|_| Error::Closed)?;

        let closed = self.closed.rx.clone();
        futures::select! {
            res = ready_rx.recv_async().fuse() => match res {
                Ok(()) => {
                    debug!(name = %self.name, "inproc accepted");
                    Ok(make_pipe(&self.name, s2c_tx, c2s_rx))
                }
                Err(_) => Err(Error::Closed),
            },
            _ = closed.recv_async().fuse() => Err(Error::Closed),
        }
    }

    fn close(&self) {
        REGISTRY.remove_if(&self.name, |_, e| e.listener_id == self.id);
        self.closed.close();
    }

    fn address(&self) -> String {
        format!("inproc://{}", self.name)
    }
}

/// The `inproc://` transport.
pub struct InprocTransport;

impl Transport for InprocTransport {
    fn scheme(&self) -> &'static str {
        "inproc"
    }

    fn new_dialer(&self, addr: &str) -> Result<Box<dyn TranDialer>> {
        let name = strip_scheme(self.scheme(), addr)?;
        if name.is_empty() {
            return Err(Error::BadAddr);
        }
        Ok(Box::new(InprocDialer {
            name: name.to_string(),
        }))
    }

    fn new_listener(&self, addr: &str) -> Result<Box<dyn TranListener>> {
        let name = strip_scheme(self.scheme(), addr)?;
        if name.is_empty() {
            return Err(Error::BadAddr);
        }
        let (slots_tx, slots_rx) = flume::unbounded();
        Ok(Box::new(InprocTranListener {
            name: name.to_string(),
            id: LISTENER_IDS.fetch_add(1, Ordering::Relaxed),
            slots_tx,
            slots_rx,
            closed: Gate::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{PROTO_PAIR, PROTO_PULL, PROTO_PUSH};

    fn cfg(local: u16, peer: u16) -> PipeConfig {
        PipeConfig {
            local_proto: local,
            peer_proto: peer,
            max_recv_size: 0,
        }
    }

    #[compio::test]
    async fn dial_without_listener_is_refused() {
        let t = InprocTransport;
        let d = t.new_dialer("inproc://nobody-home").unwrap();
        assert!(matches!(
            d.dial(&cfg(PROTO_PAIR, PROTO_PAIR)).await,
            Err(Error::ConnRefused)
        ));
    }

    #[compio::test]
    async fn double_bind_is_addr_in_use() {
        let t = InprocTransport;
        let mut a = t.new_listener("inproc://dup-bind").unwrap();
        let mut b = t.new_listener("inproc://dup-bind").unwrap();
        a.bind(&cfg(PROTO_PAIR, PROTO_PAIR)).await.unwrap();
        assert!(matches!(
            b.bind(&cfg(PROTO_PAIR, PROTO_PAIR)).await,
            Err(Error::AddrInUse)
        ));
        a.close();
    }

    #[compio::test]
    async fn connect_and_exchange() {
        let t = InprocTransport;
        let mut l = t.new_listener("inproc://xfer").unwrap();
        l.bind(&cfg(PROTO_PULL, PROTO_PUSH)).await.unwrap();

        let server = compio::runtime::spawn(async move {
            let pipe = l.accept(&cfg(PROTO_PULL, PROTO_PUSH)).await.unwrap();
            (l, pipe)
        });

        let d = t.new_dialer("inproc://xfer").unwrap();
        let mut client = d.dial(&cfg(PROTO_PUSH, PROTO_PULL)).await.unwrap();

        let mut m = Message::from_body(b"payload");
        m.header_mut().extend_from_slice(b"hh");

        let send = compio::runtime::spawn(async move {
            client.tx.send_msg(m).await.unwrap();
            client
        });

        let (l, mut pipe) = server.await.unwrap();
        let got = pipe.rx.recv_msg().await.unwrap();
        // Header and body arrive flattened into the body.
        assert_eq!(got.body(), b"hhpayload");
        assert!(got.header().is_empty());

        let _client = send.await;
        l.close();
    }

    #[compio::test]
    async fn incompatible_peer_is_rejected() {
        let t = InprocTransport;
        let mut l = t.new_listener("inproc://proto-check").unwrap();
        l.bind(&cfg(PROTO_PULL, PROTO_PUSH)).await.unwrap();

        let d = t.new_dialer("inproc://proto-check").unwrap();
        assert!(matches!(
            d.dial(&cfg(PROTO_PAIR, PROTO_PAIR)).await,
            Err(Error::BadProto)
        ));
        l.close();
    }
}
