//! Pooled, reference-counted messages.
//!
//! A [`Message`] is the unit handed between the application, the protocol
//! engines, and the pipes. It carries an owned header and an owned body; on
//! the wire the header is simply prepended to the body. Buffers come from a
//! process-wide cache keyed on a fixed ladder of body capacities, so the
//! common small-message case recycles allocations instead of hitting the
//! allocator on every exchange.
//!
//! Sharing model: [`Message::dup`] returns a second handle onto the same
//! storage. Duplicated messages are read-only by contract; the mutating
//! accessors are only usable while the handle is unique. When the last
//! handle is dropped the buffers return to their cache bucket.

use bytes::BytesMut;
use once_cell::sync::Lazy;
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Initial header capacity. Headers hold small stacks of 32-bit IDs, so a
/// cacheline's worth is plenty.
const HEADER_CAP: usize = 32;

/// Body capacity ladder for the message cache.
const BUCKET_CAPS: [usize; 8] = [64, 128, 256, 512, 1024, 4096, 8192, 65536];

/// How many free buffers a single bucket will hold on to.
const BUCKET_DEPTH: usize = 128;

struct Bucket {
    cap: usize,
    free: Mutex<Vec<(BytesMut, BytesMut)>>,
}

/// Process-wide buffer cache, one free list per body capacity.
struct MessageCache {
    buckets: Vec<Bucket>,
}

impl MessageCache {
    fn new() -> Self {
        Self {
            buckets: BUCKET_CAPS
                .iter()
                .map(|&cap| Bucket {
                    cap,
                    free: Mutex::new(Vec::new()),
                })
                .collect(),
        }
    }

    /// Take buffers for a body of at least `size` bytes. Returns the pair
    /// and the bucket capacity it must be returned under, or a plain
    /// allocation with no bucket when `size` is off the ladder.
    fn grab(&self, size: usize) -> (BytesMut, BytesMut, Option<usize>) {
        for b in &self.buckets {
            if size < b.cap {
                let slot = b.free.lock().expect("message cache poisoned").pop();
                let (body, header) = slot.unwrap_or_else(|| {
                    (
                        BytesMut::with_capacity(b.cap),
                        BytesMut::with_capacity(HEADER_CAP),
                    )
                });
                return (body, header, Some(b.cap));
            }
        }
        (
            BytesMut::with_capacity(size),
            BytesMut::with_capacity(HEADER_CAP),
            None,
        )
    }

    /// Return buffers to the bucket they came from. Buffers whose capacity
    /// changed while in use (grown past the bucket, or split) are dropped.
    fn put(&self, cap: usize, mut body: BytesMut, mut header: BytesMut) {
        if body.capacity() != cap {
            return;
        }
        body.clear();
        header.clear();
        for b in &self.buckets {
            if b.cap == cap {
                let mut free = b.free.lock().expect("message cache poisoned");
                if free.len() < BUCKET_DEPTH {
                    free.push((body, header));
                }
                return;
            }
        }
    }

    fn cached(&self, cap: usize) -> usize {
        self.buckets
            .iter()
            .find(|b| b.cap == cap)
            .map_or(0, |b| b.free.lock().expect("message cache poisoned").len())
    }
}

static CACHE: Lazy<MessageCache> = Lazy::new(MessageCache::new);

struct Inner {
    header: BytesMut,
    body: BytesMut,
    expire: Option<Instant>,
    pipe: Option<u32>,
    bucket: Option<usize>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(cap) = self.bucket {
            CACHE.put(cap, mem::take(&mut self.body), mem::take(&mut self.header));
        }
    }
}

/// A reference-counted message with separate header and body buffers.
pub struct Message {
    inner: Arc<Inner>,
}

impl Message {
    /// Allocate a message whose body can hold at least `size` bytes without
    /// reallocating. Both header and body start empty.
    #[must_use]
    pub fn with_capacity(size: usize) -> Self {
        let (body, header, bucket) = CACHE.grab(size);
        Self {
            inner: Arc::new(Inner {
                header,
                body,
                expire: None,
                pipe: None,
                bucket,
            }),
        }
    }

    /// Allocate a message holding a copy of `body`.
    #[must_use]
    pub fn from_body(body: &[u8]) -> Self {
        let mut m = Self::with_capacity(body.len());
        m.body_mut().extend_from_slice(body);
        m
    }

    /// Create a second handle onto the same storage.
    ///
    /// The underlying buffers are shared, so holders of duplicates must not
    /// attempt mutation; the mutating accessors enforce this at run time.
    /// This is intended for protocol engines fanning a message out to
    /// several peers, not for applications.
    #[must_use]
    pub fn dup(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }

    #[must_use]
    pub fn header(&self) -> &[u8] {
        &self.inner.header
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    /// Total bytes this message occupies on the wire (header plus body).
    #[must_use]
    pub fn wire_len(&self) -> usize {
        self.inner.header.len() + self.inner.body.len()
    }

    /// Mutable access to the header.
    ///
    /// # Panics
    ///
    /// Panics if the message has live duplicates.
    pub fn header_mut(&mut self) -> &mut BytesMut {
        &mut Arc::get_mut(&mut self.inner)
            .expect("attempted to mutate a shared message")
            .header
    }

    /// Mutable access to the body.
    ///
    /// # Panics
    ///
    /// Panics if the message has live duplicates.
    pub fn body_mut(&mut self) -> &mut BytesMut {
        &mut Arc::get_mut(&mut self.inner)
            .expect("attempted to mutate a shared message")
            .body
    }

    /// True while no duplicates of this handle are alive.
    #[must_use]
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }

    /// Set or clear the transmit expiration instant.
    ///
    /// # Panics
    ///
    /// Panics if the message has live duplicates.
    pub fn set_expire(&mut self, at: Option<Instant>) {
        Arc::get_mut(&mut self.inner)
            .expect("attempted to mutate a shared message")
            .expire = at;
    }

    /// True if a transmit expiration was set and has passed. Only the send
    /// path consults this; expiry means "too stale to be worth writing", not
    /// anything about receipt.
    #[must_use]
    pub fn expired(&self) -> bool {
        match self.inner.expire {
            None => false,
            Some(at) => at <= Instant::now(),
        }
    }

    /// Record the pipe this message arrived on.
    ///
    /// # Panics
    ///
    /// Panics if the message has live duplicates.
    pub fn set_pipe(&mut self, id: u32) {
        Arc::get_mut(&mut self.inner)
            .expect("attempted to mutate a shared message")
            .pipe = Some(id);
    }

    /// The pipe this message arrived on, when known.
    #[must_use]
    pub fn pipe(&self) -> Option<u32> {
        self.inner.pipe
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("header_len", &self.inner.header.len())
            .field("body_len", &self.inner.body.len())
            .field("refs", &Arc::strong_count(&self.inner))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn capacity_ladder() {
        let m = Message::with_capacity(10);
        assert!(m.body().is_empty());
        assert!(m.inner.body.capacity() >= 10);
        assert_eq!(m.inner.bucket, Some(64));

        let m = Message::with_capacity(64);
        assert_eq!(m.inner.bucket, Some(128));

        let m = Message::with_capacity(70_000);
        assert_eq!(m.inner.bucket, None);
    }

    #[test]
    fn pool_reuse_round_trip() {
        let before = CACHE.cached(256);
        {
            let mut m = Message::with_capacity(200);
            m.body_mut().extend_from_slice(&[7u8; 200]);
        }
        assert_eq!(CACHE.cached(256), before + 1);

        // Reused buffer comes back empty.
        let m = Message::with_capacity(200);
        assert_eq!(CACHE.cached(256), before);
        assert!(m.body().is_empty());
        assert!(m.header().is_empty());
    }

    #[test]
    fn dup_then_two_drops_returns_once() {
        let before = CACHE.cached(512);
        let m = Message::with_capacity(400);
        let d = m.dup();
        assert!(!m.is_unique());
        drop(m);
        assert_eq!(CACHE.cached(512), before);
        drop(d);
        assert_eq!(CACHE.cached(512), before + 1);
    }

    #[test]
    fn expiry_is_send_side_only() {
        let mut m = Message::with_capacity(8);
        assert!(!m.expired());
        m.set_expire(Some(Instant::now() - Duration::from_millis(1)));
        assert!(m.expired());
        m.set_expire(Some(Instant::now() + Duration::from_secs(60)));
        assert!(!m.expired());
        m.set_expire(None);
        assert!(!m.expired());
    }

    #[test]
    #[should_panic(expected = "shared message")]
    fn shared_messages_reject_mutation() {
        let mut m = Message::from_body(b"x");
        let _d = m.dup();
        m.body_mut().extend_from_slice(b"y");
    }

    #[test]
    fn pipe_annotation() {
        let mut m = Message::with_capacity(4);
        assert_eq!(m.pipe(), None);
        m.set_pipe(0x1234);
        assert_eq!(m.pipe(), Some(0x1234));
        assert_eq!(m.dup().pipe(), Some(0x1234));
    }
}
