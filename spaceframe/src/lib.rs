//! # Spaceframe
//!
//! Scalability-protocols messaging for Rust: a small family of
//! message-oriented socket types layered over stream transports, speaking
//! the nanomsg-compatible SP wire protocol.
//!
//! ## Patterns
//!
//! - [`pair`] — 1:1 peering
//! - [`publish`] / [`subscribe`] — one-to-many broadcast with prefix filters
//! - [`push`] / [`pull`] — load-balanced pipelines
//! - [`req`] / [`rep`] — request/reply with automatic retry and reply routing
//! - [`surveyor`] / [`respondent`] — one-to-many questions with a deadline
//! - [`bus`] — everyone-to-everyone meshes
//!
//! ## Transports
//!
//! `tcp://host:port`, `ipc:///path` (Unix domain sockets), and
//! `inproc://name` are registered on every socket; third-party transports
//! can be added per socket with [`Socket::add_transport`].
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use spaceframe::{pair, Result};
//!
//! #[compio::main]
//! async fn main() -> Result<()> {
//!     let server = pair::socket();
//!     server.listen("tcp://127.0.0.1:40899").await?;
//!
//!     let client = pair::socket();
//!     client.dial("tcp://127.0.0.1:40899")?;
//!
//!     client.send(b"hello").await?;
//!     let msg = server.recv().await?;
//!     assert_eq!(msg, b"hello");
//!     Ok(())
//! }
//! ```

pub use spaceframe_core::options;
pub use spaceframe_core::{Error, Message, OptionValue, Result};

pub use spaceframe_sp::protocol::{
    bus, pair, publish, pull, push, rep, req, respondent, subscribe, surveyor,
};
pub use spaceframe_sp::{
    DialState, Dialer, Endpoint, Listener, PortAction, PortHook, Protocol, Socket,
};

/// Wire-level constants, useful for interop testing and raw mode.
pub use spaceframe_sp::wire;

/// The transport seam, for plugging in additional schemes.
pub use spaceframe_sp::transport;
