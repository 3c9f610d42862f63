//! Spaceframe SP
//!
//! The engine room of the stack: the SP wire handshake and framing
//! (`wire`, `pipe`), the stream transports (`transport`), the
//! pattern-blind socket core with its supervisors (`socket`, `dialer`,
//! `listener`, `endpoint`), and the seven messaging pattern engines
//! (`protocol`).
//!
//! Sockets and their tasks live on one compio runtime thread; messages are
//! the only values that travel between threads (the in-process transport
//! connects sockets on different runtimes).

#![cfg_attr(not(test), deny(unsafe_code))]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::future_not_send)] // Runtime design: futures are not required to be Send

pub mod dialer;
pub mod endpoint;
pub mod listener;
pub mod pipe;
pub mod proto;
pub mod protocol;
pub mod socket;
pub mod transport;
pub mod wire;

pub use dialer::{DialState, Dialer};
pub use endpoint::{Endpoint, PortAction, PortHook};
pub use listener::Listener;
pub use proto::{Protocol, ProtocolSocket};
pub use socket::Socket;
