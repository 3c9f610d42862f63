//! Spaceframe Core
//!
//! Runtime-level building blocks shared by the SP wire crate and the public
//! API crate:
//! - Pooled, reference-counted messages (`message`)
//! - The error taxonomy every layer speaks (`error`)
//! - Typed option values and the option/property name constants (`options`)
//! - Reconnect backoff schedule (`backoff`)
//! - Subscription prefix lists (`subscription`)
//! - Task accounting with deadlines, queue draining (`waiter`)
//! - Raw-descriptor TCP tuning (`tcp`)

#![cfg_attr(not(test), deny(unsafe_code))]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::future_not_send)] // Runtime design: futures are not required to be Send

pub mod backoff;
pub mod error;
pub mod message;
pub mod options;
pub mod subscription;
pub mod tcp;
pub mod waiter;

pub use error::{Error, Result};
pub use message::Message;
pub use options::OptionValue;
