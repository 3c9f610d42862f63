//! The transport seam: schemes, dialers, listeners.
//!
//! A transport turns addresses of one scheme into connected [`RawPipe`]s.
//! The socket core only ever sees these trait objects; the concrete stream
//! types stay buried in the transport modules. Dial and accept both take the
//! current [`PipeConfig`] so a pipe always handshakes with the protocol
//! numbers and receive limit in force at that moment.

use async_trait::async_trait;
use spaceframe_core::{Error, OptionValue, Result};

use crate::pipe::{PipeConfig, RawPipe};

pub mod inproc;
pub mod tcp;

#[cfg(unix)]
pub mod ipc;

/// A scheme's factory for dialers and listeners.
pub trait Transport {
    /// The address prefix this transport serves, without the `://`.
    fn scheme(&self) -> &'static str;

    /// Prepare a dialer for `addr`. The address is validated here; actual
    /// connection attempts happen per [`TranDialer::dial`] call.
    fn new_dialer(&self, addr: &str) -> Result<Box<dyn TranDialer>>;

    /// Prepare a listener for `addr`. Binding happens in
    /// [`TranListener::bind`].
    fn new_listener(&self, addr: &str) -> Result<Box<dyn TranListener>>;
}

/// Transport-level dialer for one address.
#[async_trait(?Send)]
pub trait TranDialer {
    /// One connection attempt, including the SP handshake.
    async fn dial(&self, config: &PipeConfig) -> Result<RawPipe>;

    fn set_option(&mut self, _name: &str, _value: OptionValue) -> Result<()> {
        Err(Error::BadOption)
    }

    fn get_option(&self, _name: &str) -> Result<OptionValue> {
        Err(Error::BadOption)
    }
}

/// Transport-level listener for one address.
#[async_trait(?Send)]
pub trait TranListener {
    /// Bind the underlying endpoint. Errors here surface synchronously from
    /// the socket's `listen` call. The config carries the protocol numbers
    /// the listener serves, for transports that advertise them.
    async fn bind(&mut self, config: &PipeConfig) -> Result<()>;

    /// Accept one connection, including the SP handshake. Returns
    /// [`Error::Closed`] once the listener has been closed.
    async fn accept(&self, config: &PipeConfig) -> Result<RawPipe>;

    /// Stop accepting. Pending and future accepts observe `Closed`.
    fn close(&self);

    /// The bound address in URL form.
    fn address(&self) -> String;

    fn set_option(&mut self, _name: &str, _value: OptionValue) -> Result<()> {
        Err(Error::BadOption)
    }

    fn get_option(&self, _name: &str) -> Result<OptionValue> {
        Err(Error::BadOption)
    }
}

/// Strip `scheme://` from `addr`, failing with `BadAddr` on mismatch.
pub fn strip_scheme<'a>(scheme: &str, addr: &'a str) -> Result<&'a str> {
    addr.strip_prefix(scheme)
        .and_then(|rest| rest.strip_prefix("://"))
        .ok_or(Error::BadAddr)
}

/// The transports every socket registers out of the box.
#[must_use]
pub fn defaults() -> Vec<std::rc::Rc<dyn Transport>> {
    let mut all: Vec<std::rc::Rc<dyn Transport>> = vec![
        std::rc::Rc::new(tcp::TcpTransport),
        std::rc::Rc::new(inproc::InprocTransport),
    ];
    #[cfg(unix)]
    all.push(std::rc::Rc::new(ipc::IpcTransport));
    all
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_stripping() {
        assert_eq!(strip_scheme("tcp", "tcp://1.2.3.4:5").unwrap(), "1.2.3.4:5");
        assert!(matches!(
            strip_scheme("tcp", "ipc:///tmp/x"),
            Err(Error::BadAddr)
        ));
        assert!(matches!(strip_scheme("tcp", "tcp:/oops"), Err(Error::BadAddr)));
    }

    #[test]
    fn default_set_covers_builtin_schemes() {
        let schemes: Vec<_> = defaults().iter().map(|t| t.scheme()).collect();
        assert!(schemes.contains(&"tcp"));
        assert!(schemes.contains(&"inproc"));
        #[cfg(unix)]
        assert!(schemes.contains(&"ipc"));
    }
}
