//! Device session management: one guarded connection per session,
//! bounded reconnection, and the transport seam beneath it.

mod error;
mod monitor;
mod session;
mod transport;

pub use error::ConnectionError;
pub use monitor::LivenessMonitor;
pub use session::{DeviceSession, SessionSettings, SessionState, SessionStatus};
pub use transport::{Connection, Credentials, OpenSshTransport, Target, Transport, TransportError};

#[cfg(test)]
pub(crate) use session::tests::{FakeTransport, test_settings};
