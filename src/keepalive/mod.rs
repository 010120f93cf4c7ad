//! Keepalive sessions: single-stream-at-a-time carrier reuse.
//!
//! A full N-stream multiplexer has measurable CPU cost; many deployments
//! only need connection reuse. A keepalive session runs a sequence of
//! streams over one carrier, at most one active at a time, with a four
//! command framing protocol:
//!
//! ```text
//! NOP  (0x01)                     ignored; answers PING
//! DATA (0x02) len(2 BE) payload   stream bytes, 0 < len <= 65535
//! FIN  (0x03)                     close the current stream
//! PING (0x04)                     liveness probe, answered with NOP
//! ```

mod pool;
mod session;
mod stream;

pub use pool::{PooledStream, SessPool};
pub use session::{Session, SessionOpts};
pub use stream::Stream;

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Session errors. `Clone` because a session latches its first error and
/// every later reader/writer observes the same value.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("connection is occupied")]
    Occupied,

    #[error("io timeout")]
    IoTimeout,

    #[error("ping timeout")]
    PingTimeout,

    #[error("idle connection timeout")]
    IdleConnectionTimeout,

    #[error("stream closed by peer")]
    PeerClosed,

    #[error("stream closed")]
    LocalClosed,

    #[error("session closed")]
    SessionClosed,

    #[error("cannot accept new connections from peer")]
    CannotAccept,

    #[error("protocol error: {0}")]
    Protocol(Arc<str>),

    #[error("carrier error: {0}")]
    Io(Arc<io::Error>),
}

impl SessionError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        SessionError::Protocol(Arc::from(msg.into().into_boxed_str()))
    }

    pub(crate) fn io(e: io::Error) -> Self {
        SessionError::Io(Arc::new(e))
    }
}

impl From<SessionError> for io::Error {
    fn from(e: SessionError) -> io::Error {
        let kind = match &e {
            SessionError::IoTimeout
            | SessionError::PingTimeout
            | SessionError::IdleConnectionTimeout => io::ErrorKind::TimedOut,
            SessionError::PeerClosed => io::ErrorKind::UnexpectedEof,
            SessionError::LocalClosed | SessionError::SessionClosed => {
                io::ErrorKind::NotConnected
            }
            SessionError::Io(inner) => inner.kind(),
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}
