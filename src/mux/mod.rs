//! N-stream multiplexer over one carrier.
//!
//! Wire-framed like smux v1: an 8-byte header
//! `ver(1) | cmd(1) | len(2 LE) | sid(4 LE)` followed by `len` payload bytes
//! for PSH frames. Client-opened streams use odd ids from 1, server-opened
//! even ids from 2. Protocol keepalive frames are not sent; the carrier's
//! idle timeout covers liveness.

mod frame;
mod session;
mod stream;

pub use frame::{Cmd, FrameHeader, HEADER_SIZE, PROTOCOL_VERSION};
pub use session::{MuxConfig, MuxSession};
pub use stream::MuxStream;

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Multiplexer errors. `Clone` because the session latches its first error
/// for every stream to observe.
#[derive(Debug, Clone, Error)]
pub enum MuxError {
    #[error("invalid protocol version {0}")]
    BadVersion(u8),

    #[error("invalid command {0}")]
    BadCmd(u8),

    #[error("io timeout")]
    IoTimeout,

    #[error("stream closed by peer")]
    PeerClosed,

    #[error("stream closed")]
    StreamClosed,

    #[error("session closed")]
    SessionClosed,

    #[error("protocol error: {0}")]
    Protocol(Arc<str>),

    #[error("carrier error: {0}")]
    Io(Arc<io::Error>),
}

impl MuxError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        MuxError::Protocol(Arc::from(msg.into().into_boxed_str()))
    }

    pub(crate) fn io(e: io::Error) -> Self {
        MuxError::Io(Arc::new(e))
    }
}

impl From<MuxError> for io::Error {
    fn from(e: MuxError) -> io::Error {
        let kind = match &e {
            MuxError::IoTimeout => io::ErrorKind::TimedOut,
            MuxError::PeerClosed => io::ErrorKind::UnexpectedEof,
            MuxError::StreamClosed | MuxError::SessionClosed => io::ErrorKind::NotConnected,
            MuxError::Io(inner) => inner.kind(),
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}
