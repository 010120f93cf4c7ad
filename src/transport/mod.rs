//! Transport layer: the composable dial/handle chain.
//!
//! A [`Transport`] produces an outbound carrier connection; wrappers layer
//! TLS, authentication, and multiplexing over an inner transport. On the
//! server, [`TransportHandler`]s unwind the same chain in reverse:
//! auth check → mode dispatch → per-stream destination handler.

mod auth;
mod mux;
mod tcp;
mod tls;
mod ws;

pub use auth::{AuthTransport, AuthTransportHandler};
pub use mux::{MuxTransport, MuxTransportHandler, MODE_KEEPALIVE, MODE_PLAIN, MODE_SMUX};
pub use tcp::RawConnTransport;
pub use tls::{build_client_tls, build_server_tls, TlsTransport, TLS_HANDSHAKE_TIMEOUT};
pub use ws::{accept_websocket, WebsocketTransport, WsConn};

use std::io;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Anything that behaves like a bidirectional byte stream.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> Conn for T {}

/// An owned, type-erased connection.
pub type BoxConn = Box<dyn Conn>;

/// Transport layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("dial failed: {0}")]
    DialFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("not a TLS 1.3 connection")]
    TlsVersion,

    #[error("timeout")]
    Timeout,

    #[error("auth failed")]
    AuthFailed,

    #[error("invalid mode header {0}")]
    BadMode(u8),

    #[error("websocket error: {0}")]
    Websocket(String),

    #[error("mux error: {0}")]
    Mux(String),
}

/// Dials an outbound carrier or stream.
///
/// The 5-second connect and handshake budgets live inside the transports;
/// cancelling the returned future aborts the dial.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(&self) -> Result<BoxConn, TransportError>;
}

/// Handles one accepted carrier on the server side.
#[async_trait]
pub trait TransportHandler: Send + Sync {
    async fn handle(&self, conn: BoxConn) -> Result<(), TransportError>;
}
