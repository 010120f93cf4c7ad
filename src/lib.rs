//! # veil-tls
//!
//! A bidirectional TCP tunnel that wraps plaintext client connections in a
//! TLS 1.3 transport and forwards them to a destination TCP service. Runs
//! standalone or as a shadowsocks SIP003 plugin.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Dispatch / Accept                    │
//! │      (client accept loop, server TLS acceptor)       │
//! ├─────────────────────────────────────────────────────┤
//! │                Multiplexing Layer                    │
//! │   (keepalive single-stream sessions, N-stream mux)   │
//! ├─────────────────────────────────────────────────────┤
//! │                 Transport Chain                      │
//! │        (TCP → TLS 1.3 [→ WebSocket] → auth)          │
//! ├─────────────────────────────────────────────────────┤
//! │                  Tunnel Pump                         │
//! │    (bidirectional copy, idle timeout, first error)   │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod alloc;
pub mod cert;
pub mod client;
pub mod config;
pub mod deadline;
pub mod keepalive;
pub mod mux;
pub mod padding;
pub mod server;
pub mod sip003;
pub mod sockopt;
pub mod transport;
pub mod tunnel;

pub use config::{CaSource, Carrier, ClientConfig, ServerConfig};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("tunnel closed: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("certificate error: {0}")]
    Cert(#[from] cert::CertError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("listener failed: {0}")]
    Listener(std::io::Error),
}
