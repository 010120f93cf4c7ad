//! Raw TCP transport.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use super::{BoxConn, Transport, TransportError};
use crate::sockopt::{dial_tcp, SocketOpts};

/// Connect budget for every outbound dial, independent of the idle timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Dials a plain TCP connection with the socket control hook applied.
pub struct RawConnTransport {
    addr: String,
    opts: SocketOpts,
}

impl RawConnTransport {
    pub fn new(addr: impl Into<String>, opts: SocketOpts) -> Self {
        Self {
            addr: addr.into(),
            opts,
        }
    }
}

#[async_trait]
impl Transport for RawConnTransport {
    async fn dial(&self) -> Result<BoxConn, TransportError> {
        let stream = timeout(CONNECT_TIMEOUT, dial_tcp(&self.addr, &self.opts))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::DialFailed(format!("{}: {e}", self.addr)))?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_raw_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
        });

        let t = RawConnTransport::new(addr.to_string(), SocketOpts::default());
        let mut conn = t.dial().await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
