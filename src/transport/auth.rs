//! Shared-secret authentication preface.
//!
//! The first 16 bytes after the TLS handshake are the MD5 of the auth token.
//! On mismatch the server keeps draining the carrier for 15 seconds before
//! closing, so an active prober cannot distinguish a failed auth from a
//! long-running valid session.

use std::time::Duration;

use async_trait::async_trait;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

use super::{BoxConn, Transport, TransportError, TransportHandler};
use crate::alloc;

const DRAIN_WINDOW: Duration = Duration::from_secs(15);

fn token_digest(token: &str) -> [u8; 16] {
    md5::compute(token.as_bytes()).0
}

/// Client side: writes the auth digest before any user bytes.
pub struct AuthTransport {
    inner: Box<dyn Transport>,
    digest: [u8; 16],
}

impl AuthTransport {
    pub fn new(inner: Box<dyn Transport>, token: &str) -> Self {
        Self {
            inner,
            digest: token_digest(token),
        }
    }
}

#[async_trait]
impl Transport for AuthTransport {
    async fn dial(&self) -> Result<BoxConn, TransportError> {
        let mut conn = self.inner.dial().await?;
        conn.write_all(&self.digest).await?;
        conn.flush().await?;
        Ok(conn)
    }
}

/// Server side: reads and verifies the auth digest.
pub struct AuthTransportHandler {
    next: Box<dyn TransportHandler>,
    digest: [u8; 16],
}

impl AuthTransportHandler {
    pub fn new(next: Box<dyn TransportHandler>, token: &str) -> Self {
        Self {
            next,
            digest: token_digest(token),
        }
    }
}

#[async_trait]
impl TransportHandler for AuthTransportHandler {
    async fn handle(&self, mut conn: BoxConn) -> Result<(), TransportError> {
        let mut got = [0u8; 16];
        conn.read_exact(&mut got).await?;

        if !bool::from(self.digest.ct_eq(&got)) {
            drain(&mut conn, DRAIN_WINDOW).await;
            return Err(TransportError::AuthFailed);
        }
        self.next.handle(conn).await
    }
}

/// Reads and discards until `window` elapses or the peer goes away.
/// Nothing is ever written back.
async fn drain(conn: &mut BoxConn, window: Duration) {
    let mut buf = alloc::get(512);
    let res = timeout(window, async {
        loop {
            match conn.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => debug!("drained {n} bytes from unauthenticated peer"),
            }
        }
    })
    .await;
    if res.is_err() {
        debug!("drain window elapsed, closing carrier");
    }
}
