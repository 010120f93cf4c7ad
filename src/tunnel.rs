//! Bidirectional tunnel pump.
//!
//! [`open_tunnel`] moves bytes between two connections until one direction
//! ends. The first pump to finish — on error, EOF, or idle timeout — records
//! the tunnel's result and tears down both endpoints; the second pump exits
//! through the shutdown latch. Read buffers are drawn from the pool at a
//! random size in `[6144, 10240)` to blur the traffic shape.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::alloc;
use crate::deadline::Latch;

/// Tunnel errors.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("idle timeout")]
    IdleTimeout,
}

struct Shared {
    stop: Latch,
    first_err: Mutex<Option<TunnelError>>,
}

impl Shared {
    fn finish(&self, res: Result<(), TunnelError>) {
        if let Err(e) = res {
            let mut slot = self.first_err.lock().unwrap_or_else(|p| p.into_inner());
            // Only the first finished pump decides the tunnel result.
            if slot.is_none() && !self.stop.is_closed() {
                *slot = Some(e);
            }
        }
        self.stop.close();
    }
}

/// Pumps bytes between `a` and `b` until either direction ends.
///
/// Returns the first error encountered, or `Ok(())` when a side closed
/// cleanly. Both connections are closed by the time this returns.
pub async fn open_tunnel<A, B>(a: A, b: B, idle_timeout: Duration) -> Result<(), TunnelError>
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (ar, aw) = tokio::io::split(a);
    let (br, bw) = tokio::io::split(b);

    let shared = Arc::new(Shared {
        stop: Latch::new(),
        first_err: Mutex::new(None),
    });

    let s1 = Arc::clone(&shared);
    let h1 = tokio::spawn(async move {
        let res = pump(ar, bw, idle_timeout, &s1).await;
        s1.finish(res);
    });
    let s2 = Arc::clone(&shared);
    let h2 = tokio::spawn(async move {
        let res = pump(br, aw, idle_timeout, &s2).await;
        s2.finish(res);
    });

    // Both pump tasks own their halves, so the sockets are fully released
    // once both have returned.
    let _ = h1.await;
    let _ = h2.await;

    let mut slot = shared.first_err.lock().unwrap_or_else(|p| p.into_inner());
    match slot.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn pump<R, W>(
    mut src: R,
    mut dst: W,
    idle_timeout: Duration,
    shared: &Shared,
) -> Result<(), TunnelError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let mut buf = alloc::get(rand::thread_rng().gen_range(6144..10240));

        let nr = tokio::select! {
            biased;
            // A tripped stop latch means the peer pump already decided the
            // tunnel result; exit on the normal shutdown path.
            _ = shared.stop.closed() => return Ok(()),
            r = timeout(idle_timeout, src.read(&mut buf)) => match r {
                Err(_) => return Err(TunnelError::IdleTimeout),
                Ok(r) => r?,
            },
        };

        if nr == 0 {
            // Source EOF: propagate the close and finish without error.
            let _ = dst.shutdown().await;
            return Ok(());
        }

        tokio::select! {
            biased;
            _ = shared.stop.closed() => return Ok(()),
            r = timeout(idle_timeout, dst.write_all(&buf[..nr])) => match r {
                Err(_) => return Err(TunnelError::IdleTimeout),
                Ok(r) => r?,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use tokio::io::duplex;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn test_tunnel_roundtrip() {
        // Echo server.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match s.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        if s.write_all(&buf[..n]).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        let (near, far) = duplex(64 * 1024);
        let echo = TcpStream::connect(echo_addr).await.unwrap();
        let tunnel =
            tokio::spawn(
                async move { open_tunnel(far, echo, Duration::from_secs(5)).await },
            );

        let mut data = vec![0u8; 512 * 1024];
        rand::thread_rng().fill_bytes(&mut data);

        let (mut rd, mut wr) = tokio::io::split(near);
        let send = data.clone();
        let writer = tokio::spawn(async move {
            wr.write_all(&send).await.unwrap();
            wr
        });

        let mut got = vec![0u8; data.len()];
        rd.read_exact(&mut got).await.unwrap();
        assert_eq!(got, data);

        let mut wr = writer.await.unwrap();
        wr.shutdown().await.unwrap();
        drop(rd);
        tunnel.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tunnel_idle_timeout() {
        let (a1, _a2) = duplex(1024);
        let (b1, _b2) = duplex(1024);

        let start = tokio::time::Instant::now();
        let err = open_tunnel(a1, b1, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::IdleTimeout));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_tunnel_eof_is_clean() {
        let (a1, a2) = duplex(1024);
        let (b1, mut b2) = duplex(1024);

        let tunnel =
            tokio::spawn(async move { open_tunnel(a1, b1, Duration::from_secs(5)).await });

        // Closing one end is a normal shutdown, not an error.
        drop(a2);
        let _ = b2.read(&mut [0u8; 1]).await;
        tunnel.await.unwrap().unwrap();
    }
}
