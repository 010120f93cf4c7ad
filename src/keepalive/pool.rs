//! Pool of keepalive sessions: dial on demand, reuse on release.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use super::{Session, SessionOpts, Stream};
use crate::transport::{Transport, TransportError};

/// A pool of idle keepalive sessions.
///
/// Acquiring removes a session from the idle set; releasing puts it back if
/// it is still healthy. Client-side pools (which forbid peer-initiated
/// streams) dial a fresh carrier when the idle set is empty.
pub struct SessPool {
    dial: Arc<dyn Transport>,
    opts: SessionOpts,
    idle: Mutex<Vec<Session>>,
}

impl SessPool {
    pub fn new(dial: Arc<dyn Transport>, opts: SessionOpts) -> Self {
        Self {
            dial,
            opts,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Gets a stream, reusing an idle session or dialing a new carrier.
    /// The stream returns its session to the pool on shutdown.
    pub async fn get_conn(pool: &Arc<SessPool>) -> Result<PooledStream, TransportError> {
        if let Some((stream, session)) = pool.try_get_from_pool() {
            return Ok(PooledStream::new(stream, session, Arc::clone(pool)));
        }

        if pool.opts.accept_new_connection_from_peer {
            return Err(TransportError::Mux(
                "pool cannot accept new connections from peer".to_string(),
            ));
        }

        let conn = pool.dial.dial().await?;
        let session = Session::new(conn, pool.opts.clone());
        match session.open() {
            Ok(stream) => Ok(PooledStream::new(stream, session, Arc::clone(pool))),
            Err(e) => {
                session.close();
                Err(TransportError::Mux(e.to_string()))
            }
        }
    }

    fn try_get_from_pool(&self) -> Option<(Stream, Session)> {
        let mut idle = self.idle.lock().unwrap_or_else(|p| p.into_inner());
        while let Some(session) = idle.pop() {
            match session.open() {
                Ok(stream) => return Some((stream, session)),
                Err(e) => {
                    debug!("dropping pooled session: {e}");
                    session.close();
                }
            }
        }
        None
    }

    fn release(&self, session: Session) {
        if session.is_closed() {
            return;
        }
        if !session.idle() {
            // A released stream must already be detached from its session.
            debug!("refusing to pool an occupied session");
            session.close();
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(|p| p.into_inner());
        idle.push(session);
    }

    /// Number of idle sessions held.
    pub fn idle_len(&self) -> usize {
        self.idle.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// A pooled stream that returns its session to the pool once closed.
pub struct PooledStream {
    stream: Stream,
    session: Option<Session>,
    pool: Arc<SessPool>,
}

impl PooledStream {
    fn new(stream: Stream, session: Session, pool: Arc<SessPool>) -> Self {
        Self {
            stream,
            session: Some(session),
            pool,
        }
    }

    fn release_session(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release(session);
        }
    }
}

impl AsyncRead for PooledStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PooledStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let res = ready!(Pin::new(&mut this.stream).poll_shutdown(cx));
        this.release_session();
        Poll::Ready(res)
    }
}

impl Drop for PooledStream {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            // The stream must be detached before the session counts as idle.
            self.stream.close_now();
            self.pool.release(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BoxConn;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::sync::Mutex as AsyncMutex;

    struct PipeDialer {
        peers: AsyncMutex<Vec<BoxConn>>,
        dialed: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl Transport for PipeDialer {
        async fn dial(&self) -> Result<BoxConn, TransportError> {
            self.dialed
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.peers
                .lock()
                .await
                .pop()
                .ok_or_else(|| TransportError::DialFailed("out of pipes".to_string()))
        }
    }

    #[tokio::test]
    async fn test_pool_dials_then_reuses() {
        let (a, b) = duplex(64 * 1024);
        let dialer = Arc::new(PipeDialer {
            peers: AsyncMutex::new(vec![Box::new(a) as BoxConn]),
            dialed: std::sync::atomic::AtomicUsize::new(0),
        });
        let server = Session::new(
            Box::new(b),
            SessionOpts {
                accept_new_connection_from_peer: true,
                ..Default::default()
            },
        );

        let pool = Arc::new(SessPool::new(
            Arc::clone(&dialer) as Arc<dyn Transport>,
            SessionOpts::default(),
        ));

        let echo = tokio::spawn(async move {
            for _ in 0..2 {
                let mut stream = server.accept().await.unwrap();
                let mut buf = Vec::new();
                stream.read_to_end(&mut buf).await.unwrap();
            }
        });

        for _ in 0..2 {
            let mut conn = SessPool::get_conn(&pool).await.unwrap();
            conn.write_all(b"payload").await.unwrap();
            conn.shutdown().await.unwrap();
        }
        echo.await.unwrap();

        assert_eq!(
            dialer.dialed.load(std::sync::atomic::Ordering::SeqCst),
            1,
            "second acquire should reuse the pooled session"
        );
    }

    #[tokio::test]
    async fn test_accepting_pool_never_dials() {
        let dialer = Arc::new(PipeDialer {
            peers: AsyncMutex::new(Vec::new()),
            dialed: std::sync::atomic::AtomicUsize::new(0),
        });
        let pool = Arc::new(SessPool::new(
            dialer as Arc<dyn Transport>,
            SessionOpts {
                accept_new_connection_from_peer: true,
                ..Default::default()
            },
        ));
        assert!(SessPool::get_conn(&pool).await.is_err());
    }

    #[tokio::test]
    async fn test_dead_session_dropped_from_pool() {
        let (a, b) = duplex(64 * 1024);
        let dialer = Arc::new(PipeDialer {
            peers: AsyncMutex::new(vec![Box::new(a) as BoxConn]),
            dialed: std::sync::atomic::AtomicUsize::new(0),
        });
        let pool = Arc::new(SessPool::new(
            dialer as Arc<dyn Transport>,
            SessionOpts::default(),
        ));
        let server = Session::new(
            Box::new(b),
            SessionOpts {
                accept_new_connection_from_peer: true,
                ..Default::default()
            },
        );

        let mut conn = SessPool::get_conn(&pool).await.unwrap();
        conn.write_all(b"x").await.unwrap();
        let _ = server.accept().await.unwrap();
        conn.shutdown().await.unwrap();
        assert_eq!(pool.idle_len(), 1);

        // Kill the pooled carrier; the next acquire must not hand it out.
        server.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(SessPool::get_conn(&pool).await.is_err());
        assert_eq!(pool.idle_len(), 0);
    }
}
