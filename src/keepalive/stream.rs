//! The stream side of a keepalive session.
//!
//! A [`Stream`] holds a non-owning handle back to its session; the session
//! owns the stream's lifecycle through its state mutex and the carrier.
//! Reads drain the chunk channel filled by the session's read loop; writes
//! are submitted to the session's writer task, which serialises frames onto
//! the carrier.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};

use super::session::{
    remove_stream, CloseLatch, CurrentStream, Shared, WriteRequest, CMD_DATA, CMD_FIN,
};
use super::SessionError;
use crate::deadline::{Deadline, Latch};

type BoxedIoFuture = Pin<Box<dyn Future<Output = io::Result<usize>> + Send>>;
type BoxedUnitFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

enum WriteState {
    Idle,
    Writing { fut: BoxedIoFuture },
    ShuttingDown { fut: BoxedUnitFuture },
    Shutdown,
}

/// An exclusive stream over a keepalive session.
pub struct Stream {
    shared: Arc<Shared>,
    data_rx: mpsc::Receiver<Bytes>,
    unread: Bytes,
    chan_done: bool,
    closed: Arc<CloseLatch>,
    read_deadline: Deadline,
    write_deadline: Deadline,
    write_state: WriteState,
}

impl Stream {
    pub(crate) fn pair(shared: Arc<Shared>) -> (Stream, CurrentStream) {
        // One buffered chunk keeps reads a step ahead of the read loop.
        let (data_tx, data_rx) = mpsc::channel(1);
        let closed = Arc::new(CloseLatch::new());
        let stream = Stream {
            shared,
            data_rx,
            unread: Bytes::new(),
            chan_done: false,
            closed: Arc::clone(&closed),
            read_deadline: Deadline::new(),
            write_deadline: Deadline::new(),
            write_state: WriteState::Idle,
        };
        (stream, CurrentStream { data_tx, closed })
    }

    /// Sets both the read and write deadline.
    pub fn set_deadline(&self, at: Option<tokio::time::Instant>) {
        self.read_deadline.set(at);
        self.write_deadline.set(at);
    }

    pub fn set_read_deadline(&self, at: Option<tokio::time::Instant>) {
        self.read_deadline.set(at);
    }

    pub fn set_write_deadline(&self, at: Option<tokio::time::Instant>) {
        self.write_deadline.set(at);
    }

    /// Synchronous close: latches the reason, detaches from the session,
    /// and emits the FIN from a background task. Used on drop paths where
    /// no executor context is available to await the FIN commit.
    pub(crate) fn close_now(&mut self) {
        if self.closed.close(SessionError::LocalClosed) {
            remove_stream(&self.shared, false);
            let shared = Arc::clone(&self.shared);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    send_fin(&shared).await;
                });
            }
        }
    }

    fn fail_fast(&self) -> Option<SessionError> {
        if self.write_deadline.is_expired() {
            return Some(SessionError::IoTimeout);
        }
        if let Some(e) = self.closed.error() {
            return Some(e);
        }
        self.shared.close.error()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.unread.is_empty() {
                let n = this.unread.len().min(buf.remaining());
                buf.put_slice(&this.unread.split_to(n));
                return Poll::Ready(Ok(()));
            }

            // Drain buffered chunks before consulting the deadline or close
            // latches, so data that raced a close is not lost.
            if !this.chan_done {
                match this.data_rx.poll_recv(cx) {
                    Poll::Ready(Some(chunk)) => {
                        this.unread = chunk;
                        continue;
                    }
                    Poll::Ready(None) => this.chan_done = true,
                    Poll::Pending => {}
                }
            }

            if this.read_deadline.poll_expired(cx).is_ready() {
                return Poll::Ready(Err(SessionError::IoTimeout.into()));
            }
            if let Poll::Ready(e) = this.closed.poll_closed(cx) {
                return match e {
                    // Peer FIN is a clean end of stream.
                    SessionError::PeerClosed => Poll::Ready(Ok(())),
                    e => Poll::Ready(Err(e.into())),
                };
            }
            if let Poll::Ready(e) = this.shared.close.poll_closed(cx) {
                return Poll::Ready(Err(e.into()));
            }
            if this.chan_done {
                return Poll::Ready(Ok(()));
            }
            return Poll::Pending;
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            match &mut this.write_state {
                WriteState::Idle => {
                    if buf.is_empty() {
                        return Poll::Ready(Ok(0));
                    }
                    if let Some(e) = this.fail_fast() {
                        return Poll::Ready(Err(e.into()));
                    }
                    let fut = submit_data(
                        Arc::clone(&this.shared),
                        Arc::clone(&this.closed),
                        this.write_deadline.latch(),
                        Bytes::copy_from_slice(buf),
                    );
                    this.write_state = WriteState::Writing { fut: Box::pin(fut) };
                }
                WriteState::Writing { fut } => {
                    let res = ready!(fut.as_mut().poll(cx));
                    this.write_state = WriteState::Idle;
                    return Poll::Ready(res);
                }
                WriteState::ShuttingDown { .. } | WriteState::Shutdown => {
                    return Poll::Ready(Err(SessionError::LocalClosed.into()));
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // Writes complete only once the writer task has committed the frame
        // to the carrier, so there is nothing extra to flush.
        match &mut this.write_state {
            WriteState::Writing { fut } => {
                let res = ready!(fut.as_mut().poll(cx));
                this.write_state = WriteState::Idle;
                Poll::Ready(res.map(|_| ()))
            }
            _ => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.write_state {
                WriteState::Shutdown => return Poll::Ready(Ok(())),
                WriteState::ShuttingDown { fut } => {
                    ready!(fut.as_mut().poll(cx));
                    this.write_state = WriteState::Shutdown;
                    return Poll::Ready(Ok(()));
                }
                WriteState::Writing { fut } => {
                    // Let the in-flight frame commit before the FIN.
                    let _ = ready!(fut.as_mut().poll(cx));
                    this.write_state = WriteState::Idle;
                }
                WriteState::Idle => {
                    let shared = Arc::clone(&this.shared);
                    let closed = Arc::clone(&this.closed);
                    let fut = async move {
                        close_stream(&shared, &closed, SessionError::LocalClosed, false).await;
                    };
                    this.write_state = WriteState::ShuttingDown { fut: Box::pin(fut) };
                }
            }
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.close_now();
    }
}

/// Closes a stream exactly once: latches the reason, detaches it from the
/// session, and emits a FIN on the carrier unless the session is closed.
pub(crate) async fn close_stream(
    shared: &Arc<Shared>,
    closed: &Arc<CloseLatch>,
    reason: SessionError,
    closed_by_peer: bool,
) {
    if !closed.close(reason) {
        return;
    }
    remove_stream(shared, closed_by_peer);
    send_fin(shared).await;
}

async fn send_fin(shared: &Arc<Shared>) {
    let (tx, rx) = oneshot::channel();
    let req = WriteRequest {
        cmd: CMD_FIN,
        data: None,
        result: tx,
    };
    tokio::select! {
        biased;
        _ = shared.close.closed() => {}
        r = shared.write_tx.send(req) => {
            if r.is_ok() {
                // The writer replies once the FIN is on the wire; a write
                // error closes the session anyway.
                let _ = rx.await;
            }
        }
    }
}

async fn submit_data(
    shared: Arc<Shared>,
    closed: Arc<CloseLatch>,
    deadline: Arc<Latch>,
    data: Bytes,
) -> io::Result<usize> {
    let (tx, rx) = oneshot::channel();
    let req = WriteRequest {
        cmd: CMD_DATA,
        data: Some(data),
        result: tx,
    };

    tokio::select! {
        biased;
        e = shared.close.closed() => return Err(e.into()),
        e = closed.closed() => return Err(e.into()),
        _ = deadline.closed() => return Err(SessionError::IoTimeout.into()),
        r = shared.write_tx.send(req) => {
            if r.is_err() {
                return Err(SessionError::SessionClosed.into());
            }
        }
    }

    tokio::select! {
        biased;
        _ = deadline.closed() => Err(SessionError::IoTimeout.into()),
        res = rx => match res {
            Ok(res) => res,
            Err(_) => Err(shared
                .close
                .error()
                .unwrap_or(SessionError::SessionClosed)
                .into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Session, SessionOpts};
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn pipe_sessions(accept: bool) -> (Session, Session) {
        let (a, b) = duplex(256 * 1024);
        let client = Session::new(Box::new(a), SessionOpts::default());
        let server = Session::new(
            Box::new(b),
            SessionOpts {
                accept_new_connection_from_peer: accept,
                ..Default::default()
            },
        );
        (client, server)
    }

    #[tokio::test]
    async fn test_open_write_accept_read() {
        let (client, server) = pipe_sessions(true);

        let data = vec![0xA5u8; 512 * 1024];
        let send = data.clone();
        let writer = tokio::spawn(async move {
            let mut stream = client.open().unwrap();
            stream.write_all(&send).await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let mut stream = server.accept().await.unwrap();
        let mut got = Vec::new();
        stream.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, data);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_second_open_is_occupied() {
        let (client, _server) = pipe_sessions(true);
        let _stream = client.open().unwrap();
        assert!(matches!(client.open(), Err(SessionError::Occupied)));
    }

    #[tokio::test]
    async fn test_sequential_streams_no_leakage() {
        let (client, server) = pipe_sessions(true);

        let payloads: Vec<Vec<u8>> = (0..10u8)
            .map(|i| vec![i; 8 * 1024 + i as usize])
            .collect();

        let expect = payloads.clone();
        let writer = tokio::spawn(async move {
            for p in payloads {
                // shutdown() waits for the FIN to commit, so the session is
                // free again by the time the next open() runs.
                let mut stream = client.open().unwrap();
                stream.write_all(&p).await.unwrap();
                stream.shutdown().await.unwrap();
            }
        });

        for want in expect {
            let mut stream = server.accept().await.unwrap();
            let mut got = Vec::new();
            stream.read_to_end(&mut got).await.unwrap();
            assert_eq!(got, want);
            stream.shutdown().await.unwrap();
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_deadline() {
        let (client, _server) = pipe_sessions(true);
        let mut stream = client.open().unwrap();

        stream.set_deadline(Some(
            tokio::time::Instant::now() + Duration::from_millis(10),
        ));
        let mut buf = [0u8; 1];
        for _ in 0..3 {
            let err = stream.read(&mut buf).await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        }

        // Disarming reopens the stream for normal (blocking) reads.
        stream.set_deadline(None);
        let res = tokio::time::timeout(Duration::from_millis(20), stream.read(&mut buf)).await;
        assert!(res.is_err(), "read should block after deadline disarm");
    }

    #[tokio::test]
    async fn test_io_after_session_close() {
        let (client, server) = pipe_sessions(true);
        let mut stream = client.open().unwrap();
        server.close();
        client.close();

        let mut buf = [0u8; 1];
        assert!(stream.read(&mut buf).await.is_err());
        assert!(stream.write(&[0u8]).await.is_err());
    }

    #[tokio::test]
    async fn test_idle_connection_timeout() {
        let (a, _b) = duplex(1024);
        let sess = Session::new(
            Box::new(a),
            SessionOpts {
                idle_connection_timeout: Some(Duration::from_millis(10)),
                ..Default::default()
            },
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sess.is_closed());
        assert!(matches!(
            sess.close_err(),
            Some(SessionError::IdleConnectionTimeout)
        ));
    }

    #[tokio::test]
    async fn test_idle_timer_suspended_while_stream_live() {
        let (a, b) = duplex(1024);
        let sess = Session::new(
            Box::new(a),
            SessionOpts {
                idle_connection_timeout: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        );
        let _peer = Session::new(
            Box::new(b),
            SessionOpts {
                accept_new_connection_from_peer: true,
                ..Default::default()
            },
        );

        let stream = sess.open().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!sess.is_closed());

        drop(stream);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sess.is_closed());
    }

    #[tokio::test]
    async fn test_accept_requires_opt_in() {
        let (client, _server) = pipe_sessions(true);
        assert!(matches!(
            client.accept().await,
            Err(SessionError::CannotAccept)
        ));
    }

    #[tokio::test]
    async fn test_cannot_accept_when_disabled() {
        let (client, server) = pipe_sessions(false);

        // A server that does not accept peer streams closes the session on
        // an unsolicited DATA frame.
        let mut stream = client.open().unwrap();
        let _ = stream.write_all(b"hello").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.is_closed());
    }
}
