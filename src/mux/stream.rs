//! A single multiplexed stream.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};

use super::frame::{Cmd, FrameHeader};
use super::session::{MuxCloseLatch, MuxShared, Slot, WriteFrame};
use super::MuxError;
use crate::deadline::{Deadline, Latch};

type BoxedIoFuture = Pin<Box<dyn Future<Output = io::Result<usize>> + Send>>;
type BoxedUnitFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

enum WriteState {
    Idle,
    Writing { fut: BoxedIoFuture },
    ShuttingDown { fut: BoxedUnitFuture },
    Shutdown,
}

/// An ordered byte stream multiplexed over a shared carrier.
pub struct MuxStream {
    shared: Arc<MuxShared>,
    sid: u32,
    data_rx: mpsc::Receiver<Bytes>,
    unread: Bytes,
    chan_done: bool,
    closed: Arc<MuxCloseLatch>,
    read_deadline: Deadline,
    write_deadline: Deadline,
    write_state: WriteState,
}

impl MuxStream {
    pub(crate) fn pair(shared: Arc<MuxShared>, sid: u32) -> (MuxStream, Slot) {
        let (data_tx, data_rx) = mpsc::channel(shared.config.stream_chan_capacity());
        let closed = Arc::new(MuxCloseLatch::new());
        let stream = MuxStream {
            shared,
            sid,
            data_rx,
            unread: Bytes::new(),
            chan_done: false,
            closed: Arc::clone(&closed),
            read_deadline: Deadline::new(),
            write_deadline: Deadline::new(),
            write_state: WriteState::Idle,
        };
        (stream, Slot { data_tx, closed })
    }

    /// Stream id on the wire.
    pub fn id(&self) -> u32 {
        self.sid
    }

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

    pub(crate) fn close_now(&mut self) {
        if self.closed.close(MuxError::StreamClosed) {
            self.shared.remove_stream(self.sid);
            let shared = Arc::clone(&self.shared);
            let sid = self.sid;
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    send_fin(&shared, sid).await;
                });
            }
        }
    }

    fn fail_fast(&self) -> Option<MuxError> {
        if self.write_deadline.is_expired() {
            return Some(MuxError::IoTimeout);
        }
        if let Some(e) = self.closed.error() {
            return Some(e);
        }
        self.shared.close.error()
    }
}

impl AsyncRead for MuxStream {
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
                return Poll::Ready(Err(MuxError::IoTimeout.into()));
            }
            if let Poll::Ready(e) = this.closed.poll_closed(cx) {
                return match e {
                    MuxError::PeerClosed => Poll::Ready(Ok(())),
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

impl AsyncWrite for MuxStream {
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
                        this.sid,
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
                    return Poll::Ready(Err(MuxError::StreamClosed.into()));
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
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
                    let _ = ready!(fut.as_mut().poll(cx));
                    this.write_state = WriteState::Idle;
                }
                WriteState::Idle => {
                    let shared = Arc::clone(&this.shared);
                    let closed = Arc::clone(&this.closed);
                    let sid = this.sid;
                    let fut = async move {
                        if closed.close(MuxError::StreamClosed) {
                            shared.remove_stream(sid);
                            send_fin(&shared, sid).await;
                        }
                    };
                    this.write_state = WriteState::ShuttingDown { fut: Box::pin(fut) };
                }
            }
        }
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.close_now();
    }
}

async fn send_fin(shared: &Arc<MuxShared>, sid: u32) {
    let (tx, rx) = oneshot::channel();
    let frame = WriteFrame {
        header: FrameHeader::new(Cmd::Fin, sid, 0),
        payload: None,
        result: tx,
    };
    tokio::select! {
        biased;
        _ = shared.close.closed() => {}
        r = shared.write_tx.send(frame) => {
            if r.is_ok() {
                let _ = rx.await;
            }
        }
    }
}

async fn submit_data(
    shared: Arc<MuxShared>,
    sid: u32,
    closed: Arc<MuxCloseLatch>,
    deadline: Arc<Latch>,
    data: Bytes,
) -> io::Result<usize> {
    // A frame length must fit the 16-bit header field whatever the config.
    let max_frame = shared.config.max_frame_size.min(65535);
    let mut written = 0usize;
    let mut remain = data;

    while !remain.is_empty() {
        let chunk = remain.split_to(remain.len().min(max_frame));
        let chunk_len = chunk.len();

        let (tx, rx) = oneshot::channel();
        let frame = WriteFrame {
            header: FrameHeader::new(Cmd::Psh, sid, chunk_len as u16),
            payload: Some(chunk),
            result: tx,
        };

        tokio::select! {
            biased;
            e = shared.close.closed() => return Err(e.into()),
            e = closed.closed() => return Err(e.into()),
            _ = deadline.closed() => return Err(MuxError::IoTimeout.into()),
            r = shared.write_tx.send(frame) => {
                if r.is_err() {
                    return Err(MuxError::SessionClosed.into());
                }
            }
        }

        let committed = tokio::select! {
            biased;
            _ = deadline.closed() => return Err(MuxError::IoTimeout.into()),
            res = rx => match res {
                Ok(res) => res?,
                Err(_) => {
                    return Err(shared
                        .close
                        .error()
                        .unwrap_or(MuxError::SessionClosed)
                        .into())
                }
            },
        };
        debug_assert_eq!(committed, chunk_len);
        written += chunk_len;
    }
    Ok(written)
}
