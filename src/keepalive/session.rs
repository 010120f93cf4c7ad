//! Keepalive session: carrier ownership, read/write loops, frame protocol.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};
use tracing::trace;

use super::stream::Stream;
use super::SessionError;
use crate::alloc;
use crate::deadline::Latch;
use crate::transport::BoxConn;

pub(crate) const CMD_NOP: u8 = 1;
pub(crate) const CMD_DATA: u8 = 2;
pub(crate) const CMD_FIN: u8 = 3;
pub(crate) const CMD_PING: u8 = 4;

const DEFAULT_READ_BUF: usize = 16 * 1024;
const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Session options.
#[derive(Debug, Clone, Default)]
pub struct SessionOpts {
    /// Allow the peer to start streams (server side).
    pub accept_new_connection_from_peer: bool,
    /// Read chunk size; 0 means 16 KiB.
    pub read_buf_size: usize,
    /// Carrier read/write budget; a stalled peer trips it.
    pub idle_timeout: Option<Duration>,
    /// Close the session when no stream is live for this long.
    pub idle_connection_timeout: Option<Duration>,
    /// Send a PING this often; `None` disables the ping loop.
    pub ping_interval: Option<Duration>,
    /// How long after a PING the carrier must have produced bytes.
    /// Zero means 5 s.
    pub ping_timeout: Duration,
}

impl SessionOpts {
    fn read_buf(&self) -> usize {
        if self.read_buf_size == 0 {
            DEFAULT_READ_BUF
        } else {
            self.read_buf_size
        }
    }

    fn ping_timeout(&self) -> Duration {
        if self.ping_timeout.is_zero() {
            DEFAULT_PING_TIMEOUT
        } else {
            self.ping_timeout
        }
    }
}

/// One-shot close signal carrying the session's (or stream's) first error.
pub(crate) struct CloseLatch {
    latch: Latch,
    err: Mutex<Option<SessionError>>,
}

impl CloseLatch {
    pub(crate) fn new() -> Self {
        Self {
            latch: Latch::new(),
            err: Mutex::new(None),
        }
    }

    /// Records `e` and trips the latch. Only the first caller wins.
    pub(crate) fn close(&self, e: SessionError) -> bool {
        {
            let mut slot = self.err.lock().unwrap_or_else(|p| p.into_inner());
            if slot.is_some() {
                return false;
            }
            *slot = Some(e);
        }
        self.latch.close();
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.latch.is_closed()
    }

    pub(crate) fn error(&self) -> Option<SessionError> {
        self.err.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub(crate) fn poll_closed(&self, cx: &mut Context<'_>) -> Poll<SessionError> {
        match self.latch.poll_closed(cx) {
            Poll::Ready(()) => {
                Poll::Ready(self.error().unwrap_or(SessionError::SessionClosed))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    pub(crate) async fn closed(&self) -> SessionError {
        self.latch.closed().await;
        self.error().unwrap_or(SessionError::SessionClosed)
    }
}

/// A write submitted to the session's writer task. The writer always
/// replies on `result` once it has taken the request.
pub(crate) struct WriteRequest {
    pub(crate) cmd: u8,
    pub(crate) data: Option<Bytes>,
    pub(crate) result: oneshot::Sender<std::io::Result<usize>>,
}

pub(crate) struct CurrentStream {
    pub(crate) data_tx: mpsc::Sender<Bytes>,
    pub(crate) closed: Arc<CloseLatch>,
}

pub(crate) struct State {
    pub(crate) current: Option<CurrentStream>,
    pub(crate) pending_fin: u32,
    idle_gen: u64,
}

pub(crate) struct Shared {
    pub(crate) opts: SessionOpts,
    pub(crate) state: Mutex<State>,
    pub(crate) close: CloseLatch,
    pub(crate) write_tx: mpsc::Sender<WriteRequest>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Stream>>,
    last_read_ms: AtomicU64,
    epoch: Instant,
}

impl Shared {
    fn track_read(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        self.last_read_ms.store(ms, Ordering::Relaxed);
    }

    fn last_read_age(&self) -> Duration {
        let last = Duration::from_millis(self.last_read_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }

    pub(crate) fn close_with_err(&self, e: SessionError) {
        self.close.close(e);
    }

    fn stop_idle_timer(&self, st: &mut State) {
        st.idle_gen += 1;
    }
}

/// Detaches the current stream. Must be called exactly once per stream,
/// which the stream's close-once latch guarantees.
pub(crate) fn remove_stream(shared: &Arc<Shared>, closed_by_peer: bool) {
    let mut st = shared.state.lock().unwrap_or_else(|p| p.into_inner());
    st.current = None;
    if !closed_by_peer {
        // The peer will still answer our FIN with its own; swallow it.
        st.pending_fin += 1;
    }
    arm_idle_timer(shared, &mut st);
}

fn arm_idle_timer(shared: &Arc<Shared>, st: &mut State) {
    let Some(d) = shared.opts.idle_connection_timeout else {
        return;
    };
    st.idle_gen += 1;
    let gen = st.idle_gen;
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        tokio::time::sleep(d).await;
        let fire = {
            let st = shared.state.lock().unwrap_or_else(|p| p.into_inner());
            st.idle_gen == gen && st.current.is_none()
        };
        if fire {
            shared.close_with_err(SessionError::IdleConnectionTimeout);
        }
    });
}

/// A keepalive session over one carrier connection.
///
/// Cheap to clone; all clones share the same carrier and state.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Takes ownership of `conn` and starts the session loops.
    pub fn new(conn: BoxConn, opts: SessionOpts) -> Self {
        let (rd, wr) = tokio::io::split(conn);
        let (write_tx, write_rx) = mpsc::channel(1);
        let (accept_tx, accept_rx) = mpsc::channel(1);

        let shared = Arc::new(Shared {
            opts,
            state: Mutex::new(State {
                current: None,
                pending_fin: 0,
                idle_gen: 0,
            }),
            close: CloseLatch::new(),
            write_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            last_read_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        });

        {
            let mut st = shared.state.lock().unwrap_or_else(|p| p.into_inner());
            arm_idle_timer(&shared, &mut st);
        }

        tokio::spawn(read_loop(Arc::clone(&shared), rd, accept_tx));
        tokio::spawn(write_loop(Arc::clone(&shared), wr, write_rx));
        if shared.opts.ping_interval.is_some() {
            tokio::spawn(ping_loop(Arc::clone(&shared)));
        }

        Self { shared }
    }

    /// Starts a new outbound stream. Fails with [`SessionError::Occupied`]
    /// while another stream is live.
    pub fn open(&self) -> Result<Stream, SessionError> {
        let mut st = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if self.shared.close.is_closed() {
            return Err(self
                .shared
                .close
                .error()
                .unwrap_or(SessionError::SessionClosed));
        }
        if st.current.is_some() {
            return Err(SessionError::Occupied);
        }
        let (stream, current) = Stream::pair(Arc::clone(&self.shared));
        st.current = Some(current);
        self.shared.stop_idle_timer(&mut st);
        Ok(stream)
    }

    /// Waits for a peer-initiated stream. Requires
    /// [`SessionOpts::accept_new_connection_from_peer`].
    pub async fn accept(&self) -> Result<Stream, SessionError> {
        if !self.shared.opts.accept_new_connection_from_peer {
            return Err(SessionError::CannotAccept);
        }
        if self.shared.close.is_closed() {
            return Err(self
                .shared
                .close
                .error()
                .unwrap_or(SessionError::SessionClosed));
        }
        let mut rx = self.shared.accept_rx.lock().await;
        tokio::select! {
            stream = rx.recv() => match stream {
                Some(stream) => {
                    let mut st = self.shared.state.lock().unwrap_or_else(|p| p.into_inner());
                    self.shared.stop_idle_timer(&mut st);
                    drop(st);
                    Ok(stream)
                }
                None => Err(self.shared.close.error().unwrap_or(SessionError::SessionClosed)),
            },
            e = self.shared.close.closed() => Err(e),
        }
    }

    /// Whether no stream is currently live.
    pub fn idle(&self) -> bool {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .current
            .is_none()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.close.is_closed()
    }

    /// The error the session closed with, if it has closed.
    pub fn close_err(&self) -> Option<SessionError> {
        self.shared.close.error()
    }

    pub fn close(&self) {
        self.close_with_err(SessionError::SessionClosed);
    }

    /// Latches `e` as the session's close error; idempotent.
    pub fn close_with_err(&self, e: SessionError) {
        self.shared.close_with_err(e);
    }
}

async fn carrier_read(
    shared: &Arc<Shared>,
    rd: &mut ReadHalf<BoxConn>,
    buf: &mut [u8],
) -> Result<usize, SessionError> {
    let n = match shared.opts.idle_timeout {
        Some(d) => tokio::select! {
            biased;
            e = shared.close.closed() => return Err(e),
            r = timeout(d, rd.read(buf)) => r
                .map_err(|_| SessionError::IoTimeout)?
                .map_err(SessionError::io)?,
        },
        None => tokio::select! {
            biased;
            e = shared.close.closed() => return Err(e),
            r = rd.read(buf) => r.map_err(SessionError::io)?,
        },
    };
    if n > 0 {
        shared.track_read();
    }
    Ok(n)
}

async fn carrier_read_exact(
    shared: &Arc<Shared>,
    rd: &mut ReadHalf<BoxConn>,
    buf: &mut [u8],
) -> Result<(), SessionError> {
    let mut off = 0;
    while off < buf.len() {
        let n = carrier_read(shared, rd, &mut buf[off..]).await?;
        if n == 0 {
            return Err(SessionError::protocol("unexpected eof on carrier"));
        }
        off += n;
    }
    Ok(())
}

async fn read_loop(
    shared: Arc<Shared>,
    mut rd: ReadHalf<BoxConn>,
    accept_tx: mpsc::Sender<Stream>,
) {
    if let Err(e) = read_loop_inner(&shared, &mut rd, &accept_tx).await {
        shared.close_with_err(e);
    }
}

async fn read_loop_inner(
    shared: &Arc<Shared>,
    rd: &mut ReadHalf<BoxConn>,
    accept_tx: &mpsc::Sender<Stream>,
) -> Result<(), SessionError> {
    let mut header = [0u8; 2];
    let read_buf_size = shared.opts.read_buf();

    loop {
        carrier_read_exact(shared, rd, &mut header[..1]).await?;
        match header[0] {
            CMD_NOP => {}
            CMD_PING => {
                // Answer with a NOP; the result does not matter.
                let (tx, _rx) = oneshot::channel();
                let req = WriteRequest {
                    cmd: CMD_NOP,
                    data: None,
                    result: tx,
                };
                tokio::select! {
                    biased;
                    e = shared.close.closed() => return Err(e),
                    _ = shared.write_tx.send(req) => {}
                }
            }
            CMD_FIN => {
                let stream = {
                    let mut st = shared.state.lock().unwrap_or_else(|p| p.into_inner());
                    if st.pending_fin > 0 {
                        // The echo of a FIN we initiated.
                        st.pending_fin -= 1;
                        continue;
                    }
                    match &st.current {
                        Some(cur) => Arc::clone(&cur.closed),
                        None => {
                            return Err(SessionError::protocol("unexpected fin"));
                        }
                    }
                };
                super::stream::close_stream(shared, &stream, SessionError::PeerClosed, true)
                    .await;
            }
            CMD_DATA => {
                carrier_read_exact(shared, rd, &mut header).await?;
                let length = u16::from_be_bytes(header) as usize;
                if length == 0 {
                    return Err(SessionError::protocol("zero length data frame"));
                }

                let pending = {
                    let st = shared.state.lock().unwrap_or_else(|p| p.into_inner());
                    st.pending_fin
                };
                if pending > 0 {
                    // Data of a stream we already closed; drain it.
                    discard_read(shared, rd, length).await?;
                    continue;
                }

                let (data_tx, stream_closed, fresh) = {
                    let mut st = shared.state.lock().unwrap_or_else(|p| p.into_inner());
                    match &st.current {
                        Some(cur) => {
                            (cur.data_tx.clone(), Arc::clone(&cur.closed), None)
                        }
                        None => {
                            if !shared.opts.accept_new_connection_from_peer {
                                return Err(SessionError::protocol(
                                    "unexpected new connection from peer",
                                ));
                            }
                            let (stream, current) = Stream::pair(Arc::clone(shared));
                            let tx = current.data_tx.clone();
                            let closed = Arc::clone(&current.closed);
                            st.current = Some(current);
                            (tx, closed, Some(stream))
                        }
                    }
                };
                if let Some(stream) = fresh {
                    tokio::select! {
                        biased;
                        e = shared.close.closed() => return Err(e),
                        r = accept_tx.send(stream) => {
                            if r.is_err() {
                                return Err(SessionError::SessionClosed);
                            }
                        }
                    }
                }

                let mut remain = length;
                let mut buf = alloc::get(read_buf_size.min(remain));
                while remain > 0 {
                    let want = remain.min(buf.len());
                    let n = carrier_read(shared, rd, &mut buf[..want]).await?;
                    if n == 0 {
                        return Err(SessionError::protocol("unexpected eof in data frame"));
                    }
                    remain -= n;
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    let chunk_len = chunk.len();
                    tokio::select! {
                        biased;
                        e = shared.close.closed() => return Err(e),
                        // The stream may have closed locally mid-frame; the
                        // rest of the frame is consumed and dropped.
                        _ = stream_closed.closed() => {
                            trace!("dropping {} bytes for closed stream", chunk_len);
                        }
                        _ = data_tx.send(chunk) => {}
                    }
                }
            }
            cmd => {
                return Err(SessionError::protocol(format!("invalid cmd header [{cmd}]")));
            }
        }
    }
}

/// Reads and discards exactly `len` bytes from the carrier.
async fn discard_read(
    shared: &Arc<Shared>,
    rd: &mut ReadHalf<BoxConn>,
    len: usize,
) -> Result<(), SessionError> {
    let mut remain = len;
    let mut buf = alloc::get(remain.min(4096));
    while remain > 0 {
        let want = remain.min(buf.len());
        let n = carrier_read(shared, rd, &mut buf[..want]).await?;
        if n == 0 {
            return Err(SessionError::protocol("unexpected eof while discarding"));
        }
        remain -= n;
    }
    Ok(())
}

async fn write_loop(
    shared: Arc<Shared>,
    mut wr: WriteHalf<BoxConn>,
    mut rx: mpsc::Receiver<WriteRequest>,
) {
    loop {
        let req = tokio::select! {
            biased;
            _ = shared.close.closed() => return,
            req = rx.recv() => match req {
                Some(req) => req,
                None => return,
            },
        };

        let res = match req.cmd {
            CMD_DATA => {
                write_data_frame(&shared, &mut wr, req.data.unwrap_or_default()).await
            }
            cmd => carrier_write_all(&shared, &mut wr, &[cmd]).await.map(|_| 0),
        };

        match res {
            Ok(n) => {
                let _ = req.result.send(Ok(n));
            }
            Err(e) => {
                let _ = req.result.send(Err(e.clone().into()));
                shared.close_with_err(e);
                return;
            }
        }
    }
}

async fn carrier_write_all(
    shared: &Arc<Shared>,
    wr: &mut WriteHalf<BoxConn>,
    buf: &[u8],
) -> Result<(), SessionError> {
    let io = async {
        wr.write_all(buf).await?;
        wr.flush().await
    };
    match shared.opts.idle_timeout {
        Some(d) => timeout(d, io)
            .await
            .map_err(|_| SessionError::IoTimeout)?
            .map_err(SessionError::io),
        None => io.await.map_err(SessionError::io),
    }
}

/// Encodes `data` as DATA frames of at most 65535 payload bytes each, fusing
/// the 3-byte header with the head of the payload into one pooled write.
async fn write_data_frame(
    shared: &Arc<Shared>,
    wr: &mut WriteHalf<BoxConn>,
    data: Bytes,
) -> Result<usize, SessionError> {
    let mut written = 0usize;
    let mut remain = &data[..];
    let mut buf = alloc::get(1024);
    while !remain.is_empty() {
        let batch_len = remain.len().min(65535);
        let (batch, rest) = remain.split_at(batch_len);

        buf[0] = CMD_DATA;
        buf[1..3].copy_from_slice(&(batch_len as u16).to_be_bytes());
        let head = (buf.len() - 3).min(batch_len);
        buf[3..3 + head].copy_from_slice(&batch[..head]);
        carrier_write_all(shared, wr, &buf[..3 + head]).await?;
        written += head;

        if head < batch_len {
            carrier_write_all(shared, wr, &batch[head..]).await?;
            written += batch_len - head;
        }
        remain = rest;
    }
    Ok(written)
}

async fn ping_loop(shared: Arc<Shared>) {
    let Some(interval) = shared.opts.ping_interval else {
        return;
    };
    let ping_timeout = shared.opts.ping_timeout();

    loop {
        tokio::select! {
            biased;
            _ = shared.close.closed() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let (tx, _rx) = oneshot::channel();
        let req = WriteRequest {
            cmd: CMD_PING,
            data: None,
            result: tx,
        };
        tokio::select! {
            biased;
            _ = shared.close.closed() => return,
            _ = shared.write_tx.send(req) => {}
        }

        tokio::select! {
            biased;
            _ = shared.close.closed() => return,
            _ = tokio::time::sleep(ping_timeout) => {
                if shared.last_read_age() > ping_timeout {
                    shared.close_with_err(SessionError::PingTimeout);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    /// Collects the raw bytes a session emits for one stream write and
    /// checks the DATA batching: `[0x02, len_hi, len_lo, payload...]` with
    /// payload batches capped at 65535.
    #[tokio::test]
    async fn test_data_frame_encoding() {
        for payload_len in [1usize, 4096, 512 * 1024] {
            let (a, mut raw) = duplex(4 * 1024 * 1024);
            let sess = Session::new(Box::new(a), SessionOpts::default());
            let mut stream = sess.open().unwrap();

            let data: Vec<u8> = (0..payload_len).map(|i| (i % 251) as u8).collect();
            let send = data.clone();
            let writer = tokio::spawn(async move {
                stream.write_all(&send).await.unwrap();
            });

            let mut want = Vec::new();
            let mut remain = &data[..];
            while !remain.is_empty() {
                let batch = remain.len().min(65535);
                want.push(CMD_DATA);
                want.extend_from_slice(&(batch as u16).to_be_bytes());
                want.extend_from_slice(&remain[..batch]);
                remain = &remain[batch..];
            }

            let mut got = vec![0u8; want.len()];
            raw.read_exact(&mut got).await.unwrap();
            assert_eq!(got, want, "framing mismatch for {payload_len} bytes");
            writer.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_zero_length_data_frame_is_fatal() {
        let (a, mut raw) = duplex(1024);
        let sess = Session::new(
            Box::new(a),
            SessionOpts {
                accept_new_connection_from_peer: true,
                ..Default::default()
            },
        );
        raw.write_all(&[CMD_DATA, 0, 0]).await.unwrap();
        assert!(sess.accept().await.is_err());
        assert!(matches!(
            sess.close_err(),
            Some(SessionError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_unexpected_fin_is_fatal() {
        let (a, mut raw) = duplex(1024);
        let sess = Session::new(Box::new(a), SessionOpts::default());
        raw.write_all(&[CMD_FIN]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sess.is_closed());
    }

    #[tokio::test]
    async fn test_invalid_cmd_is_fatal() {
        let (a, mut raw) = duplex(1024);
        let sess = Session::new(Box::new(a), SessionOpts::default());
        raw.write_all(&[0x7F]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sess.is_closed());
    }

    #[tokio::test]
    async fn test_ping_answered_with_nop() {
        let (a, mut raw) = duplex(1024);
        let _sess = Session::new(Box::new(a), SessionOpts::default());
        raw.write_all(&[CMD_PING]).await.unwrap();
        let mut reply = [0u8; 1];
        tokio::time::timeout(Duration::from_secs(1), raw.read_exact(&mut reply))
            .await
            .expect("no reply to ping")
            .unwrap();
        assert_eq!(reply[0], CMD_NOP);
    }

    #[tokio::test]
    async fn test_nop_frames_ignored() {
        let (a, mut raw) = duplex(64 * 1024);
        let sess = Session::new(
            Box::new(a),
            SessionOpts {
                accept_new_connection_from_peer: true,
                ..Default::default()
            },
        );
        // NOPs interleaved with a DATA frame still deliver the payload.
        raw.write_all(&[CMD_NOP, CMD_NOP]).await.unwrap();
        raw.write_all(&[CMD_DATA, 0, 5]).await.unwrap();
        raw.write_all(b"hello").await.unwrap();

        let mut stream = sess.accept().await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }
}
