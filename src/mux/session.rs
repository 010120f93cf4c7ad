//! Multiplexer session: carrier ownership and frame routing.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::trace;

use super::frame::{Cmd, FrameHeader, HEADER_SIZE};
use super::stream::MuxStream;
use super::MuxError;
use crate::alloc;
use crate::deadline::Latch;
use crate::transport::BoxConn;

/// Multiplexer parameters.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Largest PSH payload.
    pub max_frame_size: usize,
    /// Per-stream receive buffering.
    pub max_stream_buffer: usize,
    /// Carrier read/write budget; also the session liveness bound since no
    /// protocol keepalive frames are sent.
    pub idle_timeout: Option<Duration>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024,
            max_stream_buffer: 32 * 1024,
            idle_timeout: None,
        }
    }
}

impl MuxConfig {
    /// The tunnel's configuration: fixed frame limits, idle timeout bound
    /// to the tunnel idle timeout.
    pub fn for_tunnel(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout: Some(idle_timeout),
            ..Default::default()
        }
    }

    pub(crate) fn stream_chan_capacity(&self) -> usize {
        (self.max_stream_buffer / self.max_frame_size).max(1)
    }
}

/// One-shot close signal carrying the session's (or a stream's) first error.
pub(crate) struct MuxCloseLatch {
    latch: Latch,
    err: Mutex<Option<MuxError>>,
}

impl MuxCloseLatch {
    pub(crate) fn new() -> Self {
        Self {
            latch: Latch::new(),
            err: Mutex::new(None),
        }
    }

    pub(crate) fn close(&self, e: MuxError) -> bool {
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

    pub(crate) fn error(&self) -> Option<MuxError> {
        self.err.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub(crate) fn poll_closed(&self, cx: &mut Context<'_>) -> Poll<MuxError> {
        match self.latch.poll_closed(cx) {
            Poll::Ready(()) => Poll::Ready(self.error().unwrap_or(MuxError::SessionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }

    pub(crate) async fn closed(&self) -> MuxError {
        self.latch.closed().await;
        self.error().unwrap_or(MuxError::SessionClosed)
    }
}

/// A frame handed to the writer task, which always replies on `result`
/// once it has taken the request.
pub(crate) struct WriteFrame {
    pub(crate) header: FrameHeader,
    pub(crate) payload: Option<Bytes>,
    pub(crate) result: oneshot::Sender<io::Result<usize>>,
}

pub(crate) struct Slot {
    pub(crate) data_tx: mpsc::Sender<Bytes>,
    pub(crate) closed: Arc<MuxCloseLatch>,
}

pub(crate) struct MuxState {
    pub(crate) streams: HashMap<u32, Slot>,
    next_sid: u32,
}

pub(crate) struct MuxShared {
    pub(crate) config: MuxConfig,
    pub(crate) close: MuxCloseLatch,
    pub(crate) write_tx: mpsc::Sender<WriteFrame>,
    pub(crate) state: Mutex<MuxState>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
}

impl MuxShared {
    pub(crate) fn close_with_err(&self, e: MuxError) {
        self.close.close(e);
    }

    pub(crate) fn remove_stream(&self, sid: u32) {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.streams.remove(&sid);
    }
}

/// An N-stream multiplexer session over one carrier.
///
/// Cheap to clone; all clones share the carrier and stream table.
#[derive(Clone)]
pub struct MuxSession {
    shared: Arc<MuxShared>,
}

impl MuxSession {
    /// Client side: opens streams with odd ids.
    pub fn client(conn: BoxConn, config: MuxConfig) -> Self {
        Self::new(conn, config, 1)
    }

    /// Server side: accepts peer streams; own ids would be even.
    pub fn server(conn: BoxConn, config: MuxConfig) -> Self {
        Self::new(conn, config, 2)
    }

    fn new(conn: BoxConn, config: MuxConfig, first_sid: u32) -> Self {
        let (rd, wr) = tokio::io::split(conn);
        let (write_tx, write_rx) = mpsc::channel(1);
        let (accept_tx, accept_rx) = mpsc::channel(8);

        let shared = Arc::new(MuxShared {
            config,
            close: MuxCloseLatch::new(),
            write_tx,
            state: Mutex::new(MuxState {
                streams: HashMap::new(),
                next_sid: first_sid,
            }),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        });

        tokio::spawn(read_loop(Arc::clone(&shared), rd, accept_tx));
        tokio::spawn(write_loop(Arc::clone(&shared), wr, write_rx));

        Self { shared }
    }

    /// Opens a new outbound stream; resolves once the SYN is on the wire.
    pub async fn open_stream(&self) -> Result<MuxStream, MuxError> {
        if let Some(e) = self.shared.close.error() {
            return Err(e);
        }

        let (stream, sid) = {
            let mut st = self.shared.state.lock().unwrap_or_else(|p| p.into_inner());
            let sid = st.next_sid;
            st.next_sid = st.next_sid.wrapping_add(2);
            let (stream, slot) = MuxStream::pair(Arc::clone(&self.shared), sid);
            st.streams.insert(sid, slot);
            (stream, sid)
        };

        let (tx, rx) = oneshot::channel();
        let frame = WriteFrame {
            header: FrameHeader::new(Cmd::Syn, sid, 0),
            payload: None,
            result: tx,
        };
        let submitted = tokio::select! {
            biased;
            e = self.shared.close.closed() => Err(e),
            r = self.shared.write_tx.send(frame) => {
                r.map_err(|_| MuxError::SessionClosed)
            }
        };
        if let Err(e) = submitted {
            self.shared.remove_stream(sid);
            return Err(e);
        }
        match rx.await {
            Ok(Ok(_)) => Ok(stream),
            Ok(Err(e)) => {
                self.shared.remove_stream(sid);
                Err(MuxError::io(e))
            }
            Err(_) => {
                self.shared.remove_stream(sid);
                Err(self.shared.close.error().unwrap_or(MuxError::SessionClosed))
            }
        }
    }

    /// Waits for a peer-initiated stream.
    pub async fn accept_stream(&self) -> Result<MuxStream, MuxError> {
        if let Some(e) = self.shared.close.error() {
            return Err(e);
        }
        let mut rx = self.shared.accept_rx.lock().await;
        tokio::select! {
            stream = rx.recv() => {
                stream.ok_or_else(|| self.shared.close.error().unwrap_or(MuxError::SessionClosed))
            }
            e = self.shared.close.closed() => Err(e),
        }
    }

    /// Number of live streams.
    pub fn num_streams(&self) -> usize {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .streams
            .len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.close.is_closed()
    }

    pub fn close(&self) {
        self.shared.close_with_err(MuxError::SessionClosed);
    }
}

async fn carrier_read(
    shared: &Arc<MuxShared>,
    rd: &mut ReadHalf<BoxConn>,
    buf: &mut [u8],
) -> Result<usize, MuxError> {
    match shared.config.idle_timeout {
        Some(d) => tokio::select! {
            biased;
            e = shared.close.closed() => Err(e),
            r = timeout(d, rd.read(buf)) => r
                .map_err(|_| MuxError::IoTimeout)?
                .map_err(MuxError::io),
        },
        None => tokio::select! {
            biased;
            e = shared.close.closed() => Err(e),
            r = rd.read(buf) => r.map_err(MuxError::io),
        },
    }
}

async fn carrier_read_exact(
    shared: &Arc<MuxShared>,
    rd: &mut ReadHalf<BoxConn>,
    buf: &mut [u8],
) -> Result<(), MuxError> {
    let mut off = 0;
    while off < buf.len() {
        let n = carrier_read(shared, rd, &mut buf[off..]).await?;
        if n == 0 {
            return Err(MuxError::protocol("unexpected eof on carrier"));
        }
        off += n;
    }
    Ok(())
}

async fn read_loop(
    shared: Arc<MuxShared>,
    mut rd: ReadHalf<BoxConn>,
    accept_tx: mpsc::Sender<MuxStream>,
) {
    if let Err(e) = read_loop_inner(&shared, &mut rd, &accept_tx).await {
        shared.close_with_err(e);
    }
}

async fn read_loop_inner(
    shared: &Arc<MuxShared>,
    rd: &mut ReadHalf<BoxConn>,
    accept_tx: &mpsc::Sender<MuxStream>,
) -> Result<(), MuxError> {
    let mut header_buf = [0u8; HEADER_SIZE];

    loop {
        carrier_read_exact(shared, rd, &mut header_buf).await?;
        let header = FrameHeader::decode(&header_buf)?;

        match header.cmd {
            Cmd::Nop => {}
            Cmd::Syn => {
                let stream = {
                    let mut st = shared.state.lock().unwrap_or_else(|p| p.into_inner());
                    if st.streams.contains_key(&header.sid) {
                        return Err(MuxError::protocol(format!(
                            "duplicate syn for stream {}",
                            header.sid
                        )));
                    }
                    let (stream, slot) = MuxStream::pair(Arc::clone(shared), header.sid);
                    st.streams.insert(header.sid, slot);
                    stream
                };
                tokio::select! {
                    biased;
                    e = shared.close.closed() => return Err(e),
                    r = accept_tx.send(stream) => {
                        if r.is_err() {
                            return Err(MuxError::SessionClosed);
                        }
                    }
                }
            }
            Cmd::Fin => {
                let slot = {
                    let mut st = shared.state.lock().unwrap_or_else(|p| p.into_inner());
                    st.streams.remove(&header.sid)
                };
                match slot {
                    Some(slot) => {
                        slot.closed.close(MuxError::PeerClosed);
                    }
                    // Both sides may close concurrently; a FIN for a stream
                    // we already dropped is not an error.
                    None => trace!("fin for unknown stream {}", header.sid),
                }
            }
            Cmd::Psh => {
                let len = header.len as usize;
                if len == 0 {
                    continue;
                }
                let target = {
                    let st = shared.state.lock().unwrap_or_else(|p| p.into_inner());
                    st.streams
                        .get(&header.sid)
                        .map(|s| (s.data_tx.clone(), Arc::clone(&s.closed)))
                };
                match target {
                    Some((data_tx, closed)) => {
                        deliver_payload(shared, rd, len, &data_tx, &closed).await?;
                    }
                    None => {
                        // Late data after our own FIN.
                        trace!("discarding {len} bytes for unknown stream {}", header.sid);
                        discard_read(shared, rd, len).await?;
                    }
                }
            }
        }
    }
}

async fn deliver_payload(
    shared: &Arc<MuxShared>,
    rd: &mut ReadHalf<BoxConn>,
    len: usize,
    data_tx: &mpsc::Sender<Bytes>,
    closed: &Arc<MuxCloseLatch>,
) -> Result<(), MuxError> {
    let mut remain = len;
    let mut buf = alloc::get(shared.config.max_frame_size.min(remain));
    while remain > 0 {
        let want = remain.min(buf.len());
        let n = carrier_read(shared, rd, &mut buf[..want]).await?;
        if n == 0 {
            return Err(MuxError::protocol("unexpected eof in psh frame"));
        }
        remain -= n;
        let chunk = Bytes::copy_from_slice(&buf[..n]);
        let chunk_len = chunk.len();
        tokio::select! {
            biased;
            e = shared.close.closed() => return Err(e),
            _ = closed.closed() => {
                trace!("dropping {} bytes for closed stream", chunk_len);
            }
            _ = data_tx.send(chunk) => {}
        }
    }
    Ok(())
}

async fn discard_read(
    shared: &Arc<MuxShared>,
    rd: &mut ReadHalf<BoxConn>,
    len: usize,
) -> Result<(), MuxError> {
    let mut remain = len;
    let mut buf = alloc::get(remain.min(4096));
    while remain > 0 {
        let want = remain.min(buf.len());
        let n = carrier_read(shared, rd, &mut buf[..want]).await?;
        if n == 0 {
            return Err(MuxError::protocol("unexpected eof while discarding"));
        }
        remain -= n;
    }
    Ok(())
}

async fn write_loop(
    shared: Arc<MuxShared>,
    mut wr: WriteHalf<BoxConn>,
    mut rx: mpsc::Receiver<WriteFrame>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.close.closed() => return,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
        };

        let res = write_frame(&shared, &mut wr, &frame).await;
        match res {
            Ok(n) => {
                let _ = frame.result.send(Ok(n));
            }
            Err(e) => {
                let _ = frame.result.send(Err(e.clone().into()));
                shared.close_with_err(e);
                return;
            }
        }
    }
}

async fn write_frame(
    shared: &Arc<MuxShared>,
    wr: &mut WriteHalf<BoxConn>,
    frame: &WriteFrame,
) -> Result<usize, MuxError> {
    let payload = frame.payload.as_deref().unwrap_or(&[]);
    let io = async {
        wr.write_all(&frame.header.encode()).await?;
        if !payload.is_empty() {
            wr.write_all(payload).await?;
        }
        wr.flush().await
    };
    let res = match shared.config.idle_timeout {
        Some(d) => timeout(d, io).await.map_err(|_| MuxError::IoTimeout)?,
        None => io.await,
    };
    res.map_err(MuxError::io)?;
    Ok(payload.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    fn pipe_sessions() -> (MuxSession, MuxSession) {
        let (a, b) = duplex(256 * 1024);
        let client = MuxSession::client(Box::new(a), MuxConfig::default());
        let server = MuxSession::server(Box::new(b), MuxConfig::default());
        (client, server)
    }

    #[tokio::test]
    async fn test_open_accept_stream_ids() {
        let (client, server) = pipe_sessions();

        let s1 = client.open_stream().await.unwrap();
        let s2 = client.open_stream().await.unwrap();
        assert_eq!(s1.id(), 1);
        assert_eq!(s2.id(), 3);
        assert_eq!(client.num_streams(), 2);

        let p1 = server.accept_stream().await.unwrap();
        let p2 = server.accept_stream().await.unwrap();
        assert_eq!(p1.id(), 1);
        assert_eq!(p2.id(), 3);
        assert_eq!(server.num_streams(), 2);
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        use tokio::io::AsyncReadExt;
        let (client, server) = pipe_sessions();

        let data = vec![0x5Au8; 200 * 1024];
        let send = data.clone();
        let writer = tokio::spawn(async move {
            let mut s = client.open_stream().await.unwrap();
            s.write_all(&send).await.unwrap();
            s.shutdown().await.unwrap();
        });

        let mut s = server.accept_stream().await.unwrap();
        let mut got = Vec::new();
        s.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, data);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_streams_isolated() {
        use tokio::io::AsyncReadExt;
        let (client, server) = pipe_sessions();

        let mut writers = Vec::new();
        for i in 0..5u8 {
            let client = client.clone();
            writers.push(tokio::spawn(async move {
                let mut s = client.open_stream().await.unwrap();
                let payload = vec![i; 64 * 1024 + i as usize];
                s.write_all(&payload).await.unwrap();
                s.shutdown().await.unwrap();
            }));
        }

        for _ in 0..5 {
            let server = server.clone();
            let mut s = server.accept_stream().await.unwrap();
            let mut got = Vec::new();
            s.read_to_end(&mut got).await.unwrap();
            assert!(!got.is_empty());
            let tag = got[0];
            assert_eq!(got.len(), 64 * 1024 + tag as usize);
            assert!(got.iter().all(|&b| b == tag), "cross-stream byte leakage");
        }
        for w in writers {
            w.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_bad_version_closes_session() {
        let (a, b) = duplex(1024);
        let server = MuxSession::server(Box::new(b), MuxConfig::default());

        let mut raw = a;
        raw.write_all(&[9, 0, 0, 0, 0, 0, 0, 0]).await.unwrap();
        raw.flush().await.unwrap();

        assert!(server.accept_stream().await.is_err());
        assert!(server.is_closed());
    }
}
