//! Padding carrier layer.
//!
//! Sits between TLS and application bytes. Outgoing writes are framed as
//! DATA records; PADDING records with junk bodies can be interspersed and
//! are discarded by the reader. Frames never exceed 65535 bytes including
//! the 3-byte header, so each fits one TLS record.
//!
//! ```text
//! +--------+-----------------+------------------+
//! |  Type  |  Length (2 BE)  |  Body (len B)    |
//! +--------+-----------------+------------------+
//!    DATA=1, PADDING=2            len <= 65532
//! ```
//!
//! The side that encodes its writes also emits a small padding frame after
//! a delivered read when at least 10 ms have passed since the last one,
//! and only while the writer is idle, so padding never delays payload.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::alloc::{self, PooledBuf};
use crate::transport::Conn;

const TYPE_DATA: u8 = 1;
const TYPE_PADDING: u8 = 2;
const HEADER_SIZE: usize = 3;

/// Largest frame body; header + body stay within 65535 bytes.
pub const MAX_BODY: usize = 65535 - HEADER_SIZE;

const PADDING_INTERVAL: Duration = Duration::from_millis(10);
const SKIP_BUF_SIZE: usize = 1024;

/// Longest opportunistic padding frame: 3-byte header + 15-byte body.
const MAX_PAD_FRAME: usize = HEADER_SIZE + 15;

#[derive(Debug, Clone, Copy)]
enum ReadState {
    Header { pos: usize },
    Data { remaining: usize },
    SkipPadding { remaining: usize },
}

enum WriteState {
    Ready,
    Frame {
        buf: PooledBuf,
        frame_len: usize,
        pos: usize,
        consumed: usize,
    },
}

/// A connection whose reads and/or writes speak the padding framing.
pub struct PaddingConn<C> {
    inner: C,
    decode_read: bool,
    encode_write: bool,

    read_state: ReadState,
    header: [u8; HEADER_SIZE],
    skip_buf: [u8; SKIP_BUF_SIZE],

    write_state: WriteState,
    pending_pad: [u8; MAX_PAD_FRAME],
    pending_pad_len: usize,
    pending_pad_pos: usize,
    last_padding: Instant,
}

impl<C: Conn> PaddingConn<C> {
    /// `decode_read` strips frames from incoming bytes; `encode_write`
    /// frames outgoing bytes (and enables opportunistic padding).
    pub fn new(inner: C, decode_read: bool, encode_write: bool) -> Self {
        Self {
            inner,
            decode_read,
            encode_write,
            read_state: ReadState::Header { pos: 0 },
            header: [0u8; HEADER_SIZE],
            skip_buf: [0u8; SKIP_BUF_SIZE],
            write_state: WriteState::Ready,
            pending_pad: [0u8; MAX_PAD_FRAME],
            pending_pad_len: 0,
            pending_pad_pos: 0,
            last_padding: Instant::now(),
        }
    }

    /// Pushes any partially written padding frame. A half-sent frame must
    /// complete before the next data frame to keep the framing intact.
    fn poll_flush_pending_pad(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending_pad_pos < self.pending_pad_len {
            let n = ready!(Pin::new(&mut self.inner)
                .poll_write(cx, &self.pending_pad[self.pending_pad_pos..self.pending_pad_len]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending_pad_pos += n;
        }
        self.pending_pad_len = 0;
        self.pending_pad_pos = 0;
        Poll::Ready(Ok(()))
    }

    /// After a delivered read: queue a 4-15 byte padding frame when the
    /// interval has passed and the writer is idle, then push it as far as
    /// the socket allows without waiting.
    fn maybe_emit_padding(&mut self, cx: &mut Context<'_>) {
        if !self.encode_write
            || self.pending_pad_len > 0
            || !matches!(self.write_state, WriteState::Ready)
            || self.last_padding.elapsed() < PADDING_INTERVAL
        {
            return;
        }
        let body = rand::thread_rng().gen_range(4..=15usize);
        self.pending_pad[0] = TYPE_PADDING;
        self.pending_pad[1..3].copy_from_slice(&(body as u16).to_be_bytes());
        self.pending_pad[3..3 + body].fill(0);
        self.pending_pad_len = HEADER_SIZE + body;
        self.pending_pad_pos = 0;
        self.last_padding = Instant::now();

        // Best effort only; a Pending frame finishes before the next write.
        let _ = self.poll_flush_pending_pad(cx);
    }
}

impl<C: Conn> AsyncRead for PaddingConn<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.decode_read {
            let before = buf.filled().len();
            ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
            if buf.filled().len() > before {
                this.maybe_emit_padding(cx);
            }
            return Poll::Ready(Ok(()));
        }

        loop {
            match this.read_state {
                ReadState::Header { pos } => {
                    let mut header_buf = ReadBuf::new(&mut this.header[pos..]);
                    ready!(Pin::new(&mut this.inner).poll_read(cx, &mut header_buf))?;
                    let got = header_buf.filled().len();
                    if got == 0 {
                        if pos == 0 {
                            // Clean EOF between frames.
                            return Poll::Ready(Ok(()));
                        }
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                    let pos = pos + got;
                    if pos < HEADER_SIZE {
                        this.read_state = ReadState::Header { pos };
                        continue;
                    }
                    let len = u16::from_be_bytes([this.header[1], this.header[2]]) as usize;
                    match this.header[0] {
                        TYPE_DATA => {
                            if len == 0 {
                                // A zero-length data frame ends the stream.
                                return Poll::Ready(Ok(()));
                            }
                            this.read_state = ReadState::Data { remaining: len };
                        }
                        TYPE_PADDING => {
                            this.read_state = ReadState::SkipPadding { remaining: len };
                        }
                        other => {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                format!("unexpected frame type {other}"),
                            )));
                        }
                    }
                }
                ReadState::Data { remaining } => {
                    if buf.remaining() == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    let want = remaining.min(buf.remaining());
                    let mut limited = buf.take(want);
                    ready!(Pin::new(&mut this.inner).poll_read(cx, &mut limited))?;
                    let got = limited.filled().len();
                    if got == 0 {
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                    // `take` fills a detached view over the unfilled region;
                    // mirror its progress into the parent buffer.
                    unsafe { buf.assume_init(got) };
                    buf.advance(got);

                    let remaining = remaining - got;
                    this.read_state = if remaining == 0 {
                        ReadState::Header { pos: 0 }
                    } else {
                        ReadState::Data { remaining }
                    };
                    this.maybe_emit_padding(cx);
                    return Poll::Ready(Ok(()));
                }
                ReadState::SkipPadding { remaining } => {
                    let want = remaining.min(SKIP_BUF_SIZE);
                    let mut skip = ReadBuf::new(&mut this.skip_buf[..want]);
                    ready!(Pin::new(&mut this.inner).poll_read(cx, &mut skip))?;
                    let got = skip.filled().len();
                    if got == 0 {
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                    let remaining = remaining - got;
                    this.read_state = if remaining == 0 {
                        ReadState::Header { pos: 0 }
                    } else {
                        ReadState::SkipPadding { remaining }
                    };
                }
            }
        }
    }
}

impl<C: Conn> AsyncWrite for PaddingConn<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if !this.encode_write {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }

        loop {
            ready!(this.poll_flush_pending_pad(cx))?;
            match &mut this.write_state {
                WriteState::Ready => {
                    if buf.is_empty() {
                        return Poll::Ready(Ok(0));
                    }
                    let body = buf.len().min(MAX_BODY);
                    let mut frame = alloc::get(HEADER_SIZE + body);
                    frame[0] = TYPE_DATA;
                    frame[1..3].copy_from_slice(&(body as u16).to_be_bytes());
                    frame[3..3 + body].copy_from_slice(&buf[..body]);
                    this.write_state = WriteState::Frame {
                        buf: frame,
                        frame_len: HEADER_SIZE + body,
                        pos: 0,
                        consumed: body,
                    };
                }
                WriteState::Frame {
                    buf: frame,
                    frame_len,
                    pos,
                    consumed,
                } => {
                    while pos < frame_len {
                        let n = ready!(
                            Pin::new(&mut this.inner).poll_write(cx, &frame[*pos..*frame_len])
                        )?;
                        if n == 0 {
                            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                        }
                        *pos += n;
                    }
                    let consumed = *consumed;
                    this.write_state = WriteState::Ready;
                    return Poll::Ready(Ok(consumed));
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.encode_write {
            ready!(this.poll_flush_pending_pad(cx))?;
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.encode_write {
            ready!(this.poll_flush_pending_pad(cx))?;
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_roundtrip_with_interspersed_padding() {
        let (a, b) = duplex(256 * 1024);
        let mut tx = PaddingConn::new(a, true, true);
        let mut rx = PaddingConn::new(b, true, true);

        let mut data = vec![0u8; 512 * 1024];
        rand::thread_rng().fill_bytes(&mut data);

        let send = data.clone();
        let writer = tokio::spawn(async move {
            let chunk = 128 * 1024;
            for part in send.chunks(chunk) {
                tx.write_all(part).await.unwrap();
            }
            tx.shutdown().await.unwrap();
        });

        let mut got = vec![0u8; data.len()];
        rx.read_exact(&mut got).await.unwrap();
        assert_eq!(got, data);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_arbitrary_chunking() {
        let (a, b) = duplex(64 * 1024);
        let mut tx = PaddingConn::new(a, false, true);
        let mut rx = PaddingConn::new(b, true, false);

        let mut data = vec![0u8; 100 * 1024];
        rand::thread_rng().fill_bytes(&mut data);
        let send = data.clone();

        let writer = tokio::spawn(async move {
            let mut off = 0;
            while off < send.len() {
                let n = {
                    let mut rng = rand::thread_rng();
                    rng.gen_range(1..=8192).min(send.len() - off)
                };
                tx.write_all(&send[off..off + n]).await.unwrap();
                off += n;
            }
            tx.shutdown().await.unwrap();
        });

        let mut got = Vec::new();
        rx.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, data);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_padding_frames_are_invisible() {
        let (a, b) = duplex(64 * 1024);
        let mut raw = a;
        let mut rx = PaddingConn::new(b, true, false);

        // DATA "hi", PADDING 6 bytes, DATA "there".
        let mut wire = Vec::new();
        wire.extend_from_slice(&[TYPE_DATA, 0, 2, b'h', b'i']);
        wire.extend_from_slice(&[TYPE_PADDING, 0, 6]);
        wire.extend_from_slice(&[0u8; 6]);
        wire.extend_from_slice(&[TYPE_DATA, 0, 5]);
        wire.extend_from_slice(b"there");
        raw.write_all(&wire).await.unwrap();
        drop(raw);

        let mut got = Vec::new();
        rx.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"hithere");
    }

    #[tokio::test]
    async fn test_unknown_frame_type_is_error() {
        let (a, b) = duplex(1024);
        let mut raw = a;
        let mut rx = PaddingConn::new(b, true, false);

        raw.write_all(&[9, 0, 1, 0]).await.unwrap();
        let mut buf = [0u8; 8];
        let err = rx.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
