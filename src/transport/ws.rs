//! WebSocket carrier.
//!
//! Tunnels bytes as binary WebSocket messages. The client performs the
//! upgrade over a connection the TLS transport already dialed; the server
//! accepts the upgrade on its TLS listener, rejecting any unexpected path
//! with a plain 404 so probes see an ordinary web server.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Sink, Stream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use super::{BoxConn, Conn, Transport, TransportError};

/// Keep messages well under one TLS record.
const MAX_WS_CHUNK: usize = 32 * 1024;

fn ws_config() -> WebSocketConfig {
    WebSocketConfig {
        // Frames go to the underlying stream as they are produced.
        write_buffer_size: 0,
        ..WebSocketConfig::default()
    }
}

fn ws_io_err(e: tokio_tungstenite::tungstenite::Error) -> io::Error {
    match e {
        tokio_tungstenite::tungstenite::Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

/// Client-side WebSocket transport over an inner (TLS) dialer.
pub struct WebsocketTransport {
    inner: Box<dyn Transport>,
    url: String,
}

impl WebsocketTransport {
    /// An empty `path` means `/`.
    pub fn new(inner: Box<dyn Transport>, server_name: &str, path: &str) -> Self {
        let slash = if path.is_empty() || path.starts_with('/') {
            ""
        } else {
            "/"
        };
        let url = format!("wss://{server_name}{slash}{path}");
        Self { inner, url }
    }
}

#[async_trait]
impl Transport for WebsocketTransport {
    async fn dial(&self) -> Result<BoxConn, TransportError> {
        let conn = self.inner.dial().await?;
        let (ws, _resp) =
            tokio_tungstenite::client_async_with_config(self.url.as_str(), conn, Some(ws_config()))
                .await
                .map_err(|e| TransportError::Websocket(e.to_string()))?;
        Ok(Box::new(WsConn::new(ws)))
    }
}

/// Server side: performs the upgrade, returning 404 on a path mismatch.
pub async fn accept_websocket(
    conn: BoxConn,
    expect_path: &str,
) -> Result<WsConn<BoxConn>, TransportError> {
    let expect = expect_path.to_string();
    let check = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if !expect.is_empty() && req.uri().path() != expect {
            debug!("websocket upgrade rejected for path {}", req.uri().path());
            let mut not_found = ErrorResponse::new(None);
            *not_found.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::NOT_FOUND;
            return Err(not_found);
        }
        Ok(resp)
    };
    let ws = tokio_tungstenite::accept_hdr_async_with_config(conn, check, Some(ws_config()))
        .await
        .map_err(|e| TransportError::Websocket(e.to_string()))?;
    Ok(WsConn::new(ws))
}

/// Adapts a binary-message WebSocket to a byte stream.
pub struct WsConn<S> {
    ws: WebSocketStream<S>,
    unread: Bytes,
}

impl<S: Conn> WsConn<S> {
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self {
            ws,
            unread: Bytes::new(),
        }
    }
}

impl<S: Conn> tokio::io::AsyncRead for WsConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.unread.is_empty() {
                let n = this.unread.len().min(buf.remaining());
                buf.put_slice(&this.unread.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut this.ws).poll_next(cx)) {
                None => return Poll::Ready(Ok(())),
                Some(Err(e)) => return Poll::Ready(Err(ws_io_err(e))),
                Some(Ok(Message::Binary(data))) => this.unread = Bytes::from(data),
                Some(Ok(Message::Close(_))) => return Poll::Ready(Ok(())),
                // Pings are answered by the protocol layer; text is noise.
                Some(Ok(_)) => {}
            }
        }
    }
}

impl<S: Conn> tokio::io::AsyncWrite for WsConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Err(e) = ready!(Pin::new(&mut this.ws).poll_ready(cx)) {
            return Poll::Ready(Err(ws_io_err(e)));
        }
        let n = buf.len().min(MAX_WS_CHUNK);
        if let Err(e) = Pin::new(&mut this.ws).start_send(Message::Binary(buf[..n].to_vec())) {
            return Poll::Ready(Err(ws_io_err(e)));
        }
        // Push the frame along; a Pending flush completes on later writes.
        if let Poll::Ready(Err(e)) = Pin::new(&mut this.ws).poll_flush(cx) {
            return Poll::Ready(Err(ws_io_err(e)));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.ws).poll_flush(cx).map_err(ws_io_err)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.ws).poll_close(cx).map_err(ws_io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_ws_adapter_roundtrip() {
        let (a, b) = duplex(256 * 1024);

        let server = tokio::spawn(async move {
            let mut conn = accept_websocket(Box::new(b), "/tunnel").await.unwrap();
            let mut buf = vec![0u8; 128 * 1024];
            let mut total = Vec::new();
            loop {
                match conn.read(&mut buf).await.unwrap() {
                    0 => break,
                    n => {
                        conn.write_all(&buf[..n]).await.unwrap();
                        total.extend_from_slice(&buf[..n]);
                    }
                }
            }
            total.len()
        });

        let (ws, _) = tokio_tungstenite::client_async_with_config(
            "wss://example.com/tunnel",
            Box::new(a) as BoxConn,
            Some(ws_config()),
        )
        .await
        .unwrap();
        let mut client = WsConn::new(ws);

        let data = vec![0x42u8; 100 * 1024];
        client.write_all(&data).await.unwrap();
        let mut echoed = vec![0u8; data.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, data);

        client.shutdown().await.unwrap();
        assert_eq!(server.await.unwrap(), data.len());
    }

    #[tokio::test]
    async fn test_ws_path_mismatch_rejected() {
        let (a, b) = duplex(4096);

        let server =
            tokio::spawn(async move { accept_websocket(Box::new(b), "/123456").await.is_err() });

        let res = tokio_tungstenite::client_async_with_config(
            "wss://example.com/other",
            Box::new(a) as BoxConn,
            Some(ws_config()),
        )
        .await;
        assert!(res.is_err());
        assert!(server.await.unwrap());
    }
}
