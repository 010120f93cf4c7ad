//! Mode header and multiplexing layer.
//!
//! After the auth preface the client writes one mode byte; the server
//! dispatches on it. Mux level 0 is a plain stream per carrier, level 1 a
//! pooled keepalive session, level >= 2 an N-stream mux where up to
//! `max_concurrent` streams share one carrier before a new one is dialed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::{BoxConn, Transport, TransportError, TransportHandler};
use crate::deadline::Latch;
use crate::keepalive::{SessPool, Session, SessionOpts};
use crate::mux::{MuxConfig, MuxSession, MuxStream};

pub const MODE_PLAIN: u8 = 0;
pub const MODE_SMUX: u8 = 1;
pub const MODE_KEEPALIVE: u8 = 2;

/// Writes the mode byte right after the inner dial.
struct ModeTransport {
    inner: Arc<dyn Transport>,
    mode: u8,
}

#[async_trait]
impl Transport for ModeTransport {
    async fn dial(&self) -> Result<BoxConn, TransportError> {
        let mut conn = self.inner.dial().await?;
        conn.write_all(&[self.mode]).await?;
        conn.flush().await?;
        Ok(conn)
    }
}

enum Pool {
    Plain(ModeTransport),
    Keepalive(Arc<SessPool>),
    Smux(Arc<SmuxPool>),
}

/// Client-side multiplexing transport.
pub struct MuxTransport {
    pool: Pool,
}

impl MuxTransport {
    pub fn new(inner: Arc<dyn Transport>, max_concurrent: usize, idle_timeout: Duration) -> Self {
        let pool = match max_concurrent {
            0 => Pool::Plain(ModeTransport {
                inner,
                mode: MODE_PLAIN,
            }),
            1 => Pool::Keepalive(Arc::new(SessPool::new(
                Arc::new(ModeTransport {
                    inner,
                    mode: MODE_KEEPALIVE,
                }),
                SessionOpts {
                    idle_timeout: Some(idle_timeout),
                    idle_connection_timeout: Some(idle_timeout),
                    ..Default::default()
                },
            ))),
            n => Pool::Smux(Arc::new(SmuxPool {
                dial: Arc::new(ModeTransport {
                    inner,
                    mode: MODE_SMUX,
                }),
                max_concurrent: n,
                config: MuxConfig::for_tunnel(idle_timeout),
                sessions: Arc::new(Mutex::new(Vec::new())),
                dialing: Arc::new(Mutex::new(DialState {
                    call: None,
                    waiting: 0,
                })),
            })),
        };
        Self { pool }
    }
}

#[async_trait]
impl Transport for MuxTransport {
    async fn dial(&self) -> Result<BoxConn, TransportError> {
        match &self.pool {
            Pool::Plain(t) => t.dial().await,
            Pool::Keepalive(pool) => Ok(Box::new(SessPool::get_conn(pool).await?)),
            Pool::Smux(pool) => Ok(Box::new(pool.get_stream().await?)),
        }
    }
}

struct DialState {
    call: Option<Arc<DialCall>>,
    waiting: usize,
}

/// A single in-flight carrier dial that multiple callers can await.
struct DialCall {
    done: Latch,
    result: Mutex<Option<Result<MuxSession, String>>>,
}

/// Pool of N-stream mux sessions with single-flight carrier dialing.
struct SmuxPool {
    dial: Arc<dyn Transport>,
    max_concurrent: usize,
    config: MuxConfig,
    sessions: Arc<Mutex<Vec<MuxSession>>>,
    dialing: Arc<Mutex<DialState>>,
}

impl SmuxPool {
    async fn get_stream(&self) -> Result<MuxStream, TransportError> {
        if let Some(stream) = self.try_get_stream().await {
            return Ok(stream);
        }
        self.get_stream_flash().await
    }

    /// Fast path: pick the first live session below the stream cap.
    async fn try_get_stream(&self) -> Option<MuxStream> {
        loop {
            let candidate = {
                let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
                sessions.retain(|s| !s.is_closed());
                sessions
                    .iter()
                    .find(|s| s.num_streams() < self.max_concurrent)
                    .cloned()
            };
            let sess = candidate?;
            match sess.open_stream().await {
                Ok(stream) => return Some(stream),
                Err(e) => {
                    debug!("mux session failed, dropping it: {e}");
                    sess.close();
                }
            }
        }
    }

    /// Slow path: attach to the in-flight dial, or start a new one when
    /// none is running or the current one already has a full carrier's
    /// worth of waiters. This packs `max_concurrent` cold-start streams
    /// onto one fresh carrier before a second is dialed.
    async fn get_stream_flash(&self) -> Result<MuxStream, TransportError> {
        let call = {
            let mut dialing = self.dialing.lock().unwrap_or_else(|p| p.into_inner());
            match dialing.call.clone() {
                Some(call) if dialing.waiting < self.max_concurrent => {
                    dialing.waiting += 1;
                    call
                }
                _ => {
                    dialing.waiting = 0;
                    let call = self.start_dial();
                    dialing.call = Some(Arc::clone(&call));
                    call
                }
            }
        };

        call.done.closed().await;
        let result = {
            let slot = call.result.lock().unwrap_or_else(|p| p.into_inner());
            slot.clone()
        };
        match result {
            Some(Ok(sess)) => sess
                .open_stream()
                .await
                .map_err(|e| TransportError::Mux(e.to_string())),
            Some(Err(e)) => Err(TransportError::DialFailed(e)),
            None => Err(TransportError::DialFailed("dial aborted".to_string())),
        }
    }

    fn start_dial(&self) -> Arc<DialCall> {
        let call = Arc::new(DialCall {
            done: Latch::new(),
            result: Mutex::new(None),
        });

        let dial = Arc::clone(&self.dial);
        let config = self.config.clone();
        let sessions = Arc::clone(&self.sessions);
        let dialing = Arc::clone(&self.dialing);
        let task_call = Arc::clone(&call);

        tokio::spawn(async move {
            let result = match dial.dial().await {
                Ok(conn) => {
                    let sess = MuxSession::client(conn, config);
                    sessions
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .push(sess.clone());
                    Ok(sess)
                }
                Err(e) => Err(e.to_string()),
            };
            {
                let mut slot = task_call.result.lock().unwrap_or_else(|p| p.into_inner());
                *slot = Some(result);
            }
            task_call.done.close();

            let mut d = dialing.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(current) = &d.call {
                if Arc::ptr_eq(current, &task_call) {
                    d.call = None;
                }
            }
        });

        call
    }
}

/// Server-side mode dispatch.
pub struct MuxTransportHandler {
    next: Arc<dyn TransportHandler>,
    mux_config: MuxConfig,
    keepalive_opts: SessionOpts,
}

impl MuxTransportHandler {
    pub fn new(next: Arc<dyn TransportHandler>, idle_timeout: Duration) -> Self {
        Self {
            next,
            mux_config: MuxConfig::for_tunnel(idle_timeout),
            keepalive_opts: SessionOpts {
                accept_new_connection_from_peer: true,
                idle_timeout: Some(idle_timeout),
                idle_connection_timeout: Some(idle_timeout),
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl TransportHandler for MuxTransportHandler {
    async fn handle(&self, mut conn: BoxConn) -> Result<(), TransportError> {
        let mut header = [0u8; 1];
        conn.read_exact(&mut header).await?;

        match header[0] {
            MODE_PLAIN => self.next.handle(conn).await,
            MODE_SMUX => {
                let sess = MuxSession::server(conn, self.mux_config.clone());
                loop {
                    let stream = match sess.accept_stream().await {
                        Ok(stream) => stream,
                        // Mux errors stay inside the session loop.
                        Err(_) => return Ok(()),
                    };
                    let next = Arc::clone(&self.next);
                    tokio::spawn(async move {
                        if let Err(e) = next.handle(Box::new(stream)).await {
                            debug!("mux stream handler: {e}");
                        }
                    });
                }
            }
            MODE_KEEPALIVE => {
                let sess = Session::new(conn, self.keepalive_opts.clone());
                loop {
                    let stream = match sess.accept().await {
                        Ok(stream) => stream,
                        Err(_) => return Ok(()),
                    };
                    // One stream at a time by protocol; handled in place.
                    if let Err(e) = self.next.handle(Box::new(stream)).await {
                        debug!("keepalive stream handler: {e}");
                    }
                }
            }
            other => Err(TransportError::BadMode(other)),
        }
    }
}
