//! Client-side dispatcher: accept local connections, tunnel each through
//! the transport chain.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::config::{Carrier, ClientConfig};
use crate::padding::PaddingConn;
use crate::transport::{
    build_client_tls, AuthTransport, BoxConn, MuxTransport, RawConnTransport, TlsTransport,
    Transport, TransportError, WebsocketTransport,
};
use crate::tunnel::open_tunnel;
use crate::Error;

/// Budget for acquiring a server connection per local accept.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Wraps dialed carriers so reads strip the server's padding frames.
struct PaddingTransport {
    inner: Box<dyn Transport>,
}

#[async_trait]
impl Transport for PaddingTransport {
    async fn dial(&self) -> Result<BoxConn, TransportError> {
        let conn = self.inner.dial().await?;
        Ok(Box::new(PaddingConn::new(conn, true, false)))
    }
}

/// The client: a transport chain plus an accept loop.
pub struct Client {
    transport: Arc<dyn Transport>,
    idle_timeout: Duration,
}

impl Client {
    /// Builds the chain: TCP → TLS [→ WebSocket] [→ padding] [→ auth] → mux.
    pub fn new(cfg: &ClientConfig) -> Result<Self, Error> {
        cfg.validate()?;

        let server_name = cfg.effective_server_name();
        let alpn: &[&[u8]] = match cfg.carrier {
            Carrier::Tcp => &[b"h2", b"http/1.1"],
            Carrier::Websocket { .. } => &[b"http/1.1"],
        };
        let tls_config = build_client_tls(
            cfg.ca.as_ref(),
            cfg.cert_pin.as_deref(),
            cfg.insecure_skip_verify,
            alpn,
        )?;

        let raw = RawConnTransport::new(cfg.server_addr.clone(), cfg.socket.clone());
        let tls = TlsTransport::new(Box::new(raw), tls_config, &server_name)?;

        let mut chain: Box<dyn Transport> = match &cfg.carrier {
            Carrier::Tcp => Box::new(tls),
            Carrier::Websocket { path } => {
                Box::new(WebsocketTransport::new(Box::new(tls), &server_name, path))
            }
        };
        if cfg.padding {
            chain = Box::new(PaddingTransport { inner: chain });
        }
        if let Some(token) = &cfg.auth {
            chain = Box::new(AuthTransport::new(chain, token));
        }
        let transport = MuxTransport::new(Arc::from(chain), cfg.mux, cfg.idle_timeout);

        Ok(Self {
            transport: Arc::new(transport),
            idle_timeout: cfg.idle_timeout,
        })
    }

    /// Runs the accept loop. Per-connection failures are logged and
    /// swallowed; only a listener error ends the dispatcher.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Error> {
        info!(
            "client listening on {}",
            listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default()
        );
        loop {
            let (local, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("accept: {e}");
                    return Err(Error::Listener(e));
                }
            };
            let _ = local.set_nodelay(true);

            let transport = Arc::clone(&self.transport);
            let idle_timeout = self.idle_timeout;
            tokio::spawn(async move {
                let server_conn = match timeout(DIAL_TIMEOUT, transport.dial()).await {
                    Ok(Ok(conn)) => conn,
                    Ok(Err(e)) => {
                        error!("{peer}: dial server: {e}");
                        return;
                    }
                    Err(_) => {
                        error!("{peer}: dial server: timeout");
                        return;
                    }
                };

                if let Err(e) = open_tunnel(local, server_conn, idle_timeout).await {
                    debug!("{peer}: tunnel closed: {e}");
                }
            });
        }
    }
}
