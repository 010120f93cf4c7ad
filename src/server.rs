//! Server-side acceptor: terminate TLS, unwind the transport chain, and
//! forward each stream to the destination.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::cert::{generate_certificate, load_certs, load_private_key, tbs_sha256};
use crate::config::{Carrier, ServerConfig};
use crate::padding::PaddingConn;
use crate::sockopt::{dial_tcp, tune_loopback_buffers, SocketOpts};
use crate::transport::{
    accept_websocket, build_server_tls, AuthTransportHandler, BoxConn, MuxTransportHandler,
    TransportError, TransportHandler, TLS_HANDSHAKE_TIMEOUT,
};
use crate::tunnel::open_tunnel;
use crate::Error;

/// Dials the configured destination and pumps the stream into it.
struct DestinationHandler {
    dst: String,
    idle_timeout: Duration,
}

#[async_trait]
impl TransportHandler for DestinationHandler {
    async fn handle(&self, conn: BoxConn) -> Result<(), TransportError> {
        let dst = timeout(
            Duration::from_secs(5),
            dial_tcp(&self.dst, &SocketOpts::default()),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::DialFailed(format!("cannot connect to the dst: {e}")))?;
        tune_loopback_buffers(&dst);

        open_tunnel(dst, conn, self.idle_timeout)
            .await
            .map_err(|e| TransportError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
    }
}

/// The server: TLS acceptor plus the reverse transport-handler chain.
pub struct Server {
    tls: Arc<rustls::ServerConfig>,
    handler: Arc<dyn TransportHandler>,
    carrier: Carrier,
    padding: bool,
}

impl Server {
    pub fn new(cfg: &ServerConfig) -> Result<Self, Error> {
        cfg.validate()?;

        let (certs, key) = match (&cfg.cert, &cfg.key) {
            (Some(cert), Some(key)) => (load_certs(cert)?, load_private_key(key)?),
            _ => {
                // No key pair configured: self-sign at startup so a bare
                // server is usable with a pinned client.
                let generated = generate_certificate(&cfg.server_name)?;
                let pin = hex::encode(tbs_sha256(generated.cert_der.as_ref())?);
                warn!(
                    "no certificate configured, generated one for {} (pin {})",
                    generated.dns_name, pin
                );
                (vec![generated.cert_der], generated.key_der)
            }
        };

        let alpn: &[&[u8]] = match cfg.carrier {
            Carrier::Tcp => &[b"h2", b"http/1.1"],
            Carrier::Websocket { .. } => &[b"http/1.1"],
        };
        let tls = build_server_tls(certs, key, alpn)?;

        let destination: Arc<dyn TransportHandler> = Arc::new(DestinationHandler {
            dst: cfg.dst.clone(),
            idle_timeout: cfg.idle_timeout,
        });
        let mux = MuxTransportHandler::new(destination, cfg.idle_timeout);
        let handler: Arc<dyn TransportHandler> = match &cfg.auth {
            Some(token) => Arc::new(AuthTransportHandler::new(Box::new(mux), token)),
            None => Arc::new(mux),
        };

        Ok(Self {
            tls,
            handler,
            carrier: cfg.carrier.clone(),
            padding: cfg.padding,
        })
    }

    /// Runs the accept loop. Per-carrier failures are logged and swallowed;
    /// only a listener error ends the acceptor.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Error> {
        let acceptor = TlsAcceptor::from(Arc::clone(&self.tls));
        info!(
            "server listening on {}",
            listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default()
        );
        loop {
            let (conn, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("accept: {e}");
                    return Err(Error::Listener(e));
                }
            };
            let _ = conn.set_nodelay(true);

            let acceptor = acceptor.clone();
            let handler = Arc::clone(&self.handler);
            let carrier = self.carrier.clone();
            let padding = self.padding;
            tokio::spawn(async move {
                if let Err(e) = handle_carrier(acceptor, handler, carrier, padding, conn).await {
                    debug!("{peer}: {e}");
                }
            });
        }
    }
}

async fn handle_carrier(
    acceptor: TlsAcceptor,
    handler: Arc<dyn TransportHandler>,
    carrier: Carrier,
    padding: bool,
    conn: tokio::net::TcpStream,
) -> Result<(), TransportError> {
    let tls_stream = timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(conn))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    if tls_stream.get_ref().1.protocol_version() != Some(rustls::ProtocolVersion::TLSv1_3) {
        return Err(TransportError::TlsVersion);
    }

    let mut conn: BoxConn = Box::new(tls_stream);
    if let Carrier::Websocket { path } = &carrier {
        conn = Box::new(accept_websocket(conn, path).await?);
    }
    if padding {
        // The server frames and pads its writes; reads stay raw.
        conn = Box::new(PaddingConn::new(conn, false, true));
    }
    handler.handle(conn).await
}
