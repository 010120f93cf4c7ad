//! TLS 1.3 transport.
//!
//! Wraps an inner transport's connection in TLS and verifies the peer:
//! standard chain validation against the configured roots, an optional
//! certificate pin (prefix of the leaf's TBS SHA-256), or no verification at
//! all when explicitly requested. Both sides only ever offer TLS 1.3 and the
//! negotiated version is re-checked after the handshake.

use std::io::{BufReader, Cursor};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::client::Resumption;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, DigitallySignedStruct, ProtocolVersion, RootCertStore, ServerConfig,
    SignatureScheme,
};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::warn;

use super::{BoxConn, Transport, TransportError};
use crate::cert::tbs_sha256;
use crate::config::CaSource;

/// Handshake budget, independent of the idle timeout.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// TLS client transport over an inner dialer.
pub struct TlsTransport {
    inner: Box<dyn Transport>,
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsTransport {
    pub fn new(
        inner: Box<dyn Transport>,
        config: Arc<ClientConfig>,
        server_name: &str,
    ) -> Result<Self, TransportError> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| TransportError::Tls(format!("invalid server name: {e}")))?;
        Ok(Self {
            inner,
            connector: TlsConnector::from(config),
            server_name,
        })
    }
}

#[async_trait]
impl Transport for TlsTransport {
    async fn dial(&self) -> Result<BoxConn, TransportError> {
        let conn = self.inner.dial().await?;
        let stream = timeout(
            TLS_HANDSHAKE_TIMEOUT,
            self.connector.connect(self.server_name.clone(), conn),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::Tls(e.to_string()))?;

        if stream.get_ref().1.protocol_version() != Some(ProtocolVersion::TLSv1_3) {
            return Err(TransportError::TlsVersion);
        }
        Ok(Box::new(stream))
    }
}

/// Builds the client-side TLS configuration.
///
/// Precedence: certificate pin > insecure-skip-verify > chain validation
/// against `ca` (or the system store when no CA is configured).
pub fn build_client_tls(
    ca: Option<&CaSource>,
    cert_pin: Option<&[u8]>,
    insecure_skip_verify: bool,
    alpn: &[&[u8]],
) -> Result<Arc<ClientConfig>, TransportError> {
    let builder = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13]);

    let mut config = if let Some(pin) = cert_pin {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(CertHashVerifier::new(pin.to_vec())))
            .with_no_client_auth()
    } else if insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipVerify::new()))
            .with_no_client_auth()
    } else {
        builder
            .with_root_certificates(load_roots(ca)?)
            .with_no_client_auth()
    };

    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    config.resumption = Resumption::in_memory_sessions(64);
    Ok(Arc::new(config))
}

/// Builds the TLS 1.3-only server configuration.
pub fn build_server_tls(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    alpn: &[&[u8]],
) -> Result<Arc<ServerConfig>, TransportError> {
    let mut config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(config))
}

fn load_roots(ca: Option<&CaSource>) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();
    match ca {
        Some(source) => {
            let pem = match source {
                CaSource::File(path) => std::fs::read(path).map_err(|e| {
                    TransportError::Tls(format!("cannot read ca file {}: {e}", path.display()))
                })?,
                CaSource::Inline(pem) => pem.clone(),
            };
            let mut reader = BufReader::new(Cursor::new(pem));
            let certs = rustls_pemfile::certs(&mut reader)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| TransportError::Tls(format!("invalid ca pem: {e}")))?;
            if certs.is_empty() {
                return Err(TransportError::Tls("no certificate in ca pem".to_string()));
            }
            let (added, _) = roots.add_parsable_certificates(certs);
            if added == 0 {
                return Err(TransportError::Tls("no usable certificate in ca pem".to_string()));
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs()
                .map_err(|e| TransportError::Tls(format!("cannot load system roots: {e}")))?;
            let (_, ignored) = roots.add_parsable_certificates(native);
            if ignored > 0 {
                warn!("ignored {ignored} unparsable system root certificates");
            }
        }
    }
    Ok(roots)
}

/// Accepts the peer iff the SHA-256 of its leaf TBS certificate starts with
/// the configured pin. Chain, name, and validity checks are intentionally
/// skipped; the pin is the whole trust decision.
#[derive(Debug)]
struct CertHashVerifier {
    pin: Vec<u8>,
    provider: CryptoProvider,
}

impl CertHashVerifier {
    fn new(pin: Vec<u8>) -> Self {
        Self {
            pin,
            provider: rustls::crypto::ring::default_provider(),
        }
    }
}

impl ServerCertVerifier for CertHashVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let digest = tbs_sha256(end_entity.as_ref())
            .map_err(|e| rustls::Error::General(format!("cannot parse peer certificate: {e}")))?;
        let n = self.pin.len().min(digest.len());
        if n > 0 && self.pin[..n] == digest[..n] {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General("certificate hash mismatch".to_string()))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// `--no-verify`: accept anything.
#[derive(Debug)]
struct SkipVerify {
    provider: CryptoProvider,
}

impl SkipVerify {
    fn new() -> Self {
        Self {
            provider: rustls::crypto::ring::default_provider(),
        }
    }
}

impl ServerCertVerifier for SkipVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::generate_certificate;
    use rustls::pki_types::UnixTime;

    #[test]
    fn test_pin_verifier_prefix_match() {
        let generated = generate_certificate("pin.test").unwrap();
        let digest = tbs_sha256(generated.cert_der.as_ref()).unwrap();

        let leaf = generated.cert_der.clone();
        let name = ServerName::try_from("pin.test").unwrap();
        let now = UnixTime::now();

        // A 16-byte prefix pin accepts.
        let v = CertHashVerifier::new(digest[..16].to_vec());
        assert!(v.verify_server_cert(&leaf, &[], &name, &[], now).is_ok());

        // The full digest accepts.
        let v = CertHashVerifier::new(digest.to_vec());
        assert!(v.verify_server_cert(&leaf, &[], &name, &[], now).is_ok());

        // A wrong pin of the same length rejects.
        let mut bad = digest[..16].to_vec();
        bad[0] ^= 0xFF;
        let v = CertHashVerifier::new(bad);
        assert!(v.verify_server_cert(&leaf, &[], &name, &[], now).is_err());

        // An empty pin rejects rather than matching everything.
        let v = CertHashVerifier::new(Vec::new());
        assert!(v.verify_server_cert(&leaf, &[], &name, &[], now).is_err());
    }
}
