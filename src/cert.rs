//! Certificate loading, generation, and pinning helpers.
//!
//! The pin of a certificate is the SHA-256 of its TBS (to-be-signed)
//! section; clients may configure any prefix of it. Self-signed generation
//! mirrors what a minimal deployment needs: P-256 ECDSA, ten-year validity,
//! and a plausible random DNS name when none is configured.

use std::io::BufReader;
use std::path::Path;

use rand::Rng;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_parser::parse_x509_certificate;

/// Certificate errors.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid PEM in {0}")]
    Pem(String),

    #[error("cannot parse certificate: {0}")]
    Parse(String),

    #[error("cannot generate certificate: {0}")]
    Generate(String),
}

/// SHA-256 over the raw TBS section of a DER certificate.
pub fn tbs_sha256(cert_der: &[u8]) -> Result<[u8; 32], CertError> {
    let (_, cert) =
        parse_x509_certificate(cert_der).map_err(|e| CertError::Parse(e.to_string()))?;
    let digest = Sha256::digest(cert.tbs_certificate.as_ref());
    Ok(digest.into())
}

/// Reads the first certificate of a PEM file and returns its pin as hex.
pub fn hash_cert_file(path: &Path) -> Result<String, CertError> {
    let certs = load_certs(path)?;
    let first = certs
        .first()
        .ok_or_else(|| CertError::Pem(path.display().to_string()))?;
    Ok(hex::encode(tbs_sha256(first.as_ref())?))
}

/// Loads a PEM certificate chain.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let mut reader = BufReader::new(std::fs::File::open(path)?);
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|_| CertError::Pem(path.display().to_string()))?;
    if certs.is_empty() {
        return Err(CertError::Pem(path.display().to_string()));
    }
    Ok(certs)
}

/// Loads a PEM private key (PKCS#8 or SEC1).
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, CertError> {
    let mut reader = BufReader::new(std::fs::File::open(path)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|_| CertError::Pem(path.display().to_string()))?
        .ok_or_else(|| CertError::Pem(path.display().to_string()))
}

/// A freshly generated self-signed certificate.
pub struct GeneratedCert {
    /// The DNS name baked into the certificate.
    pub dns_name: String,
    /// PKCS#8 private key PEM.
    pub key_pem: String,
    /// Certificate PEM.
    pub cert_pem: String,
    /// Certificate DER, ready for a rustls config.
    pub cert_der: CertificateDer<'static>,
    /// Private key DER, ready for a rustls config.
    pub key_der: PrivateKeyDer<'static>,
}

/// Generates a self-signed P-256 server certificate.
///
/// An empty `server_name` gets a random `<3-7 letters>.<1-3 letters>` name.
/// Serial is uniform below 2^128; validity is ten years.
pub fn generate_certificate(server_name: &str) -> Result<GeneratedCert, CertError> {
    let dns_name = if server_name.is_empty() {
        random_server_name()
    } else {
        server_name.to_string()
    };

    let mut params = CertificateParams::new(vec![dns_name.clone()])
        .map_err(|e| CertError::Generate(e.to_string()))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, dns_name.clone());
    params.distinguished_name = dn;

    let serial: [u8; 16] = rand::thread_rng().gen();
    params.serial_number = Some(SerialNumber::from_slice(&serial));

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(365 * 10);

    params.key_usages = vec![
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| CertError::Generate(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Generate(e.to_string()))?;

    let key_der =
        PrivateKeyDer::Pkcs8(rustls::pki_types::PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    Ok(GeneratedCert {
        dns_name,
        key_pem: key_pair.serialize_pem(),
        cert_pem: cert.pem(),
        cert_der: cert.der().clone(),
        key_der,
    })
}

fn random_server_name() -> String {
    let mut rng = rand::thread_rng();
    let head = rng.gen_range(3..=7);
    let tail = rng.gen_range(1..=3);
    format!("{}.{}", random_letters(head), random_letters(tail))
}

fn random_letters(n: usize) -> String {
    const SET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| SET[rng.gen_range(0..SET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_pin() {
        let generated = generate_certificate("example.com").unwrap();
        assert_eq!(generated.dns_name, "example.com");
        assert!(generated.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(generated.key_pem.contains("PRIVATE KEY"));

        let pin = tbs_sha256(generated.cert_der.as_ref()).unwrap();
        // Deterministic for the same DER.
        assert_eq!(pin, tbs_sha256(generated.cert_der.as_ref()).unwrap());
        // Different certs hash differently.
        let other = generate_certificate("example.com").unwrap();
        assert_ne!(pin, tbs_sha256(other.cert_der.as_ref()).unwrap());
    }

    #[test]
    fn test_random_server_name_shape() {
        for _ in 0..32 {
            let name = random_server_name();
            let (head, tail) = name.split_once('.').unwrap();
            assert!((3..=7).contains(&head.len()));
            assert!((1..=3).contains(&tail.len()));
            assert!(name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c == '.'));
        }
    }

    #[test]
    fn test_generated_material_roundtrips_through_loaders() {
        let generated = generate_certificate("").unwrap();

        let dir = std::env::temp_dir();
        let cert_path = dir.join(format!("veil-tls-test-{}.cert", generated.dns_name));
        let key_path = dir.join(format!("veil-tls-test-{}.key", generated.dns_name));
        std::fs::write(&cert_path, &generated.cert_pem).unwrap();
        std::fs::write(&key_path, &generated.key_pem).unwrap();

        let certs = load_certs(&cert_path).unwrap();
        assert_eq!(certs.len(), 1);
        load_private_key(&key_path).unwrap();

        let hex_pin = hash_cert_file(&cert_path).unwrap();
        assert_eq!(
            hex_pin,
            hex::encode(tbs_sha256(generated.cert_der.as_ref()).unwrap())
        );

        let _ = std::fs::remove_file(cert_path);
        let _ = std::fs::remove_file(key_path);
    }
}
