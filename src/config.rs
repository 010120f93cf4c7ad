//! Typed runtime configuration.
//!
//! Built from CLI flags and SIP003 environment variables; there are no
//! configuration files.

use std::path::PathBuf;
use std::time::Duration;

use crate::sockopt::SocketOpts;
use crate::Error;

/// Where the client's trust anchors come from.
#[derive(Debug, Clone)]
pub enum CaSource {
    /// PEM file on disk.
    File(PathBuf),
    /// PEM bytes passed inline (base64 on the CLI).
    Inline(Vec<u8>),
}

/// Outer carrier selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Carrier {
    Tcp,
    Websocket { path: String },
}

impl Default for Carrier {
    fn default() -> Self {
        Carrier::Tcp
    }
}

/// Client-side configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Local address to accept plaintext connections on.
    pub bind: String,
    /// Remote tunnel server.
    pub server_addr: String,
    /// SNI; derived from `server_addr` when empty.
    pub server_name: String,
    pub ca: Option<CaSource>,
    /// Prefix of `sha256(leaf.TBSCertificate)`.
    pub cert_pin: Option<Vec<u8>>,
    pub insecure_skip_verify: bool,
    pub auth: Option<String>,
    /// 0 = plain, 1 = keepalive session, >= 2 = N-stream mux.
    pub mux: usize,
    pub idle_timeout: Duration,
    pub socket: SocketOpts,
    pub carrier: Carrier,
    /// Expect padding frames from the server (plain mode only).
    pub padding: bool,
}

impl ClientConfig {
    /// The SNI actually used: the configured name, or the host portion of
    /// the server address.
    pub fn effective_server_name(&self) -> String {
        if !self.server_name.is_empty() {
            return self.server_name.clone();
        }
        host_of(&self.server_addr)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.bind.is_empty() {
            return Err(Error::Config("missing bind address (-b)".to_string()));
        }
        if self.server_addr.is_empty() {
            return Err(Error::Config("missing destination address (-d)".to_string()));
        }
        if self.padding && self.mux > 0 {
            return Err(Error::Config(
                "padding is a plain-mode layer and cannot combine with mux".to_string(),
            ));
        }
        if self.insecure_skip_verify && self.cert_pin.is_some() {
            return Err(Error::Config(
                "--no-verify and --cert-hash are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Server-side configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to accept tunnel carriers on.
    pub bind: String,
    /// Destination TCP service.
    pub dst: String,
    /// Used only when generating a certificate at startup.
    pub server_name: String,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub auth: Option<String>,
    pub idle_timeout: Duration,
    pub socket: SocketOpts,
    pub carrier: Carrier,
    /// Frame and pad writes toward the client (plain mode only).
    pub padding: bool,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.bind.is_empty() {
            return Err(Error::Config("missing bind address (-b)".to_string()));
        }
        if self.dst.is_empty() {
            return Err(Error::Config("missing destination address (-d)".to_string()));
        }
        match (&self.cert, &self.key) {
            (Some(_), Some(_)) | (None, None) => {}
            _ => {
                return Err(Error::Config(
                    "--cert and --key must be given together".to_string(),
                ))
            }
        }
        Ok(())
    }
}

fn host_of(addr: &str) -> String {
    // "[::1]:443" -> "::1", "host:443" -> "host".
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return rest[..end].to_string();
        }
    }
    match addr.rsplit_once(':') {
        Some((host, _)) => host.to_string(),
        None => addr.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ClientConfig {
        ClientConfig {
            bind: "127.0.0.1:1080".to_string(),
            server_addr: "example.com:443".to_string(),
            server_name: String::new(),
            ca: None,
            cert_pin: None,
            insecure_skip_verify: false,
            auth: None,
            mux: 0,
            idle_timeout: Duration::from_secs(300),
            socket: SocketOpts::default(),
            carrier: Carrier::Tcp,
            padding: false,
        }
    }

    #[test]
    fn test_server_name_fallback() {
        let mut cfg = client();
        assert_eq!(cfg.effective_server_name(), "example.com");
        cfg.server_name = "other.net".to_string();
        assert_eq!(cfg.effective_server_name(), "other.net");
        cfg.server_name = String::new();
        cfg.server_addr = "[2001:db8::1]:443".to_string();
        assert_eq!(cfg.effective_server_name(), "2001:db8::1");
    }

    #[test]
    fn test_padding_requires_plain_mode() {
        let mut cfg = client();
        cfg.padding = true;
        assert!(cfg.validate().is_ok());
        cfg.mux = 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_cert_key_must_pair() {
        let cfg = ServerConfig {
            bind: "127.0.0.1:443".to_string(),
            dst: "127.0.0.1:8080".to_string(),
            server_name: String::new(),
            cert: Some(PathBuf::from("a.cert")),
            key: None,
            auth: None,
            idle_timeout: Duration::from_secs(300),
            socket: SocketOpts::default(),
            carrier: Carrier::Tcp,
            padding: false,
        };
        assert!(cfg.validate().is_err());
    }
}
