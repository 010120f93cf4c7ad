//! SIP003 plugin environment.
//!
//! When running as a shadowsocks plugin, addresses arrive in
//! `SS_REMOTE_HOST`/`SS_REMOTE_PORT`/`SS_LOCAL_HOST`/`SS_LOCAL_PORT` and
//! free-form options in `SS_PLUGIN_OPTIONS` as `k[=v];k[=v];...`.
//! Either all four address variables are present or the process is not a
//! plugin; anything in between is a broken environment.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Sip003Error {
    #[error("invalid SIP003 args: incomplete address environment")]
    Broken,
}

/// Parsed SIP003 environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sip003Args {
    pub remote_host: String,
    pub remote_port: String,
    pub local_host: String,
    pub local_port: String,
    /// `SS_PLUGIN_OPTIONS` pairs in order; `None` values are boolean flags.
    pub plugin_options: Vec<(String, Option<String>)>,
}

impl Sip003Args {
    /// Reads the process environment. `Ok(None)` when not running as a
    /// plugin.
    pub fn from_env() -> Result<Option<Self>, Sip003Error> {
        let rh = std::env::var("SS_REMOTE_HOST").ok();
        let rp = std::env::var("SS_REMOTE_PORT").ok();
        let lh = std::env::var("SS_LOCAL_HOST").ok();
        let lp = std::env::var("SS_LOCAL_PORT").ok();
        let spo = std::env::var("SS_PLUGIN_OPTIONS").ok();

        let any = rh.is_some() || rp.is_some() || lh.is_some() || lp.is_some() || spo.is_some();
        if !any {
            return Ok(None);
        }
        let (Some(rh), Some(rp), Some(lh), Some(lp)) = (rh, rp, lh, lp) else {
            return Err(Sip003Error::Broken);
        };

        Ok(Some(Self {
            remote_host: rh,
            remote_port: rp,
            local_host: lh,
            local_port: lp,
            plugin_options: parse_plugin_options(spo.as_deref().unwrap_or("")),
        }))
    }

    pub fn remote_addr(&self) -> String {
        join_host_port(&self.remote_host, &self.remote_port)
    }

    pub fn local_addr(&self) -> String {
        join_host_port(&self.local_host, &self.local_port)
    }
}

/// Splits `k[=v];k[=v];...`; a key without `=` is a boolean flag.
pub fn parse_plugin_options(spo: &str) -> Vec<(String, Option<String>)> {
    spo.split(';')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((k, v)) => (k.to_string(), Some(v.to_string())),
            None => (part.to_string(), None),
        })
        .collect()
}

fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
