//! veil-tls command line.
//!
//! One binary for both roles; `--server` selects the acceptor. Helper
//! commands (`--gen-cert`, `--hash-cert`) run and exit. When launched as a
//! SIP003 plugin the address environment overrides `-b`/`-d` and
//! `SS_PLUGIN_OPTIONS` is applied over the remaining flags.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use veil_tls::cert::{generate_certificate, hash_cert_file, tbs_sha256};
use veil_tls::client::Client;
use veil_tls::config::{CaSource, Carrier, ClientConfig, ServerConfig};
use veil_tls::server::Server;
use veil_tls::sip003::Sip003Args;
use veil_tls::sockopt::{listen_tcp, SocketOpts};

#[derive(Parser, Debug)]
#[command(name = "veil-tls")]
#[command(about = "TCP tunnel over TLS 1.3 with connection reuse and multiplexing")]
#[command(version)]
struct Args {
    /// [host:port] bind address
    #[arg(short = 'b', long, default_value = "")]
    bind: String,

    /// [host:port] destination address
    #[arg(short = 'd', long, default_value = "")]
    dst: String,

    /// Run as the server side
    #[arg(short = 's', long)]
    server: bool,

    /// Server name (SNI; certificate DNS name when generating)
    #[arg(short = 'n', long, default_value = "")]
    name: String,

    /// [path] PEM CA file used to verify the server
    #[arg(long)]
    ca: Option<PathBuf>,

    /// base64-encoded PEM CA used to verify the server
    #[arg(long, default_value = "")]
    cca: String,

    /// Hex pin: prefix of sha256 over the server leaf's TBS certificate
    #[arg(long = "cert-hash", default_value = "")]
    cert_hash: String,

    /// Skip server certificate verification
    #[arg(long = "no-verify")]
    no_verify: bool,

    /// [path] PEM certificate (server)
    #[arg(long)]
    cert: Option<PathBuf>,

    /// [path] PEM private key (server)
    #[arg(long)]
    key: Option<PathBuf>,

    /// Shared auth token
    #[arg(long, default_value = "")]
    auth: String,

    /// Mux level: 0 plain, 1 keepalive, >= 2 concurrent streams per carrier
    #[arg(long, default_value_t = 0)]
    mux: usize,

    /// Tunnel over WebSocket
    #[arg(long)]
    ws: bool,

    /// WebSocket path
    #[arg(long = "ws-path", default_value = "")]
    ws_path: String,

    /// Padding frames in plain mode
    #[arg(long)]
    pd: bool,

    /// Idle timeout in seconds
    #[arg(short = 't', long, default_value_t = 300)]
    timeout: u64,

    /// Enable TCP fast open (Linux 4.11+)
    #[arg(long = "fast-open")]
    fast_open: bool,

    /// Outgoing IP TTL
    #[arg(long)]
    ttl: Option<u32>,

    /// Worker threads
    #[arg(long)]
    cpu: Option<usize>,

    /// Android VPN mode: protect the tunnel's own sockets
    #[arg(long)]
    vpn: bool,

    /// Generate a key/cert pair, print its pin, and exit
    #[arg(long = "gen-cert")]
    gen_cert: bool,

    /// Print the pin of a PEM certificate and exit
    #[arg(long = "hash-cert")]
    hash_cert: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let mut args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log_level))
        .with_writer(std::io::stderr)
        .init();

    if args.gen_cert {
        return gen_cert(&args);
    }
    if let Some(path) = &args.hash_cert {
        println!("{}", hash_cert_file(path)?);
        return Ok(());
    }

    if let Some(sip) = Sip003Args::from_env()? {
        info!("running as a sip003 plugin");
        apply_plugin_options(&mut args, &sip.plugin_options);
        if args.server {
            args.bind = sip.remote_addr();
            args.dst = sip.local_addr();
        } else {
            args.bind = sip.local_addr();
            args.dst = sip.remote_addr();
        }
    }

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(n) = args.cpu {
        builder.worker_threads(n.max(1));
    }
    let runtime = builder.build().context("cannot build runtime")?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let socket = SocketOpts {
        fast_open: args.fast_open,
        ttl: args.ttl,
        vpn_protect: args.vpn,
    };
    let idle_timeout = std::time::Duration::from_secs(args.timeout);
    let carrier = if args.ws {
        Carrier::Websocket {
            path: args.ws_path.clone(),
        }
    } else {
        Carrier::Tcp
    };
    let auth = (!args.auth.is_empty()).then(|| args.auth.clone());

    if args.server {
        let cfg = ServerConfig {
            bind: args.bind.clone(),
            dst: args.dst.clone(),
            server_name: args.name.clone(),
            cert: args.cert.clone(),
            key: args.key.clone(),
            auth,
            idle_timeout,
            socket: socket.clone(),
            carrier,
            padding: args.pd,
        };
        let server = Server::new(&cfg)?;
        let listener = listen_tcp(&cfg.bind, &socket)
            .await
            .with_context(|| format!("cannot listen on {}", cfg.bind))?;
        tokio::select! {
            res = server.serve(listener) => res.map_err(Into::into),
            _ = tokio::signal::ctrl_c() => {
                info!("exiting on interrupt");
                Ok(())
            }
        }
    } else {
        let cfg = ClientConfig {
            bind: args.bind.clone(),
            server_addr: args.dst.clone(),
            server_name: args.name.clone(),
            ca: ca_source(&args)?,
            cert_pin: cert_pin(&args)?,
            insecure_skip_verify: args.no_verify,
            auth,
            mux: args.mux,
            idle_timeout,
            socket: socket.clone(),
            carrier,
            padding: args.pd,
        };
        let client = Client::new(&cfg)?;
        let listener = listen_tcp(&cfg.bind, &socket)
            .await
            .with_context(|| format!("cannot listen on {}", cfg.bind))?;
        tokio::select! {
            res = client.serve(listener) => res.map_err(Into::into),
            _ = tokio::signal::ctrl_c() => {
                info!("exiting on interrupt");
                Ok(())
            }
        }
    }
}

fn ca_source(args: &Args) -> Result<Option<CaSource>> {
    match (&args.ca, args.cca.is_empty()) {
        (Some(_), false) => bail!("--ca and --cca are mutually exclusive"),
        (Some(path), true) => Ok(Some(CaSource::File(path.clone()))),
        (None, false) => {
            let pem = BASE64
                .decode(args.cca.as_bytes())
                .context("--cca is not valid base64")?;
            Ok(Some(CaSource::Inline(pem)))
        }
        (None, true) => Ok(None),
    }
}

fn cert_pin(args: &Args) -> Result<Option<Vec<u8>>> {
    if args.cert_hash.is_empty() {
        return Ok(None);
    }
    let pin = hex::decode(&args.cert_hash).context("--cert-hash is not valid hex")?;
    if pin.is_empty() || pin.len() > 32 {
        bail!("--cert-hash must be 1..=32 bytes of hex");
    }
    Ok(Some(pin))
}

fn gen_cert(args: &Args) -> Result<()> {
    let generated = generate_certificate(&args.name)?;

    let key_path = args
        .key
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("{}.key", generated.dns_name)));
    let cert_path = args
        .cert
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("{}.cert", generated.dns_name)));

    info!("writing key to {}", key_path.display());
    std::fs::write(&key_path, generated.key_pem.as_bytes())
        .with_context(|| format!("cannot write {}", key_path.display()))?;
    info!("writing cert to {}", cert_path.display());
    std::fs::write(&cert_path, generated.cert_pem.as_bytes())
        .with_context(|| format!("cannot write {}", cert_path.display()))?;

    let pin = hex::encode(tbs_sha256(generated.cert_der.as_ref())?);
    println!("cert dns name: {}", generated.dns_name);
    println!("cert hash: {pin}");
    println!();
    println!("import this base64 cert on the client with --cca:");
    println!("{}", BASE64.encode(generated.cert_pem.as_bytes()));
    Ok(())
}

/// Applies `SS_PLUGIN_OPTIONS` pairs over the parsed flags. A key without a
/// value sets a boolean flag.
fn apply_plugin_options(args: &mut Args, opts: &[(String, Option<String>)]) {
    for (key, value) in opts {
        let value = value.as_deref();
        match key.as_str() {
            "s" => args.server = true,
            "b" => args.bind = value.unwrap_or_default().to_string(),
            "d" => args.dst = value.unwrap_or_default().to_string(),
            "n" => args.name = value.unwrap_or_default().to_string(),
            "ca" => args.ca = value.map(PathBuf::from),
            "cca" => args.cca = value.unwrap_or_default().to_string(),
            "cert-hash" => args.cert_hash = value.unwrap_or_default().to_string(),
            "no-verify" => args.no_verify = true,
            "cert" => args.cert = value.map(PathBuf::from),
            "key" => args.key = value.map(PathBuf::from),
            "auth" => args.auth = value.unwrap_or_default().to_string(),
            "mux" => match value.and_then(|v| v.parse().ok()) {
                Some(n) => args.mux = n,
                None => warn!("ignoring invalid mux option {value:?}"),
            },
            "ws" => args.ws = true,
            "ws-path" => args.ws_path = value.unwrap_or_default().to_string(),
            "pd" => args.pd = true,
            "t" => match value.and_then(|v| v.parse().ok()) {
                Some(n) => args.timeout = n,
                None => warn!("ignoring invalid t option {value:?}"),
            },
            "fast-open" => args.fast_open = true,
            "ttl" => args.ttl = value.and_then(|v| v.parse().ok()),
            "cpu" => args.cpu = value.and_then(|v| v.parse().ok()),
            "vpn" => args.vpn = true,
            other => warn!("ignoring unknown plugin option {other:?}"),
        }
    }
}
