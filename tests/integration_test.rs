//! End-to-end tests: a real echo service behind a server-side core, reached
//! through a client-side core over loopback TLS.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use veil_tls::cert::{generate_certificate, tbs_sha256};
use veil_tls::client::Client;
use veil_tls::config::{CaSource, Carrier, ClientConfig, ServerConfig};
use veil_tls::server::Server;
use veil_tls::sockopt::SocketOpts;

const DATA_SIZE: usize = 512 * 1024;
const TEST_TIMEOUT: Duration = Duration::from_secs(15);

static FILE_SEQ: AtomicUsize = AtomicUsize::new(0);

fn random_data(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if conn.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

struct CertFiles {
    cert: PathBuf,
    key: PathBuf,
    cert_pem: Vec<u8>,
    pin: [u8; 32],
}

fn write_test_cert(name: &str) -> CertFiles {
    let generated = generate_certificate(name).unwrap();
    let seq = FILE_SEQ.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir();
    let cert = dir.join(format!("veil-tls-it-{}-{seq}.cert", std::process::id()));
    let key = dir.join(format!("veil-tls-it-{}-{seq}.key", std::process::id()));
    std::fs::write(&cert, &generated.cert_pem).unwrap();
    std::fs::write(&key, &generated.key_pem).unwrap();
    CertFiles {
        cert,
        key,
        cert_pem: generated.cert_pem.into_bytes(),
        pin: tbs_sha256(generated.cert_der.as_ref()).unwrap(),
    }
}

struct Setup {
    client_addr: SocketAddr,
}

/// Boots echo + server core + client core, applying `tweak` to both configs
/// before starting. Returns the client's local bind address.
async fn boot<F>(mux: usize, tweak: F) -> Setup
where
    F: FnOnce(&mut ClientConfig, &mut ServerConfig, &CertFiles),
{
    let echo_addr = spawn_echo().await;
    let cert = write_test_cert("test.example");

    let mut server_cfg = ServerConfig {
        bind: String::new(),
        dst: echo_addr.to_string(),
        server_name: "test.example".to_string(),
        cert: Some(cert.cert.clone()),
        key: Some(cert.key.clone()),
        auth: None,
        idle_timeout: Duration::from_secs(10),
        socket: SocketOpts::default(),
        carrier: Carrier::Tcp,
        padding: false,
    };
    let mut client_cfg = ClientConfig {
        bind: String::new(),
        server_addr: String::new(),
        server_name: "test.example".to_string(),
        ca: Some(CaSource::Inline(cert.cert_pem.clone())),
        cert_pin: None,
        insecure_skip_verify: false,
        auth: None,
        mux,
        idle_timeout: Duration::from_secs(10),
        socket: SocketOpts::default(),
        carrier: Carrier::Tcp,
        padding: false,
    };
    tweak(&mut client_cfg, &mut server_cfg, &cert);

    let server_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    client_cfg.server_addr = server_listener.local_addr().unwrap().to_string();
    server_cfg.bind = client_cfg.server_addr.clone();

    let server = Server::new(&server_cfg).unwrap();
    tokio::spawn(async move {
        let _ = server.serve(server_listener).await;
    });

    let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client_addr = client_listener.local_addr().unwrap();
    client_cfg.bind = client_addr.to_string();
    let client = Client::new(&client_cfg).unwrap();
    tokio::spawn(async move {
        let _ = client.serve(client_listener).await;
    });

    Setup { client_addr }
}

async fn echo_roundtrip(addr: SocketAddr, len: usize) {
    let mut conn = TcpStream::connect(addr).await.unwrap();
    let data = random_data(len);
    conn.write_all(&data).await.unwrap();

    let mut got = vec![0u8; len];
    timeout(TEST_TIMEOUT, conn.read_exact(&mut got))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(got, data, "corrupted data");
}

#[tokio::test]
async fn test_plain_echo() {
    let setup = boot(0, |_, _, _| {}).await;
    for _ in 0..3 {
        echo_roundtrip(setup.client_addr, DATA_SIZE).await;
    }
}

#[tokio::test]
async fn test_keepalive_echo_reuses_carrier() {
    let setup = boot(1, |_, _, _| {}).await;
    for _ in 0..5 {
        echo_roundtrip(setup.client_addr, DATA_SIZE).await;
    }
}

#[tokio::test]
async fn test_smux_concurrent_streams() {
    let setup = boot(5, |_, _, _| {}).await;

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let addr = setup.client_addr;
        tasks.push(tokio::spawn(async move {
            echo_roundtrip(addr, DATA_SIZE).await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn test_websocket_carrier() {
    let setup = boot(0, |client, server, _| {
        client.carrier = Carrier::Websocket {
            path: "/123456".to_string(),
        };
        server.carrier = Carrier::Websocket {
            path: "/123456".to_string(),
        };
    })
    .await;
    echo_roundtrip(setup.client_addr, DATA_SIZE).await;
}

#[tokio::test]
async fn test_padding_plain_mode() {
    let setup = boot(0, |client, server, _| {
        client.padding = true;
        server.padding = true;
    })
    .await;
    echo_roundtrip(setup.client_addr, DATA_SIZE).await;
}

#[tokio::test]
async fn test_auth_token_accepted() {
    let setup = boot(1, |client, server, _| {
        client.auth = Some("123456".to_string());
        server.auth = Some("123456".to_string());
    })
    .await;
    echo_roundtrip(setup.client_addr, DATA_SIZE).await;
}

#[tokio::test]
async fn test_auth_mismatch_gets_silence() {
    let setup = boot(0, |client, server, _| {
        client.auth = Some("wrong-token".to_string());
        server.auth = Some("123456".to_string());
    })
    .await;

    let mut conn = TcpStream::connect(setup.client_addr).await.unwrap();
    conn.write_all(b"probe").await.unwrap();

    // The server drains instead of answering or resetting; the probe sees
    // an open but mute carrier.
    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(3), conn.read(&mut buf)).await;
    assert!(read.is_err(), "auth failure must not produce a response");
}

#[tokio::test]
async fn test_cert_pin_accepts_prefix() {
    let setup = boot(0, |client, _, cert| {
        client.ca = None;
        client.cert_pin = Some(cert.pin[..16].to_vec());
    })
    .await;
    echo_roundtrip(setup.client_addr, DATA_SIZE).await;
}

#[tokio::test]
async fn test_cert_pin_mismatch_rejected() {
    let setup = boot(0, |client, _, _| {
        client.ca = None;
        client.cert_pin = Some(vec![0xAB; 16]);
    })
    .await;

    let mut conn = TcpStream::connect(setup.client_addr).await.unwrap();
    conn.write_all(b"x").await.unwrap();

    // The dial dies in the handshake; no payload ever crosses.
    let mut buf = [0u8; 1];
    let res = timeout(Duration::from_secs(5), conn.read(&mut buf)).await;
    match res {
        Ok(Ok(0)) | Ok(Err(_)) => {}
        Ok(Ok(n)) => panic!("{n} payload bytes crossed a pin mismatch"),
        Err(_) => panic!("connection not torn down on pin mismatch"),
    }
}

#[tokio::test]
async fn test_idle_timeout_ends_tunnel() {
    let setup = boot(0, |client, server, _| {
        client.idle_timeout = Duration::from_millis(100);
        server.idle_timeout = Duration::from_millis(100);
    })
    .await;

    let mut conn = TcpStream::connect(setup.client_addr).await.unwrap();
    // Write nothing; the tunnel must give up on its own.
    let mut buf = [0u8; 1];
    let res = timeout(Duration::from_secs(5), conn.read(&mut buf)).await;
    match res {
        Ok(Ok(0)) | Ok(Err(_)) => {}
        Ok(Ok(n)) => panic!("unexpected {n} bytes from an idle tunnel"),
        Err(_) => panic!("idle tunnel was not torn down"),
    }
}
