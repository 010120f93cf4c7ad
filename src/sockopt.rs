//! Socket control hooks and TCP dial/listen helpers.
//!
//! Options are applied to the raw socket before connect/listen, mirroring a
//! platform `Control` hook: TCP Fast Open, outgoing TTL, and the Android VPN
//! fd handoff. Unsupported platforms ignore the options with a debug log.

use std::io;
use std::net::SocketAddr;

use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tracing::debug;

/// Socket tuning applied before connect/listen.
#[derive(Debug, Clone, Default)]
pub struct SocketOpts {
    /// TCP Fast Open (Linux 4.11+).
    pub fast_open: bool,
    /// Outgoing IP TTL.
    pub ttl: Option<u32>,
    /// Hand the socket fd to the VPN service before it is used
    /// (Android `protect_path`).
    pub vpn_protect: bool,
}

/// Dials `addr` with the socket control hook applied.
///
/// Connect timeouts are the caller's concern; this resolves the address,
/// applies `opts` to a fresh socket, and connects.
pub async fn dial_tcp(addr: &str, opts: &SocketOpts) -> io::Result<TcpStream> {
    let target = resolve(addr).await?;
    let socket = match target {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    apply_control(&socket, opts, false);
    let stream = socket.connect(target).await?;
    stream.set_nodelay(true)?;
    if let Some(ttl) = opts.ttl {
        stream.set_ttl(ttl)?;
    }
    Ok(stream)
}

/// Binds a listener on `addr` with the socket control hook applied.
pub async fn listen_tcp(addr: &str, opts: &SocketOpts) -> io::Result<TcpListener> {
    let bind = resolve(addr).await?;
    let socket = match bind {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    apply_control(&socket, opts, true);
    socket.bind(bind)?;
    socket.listen(1024)
}

async fn resolve(addr: &str) -> io::Result<SocketAddr> {
    lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {addr}")))
}

#[cfg(unix)]
fn apply_control(socket: &TcpSocket, opts: &SocketOpts, listening: bool) {
    use std::os::fd::AsRawFd;

    let fd = socket.as_raw_fd();
    if opts.vpn_protect {
        protect_fd(fd);
    }
    if opts.fast_open {
        if let Err(e) = set_tcp_fastopen(fd, listening) {
            debug!("tcp fast open unavailable: {e}");
        }
    }
}

#[cfg(not(unix))]
fn apply_control(_socket: &TcpSocket, opts: &SocketOpts, _listening: bool) {
    if opts.fast_open || opts.vpn_protect {
        debug!("socket control options ignored on this platform");
    }
}

#[cfg(target_os = "linux")]
fn set_tcp_fastopen(fd: std::os::fd::RawFd, listening: bool) -> io::Result<()> {
    let (opt, val): (libc::c_int, libc::c_int) = if listening {
        // Fast-open queue length on the listening side.
        (libc::TCP_FASTOPEN, 1024)
    } else {
        (libc::TCP_FASTOPEN_CONNECT, 1)
    };
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            opt,
            &val as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
fn set_tcp_fastopen(_fd: std::os::fd::RawFd, _listening: bool) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "tcp fast open not supported",
    ))
}

/// Passes `fd` to the VPN service over the `protect_path` unix socket so the
/// tunnel's own traffic bypasses the VPN.
#[cfg(target_os = "android")]
fn protect_fd(fd: std::os::fd::RawFd) {
    use std::os::unix::net::UnixStream;

    let sock = match UnixStream::connect("protect_path") {
        Ok(s) => s,
        Err(e) => {
            debug!("protect_path connect failed: {e}");
            return;
        }
    };
    let _ = sock.set_read_timeout(Some(std::time::Duration::from_secs(3)));
    let _ = sock.set_write_timeout(Some(std::time::Duration::from_secs(3)));

    use std::os::fd::AsRawFd;
    unsafe {
        let mut iov_data = [0u8; 1];
        let mut iov = libc::iovec {
            iov_base: iov_data.as_mut_ptr() as *mut libc::c_void,
            iov_len: iov_data.len(),
        };
        let mut cmsg_buf = [0u8; 64];
        let mut msg: libc::msghdr = std::mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = libc::CMSG_SPACE(std::mem::size_of::<libc::c_int>() as u32) as usize;

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<libc::c_int>() as u32) as usize;
        std::ptr::copy_nonoverlapping(
            &fd as *const _ as *const u8,
            libc::CMSG_DATA(cmsg),
            std::mem::size_of::<libc::c_int>(),
        );

        if libc::sendmsg(sock.as_raw_fd(), &msg, 0) < 0 {
            debug!("protect_path sendmsg failed: {}", io::Error::last_os_error());
            return;
        }
        // The service acknowledges with one byte.
        let mut ack = [0u8; 1];
        let _ = libc::recv(sock.as_raw_fd(), ack.as_mut_ptr() as *mut libc::c_void, 1, 0);
    }
}

#[cfg(all(unix, not(target_os = "android")))]
fn protect_fd(_fd: std::os::fd::RawFd) {
    debug!("vpn protect requested but not running on android");
}

/// Shrinks kernel socket buffers to 64 KiB when either endpoint is a
/// loopback address; large defaults only waste memory on local hops.
pub fn tune_loopback_buffers(stream: &TcpStream) {
    let loopback = match (stream.local_addr(), stream.peer_addr()) {
        (Ok(l), Ok(p)) => l.ip().is_loopback() || p.ip().is_loopback(),
        _ => false,
    };
    if !loopback {
        return;
    }
    let sock = socket2::SockRef::from(stream);
    let _ = sock.set_recv_buffer_size(64 * 1024);
    let _ = sock.set_send_buffer_size(64 * 1024);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dial_and_listen() {
        let opts = SocketOpts::default();
        let listener = listen_tcp("127.0.0.1:0", &opts).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accepted = tokio::spawn(async move { listener.accept().await });
        let stream = dial_tcp(&addr.to_string(), &opts).await.unwrap();
        accepted.await.unwrap().unwrap();
        tune_loopback_buffers(&stream);
    }

    #[tokio::test]
    async fn test_resolve_failure() {
        let opts = SocketOpts::default();
        assert!(dial_tcp("no-such-host.invalid:1", &opts).await.is_err());
    }
}
