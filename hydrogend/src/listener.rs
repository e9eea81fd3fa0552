//! TCP and UNIX listeners (§4.I). Each accepted connection becomes a
//! client `Peer` with `readFd == writeFd`, which our `Transport` enum
//! models simply by holding one duplex stream.

use std::net::SocketAddr;

use socket2::{Domain, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::info;

use crate::error::ListenerError;

const TCP_BACKLOG: i32 = 5;

/// `SO_REUSEADDR`, bind, listen with a backlog of 5 — socket2 gives us the
/// knobs tokio's own `TcpListener::bind` doesn't expose.
pub async fn bind_tcp(port: u16, loopback_only: bool) -> Result<TcpListener, ListenerError> {
    let addr: SocketAddr = if loopback_only {
        format!("127.0.0.1:{port}").parse().unwrap()
    } else {
        format!("0.0.0.0:{port}").parse().unwrap()
    };
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)
        .map_err(|source| ListenerError::Bind { addr: addr.to_string(), source })?;
    socket.set_reuse_address(true).map_err(ListenerError::Listen)?;
    socket.set_nonblocking(true).map_err(ListenerError::Listen)?;
    socket
        .bind(&addr.into())
        .map_err(|source| ListenerError::Bind { addr: addr.to_string(), source })?;
    socket.listen(TCP_BACKLOG).map_err(ListenerError::Listen)?;
    let listener = TcpListener::from_std(socket.into()).map_err(ListenerError::Listen)?;
    info!(%addr, "TCP listener bound");
    Ok(listener)
}

pub async fn accept_tcp(listener: &TcpListener) -> std::io::Result<(TcpStream, std::net::SocketAddr)> {
    listener.accept().await
}

/// Binds a UNIX listener at `path`. On Linux this uses the abstract
/// namespace (`\0<path>`), avoiding filesystem cleanup entirely; on other
/// platforms the filesystem path is used and any stale entry removed
/// first.
pub fn bind_unix(path: &str) -> Result<UnixListener, ListenerError> {
    #[cfg(target_os = "linux")]
    {
        use std::os::linux::net::SocketAddrExt;
        use std::os::unix::net::SocketAddr as StdSocketAddr;
        let abstract_addr = StdSocketAddr::from_abstract_name(path.as_bytes())
            .map_err(|source| ListenerError::Bind { addr: path.to_owned(), source })?;
        let std_listener = std::os::unix::net::UnixListener::bind_addr(&abstract_addr)
            .map_err(|source| ListenerError::Bind { addr: path.to_owned(), source })?;
        std_listener.set_nonblocking(true).map_err(ListenerError::Listen)?;
        let listener = UnixListener::from_std(std_listener).map_err(ListenerError::Listen)?;
        info!(path, "UNIX listener bound (abstract namespace)");
        Ok(listener)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)
            .map_err(|source| ListenerError::Bind { addr: path.to_owned(), source })?;
        info!(path, "UNIX listener bound");
        Ok(listener)
    }
}

pub async fn accept_unix(listener: &UnixListener) -> std::io::Result<UnixStream> {
    let (stream, _addr) = listener.accept().await?;
    Ok(stream)
}

/// Best-effort `SO_PEERCRED` lookup for logging only.
#[cfg(target_os = "linux")]
pub fn peer_credentials(stream: &UnixStream) -> Option<(u32, u32, i32)> {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&mut cred as *mut libc::ucred).cast(),
            &mut len,
        )
    };
    if rc == 0 {
        Some((cred.uid, cred.gid, cred.pid))
    } else {
        None
    }
}

#[cfg(not(target_os = "linux"))]
pub fn peer_credentials(_stream: &UnixStream) -> Option<(u32, u32, i32)> {
    None
}
