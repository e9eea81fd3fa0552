//! Raw `sendmsg`/`recvmsg` with `SCM_RIGHTS`, wrapped behind
//! [`tokio::io::unix::AsyncFd`] the way `tokio-seqpacket`'s `UnixSeqpacket`
//! wraps a raw socket fd for readiness-driven, non-blocking syscalls.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use tokio::io::unix::AsyncFd;

use crate::error::PeerError;

pub const MAX_FDS_PER_MESSAGE: usize = 16;
pub const MAX_READ: usize = 48 * 1024;
pub const MAX_WRITE: usize = 48 * 1024;

/// An ancillary-capable duplex fd (a UNIX `SOCK_STREAM` or socketpair end).
/// Reads may carry `SCM_RIGHTS`; writes may attach them.
pub struct AncillaryFd {
    inner: AsyncFd<OwnedFd>,
}

impl AncillaryFd {
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(AncillaryFd { inner: AsyncFd::new(fd)? })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.inner.get_ref().as_raw_fd()
    }

    /// `recvmsg`-equivalent. Returns the bytes read and any received fds,
    /// appended in order.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<(usize, Vec<OwnedFd>), PeerError> {
        loop {
            let mut guard = self.inner.readable().await.map_err(PeerError::Io)?;
            match guard.try_io(|inner| recvmsg_with_fds(inner.as_raw_fd(), buf)) {
                Ok(result) => return result.map_err(PeerError::Io),
                Err(_would_block) => continue,
            }
        }
    }

    /// `sendmsg`-equivalent; `fds` is attached as `SCM_RIGHTS` only when
    /// non-empty (callers only pass a non-empty list on a message's first
    /// chunk, per the framing rule in §6).
    pub async fn send(&self, data: &[u8], fds: &[RawFd]) -> Result<usize, PeerError> {
        loop {
            let mut guard = self.inner.writable().await.map_err(PeerError::Io)?;
            match guard.try_io(|inner| sendmsg_with_fds(inner.as_raw_fd(), data, fds)) {
                Ok(result) => return result.map_err(PeerError::Io),
                Err(_would_block) => continue,
            }
        }
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn recvmsg_with_fds(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut iov = libc::iovec { iov_base: buf.as_mut_ptr().cast(), iov_len: buf.len() };
    let cmsg_space = unsafe { libc::CMSG_SPACE((MAX_FDS_PER_MESSAGE * size_of::<RawFd>()) as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_buf.len() as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_CMSG_CLOEXEC) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut fds = Vec::new();
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            if hdr.cmsg_level == libc::SOL_SOCKET && hdr.cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                let count = (hdr.cmsg_len as usize - libc::CMSG_LEN(0) as usize) / size_of::<RawFd>();
                for i in 0..count {
                    let raw: RawFd = std::ptr::read_unaligned((data as *const RawFd).add(i));
                    fds.push(std::os::fd::FromRawFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok((n as usize, fds))
}

pub(crate) fn sendmsg_with_fds(fd: RawFd, data: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let mut iov = libc::iovec { iov_base: data.as_ptr() as *mut _, iov_len: data.len() };

    let mut cmsg_buf;
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if !fds.is_empty() {
        let space = unsafe { libc::CMSG_SPACE((fds.len() * size_of::<RawFd>()) as u32) } as usize;
        cmsg_buf = vec![0u8; space];
        msg.msg_control = cmsg_buf.as_mut_ptr().cast();
        msg.msg_controllen = space as _;
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            let hdr = &mut *cmsg;
            hdr.cmsg_level = libc::SOL_SOCKET;
            hdr.cmsg_type = libc::SCM_RIGHTS;
            hdr.cmsg_len = libc::CMSG_LEN((fds.len() * size_of::<RawFd>()) as u32) as _;
            let data_ptr = libc::CMSG_DATA(cmsg);
            for (i, raw) in fds.iter().enumerate() {
                std::ptr::write_unaligned((data_ptr as *mut RawFd).add(i), *raw);
            }
        }
    }

    let n = unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}
