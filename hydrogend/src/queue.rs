//! `MsgQueue` (§4.D): the per-peer outgoing serialization queue plus the
//! transport it reads and writes through.
//!
//! A single concrete `Transport` enum stands in for the source's
//! `readFd`/`writeFd` split and its plain-vs-ancillary distinction, per the
//! "avoid deep inheritance" design note — one tagged type, not a class
//! hierarchy.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use hydrogen_protocol::{Cursor, SerializedMsg};
use tokio::net::{TcpStream, UnixStream};
use tracing::warn;

use crate::ancillary::{recvmsg_with_fds, sendmsg_with_fds, AncillaryFd, MAX_READ, MAX_WRITE};
use crate::error::PeerError;

/// How a peer's bytes actually travel.
pub enum Transport {
    Tcp(TcpStream),
    /// A listener-accepted UNIX-domain client: always ancillary-capable.
    Unix(UnixStream),
    /// A local driver using plain pipes: no ancillary data.
    Pipes { read: tokio::io::unix::AsyncFd<OwnedFd>, write: tokio::io::unix::AsyncFd<OwnedFd> },
    /// A local driver using a socketpair: ancillary-capable.
    Socketpair(AncillaryFd),
}

impl Transport {
    pub fn accepts_shared_buffers(&self) -> bool {
        matches!(self, Transport::Unix(_) | Transport::Socketpair(_))
    }

    pub async fn read(&self, buf: &mut [u8]) -> Result<(usize, Vec<OwnedFd>), PeerError> {
        match self {
            Transport::Tcp(s) => loop {
                s.readable().await.map_err(PeerError::Io)?;
                match s.try_read(buf) {
                    Ok(n) => return Ok((n, Vec::new())),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(PeerError::Io(e)),
                }
            },
            Transport::Unix(s) => loop {
                s.readable().await.map_err(PeerError::Io)?;
                match s.try_io(tokio::io::Interest::READABLE, || recvmsg_with_fds(s.as_raw_fd(), buf)) {
                    Ok(result) => return result.map_err(PeerError::Io),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(PeerError::Io(e)),
                }
            },
            Transport::Pipes { read, .. } => loop {
                let mut guard = read.readable().await.map_err(PeerError::Io)?;
                match guard.try_io(|inner| {
                    let n = unsafe { libc::read(inner.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
                    if n < 0 { Err(std::io::Error::last_os_error()) } else { Ok(n as usize) }
                }) {
                    Ok(result) => return result.map(|n| (n, Vec::new())).map_err(PeerError::Io),
                    Err(_would_block) => continue,
                }
            },
            Transport::Socketpair(fd) => fd.recv(buf).await,
        }
    }

    pub async fn write(&self, data: &[u8], fds: &[RawFd]) -> Result<usize, PeerError> {
        match self {
            Transport::Tcp(s) => loop {
                s.writable().await.map_err(PeerError::Io)?;
                match s.try_write(data) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(PeerError::Io(e)),
                }
            },
            Transport::Unix(s) => loop {
                s.writable().await.map_err(PeerError::Io)?;
                match s.try_io(tokio::io::Interest::WRITABLE, || sendmsg_with_fds(s.as_raw_fd(), data, fds)) {
                    Ok(result) => return result.map_err(PeerError::Io),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(PeerError::Io(e)),
                }
            },
            Transport::Pipes { write, .. } => loop {
                let mut guard = write.writable().await.map_err(PeerError::Io)?;
                match guard.try_io(|inner| {
                    let n = unsafe { libc::write(inner.as_raw_fd(), data.as_ptr().cast(), data.len()) };
                    if n < 0 { Err(std::io::Error::last_os_error()) } else { Ok(n as usize) }
                }) {
                    Ok(result) => return result.map_err(PeerError::Io),
                    Err(_would_block) => continue,
                }
            },
            Transport::Socketpair(fd) => fd.send(data, fds).await,
        }
    }
}

/// One outstanding outgoing serialization plus the cursor into it.
struct QueueEntry {
    serialized: SerializedMsg,
    cursor: Cursor,
    is_blob: bool,
}

/// `MsgQueue`: the outgoing half of a peer (§4.D write path), independent
/// of which concrete `Transport` backs it.
pub struct MsgQueue {
    entries: VecDeque<QueueEntry>,
    queued_bytes: u64,
    /// Bytes queued belonging to streaming-BLOB (`setBLOBVector`) entries
    /// only, tracked separately so `maxstreamsiz` can be enforced without
    /// counting ordinary property traffic against it.
    queued_stream_bytes: u64,
    write_closed: bool,
}

impl MsgQueue {
    pub fn new() -> Self {
        MsgQueue { entries: VecDeque::new(), queued_bytes: 0, queued_stream_bytes: 0, write_closed: false }
    }

    pub fn queued_bytes(&self) -> u64 {
        self.queued_bytes
    }

    pub fn queued_stream_bytes(&self) -> u64 {
        self.queued_stream_bytes
    }

    /// `pushMsg`: queue a message's serialization for `peer_id`, who becomes
    /// an awaiter of it.
    pub fn push(&mut self, serialized: SerializedMsg, peer_id: u64, estimated_size: u64, is_blob: bool) {
        serialized.add_awaiter(peer_id);
        self.queued_bytes += estimated_size;
        if is_blob {
            self.queued_stream_bytes += estimated_size;
        }
        self.entries.push_back(QueueEntry { serialized, cursor: Cursor::default(), is_blob });
    }

    /// Drains as much of the head serialization as the transport will
    /// currently accept. Returns `true` if the caller should keep calling
    /// (more queued bytes of the *current* chunk may still be writable).
    pub async fn drain_once(&mut self, peer_id: u64, transport: &Transport) -> Result<bool, PeerError> {
        let Some(head) = self.entries.front() else { return Ok(false) };
        if !head.serialized.request_content(head.cursor) {
            return Ok(false);
        }

        let content = head.serialized.get_content(head.cursor);
        let (data, fds) = match content {
            hydrogen_protocol::ContentState::Ready { data, fds } => (data, fds),
            hydrogen_protocol::ContentState::End => {
                self.pop_head(peer_id);
                return Ok(true);
            }
            hydrogen_protocol::ContentState::NotReady => return Ok(false),
        };

        if data.is_empty() {
            if head.serialized.end_reached(head.cursor) {
                self.pop_head(peer_id);
                return Ok(true);
            }
            return Ok(false);
        }

        let clamped = &data[..data.len().min(MAX_WRITE)];
        let can_attach_fds = transport.accepts_shared_buffers();
        let fds_to_send: Vec<RawFd> = if can_attach_fds { fds } else { Vec::new() };

        match transport.write(clamped, &fds_to_send).await {
            Ok(0) => {
                warn!(peer_id, "write returned 0 bytes, closing write side");
                self.close_write_part(peer_id);
                Ok(false)
            }
            Ok(n) => {
                let is_blob = self.entries.front().expect("head present").is_blob;
                let head = self.entries.front_mut().expect("head present");
                head.cursor = head.serialized.advance(head.cursor, n);
                self.queued_bytes = self.queued_bytes.saturating_sub(n as u64);
                if is_blob {
                    self.queued_stream_bytes = self.queued_stream_bytes.saturating_sub(n as u64);
                }
                if head.serialized.end_reached(head.cursor) {
                    self.pop_head(peer_id);
                }
                Ok(true)
            }
            Err(e) => {
                warn!(peer_id, error = %e, "write failed, closing write side");
                self.close_write_part(peer_id);
                Err(e)
            }
        }
    }

    fn pop_head(&mut self, peer_id: u64) {
        if let Some(entry) = self.entries.pop_front() {
            let _ = entry.serialized.release(peer_id);
        }
    }

    /// `closeWritePart`: clear the outgoing queue, releasing every queued
    /// serialization's awaiter slot, and stop producing further writes.
    pub fn close_write_part(&mut self, peer_id: u64) {
        self.write_closed = true;
        self.drain_and_release(peer_id);
    }

    pub fn drain_and_release(&mut self, peer_id: u64) {
        while let Some(entry) = self.entries.pop_front() {
            let _ = entry.serialized.release(peer_id);
        }
        self.queued_bytes = 0;
        self.queued_stream_bytes = 0;
    }

    pub fn is_write_closed(&self) -> bool {
        self.write_closed
    }

    pub fn has_pending(&self) -> bool {
        !self.entries.is_empty()
    }
}

impl Default for MsgQueue {
    fn default() -> Self {
        Self::new()
    }
}

pub const READ_BUF_SIZE: usize = MAX_READ;
