//! POSIX shared-memory regions used to transport BLOB payloads as file
//! descriptors instead of inline base64.
//!
//! A region starts out writable ([`MappedWrite`], produced by [`alloc`]),
//! gets [`MappedWrite::seal`]ed to read-only once transport begins, and is
//! read thereafter as [`MappedRead`] (also what [`attach`] returns for fds
//! received from a peer). The type-state split — writable vs. sealed — is
//! what keeps `realloc` from being callable on an already-sealed mapping;
//! there is no runtime "already sealed" check to get wrong.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;

/// A writable anonymous shared-memory mapping, not yet visible to any peer.
pub struct MappedWrite {
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping has no thread affinity; our API only ever exposes `&mut`
// access through `&mut self`, so there is no data race to guard against by
// keeping this `!Send`.
unsafe impl Send for MappedWrite {}

/// A read-only mapping: either a sealed allocation or an attached fd
/// received from a peer.
pub struct MappedRead {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for MappedRead {}

/// Reserve `size` bytes of anonymous shared memory, returning the backing
/// fd (to hand to a peer later) and a writable mapping of it.
pub fn alloc(size: usize) -> io::Result<(OwnedFd, MappedWrite)> {
    let fd = create_memfd()?;
    if size > 0 {
        set_len(fd.as_raw_fd(), size)?;
    }
    let ptr = map(fd.as_raw_fd(), size, libc::PROT_READ | libc::PROT_WRITE)?;
    Ok((fd, MappedWrite { ptr, len: size }))
}

/// Map a received fd read-only; the mapping's size is the fd's file size.
pub fn attach(fd: RawFd) -> io::Result<MappedRead> {
    let size = file_size(fd)?;
    let ptr = map(fd, size, libc::PROT_READ)?;
    Ok(MappedRead { ptr, len: size })
}

impl MappedWrite {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.len == 0 {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Grow or shrink the mapping in place. Only valid before [`seal`];
    /// there is no safe way to call this on a [`MappedRead`].
    pub fn realloc(&mut self, fd: RawFd, new_size: usize) -> io::Result<()> {
        set_len(fd, new_size)?;
        let new_ptr = if new_size == 0 {
            // Keep a dangling-but-valid pointer; no byte of it is ever read.
            NonNull::dangling()
        } else {
            unsafe {
                let remapped = libc::mremap(
                    self.ptr.as_ptr().cast(),
                    self.len,
                    new_size,
                    libc::MREMAP_MAYMOVE,
                );
                if remapped == libc::MAP_FAILED {
                    return Err(io::Error::last_os_error());
                }
                NonNull::new_unchecked(remapped.cast())
            }
        };
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr.as_ptr().cast(), 0);
            }
        }
        self.ptr = new_ptr;
        self.len = new_size;
        Ok(())
    }

    /// Transition to read-only. Idempotent in effect: callers are expected
    /// to call this exactly once, right before the fd is handed to a peer.
    pub fn seal(self) -> MappedRead {
        if self.len > 0 {
            unsafe {
                libc::mprotect(self.ptr.as_ptr().cast(), self.len, libc::PROT_READ);
            }
        }
        let read = MappedRead {
            ptr: self.ptr,
            len: self.len,
        };
        std::mem::forget(self);
        read
    }
}

impl MappedRead {
    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MappedWrite {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr.as_ptr().cast(), self.len);
            }
        }
    }
}

impl Drop for MappedRead {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr.as_ptr().cast(), self.len);
            }
        }
    }
}

fn create_memfd() -> io::Result<OwnedFd> {
    let name = c"hydrogen-shared-buffer";
    let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

fn set_len(fd: RawFd, size: usize) -> io::Result<()> {
    let rc = unsafe { libc::ftruncate(fd, size as libc::off_t) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn file_size(fd: RawFd) -> io::Result<usize> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::fstat(fd, &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.st_size as usize)
}

fn map(fd: RawFd, size: usize, prot: libc::c_int) -> io::Result<NonNull<u8>> {
    if size == 0 {
        return Ok(NonNull::dangling());
    }
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            prot,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { NonNull::new_unchecked(ptr.cast()) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;

    #[test]
    fn alloc_write_seal_then_attach_round_trips() {
        let (fd, mut w) = alloc(16).unwrap();
        w.as_mut_slice().copy_from_slice(b"0123456789abcdef");
        let _sealed = w.seal();

        let raw = fd.into_raw_fd();
        let read = attach(raw).unwrap();
        assert_eq!(read.as_slice(), b"0123456789abcdef");
        unsafe {
            libc::close(raw);
        }
    }

    #[test]
    fn realloc_grows_mapping_before_seal() {
        let (fd, mut w) = alloc(4).unwrap();
        w.as_mut_slice().copy_from_slice(b"abcd");
        w.realloc(fd.as_raw_fd(), 8).unwrap();
        assert_eq!(w.len(), 8);
        w.as_mut_slice()[4..8].copy_from_slice(b"efgh");
        assert_eq!(w.as_slice(), b"abcdefgh");
    }

    #[test]
    fn zero_length_alloc_is_safe() {
        let (_fd, w) = alloc(0).unwrap();
        assert!(w.is_empty());
        let _sealed = w.seal();
    }
}
