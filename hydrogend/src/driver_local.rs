//! Local driver supervisor (§4.G): fork/exec, stderr capture, reap and
//! restart.
//!
//! Everything the child needs — argv, envp, which fds go where — is
//! prepared as plain `CString`s and raw pointers in the parent *before*
//! `fork()`. Between `fork()` and `execvp()` the child only calls
//! `dup2`/`close`/`execvp`/`_exit`: no allocation, because the parent
//! process is multi-threaded (tokio plus the serialization worker
//! threads) and libc's allocator lock may be held by another thread at
//! the moment of fork.

use std::ffi::CString;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use tokio::io::unix::AsyncFd;
use tracing::{info, warn};

use crate::error::DriverError;
use crate::queue::Transport;

pub struct LocalDriverConfig {
    pub path: String,
    pub device: Option<String>,
    pub config_path: Option<String>,
    pub skel_path: Option<String>,
    pub prefix: Option<String>,
    /// Socketpair mode is ancillary-capable; plain pipes are not.
    pub use_socketpair: bool,
}

pub struct SpawnedDriver {
    pub pid: libc::pid_t,
    pub transport: Transport,
    pub stderr: AsyncFd<OwnedFd>,
}

/// Resolve the executable the way the original does: a `.`-relative path
/// joins the directory of our own argv0; otherwise a bare name is looked
/// up on `PATH` by `execvp` itself, and an absolute/other relative path is
/// used as-is (optionally prefixed).
fn resolve_path(cfg: &LocalDriverConfig) -> String {
    let mut path = cfg.path.clone();
    if let Some(prefix) = &cfg.prefix {
        if !path.starts_with('/') {
            path = format!("{prefix}/{path}");
        }
    }
    path
}

pub fn spawn(cfg: &LocalDriverConfig) -> Result<SpawnedDriver, DriverError> {
    let resolved = resolve_path(cfg);
    let argv0 = CString::new(resolved.clone()).map_err(|_| DriverError::ExecFailed)?;
    let argv: Vec<*const libc::c_char> = vec![argv0.as_ptr(), std::ptr::null()];

    let mut env_strings = Vec::new();
    if let Some(d) = &cfg.device {
        env_strings.push(CString::new(format!("HYDROGENDEV={d}")).unwrap());
    }
    if let Some(c) = &cfg.config_path {
        env_strings.push(CString::new(format!("HYDROGENCONFIG={c}")).unwrap());
    }
    if let Some(s) = &cfg.skel_path {
        env_strings.push(CString::new(format!("HYDROGENSKEL={s}")).unwrap());
    }
    if let Some(p) = &cfg.prefix {
        env_strings.push(CString::new(format!("HYDROGENPREFIX={p}")).unwrap());
    }
    // Inherit the rest of our environment, then append our overrides.
    let mut envp: Vec<*const libc::c_char> = Vec::new();
    let inherited: Vec<CString> = std::env::vars()
        .filter(|(k, _)| !matches!(k.as_str(), "HYDROGENDEV" | "HYDROGENCONFIG" | "HYDROGENSKEL" | "HYDROGENPREFIX"))
        .map(|(k, v)| CString::new(format!("{k}={v}")).unwrap())
        .collect();
    for s in &inherited {
        envp.push(s.as_ptr());
    }
    for s in &env_strings {
        envp.push(s.as_ptr());
    }
    envp.push(std::ptr::null());

    let (child_in, child_out, parent_transport): (RawFd, RawFd, TransportFds) = if cfg.use_socketpair {
        let mut sv = [0i32; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, sv.as_mut_ptr()) };
        if rc != 0 {
            return Err(DriverError::Spawn(std::io::Error::last_os_error()));
        }
        (sv[1], sv[1], TransportFds::Socketpair(sv[0]))
    } else {
        let mut in_pipe = [0i32; 2]; // parent writes, child reads (child stdin)
        let mut out_pipe = [0i32; 2]; // child writes, parent reads (child stdout)
        if unsafe { libc::pipe(in_pipe.as_mut_ptr()) } != 0 {
            return Err(DriverError::Spawn(std::io::Error::last_os_error()));
        }
        if unsafe { libc::pipe(out_pipe.as_mut_ptr()) } != 0 {
            return Err(DriverError::Spawn(std::io::Error::last_os_error()));
        }
        (in_pipe[0], out_pipe[1], TransportFds::Pipes { read: out_pipe[0], write: in_pipe[1] })
    };

    let mut stderr_pipe = [0i32; 2];
    if unsafe { libc::pipe(stderr_pipe.as_mut_ptr()) } != 0 {
        return Err(DriverError::Spawn(std::io::Error::last_os_error()));
    }

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(DriverError::Spawn(std::io::Error::last_os_error()));
    }

    if pid == 0 {
        unsafe {
            libc::dup2(child_in, 0);
            libc::dup2(child_out, 1);
            libc::dup2(stderr_pipe[1], 2);
            let max_fd = libc::sysconf(libc::_SC_OPEN_MAX).max(256) as RawFd;
            for fd in 3..max_fd {
                libc::close(fd);
            }
            libc::execvp(argv0.as_ptr(), argv.as_ptr());
            libc::_exit(1);
        }
    }

    // Parent: close the child's ends (same fd for both in socketpair mode)
    // and wrap ours.
    unsafe {
        libc::close(child_in);
        if child_out != child_in {
            libc::close(child_out);
        }
        libc::close(stderr_pipe[1]);
    }

    let transport = match parent_transport {
        TransportFds::Socketpair(fd) => {
            let owned = unsafe { OwnedFd::from_raw_fd(fd) };
            let ancillary = crate::ancillary::AncillaryFd::new(owned).map_err(DriverError::Spawn)?;
            Transport::Socketpair(ancillary)
        }
        TransportFds::Pipes { read, write } => {
            set_nonblocking(read);
            set_nonblocking(write);
            let read = AsyncFd::new(unsafe { OwnedFd::from_raw_fd(read) }).map_err(DriverError::Spawn)?;
            let write = AsyncFd::new(unsafe { OwnedFd::from_raw_fd(write) }).map_err(DriverError::Spawn)?;
            Transport::Pipes { read, write }
        }
    };

    set_nonblocking(stderr_pipe[0]);
    let stderr = AsyncFd::new(unsafe { OwnedFd::from_raw_fd(stderr_pipe[0]) }).map_err(DriverError::Spawn)?;

    info!(pid, path = %resolved, "spawned local driver");
    Ok(SpawnedDriver { pid, transport, stderr })
}

enum TransportFds {
    Socketpair(RawFd),
    Pipes { read: RawFd, write: RawFd },
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

/// Read pending stderr bytes and split into lines, buffering a partial
/// trailing line across calls. `overflow_limit` bounds the buffer (1 KiB
/// per the line-watcher design).
pub struct StderrLineBuffer {
    buf: Vec<u8>,
    limit: usize,
}

impl StderrLineBuffer {
    pub fn new() -> Self {
        StderrLineBuffer { buf: Vec::new(), limit: 1024 }
    }

    /// Feed newly read bytes; returns complete lines, logs+resets on
    /// overflow without a newline.
    pub fn feed(&mut self, data: &[u8], device: &str) -> Vec<String> {
        self.buf.extend_from_slice(data);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(&self.buf[..pos]).into_owned();
            lines.push(line);
            self.buf.drain(..=pos);
        }
        if self.buf.len() > self.limit {
            warn!(device, "stderr line exceeded buffer without newline, flushing partial content");
            lines.push(String::from_utf8_lossy(&self.buf).into_owned());
            self.buf.clear();
        }
        lines
    }
}

impl Default for StderrLineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Blocking `waitpid(WNOHANG)` check, meant to be called from a task woken
/// by `SIGCHLD` (via `tokio::signal::unix::signal(SignalKind::child())`).
pub fn try_reap(pid: libc::pid_t) -> Option<ExitReason> {
    let mut status = 0i32;
    let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
    if rc == pid {
        if unsafe { libc::WIFEXITED(status) } {
            Some(ExitReason::Exited(unsafe { libc::WEXITSTATUS(status) }))
        } else if unsafe { libc::WIFSIGNALED(status) } {
            Some(ExitReason::Signaled(unsafe { libc::WTERMSIG(status) }))
        } else {
            None
        }
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ExitReason {
    Exited(i32),
    Signaled(i32),
}
