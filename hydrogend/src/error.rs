//! Per-module structured errors (§7). Peer-level and parse-level failures
//! fold into a disconnect rather than propagating; only startup-time and
//! shared-buffer failures are process-fatal.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("parse: {0}")]
    Parse(#[from] hydrogen_protocol::ParseError),
    #[error("message: {0}")]
    Msg(#[from] hydrogen_protocol::MsgError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("queued bytes exceeded quota")]
    QuotaExceeded,
    #[error("peer closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("spawn: {0}")]
    Spawn(#[from] io::Error),
    #[error("exec failed in child")]
    ExecFailed,
}

#[derive(Debug, thiserror::Error)]
pub enum FifoError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("malformed control line: {0}")]
    Malformed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("listen: {0}")]
    Listen(io::Error),
}
