//! `Cli` → `RouterConfig`: keeps argv parsing separate from the config
//! the rest of the program actually consumes.

use std::path::PathBuf;

use crate::cli::Cli;

#[derive(Debug, Clone)]
pub struct DriverSpec {
    pub name: String,
    pub device: Option<String>,
}

impl DriverSpec {
    /// `device@host[:port]` / `@host[:port]` marks a remote driver; a bare
    /// path is a local one.
    pub fn is_remote(&self) -> bool {
        self.name.contains('@')
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub log_dir: Option<PathBuf>,
    pub max_queue_bytes: u64,
    pub max_stream_bytes: u64,
    pub port: u16,
    pub unix_socket: String,
    pub fifo: Option<PathBuf>,
    pub max_restarts: u32,
    pub verbosity: u8,
    pub drivers: Vec<DriverSpec>,
}

impl From<Cli> for RouterConfig {
    fn from(cli: Cli) -> Self {
        RouterConfig {
            log_dir: cli.log_dir,
            max_queue_bytes: cli.max_queue_mb * 1024 * 1024,
            max_stream_bytes: cli.max_stream_mb * 1024 * 1024,
            port: cli.port,
            unix_socket: cli.unix_socket,
            fifo: cli.fifo,
            max_restarts: cli.max_restarts,
            verbosity: cli.verbose,
            drivers: cli
                .drivers
                .into_iter()
                .map(|name| DriverSpec { name, device: None })
                .collect(),
        }
    }
}
