//! Command-line surface (§6 CLI surface).

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "hydrogend", about = "INDI/Hydrogen message-router daemon")]
pub struct Cli {
    /// Log directory; per-day `.islog` files are written here when set.
    #[arg(short = 'l', long = "log-dir", value_name = "DIR")]
    pub log_dir: Option<std::path::PathBuf>,

    /// Per-client kill threshold, in megabytes.
    #[arg(short = 'm', long = "max-queue-mb", value_name = "MB", default_value_t = 128)]
    pub max_queue_mb: u64,

    /// Streaming-BLOB drop threshold, in megabytes (0 disables).
    #[arg(short = 'd', long = "max-stream-mb", value_name = "MB", default_value_t = 5)]
    pub max_stream_mb: u64,

    /// TCP listen port.
    #[arg(short = 'p', long = "port", value_name = "PORT", default_value_t = 7624)]
    pub port: u16,

    /// UNIX socket path.
    #[arg(short = 'u', long = "unix-socket", value_name = "PATH", default_value = "/tmp/hydrogenserver")]
    pub unix_socket: String,

    /// Control FIFO path.
    #[arg(short = 'f', long = "fifo", value_name = "PATH")]
    pub fifo: Option<std::path::PathBuf>,

    /// Maximum restarts per local driver.
    #[arg(short = 'r', long = "max-restarts", value_name = "N", default_value_t = 10)]
    pub max_restarts: u32,

    /// Verbosity; repeat for more (-v, -vv, -vvv).
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Driver specifications: an executable path, or `device@host[:port]`.
    pub drivers: Vec<String>,
}
