//! Tracing setup, plus the per-day `.islog` writer (§6 "Persisted state").

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `verbosity` follows `-v` repetition:
/// 0 = warn, 1 = info, 2 = debug, 3+ = trace (matching the original's
/// `traceMsg`-gated root-tag tracing at `-vvv`).
pub fn init(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Appends `"<timestamp>: <device>: <message>"` lines to
/// `<dir>/YYYY-MM-DD.islog`, opening a new file whenever the date rolls
/// over. Not a `tracing` layer — called directly from the message-logging
/// call sites that want it, same as the original's day-file logger.
pub struct DayLogWriter {
    dir: PathBuf,
    current_day: Option<String>,
    file: Option<std::fs::File>,
}

impl DayLogWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DayLogWriter { dir: dir.into(), current_day: None, file: None }
    }

    pub fn log(&mut self, device: &str, message: &str) -> std::io::Result<()> {
        let now = chrono::Local::now();
        let day = now.format("%Y-%m-%d").to_string();
        if self.current_day.as_deref() != Some(day.as_str()) {
            let path = self.path_for(&day);
            self.file = Some(OpenOptions::new().create(true).append(true).open(path)?);
            self.current_day = Some(day);
        }
        if let Some(file) = &mut self.file {
            writeln!(file, "{}: {}: {}", now.to_rfc3339(), device, message)?;
        }
        Ok(())
    }

    fn path_for(&self, day: &str) -> PathBuf {
        let mut p = self.dir.clone();
        p.push(format!("{day}.islog"));
        p
    }
}

pub fn day_log_path(dir: &Path, day: &str) -> PathBuf {
    dir.join(format!("{day}.islog"))
}
