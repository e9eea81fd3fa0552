//! FIFO control channel (§4.J): `start`/`stop` lines read from a named
//! pipe, in the same `sscanf`-flavored shape as the original
//! `fifo_server.cpp`, just parsed with `split_whitespace` and a small
//! flag-aware scanner instead of `sscanf` format strings.

use crate::error::FifoError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FifoCommand {
    Start { name: String, label: Option<String>, config: Option<String>, skel: Option<String>, prefix: Option<String> },
    Stop { name: String, label: Option<String> },
}

/// Parses one control-FIFO line. Quoted option values (`-n "cam"`) have
/// their quotes stripped; unknown flags are rejected outright, matching
/// the original's strict `sscanf` grammar.
pub fn parse_line(line: &str) -> Result<FifoCommand, FifoError> {
    let mut tokens = tokenize(line);
    let verb = tokens.next().ok_or_else(|| FifoError::Malformed(line.to_owned()))?;
    let name = tokens.next().ok_or_else(|| FifoError::Malformed(line.to_owned()))?;

    let mut label = None;
    let mut config = None;
    let mut skel = None;
    let mut prefix = None;

    while let Some(flag) = tokens.next() {
        let value = tokens.next().ok_or_else(|| FifoError::Malformed(line.to_owned()))?;
        match flag {
            "-n" => label = Some(value.to_owned()),
            "-c" => config = Some(value.to_owned()),
            "-s" => skel = Some(value.to_owned()),
            "-p" => prefix = Some(value.to_owned()),
            other => return Err(FifoError::Malformed(format!("unknown flag {other} in: {line}"))),
        }
    }

    match verb {
        "start" => Ok(FifoCommand::Start { name: name.to_owned(), label, config, skel, prefix }),
        "stop" => Ok(FifoCommand::Stop { name: name.to_owned(), label }),
        other => Err(FifoError::Malformed(format!("unknown verb {other} in: {line}"))),
    }
}

/// Splits on whitespace, but treats `"..."` as one token with the quotes
/// removed.
fn tokenize(line: &str) -> impl Iterator<Item = &str> {
    let mut out = Vec::new();
    let mut rest = line.trim();
    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix('"') {
            if let Some(end) = stripped.find('"') {
                out.push(&stripped[..end]);
                rest = stripped[end + 1..].trim_start();
                continue;
            }
        }
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        out.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    out.into_iter()
}

/// Accumulates bytes from a non-blocking FIFO read, splitting complete
/// lines off a 1 KiB rolling buffer. Returns `Err` if a line never
/// terminates before the buffer fills (overflow).
pub struct FifoBuffer {
    buf: Vec<u8>,
}

impl FifoBuffer {
    pub fn new() -> Self {
        FifoBuffer { buf: Vec::new() }
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<String>, FifoError> {
        self.buf.extend_from_slice(data);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(&self.buf[..pos]).into_owned();
            lines.push(line);
            self.buf.drain(..=pos);
        }
        if self.buf.len() > 1024 {
            return Err(FifoError::Malformed("control line exceeded 1KiB without newline".to_owned()));
        }
        Ok(lines)
    }
}

impl Default for FifoBuffer {
    fn default() -> Self {
        Self::new()
    }
}
