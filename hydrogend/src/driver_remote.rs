//! Remote driver dialer (§4.H).

use tokio::net::TcpStream;

use crate::error::DriverError;
use crate::queue::Transport;

pub const DEFAULT_PORT: u16 = 7624;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSpec {
    pub device: Option<String>,
    pub host: String,
    pub port: u16,
}

/// Parses `device@host[:port]` or `@host[:port]`.
pub fn parse(name: &str) -> Option<RemoteSpec> {
    let (device, rest) = match name.split_once('@') {
        Some((d, rest)) => (if d.is_empty() { None } else { Some(d.to_owned()) }, rest),
        None => return None,
    };
    let (host, port) = match rest.rsplit_once(':') {
        Some((h, p)) => (h.to_owned(), p.parse().ok()?),
        None => (rest.to_owned(), DEFAULT_PORT),
    };
    if host.is_empty() {
        return None;
    }
    Some(RemoteSpec { device, host, port })
}

/// Dial the remote and return a transport ready for the initial
/// `getProperties`. Remote drivers never accept shared buffers.
pub async fn dial(spec: &RemoteSpec) -> Result<Transport, DriverError> {
    let stream = TcpStream::connect((spec.host.as_str(), spec.port))
        .await
        .map_err(DriverError::Spawn)?;
    Ok(Transport::Tcp(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_host_port() {
        let spec = parse("cam@scope1:7625").unwrap();
        assert_eq!(spec.device.as_deref(), Some("cam"));
        assert_eq!(spec.host, "scope1");
        assert_eq!(spec.port, 7625);
    }

    #[test]
    fn parses_device_host_default_port() {
        let spec = parse("cam@scope1").unwrap();
        assert_eq!(spec.port, DEFAULT_PORT);
    }

    #[test]
    fn parses_bare_host_as_upstream_server() {
        let spec = parse("@scope1:7624").unwrap();
        assert_eq!(spec.device, None);
        assert_eq!(spec.host, "scope1");
    }

    #[test]
    fn rejects_name_without_at_sign() {
        assert!(parse("/usr/bin/indi_simulator_ccd").is_none());
    }
}
