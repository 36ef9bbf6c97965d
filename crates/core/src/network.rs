// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 RDP Tunnel Contributors

// Network utility functions

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{Error, Result};

pub const DEFAULT_SSH_PORT: u16 = 22;

/// Lowest local port accepted for the tunnel listener
pub const MIN_LOCAL_PORT: u16 = 33890;
/// Highest local port accepted for the tunnel listener
pub const MAX_LOCAL_PORT: u16 = 65000;

/// Format a host and port, bracketing IPv6 literals
pub fn format_host_port(host: &str, port: u16) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Split "host:port" / "[v6]:port" into its parts; None when no port is present
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?.parse().ok()?;
        return Some((host, port));
    }

    let (host, port) = addr.rsplit_once(':')?;
    // A second colon means a bare IPv6 literal, not host:port
    if host.contains(':') {
        return None;
    }
    Some((host, port.parse().ok()?))
}

/// Normalize an SSH destination to "host:port", defaulting to port 22
pub fn normalize_ssh_addr(host: &str) -> String {
    let host = host.trim();
    if split_host_port(host).is_some() {
        host.to_string()
    } else {
        format_host_port(host, DEFAULT_SSH_PORT)
    }
}

/// Local listener port, guaranteed to lie in [MIN_LOCAL_PORT, MAX_LOCAL_PORT]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalPort(u16);

impl LocalPort {
    pub fn new(port: u16) -> Result<Self> {
        if !(MIN_LOCAL_PORT..=MAX_LOCAL_PORT).contains(&port) {
            return Err(Error::Input(format!(
                "local port must be between {} and {}",
                MIN_LOCAL_PORT, MAX_LOCAL_PORT
            )));
        }
        Ok(Self(port))
    }

    /// Parse a port as typed by a user
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::Input("local port is required".to_string()));
        }
        // Parse wider than u16 so "70000" reports a range error, not a format error
        let port: i64 = text
            .parse()
            .map_err(|_| Error::Input("local port must be a number".to_string()))?;
        if port < MIN_LOCAL_PORT as i64 || port > MAX_LOCAL_PORT as i64 {
            return Err(Error::Input(format!(
                "local port must be between {} and {}",
                MIN_LOCAL_PORT, MAX_LOCAL_PORT
            )));
        }
        Self::new(port as u16)
    }

    pub fn get(self) -> u16 {
        self.0
    }

    /// Loopback socket address the tunnel listener binds to
    pub fn loopback_addr(self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.0)
    }
}

impl fmt::Display for LocalPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_ssh_addr() {
        assert_eq!(normalize_ssh_addr("example.com"), "example.com:22");
        assert_eq!(normalize_ssh_addr("example.com:2222"), "example.com:2222");
        assert_eq!(normalize_ssh_addr("10.0.0.5"), "10.0.0.5:22");
        assert_eq!(normalize_ssh_addr("::1"), "[::1]:22");
        assert_eq!(normalize_ssh_addr("[::1]:2200"), "[::1]:2200");
        assert_eq!(normalize_ssh_addr(" host "), "host:22");
    }

    #[test]
    fn test_port_boundaries() {
        assert!(LocalPort::parse("33889").is_err());
        assert!(LocalPort::parse("65001").is_err());
        assert_eq!(LocalPort::parse("33890").unwrap().get(), 33890);
        assert_eq!(LocalPort::parse("65000").unwrap().get(), 65000);

        assert!(LocalPort::new(33889).is_err());
        assert!(LocalPort::new(65001).is_err());
        assert!(LocalPort::new(33890).is_ok());
        assert!(LocalPort::new(65000).is_ok());
    }

    #[test]
    fn test_port_messages() {
        let err = LocalPort::parse("").unwrap_err();
        assert_eq!(err.to_string(), "Invalid input: local port is required");

        let err = LocalPort::parse("rdp").unwrap_err();
        assert_eq!(err.to_string(), "Invalid input: local port must be a number");

        let err = LocalPort::parse("99999999").unwrap_err();
        assert!(err.to_string().contains("between 33890 and 65000"));
    }

    #[test]
    fn test_loopback_addr() {
        let port = LocalPort::new(40000).unwrap();
        assert_eq!(port.loopback_addr().to_string(), "127.0.0.1:40000");
    }
}
