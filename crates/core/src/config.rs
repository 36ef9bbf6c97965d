// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 RDP Tunnel Contributors

// Configuration structures for RDP Tunnel

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Directory name under the platform config dir
pub const APP_DIR: &str = "rdp-tunnel";

/// How the server's host key is verified
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Accept any host key (insecure; matches the historical behaviour)
    #[default]
    AcceptAny,
    /// Record unknown hosts, reject changed keys
    TrustOnFirstUse {
        /// known_hosts file; defaults to <config_dir>/rdp-tunnel/known_hosts
        #[serde(default, skip_serializing_if = "Option::is_none")]
        known_hosts: Option<PathBuf>,
    },
}

/// Tunnel behaviour, independent of any particular destination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelOptions {
    /// Host the forwarded channel connects to, as seen from the SSH server
    #[serde(default = "default_remote_target_host")]
    pub remote_target_host: String,
    /// Port the forwarded channel connects to (RDP)
    #[serde(default = "default_remote_target_port")]
    pub remote_target_port: u16,
    /// Interval between keepalive requests, in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    /// Dial + handshake timeout, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
}

fn default_remote_target_host() -> String {
    "localhost".to_string()
}

fn default_remote_target_port() -> u16 {
    3389
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    5
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            remote_target_host: default_remote_target_host(),
            remote_target_port: default_remote_target_port(),
            keepalive_interval_secs: default_keepalive_interval(),
            connect_timeout_secs: default_connect_timeout(),
            host_key_policy: HostKeyPolicy::default(),
        }
    }
}

impl TunnelOptions {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

fn default_local_port() -> String {
    crate::network::MIN_LOCAL_PORT.to_string()
}

fn default_viewer_program() -> String {
    if cfg!(windows) {
        "mstsc.exe".to_string()
    } else {
        "xfreerdp".to_string()
    }
}

/// Persisted client settings (the certificate password is never stored)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub remote_host: String,
    #[serde(default)]
    pub remote_user: String,
    /// Kept as typed so validation can report non-numeric input
    #[serde(default = "default_local_port")]
    pub local_port: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p12_path: Option<PathBuf>,
    #[serde(default = "default_viewer_program")]
    pub viewer_program: String,
    #[serde(flatten)]
    pub tunnel: TunnelOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            remote_host: String::new(),
            remote_user: String::new(),
            local_port: default_local_port(),
            p12_path: None,
            viewer_program: default_viewer_program(),
            tunnel: TunnelOptions::default(),
        }
    }
}

impl ClientConfig {
    /// Load from the default location; missing or unreadable files yield defaults
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Ok(Self::load_from(&path))
    }

    pub fn load_from(path: &std::path::Path) -> Self {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                debug!("No configuration at {} ({}), using defaults", path.display(), e);
                return Self::default();
            }
        };

        match toml::from_str::<Self>(&contents) {
            Ok(mut config) => {
                if config.local_port.trim().is_empty() {
                    config.local_port = default_local_port();
                }
                config
            }
            Err(e) => {
                warn!("Ignoring invalid configuration {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize configuration: {}", e)))?;
        fs::write(path, contents)?;
        debug!("Saved configuration to {}", path.display());
        Ok(())
    }

    /// <config_dir>/rdp-tunnel/config.toml
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;
        Ok(config_dir.join(APP_DIR).join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let options = TunnelOptions::default();
        assert_eq!(options.remote_target_host, "localhost");
        assert_eq!(options.remote_target_port, 3389);
        assert_eq!(options.keepalive_interval(), Duration::from_secs(30));
        assert_eq!(options.connect_timeout(), Duration::from_secs(5));
        assert_eq!(options.host_key_policy, HostKeyPolicy::AcceptAny);

        let config = ClientConfig::default();
        assert_eq!(config.local_port, "33890");
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("rdp-tunnel").join("config.toml");

        let mut config = ClientConfig::default();
        config.remote_host = "bastion.example.com".to_string();
        config.remote_user = "alice".to_string();
        config.local_port = "40000".to_string();
        config.p12_path = Some(PathBuf::from("/home/alice/alice.p12"));
        config.tunnel.remote_target_port = 3390;
        config.tunnel.host_key_policy = HostKeyPolicy::TrustOnFirstUse { known_hosts: None };
        config.save_to(&path).unwrap();

        let loaded = ClientConfig::load_from(&path);
        assert_eq!(loaded.remote_host, "bastion.example.com");
        assert_eq!(loaded.local_port, "40000");
        assert_eq!(loaded.p12_path, config.p12_path);
        assert_eq!(loaded.tunnel.remote_target_port, 3390);
        assert_eq!(loaded.tunnel.host_key_policy, config.tunnel.host_key_policy);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "remote_host = \"h\"\nlocal_port = \"\"\n").unwrap();

        let loaded = ClientConfig::load_from(&path);
        assert_eq!(loaded.remote_host, "h");
        assert_eq!(loaded.local_port, "33890");
        assert_eq!(loaded.tunnel.remote_target_port, 3389);
    }

    #[test]
    fn test_invalid_file_yields_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "this is [not toml").unwrap();

        let loaded = ClientConfig::load_from(&path);
        assert_eq!(loaded.remote_host, "");
        assert_eq!(loaded.local_port, "33890");
    }
}
