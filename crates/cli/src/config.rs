// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 RDP Tunnel Contributors

// RDP Tunnel - CLI Config Module
// Merges command-line overrides into the persisted client configuration

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Args;

use rdp_tunnel_core::ClientConfig;

/// Connection settings that may override the saved configuration
#[derive(Args, Debug, Clone, Default)]
pub struct TargetArgs {
    /// Remote SSH host (host or host:port)
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// SSH username
    #[arg(short, long)]
    pub user: Option<String>,

    /// Local listener port (33890-65000)
    #[arg(short = 'l', long)]
    pub port: Option<String>,

    /// PKCS#12 certificate bundle (.p12/.pfx)
    #[arg(short = 'c', long = "p12")]
    pub p12: Option<PathBuf>,
}

impl TargetArgs {
    /// Apply overrides; true when the configuration changed
    pub fn apply(&self, config: &mut ClientConfig) -> bool {
        let mut changed = false;

        if let Some(host) = &self.host {
            changed |= replace(&mut config.remote_host, host.trim().to_string());
        }
        if let Some(user) = &self.user {
            changed |= replace(&mut config.remote_user, user.trim().to_string());
        }
        if let Some(port) = &self.port {
            changed |= replace(&mut config.local_port, port.trim().to_string());
        }
        if let Some(p12) = &self.p12 {
            changed |= replace(&mut config.p12_path, Some(p12.clone()));
        }

        changed
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

/// Certificate path from the configuration
pub fn p12_path(config: &ClientConfig) -> Result<PathBuf> {
    match &config.p12_path {
        Some(path) if !path.as_os_str().is_empty() => Ok(path.clone()),
        _ => bail!("No certificate configured. Pass --p12 <file>"),
    }
}
