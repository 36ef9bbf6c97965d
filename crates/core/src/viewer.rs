// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 RDP Tunnel Contributors

// RDP Tunnel - Viewer Module
// Launches the Remote Desktop client against the local tunnel endpoint

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitStatus;

use tempfile::TempPath;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Where the viewer should connect
#[derive(Debug, Clone)]
pub struct ViewerTarget {
    pub address: SocketAddr,
    pub username: String,
}

/// A running viewer; killed when dropped
pub struct ViewerProcess {
    child: Child,
    // Removed from disk once the process handle goes away
    _connection_file: Option<TempPath>,
}

impl ViewerProcess {
    pub fn new(child: Child) -> Self {
        Self {
            child,
            _connection_file: None,
        }
    }

    pub fn with_connection_file(child: Child, file: TempPath) -> Self {
        Self {
            child,
            _connection_file: Some(file),
        }
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the viewer to exit
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        self.child
            .wait()
            .await
            .map_err(|e| Error::Process(format!("failed to wait for viewer: {}", e)))
    }

    /// Kill the viewer if it is still running
    pub async fn terminate(&mut self) {
        match self.child.try_wait() {
            Ok(Some(status)) => debug!("Viewer already exited with {}", status),
            _ => {
                if let Err(e) = self.child.kill().await {
                    debug!("Failed to kill viewer: {}", e);
                }
            }
        }
    }
}

/// Capability to start a Remote Desktop viewer for a tunnel
pub trait ViewerLauncher: Send + Sync {
    fn launch(&self, target: &ViewerTarget) -> Result<ViewerProcess>;
}

/// Writes a temporary .rdp file and opens it with `program`
#[derive(Debug, Clone)]
pub struct RdpFileViewer {
    program: PathBuf,
    args: Vec<String>,
}

impl RdpFileViewer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Extra arguments placed before the .rdp file path
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn connection_file_contents(target: &ViewerTarget) -> String {
        format!(
            "full address:s:{}\nusername:s:{}\n",
            target.address, target.username
        )
    }

    fn write_connection_file(target: &ViewerTarget) -> Result<TempPath> {
        let mut file = tempfile::Builder::new()
            .prefix("rdp-tunnel-")
            .suffix(".rdp")
            .tempfile()
            .map_err(|e| Error::Process(format!("failed to create temp rdp file: {}", e)))?;
        file.write_all(Self::connection_file_contents(target).as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| Error::Process(format!("failed to write rdp file: {}", e)))?;

        // Close our handle so the viewer can open the file on every platform
        Ok(file.into_temp_path())
    }
}

impl ViewerLauncher for RdpFileViewer {
    fn launch(&self, target: &ViewerTarget) -> Result<ViewerProcess> {
        let path = Self::write_connection_file(target)?;
        info!(
            "Launching {} with {}",
            self.program.display(),
            path.display()
        );

        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(&*path)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Process(format!(
                    "failed to start {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        Ok(ViewerProcess::with_connection_file(child, path))
    }
}
