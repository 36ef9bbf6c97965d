// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 RDP Tunnel Contributors

//! Certificate-authenticated SSH tunnel for Remote Desktop sessions.
//!
//! A PKCS#12 bundle is decoded into a [`CertificateBundle`], its key signs the
//! SSH public key authentication, and a [`TunnelManager`] forwards a loopback
//! port to the remote RDP endpoint while an external viewer runs.

pub mod auth;
pub mod certificate;
pub mod config;
pub mod error;
pub mod keys;
pub mod known_hosts;
pub mod network;
pub mod tunnel;
pub mod viewer;

pub use auth::{test_connection, AuthConfig};
pub use certificate::CertificateBundle;
pub use config::{ClientConfig, HostKeyPolicy, TunnelOptions};
pub use error::{CertificateError, Error, ErrorKind, NetworkError, Result};
pub use keys::{export_private_key, export_public_key, write_key_file, EcdsaKey, KeyMaterial};
pub use network::LocalPort;
pub use tunnel::{
    log_sink, tracing_sink, ConnectRequest, LogSink, SessionHandle, TunnelEvent, TunnelManager,
    TunnelState,
};
pub use viewer::{RdpFileViewer, ViewerLauncher, ViewerProcess, ViewerTarget};
