// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 RDP Tunnel Contributors

// Error types for RDP Tunnel

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Coarse classification used by front ends to decide how to present an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    Certificate,
    Auth,
    Network,
    Process,
    Cancellation,
    Config,
    /// Local I/O outside the other categories
    Io,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid input: {0}")]
    Input(String),

    #[error("A tunnel session is already active")]
    SessionActive,

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Host key verification failed: {0}")]
    HostKey(String),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("Viewer process error: {0}")]
    Process(String),

    #[error("Session cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("failed to read file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode p12: {0}")]
    Decode(String),

    #[error("no private key found in p12")]
    MissingKey,

    #[error("no certificate found in p12")]
    MissingCertificate,

    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("failed to encode key: {0}")]
    Encode(String),

    #[error("failed to write key file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Failed to connect to {addr}: {reason}")]
    Dial { addr: String, reason: String },

    #[error("Connection to {addr} timed out after {after:?}")]
    Timeout { addr: String, after: Duration },

    #[error("Failed to start local listener on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Forwarding failed: {0}")]
    Forward(String),

    #[error("Keep-alive failed: {0}")]
    Keepalive(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Input(_) | Error::SessionActive => ErrorKind::Input,
            Error::Certificate(_) => ErrorKind::Certificate,
            Error::Auth(_) | Error::HostKey(_) => ErrorKind::Auth,
            Error::Network(_) => ErrorKind::Network,
            Error::Process(_) => ErrorKind::Process,
            Error::Cancelled => ErrorKind::Cancellation,
            Error::Config(_) => ErrorKind::Config,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// True when the session ended because the user asked it to
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
