// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 RDP Tunnel Contributors

// RDP Tunnel - Authentication Module
// SSH client configuration and public key authentication with certificate keys

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, AuthResult, Handle};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use tracing::{debug, error, info, warn};

use crate::certificate::CertificateBundle;
use crate::config::{HostKeyPolicy, TunnelOptions};
use crate::error::{Error, NetworkError, Result};
use crate::known_hosts::{fingerprint, HostKeyCheck, KnownHosts};
use crate::network::{normalize_ssh_addr, split_host_port, DEFAULT_SSH_PORT};

/// SSH client handler; only host key verification is customised
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

fn handler_error(message: String) -> russh::Error {
    russh::Error::from(std::io::Error::new(std::io::ErrorKind::Other, message))
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match &self.policy {
            HostKeyPolicy::AcceptAny => {
                warn!(
                    "Accepting unverified host key {} for {}:{}",
                    fingerprint(server_public_key),
                    self.host,
                    self.port
                );
                Ok(true)
            }
            HostKeyPolicy::TrustOnFirstUse { known_hosts } => {
                let path = match known_hosts {
                    Some(path) => path.clone(),
                    None => KnownHosts::default_path().map_err(|e| handler_error(e.to_string()))?,
                };
                let mut store = KnownHosts::load(&path).map_err(|e| handler_error(e.to_string()))?;

                match store
                    .check_or_record(&self.host, self.port, server_public_key)
                    .map_err(|e| handler_error(format!("Failed to update known_hosts: {}", e)))?
                {
                    HostKeyCheck::Trusted => {
                        info!("Host key verified for {}:{}", self.host, self.port);
                        Ok(true)
                    }
                    HostKeyCheck::Recorded => Ok(true),
                    HostKeyCheck::Mismatch {
                        line_number,
                        actual_fingerprint,
                    } => {
                        error!(
                            "HOST KEY MISMATCH for {}:{}: server presented {}, known_hosts line {} differs",
                            self.host, self.port, actual_fingerprint, line_number
                        );
                        Ok(false)
                    }
                }
            }
        }
    }
}

/// Everything needed to open an authenticated SSH transport
pub struct AuthConfig {
    username: String,
    key: Arc<russh::keys::PrivateKey>,
    timeout: Duration,
    host_key_policy: HostKeyPolicy,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("username", &self.username)
            .field("key", &self.key.algorithm().as_str())
            .field("timeout", &self.timeout)
            .field("host_key_policy", &self.host_key_policy)
            .finish()
    }
}

impl AuthConfig {
    /// Build the signer and connection policy for `username`
    pub fn build(username: &str, bundle: &CertificateBundle, options: &TunnelOptions) -> Result<Self> {
        let key = bundle
            .key()
            .to_ssh_key()
            .map_err(|e| Error::Auth(format!("failed to create signer from private key: {}", e)))?;

        Ok(Self {
            username: username.to_string(),
            key: Arc::new(key),
            timeout: options.connect_timeout(),
            host_key_policy: options.host_key_policy.clone(),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Dial `addr` ("host:port") and authenticate
    pub async fn connect(&self, addr: &str) -> Result<Handle<ClientHandler>> {
        let (host, port) = split_host_port(addr).unwrap_or((addr, DEFAULT_SSH_PORT));
        let handler = ClientHandler {
            host: host.to_string(),
            port,
            policy: self.host_key_policy.clone(),
        };

        let mut cfg = client::Config::default();
        // disable nagle for interactive RDP traffic
        cfg.nodelay = true;
        let config = Arc::new(cfg);

        info!("Connecting to SSH server: {}", addr);
        let mut session =
            match tokio::time::timeout(self.timeout, client::connect(config, addr, handler)).await {
                Ok(Ok(session)) => session,
                Ok(Err(russh::Error::UnknownKey)) => {
                    return Err(Error::HostKey(format!(
                        "server key for {} does not match known_hosts",
                        addr
                    )));
                }
                Ok(Err(e)) => {
                    return Err(NetworkError::Dial {
                        addr: addr.to_string(),
                        reason: e.to_string(),
                    }
                    .into());
                }
                Err(_) => {
                    return Err(NetworkError::Timeout {
                        addr: addr.to_string(),
                        after: self.timeout,
                    }
                    .into());
                }
            };

        match tokio::time::timeout(self.timeout, self.authenticate(&mut session, addr)).await {
            Ok(Ok(())) => {
                info!("SSH authentication successful for {}@{}", self.username, addr);
                Ok(session)
            }
            Ok(Err(e)) => {
                close(&session).await;
                Err(e)
            }
            Err(_) => {
                close(&session).await;
                Err(Error::Auth(format!(
                    "authentication with {} timed out after {:?}",
                    addr, self.timeout
                )))
            }
        }
    }

    async fn authenticate(&self, session: &mut Handle<ClientHandler>, addr: &str) -> Result<()> {
        // Non-RSA keys ignore the hash algorithm
        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .map_err(|e| {
                Error::Auth(format!(
                    "failed to negotiate signature hash with {}: {}",
                    addr, e
                ))
            })?
            .flatten();

        let auth_result = session
            .authenticate_publickey(
                &self.username,
                PrivateKeyWithHashAlg::new(self.key.clone(), hash_alg),
            )
            .await
            .map_err(|e| {
                Error::Auth(format!("public key authentication with {} failed: {}", addr, e))
            })?;

        match auth_result {
            AuthResult::Success => Ok(()),
            AuthResult::Failure {
                remaining_methods,
                partial_success,
            } => {
                let methods: Vec<String> = remaining_methods
                    .iter()
                    .map(|m| {
                        let s: &str = m.into();
                        s.to_string()
                    })
                    .collect();
                let methods_str = if methods.is_empty() {
                    "No authentication methods available".to_string()
                } else {
                    format!("Server requires: {}", methods.join(", "))
                };

                let error_msg = if partial_success {
                    format!(
                        "Public key accepted for {} at {} but more authentication is required. {}",
                        self.username, addr, methods_str
                    )
                } else {
                    format!(
                        "Public key authentication rejected for {} at {}. {}",
                        self.username, addr, methods_str
                    )
                };
                error!("{}", error_msg);
                Err(Error::Auth(error_msg))
            }
        }
    }
}

/// Close a transport, ignoring errors from an already dead connection
pub async fn close(session: &Handle<ClientHandler>) {
    if let Err(e) = session
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await
    {
        debug!("Failed to disconnect gracefully: {}", e);
    }
}

/// Open a transport, authenticate, and close it again
pub async fn test_connection(
    host: &str,
    username: &str,
    bundle: &CertificateBundle,
    options: &TunnelOptions,
) -> Result<String> {
    if host.trim().is_empty() {
        return Err(Error::Input("remote host is required".to_string()));
    }
    if username.trim().is_empty() {
        return Err(Error::Input("ssh username is required".to_string()));
    }

    let auth = AuthConfig::build(username, bundle, options)?;
    let addr = normalize_ssh_addr(host);
    let session = auth.connect(&addr).await?;
    close(&session).await;

    Ok(format!("Successfully authenticated to {} as {}", host, username))
}
