// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 RDP Tunnel Contributors

// Shared fixtures: an in-process SSH server, an echo service and certificate bundles

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::OsRng;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use russh::keys::{Algorithm, PrivateKey, PublicKey};
use russh::server::{Auth, Msg, Session};
use russh::Channel;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::task::JoinHandle;

use rdp_tunnel_core::{
    CertificateBundle, Error, Result, TunnelOptions, ViewerLauncher, ViewerProcess, ViewerTarget,
};

pub const PASSWORD: &str = "hunter2";

/// Mint a P-256 certificate bundle through a real PKCS#12 container
pub fn make_bundle(common_name: &str) -> CertificateBundle {
    bundle_for(common_name, &rcgen::KeyPair::generate().unwrap())
}

/// RSA-2048 variant, signed with rsa-sha2 on the wire
pub fn make_rsa_bundle(common_name: &str) -> CertificateBundle {
    let key = rsa::RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
    let pem = key.to_pkcs8_pem(LineEnding::LF).unwrap();
    let key_pair = rcgen::KeyPair::from_pkcs8_pem_and_sign_algo(&pem, &rcgen::PKCS_RSA_SHA256)
        .unwrap();
    bundle_for(common_name, &key_pair)
}

fn bundle_for(common_name: &str, key_pair: &rcgen::KeyPair) -> CertificateBundle {
    let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, common_name);
    params.distinguished_name = dn;
    let cert = params.self_signed(key_pair).unwrap();

    let der = p12::PFX::new(cert.der(), &key_pair.serialize_der(), None, PASSWORD, "rdp")
        .unwrap()
        .to_der();
    CertificateBundle::from_pkcs12(&der, PASSWORD).unwrap()
}

pub fn ssh_public_key(bundle: &CertificateBundle) -> PublicKey {
    bundle.key().to_ssh_key().unwrap().public_key().clone()
}

/// Echoes every byte back; stands in for the remote RDP service
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

#[derive(Clone)]
struct TestHandler {
    authorized: PublicKey,
}

impl russh::server::Handler for TestHandler {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        _user: &str,
        public_key: &PublicKey,
    ) -> std::result::Result<Auth, Self::Error> {
        if public_key.key_data() == self.authorized.key_data() {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        // Refuse the channel when the target is down, like sshd does
        let target = format!("{}:{}", host_to_connect, port_to_connect);
        let Ok(mut upstream) = TcpStream::connect(&target).await else {
            return Ok(false);
        };
        tokio::spawn(async move {
            let mut stream = channel.into_stream();
            let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
        });
        Ok(true)
    }
}

/// SSH server accepting exactly one public key
pub struct TestServer {
    pub addr: SocketAddr,
    accept_task: JoinHandle<()>,
    sessions: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TestServer {
    pub async fn start(authorized: PublicKey) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let config = Arc::new(russh::server::Config {
            keys: vec![PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()],
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::ZERO),
            inactivity_timeout: None,
            ..Default::default()
        });
        let handler = TestHandler { authorized };
        let sessions: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let tracked = sessions.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                // The SSH session runs on an in-memory pipe; the relay task owns
                // the real socket so aborting it cuts the connection
                let (mut relay_end, server_end) = tokio::io::duplex(64 * 1024);
                let config = config.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Ok(running) =
                        russh::server::run_stream(config, server_end, handler).await
                    {
                        let _ = running.await;
                    }
                });
                let relay = tokio::spawn(async move {
                    let _ = tokio::io::copy_bidirectional(&mut socket, &mut relay_end).await;
                });
                tracked.lock().unwrap().push(relay);
            }
        });

        Self {
            addr,
            accept_task,
            sessions,
        }
    }

    /// Drop every live SSH connection, as a crashed server would
    pub fn kill_sessions(&self) {
        for session in self.sessions.lock().unwrap().drain(..) {
            session.abort();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.kill_sessions();
    }
}

/// Tunnel options forwarding to `target` with short timers
pub fn options_for(target: SocketAddr) -> TunnelOptions {
    TunnelOptions {
        remote_target_host: target.ip().to_string(),
        remote_target_port: target.port(),
        keepalive_interval_secs: 1,
        connect_timeout_secs: 5,
        ..Default::default()
    }
}

/// Viewer that runs a fixed command and records where it was pointed
pub struct CommandViewer {
    program: &'static str,
    args: Vec<&'static str>,
    pub targets: Mutex<Vec<ViewerTarget>>,
}

impl CommandViewer {
    /// Stays up until the session terminates it
    pub fn long_running() -> Self {
        Self {
            program: "sleep",
            args: vec!["30"],
            targets: Mutex::new(Vec::new()),
        }
    }

    /// Exits successfully straight away
    pub fn exits_immediately() -> Self {
        Self {
            program: "true",
            args: Vec::new(),
            targets: Mutex::new(Vec::new()),
        }
    }
}

impl ViewerLauncher for CommandViewer {
    fn launch(&self, target: &ViewerTarget) -> Result<ViewerProcess> {
        self.targets.lock().unwrap().push(target.clone());
        let child = Command::new(self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Process(e.to_string()))?;
        Ok(ViewerProcess::new(child))
    }
}

/// A loopback address nothing listens on
pub async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}
