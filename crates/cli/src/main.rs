// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 RDP Tunnel Contributors

// RDP Tunnel - CLI Client
// Command-line interface for certificate-authenticated RDP tunnels

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use dialoguer::Password;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use rdp_tunnel_core::{
    export_private_key, export_public_key, test_connection, tracing_sink, write_key_file,
    CertificateBundle, ClientConfig, ConnectRequest, RdpFileViewer, TunnelManager, TunnelState,
};

use config::TargetArgs;

/// Read instead of prompting when set
const PASSWORD_ENV: &str = "RDP_TUNNEL_P12_PASSWORD";

#[derive(Parser)]
#[command(name = "rdp-tunnel")]
#[command(about = "Remote Desktop over a certificate-authenticated SSH tunnel", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the tunnel and launch the Remote Desktop client
    Connect {
        #[command(flatten)]
        target: TargetArgs,

        /// Remote Desktop client to launch with the generated .rdp file
        #[arg(long)]
        viewer: Option<String>,

        /// Do not save the overrides to the configuration file
        #[arg(long)]
        no_save: bool,
    },

    /// Authenticate against the SSH server and disconnect
    Test {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Export the certificate's key in OpenSSH-compatible formats
    ExportKey {
        /// Export the private key (PEM)
        #[arg(long, conflicts_with = "public", required_unless_present = "public")]
        private: bool,

        /// Export the public key (authorized_keys line)
        #[arg(long)]
        public: bool,

        /// Output file (default: id_rsa / id_ecdsa and .pub in the current directory)
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// PKCS#12 certificate bundle (default: from configuration)
        #[arg(short = 'c', long = "p12")]
        p12: Option<PathBuf>,
    },

    /// Show identity details from a certificate bundle
    Info {
        /// PKCS#12 certificate bundle (default: from configuration)
        #[arg(short = 'c', long = "p12")]
        p12: Option<PathBuf>,
    },

    /// Inspect the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Print the configuration file location
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("rdp_tunnel=info,rdp_tunnel_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Connect {
            target,
            viewer,
            no_save,
        } => {
            connect(target, viewer, no_save).await?;
        }
        Commands::Test { target } => {
            test(target).await?;
        }
        Commands::ExportKey {
            private,
            public,
            out,
            p12,
        } => {
            export_key(private && !public, out, p12)?;
        }
        Commands::Info { p12 } => {
            show_info(p12)?;
        }
        Commands::Config { action } => match action {
            ConfigCommands::Show => {
                let config = ClientConfig::load()?;
                let text = toml::to_string_pretty(&config)
                    .context("Failed to serialize configuration")?;
                print!("{}", text);
            }
            ConfigCommands::Path => {
                println!("{}", ClientConfig::config_path()?.display());
            }
        },
    }

    Ok(())
}

async fn connect(target: TargetArgs, viewer: Option<String>, no_save: bool) -> Result<()> {
    let mut config = ClientConfig::load()?;
    let mut changed = target.apply(&mut config);
    if let Some(viewer) = viewer {
        changed |= config.viewer_program != viewer;
        config.viewer_program = viewer;
    }

    let request = ConnectRequest::new(&config.remote_host, &config.remote_user, &config.local_port)?;
    let bundle = load_bundle(&config::p12_path(&config)?)?;

    if changed && !no_save {
        config.save().context("Failed to save configuration")?;
    }

    let manager = TunnelManager::new(
        config.tunnel.clone(),
        Arc::new(RdpFileViewer::new(&config.viewer_program)),
        tracing_sink(),
    );

    println!("{}", TunnelState::Connecting.status_text(request.host()).dimmed());
    let host = request.host().to_string();
    let mut handle = manager.connect(request, &bundle).await?;

    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("{}", "Disconnecting...".yellow());
            cancel.cancel();
        }
    });

    if let Some(local_addr) = handle.ready().await {
        println!();
        println!("{}", manager.status().await.status_text(&host).green().bold());
        println!(
            "  Forwarding {} -> {}:{}",
            local_addr, config.tunnel.remote_target_host, config.tunnel.remote_target_port
        );
        println!();
        println!("{}", "Tunnel is running. Press Ctrl+C to stop".dimmed());
    }

    match handle.wait().await {
        Ok(()) => {
            println!("{}", TunnelState::Closed.status_text(&host));
            Ok(())
        }
        Err(e) if e.is_cancellation() => {
            println!("{}", TunnelState::Closed.status_text(&host));
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", manager.status().await.status_text(&host).red().bold());
            Err(e).context("Tunnel failed")
        }
    }
}

async fn test(target: TargetArgs) -> Result<()> {
    let mut config = ClientConfig::load()?;
    target.apply(&mut config);

    let bundle = load_bundle(&config::p12_path(&config)?)?;
    println!("{}", "Status: Testing SSH connection...".dimmed());

    match test_connection(&config.remote_host, &config.remote_user, &bundle, &config.tunnel).await {
        Ok(message) => {
            println!("{}", format!("✓ {}", message).green().bold());
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", format!("Status: Test Failed - {}", e).red());
            Err(e.into())
        }
    }
}

fn export_key(private: bool, out: Option<PathBuf>, p12: Option<PathBuf>) -> Result<()> {
    let bundle = load_bundle(&resolve_p12(p12)?)?;
    let (private_name, public_name) = bundle.key().default_file_names();

    if private {
        let out = out.unwrap_or_else(|| PathBuf::from(private_name));
        let pem = export_private_key(bundle.key())?;
        write_key_file(&out, &pem, true)
            .with_context(|| format!("Failed to write {}", out.display()))?;
        println!("{}", format!("✓ Private key written to {}", out.display()).green());
    } else {
        let out = out.unwrap_or_else(|| PathBuf::from(public_name));
        let line = export_public_key(bundle.key())?;
        write_key_file(&out, &line, false)
            .with_context(|| format!("Failed to write {}", out.display()))?;
        println!("{}", format!("✓ Public key written to {}", out.display()).green());
    }

    Ok(())
}

fn show_info(p12: Option<PathBuf>) -> Result<()> {
    let path = resolve_p12(p12)?;
    let bundle = load_bundle(&path)?;
    let public = export_public_key(bundle.key())?;

    println!();
    println!("{}", format!("Certificate: {}", path.display()).bold().green());
    println!("  CN:   {}", bundle.common_name());
    if bundle.upn().is_empty() {
        println!("  UPN:  {}", "(none)".dimmed());
    } else {
        println!("  UPN:  {}", bundle.upn().cyan());
    }
    println!("  Key:  {}", bundle.key().algorithm());
    println!();
    println!("{}", "  Public key:".bold());
    print!("    {}", String::from_utf8_lossy(&public));
    println!();

    Ok(())
}

fn resolve_p12(p12: Option<PathBuf>) -> Result<PathBuf> {
    match p12 {
        Some(path) => Ok(path),
        None => config::p12_path(&ClientConfig::load()?),
    }
}

fn load_bundle(path: &Path) -> Result<CertificateBundle> {
    let password = read_password(path)?;
    CertificateBundle::load(path, &password)
        .with_context(|| format!("Invalid certificate {}", path.display()))
}

fn read_password(path: &Path) -> Result<Zeroizing<String>> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(Zeroizing::new(password));
    }

    let password = Password::new()
        .with_prompt(format!("Password for {}", path.display()))
        .allow_empty_password(true)
        .interact()
        .context("Failed to read password input")?;
    Ok(Zeroizing::new(password))
}
