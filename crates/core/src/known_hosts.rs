// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 RDP Tunnel Contributors

// RDP Tunnel - Known Hosts Module
// Trust-on-first-use storage for SSH host keys (OpenSSH known_hosts format)

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::network::DEFAULT_SSH_PORT;

/// Outcome of checking a server key against the store
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyCheck {
    /// Key matches a stored entry
    Trusted,
    /// Host was unknown; the key has been recorded
    Recorded,
    /// Host is known under a different key
    Mismatch { line_number: usize, actual_fingerprint: String },
}

/// Host key line managed by the store
#[derive(Debug, Clone)]
struct Entry {
    /// Comma-separated patterns ("host" or "[host]:port")
    host_pattern: String,
    /// Key algorithm, e.g. "ssh-ed25519"
    key_type: String,
    /// Base64 key blob
    key_data: String,
    /// Trailing free-form comment
    comment: Option<String>,
    /// 1-based line in the file
    line_number: usize,
}

impl Entry {
    fn parse(line: &str, line_number: usize) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        // @cert-authority / @revoked lines are left to OpenSSH
        if line.starts_with('@') {
            debug!("Skipping known_hosts marker line {}", line_number);
            return None;
        }

        let mut parts = line.split_whitespace();
        let (Some(host_pattern), Some(key_type), Some(key_data)) =
            (parts.next(), parts.next(), parts.next())
        else {
            warn!("Invalid known_hosts entry at line {}: too few fields", line_number);
            return None;
        };
        let comment = parts.collect::<Vec<_>>().join(" ");

        Some(Entry {
            host_pattern: host_pattern.to_string(),
            key_type: key_type.to_string(),
            key_data: key_data.to_string(),
            comment: (!comment.is_empty()).then_some(comment),
            line_number,
        })
    }

    fn format(&self) -> String {
        match &self.comment {
            Some(comment) => format!(
                "{} {} {} {}",
                self.host_pattern, self.key_type, self.key_data, comment
            ),
            None => format!("{} {} {}", self.host_pattern, self.key_type, self.key_data),
        }
    }

    fn matches(&self, host: &str, port: u16) -> bool {
        self.host_pattern
            .split(',')
            .any(|pattern| pattern == host_pattern(host, port))
    }

    fn has_key(&self, key: &PublicKey) -> bool {
        self.key_type == key.algorithm().as_str() && self.key_data == key.public_key_base64()
    }
}

/// known_hosts file
pub struct KnownHosts {
    path: PathBuf,
    entries: Vec<Entry>,
    /// Lines in the file, including ones the store does not manage
    line_count: usize,
}

impl KnownHosts {
    /// Load from `path`; a missing file is an empty store
    pub fn load(path: &Path) -> Result<Self> {
        let mut entries = Vec::new();
        let mut line_count = 0;

        if path.exists() {
            let contents = fs::read_to_string(path).map_err(|e| {
                Error::Config(format!(
                    "Failed to read known_hosts file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            line_count = contents.lines().count();
            entries.extend(
                contents
                    .lines()
                    .enumerate()
                    .filter_map(|(idx, line)| Entry::parse(line, idx + 1)),
            );
            debug!("Loaded {} entries from known_hosts: {}", entries.len(), path.display());
        } else {
            info!("Known_hosts file does not exist yet: {}", path.display());
        }

        Ok(KnownHosts {
            path: path.to_path_buf(),
            entries,
            line_count,
        })
    }

    /// Default location: <config_dir>/rdp-tunnel/known_hosts
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;
        Ok(config_dir.join(crate::config::APP_DIR).join("known_hosts"))
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> Option<HostKeyCheck> {
        let matching: Vec<&Entry> = self.entries.iter().filter(|e| e.matches(host, port)).collect();
        let first = matching.first()?;

        if matching.iter().any(|e| e.has_key(key)) {
            return Some(HostKeyCheck::Trusted);
        }

        Some(HostKeyCheck::Mismatch {
            line_number: first.line_number,
            actual_fingerprint: fingerprint(key),
        })
    }

    /// Verify `key`, recording it when the host has never been seen
    pub fn check_or_record(&mut self, host: &str, port: u16, key: &PublicKey) -> Result<HostKeyCheck> {
        if let Some(result) = self.verify(host, port, key) {
            return Ok(result);
        }

        let entry = Entry {
            host_pattern: host_pattern(host, port),
            key_type: key.algorithm().as_str().to_string(),
            key_data: key.public_key_base64(),
            comment: None,
            line_number: 0,
        };
        self.append(entry)?;
        info!("Recorded host key {} for {}", fingerprint(key), host_pattern(host, port));
        Ok(HostKeyCheck::Recorded)
    }

    /// Append one line; existing content is never rewritten
    fn append(&mut self, mut entry: Entry) -> Result<()> {
        let path = self.path.clone();
        let write_error = |e: std::io::Error| {
            Error::Config(format!(
                "Failed to write known_hosts file {}: {}",
                path.display(),
                e
            ))
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(write_error)?;
        }

        let existing = match fs::read(&self.path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(write_error(e)),
        };

        let mut options = fs::OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path).map_err(write_error)?;

        let mut text = String::new();
        match &existing {
            None => {
                text.push_str("# RDP Tunnel - Known Hosts\n");
                self.line_count = 1;
            }
            Some(bytes) if bytes.last().is_some_and(|b| *b != b'\n') => text.push('\n'),
            Some(_) => {}
        }
        self.line_count += 1;
        entry.line_number = self.line_count;
        text.push_str(&entry.format());
        text.push('\n');

        file.write_all(text.as_bytes()).map_err(write_error)?;
        self.entries.push(entry);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// "host" on the default port, "[host]:port" otherwise
fn host_pattern(host: &str, port: u16) -> String {
    if port == DEFAULT_SSH_PORT {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// SHA256 fingerprint in OpenSSH notation
pub fn fingerprint(key: &PublicKey) -> String {
    let digest = Sha256::digest(key.public_key_bytes());
    format!("SHA256:{}", STANDARD.encode(digest).trim_end_matches('='))
}
