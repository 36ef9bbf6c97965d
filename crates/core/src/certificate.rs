// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 RDP Tunnel Contributors

// RDP Tunnel - Certificate Module
// Decodes PKCS#12 bundles into key material and identity fields

use std::fmt;
use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

use crate::error::{CertificateError, Result};
use crate::keys::KeyMaterial;

/// Key, certificate and derived identity extracted from a PKCS#12 file
pub struct CertificateBundle {
    key: KeyMaterial,
    certificate_der: Vec<u8>,
    common_name: String,
    upn: String,
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("key", &self.key)
            .field("common_name", &self.common_name)
            .field("upn", &self.upn)
            .finish()
    }
}

impl CertificateBundle {
    /// Read and decode a .p12/.pfx file
    pub fn load(path: &Path, password: &str) -> Result<Self> {
        let data = fs::read(path).map_err(|source| CertificateError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Read {} bytes from {}", data.len(), path.display());

        let bundle = Self::from_pkcs12(&data, password)?;
        info!(
            "Loaded certificate for '{}' ({} key)",
            bundle.common_name,
            bundle.key.algorithm()
        );
        Ok(bundle)
    }

    /// Decode PKCS#12 bytes
    pub fn from_pkcs12(data: &[u8], password: &str) -> Result<Self> {
        let pfx = p12::PFX::parse(data)
            .map_err(|e| CertificateError::Decode(format!("malformed container: {}", e)))?;

        if !pfx.verify_mac(password) {
            return Err(
                CertificateError::Decode("decryption password incorrect".to_string()).into(),
            );
        }

        let keys = pfx
            .key_bags(password)
            .map_err(|e| CertificateError::Decode(format!("failed to read key bag: {}", e)))?;
        let certs = pfx
            .cert_x509_bags(password)
            .map_err(|e| CertificateError::Decode(format!("failed to read certificate bag: {}", e)))?;

        if keys.len() > 1 || certs.len() > 1 {
            warn!(
                "Bundle holds {} keys and {} certificates, using the first of each",
                keys.len(),
                certs.len()
            );
        }

        let key_der = keys
            .into_iter()
            .find(|k| !k.is_empty())
            .ok_or(CertificateError::MissingKey)?;
        let certificate_der = certs
            .into_iter()
            .find(|c| !c.is_empty())
            .ok_or(CertificateError::MissingCertificate)?;

        let key = KeyMaterial::from_pkcs8_der(&key_der)?;
        Self::from_parts(key, certificate_der)
    }

    /// Build a bundle from an already decoded key and DER certificate
    pub fn from_parts(key: KeyMaterial, certificate_der: Vec<u8>) -> Result<Self> {
        if certificate_der.is_empty() {
            return Err(CertificateError::MissingCertificate.into());
        }

        let (_, cert) = X509Certificate::from_der(&certificate_der)
            .map_err(|e| CertificateError::Decode(format!("invalid certificate: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string();

        let mut emails = Vec::new();
        let mut dns_names = Vec::new();
        match cert.subject_alternative_name() {
            Ok(Some(san)) => {
                for name in &san.value.general_names {
                    match name {
                        GeneralName::RFC822Name(email) => emails.push(email.to_string()),
                        GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                        _ => {}
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Ignoring malformed subjectAltName extension: {}", e),
        }

        let upn = derive_upn(&common_name, &emails, &dns_names);
        drop(cert);

        Ok(Self {
            key,
            certificate_der,
            common_name,
            upn,
        })
    }

    pub fn key(&self) -> &KeyMaterial {
        &self.key
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    /// User principal name hint; empty when the certificate carries none
    pub fn upn(&self) -> &str {
        &self.upn
    }
}

/// Pick the UPN: first email SAN, then first DNS SAN, then an email-like CN
pub fn derive_upn(common_name: &str, emails: &[String], dns_names: &[String]) -> String {
    if let Some(email) = emails.first() {
        return email.clone();
    }
    if let Some(dns) = dns_names.first() {
        return dns.clone();
    }
    if common_name.contains('@') {
        return common_name.to_string();
    }
    String::new()
}
