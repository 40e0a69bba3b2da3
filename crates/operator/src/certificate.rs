//! Certificate material and X.509 inspection
//!
//! A certificate secret holds exactly two well-known fields: the full chain
//! and the private key. A secret missing either one is treated as absent.

use chrono::{DateTime, Utc};
use pem::Pem;
use tracing::debug;
use x509_parser::parse_x509_certificate;

use certman_common::RequestName;

use crate::error::{CertmanError, CertmanResult};
use crate::store::Secret;

/// Secret field holding the PEM full chain
pub const TLS_CERT_FIELD: &str = "tls.crt";

/// Secret field holding the PEM private key
pub const TLS_KEY_FIELD: &str = "tls.key";

/// Label naming the request that produced a secret
pub const REQUEST_LABEL: &str = "certificate_request";

/// Issued chain plus private key, always handled together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateMaterial {
    pub full_chain_pem: String,
    pub private_key_pem: String,
}

impl CertificateMaterial {
    /// Build from a DER chain (leaf first) and a PEM private key
    ///
    /// The full chain is the leaf followed by its issuing intermediate.
    pub fn from_chain(chain_der: &[Vec<u8>], private_key_pem: String) -> CertmanResult<Self> {
        let Some(leaf) = chain_der.first() else {
            return Err(CertmanError::Protocol(
                "certificate authority returned an empty chain".to_string(),
            ));
        };

        let mut full_chain_pem = pem::encode(&Pem::new("CERTIFICATE", leaf.clone()));
        if let Some(intermediate) = chain_der.get(1) {
            full_chain_pem.push_str(&pem::encode(&Pem::new("CERTIFICATE", intermediate.clone())));
        }
        if chain_der.len() > 2 {
            debug!(
                dropped = chain_der.len() - 2,
                "Keeping leaf and first intermediate only"
            );
        }

        Ok(Self {
            full_chain_pem,
            private_key_pem,
        })
    }

    /// Read both fields from a secret; `None` unless both are non-empty
    pub fn from_secret(secret: &Secret) -> Option<Self> {
        let chain = secret.data.get(TLS_CERT_FIELD).filter(|v| !v.trim().is_empty())?;
        let key = secret.data.get(TLS_KEY_FIELD).filter(|v| !v.trim().is_empty())?;
        Some(Self {
            full_chain_pem: chain.clone(),
            private_key_pem: key.clone(),
        })
    }

    /// Write both fields and the request label onto `secret`
    ///
    /// Other data keys and labels on the secret are preserved.
    pub fn apply_to(self, secret: &mut Secret, request: &RequestName) {
        secret
            .data
            .insert(TLS_CERT_FIELD.to_string(), self.full_chain_pem);
        secret
            .data
            .insert(TLS_KEY_FIELD.to_string(), self.private_key_pem);
        secret
            .labels
            .insert(REQUEST_LABEL.to_string(), request.to_string());
    }

    /// Parse the leaf of the stored chain
    pub fn leaf(&self) -> CertmanResult<LeafCertificate> {
        LeafCertificate::from_pem(&self.full_chain_pem)
    }
}

/// The fields of a leaf certificate this operator compares
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafCertificate {
    /// Serial number as lower-case hex of its raw bytes
    pub serial: String,
    pub not_after: DateTime<Utc>,
}

impl LeafCertificate {
    /// Parse the first CERTIFICATE block of a PEM document
    pub fn from_pem(pem_text: &str) -> CertmanResult<Self> {
        let blocks = pem::parse_many(pem_text)
            .map_err(|e| CertmanError::Parse(format!("invalid PEM: {}", e)))?;
        let leaf = blocks
            .iter()
            .find(|block| block.tag() == "CERTIFICATE")
            .ok_or_else(|| CertmanError::Parse("no CERTIFICATE block in PEM".to_string()))?;
        Self::from_der(leaf.contents())
    }

    /// Parse a DER-encoded certificate
    pub fn from_der(der: &[u8]) -> CertmanResult<Self> {
        let (_, cert) = parse_x509_certificate(der)
            .map_err(|e| CertmanError::Parse(format!("invalid X.509 certificate: {}", e)))?;

        let timestamp = cert.validity().not_after.timestamp();
        let not_after = DateTime::<Utc>::from_timestamp(timestamp, 0).ok_or_else(|| {
            CertmanError::Parse(format!("notAfter {} out of range", timestamp))
        })?;

        Ok(Self {
            serial: hex::encode(cert.tbs_certificate.raw_serial()),
            not_after,
        })
    }
}
