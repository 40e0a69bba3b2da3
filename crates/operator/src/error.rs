//! Certman error types

use std::time::Duration;

use thiserror::Error;

use crate::acme::dns::DnsProviderError;
use crate::store::{StoreError, SECRET_KIND};

/// Result alias used across the operator library
pub type CertmanResult<T> = Result<T, CertmanError>;

/// Errors surfaced by the certificate lifecycle engine
///
/// Nothing is retried internally except the DNS propagation poll and the
/// per-domain drift loop; everything else propagates to the caller of the
/// reconcile or issue entry point, which retries the whole operation later.
#[derive(Debug, Error)]
pub enum CertmanError {
    /// The input cannot produce a certificate as configured
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A call to the certificate authority failed
    #[error("ACME protocol error: {0}")]
    Protocol(String),

    /// The challenge record was not observed in DNS in time
    #[error("DNS verification timeout for record '{record}' after {elapsed:?}")]
    DnsVerificationTimeout { record: String, elapsed: Duration },

    /// Stored or generated material could not be parsed or built
    #[error("Parse error: {0}")]
    Parse(String),

    /// A referenced secret does not exist
    #[error("Secret '{namespace}/{name}' not found")]
    SecretNotFound { namespace: String, name: String },

    /// TLS dial or handshake failure
    #[error("Network error for '{host}': {message}")]
    Network { host: String, message: String },

    /// Concurrent modification detected by a store
    #[error("Concurrent modification of {kind} '{name}'")]
    StoreConflict { kind: &'static str, name: String },

    /// DNS provider operation failed
    #[error("DNS provider error: {0}")]
    DnsProvider(#[from] DnsProviderError),

    /// Any other store failure
    #[error("Store error: {0}")]
    Store(StoreError),

    /// The overall issuance deadline passed
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Work was cancelled before completion
    #[error("Operation cancelled")]
    Cancelled,
}

impl CertmanError {
    /// Whether retrying the whole pass later can succeed without a config change
    pub fn is_retryable(&self) -> bool {
        match self {
            CertmanError::StoreConflict { .. }
            | CertmanError::DnsVerificationTimeout { .. }
            | CertmanError::Network { .. }
            | CertmanError::Protocol(_)
            | CertmanError::Timeout(_)
            | CertmanError::DnsProvider(_)
            | CertmanError::Store(_) => true,
            CertmanError::Configuration(_)
            | CertmanError::Parse(_)
            | CertmanError::SecretNotFound { .. }
            | CertmanError::Cancelled => false,
        }
    }
}

impl From<StoreError> for CertmanError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { kind, name } | StoreError::AlreadyExists { kind, name } => {
                CertmanError::StoreConflict { kind, name }
            }
            StoreError::NotFound {
                kind,
                namespace,
                name,
            } if kind == SECRET_KIND => CertmanError::SecretNotFound { namespace, name },
            other => CertmanError::Store(other),
        }
    }
}
