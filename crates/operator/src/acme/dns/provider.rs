//! DNS provider interface for DNS-01 challenges
//!
//! Providers only write and remove records. Whether a record is visible is
//! decided separately by resolving it, since a provider acknowledging a write
//! says nothing about global propagation.

use std::fmt::Debug;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::request::ObjectRef;

/// Result type for DNS provider operations
pub type DnsResult<T> = Result<T, DnsProviderError>;

/// Errors reported by DNS provider implementations
#[derive(Debug, Error)]
pub enum DnsProviderError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Failed to write TXT record '{record}': {message}")]
    RecordWrite { record: String, message: String },

    #[error("Zone not found for domain '{domain}'")]
    ZoneNotFound { domain: String },

    #[error("Failed to load credentials: {0}")]
    Credentials(String),

    #[error("API request failed: {0}")]
    ApiRequest(String),
}

/// Writes DNS-01 challenge records
#[async_trait]
pub trait DnsProvider: Send + Sync + Debug {
    /// Provider name used in logs
    fn name(&self) -> &'static str;

    /// Create or replace the TXT record `record_name` with `value`
    async fn put(&self, record_name: &str, value: &str, credentials: &ObjectRef) -> DnsResult<()>;

    /// Remove the TXT record; removing a missing record succeeds
    async fn remove(&self, record_name: &str, value: &str, credentials: &ObjectRef)
        -> DnsResult<()>;

    /// Confirm `credentials` may write records under `base_domain`
    async fn verify_write_access(
        &self,
        _base_domain: &str,
        _credentials: &ObjectRef,
    ) -> DnsResult<()> {
        Ok(())
    }
}

/// ACME challenge record label
pub const ACME_CHALLENGE_RECORD: &str = "_acme-challenge";

/// Strip a leading wildcard label
///
/// `*.example.com` and `example.com` share one challenge record.
pub fn normalize_domain(domain: &str) -> &str {
    domain.strip_prefix("*.").unwrap_or(domain)
}

/// Challenge record name for `domain`
pub fn challenge_record_fqdn(domain: &str) -> String {
    format!("{}.{}", ACME_CHALLENGE_RECORD, normalize_domain(domain))
}

/// DNS-01 record value: base64url (no padding) of SHA-256(key authorization)
pub fn dns01_value(key_authorization: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(key_authorization.as_bytes()))
}
