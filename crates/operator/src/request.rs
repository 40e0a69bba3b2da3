//! Certificate-request records
//!
//! A request is the stored, desired form of one certificate: which domains it
//! covers, where the issued material goes and which credentials may write the
//! challenge records. The reconciler owns their lifecycle; the issuer only
//! reads them.

use serde::{Deserialize, Serialize};

use certman_common::{OwnerId, RequestName};

/// Reference to a namespaced object by name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Desired content of a certificate request
///
/// Compared structurally as a whole; any difference is a full replace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRequestSpec {
    /// Base domain the challenge records are written under
    pub acme_dns_domain: String,
    /// Domains on the certificate; the first is the common name
    pub dns_names: Vec<String>,
    /// Notification address registered with the CA
    pub email: String,
    /// Secret that receives the issued chain and key
    pub certificate_secret: ObjectRef,
    /// Credentials allowed to write DNS records for `acme_dns_domain`
    pub dns_credentials: ObjectRef,
    /// Renewal threshold in days; zero or negative means the configured default
    #[serde(default)]
    pub renew_before_days: i64,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub web_console_url: Option<String>,
}

impl CertificateRequestSpec {
    /// Domain used as the certificate's common name
    pub fn primary_domain(&self) -> Option<&str> {
        self.dns_names.first().map(String::as_str)
    }

    /// Threshold to use, falling back to `default_days` when unset
    pub fn renewal_threshold(&self, default_days: i64) -> i64 {
        if self.renew_before_days > 0 {
            self.renew_before_days
        } else {
            default_days
        }
    }
}

/// A stored certificate-request record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRequest {
    pub namespace: String,
    pub name: RequestName,
    /// Explicit parent link used for ownership filtering
    pub owner: OwnerId,
    pub spec: CertificateRequestSpec,
    /// Optimistic-concurrency token assigned by the store
    #[serde(default)]
    pub resource_version: u64,
}

impl CertificateRequest {
    pub fn new(
        namespace: impl Into<String>,
        name: RequestName,
        owner: OwnerId,
        spec: CertificateRequestSpec,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name,
            owner,
            spec,
            resource_version: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(days: i64) -> CertificateRequestSpec {
        CertificateRequestSpec {
            acme_dns_domain: "example.com".to_string(),
            dns_names: vec!["api.c1.example.com".to_string(), "*.apps.example.com".to_string()],
            email: "sre@example.com".to_string(),
            certificate_secret: ObjectRef::new("ns", "primary-cert"),
            dns_credentials: ObjectRef::new("ns", "aws-creds"),
            renew_before_days: days,
            api_url: None,
            web_console_url: None,
        }
    }

    #[test]
    fn test_renewal_threshold_defaults_when_unset() {
        assert_eq!(spec(0).renewal_threshold(45), 45);
        assert_eq!(spec(-3).renewal_threshold(45), 45);
        assert_eq!(spec(10).renewal_threshold(45), 10);
    }

    #[test]
    fn test_primary_domain_is_first() {
        assert_eq!(spec(0).primary_domain(), Some("api.c1.example.com"));
    }
}
