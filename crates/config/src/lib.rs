//! Configuration for the certman operator
//!
//! Configuration is written in KDL. Every key is optional; anything left out
//! falls back to the defaults below, and [`OperatorConfig::default_embedded`]
//! yields a complete configuration with no file at all.
//!
//! ```kdl
//! operator {
//!     namespace "certman-operator"
//!     default-notification-email "sre@example.com"
//!     renew-before-days 45
//! }
//! acme {
//!     staging #true
//! }
//! dns {
//!     nameservers "8.8.8.8" "1.1.1.1"
//!     propagation {
//!         check-interval-secs 5
//!         timeout-secs 300
//!     }
//! }
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use validator::Validate;

pub mod kdl;
pub mod validate;

pub use validate::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};

/// Embedded default configuration
const DEFAULT_CONFIG: &str = include_str!("default.kdl");

/// Default number of days before expiry at which a certificate is renewed
pub const DEFAULT_RENEW_BEFORE_DAYS: i64 = 45;

/// Default label marking a cluster as managed by this operator
pub const DEFAULT_MANAGED_LABEL: &str = "certman.io/managed";

/// Top-level operator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct OperatorConfig {
    #[validate(nested)]
    pub operator: OperatorSettings,
    #[validate(nested)]
    pub acme: AcmeSettings,
    #[validate(nested)]
    pub dns: DnsSettings,
    #[validate(nested)]
    pub validation: ValidationSettings,
}

/// General operator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct OperatorSettings {
    /// Namespace holding operator-owned secrets (ACME accounts)
    #[validate(length(min = 1, max = 253))]
    pub namespace: String,
    /// Address used for CA expiry notifications on every request
    #[validate(email)]
    pub default_notification_email: String,
    /// Renewal threshold used when a request does not set its own
    #[validate(range(min = 1, max = 365))]
    pub renew_before_days: i64,
    /// Label that must be `"true"` on a cluster for it to be reconciled
    #[validate(length(min = 1))]
    pub managed_label: String,
    /// Interval between scheduled reconciliation passes
    #[validate(range(min = 1))]
    pub reconcile_interval_secs: u64,
}

/// Certificate authority settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct AcmeSettings {
    /// Use the staging CA endpoint instead of production
    pub staging: bool,
    /// Upper bound on one issuance workflow run
    #[validate(range(min = 1))]
    pub issuance_timeout_secs: u64,
}

/// DNS-01 settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct DnsSettings {
    /// Resolvers queried when confirming challenge propagation
    ///
    /// Empty means the system resolver configuration.
    pub nameservers: Vec<IpAddr>,
    #[validate(nested)]
    pub propagation: PropagationSettings,
}

/// Bounded polling of challenge-record propagation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct PropagationSettings {
    #[validate(range(min = 1))]
    pub check_interval_secs: u64,
    #[validate(range(min = 1))]
    pub timeout_secs: u64,
}

impl PropagationSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Live TLS drift checking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ValidationSettings {
    pub enabled: bool,
    #[validate(range(min = 1))]
    pub port: u16,
    #[validate(range(min = 1))]
    pub dial_timeout_secs: u64,
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self {
            namespace: "certman-operator".to_string(),
            default_notification_email: "certman@example.com".to_string(),
            renew_before_days: DEFAULT_RENEW_BEFORE_DAYS,
            managed_label: DEFAULT_MANAGED_LABEL.to_string(),
            reconcile_interval_secs: 600,
        }
    }
}

impl Default for AcmeSettings {
    fn default() -> Self {
        Self {
            staging: false,
            issuance_timeout_secs: 600,
        }
    }
}

impl Default for PropagationSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: 5,
            timeout_secs: 300,
        }
    }
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            nameservers: vec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), // Google DNS
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), // Cloudflare DNS
            ],
            propagation: PropagationSettings::default(),
        }
    }
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 443,
            dial_timeout_secs: 30,
        }
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            operator: OperatorSettings::default(),
            acme: AcmeSettings::default(),
            dns: DnsSettings::default(),
            validation: ValidationSettings::default(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from a KDL file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;

        let config = Self::from_kdl_str(&content)
            .with_context(|| format!("Failed to parse configuration file {}", path.display()))?;

        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse configuration from KDL text
    pub fn from_kdl_str(content: &str) -> Result<Self> {
        let document: ::kdl::KdlDocument = content
            .parse()
            .map_err(|e: ::kdl::KdlError| anyhow::anyhow!("{:?}", miette::Report::new(e)))?;
        let config = kdl::parse_document(&document)?;
        debug!(?config, "Parsed configuration");
        Ok(config)
    }

    /// The configuration compiled into the binary
    pub fn default_embedded() -> Result<Self> {
        Self::from_kdl_str(DEFAULT_CONFIG).context("Embedded default configuration is invalid")
    }

    /// Validate field constraints and cross-field rules
    ///
    /// Returns every problem found rather than stopping at the first.
    pub fn validate_all(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        if let Err(errors) = self.validate() {
            for (field, message) in validate::flatten_field_errors("", &errors) {
                result.add_error(ValidationError::new(
                    ErrorCategory::Field,
                    format!("{}: {}", field, message),
                ));
            }
        }

        result.merge(validate::semantics::check(self));
        result.merge(validate::lint::lint_config(self));
        result
    }

    /// Validate and fail on the first error set
    pub fn ensure_valid(&self) -> Result<()> {
        let result = self.validate_all();
        if result.has_errors() {
            let messages: Vec<String> = result.errors.iter().map(|e| e.to_string()).collect();
            anyhow::bail!("Invalid configuration:\n  {}", messages.join("\n  "));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_embedded_is_valid() {
        let config = OperatorConfig::default_embedded().unwrap();
        assert!(!config.validate_all().has_errors());
        assert_eq!(config, OperatorConfig::default());
    }

    #[test]
    fn test_from_kdl_overrides() {
        let config = OperatorConfig::from_kdl_str(
            r#"
            operator {
                namespace "certs"
                default-notification-email "ops@example.org"
                renew-before-days 20
            }
            acme {
                staging #true
                issuance-timeout-secs 900
            }
            dns {
                nameservers "9.9.9.9"
                propagation {
                    check-interval-secs 2
                    timeout-secs 60
                }
            }
            validation {
                enabled #false
                port 8443
            }
            "#,
        )
        .unwrap();

        assert_eq!(config.operator.namespace, "certs");
        assert_eq!(config.operator.default_notification_email, "ops@example.org");
        assert_eq!(config.operator.renew_before_days, 20);
        assert!(config.acme.staging);
        assert_eq!(config.acme.issuance_timeout_secs, 900);
        assert_eq!(
            config.dns.nameservers,
            vec![IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9))]
        );
        assert_eq!(config.dns.propagation.check_interval(), Duration::from_secs(2));
        assert!(!config.validation.enabled);
        assert_eq!(config.validation.port, 8443);
        // Untouched keys keep defaults
        assert_eq!(config.validation.dial_timeout_secs, 30);
        assert_eq!(config.operator.managed_label, DEFAULT_MANAGED_LABEL);
    }

    #[test]
    fn test_invalid_email_is_reported() {
        let config = OperatorConfig::from_kdl_str(
            r#"operator { default-notification-email "not-an-email" }"#,
        )
        .unwrap();

        let result = config.validate_all();
        assert!(result.has_errors());
        assert!(result
            .errors
            .iter()
            .any(|e| e.message.contains("default_notification_email")));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("certman.kdl");
        std::fs::write(&path, "acme { staging #true }").unwrap();

        let config = OperatorConfig::from_file(&path).unwrap();
        assert!(config.acme.staging);
    }

    #[test]
    fn test_from_file_missing() {
        let err = OperatorConfig::from_file("/nonexistent/certman.kdl").unwrap_err();
        assert!(err.to_string().contains("Failed to read configuration file"));
    }

    #[test]
    fn test_ensure_valid_rejects_short_issuance_timeout() {
        let mut config = OperatorConfig::default();
        config.acme.issuance_timeout_secs = 10;
        assert!(config.ensure_valid().is_err());
    }
}
