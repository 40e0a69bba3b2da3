//! Cross-field rules that single-field constraints cannot express

use super::{ErrorCategory, ValidationError, ValidationResult};
use crate::OperatorConfig;

/// Check relationships between configuration values
pub fn check(config: &OperatorConfig) -> ValidationResult {
    let mut result = ValidationResult::new();
    let propagation = &config.dns.propagation;

    if propagation.timeout_secs < propagation.check_interval_secs {
        result.add_error(ValidationError::new(
            ErrorCategory::Timing,
            format!(
                "dns.propagation timeout ({}s) is shorter than its check interval ({}s)",
                propagation.timeout_secs, propagation.check_interval_secs
            ),
        ));
    }

    if config.acme.issuance_timeout_secs < propagation.timeout_secs {
        result.add_error(ValidationError::new(
            ErrorCategory::Timing,
            format!(
                "acme issuance timeout ({}s) cannot cover a full propagation wait ({}s)",
                config.acme.issuance_timeout_secs, propagation.timeout_secs
            ),
        ));
    }

    for ip in &config.dns.nameservers {
        if ip.is_unspecified() {
            result.add_error(ValidationError::new(
                ErrorCategory::Dns,
                format!("Nameserver '{}' is not a usable address", ip),
            ));
        }
    }

    if config.validation.enabled && config.validation.port == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Validation,
            "Drift checking is enabled but the port is 0",
        ));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_defaults_pass() {
        assert!(!check(&OperatorConfig::default()).has_errors());
    }

    #[test]
    fn test_timeout_shorter_than_interval() {
        let mut config = OperatorConfig::default();
        config.dns.propagation.check_interval_secs = 30;
        config.dns.propagation.timeout_secs = 10;

        let result = check(&config);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].category, ErrorCategory::Timing);
    }

    #[test]
    fn test_unspecified_nameserver() {
        let mut config = OperatorConfig::default();
        config.dns.nameservers = vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)];

        let result = check(&config);
        assert!(result.errors.iter().any(|e| e.category == ErrorCategory::Dns));
    }
}
