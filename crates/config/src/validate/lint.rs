//! Configuration linting
//!
//! Flags settings that are legal but unusual for a production deployment.

use super::{ValidationResult, ValidationWarning};
use crate::OperatorConfig;

/// Certificates from the public CA are valid for 90 days
const CA_CERTIFICATE_LIFETIME_DAYS: i64 = 90;

/// Lint configuration for likely mistakes
pub fn lint_config(config: &OperatorConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    if config.acme.staging {
        result.add_warning(ValidationWarning::new(
            "ACME staging is enabled; issued certificates will not be publicly trusted",
        ));
    }

    if config.operator.renew_before_days >= CA_CERTIFICATE_LIFETIME_DAYS {
        result.add_warning(ValidationWarning::new(format!(
            "renew-before-days {} is not below the {}-day certificate lifetime; every pass will reissue",
            config.operator.renew_before_days, CA_CERTIFICATE_LIFETIME_DAYS
        )));
    }

    if config.dns.nameservers.is_empty() {
        result.add_warning(ValidationWarning::new(
            "No nameservers configured; propagation checks use the system resolver and may see cached answers",
        ));
    }

    if !config.validation.enabled {
        result.add_warning(ValidationWarning::new(
            "Drift checking is disabled; served certificates are never compared with stored ones",
        ));
    }

    result
}
