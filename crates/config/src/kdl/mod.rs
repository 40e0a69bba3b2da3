//! KDL configuration parsing
//!
//! Each top-level block maps onto one settings struct. Blocks and keys are
//! optional and start from the struct's defaults.

use std::net::IpAddr;

use anyhow::{anyhow, Result};
use tracing::trace;

use crate::{
    AcmeSettings, DnsSettings, OperatorConfig, OperatorSettings, PropagationSettings,
    ValidationSettings,
};

mod helpers;

use helpers::{
    get_block, get_bool_entry, get_i64_entry, get_string_args, get_string_entry, get_u64_entry,
};

/// Convert a parsed KDL document to an [`OperatorConfig`]
pub fn parse_document(doc: &kdl::KdlDocument) -> Result<OperatorConfig> {
    let mut config = OperatorConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "operator" => config.operator = parse_operator(node)?,
            "acme" => config.acme = parse_acme(node)?,
            "dns" => config.dns = parse_dns(node)?,
            "validation" => config.validation = parse_validation(node)?,
            other => {
                return Err(anyhow!(
                    "Unknown top-level configuration block: '{}'\n\
                     Valid blocks are: operator, acme, dns, validation",
                    other
                ));
            }
        }
    }

    Ok(config)
}

fn parse_operator(node: &kdl::KdlNode) -> Result<OperatorSettings> {
    trace!("Parsing operator block");
    let defaults = OperatorSettings::default();

    Ok(OperatorSettings {
        namespace: get_string_entry(node, "namespace")?.unwrap_or(defaults.namespace),
        default_notification_email: get_string_entry(node, "default-notification-email")?
            .unwrap_or(defaults.default_notification_email),
        renew_before_days: get_i64_entry(node, "renew-before-days")?
            .unwrap_or(defaults.renew_before_days),
        managed_label: get_string_entry(node, "managed-label")?.unwrap_or(defaults.managed_label),
        reconcile_interval_secs: get_u64_entry(node, "reconcile-interval-secs")?
            .unwrap_or(defaults.reconcile_interval_secs),
    })
}

fn parse_acme(node: &kdl::KdlNode) -> Result<AcmeSettings> {
    trace!("Parsing acme block");
    let defaults = AcmeSettings::default();

    Ok(AcmeSettings {
        staging: get_bool_entry(node, "staging")?.unwrap_or(defaults.staging),
        issuance_timeout_secs: get_u64_entry(node, "issuance-timeout-secs")?
            .unwrap_or(defaults.issuance_timeout_secs),
    })
}

fn parse_dns(node: &kdl::KdlNode) -> Result<DnsSettings> {
    trace!("Parsing dns block");
    let defaults = DnsSettings::default();

    let nameservers = match get_string_args(node, "nameservers")? {
        None => defaults.nameservers,
        Some(values) => values
            .iter()
            .map(|v| {
                v.parse::<IpAddr>()
                    .map_err(|_| anyhow!("Nameserver '{}' is not an IP address", v))
            })
            .collect::<Result<Vec<_>>>()?,
    };

    let propagation = match get_block(node, "propagation") {
        None => defaults.propagation,
        Some(block) => {
            let defaults = PropagationSettings::default();
            PropagationSettings {
                check_interval_secs: get_u64_entry(block, "check-interval-secs")?
                    .unwrap_or(defaults.check_interval_secs),
                timeout_secs: get_u64_entry(block, "timeout-secs")?
                    .unwrap_or(defaults.timeout_secs),
            }
        }
    };

    trace!(nameservers = nameservers.len(), "Parsed dns block");
    Ok(DnsSettings {
        nameservers,
        propagation,
    })
}

fn parse_validation(node: &kdl::KdlNode) -> Result<ValidationSettings> {
    trace!("Parsing validation block");
    let defaults = ValidationSettings::default();

    let port = match get_u64_entry(node, "port")? {
        None => defaults.port,
        Some(p) => u16::try_from(p).map_err(|_| anyhow!("validation.port {} is out of range", p))?,
    };

    Ok(ValidationSettings {
        enabled: get_bool_entry(node, "enabled")?.unwrap_or(defaults.enabled),
        port,
        dial_timeout_secs: get_u64_entry(node, "dial-timeout-secs")?
            .unwrap_or(defaults.dial_timeout_secs),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Result<OperatorConfig> {
        let doc: kdl::KdlDocument = src.parse()?;
        parse_document(&doc)
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(parse("").unwrap(), OperatorConfig::default());
    }

    #[test]
    fn test_unknown_block_rejected() {
        let err = parse("listeners { }").unwrap_err();
        assert!(err.to_string().contains("Unknown top-level configuration block"));
    }

    #[test]
    fn test_bad_nameserver_rejected() {
        let err = parse(r#"dns { nameservers "dns.google" }"#).unwrap_err();
        assert!(err.to_string().contains("not an IP address"));
    }

    #[test]
    fn test_port_out_of_range() {
        assert!(parse("validation { port 70000 }").is_err());
    }

    #[test]
    fn test_empty_nameservers_allowed() {
        let config = parse("dns { nameservers }").unwrap();
        assert!(config.dns.nameservers.is_empty());
    }
}
