//! Cluster topology and domain derivation
//!
//! A [`ClusterTopology`] is the read-only description of one provisioned
//! cluster. [`derive_domains`] projects it onto the domain list of a single
//! certificate bundle; it never touches the network or a store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use certman_common::OwnerId;

use crate::request::ObjectRef;

/// A named group of domains sharing one certificate and secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateBundle {
    pub name: String,
    /// Whether this operator should issue the certificate
    #[serde(default)]
    pub generate: bool,
    /// Secret (in the cluster namespace) receiving the issued material
    pub secret_name: String,
    /// Renewal threshold override; zero or negative means the default
    #[serde(default)]
    pub renew_before_days: i64,
}

/// An extra control-plane serving certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalCertificate {
    /// Bundle that serves this domain
    pub name: String,
    pub domain: String,
}

/// Control-plane serving-certificate assignments
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPlaneCertificates {
    /// Bundle serving `api.<cluster>.<base domain>`
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub additional: Vec<AdditionalCertificate>,
}

/// An ingress entry and the bundle serving it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressEntry {
    pub name: String,
    pub domain: String,
    pub serving_certificate: String,
}

/// Read-only description of one cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTopology {
    pub namespace: String,
    /// Resource name; request names derive from it
    pub name: String,
    /// Owner identity stamped on every request created for this cluster
    pub uid: OwnerId,
    /// Cluster name used in the API domain
    pub cluster_name: String,
    pub base_domain: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub installed: bool,
    /// Set once the cluster has been marked for deletion
    #[serde(default)]
    pub deleting: bool,
    #[serde(default)]
    pub certificate_bundles: Vec<CertificateBundle>,
    #[serde(default)]
    pub control_plane: ControlPlaneCertificates,
    #[serde(default)]
    pub ingress: Vec<IngressEntry>,
    /// Credentials allowed to write records under `base_domain`
    pub dns_credentials: ObjectRef,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub web_console_url: Option<String>,
}

impl ClusterTopology {
    /// Whether the cluster carries `label` with the value `"true"`
    pub fn is_managed(&self, label: &str) -> bool {
        self.labels.get(label).map(String::as_str) == Some("true")
    }
}

/// Ordered domain list for `bundle`
///
/// Rules are applied in order and accumulate:
/// 1. the default control-plane bundle gets `api.<cluster>.<base domain>`
/// 2. each additional control-plane entry naming the bundle adds its domain
/// 3. each ingress entry served by the bundle adds `*.<domain>`
pub fn derive_domains(bundle: &str, topology: &ClusterTopology) -> Vec<String> {
    let mut domains = Vec::new();

    if topology.control_plane.default.as_deref() == Some(bundle) {
        domains.push(format!(
            "api.{}.{}",
            topology.cluster_name, topology.base_domain
        ));
    }

    domains.extend(
        topology
            .control_plane
            .additional
            .iter()
            .filter(|cert| cert.name == bundle)
            .map(|cert| cert.domain.clone()),
    );

    domains.extend(
        topology
            .ingress
            .iter()
            .filter(|ingress| ingress.serving_certificate == bundle)
            .map(|ingress| wildcard(&ingress.domain)),
    );

    domains
}

fn wildcard(domain: &str) -> String {
    if domain.starts_with("*.") {
        domain.to_string()
    } else {
        format!("*.{}", domain)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;

    pub(crate) fn topology() -> ClusterTopology {
        ClusterTopology {
            namespace: "uhc-prod-1".to_string(),
            name: "Prod-1".to_string(),
            uid: OwnerId::from("uid-prod-1"),
            cluster_name: "prod1".to_string(),
            base_domain: "example.com".to_string(),
            labels: BTreeMap::from([("certman.io/managed".to_string(), "true".to_string())]),
            installed: true,
            deleting: false,
            certificate_bundles: vec![
                CertificateBundle {
                    name: "primary".to_string(),
                    generate: true,
                    secret_name: "primary-cert".to_string(),
                    renew_before_days: 0,
                },
                CertificateBundle {
                    name: "external".to_string(),
                    generate: false,
                    secret_name: "external-cert".to_string(),
                    renew_before_days: 0,
                },
            ],
            control_plane: ControlPlaneCertificates {
                default: Some("primary".to_string()),
                additional: vec![AdditionalCertificate {
                    name: "primary".to_string(),
                    domain: "rh-api.prod1.example.com".to_string(),
                }],
            },
            ingress: vec![
                IngressEntry {
                    name: "default".to_string(),
                    domain: "apps.prod1.example.com".to_string(),
                    serving_certificate: "primary".to_string(),
                },
                IngressEntry {
                    name: "internal".to_string(),
                    domain: "*.int.prod1.example.com".to_string(),
                    serving_certificate: "primary".to_string(),
                },
            ],
            dns_credentials: ObjectRef::new("uhc-prod-1", "aws-creds"),
            api_url: Some("https://api.prod1.example.com:6443".to_string()),
            web_console_url: None,
        }
    }

    #[test]
    fn test_rules_accumulate_in_order() {
        let domains = derive_domains("primary", &topology());
        assert_eq!(
            domains,
            vec![
                "api.prod1.example.com",
                "rh-api.prod1.example.com",
                "*.apps.prod1.example.com",
                "*.int.prod1.example.com",
            ]
        );
    }

    #[test]
    fn test_unmatched_bundle_is_empty() {
        assert!(derive_domains("external", &topology()).is_empty());
    }

    #[test]
    fn test_wildcard_rule() {
        assert_eq!(wildcard("apps.example.com"), "*.apps.example.com");
        assert_eq!(wildcard("*.apps.example.com"), "*.apps.example.com");
    }

    #[test]
    fn test_managed_label() {
        let mut topology = topology();
        assert!(topology.is_managed("certman.io/managed"));
        topology
            .labels
            .insert("certman.io/managed".to_string(), "false".to_string());
        assert!(!topology.is_managed("certman.io/managed"));
        assert!(!topology.is_managed("other"));
    }

    proptest! {
        #[test]
        fn derive_domains_is_deterministic(
            cluster in "[a-z0-9]{1,12}",
            base in "[a-z]{1,10}\\.[a-z]{2,3}",
            ingress in proptest::collection::vec("(\\*\\.)?[a-z]{1,8}\\.[a-z]{2,3}", 0..4),
        ) {
            let mut t = topology();
            t.cluster_name = cluster;
            t.base_domain = base;
            t.ingress = ingress
                .into_iter()
                .enumerate()
                .map(|(i, domain)| IngressEntry {
                    name: format!("ingress-{}", i),
                    domain,
                    serving_certificate: "primary".to_string(),
                })
                .collect();

            let first = derive_domains("primary", &t);
            let second = derive_domains("primary", &t);
            prop_assert_eq!(&first, &second);
            for domain in first.iter().skip(2) {
                prop_assert!(domain.starts_with("*."));
                prop_assert!(!domain.starts_with("*.*."));
            }
        }
    }
}
