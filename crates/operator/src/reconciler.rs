//! Certificate-request reconciliation
//!
//! Converges the stored requests owned by a cluster onto the set derived from
//! its topology. A pass is not transactional: writes applied before a failure
//! stay applied and the error is returned so the whole pass can be retried.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use certman_common::RequestName;

use crate::error::CertmanResult;
use crate::request::{CertificateRequest, CertificateRequestSpec, ObjectRef};
use crate::store::{RecordStore, StoreError};
use crate::topology::{derive_domains, ClusterTopology};

/// A bundle that produced no request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedBundle {
    pub bundle: String,
    pub reason: String,
}

/// Requests derived from one topology
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    pub requests: Vec<CertificateRequest>,
    pub skipped: Vec<SkippedBundle>,
}

/// What one pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: Vec<RequestName>,
    pub updated: Vec<RequestName>,
    pub deleted: Vec<RequestName>,
    pub unchanged: Vec<RequestName>,
    pub skipped: Vec<SkippedBundle>,
}

impl ReconcileReport {
    /// Number of store writes the pass performed
    pub fn writes(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}

/// Derive the desired requests for every generated bundle
///
/// Bundles with `generate = false` are ignored. Bundles that match no domain
/// rule, or whose name collides with an earlier bundle, are skipped and
/// reported.
pub fn desired_requests(topology: &ClusterTopology, default_email: &str) -> DesiredState {
    let mut state = DesiredState::default();
    let mut seen = BTreeSet::new();

    for bundle in topology.certificate_bundles.iter().filter(|b| b.generate) {
        let domains = derive_domains(&bundle.name, topology);
        if domains.is_empty() {
            warn!(
                cluster = %topology.name,
                bundle = %bundle.name,
                "Certificate bundle has no domains, skipping"
            );
            state.skipped.push(SkippedBundle {
                bundle: bundle.name.clone(),
                reason: "no domains assigned to bundle".to_string(),
            });
            continue;
        }

        let name = RequestName::for_bundle(&topology.name, &bundle.name);
        if !seen.insert(name.clone()) {
            warn!(
                cluster = %topology.name,
                bundle = %bundle.name,
                request = %name,
                "Certificate bundle collides with another bundle's request name, skipping"
            );
            state.skipped.push(SkippedBundle {
                bundle: bundle.name.clone(),
                reason: format!("request name '{}' already derived", name),
            });
            continue;
        }

        let spec = CertificateRequestSpec {
            acme_dns_domain: topology.base_domain.clone(),
            dns_names: domains,
            email: default_email.to_string(),
            certificate_secret: ObjectRef::new(&topology.namespace, &bundle.secret_name),
            dns_credentials: topology.dns_credentials.clone(),
            renew_before_days: bundle.renew_before_days,
            api_url: topology.api_url.clone(),
            web_console_url: topology.web_console_url.clone(),
        };
        state.requests.push(CertificateRequest::new(
            &topology.namespace,
            name,
            topology.uid.clone(),
            spec,
        ));
    }

    state
}

/// Name of the generated bundle that derives `request`
fn bundle_for(topology: &ClusterTopology, request: &RequestName) -> String {
    topology
        .certificate_bundles
        .iter()
        .find(|b| b.generate && RequestName::for_bundle(&topology.name, &b.name) == *request)
        .map(|b| b.name.clone())
        .unwrap_or_else(|| request.to_string())
}

/// Creates, updates and deletes certificate-request records
#[derive(Debug, Clone)]
pub struct Reconciler {
    records: Arc<dyn RecordStore>,
    default_email: String,
}

impl Reconciler {
    pub fn new(records: Arc<dyn RecordStore>, default_email: impl Into<String>) -> Self {
        Self {
            records,
            default_email: default_email.into(),
        }
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    /// Converge owned records onto the topology's desired state
    pub async fn reconcile(&self, topology: &ClusterTopology) -> CertmanResult<ReconcileReport> {
        let desired = desired_requests(topology, &self.default_email);
        let mut current: BTreeMap<RequestName, CertificateRequest> = self
            .records
            .list_owned(&topology.namespace, &topology.uid)
            .await?
            .into_iter()
            .map(|record| (record.name.clone(), record))
            .collect();

        let mut report = ReconcileReport {
            skipped: desired.skipped,
            ..Default::default()
        };

        for wanted in desired.requests {
            match current.remove(&wanted.name) {
                None => match self.records.create(wanted.clone()).await {
                    Ok(created) => {
                        info!(
                            request = %created.name,
                            domains = ?created.spec.dns_names,
                            "Created certificate request"
                        );
                        report.created.push(created.name);
                    }
                    Err(StoreError::AlreadyExists { .. }) => {
                        warn!(
                            cluster = %topology.name,
                            request = %wanted.name,
                            "Certificate request name is held by a record this cluster does not own, skipping"
                        );
                        report.skipped.push(SkippedBundle {
                            bundle: bundle_for(topology, &wanted.name),
                            reason: format!(
                                "request name '{}' is owned by another record",
                                wanted.name
                            ),
                        });
                    }
                    Err(e) => return Err(e.into()),
                },
                Some(existing) if existing.spec == wanted.spec => {
                    debug!(request = %existing.name, "Certificate request up to date");
                    report.unchanged.push(existing.name);
                }
                Some(existing) => {
                    let replacement = CertificateRequest {
                        spec: wanted.spec,
                        ..existing
                    };
                    let updated = self.records.update(replacement).await?;
                    info!(
                        request = %updated.name,
                        domains = ?updated.spec.dns_names,
                        "Updated certificate request"
                    );
                    report.updated.push(updated.name);
                }
            }
        }

        for (name, stale) in current {
            self.records.delete(&stale).await?;
            info!(request = %name, "Deleted certificate request");
            report.deleted.push(name);
        }

        Ok(report)
    }

    /// Delete every record owned by the topology
    pub async fn delete_all(&self, topology: &ClusterTopology) -> CertmanResult<Vec<RequestName>> {
        let owned = self
            .records
            .list_owned(&topology.namespace, &topology.uid)
            .await?;

        let mut deleted = Vec::with_capacity(owned.len());
        for record in owned {
            self.records.delete(&record).await?;
            info!(
                cluster = %topology.name,
                request = %record.name,
                "Deleted certificate request of deleted cluster"
            );
            deleted.push(record.name);
        }
        Ok(deleted)
    }
}
