//! Per-cluster control flow
//!
//! Applies the cluster gates, converges the request records and then walks
//! every owned request through renewal evaluation, issuance when due, and an
//! optional drift check.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use certman_common::{ObservabilitySink, RequestName};
use certman_config::OperatorConfig;

use crate::acme::dns::HickoryTxtResolver;
use crate::acme::{
    AccountRegistry, CertificateIssuer, Dns01Challenger, DnsProvider, InstantAcmeProtocol,
    IssuanceOutcome, IssuerSettings,
};
use crate::error::{CertmanError, CertmanResult};
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::renewal::{RenewalDecision, RenewalEvaluator};
use crate::request::CertificateRequest;
use crate::store::{RecordStore, SecretStore};
use crate::topology::ClusterTopology;
use crate::validator::{CertificateValidator, DriftReport, RustlsFetcher};

/// Why a cluster was left alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotInstalled,
    NotManaged,
}

/// What happened to one request during a pass
#[derive(Debug)]
pub struct RequestOutcome {
    pub request: RequestName,
    pub decision: Option<RenewalDecision>,
    pub issued: Option<IssuanceOutcome>,
    pub drift: Option<DriftReport>,
    pub error: Option<CertmanError>,
}

/// What happened to one cluster during a pass
#[derive(Debug)]
pub enum ClusterOutcome {
    Skipped(SkipReason),
    Deleted(Vec<RequestName>),
    Reconciled {
        report: ReconcileReport,
        requests: Vec<RequestOutcome>,
    },
}

impl ClusterOutcome {
    /// Requests whose processing failed
    pub fn failures(&self) -> impl Iterator<Item = &RequestOutcome> {
        let requests = match self {
            ClusterOutcome::Reconciled { requests, .. } => requests.as_slice(),
            _ => &[][..],
        };
        requests.iter().filter(|r| r.error.is_some())
    }
}

/// Runs one cluster through gates, reconciliation, renewal and drift checks
#[derive(Debug, Clone)]
pub struct Controller {
    reconciler: Reconciler,
    evaluator: RenewalEvaluator,
    issuer: Arc<CertificateIssuer>,
    validator: Option<CertificateValidator>,
    managed_label: String,
}

impl Controller {
    pub fn new(
        reconciler: Reconciler,
        evaluator: RenewalEvaluator,
        issuer: Arc<CertificateIssuer>,
        validator: Option<CertificateValidator>,
        managed_label: impl Into<String>,
    ) -> Self {
        Self {
            reconciler,
            evaluator,
            issuer,
            validator,
            managed_label: managed_label.into(),
        }
    }

    /// Wire the production components from configuration
    ///
    /// Talks to Let's Encrypt, resolves challenge records through the
    /// configured nameservers and, when enabled, checks live endpoints.
    pub fn from_config(
        config: &OperatorConfig,
        provider: Arc<dyn DnsProvider>,
        secrets: Arc<dyn SecretStore>,
        records: Arc<dyn RecordStore>,
        sink: Arc<dyn ObservabilitySink>,
    ) -> CertmanResult<Self> {
        let resolver = Arc::new(HickoryTxtResolver::new(&config.dns.nameservers)?);
        let accounts = AccountRegistry::new(
            Arc::new(InstantAcmeProtocol::new()?),
            secrets.clone(),
            &config.operator.namespace,
        );
        let issuer = CertificateIssuer::new(
            Arc::new(accounts),
            Dns01Challenger::new(provider, resolver),
            secrets.clone(),
            sink.clone(),
            IssuerSettings::from(config),
        );

        let validator = if config.validation.enabled {
            Some(CertificateValidator::new(
                Arc::new(RustlsFetcher::new()?),
                secrets.clone(),
                config.validation.port,
                Duration::from_secs(config.validation.dial_timeout_secs),
            ))
        } else {
            None
        };

        Ok(Self::new(
            Reconciler::new(records, &config.operator.default_notification_email),
            RenewalEvaluator::new(secrets, sink, config.operator.renew_before_days),
            Arc::new(issuer),
            validator,
            &config.operator.managed_label,
        ))
    }

    /// Process one cluster
    ///
    /// Reconciliation errors abort the pass. Per-request failures are
    /// recorded in the outcome and the remaining requests still run.
    pub async fn process(
        &self,
        topology: &ClusterTopology,
        cancel: &CancellationToken,
    ) -> CertmanResult<ClusterOutcome> {
        if topology.deleting {
            let deleted = self.reconciler.delete_all(topology).await?;
            info!(
                cluster = %topology.name,
                deleted = deleted.len(),
                "Cluster is being deleted, removed its certificate requests"
            );
            return Ok(ClusterOutcome::Deleted(deleted));
        }
        if !topology.installed {
            debug!(cluster = %topology.name, "Cluster not installed yet, skipping");
            return Ok(ClusterOutcome::Skipped(SkipReason::NotInstalled));
        }
        if !topology.is_managed(&self.managed_label) {
            debug!(
                cluster = %topology.name,
                label = %self.managed_label,
                "Cluster not managed, skipping"
            );
            return Ok(ClusterOutcome::Skipped(SkipReason::NotManaged));
        }

        let report = self.reconciler.reconcile(topology).await?;
        let owned = self
            .reconciler
            .records()
            .list_owned(&topology.namespace, &topology.uid)
            .await?;

        let mut requests = Vec::with_capacity(owned.len());
        for request in &owned {
            if cancel.is_cancelled() {
                return Err(CertmanError::Cancelled);
            }
            requests.push(self.process_request(request, cancel).await);
        }

        Ok(ClusterOutcome::Reconciled { report, requests })
    }

    async fn process_request(
        &self,
        request: &CertificateRequest,
        cancel: &CancellationToken,
    ) -> RequestOutcome {
        let mut outcome = RequestOutcome {
            request: request.name.clone(),
            decision: None,
            issued: None,
            drift: None,
            error: None,
        };

        let decision = match self.evaluator.should_renew(request).await {
            Ok(decision) => decision,
            Err(e) => {
                error!(request = %request.name, error = %e, "Renewal evaluation failed");
                outcome.error = Some(e);
                return outcome;
            }
        };
        let renew = decision.renew;
        outcome.decision = Some(decision);

        if renew {
            match self.issuer.issue(request, cancel).await {
                Ok(issued) => outcome.issued = Some(issued),
                Err(e) => outcome.error = Some(e),
            }
            return outcome;
        }

        if let Some(validator) = &self.validator {
            match validator.check(request).await {
                Ok(report) => outcome.drift = Some(report),
                Err(e) => warn!(request = %request.name, error = %e, "Drift check failed"),
            }
        }

        outcome
    }
}
