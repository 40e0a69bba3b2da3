//! Background reconciliation scheduler
//!
//! Periodically runs a pass over every known cluster.

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controller::{ClusterOutcome, Controller};
use crate::error::CertmanResult;
use crate::topology::ClusterTopology;

/// Default pass interval (10 minutes)
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(600);

/// Minimum pass interval (30 seconds)
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Supplies the clusters to reconcile on each pass
#[async_trait]
pub trait TopologySource: Send + Sync + Debug {
    async fn topologies(&self) -> CertmanResult<Vec<ClusterTopology>>;
}

/// Fixed set of clusters
#[derive(Debug, Clone, Default)]
pub struct StaticTopologySource {
    topologies: Vec<ClusterTopology>,
}

impl StaticTopologySource {
    pub fn new(topologies: Vec<ClusterTopology>) -> Self {
        Self { topologies }
    }
}

#[async_trait]
impl TopologySource for StaticTopologySource {
    async fn topologies(&self) -> CertmanResult<Vec<ClusterTopology>> {
        Ok(self.topologies.clone())
    }
}

/// Summary of one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub clusters: usize,
    /// Clusters whose reconciliation failed outright
    pub failed_clusters: usize,
    /// Requests that failed within otherwise reconciled clusters
    pub failed_requests: usize,
}

/// Runs reconciliation passes at a fixed interval
///
/// Distinct clusters in one pass are processed concurrently. Failures are
/// logged and retried on the next tick.
#[derive(Debug)]
pub struct RenewalScheduler {
    controller: Arc<Controller>,
    source: Arc<dyn TopologySource>,
    check_interval: Duration,
}

impl RenewalScheduler {
    pub fn new(controller: Arc<Controller>, source: Arc<dyn TopologySource>) -> Self {
        Self {
            controller,
            source,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    /// Set the pass interval
    ///
    /// The interval is clamped to a minimum of 30 seconds.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval.max(MIN_CHECK_INTERVAL);
        self
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Run passes until `cancel` fires
    ///
    /// The first pass starts immediately.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            check_interval_secs = self.check_interval.as_secs(),
            "Starting certificate reconciliation scheduler"
        );

        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            debug!("Running scheduled reconciliation pass");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.run_pass(&cancel) => {}
            }
        }

        info!("Certificate reconciliation scheduler stopped");
    }

    /// One pass over every cluster
    pub async fn run_pass(&self, cancel: &CancellationToken) -> PassSummary {
        let start = Instant::now();
        let topologies = match self.source.topologies().await {
            Ok(topologies) => topologies,
            Err(e) => {
                error!(error = %e, "Failed to list clusters");
                return PassSummary::default();
            }
        };

        let mut seen = BTreeSet::new();
        let unique: Vec<ClusterTopology> = topologies
            .into_iter()
            .filter(|t| {
                let fresh = seen.insert((t.namespace.clone(), t.uid.clone()));
                if !fresh {
                    warn!(cluster = %t.name, "Cluster listed twice, processing once");
                }
                fresh
            })
            .collect();

        let results = join_all(
            unique
                .iter()
                .map(|topology| self.controller.process(topology, cancel)),
        )
        .await;

        let mut summary = PassSummary {
            clusters: unique.len(),
            ..Default::default()
        };
        for (topology, result) in unique.iter().zip(results) {
            match result {
                Ok(outcome) => {
                    let failed = outcome.failures().count();
                    if failed > 0 {
                        warn!(cluster = %topology.name, failed, "Some certificate requests failed");
                    }
                    if let ClusterOutcome::Reconciled { report, .. } = &outcome {
                        debug!(
                            cluster = %topology.name,
                            created = report.created.len(),
                            updated = report.updated.len(),
                            deleted = report.deleted.len(),
                            "Cluster reconciled"
                        );
                    }
                    summary.failed_requests += failed;
                }
                Err(e) => {
                    error!(
                        cluster = %topology.name,
                        error = %e,
                        retryable = e.is_retryable(),
                        "Cluster reconciliation failed"
                    );
                    summary.failed_clusters += 1;
                }
            }
        }

        info!(
            clusters = summary.clusters,
            failed_clusters = summary.failed_clusters,
            failed_requests = summary.failed_requests,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Reconciliation pass complete"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::dns::MemoryZone;
    use crate::acme::mock::{MockCa, MockCaOptions};
    use crate::acme::{
        AccountRegistry, CaEnvironment, CertificateIssuer, Dns01Challenger, IssuerSettings,
        PropagationPolicy,
    };
    use crate::certificate::tests::test_certificate;
    use crate::reconciler::Reconciler;
    use crate::renewal::RenewalEvaluator;
    use crate::store::{MemoryRecordStore, MemorySecretStore};
    use crate::topology::tests::topology;
    use certman_common::{NoopSink, OwnerId};

    fn controller(records: Arc<MemoryRecordStore>, ca: MockCa, zone: Arc<MemoryZone>) -> Controller {
        let secrets = Arc::new(MemorySecretStore::new());
        let sink = Arc::new(NoopSink);
        let issuer = CertificateIssuer::new(
            Arc::new(AccountRegistry::new(Arc::new(ca), secrets.clone(), "ops")),
            Dns01Challenger::new(zone.clone(), zone),
            secrets.clone(),
            sink.clone(),
            IssuerSettings {
                environment: CaEnvironment::Production,
                propagation: PropagationPolicy {
                    interval: Duration::from_secs(1),
                    timeout: Duration::from_secs(5),
                },
                timeout: Duration::from_secs(30),
            },
        );
        Controller::new(
            Reconciler::new(records, "sre@example.com"),
            RenewalEvaluator::new(secrets, sink, 45),
            Arc::new(issuer),
            None,
            "certman.io/managed",
        )
    }

    fn clusters() -> Vec<ClusterTopology> {
        let mut second = topology();
        second.name = "Prod-2".to_string();
        second.namespace = "uhc-prod-2".to_string();
        second.uid = OwnerId::from("uid-prod-2");
        second.cluster_name = "prod2".to_string();
        second.control_plane.additional.clear();
        second.ingress.clear();
        vec![topology(), second, topology()]
    }

    fn mock_ca(zone: &Arc<MemoryZone>) -> MockCa {
        let not_after = chrono::Utc::now().timestamp() + 86_400 * 80;
        MockCa::new(MockCaOptions {
            chain: vec![test_certificate(&[7], not_after).1],
            zone: Some(zone.clone()),
            ..Default::default()
        })
    }

    #[test]
    fn test_interval_is_clamped() {
        let records = Arc::new(MemoryRecordStore::new());
        let zone = Arc::new(MemoryZone::new());
        let scheduler = RenewalScheduler::new(
            Arc::new(controller(records, mock_ca(&zone), zone)),
            Arc::new(StaticTopologySource::default()),
        )
        .with_interval(Duration::from_secs(1));
        assert_eq!(scheduler.check_interval(), MIN_CHECK_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_covers_each_cluster_once() {
        let records = Arc::new(MemoryRecordStore::new());
        let zone = Arc::new(MemoryZone::new());
        let ca = mock_ca(&zone);
        let scheduler = RenewalScheduler::new(
            Arc::new(controller(records.clone(), ca.clone(), zone)),
            Arc::new(StaticTopologySource::new(clusters())),
        );

        let summary = scheduler.run_pass(&CancellationToken::new()).await;

        assert_eq!(summary.clusters, 2);
        assert_eq!(summary.failed_clusters, 0);
        assert_eq!(summary.failed_requests, 0);
        assert_eq!(records.all().len(), 2);
        assert_eq!(ca.state.lock().orders.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let records = Arc::new(MemoryRecordStore::new());
        let zone = Arc::new(MemoryZone::new());
        let ca = mock_ca(&zone);
        let scheduler = RenewalScheduler::new(
            Arc::new(controller(records, ca.clone(), zone)),
            Arc::new(StaticTopologySource::new(clusters())),
        )
        .with_interval(Duration::from_secs(60));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(cancel.clone()));

        // Two passes: at start and after one interval
        tokio::time::sleep(Duration::from_secs(90)).await;
        cancel.cancel();
        handle.await.unwrap();

        // Certificates from the first pass are still valid on the second
        assert_eq!(ca.state.lock().orders.len(), 2);
    }
}
