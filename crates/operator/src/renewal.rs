//! Renewal decision policy
//!
//! A certificate is renewed when it has never been issued, when the stored
//! material cannot be read, or when it has `threshold` or fewer whole days
//! left. Every evaluation emits a days-remaining observation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use certman_common::{Observation, ObservabilitySink};

use crate::certificate::CertificateMaterial;
use crate::error::CertmanResult;
use crate::request::CertificateRequest;
use crate::store::SecretStore;

/// Days-remaining value reported when it could not be computed
pub const DAYS_UNKNOWN: i64 = -1;

/// Why a decision was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalReason {
    /// No secret, or a secret missing one of its fields
    NotIssued,
    /// The stored chain does not parse
    Unreadable,
    /// Inside the renewal window (or already expired)
    Expiring,
    /// Outside the renewal window
    Valid,
}

/// Outcome of one evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalDecision {
    pub renew: bool,
    pub reason: RenewalReason,
    pub days_remaining: Option<i64>,
    pub threshold: i64,
}

/// Whole days from `now` until `not_after`, floored
///
/// Negative once the certificate has expired.
pub fn days_remaining(not_after: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (not_after - now).num_seconds().div_euclid(86_400)
}

/// Decides whether a request's certificate must be (re)issued
#[derive(Debug, Clone)]
pub struct RenewalEvaluator {
    secrets: Arc<dyn SecretStore>,
    sink: Arc<dyn ObservabilitySink>,
    default_threshold: i64,
}

impl RenewalEvaluator {
    pub fn new(
        secrets: Arc<dyn SecretStore>,
        sink: Arc<dyn ObservabilitySink>,
        default_threshold: i64,
    ) -> Self {
        Self {
            secrets,
            sink,
            default_threshold,
        }
    }

    /// Evaluate against the current time
    pub async fn should_renew(&self, request: &CertificateRequest) -> CertmanResult<RenewalDecision> {
        self.should_renew_at(request, Utc::now()).await
    }

    /// Evaluate as of `now`
    pub async fn should_renew_at(
        &self,
        request: &CertificateRequest,
        now: DateTime<Utc>,
    ) -> CertmanResult<RenewalDecision> {
        let threshold = request.spec.renewal_threshold(self.default_threshold);
        let secret_ref = &request.spec.certificate_secret;

        let lookup = self
            .secrets
            .find(&secret_ref.namespace, &secret_ref.name)
            .await;

        let secret = match lookup {
            Ok(secret) => secret,
            Err(e) => {
                self.emit(request, DAYS_UNKNOWN);
                return Err(e.into());
            }
        };

        let decision = match secret.as_ref().and_then(CertificateMaterial::from_secret) {
            None => {
                info!(
                    request = %request.name,
                    secret = %secret_ref,
                    "No certificate issued yet"
                );
                RenewalDecision {
                    renew: true,
                    reason: RenewalReason::NotIssued,
                    days_remaining: None,
                    threshold,
                }
            }
            Some(material) => match material.leaf() {
                Err(e) => {
                    warn!(
                        request = %request.name,
                        secret = %secret_ref,
                        error = %e,
                        "Stored certificate is unreadable, reissuing"
                    );
                    RenewalDecision {
                        renew: true,
                        reason: RenewalReason::Unreadable,
                        days_remaining: None,
                        threshold,
                    }
                }
                Ok(leaf) => {
                    let days = days_remaining(leaf.not_after, now);
                    let renew = days <= threshold;
                    debug!(
                        request = %request.name,
                        days_remaining = days,
                        threshold,
                        renew,
                        "Evaluated certificate expiry"
                    );
                    RenewalDecision {
                        renew,
                        reason: if renew {
                            RenewalReason::Expiring
                        } else {
                            RenewalReason::Valid
                        },
                        days_remaining: Some(days),
                        threshold,
                    }
                }
            },
        };

        self.emit(request, decision.days_remaining.unwrap_or(DAYS_UNKNOWN));
        Ok(decision)
    }

    fn emit(&self, request: &CertificateRequest, days: i64) {
        self.sink.record(Observation::DaysRemaining {
            request: request.name.to_string(),
            base_domain: request.spec.acme_dns_domain.clone(),
            days,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::tests::test_certificate;
    use crate::certificate::{TLS_CERT_FIELD, TLS_KEY_FIELD};
    use crate::request::{CertificateRequestSpec, ObjectRef};
    use crate::store::{MemorySecretStore, Secret};
    use certman_common::{OwnerId, RecordingSink, RequestName};
    use chrono::Duration;

    fn request(renew_before_days: i64) -> CertificateRequest {
        CertificateRequest::new(
            "ns",
            RequestName::from_string("c1-primary"),
            OwnerId::from("uid"),
            CertificateRequestSpec {
                acme_dns_domain: "example.com".to_string(),
                dns_names: vec!["api.c1.example.com".to_string()],
                email: "sre@example.com".to_string(),
                certificate_secret: ObjectRef::new("ns", "primary-cert"),
                dns_credentials: ObjectRef::new("ns", "creds"),
                renew_before_days,
                api_url: None,
                web_console_url: None,
            },
        )
    }

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_800_000_000, 0).unwrap()
    }

    async fn store_with_expiry(not_after: DateTime<Utc>) -> Arc<MemorySecretStore> {
        let store = Arc::new(MemorySecretStore::new());
        let (pem_text, _) = test_certificate(&[7], not_after.timestamp());
        let mut secret = Secret::new("ns", "primary-cert");
        secret.data.insert(TLS_CERT_FIELD.to_string(), pem_text);
        secret.data.insert(TLS_KEY_FIELD.to_string(), "key".to_string());
        store.create(secret).await.unwrap();
        store
    }

    fn evaluator(store: Arc<MemorySecretStore>, sink: Arc<RecordingSink>) -> RenewalEvaluator {
        RenewalEvaluator::new(store, sink, 45)
    }

    #[test]
    fn test_days_remaining_floors() {
        let now = now();
        assert_eq!(days_remaining(now + Duration::days(3), now), 3);
        assert_eq!(days_remaining(now + Duration::days(3) - Duration::seconds(1), now), 2);
        assert_eq!(days_remaining(now - Duration::seconds(1), now), -1);
        assert_eq!(days_remaining(now - Duration::days(2), now), -2);
    }

    #[tokio::test]
    async fn test_boundary_exactly_threshold_renews() {
        let sink = Arc::new(RecordingSink::new());
        let store = store_with_expiry(now() + Duration::days(30)).await;
        let decision = evaluator(store, sink.clone())
            .should_renew_at(&request(30), now())
            .await
            .unwrap();

        assert!(decision.renew);
        assert_eq!(decision.days_remaining, Some(30));
        assert_eq!(sink.days_remaining_for("c1-primary"), vec![30]);
    }

    #[tokio::test]
    async fn test_boundary_one_past_threshold_keeps() {
        let sink = Arc::new(RecordingSink::new());
        let store = store_with_expiry(now() + Duration::days(31)).await;
        let decision = evaluator(store, sink)
            .should_renew_at(&request(30), now())
            .await
            .unwrap();

        assert!(!decision.renew);
        assert_eq!(decision.reason, RenewalReason::Valid);
    }

    #[tokio::test]
    async fn test_missing_secret_always_renews() {
        for threshold in [-5, 0, 1, 1000] {
            let sink = Arc::new(RecordingSink::new());
            let store = Arc::new(MemorySecretStore::new());
            let decision = evaluator(store, sink.clone())
                .should_renew_at(&request(threshold), now())
                .await
                .unwrap();

            assert!(decision.renew);
            assert_eq!(decision.reason, RenewalReason::NotIssued);
            assert_eq!(sink.days_remaining_for("c1-primary"), vec![DAYS_UNKNOWN]);
        }
    }

    #[tokio::test]
    async fn test_expired_renews_with_non_positive_threshold() {
        let sink = Arc::new(RecordingSink::new());
        let store = store_with_expiry(now() - Duration::days(3)).await;
        let evaluator = evaluator(store, sink);

        // Non-positive thresholds fall back to the default; an expired
        // certificate is always inside the window.
        for threshold in [0, -10] {
            let decision = evaluator
                .should_renew_at(&request(threshold), now())
                .await
                .unwrap();
            assert!(decision.renew);
            assert_eq!(decision.days_remaining, Some(-3));
            assert_eq!(decision.threshold, 45);
        }
    }

    #[tokio::test]
    async fn test_unparsable_certificate_renews() {
        let sink = Arc::new(RecordingSink::new());
        let store = Arc::new(MemorySecretStore::new());
        let mut secret = Secret::new("ns", "primary-cert");
        secret
            .data
            .insert(TLS_CERT_FIELD.to_string(), "garbage".to_string());
        secret.data.insert(TLS_KEY_FIELD.to_string(), "key".to_string());
        store.create(secret).await.unwrap();

        let decision = evaluator(store, sink.clone())
            .should_renew_at(&request(30), now())
            .await
            .unwrap();
        assert!(decision.renew);
        assert_eq!(decision.reason, RenewalReason::Unreadable);
        assert_eq!(sink.days_remaining_for("c1-primary"), vec![DAYS_UNKNOWN]);
    }
}
