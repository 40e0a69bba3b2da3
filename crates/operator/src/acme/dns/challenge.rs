//! DNS-01 challenge handling
//!
//! Publishes the challenge record through the provider, then confirms it
//! independently by resolving it. The CA is only asked to validate after the
//! record has been observed with the exact expected value.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::propagation::{wait_for_record, PropagationOutcome, PropagationPolicy, TxtResolver};
use super::provider::{challenge_record_fqdn, DnsProvider};
use crate::error::CertmanResult;
use crate::request::ObjectRef;

/// A challenge record written during one issuance attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRecord {
    pub domain: String,
    pub record_name: String,
    pub value: String,
}

impl ChallengeRecord {
    pub fn new(domain: &str, value: &str) -> Self {
        Self {
            domain: domain.to_string(),
            record_name: challenge_record_fqdn(domain),
            value: value.to_string(),
        }
    }
}

/// Publishes and verifies DNS-01 challenge records
#[derive(Debug, Clone)]
pub struct Dns01Challenger {
    provider: Arc<dyn DnsProvider>,
    resolver: Arc<dyn TxtResolver>,
}

impl Dns01Challenger {
    pub fn new(provider: Arc<dyn DnsProvider>, resolver: Arc<dyn TxtResolver>) -> Self {
        Self { provider, resolver }
    }

    pub fn provider(&self) -> &Arc<dyn DnsProvider> {
        &self.provider
    }

    /// Write the challenge record
    pub async fn publish(
        &self,
        record: &ChallengeRecord,
        credentials: &ObjectRef,
    ) -> CertmanResult<()> {
        info!(
            domain = %record.domain,
            record = %record.record_name,
            provider = self.provider.name(),
            "Publishing DNS-01 challenge record"
        );
        self.provider
            .put(&record.record_name, &record.value, credentials)
            .await?;
        Ok(())
    }

    /// Wait until the record resolves to its value
    pub async fn verify(
        &self,
        record: &ChallengeRecord,
        policy: PropagationPolicy,
        cancel: &CancellationToken,
    ) -> CertmanResult<PropagationOutcome> {
        wait_for_record(
            self.resolver.as_ref(),
            &record.record_name,
            &record.value,
            policy,
            cancel,
        )
        .await
    }

    /// Remove every record, logging failures
    pub async fn cleanup(&self, records: &[ChallengeRecord], credentials: &ObjectRef) {
        for record in records {
            match self
                .provider
                .remove(&record.record_name, &record.value, credentials)
                .await
            {
                Ok(()) => debug!(record = %record.record_name, "Removed challenge record"),
                Err(e) => warn!(
                    record = %record.record_name,
                    error = %e,
                    "Failed to remove challenge record"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::dns::memory::MemoryZone;
    use crate::acme::dns::propagation::tests::ScriptedResolver;
    use crate::error::CertmanError;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn creds() -> ObjectRef {
        ObjectRef::new("ns", "aws-creds")
    }

    fn policy() -> PropagationPolicy {
        PropagationPolicy {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(60),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wildcard_record_published_and_verified() {
        let zone = Arc::new(MemoryZone::new());
        let resolver = Arc::new(ScriptedResolver::new(3, "digest"));
        let challenger = Dns01Challenger::new(zone.clone(), resolver.clone());

        let record = ChallengeRecord::new("*.apps.example.com", "digest");
        challenger.publish(&record, &creds()).await.unwrap();
        let outcome = challenger
            .verify(&record, policy(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.polls, 3);
        assert_eq!(
            zone.values("_acme-challenge.apps.example.com"),
            vec!["digest".to_string()]
        );
        assert!(resolver
            .seen
            .lock()
            .iter()
            .all(|name| name == "_acme-challenge.apps.example.com"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_failure_is_reported() {
        let zone = Arc::new(MemoryZone::new().failing_puts());
        let resolver = Arc::new(ScriptedResolver::new(1, "digest"));
        let challenger = Dns01Challenger::new(zone, resolver.clone());

        let err = challenger
            .publish(&ChallengeRecord::new("example.com", "digest"), &creds())
            .await
            .unwrap_err();

        assert!(matches!(err, CertmanError::DnsProvider(_)));
        assert_eq!(resolver.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cleanup_removes_records() {
        let zone = Arc::new(MemoryZone::new());
        let challenger = Dns01Challenger::new(zone.clone(), zone.clone());
        let record = ChallengeRecord::new("example.com", "v");

        challenger.publish(&record, &creds()).await.unwrap();
        assert_eq!(zone.record_count(), 1);

        challenger.cleanup(&[record.clone(), record], &creds()).await;
        assert_eq!(zone.record_count(), 0);
    }
}
