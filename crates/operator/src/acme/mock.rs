//! Scripted certificate authority for unit tests

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::client::wait_between_polls;
use super::dns::{challenge_record_fqdn, dns01_value, MemoryZone};
use super::protocol::{
    AcmeAccount, AcmeOrder, AcmeProtocol, Authorization, AuthorizationStatus, CaEnvironment,
    Challenge, ChallengeKind, ChallengeStatus,
};
use crate::error::{CertmanError, CertmanResult};

#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub(crate) accounts_created: u32,
    pub(crate) accounts_loaded: u32,
    pub(crate) contact_updates: Vec<Vec<String>>,
    pub(crate) orders: Vec<Vec<String>>,
    pub(crate) validated: Vec<String>,
    /// Challenges submitted before their record resolved
    pub(crate) premature_submissions: Vec<String>,
    pub(crate) finalized: u32,
}

#[derive(Debug, Default)]
pub(crate) struct MockCaOptions {
    pub(crate) chain: Vec<Vec<u8>>,
    pub(crate) already_valid: BTreeSet<String>,
    pub(crate) http_only: BTreeSet<String>,
    pub(crate) reject: BTreeSet<String>,
    pub(crate) fail_finalize: bool,
    pub(crate) fail_certificates: bool,
    pub(crate) fail_contact_updates: bool,
    /// Challenges stay processing until the caller gives up
    pub(crate) stall_challenges: bool,
    pub(crate) zone: Option<Arc<MemoryZone>>,
}

#[derive(Debug, Clone)]
pub(crate) struct MockCa {
    options: Arc<MockCaOptions>,
    pub(crate) state: Arc<Mutex<MockState>>,
}

impl MockCa {
    pub(crate) fn new(options: MockCaOptions) -> Self {
        Self {
            options: Arc::new(options),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    fn account(&self) -> Arc<dyn AcmeAccount> {
        Arc::new(MockAccount { ca: self.clone() })
    }
}

#[async_trait]
impl AcmeProtocol for MockCa {
    async fn create_account(
        &self,
        _environment: CaEnvironment,
        contacts: &[String],
    ) -> CertmanResult<(Arc<dyn AcmeAccount>, String)> {
        self.state.lock().accounts_created += 1;
        let credentials = serde_json::json!({ "contacts": contacts }).to_string();
        Ok((self.account(), credentials))
    }

    async fn load_account(
        &self,
        _environment: CaEnvironment,
        _credentials_json: &str,
    ) -> CertmanResult<Arc<dyn AcmeAccount>> {
        self.state.lock().accounts_loaded += 1;
        Ok(self.account())
    }
}

#[derive(Debug)]
struct MockAccount {
    ca: MockCa,
}

#[async_trait]
impl AcmeAccount for MockAccount {
    async fn update_contacts(&self, contacts: &[String]) -> CertmanResult<()> {
        if self.ca.options.fail_contact_updates {
            return Err(CertmanError::Protocol("account update rejected".to_string()));
        }
        self.ca.state.lock().contact_updates.push(contacts.to_vec());
        Ok(())
    }

    async fn new_order(&self, domains: &[String]) -> CertmanResult<Box<dyn AcmeOrder>> {
        self.ca.state.lock().orders.push(domains.to_vec());
        Ok(Box::new(MockOrder {
            ca: self.ca.clone(),
            domains: domains.to_vec(),
        }))
    }
}

#[derive(Debug)]
struct MockOrder {
    ca: MockCa,
    domains: Vec<String>,
}

impl MockOrder {
    fn domain_for(&self, url: &str) -> CertmanResult<&String> {
        url.rsplit('/')
            .next()
            .and_then(|i| i.parse::<usize>().ok())
            .and_then(|i| self.domains.get(i))
            .ok_or_else(|| CertmanError::Protocol(format!("unknown url '{}'", url)))
    }
}

#[async_trait]
impl AcmeOrder for MockOrder {
    async fn authorization_urls(&mut self) -> CertmanResult<Vec<String>> {
        Ok((0..self.domains.len())
            .map(|i| format!("https://ca.test/authz/{}", i))
            .collect())
    }

    async fn fetch_authorization(&mut self, url: &str) -> CertmanResult<Authorization> {
        let index = url.rsplit('/').next().unwrap_or_default();
        let domain = self.domain_for(url)?.clone();
        let options = &self.ca.options;

        let kind = if options.http_only.contains(&domain) {
            ChallengeKind::Http01
        } else {
            ChallengeKind::Dns01
        };
        let status = if options.already_valid.contains(&domain) {
            AuthorizationStatus::Valid
        } else {
            AuthorizationStatus::Pending
        };

        Ok(Authorization {
            url: url.to_string(),
            domain: domain.clone(),
            status,
            challenges: vec![Challenge {
                kind,
                url: format!("https://ca.test/chall/{}", index),
                token: format!("token-{}", domain),
                key_authorization: format!("token-{}.thumbprint", domain),
                status: ChallengeStatus::Pending,
            }],
        })
    }

    async fn update_challenge(
        &mut self,
        challenge: &Challenge,
        cancel: &CancellationToken,
    ) -> CertmanResult<Challenge> {
        let domain = self.domain_for(&challenge.url)?.clone();
        if self.ca.options.stall_challenges {
            loop {
                wait_between_polls(cancel).await?;
            }
        }
        let mut state = self.ca.state.lock();

        if let Some(zone) = &self.ca.options.zone {
            let record = challenge_record_fqdn(&domain);
            let value = dns01_value(&challenge.key_authorization);
            if !zone.was_observed(&record, &value) {
                state.premature_submissions.push(domain.clone());
            }
        }
        state.validated.push(domain.clone());

        let mut settled = challenge.clone();
        settled.status = if self.ca.options.reject.contains(&domain) {
            ChallengeStatus::Invalid
        } else {
            ChallengeStatus::Valid
        };
        Ok(settled)
    }

    async fn finalize(&mut self, _csr_der: &[u8], _cancel: &CancellationToken) -> CertmanResult<()> {
        if self.ca.options.fail_finalize {
            return Err(CertmanError::Protocol("finalize rejected".to_string()));
        }
        self.ca.state.lock().finalized += 1;
        Ok(())
    }

    async fn fetch_certificates(
        &mut self,
        _cancel: &CancellationToken,
    ) -> CertmanResult<Vec<Vec<u8>>> {
        if self.ca.options.fail_certificates {
            return Err(CertmanError::Protocol("certificate download failed".to_string()));
        }
        Ok(self.ca.options.chain.clone())
    }
}
