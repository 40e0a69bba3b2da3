//! DNS-01 issuance workflow
//!
//! Drives one certificate request from account to stored secret:
//!
//! 1. Confirm the DNS credentials can write under the base domain
//! 2. Ensure the CA account exists and lists the request's email
//! 3. Open an order for every requested domain
//! 4. Per pending authorization: publish the TXT record, confirm it resolves,
//!    then ask the CA to validate
//! 5. Generate a fresh key, finalize with a CSR naming the primary domain,
//!    download the chain
//! 6. Write chain and key to the target secret in a single update
//!
//! Challenge records are removed afterwards whatever the outcome. The secret
//! is only touched in step 6, so a failed run leaves the previous
//! certificate in place.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use certman_common::{Observation, ObservabilitySink, RequestName};
use certman_config::OperatorConfig;

use super::account::AccountRegistry;
use super::dns::{dns01_value, ChallengeRecord, Dns01Challenger, PropagationPolicy};
use super::protocol::{AuthorizationStatus, CaEnvironment, ChallengeStatus};
use crate::certificate::{CertificateMaterial, LeafCertificate};
use crate::error::{CertmanError, CertmanResult};
use crate::request::{CertificateRequest, CertificateRequestSpec};
use crate::store::{Secret, SecretStore};

/// Progress of one issuance run
///
/// The per-authorization states repeat for every pending authorization. A
/// failed run reports the last state it reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuanceState {
    Idle,
    AccountReady,
    OrderCreated,
    AuthorizationFetched,
    ChallengePublished,
    ChallengeVerifiedLocally,
    ChallengeSubmitted,
    AllAuthorized,
    KeyGenerated,
    CsrBuilt,
    Finalized,
    CertificateFetched,
    SecretWritten,
}

/// Knobs for the issuance workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssuerSettings {
    pub environment: CaEnvironment,
    pub propagation: PropagationPolicy,
    /// Upper bound on one whole run
    pub timeout: Duration,
}

impl From<&OperatorConfig> for IssuerSettings {
    fn from(config: &OperatorConfig) -> Self {
        Self {
            environment: CaEnvironment::from_staging(config.acme.staging),
            propagation: config.dns.propagation.into(),
            timeout: Duration::from_secs(config.acme.issuance_timeout_secs),
        }
    }
}

/// What a successful run produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuanceOutcome {
    pub request: RequestName,
    pub domains: Vec<String>,
    pub certificate: LeafCertificate,
    pub elapsed: Duration,
}

type InFlightKey = (String, RequestName);

/// Removes its key from the in-flight set when dropped
struct InFlightGuard<'a> {
    in_flight: &'a DashMap<InFlightKey, ()>,
    key: InFlightKey,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

/// Runs the issuance workflow for certificate requests
#[derive(Debug)]
pub struct CertificateIssuer {
    accounts: Arc<AccountRegistry>,
    challenger: Dns01Challenger,
    secrets: Arc<dyn SecretStore>,
    sink: Arc<dyn ObservabilitySink>,
    settings: IssuerSettings,
    in_flight: DashMap<InFlightKey, ()>,
}

impl CertificateIssuer {
    pub fn new(
        accounts: Arc<AccountRegistry>,
        challenger: Dns01Challenger,
        secrets: Arc<dyn SecretStore>,
        sink: Arc<dyn ObservabilitySink>,
        settings: IssuerSettings,
    ) -> Self {
        Self {
            accounts,
            challenger,
            secrets,
            sink,
            settings,
            in_flight: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &IssuerSettings {
        &self.settings
    }

    /// Issue (or reissue) the certificate for `request`
    ///
    /// Fails with a store conflict if the same request is already being
    /// issued in this process. Every call, rejected ones included, records
    /// one duration observation.
    pub async fn issue(
        &self,
        request: &CertificateRequest,
        cancel: &CancellationToken,
    ) -> CertmanResult<IssuanceOutcome> {
        let start = Instant::now();
        let mut state = IssuanceState::Idle;
        let result = self.attempt(request, cancel, &mut state).await;

        let elapsed = start.elapsed();
        self.sink.record(Observation::IssuanceDuration {
            request: request.name.to_string(),
            seconds: elapsed.as_secs_f64(),
            success: result.is_ok(),
        });

        match result {
            Ok(certificate) => {
                info!(
                    request = %request.name,
                    serial = %certificate.serial,
                    not_after = %certificate.not_after,
                    elapsed_secs = elapsed.as_secs(),
                    "Certificate issued"
                );
                Ok(IssuanceOutcome {
                    request: request.name.clone(),
                    domains: request.spec.dns_names.clone(),
                    certificate,
                    elapsed,
                })
            }
            Err(e) => {
                error!(
                    request = %request.name,
                    reached = ?state,
                    error = %e,
                    "Certificate issuance failed"
                );
                Err(e)
            }
        }
    }

    /// Checks, then the bounded run, then challenge cleanup
    async fn attempt(
        &self,
        request: &CertificateRequest,
        cancel: &CancellationToken,
        state: &mut IssuanceState,
    ) -> CertmanResult<LeafCertificate> {
        if request.spec.primary_domain().is_none() {
            return Err(CertmanError::Configuration(format!(
                "certificate request '{}' has no domains",
                request.name
            )));
        }

        let _guard = self.claim(request)?;
        let run_cancel = cancel.child_token();
        let mut records = Vec::new();

        info!(
            request = %request.name,
            domains = ?request.spec.dns_names,
            environment = %self.settings.environment,
            "Starting certificate issuance"
        );

        let result = match tokio::time::timeout(
            self.settings.timeout,
            self.run(request, &run_cancel, &mut records, state),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                run_cancel.cancel();
                Err(CertmanError::Timeout(format!(
                    "issuance of '{}' exceeded {:?}",
                    request.name, self.settings.timeout
                )))
            }
        };

        self.challenger
            .cleanup(&records, &request.spec.dns_credentials)
            .await;
        result
    }

    fn claim(&self, request: &CertificateRequest) -> CertmanResult<InFlightGuard<'_>> {
        let key = (request.namespace.clone(), request.name.clone());
        match self.in_flight.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(CertmanError::StoreConflict {
                kind: "issuance",
                name: request.name.to_string(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                Ok(InFlightGuard {
                    in_flight: &self.in_flight,
                    key,
                })
            }
        }
    }

    async fn run(
        &self,
        request: &CertificateRequest,
        cancel: &CancellationToken,
        records: &mut Vec<ChallengeRecord>,
        state: &mut IssuanceState,
    ) -> CertmanResult<LeafCertificate> {
        let spec = &request.spec;
        let credentials = &spec.dns_credentials;

        self.challenger
            .provider()
            .verify_write_access(&spec.acme_dns_domain, credentials)
            .await?;
        let account = self
            .accounts
            .ensure_account(self.settings.environment, &spec.email)
            .await?;
        advance(state, IssuanceState::AccountReady, request);

        let mut order = account.new_order(&spec.dns_names).await?;
        advance(state, IssuanceState::OrderCreated, request);

        for url in order.authorization_urls().await? {
            if cancel.is_cancelled() {
                return Err(CertmanError::Cancelled);
            }

            let authorization = order.fetch_authorization(&url).await?;
            advance(state, IssuanceState::AuthorizationFetched, request);
            match authorization.status {
                AuthorizationStatus::Valid => {
                    debug!(domain = %authorization.domain, "Authorization already valid");
                    continue;
                }
                AuthorizationStatus::Pending => {}
                status => {
                    return Err(CertmanError::Protocol(format!(
                        "authorization for '{}' is {:?}",
                        authorization.domain, status
                    )));
                }
            }

            let challenge = authorization.dns01().cloned().ok_or_else(|| {
                CertmanError::Configuration(format!(
                    "certificate authority offered no dns-01 challenge for '{}'",
                    authorization.domain
                ))
            })?;

            let record = ChallengeRecord::new(
                &authorization.domain,
                &dns01_value(&challenge.key_authorization),
            );
            records.push(record.clone());

            self.challenger.publish(&record, credentials).await?;
            advance(state, IssuanceState::ChallengePublished, request);

            self.challenger
                .verify(&record, self.settings.propagation, cancel)
                .await?;
            advance(state, IssuanceState::ChallengeVerifiedLocally, request);

            let settled = order.update_challenge(&challenge, cancel).await?;
            if settled.status != ChallengeStatus::Valid {
                return Err(CertmanError::Protocol(format!(
                    "dns-01 challenge for '{}' ended {:?}",
                    authorization.domain, settled.status
                )));
            }
            advance(state, IssuanceState::ChallengeSubmitted, request);
        }
        advance(state, IssuanceState::AllAuthorized, request);

        let (csr_der, private_key_pem) = {
            let key_pair = KeyPair::generate()
                .map_err(|e| CertmanError::Parse(format!("failed to generate key pair: {}", e)))?;
            advance(state, IssuanceState::KeyGenerated, request);
            (build_csr(spec, &key_pair)?, key_pair.serialize_pem())
        };
        advance(state, IssuanceState::CsrBuilt, request);

        order.finalize(&csr_der, cancel).await?;
        advance(state, IssuanceState::Finalized, request);

        let chain = order.fetch_certificates(cancel).await?;
        let material = CertificateMaterial::from_chain(&chain, private_key_pem)?;
        let certificate = material.leaf()?;
        advance(state, IssuanceState::CertificateFetched, request);

        if cancel.is_cancelled() {
            return Err(CertmanError::Cancelled);
        }
        self.write_secret(request, material).await?;
        advance(state, IssuanceState::SecretWritten, request);

        Ok(certificate)
    }

    /// Store chain and key together, keeping unrelated secret content
    async fn write_secret(
        &self,
        request: &CertificateRequest,
        material: CertificateMaterial,
    ) -> CertmanResult<()> {
        let target = &request.spec.certificate_secret;
        match self.secrets.find(&target.namespace, &target.name).await? {
            Some(mut secret) => {
                material.apply_to(&mut secret, &request.name);
                self.secrets.update(secret).await?;
            }
            None => {
                let mut secret = Secret::new(&target.namespace, &target.name);
                material.apply_to(&mut secret, &request.name);
                self.secrets.create(secret).await?;
            }
        }
        debug!(request = %request.name, secret = %target, "Wrote certificate secret");
        Ok(())
    }
}

fn advance(state: &mut IssuanceState, next: IssuanceState, request: &CertificateRequest) {
    debug!(request = %request.name, from = ?state, to = ?next, "Issuance state change");
    *state = next;
}

/// CSR naming every domain, signed by `key_pair`
///
/// The primary domain is the common name.
fn build_csr(spec: &CertificateRequestSpec, key_pair: &KeyPair) -> CertmanResult<Vec<u8>> {
    let mut params = CertificateParams::new(spec.dns_names.clone())
        .map_err(|e| CertmanError::Parse(format!("invalid certificate domains: {}", e)))?;
    let mut name = DistinguishedName::new();
    if let Some(common_name) = spec.primary_domain() {
        name.push(DnType::CommonName, common_name.to_string());
    }
    params.distinguished_name = name;

    let csr = params
        .serialize_request(key_pair)
        .map_err(|e| CertmanError::Parse(format!("failed to build CSR: {}", e)))?;
    Ok(csr.der().to_vec())
}
