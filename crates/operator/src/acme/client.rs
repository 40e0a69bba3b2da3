//! ACME transport backed by `instant-acme`
//!
//! Maps the library's account and order handles onto the [`AcmeProtocol`]
//! seam. All waiting on CA-side state changes is bounded here and stops as
//! soon as the caller's token is cancelled; the issuer additionally bounds the
//! whole workflow.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use instant_acme::{
    Account, AccountCredentials, Identifier, LetsEncrypt, NewAccount, NewOrder, Order,
    OrderStatus,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::account_update::AccountSigner;
use super::protocol::{
    AcmeAccount, AcmeOrder, AcmeProtocol, Authorization, AuthorizationStatus, CaEnvironment,
    Challenge, ChallengeKind, ChallengeStatus,
};
use crate::error::{CertmanError, CertmanResult};

/// Delay between CA state polls
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Polls before giving up on a CA-side state change
const MAX_POLLS: u32 = 60;

type HttpsClient = HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Sleep one poll interval unless `cancel` fires first
pub(crate) async fn wait_between_polls(cancel: &CancellationToken) -> CertmanResult<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(CertmanError::Cancelled),
        _ = tokio::time::sleep(POLL_INTERVAL) => Ok(()),
    }
}

impl From<instant_acme::Error> for CertmanError {
    fn from(e: instant_acme::Error) -> Self {
        CertmanError::Protocol(e.to_string())
    }
}

/// Directory URL for a CA environment
pub fn directory_url(environment: CaEnvironment) -> &'static str {
    match environment {
        CaEnvironment::Production => LetsEncrypt::Production.url(),
        CaEnvironment::Staging => LetsEncrypt::Staging.url(),
    }
}

/// Let's Encrypt transport
///
/// One HTTPS client, verified against the platform roots, is shared by every
/// account and order.
#[derive(Debug, Clone)]
pub struct InstantAcmeProtocol {
    http: HttpsClient,
}

impl InstantAcmeProtocol {
    pub fn new() -> CertmanResult<Self> {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_provider_and_native_roots(rustls::crypto::aws_lc_rs::default_provider())
            .map_err(|e| {
                CertmanError::Configuration(format!("failed to load root certificates: {}", e))
            })?
            .https_only()
            .enable_http1()
            .build();
        Ok(Self {
            http: HyperClient::builder(TokioExecutor::new()).build(connector),
        })
    }

    fn account(
        &self,
        account: Account,
        environment: CaEnvironment,
        credentials_json: &str,
    ) -> CertmanResult<Arc<dyn AcmeAccount>> {
        let signer = AccountSigner::from_credentials(credentials_json, directory_url(environment))?;
        Ok(Arc::new(InstantAcmeAccount {
            account,
            environment,
            signer,
            http: self.http.clone(),
        }))
    }
}

#[async_trait]
impl AcmeProtocol for InstantAcmeProtocol {
    async fn create_account(
        &self,
        environment: CaEnvironment,
        contacts: &[String],
    ) -> CertmanResult<(Arc<dyn AcmeAccount>, String)> {
        let contact_refs: Vec<&str> = contacts.iter().map(String::as_str).collect();
        let new_account = NewAccount {
            contact: &contact_refs,
            terms_of_service_agreed: true,
            only_return_existing: false,
        };

        info!(
            environment = %environment,
            contacts = ?contacts,
            "Creating ACME account"
        );
        let (account, credentials) = Account::create_with_http(
            &new_account,
            directory_url(environment),
            None,
            Box::new(self.http.clone()),
        )
        .await?;

        let credentials_json = serde_json::to_string(&credentials).map_err(|e| {
            CertmanError::Protocol(format!("failed to serialize account credentials: {}", e))
        })?;

        Ok((
            self.account(account, environment, &credentials_json)?,
            credentials_json,
        ))
    }

    async fn load_account(
        &self,
        environment: CaEnvironment,
        credentials_json: &str,
    ) -> CertmanResult<Arc<dyn AcmeAccount>> {
        let credentials: AccountCredentials = serde_json::from_str(credentials_json)
            .map_err(|e| CertmanError::Parse(format!("invalid account credentials: {}", e)))?;
        let account =
            Account::from_credentials_and_http(credentials, Box::new(self.http.clone())).await?;
        debug!(environment = %environment, "Loaded ACME account");
        self.account(account, environment, credentials_json)
    }
}

struct InstantAcmeAccount {
    account: Account,
    environment: CaEnvironment,
    signer: AccountSigner,
    http: HttpsClient,
}

impl std::fmt::Debug for InstantAcmeAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstantAcmeAccount")
            .field("id", &self.account.id())
            .field("environment", &self.environment)
            .finish()
    }
}

#[async_trait]
impl AcmeAccount for InstantAcmeAccount {
    async fn update_contacts(&self, contacts: &[String]) -> CertmanResult<()> {
        self.signer.update_contacts(&self.http, contacts).await?;
        info!(
            account = %self.signer.account_url(),
            contacts = ?contacts,
            "Updated ACME account contacts on the CA"
        );
        Ok(())
    }

    async fn new_order(&self, domains: &[String]) -> CertmanResult<Box<dyn AcmeOrder>> {
        let identifiers: Vec<Identifier> =
            domains.iter().map(|d| Identifier::Dns(d.clone())).collect();
        let order = self
            .account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;
        debug!(order = %order.url(), domains = ?domains, "Created ACME order");
        Ok(Box::new(InstantAcmeOrder {
            order,
            authorizations: None,
        }))
    }
}

struct InstantAcmeOrder {
    order: Order,
    authorizations: Option<Vec<Authorization>>,
}

impl std::fmt::Debug for InstantAcmeOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstantAcmeOrder")
            .field("url", &self.order.url())
            .field("status", &self.order.state().status)
            .finish()
    }
}

impl InstantAcmeOrder {
    /// Fetch every authorization and pair it with its URL
    async fn load_authorizations(&mut self) -> CertmanResult<&[Authorization]> {
        let urls = self.order.state().authorizations.clone();
        let fetched = self.order.authorizations().await?;

        let mut converted = Vec::with_capacity(fetched.len());
        for (url, authz) in urls.into_iter().zip(fetched) {
            #[allow(unreachable_patterns)]
            let domain = match &authz.identifier {
                Identifier::Dns(domain) => domain.clone(),
                other => format!("{:?}", other),
            };
            let challenges = authz
                .challenges
                .iter()
                .map(|c| Challenge {
                    kind: challenge_kind(&c.r#type),
                    url: c.url.clone(),
                    token: c.token.clone(),
                    key_authorization: self.order.key_authorization(c).as_str().to_string(),
                    status: challenge_status(&c.status),
                })
                .collect();
            converted.push(Authorization {
                url,
                domain,
                status: authorization_status(&authz.status),
                challenges,
            });
        }

        Ok(self.authorizations.insert(converted))
    }

    fn cached_challenge(&self, url: &str) -> Option<&Challenge> {
        self.authorizations
            .as_deref()?
            .iter()
            .flat_map(|a| a.challenges.iter())
            .find(|c| c.url == url)
    }
}

#[async_trait]
impl AcmeOrder for InstantAcmeOrder {
    async fn authorization_urls(&mut self) -> CertmanResult<Vec<String>> {
        Ok(self.order.state().authorizations.clone())
    }

    async fn fetch_authorization(&mut self, url: &str) -> CertmanResult<Authorization> {
        if self.authorizations.is_none() {
            self.load_authorizations().await?;
        }
        self.authorizations
            .as_deref()
            .and_then(|all| all.iter().find(|a| a.url == url))
            .cloned()
            .ok_or_else(|| CertmanError::Protocol(format!("unknown authorization '{}'", url)))
    }

    async fn update_challenge(
        &mut self,
        challenge: &Challenge,
        cancel: &CancellationToken,
    ) -> CertmanResult<Challenge> {
        self.order.set_challenge_ready(&challenge.url).await?;
        debug!(challenge = %challenge.url, "Challenge marked ready");

        for attempt in 1..=MAX_POLLS {
            wait_between_polls(cancel).await?;
            self.load_authorizations().await?;
            let Some(current) = self.cached_challenge(&challenge.url) else {
                return Err(CertmanError::Protocol(format!(
                    "challenge '{}' disappeared from its order",
                    challenge.url
                )));
            };
            match current.status {
                ChallengeStatus::Valid | ChallengeStatus::Invalid => return Ok(current.clone()),
                status => trace!(attempt, ?status, "Challenge not settled yet"),
            }
        }

        Err(CertmanError::Protocol(format!(
            "challenge '{}' did not settle after {} polls",
            challenge.url, MAX_POLLS
        )))
    }

    async fn finalize(&mut self, csr_der: &[u8], cancel: &CancellationToken) -> CertmanResult<()> {
        for attempt in 1..=MAX_POLLS {
            let status = self.order.refresh().await?.status;
            match status {
                OrderStatus::Ready => {
                    self.order.finalize(csr_der).await?;
                    info!(order = %self.order.url(), "Order finalized");
                    return Ok(());
                }
                OrderStatus::Valid => {
                    warn!(order = %self.order.url(), "Order already valid, skipping finalize");
                    return Ok(());
                }
                OrderStatus::Invalid => {
                    return Err(CertmanError::Protocol(format!(
                        "order '{}' became invalid",
                        self.order.url()
                    )));
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    trace!(attempt, ?status, "Order not ready yet");
                    wait_between_polls(cancel).await?;
                }
            }
        }

        Err(CertmanError::Protocol(format!(
            "order '{}' not ready after {} polls",
            self.order.url(),
            MAX_POLLS
        )))
    }

    async fn fetch_certificates(
        &mut self,
        cancel: &CancellationToken,
    ) -> CertmanResult<Vec<Vec<u8>>> {
        for attempt in 1..=MAX_POLLS {
            if let Some(chain_pem) = self.order.certificate().await? {
                let blocks = pem::parse_many(&chain_pem).map_err(|e| {
                    CertmanError::Parse(format!("invalid certificate chain PEM: {}", e))
                })?;
                return Ok(blocks
                    .into_iter()
                    .filter(|block| block.tag() == "CERTIFICATE")
                    .map(|block| block.into_contents())
                    .collect());
            }
            trace!(attempt, "Certificate not yet available");
            wait_between_polls(cancel).await?;
        }

        Err(CertmanError::Protocol(format!(
            "certificate for order '{}' not available after {} polls",
            self.order.url(),
            MAX_POLLS
        )))
    }
}

fn challenge_kind(kind: &instant_acme::ChallengeType) -> ChallengeKind {
    use instant_acme::ChallengeType;
    #[allow(unreachable_patterns)]
    match kind {
        ChallengeType::Dns01 => ChallengeKind::Dns01,
        ChallengeType::Http01 => ChallengeKind::Http01,
        ChallengeType::TlsAlpn01 => ChallengeKind::TlsAlpn01,
        other => ChallengeKind::Other(format!("{:?}", other)),
    }
}

fn challenge_status(status: &instant_acme::ChallengeStatus) -> ChallengeStatus {
    use instant_acme::ChallengeStatus as Acme;
    #[allow(unreachable_patterns)]
    match status {
        Acme::Pending => ChallengeStatus::Pending,
        Acme::Processing => ChallengeStatus::Processing,
        Acme::Valid => ChallengeStatus::Valid,
        Acme::Invalid => ChallengeStatus::Invalid,
        _ => ChallengeStatus::Pending,
    }
}

fn authorization_status(status: &instant_acme::AuthorizationStatus) -> AuthorizationStatus {
    use instant_acme::AuthorizationStatus as Acme;
    #[allow(unreachable_patterns)]
    match status {
        Acme::Pending => AuthorizationStatus::Pending,
        Acme::Valid => AuthorizationStatus::Valid,
        Acme::Invalid => AuthorizationStatus::Invalid,
        _ => AuthorizationStatus::Other,
    }
}
