//! Certificate-authority protocol seam
//!
//! The issuer drives an ACME order through these traits only. The production
//! implementation wraps `instant-acme`; tests substitute a scripted CA.

use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::CertmanResult;

/// Which CA endpoint an account and its orders live on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaEnvironment {
    Production,
    Staging,
}

impl CaEnvironment {
    pub fn from_staging(staging: bool) -> Self {
        if staging {
            CaEnvironment::Staging
        } else {
            CaEnvironment::Production
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CaEnvironment::Production => "production",
            CaEnvironment::Staging => "staging",
        }
    }

    /// Name of the secret holding this environment's account
    pub fn account_secret_name(&self) -> String {
        format!("certman-acme-account-{}", self.as_str())
    }
}

impl fmt::Display for CaEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted form of a CA account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub environment: CaEnvironment,
    /// Opaque credentials produced by the transport
    pub credentials_json: String,
    /// Contact URIs registered with the CA (`mailto:` form)
    pub contacts: Vec<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Challenge type offered for an authorization
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeKind {
    Dns01,
    Http01,
    TlsAlpn01,
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub kind: ChallengeKind,
    pub url: String,
    pub token: String,
    /// `token.thumbprint`, already computed by the transport
    pub key_authorization: String,
    pub status: ChallengeStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    /// Revoked, expired or deactivated
    Other,
}

/// One domain's authorization within an order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub url: String,
    pub domain: String,
    pub status: AuthorizationStatus,
    pub challenges: Vec<Challenge>,
}

impl Authorization {
    pub fn dns01(&self) -> Option<&Challenge> {
        self.challenges.iter().find(|c| c.kind == ChallengeKind::Dns01)
    }
}

/// Account creation and loading
#[async_trait]
pub trait AcmeProtocol: Send + Sync + Debug {
    /// Register a new account; returns it with its serialized credentials
    async fn create_account(
        &self,
        environment: CaEnvironment,
        contacts: &[String],
    ) -> CertmanResult<(Arc<dyn AcmeAccount>, String)>;

    /// Restore an account from credentials returned by `create_account`
    async fn load_account(
        &self,
        environment: CaEnvironment,
        credentials_json: &str,
    ) -> CertmanResult<Arc<dyn AcmeAccount>>;
}

/// Operations on an existing account
#[async_trait]
pub trait AcmeAccount: Send + Sync + Debug {
    async fn update_contacts(&self, contacts: &[String]) -> CertmanResult<()>;

    async fn new_order(&self, domains: &[String]) -> CertmanResult<Box<dyn AcmeOrder>>;
}

/// One certificate order, driven to completion by a single caller
///
/// Methods that wait on the CA return [`CertmanError::Cancelled`] as soon as
/// `cancel` fires.
///
/// [`CertmanError::Cancelled`]: crate::error::CertmanError::Cancelled
#[async_trait]
pub trait AcmeOrder: Send + Debug {
    async fn authorization_urls(&mut self) -> CertmanResult<Vec<String>>;

    async fn fetch_authorization(&mut self, url: &str) -> CertmanResult<Authorization>;

    /// Ask the CA to validate `challenge`; returns it in a settled state
    async fn update_challenge(
        &mut self,
        challenge: &Challenge,
        cancel: &CancellationToken,
    ) -> CertmanResult<Challenge>;

    /// Submit the CSR once every authorization is valid
    async fn finalize(&mut self, csr_der: &[u8], cancel: &CancellationToken) -> CertmanResult<()>;

    /// Issued chain as DER, leaf first
    async fn fetch_certificates(&mut self, cancel: &CancellationToken)
        -> CertmanResult<Vec<Vec<u8>>>;
}
