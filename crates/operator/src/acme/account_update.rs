//! Account contact update (RFC 8555 section 7.3.2)
//!
//! `instant-acme` signs orders but has no account update call, so the update
//! is sent from here: a JWS POST to the account URL, signed with the account
//! key held in the stored credentials and carrying the full contact list.

use std::fmt;

use base64::prelude::{Engine, BASE64_URL_SAFE_NO_PAD};
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{Method, Request, StatusCode};
use http_body_util::Full;
use instant_acme::{BytesResponse, HttpClient};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CertmanError, CertmanResult};

const JOSE_JSON: &str = "application/jose+json";
const REPLAY_NONCE: &str = "replay-nonce";
const BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";

/// POST attempts before a run of badNonce answers is treated as a failure
const MAX_ATTEMPTS: u32 = 3;

/// The parts of serialized `instant-acme` credentials needed to sign
#[derive(Deserialize)]
struct StoredCredentials {
    id: String,
    key_pkcs8: String,
    #[serde(default)]
    directory: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Directory {
    new_nonce: String,
}

#[derive(Serialize)]
struct Protected<'a> {
    alg: &'static str,
    kid: &'a str,
    nonce: &'a str,
    url: &'a str,
}

#[derive(Serialize)]
struct ContactPayload<'a> {
    contact: &'a [String],
}

#[derive(Serialize)]
struct FlattenedJws {
    protected: String,
    payload: String,
    signature: String,
}

#[derive(Debug, Default, Deserialize)]
struct Problem {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

/// Signs requests as an existing CA account
pub(crate) struct AccountSigner {
    account_url: String,
    directory: String,
    key: EcdsaKeyPair,
    rng: SystemRandom,
}

impl fmt::Debug for AccountSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountSigner")
            .field("account_url", &self.account_url)
            .field("directory", &self.directory)
            .finish()
    }
}

impl AccountSigner {
    /// `default_directory` applies to credentials that carry no directory URL
    pub(crate) fn from_credentials(
        credentials_json: &str,
        default_directory: &str,
    ) -> CertmanResult<Self> {
        let stored: StoredCredentials = serde_json::from_str(credentials_json)
            .map_err(|e| CertmanError::Parse(format!("invalid account credentials: {}", e)))?;
        let der = BASE64_URL_SAFE_NO_PAD
            .decode(stored.key_pkcs8.as_bytes())
            .map_err(|e| CertmanError::Parse(format!("invalid account key encoding: {}", e)))?;

        let rng = SystemRandom::new();
        let key = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &der, &rng)
            .map_err(|e| CertmanError::Parse(format!("invalid account key: {}", e)))?;

        Ok(Self {
            account_url: stored.id,
            directory: stored
                .directory
                .unwrap_or_else(|| default_directory.to_string()),
            key,
            rng,
        })
    }

    pub(crate) fn account_url(&self) -> &str {
        &self.account_url
    }

    /// Replace the account's contact list on the CA
    pub(crate) async fn update_contacts(
        &self,
        http: &dyn HttpClient,
        contacts: &[String],
    ) -> CertmanResult<()> {
        let payload = serde_json::to_vec(&ContactPayload { contact: contacts })
            .map_err(|e| CertmanError::Parse(format!("failed to encode contacts: {}", e)))?;
        let mut nonce = self.fresh_nonce(http).await?;

        for attempt in 1..=MAX_ATTEMPTS {
            let request = Request::builder()
                .method(Method::POST)
                .uri(&self.account_url)
                .header(CONTENT_TYPE, JOSE_JSON)
                .body(Full::from(self.sign(&payload, &nonce)?))
                .map_err(|e| CertmanError::Protocol(format!("invalid account URL: {}", e)))?;

            let response = http.request(request).await?;
            let status = response.parts.status;
            let next_nonce = replay_nonce(&response);
            let body = read_body(response).await?;

            if status.is_success() {
                debug!(account = %self.account_url, contacts = ?contacts, "CA accepted contact update");
                return Ok(());
            }

            let problem: Problem = serde_json::from_slice(&body).unwrap_or_default();
            if status == StatusCode::BAD_REQUEST && problem.kind.as_deref() == Some(BAD_NONCE) {
                warn!(attempt, account = %self.account_url, "CA rejected nonce, retrying");
                nonce = match next_nonce {
                    Some(nonce) => nonce,
                    None => self.fresh_nonce(http).await?,
                };
                continue;
            }

            return Err(CertmanError::Protocol(format!(
                "account update rejected with {}: {}",
                status,
                problem
                    .detail
                    .or(problem.kind)
                    .unwrap_or_else(|| "no problem document".to_string())
            )));
        }

        Err(CertmanError::Protocol(format!(
            "account update kept failing with badNonce after {} attempts",
            MAX_ATTEMPTS
        )))
    }

    async fn fresh_nonce(&self, http: &dyn HttpClient) -> CertmanResult<String> {
        let request = Request::builder()
            .uri(&self.directory)
            .body(Full::default())
            .map_err(|e| CertmanError::Protocol(format!("invalid directory URL: {}", e)))?;
        let body = read_body(http.request(request).await?).await?;
        let directory: Directory = serde_json::from_slice(&body)
            .map_err(|e| CertmanError::Protocol(format!("invalid ACME directory: {}", e)))?;

        let request = Request::builder()
            .method(Method::HEAD)
            .uri(&directory.new_nonce)
            .body(Full::default())
            .map_err(|e| CertmanError::Protocol(format!("invalid newNonce URL: {}", e)))?;
        let response = http.request(request).await?;
        replay_nonce(&response)
            .ok_or_else(|| CertmanError::Protocol("CA returned no Replay-Nonce".to_string()))
    }

    fn sign(&self, payload: &[u8], nonce: &str) -> CertmanResult<Bytes> {
        let header = Protected {
            alg: "ES256",
            kid: &self.account_url,
            nonce,
            url: &self.account_url,
        };
        let protected = serde_json::to_vec(&header)
            .map_err(|e| CertmanError::Parse(format!("failed to encode JWS header: {}", e)))?;

        let protected = BASE64_URL_SAFE_NO_PAD.encode(protected);
        let payload = BASE64_URL_SAFE_NO_PAD.encode(payload);
        let signing_input = format!("{}.{}", protected, payload);
        let signature = self
            .key
            .sign(&self.rng, signing_input.as_bytes())
            .map_err(|_| CertmanError::Protocol("failed to sign account update".to_string()))?;

        let jws = FlattenedJws {
            protected,
            payload,
            signature: BASE64_URL_SAFE_NO_PAD.encode(signature.as_ref()),
        };
        serde_json::to_vec(&jws)
            .map(Bytes::from)
            .map_err(|e| CertmanError::Parse(format!("failed to encode JWS: {}", e)))
    }
}

fn replay_nonce(response: &BytesResponse) -> Option<String> {
    response
        .parts
        .headers
        .get(REPLAY_NONCE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

async fn read_body(mut response: BytesResponse) -> CertmanResult<Bytes> {
    response
        .body
        .into_bytes()
        .await
        .map_err(|e| CertmanError::Protocol(format!("failed to read CA response: {}", e)))
}
