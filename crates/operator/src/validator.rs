//! Live TLS drift detection
//!
//! Dials every domain of a request, reads the leaf certificate the endpoint
//! serves and compares its serial with the stored one. Results are only
//! reported; nothing here triggers issuance.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use certman_common::RequestName;

use crate::acme::dns::normalize_domain;
use crate::certificate::{CertificateMaterial, LeafCertificate};
use crate::error::{CertmanError, CertmanResult};
use crate::request::CertificateRequest;
use crate::store::SecretStore;

/// Reads the certificate an endpoint presents
#[async_trait]
pub trait PeerCertificateFetcher: Send + Sync + Debug {
    /// DER of the first certificate in the peer chain
    async fn leaf_certificate(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> CertmanResult<Vec<u8>>;
}

/// Accepts any server certificate; the chain is read, never trusted
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// TLS fetcher on `tokio-rustls`
#[derive(Clone)]
pub struct RustlsFetcher {
    connector: TlsConnector,
}

impl Debug for RustlsFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustlsFetcher").finish_non_exhaustive()
    }
}

impl RustlsFetcher {
    pub fn new() -> CertmanResult<Self> {
        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| CertmanError::Configuration(format!("TLS client setup failed: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth();

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }
}

#[async_trait]
impl PeerCertificateFetcher for RustlsFetcher {
    async fn leaf_certificate(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> CertmanResult<Vec<u8>> {
        let network_error = |message: String| CertmanError::Network {
            host: host.to_string(),
            message,
        };

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| network_error(format!("invalid server name: {}", e)))?;

        let handshake = async {
            let stream = TcpStream::connect((host, port))
                .await
                .map_err(|e| network_error(format!("dial failed: {}", e)))?;
            self.connector
                .connect(server_name, stream)
                .await
                .map_err(|e| network_error(format!("handshake failed: {}", e)))
        };

        let tls = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| network_error(format!("no handshake within {:?}", timeout)))??;

        let (_, connection) = tls.get_ref();
        connection
            .peer_certificates()
            .and_then(|chain| chain.first())
            .map(|leaf| leaf.as_ref().to_vec())
            .ok_or_else(|| network_error("peer presented no certificate".to_string()))
    }
}

/// Result for one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainCheck {
    Match,
    Mismatch { live_serial: String },
    Unreachable { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainReport {
    pub domain: String,
    /// Host actually dialled (wildcard label removed)
    pub host: String,
    pub check: DomainCheck,
}

/// Per-domain results for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftReport {
    pub request: RequestName,
    pub stored_serial: String,
    pub domains: Vec<DomainReport>,
}

impl DriftReport {
    pub fn mismatched(&self) -> impl Iterator<Item = &DomainReport> {
        self.domains
            .iter()
            .filter(|d| matches!(d.check, DomainCheck::Mismatch { .. }))
    }

    pub fn unreachable(&self) -> impl Iterator<Item = &DomainReport> {
        self.domains
            .iter()
            .filter(|d| matches!(d.check, DomainCheck::Unreachable { .. }))
    }

    /// Every domain served the stored certificate
    pub fn is_consistent(&self) -> bool {
        self.domains.iter().all(|d| d.check == DomainCheck::Match)
    }
}

/// Compares served certificates with stored ones
#[derive(Debug, Clone)]
pub struct CertificateValidator {
    fetcher: Arc<dyn PeerCertificateFetcher>,
    secrets: Arc<dyn SecretStore>,
    port: u16,
    dial_timeout: Duration,
}

impl CertificateValidator {
    pub fn new(
        fetcher: Arc<dyn PeerCertificateFetcher>,
        secrets: Arc<dyn SecretStore>,
        port: u16,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            fetcher,
            secrets,
            port,
            dial_timeout,
        }
    }

    /// Check every domain of `request`
    ///
    /// Fails only when the stored certificate cannot be read; per-domain
    /// failures are recorded in the report.
    pub async fn check(&self, request: &CertificateRequest) -> CertmanResult<DriftReport> {
        let secret_ref = &request.spec.certificate_secret;
        let secret = self
            .secrets
            .find(&secret_ref.namespace, &secret_ref.name)
            .await?;
        let material = secret
            .as_ref()
            .and_then(CertificateMaterial::from_secret)
            .ok_or_else(|| CertmanError::SecretNotFound {
                namespace: secret_ref.namespace.clone(),
                name: secret_ref.name.clone(),
            })?;
        let stored = material.leaf()?;

        let mut domains = Vec::with_capacity(request.spec.dns_names.len());
        for domain in &request.spec.dns_names {
            let host = normalize_domain(domain).to_string();
            let check = self.check_host(&host, &stored).await;
            match &check {
                DomainCheck::Match => debug!(
                    request = %request.name,
                    domain = %domain,
                    "Served certificate matches"
                ),
                DomainCheck::Mismatch { live_serial } => warn!(
                    request = %request.name,
                    domain = %domain,
                    stored_serial = %stored.serial,
                    live_serial = %live_serial,
                    "Served certificate differs from stored certificate"
                ),
                DomainCheck::Unreachable { message } => warn!(
                    request = %request.name,
                    domain = %domain,
                    error = %message,
                    "Could not read served certificate"
                ),
            }
            domains.push(DomainReport {
                domain: domain.clone(),
                host,
                check,
            });
        }

        let report = DriftReport {
            request: request.name.clone(),
            stored_serial: stored.serial,
            domains,
        };
        info!(
            request = %request.name,
            domains = report.domains.len(),
            mismatched = report.mismatched().count(),
            unreachable = report.unreachable().count(),
            "Drift check complete"
        );
        Ok(report)
    }

    async fn check_host(&self, host: &str, stored: &LeafCertificate) -> DomainCheck {
        let der = match self
            .fetcher
            .leaf_certificate(host, self.port, self.dial_timeout)
            .await
        {
            Ok(der) => der,
            Err(e) => {
                return DomainCheck::Unreachable {
                    message: e.to_string(),
                }
            }
        };

        match LeafCertificate::from_der(&der) {
            Ok(live) if live.serial == stored.serial => DomainCheck::Match,
            Ok(live) => DomainCheck::Mismatch {
                live_serial: live.serial,
            },
            Err(e) => DomainCheck::Unreachable {
                message: e.to_string(),
            },
        }
    }
}
