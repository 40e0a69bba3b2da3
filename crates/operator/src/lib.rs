//! Certman Operator Library
//!
//! Certificate lifecycle engine for a fleet of clusters: derives the
//! certificates each cluster needs, keeps certificate-request records in
//! step with its topology, issues and renews them through an ACME CA with
//! DNS-01 validation, and reports drift between stored and served
//! certificates.
//!
//! - **Topology**: domain derivation per certificate bundle
//! - **Reconciliation**: create/update/delete of owned request records
//! - **Renewal**: expiry-window policy with a days-remaining observation
//! - **Issuance**: order, authorize, challenge, finalize, fetch, store
//! - **Validation**: live TLS serial comparison per domain
//! - **Scheduling**: periodic passes over every known cluster
//!
//! # Example
//!
//! ```ignore
//! use certman_operator::{desired_requests, ClusterTopology};
//!
//! let topology: ClusterTopology = serde_json::from_str(&json)?;
//! for request in desired_requests(&topology, "sre@example.com").requests {
//!     println!("{} -> {:?}", request.name, request.spec.dns_names);
//! }
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod certificate;
pub mod controller;
pub mod error;
pub mod metrics;
pub mod reconciler;
pub mod renewal;
pub mod request;
pub mod scheduler;
pub mod store;
pub mod topology;
pub mod validator;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Errors
pub use error::{CertmanError, CertmanResult};

// Records and topology
pub use request::{CertificateRequest, CertificateRequestSpec, ObjectRef};
pub use topology::{derive_domains, ClusterTopology};

// Stored material
pub use certificate::{CertificateMaterial, LeafCertificate};
pub use store::{FileSecretStore, MemoryRecordStore, MemorySecretStore, RecordStore, SecretStore};

// Lifecycle components
pub use controller::{ClusterOutcome, Controller, RequestOutcome, SkipReason};
pub use reconciler::{desired_requests, DesiredState, ReconcileReport, Reconciler};
pub use renewal::{RenewalDecision, RenewalEvaluator, RenewalReason};
pub use scheduler::{PassSummary, RenewalScheduler, StaticTopologySource, TopologySource};
pub use validator::{
    CertificateValidator, DomainCheck, DriftReport, PeerCertificateFetcher, RustlsFetcher,
};

// Observability
pub use metrics::PrometheusSink;
