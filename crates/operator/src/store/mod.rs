//! Storage interfaces for secrets and certificate-request records
//!
//! Both stores offer per-object optimistic concurrency: every stored object
//! carries a `resource_version`, and `update`/`delete` fail with
//! [`StoreError::Conflict`] when the caller's version is stale.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use certman_common::{OwnerId, RequestName};

use crate::request::CertificateRequest;

mod file;
mod memory;

pub use file::FileSecretStore;
pub use memory::{MemoryRecordStore, MemorySecretStore};

/// Kind label used in errors for secrets
pub const SECRET_KIND: &str = "secret";

/// Kind label used in errors for certificate requests
pub const REQUEST_KIND: &str = "certificate request";

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by store implementations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} '{namespace}/{name}' not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    /// The caller's resource version is stale
    #[error("{kind} '{name}' was modified concurrently")]
    Conflict { kind: &'static str, name: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// An opaque secret: string data plus labels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub resource_version: u64,
}

impl Secret {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            data: BTreeMap::new(),
            labels: BTreeMap::new(),
            resource_version: 0,
        }
    }
}

/// Secret storage
#[async_trait]
pub trait SecretStore: Send + Sync + Debug {
    /// Fetch a secret, failing with `NotFound` when absent
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Secret>;

    /// Create a secret, failing with `AlreadyExists` when present
    async fn create(&self, secret: Secret) -> StoreResult<Secret>;

    /// Replace a secret whose `resource_version` matches the stored one
    async fn update(&self, secret: Secret) -> StoreResult<Secret>;

    /// Fetch a secret, mapping `NotFound` to `None`
    async fn find(&self, namespace: &str, name: &str) -> StoreResult<Option<Secret>> {
        match self.get(namespace, name).await {
            Ok(secret) => Ok(Some(secret)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Certificate-request record storage
#[async_trait]
pub trait RecordStore: Send + Sync + Debug {
    /// Records in `namespace` whose owner is exactly `owner`
    async fn list_owned(
        &self,
        namespace: &str,
        owner: &OwnerId,
    ) -> StoreResult<Vec<CertificateRequest>>;

    async fn get(&self, namespace: &str, name: &RequestName) -> StoreResult<CertificateRequest>;

    async fn create(&self, request: CertificateRequest) -> StoreResult<CertificateRequest>;

    /// Replace a record whose `resource_version` matches the stored one
    async fn update(&self, request: CertificateRequest) -> StoreResult<CertificateRequest>;

    /// Delete a record whose `resource_version` matches the stored one
    async fn delete(&self, request: &CertificateRequest) -> StoreResult<()>;
}
