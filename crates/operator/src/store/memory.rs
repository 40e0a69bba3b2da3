//! In-memory stores
//!
//! Used by tests and by the CLI. Records are indexed by owner so ownership
//! filtering never scans unrelated records.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use certman_common::{OwnerId, RequestName};

use super::{
    RecordStore, Secret, SecretStore, StoreError, StoreResult, REQUEST_KIND, SECRET_KIND,
};
use crate::request::CertificateRequest;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// In-memory [`SecretStore`]
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<Key, Secret>>,
    next_version: AtomicU64,
    writes: AtomicU64,
    fail_writes: AtomicBool,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful create/update calls
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every subsequent create/update fail with a backend error
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of a stored secret, bypassing the async interface
    pub fn snapshot(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.secrets.lock().get(&key(namespace, name)).cloned()
    }

    fn bump(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Secret> {
        self.secrets
            .lock()
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: SECRET_KIND,
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn create(&self, mut secret: Secret) -> StoreResult<Secret> {
        self.check_writable()?;
        let mut secrets = self.secrets.lock();
        let k = key(&secret.namespace, &secret.name);
        if secrets.contains_key(&k) {
            return Err(StoreError::AlreadyExists {
                kind: SECRET_KIND,
                name: secret.name,
            });
        }
        secret.resource_version = self.bump();
        secrets.insert(k, secret.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        trace!(namespace = %secret.namespace, name = %secret.name, "Created secret");
        Ok(secret)
    }

    async fn update(&self, mut secret: Secret) -> StoreResult<Secret> {
        self.check_writable()?;
        let mut secrets = self.secrets.lock();
        let k = key(&secret.namespace, &secret.name);
        let Some(current) = secrets.get(&k) else {
            return Err(StoreError::NotFound {
                kind: SECRET_KIND,
                namespace: secret.namespace,
                name: secret.name,
            });
        };
        if current.resource_version != secret.resource_version {
            return Err(StoreError::Conflict {
                kind: SECRET_KIND,
                name: secret.name,
            });
        }
        secret.resource_version = self.bump();
        secrets.insert(k, secret.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        trace!(namespace = %secret.namespace, name = %secret.name, "Updated secret");
        Ok(secret)
    }
}

#[derive(Debug, Default)]
struct RecordState {
    records: HashMap<Key, CertificateRequest>,
    by_owner: HashMap<OwnerId, BTreeSet<Key>>,
}

/// In-memory [`RecordStore`] with an owner index
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: Mutex<RecordState>,
    next_version: AtomicU64,
    writes: AtomicU64,
    conflict_next_update: AtomicBool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful create/update/delete calls
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make the next update or delete fail with a conflict
    pub fn conflict_next_update(&self) {
        self.conflict_next_update.store(true, Ordering::SeqCst);
    }

    /// All stored records, regardless of owner
    pub fn all(&self) -> Vec<CertificateRequest> {
        let mut all: Vec<_> = self.state.lock().records.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    fn bump(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn take_injected_conflict(&self, name: &RequestName) -> StoreResult<()> {
        if self.conflict_next_update.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Conflict {
                kind: REQUEST_KIND,
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn check_version(
        state: &RecordState,
        request: &CertificateRequest,
    ) -> StoreResult<Key> {
        let k = key(&request.namespace, request.name.as_str());
        match state.records.get(&k) {
            None => Err(StoreError::NotFound {
                kind: REQUEST_KIND,
                namespace: request.namespace.clone(),
                name: request.name.to_string(),
            }),
            Some(current) if current.resource_version != request.resource_version => {
                Err(StoreError::Conflict {
                    kind: REQUEST_KIND,
                    name: request.name.to_string(),
                })
            }
            Some(_) => Ok(k),
        }
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn list_owned(
        &self,
        namespace: &str,
        owner: &OwnerId,
    ) -> StoreResult<Vec<CertificateRequest>> {
        let state = self.state.lock();
        let mut owned: Vec<CertificateRequest> = state
            .by_owner
            .get(owner)
            .into_iter()
            .flatten()
            .filter(|(ns, _)| ns == namespace)
            .filter_map(|k| state.records.get(k).cloned())
            .collect();
        owned.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(owned)
    }

    async fn get(&self, namespace: &str, name: &RequestName) -> StoreResult<CertificateRequest> {
        self.state
            .lock()
            .records
            .get(&key(namespace, name.as_str()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: REQUEST_KIND,
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn create(&self, mut request: CertificateRequest) -> StoreResult<CertificateRequest> {
        let mut state = self.state.lock();
        let k = key(&request.namespace, request.name.as_str());
        if state.records.contains_key(&k) {
            return Err(StoreError::AlreadyExists {
                kind: REQUEST_KIND,
                name: request.name.to_string(),
            });
        }
        request.resource_version = self.bump();
        state
            .by_owner
            .entry(request.owner.clone())
            .or_default()
            .insert(k.clone());
        state.records.insert(k, request.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(request)
    }

    async fn update(&self, mut request: CertificateRequest) -> StoreResult<CertificateRequest> {
        self.take_injected_conflict(&request.name)?;
        let mut state = self.state.lock();
        let k = Self::check_version(&state, &request)?;

        // Ownership is fixed at creation
        if let Some(current) = state.records.get(&k) {
            request.owner = current.owner.clone();
        }
        request.resource_version = self.bump();
        state.records.insert(k, request.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(request)
    }

    async fn delete(&self, request: &CertificateRequest) -> StoreResult<()> {
        self.take_injected_conflict(&request.name)?;
        let mut state = self.state.lock();
        let k = Self::check_version(&state, request)?;

        if let Some(removed) = state.records.remove(&k) {
            if let Some(keys) = state.by_owner.get_mut(&removed.owner) {
                keys.remove(&k);
                if keys.is_empty() {
                    state.by_owner.remove(&removed.owner);
                }
            }
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{CertificateRequestSpec, ObjectRef};

    fn request(name: &str, owner: &str) -> CertificateRequest {
        CertificateRequest::new(
            "ns",
            RequestName::from_string(name),
            OwnerId::from(owner),
            CertificateRequestSpec {
                acme_dns_domain: "example.com".to_string(),
                dns_names: vec!["a.example.com".to_string()],
                email: "sre@example.com".to_string(),
                certificate_secret: ObjectRef::new("ns", "tls"),
                dns_credentials: ObjectRef::new("ns", "creds"),
                renew_before_days: 0,
                api_url: None,
                web_console_url: None,
            },
        )
    }

    #[tokio::test]
    async fn test_owner_filtering() {
        let store = MemoryRecordStore::new();
        store.create(request("a", "owner-1")).await.unwrap();
        store.create(request("b", "owner-2")).await.unwrap();

        let owned = store.list_owned("ns", &OwnerId::from("owner-1")).await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].name.as_str(), "a");

        assert!(store
            .list_owned("other-ns", &OwnerId::from("owner-1"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let store = MemoryRecordStore::new();
        let created = store.create(request("a", "o")).await.unwrap();

        let mut first = created.clone();
        first.spec.email = "new@example.com".to_string();
        store.update(first).await.unwrap();

        let err = store.update(created).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_delete_removes_from_owner_index() {
        let store = MemoryRecordStore::new();
        let created = store.create(request("a", "o")).await.unwrap();
        store.delete(&created).await.unwrap();

        assert!(store.list_owned("ns", &OwnerId::from("o")).await.unwrap().is_empty());
        assert_eq!(store.writes(), 2);
    }

    #[tokio::test]
    async fn test_secret_create_then_update() {
        let store = MemorySecretStore::new();
        let mut secret = Secret::new("ns", "tls");
        secret.data.insert("tls.crt".to_string(), "pem".to_string());

        let created = store.create(secret.clone()).await.unwrap();
        assert!(matches!(
            store.create(secret).await.unwrap_err(),
            StoreError::AlreadyExists { .. }
        ));

        let updated = store.update(created.clone()).await.unwrap();
        assert!(updated.resource_version > created.resource_version);
        assert!(store.find("ns", "missing").await.unwrap().is_none());
    }
}
