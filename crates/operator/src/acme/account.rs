//! CA account lifecycle
//!
//! One account per CA environment, persisted as a secret in the operator
//! namespace. Concurrent callers in this process are serialised per
//! environment; writers in other processes are caught by the secret's
//! resource version.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::protocol::{AccountRecord, AcmeAccount, AcmeProtocol, CaEnvironment};
use crate::error::{CertmanError, CertmanResult};
use crate::store::{Secret, SecretStore, StoreError};

/// Secret field holding the serialized [`AccountRecord`]
pub const ACCOUNT_FIELD: &str = "account.json";

fn contact_uri(email: &str) -> String {
    format!("mailto:{}", email)
}

#[derive(Debug)]
struct CachedAccount {
    account: Arc<dyn AcmeAccount>,
    record: AccountRecord,
    resource_version: u64,
}

type Slot = Arc<Mutex<Option<CachedAccount>>>;

/// Loads, creates and caches CA accounts
#[derive(Debug)]
pub struct AccountRegistry {
    protocol: Arc<dyn AcmeProtocol>,
    secrets: Arc<dyn SecretStore>,
    namespace: String,
    slots: DashMap<CaEnvironment, Slot>,
}

impl AccountRegistry {
    pub fn new(
        protocol: Arc<dyn AcmeProtocol>,
        secrets: Arc<dyn SecretStore>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            protocol,
            secrets,
            namespace: namespace.into(),
            slots: DashMap::new(),
        }
    }

    /// Account for `environment`, with `email` among its contacts
    ///
    /// Creates and persists the account on first use.
    pub async fn ensure_account(
        &self,
        environment: CaEnvironment,
        email: &str,
    ) -> CertmanResult<Arc<dyn AcmeAccount>> {
        let slot = self.slots.entry(environment).or_default().clone();
        let mut guard = slot.lock().await;

        if guard.is_none() {
            *guard = Some(self.load_or_create(environment, email).await?);
        }
        let Some(cached) = guard.as_mut() else {
            return Err(CertmanError::Protocol(format!(
                "no {} account available",
                environment
            )));
        };

        let contact = contact_uri(email);
        if !cached.record.contacts.contains(&contact) {
            self.add_contact(environment, cached, contact).await?;
        }

        Ok(cached.account.clone())
    }

    async fn load_or_create(
        &self,
        environment: CaEnvironment,
        email: &str,
    ) -> CertmanResult<CachedAccount> {
        if let Some(cached) = self.load_existing(environment).await? {
            return Ok(cached);
        }

        let contacts = vec![contact_uri(email)];
        let (account, credentials_json) =
            self.protocol.create_account(environment, &contacts).await?;
        let now = Utc::now();
        let record = AccountRecord {
            environment,
            credentials_json,
            contacts,
            created: now,
            updated: now,
        };

        let mut secret = Secret::new(&self.namespace, environment.account_secret_name());
        secret
            .data
            .insert(ACCOUNT_FIELD.to_string(), encode_record(&record)?);

        match self.secrets.create(secret).await {
            Ok(stored) => {
                info!(
                    environment = %environment,
                    secret = %stored.name,
                    "Persisted new ACME account"
                );
                Ok(CachedAccount {
                    account,
                    record,
                    resource_version: stored.resource_version,
                })
            }
            Err(StoreError::AlreadyExists { .. }) => {
                warn!(
                    environment = %environment,
                    "ACME account was persisted concurrently, using the stored one"
                );
                self.load_existing(environment).await?.ok_or_else(|| {
                    CertmanError::Protocol(format!(
                        "{} account secret vanished after a concurrent create",
                        environment
                    ))
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn load_existing(
        &self,
        environment: CaEnvironment,
    ) -> CertmanResult<Option<CachedAccount>> {
        let name = environment.account_secret_name();
        let Some(secret) = self.secrets.find(&self.namespace, &name).await? else {
            return Ok(None);
        };

        let record = decode_record(&secret)?;
        let account = self
            .protocol
            .load_account(environment, &record.credentials_json)
            .await?;
        debug!(environment = %environment, secret = %name, "Loaded stored ACME account");

        Ok(Some(CachedAccount {
            account,
            record,
            resource_version: secret.resource_version,
        }))
    }

    /// Push the extended contact list to the CA, then persist it
    ///
    /// Nothing is stored when the CA rejects the update. One retry after a
    /// version conflict.
    async fn add_contact(
        &self,
        environment: CaEnvironment,
        cached: &mut CachedAccount,
        contact: String,
    ) -> CertmanResult<()> {
        for attempt in 0..2 {
            let mut record = cached.record.clone();
            if !record.contacts.contains(&contact) {
                record.contacts.push(contact.clone());
            }

            cached.account.update_contacts(&record.contacts).await?;
            record.updated = Utc::now();

            let mut secret = Secret::new(&self.namespace, environment.account_secret_name());
            secret
                .data
                .insert(ACCOUNT_FIELD.to_string(), encode_record(&record)?);
            secret.resource_version = cached.resource_version;

            match self.secrets.update(secret).await {
                Ok(stored) => {
                    info!(
                        environment = %environment,
                        contacts = ?record.contacts,
                        "Updated ACME account contacts"
                    );
                    cached.record = record;
                    cached.resource_version = stored.resource_version;
                    return Ok(());
                }
                Err(StoreError::Conflict { .. }) if attempt == 0 => {
                    debug!(environment = %environment, "Account secret changed, reloading");
                    let reloaded = self.load_existing(environment).await?.ok_or_else(|| {
                        CertmanError::Protocol(format!("{} account secret vanished", environment))
                    })?;
                    *cached = reloaded;
                    if cached.record.contacts.contains(&contact) {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(CertmanError::StoreConflict {
            kind: "account",
            name: environment.account_secret_name(),
        })
    }
}

fn encode_record(record: &AccountRecord) -> CertmanResult<String> {
    serde_json::to_string(record)
        .map_err(|e| CertmanError::Parse(format!("failed to encode account record: {}", e)))
}

fn decode_record(secret: &Secret) -> CertmanResult<AccountRecord> {
    let raw = secret.data.get(ACCOUNT_FIELD).ok_or_else(|| {
        CertmanError::Parse(format!(
            "secret '{}/{}' has no '{}' field",
            secret.namespace, secret.name, ACCOUNT_FIELD
        ))
    })?;
    serde_json::from_str(raw)
        .map_err(|e| CertmanError::Parse(format!("invalid account record: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::mock::{MockCa, MockCaOptions};
    use crate::store::MemorySecretStore;

    fn registry() -> (Arc<AccountRegistry>, MockCa, Arc<MemorySecretStore>) {
        let ca = MockCa::new(MockCaOptions::default());
        let secrets = Arc::new(MemorySecretStore::new());
        let registry = Arc::new(AccountRegistry::new(
            Arc::new(ca.clone()),
            secrets.clone(),
            "certman-operator",
        ));
        (registry, ca, secrets)
    }

    fn stored_record(secrets: &MemorySecretStore) -> AccountRecord {
        let secret = secrets
            .snapshot("certman-operator", "certman-acme-account-production")
            .unwrap();
        decode_record(&secret).unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_first_use_creates_one_account() {
        let (registry, ca, secrets) = registry();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry
                        .ensure_account(CaEnvironment::Production, "sre@example.com")
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(ca.state.lock().accounts_created, 1);
        assert_eq!(secrets.writes(), 1);
        assert_eq!(
            stored_record(&secrets).contacts,
            vec!["mailto:sre@example.com".to_string()]
        );
    }

    #[tokio::test]
    async fn test_new_email_is_appended() {
        let (registry, ca, secrets) = registry();
        registry
            .ensure_account(CaEnvironment::Production, "a@example.com")
            .await
            .unwrap();
        registry
            .ensure_account(CaEnvironment::Production, "b@example.com")
            .await
            .unwrap();
        registry
            .ensure_account(CaEnvironment::Production, "a@example.com")
            .await
            .unwrap();

        assert_eq!(
            stored_record(&secrets).contacts,
            vec![
                "mailto:a@example.com".to_string(),
                "mailto:b@example.com".to_string()
            ]
        );
        assert_eq!(ca.state.lock().contact_updates.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_contact_update_leaves_secret_untouched() {
        let ca = MockCa::new(MockCaOptions {
            fail_contact_updates: true,
            ..Default::default()
        });
        let secrets = Arc::new(MemorySecretStore::new());
        let registry = AccountRegistry::new(Arc::new(ca), secrets.clone(), "certman-operator");
        registry
            .ensure_account(CaEnvironment::Production, "a@example.com")
            .await
            .unwrap();
        let before = secrets
            .snapshot("certman-operator", "certman-acme-account-production")
            .unwrap();

        let err = registry
            .ensure_account(CaEnvironment::Production, "b@example.com")
            .await
            .unwrap_err();

        assert!(matches!(err, CertmanError::Protocol(_)));
        assert_eq!(
            secrets.snapshot("certman-operator", "certman-acme-account-production"),
            Some(before)
        );
        assert_eq!(
            stored_record(&secrets).contacts,
            vec!["mailto:a@example.com".to_string()]
        );
    }

    #[tokio::test]
    async fn test_stored_account_is_loaded() {
        let (first, _, secrets) = registry();
        first
            .ensure_account(CaEnvironment::Staging, "a@example.com")
            .await
            .unwrap();

        let ca = MockCa::new(MockCaOptions::default());
        let second = AccountRegistry::new(Arc::new(ca.clone()), secrets, "certman-operator");
        second
            .ensure_account(CaEnvironment::Staging, "a@example.com")
            .await
            .unwrap();

        let state = ca.state.lock();
        assert_eq!(state.accounts_created, 0);
        assert_eq!(state.accounts_loaded, 1);
    }

    #[tokio::test]
    async fn test_contact_update_retries_after_conflict() {
        let (registry, _, secrets) = registry();
        registry
            .ensure_account(CaEnvironment::Production, "a@example.com")
            .await
            .unwrap();

        // Another writer bumps the secret behind the cache's back
        let current = secrets
            .snapshot("certman-operator", "certman-acme-account-production")
            .unwrap();
        secrets.update(current).await.unwrap();

        registry
            .ensure_account(CaEnvironment::Production, "b@example.com")
            .await
            .unwrap();

        assert!(stored_record(&secrets)
            .contacts
            .contains(&"mailto:b@example.com".to_string()));
    }

    #[tokio::test]
    async fn test_environments_are_separate() {
        let (registry, ca, _) = registry();
        registry
            .ensure_account(CaEnvironment::Production, "a@example.com")
            .await
            .unwrap();
        registry
            .ensure_account(CaEnvironment::Staging, "a@example.com")
            .await
            .unwrap();
        assert_eq!(ca.state.lock().accounts_created, 2);
    }
}
