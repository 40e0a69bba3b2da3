//! File-backed secret store
//!
//! # Directory Structure
//!
//! ```text
//! storage/
//! └── <namespace>/
//!     ├── primary-cert.json       # one secret: data, labels, resource version
//!     └── certman-acme-account-production.json
//! ```
//!
//! Every write goes to a temporary file in the same directory and is renamed
//! into place, so a reader sees either the old secret or the new one, never a
//! mix.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use super::{Secret, SecretStore, StoreError, StoreResult, SECRET_KIND};

/// Secret store persisting one JSON file per secret
#[derive(Debug)]
pub struct FileSecretStore {
    base_path: PathBuf,
    /// Serialises version check and write
    write_lock: Mutex<()>,
}

impl FileSecretStore {
    /// Open a store rooted at `base_path`, creating it with mode 0700
    pub async fn open(base_path: impl AsRef<Path>) -> StoreResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&base_path).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&base_path, std::fs::Permissions::from_mode(0o700)).await?;
        }

        info!(storage_path = %base_path.display(), "Initialized file secret store");
        Ok(Self {
            base_path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn secret_path(&self, namespace: &str, name: &str) -> StoreResult<PathBuf> {
        for part in [namespace, name] {
            if part.is_empty() || part.contains(['/', '\\']) || part == "." || part == ".." {
                return Err(StoreError::Backend(format!(
                    "invalid secret path component '{}'",
                    part
                )));
            }
        }
        Ok(self.base_path.join(namespace).join(format!("{}.json", name)))
    }

    async fn read(&self, namespace: &str, name: &str) -> StoreResult<Option<Secret>> {
        let path = self.secret_path(namespace, name)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let secret: Secret = serde_json::from_str(&content)?;
                trace!(path = %path.display(), "Read secret");
                Ok(Some(secret))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, secret: &Secret) -> StoreResult<()> {
        let path = self.secret_path(&secret.namespace, &secret.name)?;
        let dir = self.base_path.join(&secret.namespace);
        tokio::fs::create_dir_all(&dir).await?;

        let tmp = dir.join(format!(".{}.json.tmp", secret.name));
        let content = serde_json::to_vec_pretty(secret)?;
        tokio::fs::write(&tmp, content).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }

        tokio::fs::rename(&tmp, &path).await?;
        debug!(
            namespace = %secret.namespace,
            name = %secret.name,
            version = secret.resource_version,
            "Wrote secret"
        );
        Ok(())
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Secret> {
        self.read(namespace, name)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                kind: SECRET_KIND,
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn create(&self, mut secret: Secret) -> StoreResult<Secret> {
        let _guard = self.write_lock.lock().await;
        if self.read(&secret.namespace, &secret.name).await?.is_some() {
            return Err(StoreError::AlreadyExists {
                kind: SECRET_KIND,
                name: secret.name,
            });
        }
        secret.resource_version = 1;
        self.write(&secret).await?;
        Ok(secret)
    }

    async fn update(&self, mut secret: Secret) -> StoreResult<Secret> {
        let _guard = self.write_lock.lock().await;
        let Some(current) = self.read(&secret.namespace, &secret.name).await? else {
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
        secret.resource_version = current.resource_version + 1;
        self.write(&secret).await?;
        Ok(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup_store() -> (TempDir, FileSecretStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSecretStore::open(temp_dir.path()).await.unwrap();
        (temp_dir, store)
    }

    fn secret() -> Secret {
        let mut secret = Secret::new("cluster-ns", "primary-cert");
        secret.data.insert("tls.crt".to_string(), "chain".to_string());
        secret.data.insert("tls.key".to_string(), "key".to_string());
        secret
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (_temp_dir, store) = setup_store().await;
        let created = store.create(secret()).await.unwrap();
        assert_eq!(created.resource_version, 1);

        let loaded = store.get("cluster-ns", "primary-cert").await.unwrap();
        assert_eq!(loaded, created);
    }

    #[tokio::test]
    async fn test_update_requires_current_version() {
        let (_temp_dir, store) = setup_store().await;
        let created = store.create(secret()).await.unwrap();

        let mut newer = created.clone();
        newer.data.insert("tls.crt".to_string(), "chain-2".to_string());
        let newer = store.update(newer).await.unwrap();
        assert_eq!(newer.resource_version, 2);

        let err = store.update(created).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_missing_secret() {
        let (_temp_dir, store) = setup_store().await;
        assert!(matches!(
            store.get("ns", "nope").await.unwrap_err(),
            StoreError::NotFound { .. }
        ));
        assert!(store.find("ns", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let (_temp_dir, store) = setup_store().await;
        assert!(store.get("..", "x").await.is_err());
        assert!(store.get("ns", "a/b").await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_secret_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let (temp_dir, store) = setup_store().await;
        store.create(secret()).await.unwrap();

        let path = temp_dir.path().join("cluster-ns").join("primary-cert.json");
        let mode = std::fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
