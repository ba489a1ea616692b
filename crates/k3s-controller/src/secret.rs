//! Keyed secret persistence used by the credential chain.
use std::collections::BTreeMap;
use std::sync::Mutex;

use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, PostParams};
use kube::ResourceExt;
use tracing::debug;

use crate::error::{Error, Result};

/// What happened when a secret was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Created {
    /// The secret did not exist and was written.
    Created,
    /// Someone else wrote it first; nothing was changed.
    AlreadyExists,
}

/// Create-if-absent secret storage.
///
/// `get` distinguishes "not found" (`Ok(None)`) from every other failure.
/// `create` must never overwrite an existing secret.
#[async_trait::async_trait]
pub trait SecretStore: Send + Sync {
    /// Looks up a secret by namespace and name.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Creates a secret unless one with the same name already exists.
    async fn create(&self, secret: &Secret) -> Result<Created>;
}

/// [`SecretStore`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeSecretStore {
    client: kube::Client,
}

impl KubeSecretStore {
    pub fn new(client: kube::Client) -> Self {
        KubeSecretStore { client }
    }
}

#[async_trait::async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match secrets.get(name).await.map_err(Error::from) {
            Ok(secret) => Ok(Some(secret)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create(&self, secret: &Secret) -> Result<Created> {
        let namespace = secret
            .metadata
            .namespace
            .as_deref()
            .ok_or(Error::MissingMetadata("secret namespace"))?;
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match secrets
            .create(&PostParams::default(), secret)
            .await
            .map_err(Error::from)
        {
            Ok(_) => Ok(Created::Created),
            Err(e) if e.is_conflict() => {
                debug!(
                    name = %secret.name(),
                    namespace,
                    "Secret already existed, leaving it untouched"
                );
                Ok(Created::AlreadyExists)
            }
            Err(e) => Err(e),
        }
    }
}

/// In-process [`SecretStore`]. Useful for tests and dry runs.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<BTreeMap<(String, String), Secret>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a secret, the way an apply would.
    pub fn put(&self, secret: Secret) {
        let key = key_of(&secret);
        self.lock().insert(key, secret);
    }

    /// Removes a secret, returning it if it existed.
    pub fn remove(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.lock()
            .remove(&(namespace.to_string(), name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, String), Secret>> {
        // A poisoned map still holds consistent data; every write is a single insert.
        self.secrets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn key_of(secret: &Secret) -> (String, String) {
    (
        secret.metadata.namespace.clone().unwrap_or_default(),
        secret.metadata.name.clone().unwrap_or_default(),
    )
}

#[async_trait::async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create(&self, secret: &Secret) -> Result<Created> {
        let mut secrets = self.lock();
        let key = key_of(secret);
        if secrets.contains_key(&key) {
            return Ok(Created::AlreadyExists);
        }
        secrets.insert(key, secret.clone());
        Ok(Created::Created)
    }
}

/// Reads a UTF-8 value out of a secret's data.
pub(crate) fn data_string(secret: &Secret, key: &str) -> Result<String> {
    let invalid = |reason: String| Error::InvalidSecret {
        namespace: secret.metadata.namespace.clone().unwrap_or_default(),
        name: secret.metadata.name.clone().unwrap_or_default(),
        reason,
    };
    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .ok_or_else(|| invalid(format!("missing key {}", key)))?;
    String::from_utf8(bytes.0.clone()).map_err(|e| invalid(format!("key {}: {}", key, e)))
}

/// Raw bytes stored under `key`, if any.
pub(crate) fn data_bytes<'a>(secret: &'a Secret, key: &str) -> Option<&'a [u8]> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|value| value.0.as_slice())
}
