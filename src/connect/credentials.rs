use super::params::CredentialParams;
use crate::config::ConfigParams;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Secure storage for credential descriptors.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Store a credential under `key`; `None` removes it.
    async fn store(&self, trace_id: &str, key: &str, credential: Option<CredentialParams>)
    -> Result<()>;

    async fn lookup(&self, trace_id: &str, key: &str) -> Result<Option<CredentialParams>>;
}

/// Credential store kept in process memory.
///
/// Configured with one section per key, e.g. `user1.username` and
/// `user1.password`.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    items: RwLock<HashMap<String, CredentialParams>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ConfigParams) -> Self {
        let items = config
            .get_section_names()
            .into_iter()
            .map(|key| {
                let credential = CredentialParams::from_config(config.get_section(&key));
                (key, credential)
            })
            .collect();
        Self {
            items: RwLock::new(items),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn store(
        &self,
        _trace_id: &str,
        key: &str,
        credential: Option<CredentialParams>,
    ) -> Result<()> {
        let mut items = self.items.write().await;
        match credential {
            Some(credential) => {
                items.insert(key.to_string(), credential);
            }
            None => {
                items.remove(key);
            }
        }
        Ok(())
    }

    async fn lookup(&self, _trace_id: &str, key: &str) -> Result<Option<CredentialParams>> {
        Ok(self.items.read().await.get(key).cloned())
    }
}
