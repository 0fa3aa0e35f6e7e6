//! Component references
//!
//! A small keyed registry that components use to locate their collaborators:
//! a discovery service, a credential store, or a shared database connection.

use crate::connect::{CredentialStore, Discovery};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Key of the discovery service.
pub const DISCOVERY: &str = "discovery";
/// Key of the credential store.
pub const CREDENTIAL_STORE: &str = "credential-store";
/// Default key of a shared `MongoDbConnection`.
pub const DEFAULT_CONNECTION: &str = "connection:mongodb";

type Component = Arc<dyn Any + Send + Sync>;

#[derive(Clone, Default)]
pub struct References {
    components: HashMap<String, Component>,
}

impl References {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<C: Any + Send + Sync>(&mut self, key: &str, component: Arc<C>) {
        self.components.insert(key.to_string(), component);
    }

    /// Builder form of [`References::put`]
    pub fn with<C: Any + Send + Sync>(mut self, key: &str, component: Arc<C>) -> Self {
        self.put(key, component);
        self
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.components.remove(key).is_some()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.components.contains_key(key)
    }

    /// Component registered under `key`, if it has type `C`.
    pub fn get_one_optional<C: Any + Send + Sync>(&self, key: &str) -> Option<Arc<C>> {
        self.components
            .get(key)
            .cloned()
            .and_then(|component| component.downcast::<C>().ok())
    }

    pub fn put_discovery(&mut self, discovery: Arc<dyn Discovery>) {
        self.put(DISCOVERY, Arc::new(discovery));
    }

    pub fn discovery(&self) -> Option<Arc<dyn Discovery>> {
        self.get_one_optional::<Arc<dyn Discovery>>(DISCOVERY)
            .map(|discovery| Arc::clone(&*discovery))
    }

    pub fn put_credential_store(&mut self, store: Arc<dyn CredentialStore>) {
        self.put(CREDENTIAL_STORE, Arc::new(store));
    }

    pub fn credential_store(&self) -> Option<Arc<dyn CredentialStore>> {
        self.get_one_optional::<Arc<dyn CredentialStore>>(CREDENTIAL_STORE)
            .map(|store| Arc::clone(&*store))
    }
}

impl fmt::Debug for References {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.components.keys().collect();
        keys.sort();
        f.debug_struct("References").field("keys", &keys).finish()
    }
}
