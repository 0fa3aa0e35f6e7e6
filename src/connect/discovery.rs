use super::params::ConnectionParams;
use crate::config::ConfigParams;
use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

/// Discovery service that maps a key to connection descriptors.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn register(&self, trace_id: &str, key: &str, connection: ConnectionParams) -> Result<()>;

    async fn resolve_one(&self, trace_id: &str, key: &str) -> Result<Option<ConnectionParams>>;

    async fn resolve_all(&self, trace_id: &str, key: &str) -> Result<Vec<ConnectionParams>>;
}

/// Discovery backed by an in-process registry.
///
/// Configured with one section per key:
///
/// ```text
/// key1.host = localhost
/// key1.port = 27017
/// key1.database = test
/// ```
#[derive(Debug, Default)]
pub struct MemoryDiscovery {
    items: RwLock<Vec<(String, ConnectionParams)>>,
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ConfigParams) -> Self {
        let items = config
            .get_section_names()
            .into_iter()
            .map(|key| {
                let connection = ConnectionParams::from_config(config.get_section(&key));
                (key, connection)
            })
            .collect();
        Self {
            items: RwLock::new(items),
        }
    }
}

#[async_trait]
impl Discovery for MemoryDiscovery {
    async fn register(&self, _trace_id: &str, key: &str, connection: ConnectionParams) -> Result<()> {
        self.items.write().await.push((key.to_string(), connection));
        Ok(())
    }

    async fn resolve_one(&self, _trace_id: &str, key: &str) -> Result<Option<ConnectionParams>> {
        let items = self.items.read().await;
        Ok(items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, connection)| connection.clone()))
    }

    async fn resolve_all(&self, _trace_id: &str, key: &str) -> Result<Vec<ConnectionParams>> {
        let items = self.items.read().await;
        Ok(items
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, connection)| connection.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolves_registered_connections() {
        let discovery = MemoryDiscovery::from_config(&ConfigParams::from_tuples(&[
            ("key1.host", "h1"),
            ("key1.port", "27017"),
        ]));
        discovery
            .register("123", "key1", ConnectionParams::new().host("h2"))
            .await
            .unwrap();

        let all = discovery.resolve_all("123", "key1").await.unwrap();
        assert_eq!(all.len(), 2);
        let first = discovery.resolve_one("123", "key1").await.unwrap().unwrap();
        assert_eq!(first.get_host(), Some("h1"));
        assert!(discovery.resolve_one("123", "key2").await.unwrap().is_none());
    }
}
