use super::credentials::CredentialStore;
use super::discovery::Discovery;
use super::params::{ConnectionParams, CredentialParams};
use crate::config::ConfigParams;
use crate::context::CallContext;
use crate::error::{PersistenceError, Result, codes};
use crate::refer::References;
use std::fmt;
use std::sync::Arc;
use tracing::{Level, event};

/// Keys consumed by the URI itself, never passed as query options.
const RESERVED_KEYS: [&str; 8] = [
    "uri",
    "host",
    "port",
    "database",
    "username",
    "password",
    "discovery_key",
    "store_key",
];

/// Resolves configured connection and credential descriptors into a
/// MongoDB connection string.
///
/// # Examples
///
/// ```
/// use mongo_persistence::{CallContext, ConfigParams};
/// use mongo_persistence::connect::MongoDbConnectionResolver;
///
/// # #[tokio::main]
/// # async fn main() -> mongo_persistence::Result<()> {
/// let mut resolver = MongoDbConnectionResolver::new();
/// resolver.configure(&ConfigParams::from_tuples(&[
///     ("connection.host", "localhost"),
///     ("connection.port", "27017"),
///     ("connection.database", "test"),
/// ]));
/// let uri = resolver.resolve(&CallContext::new("123")).await?;
/// assert_eq!(uri, "mongodb://localhost:27017/test");
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct MongoDbConnectionResolver {
    connections: Vec<ConnectionParams>,
    credentials: Vec<CredentialParams>,
    discovery: Option<Arc<dyn Discovery>>,
    credential_store: Option<Arc<dyn CredentialStore>>,
}

impl fmt::Debug for MongoDbConnectionResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MongoDbConnectionResolver")
            .field("connections", &self.connections.len())
            .field("credentials", &self.credentials.len())
            .field("discovery", &self.discovery.is_some())
            .field("credential_store", &self.credential_store.is_some())
            .finish()
    }
}

impl MongoDbConnectionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the descriptors with the `connection(s)` and
    /// `credential(s)` blocks of `config`.
    pub fn configure(&mut self, config: &ConfigParams) {
        self.connections = ConnectionParams::many_from_config(config);
        self.credentials = CredentialParams::many_from_config(config);
    }

    pub fn set_references(&mut self, references: &References) {
        self.discovery = references.discovery();
        self.credential_store = references.credential_store();
    }

    pub fn add_connection(&mut self, connection: ConnectionParams) {
        self.connections.push(connection);
    }

    pub fn add_credential(&mut self, credential: CredentialParams) {
        self.credentials.push(credential);
    }

    pub fn connections(&self) -> &[ConnectionParams] {
        &self.connections
    }

    pub fn credentials(&self) -> &[CredentialParams] {
        &self.credentials
    }

    /// Resolve, validate and compose the connection string.
    pub async fn resolve(&self, ctx: &CallContext) -> Result<String> {
        let connections = self.resolve_connections(ctx).await?;
        validate_connections(ctx.trace_id(), &connections)?;
        let credential = self.lookup_credential(ctx).await;
        Ok(compose_uri(&connections, credential.as_ref()))
    }

    async fn resolve_connections(&self, ctx: &CallContext) -> Result<Vec<ConnectionParams>> {
        let mut resolved = Vec::with_capacity(self.connections.len());

        for connection in &self.connections {
            let Some(key) = connection.get_discovery_key() else {
                resolved.push(connection.clone());
                continue;
            };

            match &self.discovery {
                Some(discovery) => {
                    let found = ctx.run(discovery.resolve_all(ctx.trace_id(), key)).await?;
                    event!(
                        Level::DEBUG,
                        trace_id = ctx.trace_id(),
                        key,
                        found = found.len(),
                        "resolved connections through discovery"
                    );
                    resolved.extend(found.iter().map(|item| connection.merged_with(item)));
                }
                // Without a discovery service the descriptor can still stand on its own.
                None if connection.values().keys().any(|k| k != "discovery_key") => {
                    resolved.push(connection.clone());
                }
                None => {
                    return Err(PersistenceError::configuration(
                        ctx.trace_id(),
                        codes::CANNOT_RESOLVE,
                        format!("Discovery wasn't found to resolve connection key '{}'", key),
                    ));
                }
            }
        }

        Ok(resolved)
    }

    /// First usable credential. Lookup failures count as "no credential".
    async fn lookup_credential(&self, ctx: &CallContext) -> Option<CredentialParams> {
        if let Some(credential) = self.credentials.iter().find(|c| !c.uses_credential_store()) {
            return Some(credential.clone());
        }

        for credential in &self.credentials {
            let key = credential.get_store_key()?;
            let Some(store) = &self.credential_store else {
                event!(
                    Level::DEBUG,
                    trace_id = ctx.trace_id(),
                    key,
                    "credential store wasn't found to make lookup"
                );
                return None;
            };
            match ctx.run(store.lookup(ctx.trace_id(), key)).await {
                Ok(Some(found)) => return Some(found),
                Ok(None) => continue,
                Err(err) => {
                    event!(
                        Level::DEBUG,
                        trace_id = ctx.trace_id(),
                        key,
                        error = %err,
                        "credential lookup failed"
                    );
                    return None;
                }
            }
        }
        None
    }
}

fn validate_connections(trace_id: &str, connections: &[ConnectionParams]) -> Result<()> {
    if connections.is_empty() {
        return Err(PersistenceError::configuration(
            trace_id,
            codes::NO_CONNECTION,
            "Database connection is not set",
        ));
    }

    for connection in connections {
        if connection.get_uri().is_some() {
            continue;
        }
        if connection.get_host().is_none() {
            return Err(PersistenceError::configuration(
                trace_id,
                codes::NO_HOST,
                "Connection host is not set",
            ));
        }
        if connection.get_port() == 0 {
            return Err(PersistenceError::configuration(
                trace_id,
                codes::NO_PORT,
                "Connection port is not set",
            ));
        }
        if connection.get_database().is_none() {
            return Err(PersistenceError::configuration(
                trace_id,
                codes::NO_DATABASE,
                "Connection database is not set",
            ));
        }
    }
    Ok(())
}

/// Compose `mongodb://[user[:pass]@]host1[:port1][,host2...][/database][?options]`.
///
/// The first descriptor carrying a literal `uri` wins outright. Options are
/// the pass-through fields of all connections, then of the credential, with
/// later values overriding earlier ones, listed in key order.
pub fn compose_uri(
    connections: &[ConnectionParams],
    credential: Option<&CredentialParams>,
) -> String {
    let mut hosts = Vec::with_capacity(connections.len());
    let mut database = None;
    let mut options = ConfigParams::new();

    for connection in connections {
        if let Some(uri) = connection.get_uri() {
            return uri.to_string();
        }

        let host = connection.get_host().unwrap_or_default();
        match connection.get_port() {
            0 => hosts.push(host.to_string()),
            port => hosts.push(format!("{}:{}", host, port)),
        }

        if database.is_none() {
            database = connection.get_database();
        }
        for (key, value) in connection.values().iter() {
            options.set(key, value);
        }
    }

    let mut auth = String::new();
    if let Some(credential) = credential {
        if let Some(username) = credential.get_username() {
            auth = match credential.get_password() {
                Some(password) => format!("{}:{}@", username, password),
                None => format!("{}@", username),
            };
        }
        for (key, value) in credential.values().iter() {
            options.set(key, value);
        }
    }

    for key in RESERVED_KEYS {
        options.remove(key);
    }

    let params = options
        .iter()
        .map(|(key, value)| {
            if value.is_empty() {
                key.to_string()
            } else {
                format!("{}={}", key, value)
            }
        })
        .collect::<Vec<_>>()
        .join("&");

    let mut uri = format!("mongodb://{}{}", auth, hosts.join(","));
    if let Some(database) = database {
        uri.push('/');
        uri.push_str(database);
    }
    if !params.is_empty() {
        uri.push('?');
        uri.push_str(&params);
    }
    uri
}

/// Split a connection string into scheme, authority and the path/query tail.
///
/// Passwords are written unescaped and may contain `/` or `?`, so the
/// authority runs up to the first `/` or `?` after the last `@`.
pub(crate) fn split_authority(uri: &str) -> Option<(&str, &str, &str)> {
    let (scheme, rest) = uri.split_once("://")?;
    let hosts_start = rest.rfind('@').map_or(0, |at| at + 1);
    let authority_end = rest[hosts_start..]
        .find(['/', '?'])
        .map_or(rest.len(), |end| hosts_start + end);
    let (authority, tail) = rest.split_at(authority_end);
    Some((scheme, authority, tail))
}

/// Replace the password of a connection string with `***`.
pub fn mask_password(uri: &str) -> String {
    let Some((scheme, authority, tail)) = split_authority(uri) else {
        return uri.to_string();
    };

    match authority.rsplit_once('@') {
        Some((userinfo, hosts)) => match userinfo.split_once(':') {
            Some((user, _)) => format!("{}://{}:***@{}{}", scheme, user, hosts, tail),
            None => uri.to_string(),
        },
        None => uri.to_string(),
    }
}
