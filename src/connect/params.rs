use crate::config::ConfigParams;

/// Connection descriptor
///
/// Either a literal `uri`, or `host` + `port` + `database`, optionally
/// replaced by a `discovery_key` lookup. Any other field is passed through to
/// the composed connection string as a query option.
///
/// # Examples
///
/// ```
/// use mongo_persistence::connect::ConnectionParams;
///
/// let connection = ConnectionParams::new()
///     .host("localhost")
///     .port(27017)
///     .database("test")
///     .param("replicaSet", "rs0");
/// assert_eq!(connection.get_port(), 27017);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionParams {
    values: ConfigParams,
}

impl ConnectionParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(values: ConfigParams) -> Self {
        Self { values }
    }

    /// Set the host
    pub fn host(mut self, host: &str) -> Self {
        self.values.set("host", host);
        self
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.values.set("port", port.to_string());
        self
    }

    /// Set the database name
    pub fn database(mut self, database: &str) -> Self {
        self.values.set("database", database);
        self
    }

    /// Set a literal connection string
    pub fn uri(mut self, uri: &str) -> Self {
        self.values.set("uri", uri);
        self
    }

    /// Resolve this descriptor through discovery under `key`
    pub fn discovery_key(mut self, key: &str) -> Self {
        self.values.set("discovery_key", key);
        self
    }

    /// Set a pass-through option
    pub fn param(mut self, key: &str, value: &str) -> Self {
        self.values.set(key, value);
        self
    }

    pub fn get_host(&self) -> Option<&str> {
        self.non_empty("host")
    }

    /// Port number, `0` when missing or not a valid port.
    pub fn get_port(&self) -> u16 {
        self.values
            .get("port")
            .and_then(|p| p.trim().parse::<u16>().ok())
            .unwrap_or(0)
    }

    pub fn get_database(&self) -> Option<&str> {
        self.non_empty("database")
    }

    pub fn get_uri(&self) -> Option<&str> {
        self.non_empty("uri")
    }

    pub fn get_discovery_key(&self) -> Option<&str> {
        self.non_empty("discovery_key")
    }

    pub fn uses_discovery(&self) -> bool {
        self.get_discovery_key().is_some()
    }

    pub fn values(&self) -> &ConfigParams {
        &self.values
    }

    /// Copy of this descriptor with `other`'s fields layered on top.
    pub fn merged_with(&self, other: &ConnectionParams) -> ConnectionParams {
        Self {
            values: other.values.set_defaults(&self.values),
        }
    }

    /// Reads `connections.<name>.*` blocks, or the single `connection.*`
    /// block when there are none.
    pub fn many_from_config(config: &ConfigParams) -> Vec<ConnectionParams> {
        many_from_sections(config, "connections", "connection")
            .into_iter()
            .map(Self::from_config)
            .collect()
    }

    fn non_empty(&self, key: &str) -> Option<&str> {
        self.values.get(key).filter(|v| !v.is_empty())
    }
}

/// Credential descriptor: `username`, `password`, an optional `store_key`
/// and pass-through options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialParams {
    values: ConfigParams,
}

impl CredentialParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(values: ConfigParams) -> Self {
        Self { values }
    }

    pub fn username(mut self, username: &str) -> Self {
        self.values.set("username", username);
        self
    }

    pub fn password(mut self, password: &str) -> Self {
        self.values.set("password", password);
        self
    }

    /// Look the credential up in a credential store under `key`
    pub fn store_key(mut self, key: &str) -> Self {
        self.values.set("store_key", key);
        self
    }

    pub fn param(mut self, key: &str, value: &str) -> Self {
        self.values.set(key, value);
        self
    }

    pub fn get_username(&self) -> Option<&str> {
        self.non_empty("username")
    }

    pub fn get_password(&self) -> Option<&str> {
        self.non_empty("password")
    }

    pub fn get_store_key(&self) -> Option<&str> {
        self.non_empty("store_key")
    }

    pub fn uses_credential_store(&self) -> bool {
        self.get_store_key().is_some()
    }

    pub fn values(&self) -> &ConfigParams {
        &self.values
    }

    /// Reads `credentials.<name>.*` blocks, or the single `credential.*`
    /// block when there are none.
    pub fn many_from_config(config: &ConfigParams) -> Vec<CredentialParams> {
        many_from_sections(config, "credentials", "credential")
            .into_iter()
            .map(Self::from_config)
            .collect()
    }

    fn non_empty(&self, key: &str) -> Option<&str> {
        self.values.get(key).filter(|v| !v.is_empty())
    }
}

fn many_from_sections(config: &ConfigParams, plural: &str, single: &str) -> Vec<ConfigParams> {
    let many = config.get_section(plural);
    let blocks: Vec<ConfigParams> = many
        .get_section_names()
        .iter()
        .map(|name| many.get_section(name))
        .filter(|block| !block.is_empty())
        .collect();
    if !blocks.is_empty() {
        return blocks;
    }

    let block = config.get_section(single);
    if block.is_empty() {
        Vec::new()
    } else {
        vec![block]
    }
}
