//! Document database driver seam
//!
//! The persistence components never talk to the network themselves. They go
//! through these traits, which mirror the small subset of a MongoDB driver
//! they need: connect, select a database, bind a collection and run CRUD
//! commands against it.
//!
//! - `memory` - in-process implementation with MongoDB-compatible filters

pub mod memory;

use crate::config::ConfigParams;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryDriver;

/// Internal (storage) representation of an item.
pub type Document = serde_json::Map<String, Value>;

/// Stream of raw documents produced by `find`.
pub type DocumentCursor = BoxStream<'static, Result<Document, DriverError>>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error("Failed to connect: {0}")]
    Connect(String),

    #[error("Client is closed")]
    ClientClosed,

    #[error("Duplicate key in collection '{collection}' for index '{index}'")]
    DuplicateKey { collection: String, index: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A single raw document could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Command failed: {0}")]
    Command(String),
}

/// Client-level settings taken from the `options.*` configuration section.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub max_pool_size: u32,
    pub connect_timeout: Duration,
    pub socket_timeout: Duration,
    pub keep_alive: bool,
    pub replica_set: Option<String>,
    pub auth_source: Option<String>,
    pub ssl: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            max_pool_size: 2,
            connect_timeout: Duration::from_millis(5000),
            socket_timeout: Duration::from_millis(360_000),
            keep_alive: true,
            replica_set: None,
            auth_source: None,
            ssl: false,
        }
    }
}

impl ConnectOptions {
    pub fn from_config(config: &ConfigParams) -> Self {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| {
            config
                .get_as_nullable_integer(key)
                .filter(|v| *v > 0)
                .map(|v| Duration::from_millis(v as u64))
                .unwrap_or(default)
        };
        let non_empty = |key: &str| {
            config
                .get(key)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        Self {
            max_pool_size: config
                .get_as_nullable_integer("options.max_pool_size")
                .filter(|v| *v > 0)
                .map(|v| v as u32)
                .unwrap_or(defaults.max_pool_size),
            connect_timeout: millis("options.connect_timeout", defaults.connect_timeout),
            socket_timeout: millis("options.socket_timeout", defaults.socket_timeout),
            keep_alive: config.get_as_boolean_with_default("options.keep_alive", defaults.keep_alive),
            replica_set: non_empty("options.replica_set"),
            auth_source: non_empty("options.auth_source"),
            ssl: config.get_as_boolean_with_default("options.ssl", defaults.ssl),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub skip: Option<u64>,
    pub limit: Option<i64>,
    pub sort: Option<Document>,
    pub projection: Option<Document>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReturnDocument {
    Before,
    #[default]
    After,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindOneAndModifyOptions {
    pub upsert: bool,
    pub return_document: ReturnDocument,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexOptions {
    pub name: Option<String>,
    pub unique: bool,
    pub sparse: bool,
    pub background: bool,
}

impl IndexOptions {
    pub fn unique() -> Self {
        Self {
            unique: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexModel {
    pub keys: Document,
    pub options: IndexOptions,
}

impl IndexModel {
    pub fn new(keys: Document, options: IndexOptions) -> Self {
        Self { keys, options }
    }

    /// Explicit name, or the driver convention `field_dir[_field_dir...]`.
    pub fn name(&self) -> String {
        if let Some(name) = &self.options.name {
            return name.clone();
        }
        self.keys
            .iter()
            .map(|(field, dir)| match dir {
                Value::String(s) => format!("{}_{}", field, s),
                other => format!("{}_{}", field, other),
            })
            .collect::<Vec<_>>()
            .join("_")
    }
}

#[async_trait]
pub trait DocumentDriver: Send + Sync {
    /// Establish a pooled client for `uri`.
    async fn connect(
        &self,
        uri: &str,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn DriverClient>, DriverError>;
}

#[async_trait]
pub trait DriverClient: Send + Sync {
    fn database(&self, name: &str) -> Arc<dyn DriverDatabase>;

    async fn close(&self) -> Result<(), DriverError>;
}

pub trait DriverDatabase: Send + Sync {
    fn name(&self) -> &str;

    /// `None` when the collection handle cannot be obtained.
    fn collection(&self, name: &str) -> Option<Arc<dyn DriverCollection>>;
}

#[async_trait]
pub trait DriverCollection: Send + Sync {
    fn name(&self) -> &str;

    async fn find(&self, filter: Document, options: FindOptions)
    -> Result<DocumentCursor, DriverError>;

    async fn find_one(&self, filter: Document) -> Result<Option<Document>, DriverError>;

    /// Returns the `_id` of the inserted document.
    async fn insert_one(&self, document: Document) -> Result<Value, DriverError>;

    async fn find_one_and_replace(
        &self,
        filter: Document,
        replacement: Document,
        options: FindOneAndModifyOptions,
    ) -> Result<Option<Document>, DriverError>;

    async fn find_one_and_update(
        &self,
        filter: Document,
        update: Document,
        options: FindOneAndModifyOptions,
    ) -> Result<Option<Document>, DriverError>;

    async fn find_one_and_delete(&self, filter: Document) -> Result<Option<Document>, DriverError>;

    async fn delete_many(&self, filter: Document) -> Result<u64, DriverError>;

    async fn count_documents(&self, filter: Document) -> Result<u64, DriverError>;

    /// Returns the names of the created indexes.
    async fn create_indexes(&self, indexes: Vec<IndexModel>) -> Result<Vec<String>, DriverError>;

    async fn drop_collection(&self) -> Result<(), DriverError>;
}
