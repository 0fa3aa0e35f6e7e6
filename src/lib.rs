// ============================================================================
// MongoDB persistence components
// ============================================================================

pub mod config;
pub mod connect;
pub mod context;
pub mod driver;
pub mod error;
pub mod persistence;
pub mod refer;

// Re-export main types for convenience
pub use config::ConfigParams;
pub use context::CallContext;
pub use error::{PersistenceError, Result};
pub use refer::References;

pub use connect::{
    ConnectionParams, CredentialParams, MongoDbConnection, MongoDbConnectionResolver,
};
pub use persistence::{
    AnyValueMap, DataPage, DefaultOverrides, FilterParams, Identifiable,
    IdentifiableMongoDbPersistence, IdentityKey, MongoDbPersistence, PagingParams,
    PersistenceOverrides, SchemaBuilder,
};
