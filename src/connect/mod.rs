//! Connection resolution and management
//!
//! - `params.rs` - connection and credential descriptors
//! - `discovery.rs` / `credentials.rs` - collaborators that resolve keys
//! - `resolver.rs` - descriptor validation and connection string composition
//! - `connection.rs` - the shared, pooled connection

pub mod connection;
pub mod credentials;
pub mod discovery;
pub mod params;
pub mod resolver;

pub use connection::{DEFAULT_DATABASE, MongoDbConnection};
pub use credentials::{CredentialStore, MemoryCredentialStore};
pub use discovery::{Discovery, MemoryDiscovery};
pub use params::{ConnectionParams, CredentialParams};
pub use resolver::{MongoDbConnectionResolver, compose_uri, mask_password};
