//! Typed persistence over MongoDB collections
//!
//! - `engine.rs` - open/close lifecycle, paging and filtering
//! - `identifiable.rs` - point operations by identifier
//! - `convert.rs` - public/stored document conversion and schema hooks
//! - `data.rs` - paging requests and result pages

pub mod convert;
pub mod data;
pub mod engine;
pub mod identifiable;

pub use convert::{DefaultOverrides, PersistenceOverrides, SchemaBuilder};
pub use data::{AnyValueMap, DataPage, FilterParams, PagingParams};
pub use engine::{ConnectionOwnership, MongoDbPersistence, PersistenceState};
pub use identifiable::{Identifiable, IdentifiableMongoDbPersistence, IdentityKey};
