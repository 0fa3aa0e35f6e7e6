//! Entity adapters and fixtures shared by the persistence tests.
#![allow(dead_code)]

use mongo_persistence::driver::{Document, DocumentDriver, IndexOptions, MemoryDriver};
use mongo_persistence::{
    CallContext, ConfigParams, DataPage, FilterParams, Identifiable,
    IdentifiableMongoDbPersistence, PagingParams, PersistenceOverrides, Result, SchemaBuilder,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dummy {
    pub id: String,
    pub key: String,
    pub content: String,
}

impl Dummy {
    pub fn new(id: &str, key: &str, content: &str) -> Self {
        Self {
            id: id.to_string(),
            key: key.to_string(),
            content: content.to_string(),
        }
    }
}

impl Identifiable<String> for Dummy {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

impl Identifiable<String> for Box<Dummy> {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UuidDummy {
    pub id: Uuid,
    pub key: String,
}

impl Identifiable<Uuid> for UuidDummy {
    fn id(&self) -> Uuid {
        self.id
    }

    fn set_id(&mut self, id: Uuid) {
        self.id = id;
    }
}

pub fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap_or_default()
}

pub fn memory_config() -> ConfigParams {
    ConfigParams::from_tuples(&[
        ("connection.host", "localhost"),
        ("connection.port", "27017"),
        ("connection.database", "test"),
    ])
}

fn key_filter(filter: &FilterParams) -> Document {
    match filter.get("key") {
        Some(key) => doc(json!({ "key": key })),
        None => Document::new(),
    }
}

/// Unique index on `key`.
pub struct DummySchema;

impl<T> PersistenceOverrides<T> for DummySchema
where
    T: Serialize + serde::de::DeserializeOwned,
{
    fn define_schema(&self, schema: &mut SchemaBuilder) {
        schema.ensure_index(doc(json!({ "key": 1 })), IndexOptions::unique());
    }
}

macro_rules! dummy_adapter {
    ($name:ident, $item:ty, $key:ty, $collection:expr) => {
        pub struct $name {
            inner: IdentifiableMongoDbPersistence<$item, $key>,
        }

        impl $name {
            pub fn new(driver: Arc<dyn DocumentDriver>) -> Self {
                Self {
                    inner: IdentifiableMongoDbPersistence::with_overrides(
                        $collection,
                        driver,
                        Arc::new(DummySchema),
                    ),
                }
            }

            pub async fn get_page_by_filter(
                &self,
                ctx: &CallContext,
                filter: FilterParams,
                paging: PagingParams,
            ) -> Result<DataPage<$item>> {
                self.inner
                    .get_page_by_filter(
                        ctx,
                        key_filter(&filter),
                        &paging,
                        Some(doc(json!({ "key": -1 }))),
                        None,
                    )
                    .await
            }

            pub async fn get_count_by_filter(
                &self,
                ctx: &CallContext,
                filter: FilterParams,
            ) -> Result<i64> {
                self.inner.get_count_by_filter(ctx, key_filter(&filter)).await
            }
        }

        impl Deref for $name {
            type Target = IdentifiableMongoDbPersistence<$item, $key>;

            fn deref(&self) -> &Self::Target {
                &self.inner
            }
        }

        impl DerefMut for $name {
            fn deref_mut(&mut self) -> &mut Self::Target {
                &mut self.inner
            }
        }
    };
}

dummy_adapter!(DummyMongoDbPersistence, Dummy, String, "dummies");
dummy_adapter!(DummyRefMongoDbPersistence, Box<Dummy>, String, "dummies_ref");
dummy_adapter!(DummyMapMongoDbPersistence, Document, String, "dummies_map");
dummy_adapter!(DummyUuidMongoDbPersistence, UuidDummy, Uuid, "dummies_uuid");

/// Configured and opened adapter over a fresh memory driver.
pub async fn open_dummies(driver: &MemoryDriver) -> DummyMongoDbPersistence {
    let mut persistence = DummyMongoDbPersistence::new(Arc::new(driver.clone()));
    persistence.configure(&memory_config());
    persistence
        .open(&CallContext::new("open"))
        .await
        .expect("persistence opens");
    persistence
}

pub fn dummy1() -> Dummy {
    Dummy::new("", "Key 1", "Content 1")
}

pub fn dummy2() -> Dummy {
    Dummy::new("", "Key 2", "Content 2")
}
