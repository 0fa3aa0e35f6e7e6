use super::convert::{INTERNAL_ID_FIELD, PUBLIC_ID_FIELD, PersistenceOverrides, to_internal_document};
use super::data::AnyValueMap;
use super::engine::MongoDbPersistence;
use crate::context::CallContext;
use crate::driver::{Document, DocumentDriver, FindOneAndModifyOptions, ReturnDocument};
use crate::error::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::fmt::Display;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::{Level, event};
use uuid::Uuid;

/// Identifier type of a stored item.
pub trait IdentityKey: Clone + Display + Serialize + Send + Sync + 'static {
    /// `true` for the empty / zero identifier.
    fn is_unset(&self) -> bool;

    fn generate() -> Self;
}

impl IdentityKey for String {
    fn is_unset(&self) -> bool {
        self.is_empty()
    }

    /// 32 lower-case hex characters
    fn generate() -> Self {
        Uuid::new_v4().simple().to_string()
    }
}

impl IdentityKey for Uuid {
    fn is_unset(&self) -> bool {
        self.is_nil()
    }

    fn generate() -> Self {
        Uuid::new_v4()
    }
}

/// Items that carry their own identifier.
pub trait Identifiable<K> {
    fn id(&self) -> K;

    fn set_id(&mut self, id: K);
}

/// Map items keep their identifier under `id`, matched case-insensitively.
impl Identifiable<String> for Document {
    fn id(&self) -> String {
        self.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(PUBLIC_ID_FIELD))
            .and_then(|(_, value)| match value {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .unwrap_or_default()
    }

    fn set_id(&mut self, id: String) {
        self.retain(|key, _| !key.eq_ignore_ascii_case(PUBLIC_ID_FIELD));
        self.insert(PUBLIC_ID_FIELD.to_string(), Value::String(id));
    }
}

fn id_filter<K: Serialize>(id: &K) -> Result<Document> {
    let mut filter = Document::new();
    filter.insert(INTERNAL_ID_FIELD.to_string(), serde_json::to_value(id)?);
    Ok(filter)
}

fn ids_filter<K: Serialize>(ids: &[K]) -> Result<Document> {
    let ids = serde_json::to_value(ids)?;
    let mut filter = Document::new();
    filter.insert(INTERNAL_ID_FIELD.to_string(), json!({ "$in": ids }));
    Ok(filter)
}

fn set_update(fields: Document) -> Document {
    let mut update = Document::new();
    update.insert("$set".to_string(), Value::Object(fields));
    update
}

/// Persistence for items with a unique identifier of type `K`
///
/// Adds point operations by identifier on top of [`MongoDbPersistence`],
/// which stays reachable through `Deref`. Looking up, updating or deleting
/// an identifier that does not exist yields `Ok(None)`.
pub struct IdentifiableMongoDbPersistence<T, K> {
    engine: MongoDbPersistence<T>,
    _key: PhantomData<fn() -> K>,
}

impl<T, K> Deref for IdentifiableMongoDbPersistence<T, K> {
    type Target = MongoDbPersistence<T>;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

impl<T, K> DerefMut for IdentifiableMongoDbPersistence<T, K> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.engine
    }
}

impl<T, K> IdentifiableMongoDbPersistence<T, K>
where
    T: Identifiable<K> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    K: IdentityKey,
{
    pub fn new(collection: &str, driver: Arc<dyn DocumentDriver>) -> Self {
        Self::from_engine(MongoDbPersistence::new(collection, driver))
    }

    pub fn with_overrides(
        collection: &str,
        driver: Arc<dyn DocumentDriver>,
        overrides: Arc<dyn PersistenceOverrides<T>>,
    ) -> Self {
        Self::from_engine(MongoDbPersistence::with_overrides(collection, driver, overrides))
    }

    pub fn from_engine(engine: MongoDbPersistence<T>) -> Self {
        Self {
            engine,
            _key: PhantomData,
        }
    }

    pub fn engine(&self) -> &MongoDbPersistence<T> {
        &self.engine
    }

    pub async fn get_list_by_ids(&self, ctx: &CallContext, ids: &[K]) -> Result<Vec<T>> {
        self.engine
            .get_list_by_filter(ctx, ids_filter(ids)?, None, None)
            .await
    }

    pub async fn get_one_by_id(&self, ctx: &CallContext, id: &K) -> Result<Option<T>> {
        let (collection, _) = self.engine.bind(ctx)?;
        let found = ctx.run(collection.find_one(id_filter(id)?)).await?;

        event!(
            Level::TRACE,
            trace_id = ctx.trace_id(),
            collection = %self.collection_name(),
            id = %id,
            found = found.is_some(),
            "retrieved item by id"
        );
        found
            .map(|doc| self.overrides().convert_to_public(doc))
            .transpose()
    }

    /// Insert `item`, generating an identifier when it has none.
    pub async fn create(&self, ctx: &CallContext, item: &T) -> Result<T> {
        let mut item = item.clone();
        if item.id().is_unset() {
            item.set_id(K::generate());
        }
        self.engine.create(ctx, &item).await
    }

    /// Insert or replace `item` by identifier.
    pub async fn set(&self, ctx: &CallContext, item: &T) -> Result<Option<T>> {
        let (collection, _) = self.engine.bind(ctx)?;

        let mut item = item.clone();
        if item.id().is_unset() {
            item.set_id(K::generate());
        }
        let id = item.id();
        let doc = self.overrides().convert_from_public(&item)?;
        let options = FindOneAndModifyOptions {
            upsert: true,
            return_document: ReturnDocument::After,
        };

        let stored = ctx
            .run(collection.find_one_and_replace(id_filter(&id)?, doc, options))
            .await?;
        event!(
            Level::TRACE,
            trace_id = ctx.trace_id(),
            collection = %self.collection_name(),
            id = %id,
            "set item"
        );
        stored
            .map(|doc| self.overrides().convert_to_public(doc))
            .transpose()
    }

    /// Overwrite the stored fields of an existing item.
    pub async fn update(&self, ctx: &CallContext, item: &T) -> Result<Option<T>> {
        let id = item.id();
        let mut fields = self.overrides().convert_from_public_partial(item)?;
        fields.remove(INTERNAL_ID_FIELD);
        self.apply_set(ctx, &id, fields, "updated item").await
    }

    /// Overwrite only the given fields of an existing item.
    pub async fn update_partially(
        &self,
        ctx: &CallContext,
        id: &K,
        data: AnyValueMap,
    ) -> Result<Option<T>> {
        let mut fields = to_internal_document(data);
        fields.remove(INTERNAL_ID_FIELD);
        self.apply_set(ctx, id, fields, "updated item partially").await
    }

    async fn apply_set(
        &self,
        ctx: &CallContext,
        id: &K,
        fields: Document,
        message: &'static str,
    ) -> Result<Option<T>> {
        let (collection, _) = self.engine.bind(ctx)?;
        let options = FindOneAndModifyOptions {
            upsert: false,
            return_document: ReturnDocument::After,
        };

        let updated = ctx
            .run(collection.find_one_and_update(id_filter(id)?, set_update(fields), options))
            .await?;
        event!(
            Level::TRACE,
            trace_id = ctx.trace_id(),
            collection = %self.collection_name(),
            id = %id,
            found = updated.is_some(),
            "{}",
            message
        );
        updated
            .map(|doc| self.overrides().convert_to_public(doc))
            .transpose()
    }

    /// Remove an item and return it as it was stored.
    pub async fn delete_by_id(&self, ctx: &CallContext, id: &K) -> Result<Option<T>> {
        let (collection, _) = self.engine.bind(ctx)?;
        let removed = ctx.run(collection.find_one_and_delete(id_filter(id)?)).await?;

        event!(
            Level::TRACE,
            trace_id = ctx.trace_id(),
            collection = %self.collection_name(),
            id = %id,
            found = removed.is_some(),
            "deleted item by id"
        );
        removed
            .map(|doc| self.overrides().convert_to_public(doc))
            .transpose()
    }

    pub async fn delete_by_ids(&self, ctx: &CallContext, ids: &[K]) -> Result<()> {
        self.engine.delete_by_filter(ctx, ids_filter(ids)?).await
    }
}
