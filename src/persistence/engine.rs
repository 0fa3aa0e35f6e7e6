use super::convert::{DefaultOverrides, PersistenceOverrides, SchemaBuilder, with_identity};
use super::data::{DataPage, PagingParams};
use crate::config::ConfigParams;
use crate::connect::MongoDbConnection;
use crate::context::CallContext;
use crate::driver::{
    Document, DocumentCursor, DocumentDriver, DriverClient, DriverCollection, DriverDatabase,
    DriverError, FindOptions, IndexModel, IndexOptions,
};
use crate::error::{PersistenceError, Result, codes};
use crate::refer::{DEFAULT_CONNECTION, References};
use futures::StreamExt;
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

pub const DEFAULT_MAX_PAGE_SIZE: i64 = 100;

fn default_config() -> ConfigParams {
    ConfigParams::from_tuples(&[
        ("collection", ""),
        ("dependencies.connection", DEFAULT_CONNECTION),
        ("options.max_pool_size", "2"),
        ("options.keep_alive", "1"),
        ("options.connect_timeout", "5000"),
        ("options.auto_reconnect", "true"),
        ("options.max_page_size", "100"),
        ("options.debug", "true"),
    ])
}

/// Who may close the connection an engine works through.
#[derive(Clone)]
pub enum ConnectionOwnership {
    /// Created by the engine, opened and closed with it.
    Owned(Arc<MongoDbConnection>),
    /// Located through references; its owner opens and closes it.
    Borrowed(Arc<MongoDbConnection>),
}

impl ConnectionOwnership {
    pub fn connection(&self) -> &Arc<MongoDbConnection> {
        match self {
            Self::Owned(connection) | Self::Borrowed(connection) => connection,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, Self::Owned(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceState {
    Closed,
    Opening,
    Open,
}

/// Handles bound by `open` and cleared by `close`.
#[derive(Clone)]
struct Handles {
    state: PersistenceState,
    client: Option<Arc<dyn DriverClient>>,
    database: Option<Arc<dyn DriverDatabase>>,
    collection: Option<Arc<dyn DriverCollection>>,
    termination: CancellationToken,
}

impl Handles {
    fn closed() -> Self {
        Self {
            state: PersistenceState::Closed,
            client: None,
            database: None,
            collection: None,
            termination: CancellationToken::new(),
        }
    }
}

/// Cancels in-flight scans and drops the handles however `close` exits.
struct CloseGuard<'a> {
    handles: &'a RwLock<Handles>,
}

impl Drop for CloseGuard<'_> {
    fn drop(&mut self) {
        let mut handles = self.handles.write().unwrap_or_else(PoisonError::into_inner);
        handles.termination.cancel();
        handles.state = PersistenceState::Closed;
        handles.client = None;
        handles.database = None;
        handles.collection = None;
    }
}

/// Generic persistence over one MongoDB collection
///
/// Stores items of type `T` as documents, converting through a
/// [`PersistenceOverrides`] strategy. Entity adapters wrap the engine and
/// build their filters on top of `get_page_by_filter`, `get_list_by_filter`
/// and friends.
///
/// ### Configuration parameters
///
/// - `collection`: collection name
/// - `connection(s).*`, `credential(s).*`: see `MongoDbConnectionResolver`
/// - `options.max_page_size`: page size ceiling (default 100)
/// - `options.*`: client options, see `ConnectOptions`
/// - `dependencies.connection`: key of a shared connection (default `connection:mongodb`)
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use mongo_persistence::{CallContext, ConfigParams, MongoDbPersistence, PagingParams};
/// use mongo_persistence::driver::{Document, MemoryDriver};
///
/// # #[tokio::main]
/// # async fn main() -> mongo_persistence::Result<()> {
/// let mut persistence: MongoDbPersistence<Document> =
///     MongoDbPersistence::new("dummies", Arc::new(MemoryDriver::new()));
/// persistence.configure(&ConfigParams::from_tuples(&[
///     ("connection.uri", "mongodb://localhost:27017/test"),
/// ]));
///
/// let ctx = CallContext::new("123");
/// persistence.open(&ctx).await?;
/// let page = persistence
///     .get_page_by_filter(&ctx, Document::new(), &PagingParams::default(), None, None)
///     .await?;
/// assert!(page.items.is_empty());
/// persistence.close(&ctx).await?;
/// # Ok(())
/// # }
/// ```
pub struct MongoDbPersistence<T> {
    collection_name: String,
    max_page_size: i64,
    dependency: String,
    config: ConfigParams,
    references: References,
    driver: Arc<dyn DocumentDriver>,
    overrides: Arc<dyn PersistenceOverrides<T>>,
    indexes: StdMutex<Vec<IndexModel>>,
    connection: RwLock<Option<ConnectionOwnership>>,
    handles: RwLock<Handles>,
    lifecycle: Mutex<()>,
}

impl<T> MongoDbPersistence<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(collection: &str, driver: Arc<dyn DocumentDriver>) -> Self {
        Self::with_overrides(collection, driver, Arc::new(DefaultOverrides))
    }

    pub fn with_overrides(
        collection: &str,
        driver: Arc<dyn DocumentDriver>,
        overrides: Arc<dyn PersistenceOverrides<T>>,
    ) -> Self {
        Self {
            collection_name: collection.to_string(),
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            dependency: DEFAULT_CONNECTION.to_string(),
            config: default_config(),
            references: References::new(),
            driver,
            overrides,
            indexes: StdMutex::new(Vec::new()),
            connection: RwLock::new(None),
            handles: RwLock::new(Handles::closed()),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn configure(&mut self, config: &ConfigParams) {
        let config = config.set_defaults(&default_config());

        if let Some(collection) = config.get("collection").filter(|c| !c.is_empty()) {
            self.collection_name = collection.to_string();
        }
        self.max_page_size = config
            .get_as_nullable_integer("options.max_page_size")
            .filter(|size| *size > 0)
            .unwrap_or(self.max_page_size);
        self.dependency =
            config.get_as_string_with_default("dependencies.connection", DEFAULT_CONNECTION);
        self.config = config;
    }

    /// Adopt the shared connection registered under the dependency key, or
    /// create a private one configured like this engine.
    pub fn set_references(&mut self, references: &References) {
        self.references = references.clone();

        let ownership = match references.get_one_optional::<MongoDbConnection>(&self.dependency) {
            Some(shared) => ConnectionOwnership::Borrowed(shared),
            None => ConnectionOwnership::Owned(Arc::new(self.create_connection())),
        };
        *self.connection.write().unwrap_or_else(PoisonError::into_inner) = Some(ownership);
    }

    pub fn unset_references(&mut self) {
        self.references = References::new();
        *self.connection.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn create_connection(&self) -> MongoDbConnection {
        let mut connection = MongoDbConnection::new(Arc::clone(&self.driver));
        connection.configure(&self.config);
        connection.set_references(&self.references);
        connection
    }

    /// Queue an index to be created on the next open.
    pub fn ensure_index(&self, keys: Document, options: IndexOptions) {
        if keys.is_empty() {
            return;
        }
        self.indexes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(IndexModel::new(keys, options));
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    pub fn max_page_size(&self) -> i64 {
        self.max_page_size
    }

    pub fn state(&self) -> PersistenceState {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    pub fn is_open(&self) -> bool {
        self.state() == PersistenceState::Open
    }

    pub fn connection(&self) -> Option<ConnectionOwnership> {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn database_name(&self) -> Option<String> {
        let handles = self.handles.read().unwrap_or_else(PoisonError::into_inner);
        handles.database.as_ref().map(|db| db.name().to_string())
    }

    /// Bound driver client, for operations the engine does not cover.
    pub fn client(&self) -> Option<Arc<dyn DriverClient>> {
        let handles = self.handles.read().unwrap_or_else(PoisonError::into_inner);
        handles.client.clone()
    }

    /// Bound collection handle, for operations the engine does not cover.
    pub fn collection(&self) -> Option<Arc<dyn DriverCollection>> {
        let handles = self.handles.read().unwrap_or_else(PoisonError::into_inner);
        handles.collection.clone()
    }

    pub fn overrides(&self) -> &Arc<dyn PersistenceOverrides<T>> {
        &self.overrides
    }

    pub async fn open(&self, ctx: &CallContext) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_open() {
            return Ok(());
        }

        let termination = CancellationToken::new();
        {
            let mut handles = self.handles.write().unwrap_or_else(PoisonError::into_inner);
            handles.state = PersistenceState::Opening;
            handles.termination = termination.clone();
        }

        match self.bind_handles(ctx).await {
            Ok(bound) => {
                *self.handles.write().unwrap_or_else(PoisonError::into_inner) = Handles {
                    state: PersistenceState::Open,
                    termination,
                    ..bound
                };
                event!(
                    Level::DEBUG,
                    trace_id = ctx.trace_id(),
                    collection = %self.collection_name,
                    "opened mongodb persistence"
                );
                Ok(())
            }
            Err(err) => {
                *self.handles.write().unwrap_or_else(PoisonError::into_inner) = Handles::closed();
                if let Some(ConnectionOwnership::Owned(connection)) = self.connection() {
                    if let Err(close_err) = connection.close(ctx).await {
                        event!(
                            Level::DEBUG,
                            trace_id = ctx.trace_id(),
                            error = %close_err,
                            "failed to release connection after unsuccessful open"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    async fn bind_handles(&self, ctx: &CallContext) -> Result<Handles> {
        let ownership = self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(|| ConnectionOwnership::Owned(Arc::new(self.create_connection())))
            .clone();

        if let ConnectionOwnership::Owned(connection) = &ownership {
            connection.open(ctx).await?;
        }

        let connection = ownership.connection();
        let (client, database) = match (connection.get_connection(), connection.get_database()) {
            (Some(client), Some(database)) if connection.is_open() => (client, database),
            _ => {
                return Err(PersistenceError::connection(
                    ctx.trace_id(),
                    codes::CONNECT_FAILED,
                    "MongoDB connection is not opened",
                ));
            }
        };

        let collection = database.collection(&self.collection_name).ok_or_else(|| {
            PersistenceError::connection(
                ctx.trace_id(),
                codes::CONNECT_FAILED,
                format!("Cannot get collection '{}'", self.collection_name),
            )
        })?;

        let mut schema = SchemaBuilder::new();
        self.overrides.define_schema(&mut schema);
        let mut indexes = self
            .indexes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        indexes.extend(schema.into_indexes());

        if !indexes.is_empty() {
            let names = ctx
                .run(collection.create_indexes(indexes))
                .await
                .map_err(|err| {
                    err.into_connection(
                        ctx.trace_id(),
                        codes::CREATE_IDX_FAILED,
                        "Failed to create indexes",
                    )
                })?;
            event!(
                Level::DEBUG,
                trace_id = ctx.trace_id(),
                collection = %self.collection_name,
                indexes = ?names,
                "ensured indexes"
            );
        }

        Ok(Handles {
            state: PersistenceState::Opening,
            client: Some(client),
            database: Some(database),
            collection: Some(collection),
            termination: CancellationToken::new(),
        })
    }

    /// Signal termination to running scans, release the handles and close an
    /// owned connection.
    pub async fn close(&self, ctx: &CallContext) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.is_open() {
            return Ok(());
        }

        let _cleanup = CloseGuard {
            handles: &self.handles,
        };
        let Some(ownership) = self.connection() else {
            return Err(PersistenceError::invalid_state(
                ctx.trace_id(),
                codes::NO_CONNECTION,
                "MongoDB connection is missing",
            ));
        };

        if let ConnectionOwnership::Owned(connection) = &ownership {
            connection.close(ctx).await?;
        }

        event!(
            Level::DEBUG,
            trace_id = ctx.trace_id(),
            collection = %self.collection_name,
            "closed mongodb persistence"
        );
        Ok(())
    }

    /// Drop the whole collection.
    pub async fn clear(&self, ctx: &CallContext) -> Result<()> {
        if self.collection_name.is_empty() {
            return Err(PersistenceError::configuration(
                ctx.trace_id(),
                codes::NO_COLLECTION,
                "Collection name is not defined",
            ));
        }

        let (collection, _) = self.bind(ctx)?;
        ctx.run(collection.drop_collection()).await.map_err(|err| {
            err.into_connection(
                ctx.trace_id(),
                codes::CLEAR_FAILED,
                &format!("Clearing collection '{}' failed", self.collection_name),
            )
        })
    }

    /// Collection handle and termination token of the current open cycle.
    pub(crate) fn bind(
        &self,
        ctx: &CallContext,
    ) -> Result<(Arc<dyn DriverCollection>, CancellationToken)> {
        let handles = self.handles.read().unwrap_or_else(PoisonError::into_inner);
        match (&handles.state, &handles.collection) {
            (PersistenceState::Open, Some(collection)) => {
                Ok((Arc::clone(collection), handles.termination.clone()))
            }
            _ => Err(PersistenceError::invalid_state(
                ctx.trace_id(),
                codes::NOT_OPENED,
                format!("Persistence for '{}' is not opened", self.collection_name),
            )),
        }
    }

    fn check_terminated(termination: &CancellationToken, ctx: &CallContext) -> Result<()> {
        if termination.is_cancelled() {
            return Err(PersistenceError::Terminated {
                trace_id: ctx.trace_id().to_string(),
            });
        }
        Ok(())
    }

    /// Convert every decodable document of `cursor`, stopping early on
    /// termination.
    async fn drain(
        &self,
        ctx: &CallContext,
        mut cursor: DocumentCursor,
        termination: &CancellationToken,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        loop {
            Self::check_terminated(termination, ctx)?;
            let next = tokio::select! {
                biased;
                _ = termination.cancelled() => {
                    return Err(PersistenceError::Terminated {
                        trace_id: ctx.trace_id().to_string(),
                    });
                }
                next = ctx.run(async { Ok::<_, DriverError>(cursor.next().await) }) => next?,
            };

            match next {
                None => break,
                Some(Ok(doc)) => items.push(self.overrides.convert_to_public(doc)?),
                Some(Err(DriverError::Decode(reason))) => {
                    event!(
                        Level::DEBUG,
                        trace_id = ctx.trace_id(),
                        collection = %self.collection_name,
                        reason = %reason,
                        "skipped undecodable document"
                    );
                }
                Some(Err(err)) => return Err(err.into()),
            }
        }
        Ok(items)
    }

    /// One page of items matching `filter`, with the total when requested.
    pub async fn get_page_by_filter(
        &self,
        ctx: &CallContext,
        filter: Document,
        paging: &PagingParams,
        sort: Option<Document>,
        projection: Option<Document>,
    ) -> Result<DataPage<T>> {
        let (collection, termination) = self.bind(ctx)?;

        let skip = paging.get_skip(0);
        let take = paging.get_take(self.max_page_size);
        let options = FindOptions {
            skip: (skip > 0).then_some(skip as u64),
            limit: Some(take),
            sort,
            projection,
        };

        Self::check_terminated(&termination, ctx)?;
        let cursor = ctx.run(collection.find(filter.clone(), options)).await?;
        let items = self.drain(ctx, cursor, &termination).await?;
        event!(
            Level::TRACE,
            trace_id = ctx.trace_id(),
            collection = %self.collection_name,
            count = items.len(),
            "retrieved page"
        );

        let total = if paging.total {
            Self::check_terminated(&termination, ctx)?;
            let count = ctx.run(collection.count_documents(filter)).await?;
            Some(count as i64)
        } else {
            None
        };

        Ok(DataPage::new(items, total))
    }

    pub async fn get_list_by_filter(
        &self,
        ctx: &CallContext,
        filter: Document,
        sort: Option<Document>,
        projection: Option<Document>,
    ) -> Result<Vec<T>> {
        let (collection, termination) = self.bind(ctx)?;
        let options = FindOptions {
            sort,
            projection,
            ..FindOptions::default()
        };

        Self::check_terminated(&termination, ctx)?;
        let cursor = ctx.run(collection.find(filter, options)).await?;
        let items = self.drain(ctx, cursor, &termination).await?;
        event!(
            Level::TRACE,
            trace_id = ctx.trace_id(),
            collection = %self.collection_name,
            count = items.len(),
            "retrieved list"
        );
        Ok(items)
    }

    /// A uniformly chosen matching item; `None` when nothing matches.
    pub async fn get_one_random(&self, ctx: &CallContext, filter: Document) -> Result<Option<T>> {
        let (collection, _) = self.bind(ctx)?;

        let count = ctx.run(collection.count_documents(filter.clone())).await?;
        if count == 0 {
            event!(
                Level::TRACE,
                trace_id = ctx.trace_id(),
                collection = %self.collection_name,
                "random item not found"
            );
            return Ok(None);
        }

        let offset = rand::thread_rng().gen_range(0..count);
        let options = FindOptions {
            skip: Some(offset),
            limit: Some(1),
            ..FindOptions::default()
        };
        let mut cursor = ctx.run(collection.find(filter, options)).await?;
        let first = ctx
            .run(async { Ok::<_, DriverError>(cursor.next().await) })
            .await?;

        match first {
            Some(Ok(doc)) => {
                event!(
                    Level::TRACE,
                    trace_id = ctx.trace_id(),
                    collection = %self.collection_name,
                    offset,
                    "retrieved random item"
                );
                self.overrides.convert_to_public(doc).map(Some)
            }
            Some(Err(DriverError::Decode(_))) | None => Ok(None),
            Some(Err(err)) => Err(err.into()),
        }
    }

    /// Insert `item` and return it as stored, including a generated `_id`.
    pub async fn create(&self, ctx: &CallContext, item: &T) -> Result<T> {
        let (collection, _) = self.bind(ctx)?;

        let doc = self.overrides.convert_from_public(item)?;
        let id = ctx.run(collection.insert_one(doc.clone())).await?;
        event!(
            Level::TRACE,
            trace_id = ctx.trace_id(),
            collection = %self.collection_name,
            id = %id,
            "created item"
        );

        self.overrides.convert_to_public(with_identity(doc, id))
    }

    pub async fn get_count_by_filter(&self, ctx: &CallContext, filter: Document) -> Result<i64> {
        let (collection, _) = self.bind(ctx)?;
        let count = ctx.run(collection.count_documents(filter)).await?;
        event!(
            Level::TRACE,
            trace_id = ctx.trace_id(),
            collection = %self.collection_name,
            count,
            "counted items"
        );
        Ok(count as i64)
    }

    pub async fn delete_by_filter(&self, ctx: &CallContext, filter: Document) -> Result<()> {
        let (collection, _) = self.bind(ctx)?;
        let deleted = ctx.run(collection.delete_many(filter)).await?;
        event!(
            Level::TRACE,
            trace_id = ctx.trace_id(),
            collection = %self.collection_name,
            deleted,
            "deleted items"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use serde_json::json;

    fn engine(driver: &MemoryDriver) -> MongoDbPersistence<Document> {
        let mut engine = MongoDbPersistence::new("items", Arc::new(driver.clone()));
        engine.configure(&ConfigParams::from_tuples(&[
            ("connection.host", "localhost"),
            ("connection.port", "27017"),
            ("connection.database", "test"),
            ("options.max_page_size", "3"),
        ]));
        engine
    }

    #[test]
    fn test_configure_applies_defaults() {
        let engine = engine(&MemoryDriver::new());
        assert_eq!(engine.collection_name(), "items");
        assert_eq!(engine.max_page_size(), 3);
        assert_eq!(engine.state(), PersistenceState::Closed);
        assert!(engine.connection().is_none());
    }

    #[tokio::test]
    async fn test_calls_fail_fast_while_closed() {
        let engine = engine(&MemoryDriver::new());
        let ctx = CallContext::new("123");
        let err = engine
            .get_count_by_filter(&ctx, Document::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::NOT_OPENED));
    }

    #[tokio::test]
    async fn test_open_creates_owned_connection() {
        let driver = MemoryDriver::new();
        let engine = engine(&driver);
        let ctx = CallContext::new("123");

        engine.open(&ctx).await.unwrap();
        assert!(engine.is_open());
        assert!(engine.connection().is_some_and(|c| c.is_owned()));
        assert_eq!(engine.database_name().as_deref(), Some("test"));
        assert_eq!(driver.open_clients(), 1);

        engine.close(&ctx).await.unwrap();
        assert!(!engine.is_open());
        assert!(engine.collection().is_none());
        assert_eq!(driver.open_clients(), 0);
    }

    #[tokio::test]
    async fn test_page_is_capped_by_max_page_size() {
        let driver = MemoryDriver::new();
        let engine = engine(&driver);
        let ctx = CallContext::new("123");
        engine.open(&ctx).await.unwrap();

        for i in 0..5 {
            let doc = json!({ "id": i.to_string(), "n": i });
            engine.create(&ctx, doc.as_object().unwrap()).await.unwrap();
        }

        let page = engine
            .get_page_by_filter(&ctx, Document::new(), &PagingParams::new(None, Some(10), true), None, None)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 3);
        assert_eq!(page.total, Some(5));
    }

    #[tokio::test]
    async fn test_failed_index_creation_leaves_engine_closed() {
        let driver = MemoryDriver::new();
        let engine = engine(&driver);
        let ctx = CallContext::new("123");

        engine.open(&ctx).await.unwrap();
        for _ in 0..2 {
            let doc = json!({ "key": "same" });
            engine.create(&ctx, doc.as_object().unwrap()).await.unwrap();
        }
        engine.close(&ctx).await.unwrap();

        engine.ensure_index(
            json!({ "key": 1 }).as_object().cloned().unwrap(),
            IndexOptions::unique(),
        );
        let err = engine.open(&ctx).await.unwrap_err();
        assert_eq!(err.code(), Some(codes::CREATE_IDX_FAILED));
        assert_eq!(engine.state(), PersistenceState::Closed);
        assert!(engine.collection().is_none());
    }
}
