//! In-process document driver
//!
//! Stores databases, collections and documents in shared memory behind a
//! tokio `RwLock`. Every client created by the same `MemoryDriver` (or one of
//! its clones) sees the same data, the way several pooled connections see the
//! same cluster.
//!
//! - `filter.rs` - query evaluation
//! - `document.rs` - updates, projections and sorting

mod document;
mod filter;

use super::{
    ConnectOptions, Document, DocumentCursor, DocumentDriver, DriverClient, DriverCollection,
    DriverDatabase, DriverError, FindOneAndModifyOptions, FindOptions, IndexModel, ReturnDocument,
};
use crate::connect::resolver::{mask_password, split_authority};
use async_trait::async_trait;
use document::{apply_projection, apply_update, compare_by_sort};
use filter::{lookup, matches, values_equal};
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

const ID_INDEX: &str = "_id_";

#[derive(Debug, Clone)]
struct StoredDocument {
    doc: Document,
    corrupt: bool,
}

#[derive(Debug, Default)]
struct StoredCollection {
    documents: Vec<StoredDocument>,
    indexes: Vec<IndexModel>,
}

type Databases = HashMap<String, HashMap<String, StoredCollection>>;

/// In-memory implementation of [`DocumentDriver`].
///
/// # Examples
///
/// ```
/// use mongo_persistence::driver::{DocumentDriver, ConnectOptions, MemoryDriver};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let driver = MemoryDriver::new();
/// let client = driver
///     .connect("mongodb://localhost:27017/test", &ConnectOptions::default())
///     .await?;
/// let database = client.database("test");
/// assert!(database.collection("dummies").is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    store: Arc<RwLock<Databases>>,
    cursor_delay: Option<Duration>,
    connect_error: Option<String>,
    open_clients: Arc<AtomicUsize>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every document yielded by a cursor is delayed by `delay`.
    pub fn with_cursor_delay(mut self, delay: Duration) -> Self {
        self.cursor_delay = Some(delay);
        self
    }

    /// A driver whose every `connect` fails with `message`.
    pub fn unreachable(message: &str) -> Self {
        Self {
            connect_error: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// Number of clients connected and not yet closed.
    pub fn open_clients(&self) -> usize {
        self.open_clients.load(Ordering::SeqCst)
    }

    /// Store a document that cursors will fail to decode.
    pub async fn insert_corrupt(&self, database: &str, collection: &str, doc: Document) {
        let mut store = self.store.write().await;
        store
            .entry(database.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default()
            .documents
            .push(StoredDocument { doc, corrupt: true });
    }

    /// Snapshot of the stored documents in insertion order.
    pub async fn documents(&self, database: &str, collection: &str) -> Vec<Document> {
        let store = self.store.read().await;
        store
            .get(database)
            .and_then(|db| db.get(collection))
            .map(|coll| coll.documents.iter().map(|s| s.doc.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn index_names(&self, database: &str, collection: &str) -> Vec<String> {
        let store = self.store.read().await;
        store
            .get(database)
            .and_then(|db| db.get(collection))
            .map(|coll| coll.indexes.iter().map(IndexModel::name).collect())
            .unwrap_or_default()
    }

    pub async fn collection_exists(&self, database: &str, collection: &str) -> bool {
        let store = self.store.read().await;
        store
            .get(database)
            .is_some_and(|db| db.contains_key(collection))
    }
}

fn validate_uri(uri: &str) -> Result<(), DriverError> {
    let authority = match split_authority(uri) {
        Some(("mongodb" | "mongodb+srv", authority, _)) => authority,
        _ => {
            return Err(DriverError::Connect(format!(
                "unsupported connection scheme in '{}'",
                mask_password(uri)
            )));
        }
    };

    let hosts = authority.rsplit_once('@').map_or(authority, |(_, hosts)| hosts);
    if hosts.is_empty() || hosts.split(',').any(str::is_empty) {
        return Err(DriverError::Connect("connection string has no hosts".into()));
    }
    for host in hosts.split(',') {
        if let Some((_, port)) = host.rsplit_once(':') {
            port.parse::<u16>()
                .map_err(|_| DriverError::Connect(format!("invalid port in host '{}'", host)))?;
        }
    }
    Ok(())
}

#[async_trait]
impl DocumentDriver for MemoryDriver {
    async fn connect(
        &self,
        uri: &str,
        _options: &ConnectOptions,
    ) -> Result<Arc<dyn DriverClient>, DriverError> {
        if let Some(message) = &self.connect_error {
            return Err(DriverError::Connect(message.clone()));
        }
        validate_uri(uri)?;

        self.open_clients.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryClient {
            shared: Arc::new(Shared {
                store: Arc::clone(&self.store),
                cursor_delay: self.cursor_delay,
                closed: AtomicBool::new(false),
                open_clients: Arc::clone(&self.open_clients),
            }),
        }))
    }
}

#[derive(Debug)]
struct Shared {
    store: Arc<RwLock<Databases>>,
    cursor_delay: Option<Duration>,
    closed: AtomicBool,
    open_clients: Arc<AtomicUsize>,
}

struct MemoryClient {
    shared: Arc<Shared>,
}

#[async_trait]
impl DriverClient for MemoryClient {
    fn database(&self, name: &str) -> Arc<dyn DriverDatabase> {
        Arc::new(MemoryDatabase {
            name: name.to_string(),
            shared: Arc::clone(&self.shared),
        })
    }

    async fn close(&self) -> Result<(), DriverError> {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            self.shared.open_clients.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct MemoryDatabase {
    name: String,
    shared: Arc<Shared>,
}

impl DriverDatabase for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn collection(&self, name: &str) -> Option<Arc<dyn DriverCollection>> {
        if name.is_empty() || name.contains('$') {
            return None;
        }
        Some(Arc::new(MemoryCollection {
            database: self.name.clone(),
            name: name.to_string(),
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct MemoryCollection {
    database: String,
    name: String,
    shared: Arc<Shared>,
}

impl StoredCollection {
    fn position(&self, filter: &Document) -> Result<Option<usize>, DriverError> {
        for (i, stored) in self.documents.iter().enumerate() {
            if matches(filter, &stored.doc)? {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    fn check_unique(
        &self,
        collection: &str,
        candidate: &Document,
        replacing: Option<usize>,
    ) -> Result<(), DriverError> {
        let others = || {
            self.documents
                .iter()
                .enumerate()
                .filter(move |(i, _)| Some(*i) != replacing)
                .map(|(_, stored)| &stored.doc)
        };

        if let Some(id) = candidate.get("_id") {
            if others().any(|doc| doc.get("_id").is_some_and(|other| values_equal(other, id))) {
                return Err(DriverError::DuplicateKey {
                    collection: collection.to_string(),
                    index: ID_INDEX.to_string(),
                });
            }
        }

        for index in self.indexes.iter().filter(|index| index.options.unique) {
            let Some(key) = index_key(index, candidate) else {
                continue;
            };
            let clash = others().any(|doc| {
                index_key(index, doc).is_some_and(|other| {
                    other.iter().zip(&key).all(|(l, r)| values_equal(l, r))
                })
            });
            if clash {
                return Err(DriverError::DuplicateKey {
                    collection: collection.to_string(),
                    index: index.name(),
                });
            }
        }
        Ok(())
    }
}

/// Indexed values of `doc`; `None` when a sparse index does not cover it.
fn index_key(index: &IndexModel, doc: &Document) -> Option<Vec<Value>> {
    let values: Vec<Option<&Value>> = index.keys.keys().map(|path| lookup(doc, path)).collect();
    if index.options.sparse && values.iter().all(Option::is_none) {
        return None;
    }
    Some(
        values
            .into_iter()
            .map(|v| v.cloned().unwrap_or(Value::Null))
            .collect(),
    )
}

fn generate_object_id() -> Value {
    Value::String(uuid::Uuid::new_v4().simple().to_string())
}

/// Put `_id` first, the way the server stores it.
fn with_id_first(doc: Document, id: Value) -> Document {
    let mut ordered = Document::new();
    ordered.insert("_id".to_string(), id);
    ordered.extend(doc.into_iter().filter(|(k, _)| k != "_id"));
    ordered
}

/// Seed document for an upsert built from the plain equality clauses of `filter`.
fn upsert_seed(filter: &Document) -> Document {
    filter
        .iter()
        .filter(|(key, value)| {
            !key.starts_with('$')
                && !key.contains('.')
                && !value
                    .as_object()
                    .is_some_and(|m| m.keys().any(|k| k.starts_with('$')))
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

impl MemoryCollection {
    fn ensure_open(&self) -> Result<(), DriverError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(DriverError::ClientClosed);
        }
        Ok(())
    }

    fn decode(&self, stored: &StoredDocument) -> Result<Document, DriverError> {
        if stored.corrupt {
            return Err(DriverError::Decode(format!(
                "cannot decode document in '{}.{}'",
                self.database, self.name
            )));
        }
        Ok(stored.doc.clone())
    }
}

#[async_trait]
impl DriverCollection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find(
        &self,
        filter: Document,
        options: FindOptions,
    ) -> Result<DocumentCursor, DriverError> {
        self.ensure_open()?;
        let store = self.shared.store.read().await;

        let mut matched: Vec<&StoredDocument> = Vec::new();
        if let Some(coll) = store.get(&self.database).and_then(|db| db.get(&self.name)) {
            for stored in &coll.documents {
                if matches(&filter, &stored.doc)? {
                    matched.push(stored);
                }
            }
        }

        if let Some(sort) = &options.sort {
            matched.sort_by(|a, b| compare_by_sort(&a.doc, &b.doc, sort));
        }

        let skip = options.skip.unwrap_or(0) as usize;
        let limit = match options.limit {
            Some(n) if n != 0 => n.unsigned_abs() as usize,
            _ => usize::MAX,
        };

        let results: Vec<Result<Document, DriverError>> = matched
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|stored| {
                self.decode(stored).map(|doc| match &options.projection {
                    Some(projection) => apply_projection(doc, projection),
                    None => doc,
                })
            })
            .collect();
        drop(store);

        let stream = futures::stream::iter(results);
        Ok(match self.shared.cursor_delay {
            Some(delay) => stream
                .then(move |item| async move {
                    tokio::time::sleep(delay).await;
                    item
                })
                .boxed(),
            None => stream.boxed(),
        })
    }

    async fn find_one(&self, filter: Document) -> Result<Option<Document>, DriverError> {
        self.ensure_open()?;
        let store = self.shared.store.read().await;
        let Some(coll) = store.get(&self.database).and_then(|db| db.get(&self.name)) else {
            return Ok(None);
        };
        match coll.position(&filter)? {
            Some(i) => self.decode(&coll.documents[i]).map(Some),
            None => Ok(None),
        }
    }

    async fn insert_one(&self, document: Document) -> Result<Value, DriverError> {
        self.ensure_open()?;
        let document = match document.get("_id") {
            Some(_) => document,
            None => with_id_first(document, generate_object_id()),
        };
        let id = document.get("_id").cloned().unwrap_or(Value::Null);

        let mut store = self.shared.store.write().await;
        let coll = store
            .entry(self.database.clone())
            .or_default()
            .entry(self.name.clone())
            .or_default();
        coll.check_unique(&self.name, &document, None)?;
        coll.documents.push(StoredDocument {
            doc: document,
            corrupt: false,
        });
        Ok(id)
    }

    async fn find_one_and_replace(
        &self,
        filter: Document,
        replacement: Document,
        options: FindOneAndModifyOptions,
    ) -> Result<Option<Document>, DriverError> {
        self.ensure_open()?;
        let mut store = self.shared.store.write().await;
        let coll = store
            .entry(self.database.clone())
            .or_default()
            .entry(self.name.clone())
            .or_default();

        match coll.position(&filter)? {
            Some(i) => {
                let previous = coll.documents[i].doc.clone();
                let previous_id = previous.get("_id").cloned().unwrap_or(Value::Null);
                if let Some(id) = replacement.get("_id") {
                    if !values_equal(id, &previous_id) {
                        return Err(DriverError::InvalidArgument(
                            "the _id field cannot be modified".into(),
                        ));
                    }
                }
                let replacement = with_id_first(replacement, previous_id);
                coll.check_unique(&self.name, &replacement, Some(i))?;
                coll.documents[i] = StoredDocument {
                    doc: replacement.clone(),
                    corrupt: false,
                };
                Ok(Some(match options.return_document {
                    ReturnDocument::Before => previous,
                    ReturnDocument::After => replacement,
                }))
            }
            None if options.upsert => {
                let id = replacement
                    .get("_id")
                    .cloned()
                    .or_else(|| upsert_seed(&filter).remove("_id"))
                    .unwrap_or_else(generate_object_id);
                let inserted = with_id_first(replacement, id);
                coll.check_unique(&self.name, &inserted, None)?;
                coll.documents.push(StoredDocument {
                    doc: inserted.clone(),
                    corrupt: false,
                });
                Ok(match options.return_document {
                    ReturnDocument::Before => None,
                    ReturnDocument::After => Some(inserted),
                })
            }
            None => Ok(None),
        }
    }

    async fn find_one_and_update(
        &self,
        filter: Document,
        update: Document,
        options: FindOneAndModifyOptions,
    ) -> Result<Option<Document>, DriverError> {
        self.ensure_open()?;
        let mut store = self.shared.store.write().await;
        let coll = store
            .entry(self.database.clone())
            .or_default()
            .entry(self.name.clone())
            .or_default();

        match coll.position(&filter)? {
            Some(i) => {
                let previous = coll.documents[i].doc.clone();
                let mut updated = previous.clone();
                apply_update(&mut updated, &update)?;
                coll.check_unique(&self.name, &updated, Some(i))?;
                coll.documents[i] = StoredDocument {
                    doc: updated.clone(),
                    corrupt: false,
                };
                Ok(Some(match options.return_document {
                    ReturnDocument::Before => previous,
                    ReturnDocument::After => updated,
                }))
            }
            None if options.upsert => {
                let mut seed = upsert_seed(&filter);
                apply_update(&mut seed, &update)?;
                let id = seed.get("_id").cloned().unwrap_or_else(generate_object_id);
                let inserted = with_id_first(seed, id);
                coll.check_unique(&self.name, &inserted, None)?;
                coll.documents.push(StoredDocument {
                    doc: inserted.clone(),
                    corrupt: false,
                });
                Ok(match options.return_document {
                    ReturnDocument::Before => None,
                    ReturnDocument::After => Some(inserted),
                })
            }
            None => Ok(None),
        }
    }

    async fn find_one_and_delete(&self, filter: Document) -> Result<Option<Document>, DriverError> {
        self.ensure_open()?;
        let mut store = self.shared.store.write().await;
        let Some(coll) = store
            .get_mut(&self.database)
            .and_then(|db| db.get_mut(&self.name))
        else {
            return Ok(None);
        };
        match coll.position(&filter)? {
            Some(i) => Ok(Some(coll.documents.remove(i).doc)),
            None => Ok(None),
        }
    }

    async fn delete_many(&self, filter: Document) -> Result<u64, DriverError> {
        self.ensure_open()?;
        let mut store = self.shared.store.write().await;
        let Some(coll) = store
            .get_mut(&self.database)
            .and_then(|db| db.get_mut(&self.name))
        else {
            return Ok(0);
        };

        let flags = coll
            .documents
            .iter()
            .map(|stored| matches(&filter, &stored.doc))
            .collect::<Result<Vec<bool>, _>>()?;
        let before = coll.documents.len();
        let mut flags = flags.into_iter();
        coll.documents
            .retain(|_| !flags.next().unwrap_or(false));
        Ok((before - coll.documents.len()) as u64)
    }

    async fn count_documents(&self, filter: Document) -> Result<u64, DriverError> {
        self.ensure_open()?;
        let store = self.shared.store.read().await;
        let Some(coll) = store.get(&self.database).and_then(|db| db.get(&self.name)) else {
            return Ok(0);
        };
        let mut count = 0u64;
        for stored in &coll.documents {
            if matches(&filter, &stored.doc)? {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn create_indexes(&self, indexes: Vec<IndexModel>) -> Result<Vec<String>, DriverError> {
        self.ensure_open()?;
        let mut store = self.shared.store.write().await;
        let coll = store
            .entry(self.database.clone())
            .or_default()
            .entry(self.name.clone())
            .or_default();

        let mut names = Vec::with_capacity(indexes.len());
        for index in indexes {
            if index.keys.is_empty() {
                return Err(DriverError::InvalidArgument("index keys cannot be empty".into()));
            }
            let name = index.name();
            if coll.indexes.iter().any(|existing| existing.name() == name) {
                names.push(name);
                continue;
            }

            if index.options.unique {
                let keys: Vec<Vec<Value>> = coll
                    .documents
                    .iter()
                    .filter_map(|stored| index_key(&index, &stored.doc))
                    .collect();
                for (i, key) in keys.iter().enumerate() {
                    let clash = keys[i + 1..].iter().any(|other| {
                        other.iter().zip(key).all(|(l, r)| values_equal(l, r))
                    });
                    if clash {
                        return Err(DriverError::DuplicateKey {
                            collection: self.name.clone(),
                            index: name,
                        });
                    }
                }
            }

            coll.indexes.push(index);
            names.push(name);
        }
        Ok(names)
    }

    async fn drop_collection(&self) -> Result<(), DriverError> {
        self.ensure_open()?;
        let mut store = self.shared.store.write().await;
        if let Some(db) = store.get_mut(&self.database) {
            db.remove(&self.name);
        }
        Ok(())
    }
}
