/// Persistence engine tests
///
/// CRUD and query behavior of the generic and identifiable persistence over
/// the in-memory driver.
/// Run with: cargo test --test persistence_tests
mod common;

use common::*;
use mongo_persistence::connect::MongoDbConnection;
use mongo_persistence::driver::{Document, DriverCollection, MemoryDriver};
use mongo_persistence::error::codes;
use mongo_persistence::persistence::{ConnectionOwnership, PersistenceState};
use mongo_persistence::refer::DEFAULT_CONNECTION;
use mongo_persistence::{
    CallContext, ConfigParams, FilterParams, Identifiable, MongoDbPersistence, PagingParams,
    PersistenceError, References,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

#[tokio::test]
async fn test_crud_operations() {
    let driver = MemoryDriver::new();
    let persistence = open_dummies(&driver).await;
    let ctx = CallContext::new("crud");

    // Create one dummy
    let created1 = persistence.create(&ctx, &dummy1()).await.unwrap();
    assert!(!created1.id.is_empty());
    assert_eq!(created1.key, "Key 1");
    assert_eq!(created1.content, "Content 1");

    // Create another dummy
    let created2 = persistence.create(&ctx, &dummy2()).await.unwrap();
    assert_eq!(created2.key, "Key 2");

    // Get all dummies, newest key first
    let page = persistence
        .get_page_by_filter(&ctx, FilterParams::new(), PagingParams::default())
        .await
        .unwrap();
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0].key, "Key 2");
    assert!(page.total.is_none());

    // Update the dummy
    let mut changed = created1.clone();
    changed.content = "Updated Content 1".to_string();
    let updated = persistence.update(&ctx, &changed).await.unwrap().unwrap();
    assert_eq!(updated.id, created1.id);
    assert_eq!(updated.content, "Updated Content 1");

    // Partially update the dummy
    let partial = persistence
        .update_partially(
            &ctx,
            &created2.id,
            doc(json!({ "content": "Partially Updated Content 2" })),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(partial.key, "Key 2");
    assert_eq!(partial.content, "Partially Updated Content 2");

    // Delete the dummy
    let deleted = persistence.delete_by_id(&ctx, &created1.id).await.unwrap();
    assert_eq!(deleted.map(|d| d.id), Some(created1.id.clone()));

    // Try to get deleted dummy
    let missing = persistence.get_one_by_id(&ctx, &created1.id).await.unwrap();
    assert!(missing.is_none());

    let count = persistence
        .get_count_by_filter(&ctx, FilterParams::new())
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_batch_operations() {
    let driver = MemoryDriver::new();
    let persistence = open_dummies(&driver).await;
    let ctx = CallContext::new("batch");

    let mut ids = Vec::new();
    for i in 1..=3 {
        let dummy = Dummy::new("", &format!("Key {}", i), &format!("Content {}", i));
        ids.push(persistence.create(&ctx, &dummy).await.unwrap().id);
    }

    let items = persistence.get_list_by_ids(&ctx, &ids).await.unwrap();
    assert_eq!(items.len(), 3);

    assert_ok!(persistence.delete_by_ids(&ctx, &ids).await);

    let items = persistence.get_list_by_ids(&ctx, &ids).await.unwrap();
    assert!(items.is_empty());
}

#[tokio::test]
async fn test_round_trip_preserves_every_field() {
    let driver = MemoryDriver::new();
    let persistence = open_dummies(&driver).await;
    let ctx = CallContext::new("round-trip");

    let original = Dummy::new("dummy-1", "Key 1", "Content 1");
    let created = persistence.create(&ctx, &original).await.unwrap();
    assert_eq!(created, original);

    let stored = driver.documents("test", "dummies").await;
    assert_eq!(stored[0].get("_id"), Some(&json!("dummy-1")));
    assert!(!stored[0].contains_key("id"));

    let fetched = persistence.get_one_by_id(&ctx, &original.id).await.unwrap();
    assert_eq!(fetched, Some(original));
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Account {
    id: String,
    display_name: String,
    login_count: u32,
}

#[tokio::test]
async fn test_round_trip_restores_renamed_fields() {
    let driver = MemoryDriver::new();
    let mut persistence: MongoDbPersistence<Account> =
        MongoDbPersistence::new("accounts", Arc::new(driver.clone()));
    persistence.configure(&memory_config());
    let ctx = CallContext::new("camel-case");
    persistence.open(&ctx).await.unwrap();

    let original = Account {
        id: "1".to_string(),
        display_name: "Ann".to_string(),
        login_count: 3,
    };
    let created = persistence.create(&ctx, &original).await.unwrap();
    assert_eq!(created, original);

    let stored = driver.documents("test", "accounts").await;
    assert_eq!(stored[0].get("displayname"), Some(&json!("Ann")));
    assert_eq!(stored[0].get("logincount"), Some(&json!(3)));

    let listed = persistence
        .get_list_by_filter(&ctx, doc(json!({ "displayname": "Ann" })), None, None)
        .await
        .unwrap();
    assert_eq!(listed, vec![original]);
}

#[tokio::test]
async fn test_page_total_is_only_computed_on_request() {
    let driver = MemoryDriver::new();
    let persistence = open_dummies(&driver).await;
    let ctx = CallContext::new("paging");

    for i in 0..5 {
        let dummy = Dummy::new("", &format!("Key {}", i), "Content");
        persistence.create(&ctx, &dummy).await.unwrap();
    }

    let page = persistence
        .get_page_by_filter(&ctx, FilterParams::new(), PagingParams::new(Some(0), Some(2), true))
        .await
        .unwrap();
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.total, Some(5));
    assert_eq!(
        page.total,
        Some(
            persistence
                .get_count_by_filter(&ctx, FilterParams::new())
                .await
                .unwrap()
        )
    );

    let page = persistence
        .get_page_by_filter(&ctx, FilterParams::new(), PagingParams::new(Some(4), Some(2), false))
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].key, "Key 0");
    assert!(page.total.is_none());

    let filtered = persistence
        .get_page_by_filter(
            &ctx,
            FilterParams::from_tuples(&[("key", "Key 3")]),
            PagingParams::new(Some(-1), None, true),
        )
        .await
        .unwrap();
    assert_eq!(filtered.items.len(), 1);
    assert_eq!(filtered.total, Some(1));
}

#[tokio::test]
async fn test_generated_identifier_is_stable() {
    let driver = MemoryDriver::new();
    let persistence = open_dummies(&driver).await;
    let ctx = CallContext::new("identity");

    let created = persistence.create(&ctx, &dummy1()).await.unwrap();
    assert_eq!(created.id.len(), 32);

    for _ in 0..2 {
        let fetched = persistence.get_one_by_id(&ctx, &created.id).await.unwrap();
        assert_eq!(fetched.map(|d| d.id), Some(created.id.clone()));
    }
}

#[tokio::test]
async fn test_missing_identifier_is_not_an_error() {
    let driver = MemoryDriver::new();
    let persistence = open_dummies(&driver).await;
    let ctx = CallContext::new("missing");
    let id = "missing".to_string();

    assert!(persistence.get_one_by_id(&ctx, &id).await.unwrap().is_none());
    assert!(persistence.delete_by_id(&ctx, &id).await.unwrap().is_none());
    assert!(
        persistence
            .update(&ctx, &Dummy::new("missing", "Key 9", "Content 9"))
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        persistence
            .update_partially(&ctx, &id, doc(json!({ "content": "x" })))
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(
        persistence.get_count_by_filter(&ctx, FilterParams::new()).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_set_upserts_and_replaces() {
    let driver = MemoryDriver::new();
    let persistence = open_dummies(&driver).await;
    let ctx = CallContext::new("set");

    let inserted = persistence.set(&ctx, &dummy1()).await.unwrap().unwrap();
    assert!(!inserted.id.is_empty());

    let mut replacement = inserted.clone();
    replacement.content = "Replaced".to_string();
    let replaced = persistence.set(&ctx, &replacement).await.unwrap().unwrap();
    assert_eq!(replaced, replacement);

    let count = persistence
        .get_count_by_filter(&ctx, FilterParams::new())
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_open_and_close_are_idempotent() {
    let driver = MemoryDriver::new();
    let mut persistence = DummyMongoDbPersistence::new(Arc::new(driver.clone()));
    persistence.configure(&memory_config());
    let ctx = CallContext::new("lifecycle");

    assert_ok!(persistence.open(&ctx).await);
    assert_ok!(persistence.open(&ctx).await);
    assert!(persistence.is_open());
    assert_eq!(driver.open_clients(), 1);
    assert_eq!(driver.index_names("test", "dummies").await, vec!["key_1".to_string()]);

    assert_ok!(persistence.close(&ctx).await);
    assert_ok!(persistence.close(&ctx).await);
    assert_eq!(persistence.state(), PersistenceState::Closed);
    assert_eq!(driver.open_clients(), 0);

    // reopening keeps the index set unchanged
    assert_ok!(persistence.open(&ctx).await);
    assert_eq!(driver.index_names("test", "dummies").await, vec!["key_1".to_string()]);
    assert_ok!(persistence.close(&ctx).await);
}

#[tokio::test]
async fn test_unique_index_rejects_duplicate_keys() {
    let driver = MemoryDriver::new();
    let persistence = open_dummies(&driver).await;
    let ctx = CallContext::new("unique");

    persistence.create(&ctx, &dummy1()).await.unwrap();
    let err = assert_err!(persistence.create(&ctx, &dummy1()).await);
    assert!(matches!(err, PersistenceError::Driver(_)));
}

#[tokio::test]
async fn test_calls_while_closed_fail_fast() {
    let driver = MemoryDriver::new();
    let mut persistence = DummyMongoDbPersistence::new(Arc::new(driver.clone()));
    persistence.configure(&memory_config());
    let ctx = CallContext::new("closed");

    let err = persistence.create(&ctx, &dummy1()).await.unwrap_err();
    assert_eq!(err.code(), Some(codes::NOT_OPENED));
    assert_eq!(err.trace_id(), Some("closed"));
    assert!(!driver.collection_exists("test", "dummies").await);
}

#[tokio::test]
async fn test_one_random() {
    let driver = MemoryDriver::new();
    let persistence = open_dummies(&driver).await;
    let ctx = CallContext::new("random");

    let none = persistence
        .get_one_random(&ctx, Document::new())
        .await
        .unwrap();
    assert!(none.is_none());

    let created1 = persistence.create(&ctx, &dummy1()).await.unwrap();
    let created2 = persistence.create(&ctx, &dummy2()).await.unwrap();
    for _ in 0..10 {
        let item = persistence
            .get_one_random(&ctx, Document::new())
            .await
            .unwrap()
            .unwrap();
        assert!(item == created1 || item == created2);
    }

    let only = persistence
        .get_one_random(&ctx, doc(json!({ "key": "Key 2" })))
        .await
        .unwrap();
    assert_eq!(only, Some(created2));
}

#[tokio::test]
async fn test_undecodable_documents_are_skipped() {
    let driver = MemoryDriver::new();
    let persistence = open_dummies(&driver).await;
    let ctx = CallContext::new("decode");

    persistence.create(&ctx, &dummy1()).await.unwrap();
    driver
        .insert_corrupt("test", "dummies", doc(json!({ "_id": "broken", "key": "Key 0" })))
        .await;

    let list = persistence
        .get_list_by_filter(&ctx, Document::new(), None, None)
        .await
        .unwrap();
    assert_eq!(list.len(), 1);

    let page = persistence
        .get_page_by_filter(&ctx, FilterParams::new(), PagingParams::new(None, None, true))
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.total, Some(2));
}

#[tokio::test]
async fn test_conversion_failure_aborts_scan() {
    let driver = MemoryDriver::new();
    let persistence = open_dummies(&driver).await;
    let ctx = CallContext::new("convert");

    persistence.create(&ctx, &dummy1()).await.unwrap();
    let collection = persistence.collection().unwrap();
    collection
        .insert_one(doc(json!({ "_id": "2", "key": 42, "content": "wrong type" })))
        .await
        .unwrap();

    let err = persistence
        .get_list_by_filter(&ctx, Document::new(), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, PersistenceError::Conversion(_)));
}

#[tokio::test]
async fn test_clear_drops_collection() {
    let driver = MemoryDriver::new();
    let persistence = open_dummies(&driver).await;
    let ctx = CallContext::new("clear");

    persistence.create(&ctx, &dummy1()).await.unwrap();
    assert_ok!(persistence.clear(&ctx).await);
    assert!(!driver.collection_exists("test", "dummies").await);
    assert_eq!(
        persistence.get_count_by_filter(&ctx, FilterParams::new()).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_clear_requires_collection_name() {
    let mut persistence: MongoDbPersistence<Document> =
        MongoDbPersistence::new("", Arc::new(MemoryDriver::new()));
    persistence.configure(&memory_config());
    let ctx = CallContext::new("clear");

    let err = persistence.clear(&ctx).await.unwrap_err();
    assert_eq!(err.code(), Some(codes::NO_COLLECTION));
}

#[tokio::test]
async fn test_collection_name_comes_from_config() {
    let driver = MemoryDriver::new();
    let mut persistence: MongoDbPersistence<Document> =
        MongoDbPersistence::new("default", Arc::new(driver.clone()));
    let mut config = memory_config();
    config.set("collection", "configured");
    persistence.configure(&config);

    let ctx = CallContext::new("config");
    persistence.open(&ctx).await.unwrap();
    persistence
        .create(&ctx, &doc(json!({ "key": "k" })))
        .await
        .unwrap();

    assert_eq!(persistence.collection_name(), "configured");
    assert_eq!(driver.documents("test", "configured").await.len(), 1);
}

#[tokio::test]
async fn test_shared_connection_is_never_closed_by_borrower() {
    let driver = MemoryDriver::new();
    let ctx = CallContext::new("shared");

    let mut connection = MongoDbConnection::new(Arc::new(driver.clone()));
    connection.configure(&memory_config());
    let connection = Arc::new(connection);
    connection.open(&ctx).await.unwrap();

    let references = References::new().with(DEFAULT_CONNECTION, Arc::clone(&connection));
    let mut persistence = DummyMongoDbPersistence::new(Arc::new(driver.clone()));
    persistence.configure(&ConfigParams::new());
    persistence.set_references(&references);
    assert!(matches!(
        persistence.connection(),
        Some(ConnectionOwnership::Borrowed(_))
    ));

    persistence.open(&ctx).await.unwrap();
    persistence.create(&ctx, &dummy1()).await.unwrap();
    persistence.close(&ctx).await.unwrap();

    assert!(connection.is_open());
    assert_eq!(driver.open_clients(), 1);
    connection.close(&ctx).await.unwrap();
    assert_eq!(driver.open_clients(), 0);
}

#[tokio::test]
async fn test_borrowed_connection_must_be_open() {
    let driver = MemoryDriver::new();
    let ctx = CallContext::new("shared");

    let mut connection = MongoDbConnection::new(Arc::new(driver.clone()));
    connection.configure(&memory_config());
    let references = References::new().with(DEFAULT_CONNECTION, Arc::new(connection));

    let mut persistence = DummyMongoDbPersistence::new(Arc::new(driver));
    persistence.set_references(&references);

    let err = persistence.open(&ctx).await.unwrap_err();
    assert_eq!(err.code(), Some(codes::CONNECT_FAILED));
    assert!(!persistence.is_open());
}

#[tokio::test]
async fn test_close_without_connection_still_releases_handles() {
    let driver = MemoryDriver::new();
    let mut persistence = open_dummies(&driver).await;
    let ctx = CallContext::new("close");

    persistence.unset_references();
    let err = persistence.close(&ctx).await.unwrap_err();
    assert_eq!(err.code(), Some(codes::NO_CONNECTION));
    assert!(matches!(err, PersistenceError::InvalidState { .. }));
    assert!(!persistence.is_open());
    assert!(persistence.collection().is_none());
}

#[tokio::test]
async fn test_map_persistence() {
    let driver = MemoryDriver::new();
    let mut persistence = DummyMapMongoDbPersistence::new(Arc::new(driver.clone()));
    persistence.configure(&memory_config());
    let ctx = CallContext::new("map");
    persistence.open(&ctx).await.unwrap();

    let created = persistence
        .create(&ctx, &doc(json!({ "Key": "Key 1", "Content": "Content 1" })))
        .await
        .unwrap();
    let id = Identifiable::<String>::id(&created);
    assert_eq!(id.len(), 32);
    assert_eq!(created.get("key"), Some(&json!("Key 1")));

    let updated = persistence
        .update_partially(&ctx, &id, doc(json!({ "Content": "Updated" })))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.get("content"), Some(&json!("Updated")));
    assert_eq!(updated.get("id"), Some(&json!(id)));

    let page = persistence
        .get_page_by_filter(&ctx, FilterParams::new(), PagingParams::default())
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
}

#[tokio::test]
async fn test_boxed_item_persistence() {
    let driver = MemoryDriver::new();
    let mut persistence = DummyRefMongoDbPersistence::new(Arc::new(driver.clone()));
    persistence.configure(&memory_config());
    let ctx = CallContext::new("ref");
    persistence.open(&ctx).await.unwrap();

    let created = persistence
        .create(&ctx, &Box::new(dummy1()))
        .await
        .unwrap();
    let fetched = persistence.get_one_by_id(&ctx, &created.id).await.unwrap();
    assert_eq!(fetched, Some(created));
}

#[tokio::test]
async fn test_uuid_identifiers() {
    let driver = MemoryDriver::new();
    let mut persistence = DummyUuidMongoDbPersistence::new(Arc::new(driver.clone()));
    persistence.configure(&memory_config());
    let ctx = CallContext::new("uuid");
    persistence.open(&ctx).await.unwrap();

    let created = persistence
        .create(
            &ctx,
            &UuidDummy {
                id: Uuid::nil(),
                key: "Key 1".to_string(),
            },
        )
        .await
        .unwrap();
    assert!(!created.id.is_nil());

    let fetched = persistence.get_one_by_id(&ctx, &created.id).await.unwrap();
    assert_eq!(fetched, Some(created.clone()));

    let removed = persistence.delete_by_id(&ctx, &created.id).await.unwrap();
    assert_eq!(removed, Some(created));
}

#[tokio::test]
async fn test_cancelled_context_skips_driver() {
    let driver = MemoryDriver::new();
    let persistence = open_dummies(&driver).await;

    let token = tokio_util::sync::CancellationToken::new();
    token.cancel();
    let ctx = CallContext::new("cancel").with_cancellation(token);

    let err = persistence.create(&ctx, &dummy1()).await.unwrap_err();
    assert!(matches!(err, PersistenceError::Cancelled { .. }));
    assert!(driver.documents("test", "dummies").await.is_empty());
}
