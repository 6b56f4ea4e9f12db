mod common;

use std::sync::Arc;

use serde_json::json;

use common::{remote_change, store_with_node, test_schema, Customer};
use rowsync_core::{
    bind_allocator, ChangeOp, ConflictPolicy, IdAllocator, Payload, SqliteStore, SyncError,
};

#[tokio::test]
async fn insert_assigns_id_and_captures_full_image() {
    let store = store_with_node("insert", 7).await;

    let mut customer = Customer::named("Ada");
    store.insert(&mut customer).await.unwrap();

    let id = customer.sync.id.expect("id assigned at insert");
    assert_eq!(id.node_id(), 7);
    assert_eq!(customer.sync.version, 1);
    assert!(customer.sync.updated_at.is_some());
    assert!(customer.sync.deleted_at.is_none());

    let changes = store.changelog_after(0, None, 10).await.unwrap();
    assert_eq!(changes.len(), 1);
    let entry = &changes[0];
    assert_eq!(entry.op, ChangeOp::Insert);
    assert_eq!(entry.table, "customers");
    assert_eq!(entry.row_id, id);
    assert_eq!(entry.version, 1);
    assert_eq!(entry.origin_node_id, "7");
    assert_eq!(entry.payload.get("name"), Some(&json!("Ada")));
    assert_eq!(entry.payload.get("id"), Some(&json!(id.0)));
    assert!(entry.captured_at.is_some());
}

#[tokio::test]
async fn insert_without_any_allocator_fails() {
    let store = SqliteStore::connect(&common::mem_url("noalloc"), test_schema(), 3)
        .await
        .unwrap();

    let mut customer = Customer::named("Ada");
    assert!(matches!(
        store.insert(&mut customer).await,
        Err(SyncError::NoAllocatorBound)
    ));

    // a scoped thread-local binding satisfies the capture layer
    let allocator = Arc::new(IdAllocator::new(3).unwrap());
    let _guard = bind_allocator(allocator);
    store.insert(&mut customer).await.unwrap();
    assert_eq!(customer.sync.id.unwrap().node_id(), 3);
}

#[tokio::test]
async fn reassigning_identical_values_is_not_dirty() {
    let store = store_with_node("samevalue", 1).await;

    let mut customer = Customer::named("Ada");
    store.insert(&mut customer).await.unwrap();

    // same value assigned again: no version bump, no capture
    store.update(&mut customer).await.unwrap();
    assert_eq!(customer.sync.version, 1);
    assert_eq!(store.latest_change_id().await.unwrap(), 1);
}

#[tokio::test]
async fn system_only_writes_persist_without_capture() {
    let store = store_with_node("dirty", 1).await;

    let mut customer = Customer::named("Ada");
    store.insert(&mut customer).await.unwrap();
    let id = customer.sync.id.unwrap();

    let stamp = "2030-01-02T03:04:05+00:00";
    let mut changes = Payload::new();
    changes.insert("updated_at".to_string(), json!(stamp));
    let fields = store.update_row("customers", id, &changes).await.unwrap();

    assert_eq!(fields.version, 1, "no version bump");
    assert_eq!(store.latest_change_id().await.unwrap(), 1, "no capture");

    let row = store.fetch_row("customers", id).await.unwrap().unwrap();
    assert_eq!(
        row.sync.updated_at.unwrap().to_rfc3339(),
        "2030-01-02T03:04:05+00:00"
    );
}

#[tokio::test]
async fn meaningful_updates_bump_version_and_capture() {
    let store = store_with_node("meaningful", 1).await;

    let mut customer = Customer::named("Ada");
    store.insert(&mut customer).await.unwrap();
    customer.name = Some("Grace".to_string());
    store.update(&mut customer).await.unwrap();

    assert_eq!(customer.sync.version, 2);
    let changes = store.changelog_after(0, None, 10).await.unwrap();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[1].op, ChangeOp::Update);
    assert_eq!(changes[1].version, 2);
    assert_eq!(changes[1].payload.get("name"), Some(&json!("Grace")));
}

#[tokio::test]
async fn soft_delete_bumps_version_and_captures_system_only_payload() {
    let store = store_with_node("delete", 1).await;

    let mut customer = Customer::named("Ada");
    store.insert(&mut customer).await.unwrap();
    store.soft_delete(&mut customer).await.unwrap();

    assert_eq!(customer.sync.version, 2);
    assert!(customer.sync.deleted_at.is_some());

    let changes = store.changelog_after(0, None, 10).await.unwrap();
    assert_eq!(changes.len(), 2);
    let entry = &changes[1];
    assert_eq!(entry.op, ChangeOp::Delete);
    assert!(entry.payload.get("deleted_at").unwrap().is_string());
    assert!(entry.payload.get("name").is_none(), "data columns omitted");

    // deleting again is a no-op
    store.soft_delete(&mut customer).await.unwrap();
    assert_eq!(customer.sync.version, 2);
    assert_eq!(store.latest_change_id().await.unwrap(), 2);
}

#[tokio::test]
async fn unknown_columns_are_rejected() {
    let store = store_with_node("unknown", 1).await;

    let mut customer = Customer::named("Ada");
    store.insert(&mut customer).await.unwrap();
    let id = customer.sync.id.unwrap();

    let mut changes = Payload::new();
    changes.insert("nickname".to_string(), json!("A"));
    assert!(matches!(
        store.update_row("customers", id, &changes).await,
        Err(SyncError::InvalidEntity(_))
    ));
}

#[tokio::test]
async fn watermarks_default_to_zero_and_never_decrease() {
    let store = store_with_node("state", 1).await;

    let state = store.sync_state("server").await.unwrap();
    assert_eq!(state.last_pulled_change_id, 0);
    assert_eq!(state.last_pushed_change_id, 0);

    store.advance_last_pulled("server", 5).await.unwrap();
    store.advance_last_pulled("server", 3).await.unwrap();
    store.advance_last_pushed("server", 8).await.unwrap();
    store.advance_last_pushed("server", 2).await.unwrap();

    let state = store.sync_state("server").await.unwrap();
    assert_eq!(state.last_pulled_change_id, 5);
    assert_eq!(state.last_pushed_change_id, 8);
}

#[tokio::test]
async fn redelivered_changes_are_idempotent() {
    let store = store_with_node("dedup", 1).await;

    let row_id = rowsync_core::RowId::from_parts(1000, 0, 1);
    let mut payload = Payload::new();
    payload.insert("name".to_string(), json!("Remote"));
    let entry = remote_change(
        9,
        "customers",
        row_id,
        ChangeOp::Insert,
        1,
        payload,
        "0",
    );

    let first = store
        .ingest_entry(&entry, ConflictPolicy::LastWriteWins, None)
        .await
        .unwrap();
    assert!(first);

    // transient push failure on the peer's side: same entry arrives again
    let second = store
        .ingest_entry(&entry, ConflictPolicy::LastWriteWins, None)
        .await
        .unwrap();
    assert!(!second, "equal (version, updated_at) is not newer");

    let relayed = store.changelog_after(0, None, 10).await.unwrap();
    assert_eq!(relayed.len(), 1, "recorded exactly once");
    assert_eq!(relayed[0].origin_node_id, "0", "author preserved");

    let row = store.fetch_row("customers", row_id).await.unwrap().unwrap();
    assert_eq!(row.data.get("name"), Some(&json!("Remote")));
    assert_eq!(row.sync.version, 1);
}
