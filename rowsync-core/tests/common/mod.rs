#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use rowsync_core::{
    ChangeBatch, ChangeEntry, ChangeOp, ColumnType, ConflictPolicy, EntityDef, IdAllocator,
    Mirrored, Payload, RowId, Schema, SqliteStore, SyncFields, SyncResult, Transport,
};

#[derive(Debug, Clone, Default)]
pub struct Customer {
    pub sync: SyncFields,
    pub name: Option<String>,
}

impl Customer {
    pub fn named(name: &str) -> Self {
        Self {
            sync: SyncFields::default(),
            name: Some(name.to_string()),
        }
    }
}

impl Mirrored for Customer {
    fn table() -> &'static str {
        "customers"
    }

    fn entity_def() -> EntityDef {
        EntityDef::new("customers").column("name", ColumnType::Text)
    }

    fn sync(&self) -> &SyncFields {
        &self.sync
    }

    fn sync_mut(&mut self) -> &mut SyncFields {
        &mut self.sync
    }

    fn data(&self) -> Payload {
        let mut data = Payload::new();
        data.insert(
            "name".to_string(),
            self.name.clone().map(Value::String).unwrap_or(Value::Null),
        );
        data
    }

    fn from_row(sync: SyncFields, data: &Payload) -> SyncResult<Self> {
        Ok(Self {
            sync,
            name: data
                .get("name")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Order {
    pub sync: SyncFields,
    pub customer_id: Option<RowId>,
    pub amount: f64,
}

impl Order {
    pub fn for_customer(customer_id: RowId, amount: f64) -> Self {
        Self {
            sync: SyncFields::default(),
            customer_id: Some(customer_id),
            amount,
        }
    }
}

impl Mirrored for Order {
    fn table() -> &'static str {
        "orders"
    }

    fn entity_def() -> EntityDef {
        EntityDef::new("orders")
            .column("amount", ColumnType::Real)
            .fk("customer_id", "customers")
    }

    fn sync(&self) -> &SyncFields {
        &self.sync
    }

    fn sync_mut(&mut self) -> &mut SyncFields {
        &mut self.sync
    }

    fn data(&self) -> Payload {
        let mut data = Payload::new();
        data.insert("amount".to_string(), json!(self.amount));
        data.insert(
            "customer_id".to_string(),
            self.customer_id.map(|id| json!(id.0)).unwrap_or(Value::Null),
        );
        data
    }

    fn from_row(sync: SyncFields, data: &Payload) -> SyncResult<Self> {
        Ok(Self {
            sync,
            customer_id: data
                .get("customer_id")
                .and_then(|v| v.as_u64())
                .map(RowId),
            amount: data.get("amount").and_then(|v| v.as_f64()).unwrap_or(0.0),
        })
    }
}

pub fn test_schema() -> Arc<Schema> {
    Arc::new(
        Schema::builder()
            .entity::<Customer>()
            .entity::<Order>()
            .build()
            .unwrap(),
    )
}

/// Unique shared-cache in-memory database per test, so tests stay isolated
/// while every pool connection sees the same data.
pub fn mem_url(tag: &str) -> String {
    format!(
        "sqlite:file:{}_{}?mode=memory&cache=shared",
        tag,
        Uuid::new_v4().simple()
    )
}

pub async fn store_with_node(tag: &str, node_id: u16) -> Arc<SqliteStore> {
    let allocator = Arc::new(IdAllocator::new(node_id).unwrap());
    Arc::new(
        SqliteStore::connect(&mem_url(tag), test_schema(), node_id)
            .await
            .unwrap()
            .with_allocator(allocator),
    )
}

/// Crafts a remote change entry the way a peer's changelog would hand it
/// out. System values ride on the entry; the payload carries data columns
/// (plus `deleted_at` for deletes).
pub fn remote_change(
    change_id: u64,
    table: &str,
    row_id: RowId,
    op: ChangeOp,
    version: u64,
    payload: Payload,
    origin: &str,
) -> ChangeEntry {
    ChangeEntry {
        change_id,
        table: table.to_string(),
        row_id,
        op,
        payload,
        version,
        updated_at: Utc::now(),
        origin_node_id: origin.to_string(),
        captured_at: None,
    }
}

/// In-process stand-in for the server side of the wire: pull reads the
/// remote store's changelog, push ingests into it, exactly like the HTTP
/// handlers do.
pub struct LocalTransport {
    pub remote: Arc<SqliteStore>,
    pub policy: ConflictPolicy,
}

impl LocalTransport {
    pub fn new(remote: Arc<SqliteStore>) -> Self {
        Self {
            remote,
            policy: ConflictPolicy::LastWriteWins,
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn pull(
        &self,
        since: u64,
        exclude_origin: &str,
        limit: u32,
    ) -> SyncResult<ChangeBatch> {
        let mut changes = self
            .remote
            .changelog_after(since, Some(exclude_origin), limit + 1)
            .await?;
        let has_more = changes.len() as u32 > limit;
        changes.truncate(limit as usize);
        Ok(ChangeBatch { changes, has_more })
    }

    async fn push(&self, entries: &[ChangeEntry]) -> SyncResult<u64> {
        let mut highest = 0u64;
        for entry in entries {
            self.remote.ingest_entry(entry, self.policy, None).await?;
            highest = highest.max(entry.change_id);
        }
        Ok(highest)
    }
}

/// Hands out pre-scripted pull batches; push confirms everything.
pub struct ScriptedTransport {
    batches: Mutex<VecDeque<ChangeBatch>>,
}

impl ScriptedTransport {
    pub fn new(batches: Vec<ChangeBatch>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn pull(
        &self,
        _since: u64,
        _exclude_origin: &str,
        _limit: u32,
    ) -> SyncResult<ChangeBatch> {
        Ok(self
            .batches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }

    async fn push(&self, entries: &[ChangeEntry]) -> SyncResult<u64> {
        Ok(entries.last().map(|e| e.change_id).unwrap_or(0))
    }
}
