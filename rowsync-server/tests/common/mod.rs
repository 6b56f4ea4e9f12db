#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use rowsync_core::{
    ColumnType, ConflictPolicy, EntityDef, IdAllocator, Mirrored, Payload, RowId, Schema,
    SqliteStore, SyncFields, SyncResult,
};
use rowsync_server::{router, AppState};

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

/// Boots a real server on an ephemeral port; returns its base URL and the
/// backing store for direct inspection.
pub async fn spawn_server(policy: ConflictPolicy) -> (String, Arc<SqliteStore>) {
    let store = store_with_node("server", 0).await;
    let state = Arc::new(AppState::new(store.clone(), policy).await.unwrap());
    let app = router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), store)
}

pub fn temp_cache_path(tag: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("rowsync-{}-{}.json", tag, Uuid::new_v4().simple()))
}
