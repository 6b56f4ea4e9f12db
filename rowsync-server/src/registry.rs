use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use rowsync_core::{RegisterResponse, SyncError, SyncResult, MAX_NODE_ID};

use crate::AppState;

const CREATE_NODES: &str = r#"
    CREATE TABLE IF NOT EXISTS nodes (
        node_id INTEGER PRIMARY KEY,
        client_token TEXT NOT NULL,
        registered_at TEXT NOT NULL
    )
"#;

const TAKEN_NODE_IDS: &str = "SELECT node_id FROM nodes ORDER BY node_id";

const INSERT_NODE: &str =
    "INSERT INTO nodes (node_id, client_token, registered_at) VALUES (?1, ?2, ?3)";

pub(crate) async fn init(pool: &SqlitePool) -> SyncResult<()> {
    sqlx::query(CREATE_NODES).execute(pool).await?;
    Ok(())
}

/// `POST /nodes/register`: issues this client a fresh node id.
pub async fn register_node(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RegisterResponse>, SyncError> {
    let node_id = allocate_node_id(state.store.pool()).await?;
    info!("issued node id {}", node_id);
    Ok(Json(RegisterResponse { node_id }))
}

/// Smallest free id in 1..=1023, persisted with a fresh client token.
/// Id 0 is reserved for the server itself.
pub async fn allocate_node_id(pool: &SqlitePool) -> SyncResult<u16> {
    let mut tx = pool.begin().await?;
    let taken: Vec<i64> = sqlx::query_scalar(TAKEN_NODE_IDS)
        .fetch_all(&mut *tx)
        .await?;

    let mut candidate: u16 = 1;
    for id in taken {
        if id == candidate as i64 {
            candidate += 1;
        } else if id > candidate as i64 {
            break;
        }
    }
    if candidate > MAX_NODE_ID {
        return Err(SyncError::RegistryExhausted);
    }

    sqlx::query(INSERT_NODE)
        .bind(candidate as i64)
        .bind(Uuid::new_v4().to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(candidate)
}
