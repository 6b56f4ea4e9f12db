use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use rowsync_core::{ConflictPolicy, EntityDef, IdAllocator, Schema, SqliteStore};
use rowsync_server::{router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("rowsync_server=debug,tower_http=debug")),
        )
        .init();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:rowsync-server.db".to_string());
    let schema_path =
        std::env::var("SCHEMA_PATH").unwrap_or_else(|_| "schema.json".to_string());
    let policy = std::env::var("SYNC_POLICY")
        .ok()
        .map(|raw| raw.parse::<ConflictPolicy>())
        .transpose()
        .map_err(|_| "SYNC_POLICY must be last_write_wins or version_strict")?
        .unwrap_or_default();

    let entities: Vec<EntityDef> =
        serde_json::from_str(&std::fs::read_to_string(&schema_path)?)?;
    let schema = Arc::new(Schema::build(entities)?);

    // node id 0 is reserved for the server
    let store = Arc::new(
        SqliteStore::connect(&database_url, schema, 0)
            .await?
            .with_allocator(Arc::new(IdAllocator::new(0)?)),
    );
    let state = Arc::new(AppState::new(store, policy).await?);
    let app = router(state);

    let addr = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    tracing::info!("Starting rowsync server on {} with policy {}", addr, policy);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
