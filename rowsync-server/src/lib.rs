use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use rowsync_core::{ConflictPolicy, SqliteStore, SyncResult};

pub mod api;
pub mod registry;

pub struct AppState {
    pub store: Arc<SqliteStore>,
    pub policy: ConflictPolicy,
}

impl AppState {
    pub async fn new(store: Arc<SqliteStore>, policy: ConflictPolicy) -> SyncResult<Self> {
        registry::init(store.pool()).await?;
        Ok(Self { store, policy })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/sync/changes",
            get(api::pull_changes).post(api::push_changes),
        )
        .route("/nodes/register", post(registry::register_node))
        .route("/health", get(|| async { "OK" }))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
