use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use tracing::{debug, warn};

use rowsync_core::{ChangeBatch, PullQuery, PushRequest, PushResponse, SyncError};

use crate::AppState;

const MAX_PULL_LIMIT: u32 = 1000;

/// `GET /sync/changes`: the peer's pull. Returns changes newer than
/// `since`, never including entries the puller authored itself.
pub async fn pull_changes(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PullQuery>,
) -> Result<Json<ChangeBatch>, SyncError> {
    let limit = query.limit.clamp(1, MAX_PULL_LIMIT);
    let exclude = (!query.exclude_origin.is_empty()).then_some(query.exclude_origin.as_str());
    let mut changes = state
        .store
        .changelog_after(query.since, exclude, limit + 1)
        .await?;
    let has_more = changes.len() as u32 > limit;
    changes.truncate(limit as usize);

    debug!(
        "pull since={} exclude={:?}: {} changes, has_more={}",
        query.since,
        exclude,
        changes.len(),
        has_more
    );
    Ok(Json(ChangeBatch { changes, has_more }))
}

/// `POST /sync/changes`: the peer's push. Entries arrive in the pusher's
/// ascending `change_id` order and are ingested one by one; on a mid-batch
/// failure the already-ingested prefix is confirmed so the pusher's
/// watermark stops just before the failed entry.
pub async fn push_changes(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>, SyncError> {
    let mut highest = 0u64;
    for (idx, entry) in request.changes.iter().enumerate() {
        match state.store.ingest_entry(entry, state.policy, None).await {
            Ok(_) => highest = highest.max(entry.change_id),
            Err(e) if idx == 0 => return Err(e),
            Err(e) => {
                warn!(
                    "push from node {} stopped at change {}: {}",
                    entry.origin_node_id, entry.change_id, e
                );
                break;
            }
        }
    }

    debug!(
        "accepted {} pushed changes up to change {}",
        request.changes.len(),
        highest
    );
    Ok(Json(PushResponse {
        highest_accepted_change_id: highest,
    }))
}
