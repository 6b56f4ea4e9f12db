use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::ChangeEntry;
use crate::SyncResult;

pub const DEFAULT_BATCH_SIZE: u32 = 500;

/// One page of changes from a peer, ascending `change_id`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub changes: Vec<ChangeEntry>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub changes: Vec<ChangeEntry>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PushResponse {
    pub highest_accepted_change_id: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub node_id: u16,
}

/// Query string of `GET /sync/changes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullQuery {
    #[serde(default)]
    pub since: u64,
    #[serde(default)]
    pub exclude_origin: String,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    DEFAULT_BATCH_SIZE
}

/// Moves batches of changes and watermark queries over a request/response
/// channel. Implementations map their failures to
/// [`SyncError::Transport`](crate::SyncError::Transport), which is always
/// retryable by the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Changes newer than `since`, excluding entries authored by
    /// `exclude_origin`, at most `limit` of them.
    async fn pull(
        &self,
        since: u64,
        exclude_origin: &str,
        limit: u32,
    ) -> SyncResult<ChangeBatch>;

    /// Ships entries (ascending `change_id`); returns the highest
    /// `change_id` the peer confirmed.
    async fn push(&self, entries: &[ChangeEntry]) -> SyncResult<u64>;
}
