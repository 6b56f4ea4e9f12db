use async_trait::async_trait;
use tracing::debug;

use rowsync_core::{
    ChangeBatch, ChangeEntry, PushRequest, PushResponse, SyncError, SyncResult, Transport,
};

/// [`Transport`] over the peer's HTTP sync endpoints.
///
/// Every failure, including non-2xx statuses, maps to
/// [`SyncError::Transport`]; callers bound a sync by configuring a timeout
/// on the underlying [`reqwest::Client`].
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn pull(
        &self,
        since: u64,
        exclude_origin: &str,
        limit: u32,
    ) -> SyncResult<ChangeBatch> {
        let url = format!("{}/sync/changes", self.base_url);
        debug!("GET {} since={} limit={}", url, since, limit);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("since", since.to_string()),
                ("exclude_origin", exclude_origin.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await
            .map_err(transport_err)?;
        let response = ok_or_status(response)?;
        response.json::<ChangeBatch>().await.map_err(transport_err)
    }

    async fn push(&self, entries: &[ChangeEntry]) -> SyncResult<u64> {
        let url = format!("{}/sync/changes", self.base_url);
        debug!("POST {} with {} changes", url, entries.len());
        let response = self
            .client
            .post(&url)
            .json(&PushRequest {
                changes: entries.to_vec(),
            })
            .send()
            .await
            .map_err(transport_err)?;
        let response = ok_or_status(response)?;
        let body = response
            .json::<PushResponse>()
            .await
            .map_err(transport_err)?;
        Ok(body.highest_accepted_change_id)
    }
}

fn transport_err(error: reqwest::Error) -> SyncError {
    SyncError::Transport(error.to_string())
}

fn ok_or_status(response: reqwest::Response) -> SyncResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(SyncError::Transport(format!("peer returned {status}")))
    }
}
