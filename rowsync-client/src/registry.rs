use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use rowsync_core::{RegisterResponse, SyncError, SyncResult};

#[derive(Debug, Serialize, Deserialize)]
struct NodeCache {
    server_url: String,
    node_id: u16,
}

/// Returns this device's node id for `server_url`, registering once and
/// caching the result on disk.
///
/// The cache is keyed by server URL; a cache written against a different
/// server is ignored and re-registered over.
pub async fn ensure_node_id(server_url: &str, cache_path: &Path) -> SyncResult<u16> {
    let server_url = server_url.trim_end_matches('/');
    if let Some(node_id) = read_cache(cache_path, server_url) {
        debug!("using cached node id {} from {}", node_id, cache_path.display());
        return Ok(node_id);
    }

    let node_id = register(server_url).await?;
    write_cache(cache_path, server_url, node_id)?;
    info!("registered as node {} with {}", node_id, server_url);
    Ok(node_id)
}

fn read_cache(cache_path: &Path, server_url: &str) -> Option<u16> {
    let raw = std::fs::read_to_string(cache_path).ok()?;
    match serde_json::from_str::<NodeCache>(&raw) {
        Ok(cache) if cache.server_url == server_url => Some(cache.node_id),
        Ok(cache) => {
            warn!(
                "node id cache at {} was issued by {}, not {}; re-registering",
                cache_path.display(),
                cache.server_url,
                server_url
            );
            None
        }
        Err(e) => {
            warn!("unreadable node id cache at {}: {}", cache_path.display(), e);
            None
        }
    }
}

fn write_cache(cache_path: &Path, server_url: &str, node_id: u16) -> SyncResult<()> {
    let cache = NodeCache {
        server_url: server_url.to_string(),
        node_id,
    };
    std::fs::write(cache_path, serde_json::to_string_pretty(&cache)?)?;
    Ok(())
}

async fn register(server_url: &str) -> SyncResult<u16> {
    let url = format!("{server_url}/nodes/register");
    let response = reqwest::Client::new()
        .post(&url)
        .send()
        .await
        .map_err(|e| SyncError::Transport(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| String::new());
        return Err(SyncError::RegistrationDenied(format!(
            "{status}: {message}"
        )));
    }

    let body = response
        .json::<RegisterResponse>()
        .await
        .map_err(|e| SyncError::Transport(e.to_string()))?;
    Ok(body.node_id)
}
