use std::collections::HashMap;
use std::sync::Arc;

use strum::{Display, EnumString};
use tracing::{debug, info, warn};

use crate::models::ChangeEntry;
use crate::protocol::{Transport, DEFAULT_BATCH_SIZE};
use crate::store::SqliteStore;
use crate::SyncResult;

/// How an incoming entry is weighed against the local row.
///
/// `LastWriteWins` coalesces concurrent updates by `(version,
/// updated_at)`; `VersionStrict` requires strictly sequential versions
/// and surfaces a gap to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    LastWriteWins,
    VersionStrict,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pulled: u64,
    pub pushed: u64,
}

/// Orchestrates pull-then-push against one peer.
///
/// One engine instance is driven by one caller at a time; concurrent
/// `pull_then_push` on the same engine is undefined. The engine never
/// retries: a transport error aborts the invocation with watermarks
/// unchanged, and retry policy belongs to the caller.
pub struct SyncEngine<T: Transport> {
    store: Arc<SqliteStore>,
    transport: T,
    peer_id: String,
    policy: ConflictPolicy,
    batch_size: u32,
}

impl<T: Transport> SyncEngine<T> {
    pub fn new(
        store: Arc<SqliteStore>,
        transport: T,
        peer_id: impl Into<String>,
        policy: ConflictPolicy,
    ) -> Self {
        Self {
            store,
            transport,
            peer_id: peer_id.into(),
            policy,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn node_id(&self) -> u16 {
        self.store.node_id()
    }

    pub async fn pull_then_push(&self) -> SyncResult<SyncReport> {
        let pulled = self.pull().await?;
        let pushed = self.push().await?;
        info!(
            "sync with {} complete: pulled {}, pushed {}",
            self.peer_id, pulled, pushed
        );
        Ok(SyncReport { pulled, pushed })
    }

    /// Pulls and applies remote changes until the peer reports no more.
    pub async fn pull(&self) -> SyncResult<u64> {
        let origin = self.store.origin_node_id().to_string();
        let mut total = 0u64;
        loop {
            let since = self
                .store
                .sync_state(&self.peer_id)
                .await?
                .last_pulled_change_id;
            let batch = self.transport.pull(since, &origin, self.batch_size).await?;
            if batch.changes.is_empty() {
                break;
            }
            debug!(
                "pulled {} changes from {} (since {})",
                batch.changes.len(),
                self.peer_id,
                since
            );
            total += self.apply_batch(&batch.changes, &origin).await? as u64;
            if !batch.has_more {
                break;
            }
        }
        Ok(total)
    }

    /// Applies one pulled batch: parents before children, `change_id`
    /// order within each table. The persisted watermark only ever covers
    /// the contiguous prefix (by `change_id`) of applied entries, so a
    /// failure leaves it just before the first entry not fully applied.
    async fn apply_batch(&self, changes: &[ChangeEntry], origin: &str) -> SyncResult<usize> {
        let mut by_change: Vec<&ChangeEntry> = changes.iter().collect();
        by_change.sort_by_key(|e| e.change_id);
        let index_of: HashMap<u64, usize> = by_change
            .iter()
            .enumerate()
            .map(|(idx, e)| (e.change_id, idx))
            .collect();

        let mut ordered = by_change.clone();
        ordered.sort_by_key(|e| {
            (
                self.store.schema().order_index(&e.table).unwrap_or(usize::MAX),
                e.change_id,
            )
        });

        let mut applied = vec![false; by_change.len()];
        let mut prefix = 0usize;
        let mut processed = 0usize;

        for entry in ordered {
            let idx = index_of[&entry.change_id];
            if entry.origin_node_id == origin {
                // the transport must already exclude these; never apply one
                warn!(
                    "peer {} returned self-authored change {}; skipping",
                    self.peer_id, entry.change_id
                );
                mark_applied(&mut applied, &mut prefix, idx);
                continue;
            }

            let watermark = watermark_after(&applied, prefix, idx, &by_change);
            match self
                .store
                .ingest_entry(
                    entry,
                    self.policy,
                    watermark.map(|value| (self.peer_id.as_str(), value)),
                )
                .await
            {
                Ok(_) => {
                    mark_applied(&mut applied, &mut prefix, idx);
                    processed += 1;
                }
                Err(e) => {
                    warn!(
                        "apply stopped at change {} from {}: {}",
                        entry.change_id, self.peer_id, e
                    );
                    return Err(e);
                }
            }
        }

        // every entry landed; the batch tail is the new watermark
        if let Some(last) = by_change.last() {
            self.store
                .advance_last_pulled(&self.peer_id, last.change_id)
                .await?;
        }
        Ok(processed)
    }

    /// Ships locally-authored changes newer than the pushed watermark.
    /// Echoes authored elsewhere belong to their own peer relationships
    /// and are never pushed.
    pub async fn push(&self) -> SyncResult<u64> {
        let origin = self.store.origin_node_id();
        let mut total = 0u64;
        loop {
            let state = self.store.sync_state(&self.peer_id).await?;
            let entries = self
                .store
                .changelog_from_origin(state.last_pushed_change_id, origin, self.batch_size)
                .await?;
            if entries.is_empty() {
                break;
            }

            let highest = self.transport.push(&entries).await?;
            let confirmed = entries
                .iter()
                .filter(|e| e.change_id <= highest)
                .count() as u64;
            if highest > state.last_pushed_change_id {
                self.store
                    .advance_last_pushed(&self.peer_id, highest)
                    .await?;
                total += confirmed;
            }

            let last_sent = entries.last().map(|e| e.change_id).unwrap_or(0);
            if highest < last_sent {
                // peer confirmed only a prefix; stop here, the caller retries later
                warn!(
                    "peer {} confirmed {} of {} pushed changes",
                    self.peer_id,
                    confirmed,
                    entries.len()
                );
                break;
            }
            if (entries.len() as u32) < self.batch_size {
                break;
            }
        }
        Ok(total)
    }
}

fn mark_applied(applied: &mut [bool], prefix: &mut usize, idx: usize) {
    applied[idx] = true;
    while *prefix < applied.len() && applied[*prefix] {
        *prefix += 1;
    }
}

/// The watermark that becomes valid once the entry at `idx` lands: the
/// `change_id` closing the contiguous applied prefix. `None` when the
/// entry does not extend the prefix (an earlier `change_id` is still
/// outstanding).
fn watermark_after(
    applied: &[bool],
    prefix: usize,
    idx: usize,
    by_change: &[&ChangeEntry],
) -> Option<u64> {
    if idx != prefix {
        return None;
    }
    let mut end = idx + 1;
    while end < applied.len() && applied[end] {
        end += 1;
    }
    Some(by_change[end - 1].change_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeOp, Payload, RowId};
    use chrono::Utc;

    fn entry(change_id: u64) -> ChangeEntry {
        ChangeEntry {
            change_id,
            table: "customers".into(),
            row_id: RowId(change_id),
            op: ChangeOp::Update,
            payload: Payload::new(),
            version: 1,
            updated_at: Utc::now(),
            origin_node_id: "0".into(),
            captured_at: None,
        }
    }

    #[test]
    fn policy_strings() {
        assert_eq!(ConflictPolicy::LastWriteWins.to_string(), "last_write_wins");
        assert_eq!(
            "version_strict".parse::<ConflictPolicy>().unwrap(),
            ConflictPolicy::VersionStrict
        );
    }

    #[test]
    fn watermark_follows_the_contiguous_prefix() {
        let entries = [entry(10), entry(11), entry(12), entry(13)];
        let by_change: Vec<&ChangeEntry> = entries.iter().collect();
        let mut applied = vec![false; 4];
        let mut prefix = 0;

        // change 12 lands first (its table sorted earlier); no watermark yet
        assert_eq!(watermark_after(&applied, prefix, 2, &by_change), None);
        mark_applied(&mut applied, &mut prefix, 2);
        assert_eq!(prefix, 0);

        // change 10 extends the prefix to itself
        assert_eq!(watermark_after(&applied, prefix, 0, &by_change), Some(10));
        mark_applied(&mut applied, &mut prefix, 0);
        assert_eq!(prefix, 1);

        // change 11 closes the gap; the prefix jumps over 12
        assert_eq!(watermark_after(&applied, prefix, 1, &by_change), Some(12));
        mark_applied(&mut applied, &mut prefix, 1);
        assert_eq!(prefix, 3);

        assert_eq!(watermark_after(&applied, prefix, 3, &by_change), Some(13));
    }
}
