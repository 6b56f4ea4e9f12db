use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumString};

/// Epoch for row id timestamps: 2024-01-01T00:00:00Z in unix milliseconds.
pub const ID_EPOCH_MS: u64 = 1_704_067_200_000;

pub const NODE_ID_BITS: u32 = 10;
pub const SEQUENCE_BITS: u32 = 12;
pub const MAX_NODE_ID: u16 = (1 << NODE_ID_BITS) - 1;
pub const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;

/// Globally unique, roughly time-ordered 64-bit row identifier.
///
/// Layout, most to least significant: 42 bits of milliseconds since
/// [`ID_EPOCH_MS`], 10 bits of node id, 12 bits of per-millisecond
/// sequence. Ids minted on different nodes in the same millisecond never
/// collide, and ids from one allocator are monotonically non-decreasing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct RowId(pub u64);

impl RowId {
    pub fn from_parts(ms_since_epoch: u64, node_id: u16, sequence: u16) -> Self {
        RowId(
            (ms_since_epoch << (NODE_ID_BITS + SEQUENCE_BITS))
                | ((node_id as u64) << SEQUENCE_BITS)
                | sequence as u64,
        )
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.0 >> (NODE_ID_BITS + SEQUENCE_BITS)
    }

    pub fn node_id(&self) -> u16 {
        ((self.0 >> SEQUENCE_BITS) & MAX_NODE_ID as u64) as u16
    }

    pub fn sequence(&self) -> u16 {
        (self.0 & MAX_SEQUENCE as u64) as u16
    }

    /// SQLite stores rowids as signed 64-bit; the bit pattern round-trips.
    pub fn as_i64(&self) -> i64 {
        self.0 as i64
    }

    pub fn from_i64(raw: i64) -> Self {
        RowId(raw as u64)
    }
}

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// Column-name to value mapping carried by change entries and row images.
pub type Payload = BTreeMap<String, serde_json::Value>;

/// One append-only record describing a row-level mutation.
///
/// `change_id` is a dense local sequence per database; it is meaningful
/// only to the database that assigned it. `payload` is the full
/// post-image of the row (system columns only for deletes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub change_id: u64,
    pub table: String,
    pub row_id: RowId,
    pub op: ChangeOp,
    pub payload: Payload,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub origin_node_id: String,
    /// Local-clock insertion time; never shipped on the wire.
    #[serde(skip)]
    pub captured_at: Option<DateTime<Utc>>,
}

/// Per-peer watermarks for one sync relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub peer_id: String,
    pub last_pulled_change_id: u64,
    pub last_pushed_change_id: u64,
}

impl SyncState {
    pub fn zero(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            last_pulled_change_id: 0,
            last_pushed_change_id: 0,
        }
    }
}

/// The sync columns every mirrored entity carries.
///
/// `id` and `updated_at` are `None` until the store has inserted the row;
/// `version` starts at 1 on insert and bumps only on meaningful writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncFields {
    pub id: Option<RowId>,
    pub version: u64,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl SyncFields {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}
