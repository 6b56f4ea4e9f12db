use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::debug;

use crate::engine::ConflictPolicy;
use crate::errors::SyncError;
use crate::idgen::{self, IdAllocator};
use crate::models::{ChangeEntry, ChangeOp, Payload, RowId, SyncFields, SyncState, MAX_NODE_ID};
use crate::schema::{is_system_column, ColumnDef, ColumnType, EntityDef, Mirrored, Schema};
use crate::SyncResult;

/// SQL for the engine-managed tables. Entity tables are generated from the
/// schema at connect time.
struct Queries;

impl Queries {
    const CREATE_CHANGELOG: &'static str = r#"
        CREATE TABLE IF NOT EXISTS sync_changelog (
            change_id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity TEXT NOT NULL,
            row_id INTEGER NOT NULL,
            op TEXT NOT NULL,
            payload TEXT NOT NULL,
            version INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            origin_node_id TEXT NOT NULL,
            captured_at TEXT NOT NULL,
            CHECK (op IN ('insert', 'update', 'delete'))
        )
    "#;

    /// Re-delivery of the same change is idempotent by construction.
    const CREATE_CHANGELOG_INDEX: &'static str = r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_changelog_origin_row_version
        ON sync_changelog (origin_node_id, entity, row_id, version)
    "#;

    const CREATE_SYNC_STATE: &'static str = r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            peer_id TEXT PRIMARY KEY,
            last_pulled_change_id INTEGER NOT NULL DEFAULT 0,
            last_pushed_change_id INTEGER NOT NULL DEFAULT 0
        )
    "#;

    const INSERT_CHANGE: &'static str = r#"
        INSERT OR IGNORE INTO sync_changelog
            (entity, row_id, op, payload, version, updated_at, origin_node_id, captured_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
    "#;

    const CHANGES_EXCLUDING_ORIGIN: &'static str = r#"
        SELECT change_id, entity, row_id, op, payload, version, updated_at,
               origin_node_id, captured_at
        FROM sync_changelog
        WHERE change_id > ?1 AND origin_node_id != ?2
        ORDER BY change_id ASC
        LIMIT ?3
    "#;

    const CHANGES_FROM_ORIGIN: &'static str = r#"
        SELECT change_id, entity, row_id, op, payload, version, updated_at,
               origin_node_id, captured_at
        FROM sync_changelog
        WHERE change_id > ?1 AND origin_node_id = ?2
        ORDER BY change_id ASC
        LIMIT ?3
    "#;

    const CHANGES_AFTER: &'static str = r#"
        SELECT change_id, entity, row_id, op, payload, version, updated_at,
               origin_node_id, captured_at
        FROM sync_changelog
        WHERE change_id > ?1
        ORDER BY change_id ASC
        LIMIT ?2
    "#;

    const LATEST_CHANGE_ID: &'static str =
        "SELECT COALESCE(MAX(change_id), 0) FROM sync_changelog";

    const GET_SYNC_STATE: &'static str = r#"
        SELECT peer_id, last_pulled_change_id, last_pushed_change_id
        FROM sync_state
        WHERE peer_id = ?1
    "#;

    const ADVANCE_PULLED: &'static str = r#"
        INSERT INTO sync_state (peer_id, last_pulled_change_id, last_pushed_change_id)
        VALUES (?1, ?2, 0)
        ON CONFLICT(peer_id) DO UPDATE SET
            last_pulled_change_id = MAX(last_pulled_change_id, excluded.last_pulled_change_id)
    "#;

    const ADVANCE_PUSHED: &'static str = r#"
        INSERT INTO sync_state (peer_id, last_pulled_change_id, last_pushed_change_id)
        VALUES (?1, 0, ?2)
        ON CONFLICT(peer_id) DO UPDATE SET
            last_pushed_change_id = MAX(last_pushed_change_id, excluded.last_pushed_change_id)
    "#;
}

/// Identifies who authored a write going through the store.
///
/// Threaded explicitly through the write path rather than kept as a flag
/// on the session: `Local` writes are captured into the changelog,
/// `Replica` writes are applies of remote entries and must not re-capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteSource<'a> {
    Local,
    Replica { origin_node_id: &'a str },
}

/// A row as stored: its sync columns plus the data-column image.
#[derive(Debug, Clone)]
pub struct StoredRow {
    pub sync: SyncFields,
    pub data: Payload,
}

impl StoredRow {
    /// Full post-image: system columns plus data columns.
    pub fn full_image(&self) -> Payload {
        let mut image = self.system_image();
        image.extend(self.data.clone());
        image
    }

    pub fn system_image(&self) -> Payload {
        system_image(
            self.sync.id.unwrap_or_default(),
            self.sync.version,
            &self.sync.updated_at.unwrap_or(DateTime::<Utc>::MIN_UTC),
            self.sync.deleted_at.as_ref(),
        )
    }
}

/// The entity row store, changelog, and change-capture layer in one.
///
/// Every write path runs inside a single SQLite transaction, so a
/// committed row always has its matching changelog tail and an aborted
/// transaction leaves no orphan entries.
pub struct SqliteStore {
    pool: SqlitePool,
    schema: Arc<Schema>,
    node_id: u16,
    origin_node_id: String,
    allocator: Option<Arc<IdAllocator>>,
}

impl SqliteStore {
    pub async fn connect(
        database_url: &str,
        schema: Arc<Schema>,
        node_id: u16,
    ) -> SyncResult<Self> {
        if node_id > MAX_NODE_ID {
            return Err(SyncError::BadNodeId(node_id));
        }
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            schema,
            node_id,
            origin_node_id: node_id.to_string(),
            allocator: None,
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Default allocator used when no thread-local binding is active.
    pub fn with_allocator(mut self, allocator: Arc<IdAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    pub fn origin_node_id(&self) -> &str {
        &self.origin_node_id
    }

    async fn init_schema(&self) -> SyncResult<()> {
        sqlx::query(Queries::CREATE_CHANGELOG)
            .execute(&self.pool)
            .await?;
        sqlx::query(Queries::CREATE_CHANGELOG_INDEX)
            .execute(&self.pool)
            .await?;
        sqlx::query(Queries::CREATE_SYNC_STATE)
            .execute(&self.pool)
            .await?;
        for def in self.schema.entities() {
            sqlx::query(&create_table_sql(def))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// The thread-local binding, when present, takes precedence over the
    /// store's own allocator so hosts can rebind per request.
    fn allocator(&self) -> SyncResult<Arc<IdAllocator>> {
        if let Ok(bound) = idgen::current_allocator() {
            return Ok(bound);
        }
        self.allocator.clone().ok_or(SyncError::NoAllocatorBound)
    }

    fn entity(&self, table: &str) -> SyncResult<&EntityDef> {
        self.schema
            .entity(table)
            .ok_or_else(|| SyncError::UnknownEntity(table.to_string()))
    }

    // ------------------------------------------------------------------
    // local writes (captured)
    // ------------------------------------------------------------------

    /// Inserts a row, minting an id when the caller supplied none.
    pub async fn insert_row(
        &self,
        table: &str,
        id: Option<RowId>,
        data: &Payload,
    ) -> SyncResult<SyncFields> {
        let def = self.entity(table)?;
        validate_data_columns(def, data)?;

        let id = match id {
            Some(id) => id,
            None => self.allocator()?.next_id(),
        };
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        let sql = insert_sql(def);
        let mut query = sqlx::query(&sql)
            .bind(id.as_i64())
            .bind(1i64)
            .bind(ts(&now))
            .bind(None::<String>);
        for col in &def.columns {
            query = bind_column(query, def, col, data.get(&col.name))?;
        }
        query.execute(&mut *tx).await?;

        let fields = SyncFields {
            id: Some(id),
            version: 1,
            updated_at: Some(now),
            deleted_at: None,
        };
        let row = StoredRow {
            sync: fields.clone(),
            data: complete_data(def, data),
        };
        self.append_changelog(
            &mut tx,
            table,
            id,
            ChangeOp::Insert,
            &row.full_image(),
            1,
            &now,
            WriteSource::Local,
        )
        .await?;
        tx.commit().await?;

        debug!("captured insert of {}.{}", table, id);
        Ok(fields)
    }

    /// Applies column assignments to a row.
    ///
    /// The dirty set is computed against the pre-image, so reassigning an
    /// identical value does not count. A write whose dirty set is only
    /// system columns persists without a version bump and without capture.
    pub async fn update_row(
        &self,
        table: &str,
        id: RowId,
        changes: &Payload,
    ) -> SyncResult<SyncFields> {
        let def = self.entity(table)?;
        for key in changes.keys() {
            if !is_system_column(key) && def.data_column(key).is_none() {
                return Err(SyncError::InvalidEntity(format!(
                    "unknown column {table}.{key}"
                )));
            }
        }

        let mut tx = self.pool.begin().await?;
        let pre = self
            .fetch_row_tx(&mut tx, def, id)
            .await?
            .ok_or_else(|| SyncError::RowNotFound {
                table: table.to_string(),
                row_id: id,
            })?;

        let pre_image = pre.full_image();
        let dirty: Vec<&str> = changes
            .iter()
            .filter(|&(key, value)| pre_image.get(key.as_str()) != Some(value))
            .map(|(key, _)| key.as_str())
            .collect();
        if dirty.contains(&"id") {
            return Err(SyncError::InvalidEntity(format!("{table}.id is immutable")));
        }
        if dirty.is_empty() {
            return Ok(pre.sync);
        }
        let meaningful = dirty.iter().any(|col| !is_system_column(col));

        let mut post_data = pre.data.clone();
        for (key, value) in changes {
            if def.data_column(key).is_some() {
                post_data.insert(key.clone(), value.clone());
            }
        }

        let (version, updated_at, deleted_at) = if meaningful {
            let deleted_at = match changes.get("deleted_at") {
                Some(value) => parse_timestamp_value(value)?,
                None => pre.sync.deleted_at,
            };
            (pre.sync.version + 1, Utc::now(), deleted_at)
        } else {
            // persist the assigned system values verbatim; version and id
            // stay engine-managed
            let updated_at = match changes.get("updated_at") {
                Some(value) => parse_timestamp_value(value)?
                    .unwrap_or(pre.sync.updated_at.unwrap_or(DateTime::<Utc>::MIN_UTC)),
                None => pre.sync.updated_at.unwrap_or(DateTime::<Utc>::MIN_UTC),
            };
            let deleted_at = match changes.get("deleted_at") {
                Some(value) => parse_timestamp_value(value)?,
                None => pre.sync.deleted_at,
            };
            (pre.sync.version, updated_at, deleted_at)
        };

        let sql = update_sql(def);
        let mut query = sqlx::query(&sql)
            .bind(version as i64)
            .bind(ts(&updated_at))
            .bind(deleted_at.as_ref().map(ts));
        for col in &def.columns {
            query = bind_column(query, def, col, post_data.get(&col.name))?;
        }
        query = query.bind(id.as_i64());
        query.execute(&mut *tx).await?;

        let fields = SyncFields {
            id: Some(id),
            version,
            updated_at: Some(updated_at),
            deleted_at,
        };
        if meaningful {
            let row = StoredRow {
                sync: fields.clone(),
                data: post_data,
            };
            let (op, payload) = if fields.deleted_at.is_some() {
                (ChangeOp::Delete, row.system_image())
            } else {
                (ChangeOp::Update, row.full_image())
            };
            self.append_changelog(
                &mut tx,
                table,
                id,
                op,
                &payload,
                version,
                &updated_at,
                WriteSource::Local,
            )
            .await?;
            debug!("captured {} of {}.{} at version {}", op, table, id, version);
        } else {
            debug!("suppressed non-meaningful update of {}.{}", table, id);
        }
        tx.commit().await?;
        Ok(fields)
    }

    /// Soft-deletes a row: sets `deleted_at`, bumps version, captures a
    /// delete entry. Deleting an already-deleted row is a no-op.
    pub async fn soft_delete_row(&self, table: &str, id: RowId) -> SyncResult<SyncFields> {
        let def = self.entity(table)?;
        let mut tx = self.pool.begin().await?;
        let pre = self
            .fetch_row_tx(&mut tx, def, id)
            .await?
            .ok_or_else(|| SyncError::RowNotFound {
                table: table.to_string(),
                row_id: id,
            })?;
        if pre.sync.deleted_at.is_some() {
            return Ok(pre.sync);
        }

        let now = Utc::now();
        let version = pre.sync.version + 1;
        let sql = update_sql(def);
        let mut query = sqlx::query(&sql)
            .bind(version as i64)
            .bind(ts(&now))
            .bind(Some(ts(&now)));
        for col in &def.columns {
            query = bind_column(query, def, col, pre.data.get(&col.name))?;
        }
        query = query.bind(id.as_i64());
        query.execute(&mut *tx).await?;

        let fields = SyncFields {
            id: Some(id),
            version,
            updated_at: Some(now),
            deleted_at: Some(now),
        };
        let payload = StoredRow {
            sync: fields.clone(),
            data: pre.data,
        }
        .system_image();
        self.append_changelog(
            &mut tx,
            table,
            id,
            ChangeOp::Delete,
            &payload,
            version,
            &now,
            WriteSource::Local,
        )
        .await?;
        tx.commit().await?;

        debug!("captured delete of {}.{} at version {}", table, id, version);
        Ok(fields)
    }

    // ------------------------------------------------------------------
    // typed front doors
    // ------------------------------------------------------------------

    pub async fn insert<E: Mirrored>(&self, entity: &mut E) -> SyncResult<()> {
        let fields = self
            .insert_row(E::table(), entity.sync().id, &entity.data())
            .await?;
        *entity.sync_mut() = fields;
        Ok(())
    }

    pub async fn update<E: Mirrored>(&self, entity: &mut E) -> SyncResult<()> {
        let id = entity.sync().id.ok_or_else(|| {
            SyncError::InvalidEntity(format!("{} update requires an id", E::table()))
        })?;
        let fields = self.update_row(E::table(), id, &entity.data()).await?;
        *entity.sync_mut() = fields;
        Ok(())
    }

    pub async fn soft_delete<E: Mirrored>(&self, entity: &mut E) -> SyncResult<()> {
        let id = entity.sync().id.ok_or_else(|| {
            SyncError::InvalidEntity(format!("{} delete requires an id", E::table()))
        })?;
        let fields = self.soft_delete_row(E::table(), id).await?;
        *entity.sync_mut() = fields;
        Ok(())
    }

    pub async fn get<E: Mirrored>(&self, id: RowId) -> SyncResult<Option<E>> {
        match self.fetch_row(E::table(), id).await? {
            Some(row) => Ok(Some(E::from_row(row.sync, &row.data)?)),
            None => Ok(None),
        }
    }

    pub async fn fetch_row(&self, table: &str, id: RowId) -> SyncResult<Option<StoredRow>> {
        let def = self.entity(table)?;
        let sql = select_sql(def);
        let row = sqlx::query(&sql)
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| parse_row(def, &row)).transpose()
    }

    async fn fetch_row_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        def: &EntityDef,
        id: RowId,
    ) -> SyncResult<Option<StoredRow>> {
        let sql = select_sql(def);
        let row = sqlx::query(&sql)
            .bind(id.as_i64())
            .fetch_optional(&mut **tx)
            .await?;
        row.map(|row| parse_row(def, &row)).transpose()
    }

    // ------------------------------------------------------------------
    // remote applies (capture-suppressed)
    // ------------------------------------------------------------------

    /// Applies one incoming entry under `policy`.
    ///
    /// Accepted entries upsert the row (no capture) and are recorded in the
    /// local changelog with the author's origin preserved; the unique
    /// changelog index makes re-delivery idempotent. When `watermark` is
    /// given, the pulled watermark advances in the same transaction.
    ///
    /// Returns whether the entry was applied (`false` means dropped as
    /// stale under last-write-wins, the one silently swallowed case).
    pub async fn ingest_entry(
        &self,
        entry: &ChangeEntry,
        policy: ConflictPolicy,
        watermark: Option<(&str, u64)>,
    ) -> SyncResult<bool> {
        let def = self.entity(&entry.table)?;

        let mut tx = self.pool.begin().await?;
        let pre = self.fetch_row_tx(&mut tx, def, entry.row_id).await?;
        let (local_version, local_updated_at) = match &pre {
            Some(row) => (
                row.sync.version,
                row.sync.updated_at.unwrap_or(DateTime::<Utc>::MIN_UTC),
            ),
            None => (0, DateTime::<Utc>::MIN_UTC),
        };

        let accepted = match policy {
            ConflictPolicy::LastWriteWins => {
                (entry.version, entry.updated_at) > (local_version, local_updated_at)
            }
            ConflictPolicy::VersionStrict => {
                if entry.version != local_version + 1 {
                    return Err(SyncError::VersionGap {
                        change_id: entry.change_id,
                        table: entry.table.clone(),
                        expected: local_version + 1,
                        actual: entry.version,
                    });
                }
                true
            }
        };

        if accepted {
            self.apply_image(&mut tx, def, entry, pre.as_ref()).await?;
            self.append_changelog(
                &mut tx,
                &entry.table,
                entry.row_id,
                entry.op,
                &entry.payload,
                entry.version,
                &entry.updated_at,
                WriteSource::Replica {
                    origin_node_id: &entry.origin_node_id,
                },
            )
            .await?;
        } else {
            debug!(
                "dropping stale change {} for {}.{} (local version {})",
                entry.change_id, entry.table, entry.row_id, local_version
            );
        }

        if let Some((peer_id, value)) = watermark {
            sqlx::query(Queries::ADVANCE_PULLED)
                .bind(peer_id)
                .bind(value as i64)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(accepted)
    }

    /// Upsert of the incoming post-image, `WriteSource::Replica` style:
    /// exact system values from the entry, data columns from the payload
    /// overlaid on whatever is already stored.
    async fn apply_image(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        def: &EntityDef,
        entry: &ChangeEntry,
        pre: Option<&StoredRow>,
    ) -> SyncResult<()> {
        let deleted_at = match entry.payload.get("deleted_at") {
            Some(value) => parse_timestamp_value(value)?,
            None => pre.and_then(|row| row.sync.deleted_at),
        };

        let sql = upsert_sql(def);
        let mut query = sqlx::query(&sql)
            .bind(entry.row_id.as_i64())
            .bind(entry.version as i64)
            .bind(ts(&entry.updated_at))
            .bind(deleted_at.as_ref().map(ts));
        for col in &def.columns {
            let value = entry
                .payload
                .get(&col.name)
                .or_else(|| pre.and_then(|row| row.data.get(&col.name)));
            query = bind_column(query, def, col, value)?;
        }
        query
            .execute(&mut **tx)
            .await
            .map_err(|e| SyncError::ApplyFailed {
                change_id: entry.change_id,
                table: entry.table.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // changelog
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn append_changelog(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        table: &str,
        row_id: RowId,
        op: ChangeOp,
        payload: &Payload,
        version: u64,
        updated_at: &DateTime<Utc>,
        source: WriteSource<'_>,
    ) -> SyncResult<Option<u64>> {
        let origin_node_id = match source {
            WriteSource::Local => self.origin_node_id.as_str(),
            WriteSource::Replica { origin_node_id } => origin_node_id,
        };
        let result = sqlx::query(Queries::INSERT_CHANGE)
            .bind(table)
            .bind(row_id.as_i64())
            .bind(op.to_string())
            .bind(serde_json::to_string(payload)?)
            .bind(version as i64)
            .bind(ts(updated_at))
            .bind(origin_node_id)
            .bind(ts(&Utc::now()))
            .execute(&mut **tx)
            .await?;
        if result.rows_affected() == 0 {
            // already recorded: same (origin, table, row, version)
            Ok(None)
        } else {
            Ok(Some(result.last_insert_rowid() as u64))
        }
    }

    /// Changes newer than `since`, optionally excluding one origin.
    pub async fn changelog_after(
        &self,
        since: u64,
        exclude_origin: Option<&str>,
        limit: u32,
    ) -> SyncResult<Vec<ChangeEntry>> {
        let rows = match exclude_origin {
            Some(origin) => {
                sqlx::query(Queries::CHANGES_EXCLUDING_ORIGIN)
                    .bind(since as i64)
                    .bind(origin)
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query(Queries::CHANGES_AFTER)
                    .bind(since as i64)
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(parse_change_row).collect()
    }

    /// Changes authored by `origin` newer than `since`; the push phase
    /// ships only these.
    pub async fn changelog_from_origin(
        &self,
        since: u64,
        origin: &str,
        limit: u32,
    ) -> SyncResult<Vec<ChangeEntry>> {
        let rows = sqlx::query(Queries::CHANGES_FROM_ORIGIN)
            .bind(since as i64)
            .bind(origin)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(parse_change_row).collect()
    }

    pub async fn latest_change_id(&self) -> SyncResult<u64> {
        let latest: i64 = sqlx::query_scalar(Queries::LATEST_CHANGE_ID)
            .fetch_one(&self.pool)
            .await?;
        Ok(latest as u64)
    }

    // ------------------------------------------------------------------
    // sync state
    // ------------------------------------------------------------------

    /// The watermarks for `peer_id`, zero-initialized when absent.
    pub async fn sync_state(&self, peer_id: &str) -> SyncResult<SyncState> {
        let row = sqlx::query(Queries::GET_SYNC_STATE)
            .bind(peer_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let pulled: i64 = row.try_get("last_pulled_change_id")?;
                let pushed: i64 = row.try_get("last_pushed_change_id")?;
                Ok(SyncState {
                    peer_id: peer_id.to_string(),
                    last_pulled_change_id: pulled as u64,
                    last_pushed_change_id: pushed as u64,
                })
            }
            None => Ok(SyncState::zero(peer_id)),
        }
    }

    /// Monotonic: a smaller value than the stored one is a no-op.
    pub async fn advance_last_pulled(&self, peer_id: &str, value: u64) -> SyncResult<()> {
        sqlx::query(Queries::ADVANCE_PULLED)
            .bind(peer_id)
            .bind(value as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn advance_last_pushed(&self, peer_id: &str, value: u64) -> SyncResult<()> {
        sqlx::query(Queries::ADVANCE_PUSHED)
            .bind(peer_id)
            .bind(value as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ----------------------------------------------------------------------
// SQL generation
// ----------------------------------------------------------------------

fn create_table_sql(def: &EntityDef) -> String {
    let mut parts = vec![
        "id INTEGER PRIMARY KEY".to_string(),
        "version INTEGER NOT NULL".to_string(),
        "updated_at TEXT NOT NULL".to_string(),
        "deleted_at TEXT".to_string(),
    ];
    for col in &def.columns {
        let ty = match col.ty {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
        };
        parts.push(format!("{} {}", col.name, ty));
    }
    for fk in &def.fk_edges {
        parts.push(format!(
            "FOREIGN KEY ({}) REFERENCES {}(id)",
            fk.column, fk.target
        ));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        def.name,
        parts.join(", ")
    )
}

fn column_names(def: &EntityDef) -> Vec<&str> {
    let mut names = vec!["id", "version", "updated_at", "deleted_at"];
    names.extend(def.columns.iter().map(|c| c.name.as_str()));
    names
}

fn insert_sql(def: &EntityDef) -> String {
    let names = column_names(def);
    let placeholders = vec!["?"; names.len()].join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        def.name,
        names.join(", "),
        placeholders
    )
}

fn update_sql(def: &EntityDef) -> String {
    let mut assignments = vec![
        "version = ?".to_string(),
        "updated_at = ?".to_string(),
        "deleted_at = ?".to_string(),
    ];
    for col in &def.columns {
        assignments.push(format!("{} = ?", col.name));
    }
    format!(
        "UPDATE {} SET {} WHERE id = ?",
        def.name,
        assignments.join(", ")
    )
}

fn upsert_sql(def: &EntityDef) -> String {
    let mut assignments = vec![
        "version = excluded.version".to_string(),
        "updated_at = excluded.updated_at".to_string(),
        "deleted_at = excluded.deleted_at".to_string(),
    ];
    for col in &def.columns {
        assignments.push(format!("{} = excluded.{}", col.name, col.name));
    }
    format!(
        "{} ON CONFLICT(id) DO UPDATE SET {}",
        insert_sql(def),
        assignments.join(", ")
    )
}

fn select_sql(def: &EntityDef) -> String {
    format!(
        "SELECT {} FROM {} WHERE id = ?",
        column_names(def).join(", "),
        def.name
    )
}

// ----------------------------------------------------------------------
// value plumbing
// ----------------------------------------------------------------------

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_column<'q>(
    query: SqliteQuery<'q>,
    def: &EntityDef,
    col: &ColumnDef,
    value: Option<&serde_json::Value>,
) -> SyncResult<SqliteQuery<'q>> {
    use serde_json::Value;

    let query = match value {
        None | Some(Value::Null) => match col.ty {
            ColumnType::Text => query.bind(None::<String>),
            ColumnType::Integer => query.bind(None::<i64>),
            ColumnType::Real => query.bind(None::<f64>),
        },
        Some(Value::String(s)) if col.ty == ColumnType::Text => query.bind(s.clone()),
        Some(value) if col.ty == ColumnType::Integer && value.as_i64().is_some() => {
            query.bind(value.as_i64().unwrap())
        }
        Some(value) if col.ty == ColumnType::Real && value.as_f64().is_some() => {
            query.bind(value.as_f64().unwrap())
        }
        Some(value) => {
            return Err(SyncError::InvalidEntity(format!(
                "{}.{} expects {:?}, got {}",
                def.name, col.name, col.ty, value
            )))
        }
    };
    Ok(query)
}

fn parse_row(def: &EntityDef, row: &SqliteRow) -> SyncResult<StoredRow> {
    use serde_json::Value;

    let id: i64 = row.try_get("id")?;
    let version: i64 = row.try_get("version")?;
    let updated_at: String = row.try_get("updated_at")?;
    let deleted_at: Option<String> = row.try_get("deleted_at")?;

    let mut data = Payload::new();
    for col in &def.columns {
        let value = match col.ty {
            ColumnType::Text => row
                .try_get::<Option<String>, _>(col.name.as_str())?
                .map(Value::String)
                .unwrap_or(Value::Null),
            ColumnType::Integer => row
                .try_get::<Option<i64>, _>(col.name.as_str())?
                .map(Value::from)
                .unwrap_or(Value::Null),
            ColumnType::Real => row
                .try_get::<Option<f64>, _>(col.name.as_str())?
                .map(Value::from)
                .unwrap_or(Value::Null),
        };
        data.insert(col.name.clone(), value);
    }

    Ok(StoredRow {
        sync: SyncFields {
            id: Some(RowId::from_i64(id)),
            version: version as u64,
            updated_at: Some(parse_timestamp(&updated_at)?),
            deleted_at: deleted_at.map(|s| parse_timestamp(&s)).transpose()?,
        },
        data,
    })
}

fn parse_change_row(row: &SqliteRow) -> SyncResult<ChangeEntry> {
    let change_id: i64 = row.try_get("change_id")?;
    let table: String = row.try_get("entity")?;
    let row_id: i64 = row.try_get("row_id")?;
    let op: String = row.try_get("op")?;
    let payload: String = row.try_get("payload")?;
    let version: i64 = row.try_get("version")?;
    let updated_at: String = row.try_get("updated_at")?;
    let origin_node_id: String = row.try_get("origin_node_id")?;
    let captured_at: String = row.try_get("captured_at")?;

    Ok(ChangeEntry {
        change_id: change_id as u64,
        table,
        row_id: RowId::from_i64(row_id),
        op: op
            .parse::<ChangeOp>()
            .map_err(|_| SyncError::InvalidEntity(format!("unknown change op {op}")))?,
        payload: serde_json::from_str(&payload)?,
        version: version as u64,
        updated_at: parse_timestamp(&updated_at)?,
        origin_node_id,
        captured_at: Some(parse_timestamp(&captured_at)?),
    })
}

fn validate_data_columns(def: &EntityDef, data: &Payload) -> SyncResult<()> {
    for key in data.keys() {
        if is_system_column(key) {
            return Err(SyncError::InvalidEntity(format!(
                "{}.{} is a system column; the store assigns it",
                def.name, key
            )));
        }
        if def.data_column(key).is_none() {
            return Err(SyncError::InvalidEntity(format!(
                "unknown column {}.{}",
                def.name, key
            )));
        }
    }
    Ok(())
}

/// Fills columns absent from `data` with explicit nulls so post-images
/// always carry every data column.
fn complete_data(def: &EntityDef, data: &Payload) -> Payload {
    let mut complete = Payload::new();
    for col in &def.columns {
        complete.insert(
            col.name.clone(),
            data.get(&col.name).cloned().unwrap_or(serde_json::Value::Null),
        );
    }
    complete
}

fn system_image(
    id: RowId,
    version: u64,
    updated_at: &DateTime<Utc>,
    deleted_at: Option<&DateTime<Utc>>,
) -> Payload {
    use serde_json::Value;

    let mut image = Payload::new();
    image.insert("id".to_string(), Value::from(id.0));
    image.insert("version".to_string(), Value::from(version));
    image.insert("updated_at".to_string(), Value::String(ts(updated_at)));
    image.insert(
        "deleted_at".to_string(),
        deleted_at.map(|d| Value::String(ts(d))).unwrap_or(Value::Null),
    );
    image
}

fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn parse_timestamp(raw: &str) -> SyncResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn parse_timestamp_value(value: &serde_json::Value) -> SyncResult<Option<DateTime<Utc>>> {
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(raw) => Ok(Some(parse_timestamp(raw)?)),
        other => Err(SyncError::InvalidEntity(format!(
            "expected a timestamp string, got {other}"
        ))),
    }
}
