//! Rowsync - local-first, bidirectional row-level synchronization.
//!
//! This crate provides a unified API for the rowsync system.
//!
//! # Example
//!
//! ```ignore
//! use rowsync::{ConflictPolicy, HttpTransport, SyncEngine};
//!
//! let transport = HttpTransport::new("http://localhost:8080");
//! let engine = SyncEngine::new(store, transport, "server", ConflictPolicy::LastWriteWins);
//! let report = engine.pull_then_push().await?;
//! ```

// Re-export client types
pub use rowsync_client::{ensure_node_id, HttpTransport};

// Re-export server types
pub use rowsync_server::AppState as Server;

// Re-export core types that external applications may need
pub use rowsync_core::errors::SyncError;
pub use rowsync_core::models::{ChangeEntry, ChangeOp, RowId, SyncFields};
pub use rowsync_core::{
    bind_allocator, ColumnType, ConflictPolicy, EntityDef, IdAllocator, Mirrored, Schema,
    SqliteStore, SyncEngine, SyncReport, SyncResult, Transport,
};
