pub mod engine;
pub mod errors;
pub mod idgen;
pub mod models;
pub mod protocol;
pub mod schema;
pub mod store;

pub type SyncResult<T> = Result<T, SyncError>;
pub use engine::*;
pub use errors::*;
pub use idgen::*;
pub use models::*;
pub use protocol::*;
pub use schema::*;
pub use store::*;
