// ============================================================================
// concurrency-token-repro Library
// ============================================================================

pub mod connection;
pub mod core;
pub mod facade;
pub mod interface;
pub mod model;
pub mod scenario;
pub mod session;
pub mod storage;

// Re-export main types for convenience
pub use connection::{BackendKind, ConnectionConfig, QueryTracking, RetryPolicy, TokenPolicy};
pub use core::{DbError, PersonId, Result, RowVersion};
pub use facade::Database;
pub use interface::{PersonStore, StoreConnector, UpdateCondition};
pub use model::{Person, PersonValues};
pub use session::{EntityState, SaveReport, Session};
pub use storage::{MemoryDatabase, PostgresConnector};
