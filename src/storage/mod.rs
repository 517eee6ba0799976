pub mod memory;
pub mod postgres;

pub use memory::{MemoryConnection, MemoryDatabase};
pub use postgres::{PostgresConnector, PostgresStore};
