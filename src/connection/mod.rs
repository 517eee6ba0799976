pub mod config;

pub use config::{BackendKind, ConnectionConfig, QueryTracking, RetryPolicy, TokenPolicy};
