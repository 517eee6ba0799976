use super::types::{PersonId, RowVersion};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Person {0} not found")]
    NotFound(PersonId),

    /// A conditioned update matched no row: the stored concurrency values no
    /// longer equal the expected ones.
    #[error("Optimistic concurrency conflict for person {person_id}: expected row version {expected}")]
    Conflict {
        person_id: PersonId,
        expected: RowVersion,
    },

    #[error("Transient backend error: {0}")]
    Transient(String),

    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Returns `true` for failures worth retrying after a reconnect.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<tokio_postgres::Error> for DbError {
    fn from(err: tokio_postgres::Error) -> Self {
        if err.is_closed() {
            return Self::Transient(err.to_string());
        }

        let transient = err.code().is_some_and(|state| {
            let code = state.code();
            // 08xxx connection exceptions, 57Pxx operator intervention,
            // 40001 serialization failure.
            code.starts_with("08") || code.starts_with("57P") || code == "40001"
        });

        if transient {
            Self::Transient(err.to_string())
        } else {
            Self::Backend(err.to_string())
        }
    }
}
