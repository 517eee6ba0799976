use crate::core::{DbError, PersonId, Result, RowVersion};
use crate::model::{ConcurrencyValues, PersonValues};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Condition attached to an update of a `people` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateCondition {
    /// Stored concurrency-checked columns must equal these values.
    Matches(ConcurrencyValues),
    /// Match on the primary key only.
    KeyOnly,
}

/// A connection to the relational backend holding the `people` table.
///
/// Every operation is a black box to the session; implementations exist for
/// PostgreSQL and for an in-process table. A `PersonStore` belongs to one
/// session and is never shared, hence `&mut self`.
#[async_trait]
pub trait PersonStore: Send {
    /// Create the `people` table if it does not exist.
    async fn create_schema(&mut self) -> Result<()>;

    /// Drop the `people` table if it exists.
    async fn drop_schema(&mut self) -> Result<()>;

    /// Insert a row and return the key the backend assigned.
    async fn insert(&mut self, values: &PersonValues) -> Result<PersonId>;

    async fn select_by_id(&mut self, id: PersonId) -> Result<Option<PersonValues>>;

    /// Overwrite the row `id` with `values` if `condition` holds; returns the
    /// number of rows affected (0 or 1).
    async fn conditional_update(
        &mut self,
        id: PersonId,
        values: &PersonValues,
        condition: &UpdateCondition,
    ) -> Result<u64>;

    /// Key of the row currently holding `row_version`, if any.
    async fn find_by_row_version(&mut self, row_version: RowVersion) -> Result<Option<PersonId>>;

    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// Check if the connection is alive
    async fn ping(&mut self) -> Result<()>;
}

/// A factory for backend connections, one per session.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn PersonStore>>;

    /// Human readable backend description for logs.
    fn describe(&self) -> String;
}

/// Bound a backend call by `limit`, mapping expiry to `DbError::Timeout`.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(DbError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_timeout_expires() {
        let result: Result<()> = tokio_test::block_on(async {
            with_timeout(Duration::from_millis(10), async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await
        });

        assert!(matches!(result, Err(DbError::Timeout(d)) if d == Duration::from_millis(10)));
    }

    #[test]
    fn test_with_timeout_passes_result_through() {
        let result = tokio_test::block_on(with_timeout(Duration::from_secs(1), async {
            Ok::<_, DbError>(5)
        }));
        assert_eq!(result.unwrap(), 5);

        let err = tokio_test::block_on(with_timeout(Duration::from_secs(1), async {
            Err::<(), _>(DbError::Backend("boom".into()))
        }));
        assert!(matches!(err, Err(DbError::Backend(_))));
    }
}
