//! Shared helpers for the integration test suites.
//!
//! Import via `mod common;`.

#![allow(dead_code)]

use async_trait::async_trait;
use concurrency_token_repro::{
    DbError, MemoryDatabase, PersonId, PersonStore, PersonValues, Result, RowVersion,
    StoreConnector, UpdateCondition,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Faults applied by `FaultyConnector` connections. Flags are one-shot.
#[derive(Debug, Default)]
pub struct Faults {
    /// Fail this many `select_by_id` calls with a non-transient error.
    pub failing_selects: AtomicUsize,
    /// Apply the next update, then stall for `stall`.
    pub stall_after_update: AtomicBool,
    /// Apply the next insert, then stall for `stall`.
    pub stall_after_insert: AtomicBool,
}

/// Connector over a `MemoryDatabase` whose statements can fail or stall
/// after the backend has already applied them.
#[derive(Clone)]
pub struct FaultyConnector {
    pub db: MemoryDatabase,
    pub faults: Arc<Faults>,
    pub stall: Duration,
}

impl FaultyConnector {
    pub fn new(name: &str) -> Self {
        Self {
            db: MemoryDatabase::new(name),
            faults: Arc::new(Faults::default()),
            stall: Duration::from_millis(300),
        }
    }
}

#[async_trait]
impl StoreConnector for FaultyConnector {
    async fn connect(&self) -> Result<Box<dyn PersonStore>> {
        Ok(Box::new(FaultyStore {
            inner: self.db.connection(),
            faults: Arc::clone(&self.faults),
            stall: self.stall,
        }))
    }

    fn describe(&self) -> String {
        format!("faulty+{}", self.db.describe())
    }
}

struct FaultyStore {
    inner: concurrency_token_repro::storage::MemoryConnection,
    faults: Arc<Faults>,
    stall: Duration,
}

#[async_trait]
impl PersonStore for FaultyStore {
    async fn create_schema(&mut self) -> Result<()> {
        self.inner.create_schema().await
    }

    async fn drop_schema(&mut self) -> Result<()> {
        self.inner.drop_schema().await
    }

    async fn insert(&mut self, values: &PersonValues) -> Result<PersonId> {
        let id = self.inner.insert(values).await?;
        if self.faults.stall_after_insert.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(self.stall).await;
        }
        Ok(id)
    }

    async fn select_by_id(&mut self, id: PersonId) -> Result<Option<PersonValues>> {
        let failed = self
            .faults
            .failing_selects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(DbError::Backend("relation \"people\" is corrupt".into()));
        }
        self.inner.select_by_id(id).await
    }

    async fn conditional_update(
        &mut self,
        id: PersonId,
        values: &PersonValues,
        condition: &UpdateCondition,
    ) -> Result<u64> {
        let affected = self.inner.conditional_update(id, values, condition).await?;
        if self.faults.stall_after_update.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(self.stall).await;
        }
        Ok(affected)
    }

    async fn find_by_row_version(&mut self, row_version: RowVersion) -> Result<Option<PersonId>> {
        self.inner.find_by_row_version(row_version).await
    }

    async fn begin(&mut self) -> Result<()> {
        self.inner.begin().await
    }

    async fn commit(&mut self) -> Result<()> {
        self.inner.commit().await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.inner.rollback().await
    }

    async fn ping(&mut self) -> Result<()> {
        self.inner.ping().await
    }
}
