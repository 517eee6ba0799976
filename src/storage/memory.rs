// ============================================================================
// In-process `people` table
// ============================================================================
//
// A single-table relational backend living in the process. Statements are
// serialised behind one async mutex; a transaction holds the lock from BEGIN
// until COMMIT/ROLLBACK and records an undo log of the rows it touched.
//
// ============================================================================

use crate::core::{DbError, PersonId, Result, RowVersion};
use crate::interface::{PersonStore, StoreConnector, UpdateCondition};
use crate::model::PersonValues;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Default)]
struct MemoryState {
    people: Option<BTreeMap<PersonId, PersonValues>>,
    next_id: i64,
}

impl MemoryState {
    fn table(&self) -> Result<&BTreeMap<PersonId, PersonValues>> {
        self.people
            .as_ref()
            .ok_or_else(|| DbError::Backend("Table 'people' not found".to_string()))
    }

    fn table_mut(&mut self) -> Result<&mut BTreeMap<PersonId, PersonValues>> {
        self.people
            .as_mut()
            .ok_or_else(|| DbError::Backend("Table 'people' not found".to_string()))
    }

    fn insert(&mut self, values: &PersonValues) -> Result<PersonId> {
        // Ensure the table exists before consuming an id.
        self.table()?;
        self.next_id += 1;
        let id = PersonId(self.next_id);
        self.table_mut()?.insert(id, values.clone());
        Ok(id)
    }

    /// Returns the replaced values when the row existed and the condition held.
    fn conditional_update(
        &mut self,
        id: PersonId,
        values: &PersonValues,
        condition: &UpdateCondition,
    ) -> Result<Option<PersonValues>> {
        let table = self.table_mut()?;
        let Some(current) = table.get_mut(&id) else {
            return Ok(None);
        };

        let holds = match condition {
            UpdateCondition::KeyOnly => true,
            UpdateCondition::Matches(expected) => current.concurrency_values() == *expected,
        };
        if !holds {
            return Ok(None);
        }

        Ok(Some(std::mem::replace(current, values.clone())))
    }

    fn undo(&mut self, changes: Vec<Change>) {
        let Some(table) = self.people.as_mut() else {
            return;
        };
        for change in changes.into_iter().rev() {
            match change {
                Change::InsertRow { id } => {
                    table.remove(&id);
                }
                Change::UpdateRow { id, old_values } => {
                    table.insert(id, old_values);
                }
            }
        }
    }
}

/// A reversible row change recorded inside a transaction.
#[derive(Debug)]
enum Change {
    InsertRow { id: PersonId },
    UpdateRow { id: PersonId, old_values: PersonValues },
}

struct MemoryTransaction {
    state: OwnedMutexGuard<MemoryState>,
    changes: Vec<Change>,
}

/// Test hooks that make every call slow or fail transiently.
#[derive(Debug, Default)]
struct FaultInjection {
    transient_failures: AtomicUsize,
    latency_ms: AtomicU64,
}

/// Shared in-process database; clones refer to the same table.
#[derive(Clone)]
pub struct MemoryDatabase {
    name: String,
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<FaultInjection>,
}

impl MemoryDatabase {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(MemoryState::default())),
            faults: Arc::new(FaultInjection::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open a new connection to this database.
    pub fn connection(&self) -> MemoryConnection {
        MemoryConnection {
            db: self.clone(),
            tx: None,
        }
    }

    /// Number of rows in `people`, or `None` when the table does not exist.
    pub async fn row_count(&self) -> Option<usize> {
        let state = self.state.lock().await;
        state.people.as_ref().map(BTreeMap::len)
    }

    /// Make the next `count` backend calls fail with a transient error.
    pub fn inject_transient_failures(&self, count: usize) {
        self.faults.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Delay every backend call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.faults
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn apply_faults(&self) -> Result<()> {
        let latency = self.faults.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let failed = self
            .faults
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(DbError::Transient(format!(
                "injected connection failure on memory://{}",
                self.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreConnector for MemoryDatabase {
    async fn connect(&self) -> Result<Box<dyn PersonStore>> {
        Ok(Box::new(self.connection()))
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.name)
    }
}

/// Connection to a `MemoryDatabase`.
pub struct MemoryConnection {
    db: MemoryDatabase,
    tx: Option<MemoryTransaction>,
}

impl MemoryConnection {
    pub fn is_in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    async fn run<T, F>(&mut self, op: F) -> Result<T>
    where
        F: FnOnce(&mut MemoryState, Option<&mut Vec<Change>>) -> Result<T> + Send,
        T: Send,
    {
        self.db.apply_faults().await?;
        match self.tx.as_mut() {
            Some(tx) => op(&mut *tx.state, Some(&mut tx.changes)),
            None => {
                let mut state = self.db.state.lock().await;
                op(&mut *state, None)
            }
        }
    }

    fn reject_in_transaction(&self, what: &str) -> Result<()> {
        if self.tx.is_some() {
            return Err(DbError::InvalidState(format!(
                "{} is not supported inside a transaction",
                what
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PersonStore for MemoryConnection {
    async fn create_schema(&mut self) -> Result<()> {
        self.reject_in_transaction("CREATE TABLE")?;
        self.run(|state, _| {
            if state.people.is_none() {
                state.people = Some(BTreeMap::new());
            }
            Ok(())
        })
        .await
    }

    async fn drop_schema(&mut self) -> Result<()> {
        self.reject_in_transaction("DROP TABLE")?;
        self.run(|state, _| {
            state.people = None;
            Ok(())
        })
        .await
    }

    async fn insert(&mut self, values: &PersonValues) -> Result<PersonId> {
        let id = self
            .run(|state, changes| {
                let id = state.insert(values)?;
                if let Some(changes) = changes {
                    changes.push(Change::InsertRow { id });
                }
                Ok(id)
            })
            .await?;
        debug!(database = %self.db.name, person_id = %id, "memory insert");
        Ok(id)
    }

    async fn select_by_id(&mut self, id: PersonId) -> Result<Option<PersonValues>> {
        self.run(|state, _| Ok(state.table()?.get(&id).cloned()))
            .await
    }

    async fn conditional_update(
        &mut self,
        id: PersonId,
        values: &PersonValues,
        condition: &UpdateCondition,
    ) -> Result<u64> {
        self.run(|state, changes| {
            match state.conditional_update(id, values, condition)? {
                Some(old_values) => {
                    if let Some(changes) = changes {
                        changes.push(Change::UpdateRow { id, old_values });
                    }
                    Ok(1)
                }
                None => Ok(0),
            }
        })
        .await
    }

    async fn find_by_row_version(&mut self, row_version: RowVersion) -> Result<Option<PersonId>> {
        self.run(|state, _| {
            Ok(state
                .table()?
                .iter()
                .find(|(_, values)| values.row_version == row_version)
                .map(|(id, _)| *id))
        })
        .await
    }

    async fn begin(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Err(DbError::InvalidState("Transaction already active".into()));
        }
        self.db.apply_faults().await?;
        let state = Arc::clone(&self.db.state).lock_owned().await;
        self.tx = Some(MemoryTransaction {
            state,
            changes: Vec::new(),
        });
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        match self.tx.take() {
            Some(_) => Ok(()),
            None => Err(DbError::InvalidState("No active transaction".into())),
        }
    }

    async fn rollback(&mut self) -> Result<()> {
        match self.tx.take() {
            Some(mut tx) => {
                let changes = std::mem::take(&mut tx.changes);
                tx.state.undo(changes);
                Ok(())
            }
            None => Err(DbError::InvalidState("No active transaction".into())),
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.db.apply_faults().await
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if let Some(mut tx) = self.tx.take() {
            let changes = std::mem::take(&mut tx.changes);
            tx.state.undo(changes);
        }
    }
}
