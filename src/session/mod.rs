// ============================================================================
// Session: unit of work with optimistic concurrency
// ============================================================================
//
// A session owns one backend connection, an identity map of the records it
// loaded and the values each record had when it was read. Saving issues one
// conditioned UPDATE per modified record; an update that affects no row is a
// conflict and fails the whole save.
//
// ============================================================================

pub mod tracker;

use crate::connection::config::{ConnectionConfig, QueryTracking};
use crate::core::{DbError, PersonId, Result};
use crate::interface::{PersonStore, StoreConnector, with_timeout};
use crate::model::{Person, PersonValues};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{Instrument, debug, info, info_span, warn};
use tracker::{ChangeTracker, PlannedWrite, TrackedEntry, WriteOutcome};

pub use tracker::EntityState;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Result of a successful `Session::save_changes`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SaveReport {
    pub inserted: Vec<PersonId>,
    pub updated: Vec<PersonId>,
    /// Attempts made, retries of transient failures included.
    pub attempts: usize,
}

impl SaveReport {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty()
    }

    pub fn rows_written(&self) -> usize {
        self.inserted.len() + self.updated.len()
    }
}

/// A unit of work against the backend.
///
/// Not meant to be shared: every operation takes `&mut self`. Dropping a
/// session releases its connection; unsaved changes are reported in the log
/// and discarded.
pub struct Session {
    id: u64,
    connector: Arc<dyn StoreConnector>,
    store: Option<Box<dyn PersonStore>>,
    config: Arc<ConnectionConfig>,
    tracker: ChangeTracker,
}

impl Session {
    /// Open a session and check its backend connection is alive.
    pub async fn open(
        connector: Arc<dyn StoreConnector>,
        config: Arc<ConnectionConfig>,
    ) -> Result<Self> {
        let mut session = Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst),
            connector,
            store: None,
            config,
            tracker: ChangeTracker::default(),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let timeout = session.config.command_timeout;
            let connected = match session.store().await {
                Ok(store) => with_timeout(timeout, store.ping()).await,
                Err(err) => Err(err),
            };
            match connected {
                Ok(()) => break,
                Err(err) if session.config.retry.should_retry(attempt, &err) => {
                    session.back_off(attempt, &err).await;
                }
                Err(err) => return Err(err),
            }
        }

        debug!(session = session.id, backend = %session.connector.describe(), "session opened");
        Ok(session)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Stage a new record for insertion on the next save.
    pub fn add(&mut self, person: Person) {
        self.tracker.add(person);
    }

    /// Find a record by key.
    ///
    /// A tracked record is returned from the identity map without touching
    /// the backend. Otherwise the row is read and the values read become the
    /// expected values of this session's next save of the record.
    pub async fn find(&mut self, id: PersonId) -> Result<&mut Person> {
        let cached = self
            .tracker
            .entry(id)
            .is_some_and(|entry| entry.state != EntityState::Detached);

        if !cached {
            let values = self
                .select_with_retry(id)
                .await?
                .ok_or(DbError::NotFound(id))?;
            let state = match self.config.query_tracking {
                QueryTracking::TrackAll => EntityState::Unmodified,
                QueryTracking::NoTracking => EntityState::Detached,
            };
            debug!(
                session = self.id,
                person_id = %id,
                values = %values.log_view(self.config.sensitive_data_logging),
                "loaded"
            );
            self.tracker
                .attach(id, TrackedEntry::loaded(id, values, state));
        }

        self.tracker
            .entry_mut(id)
            .map(|entry| &mut entry.person)
            .ok_or(DbError::NotFound(id))
    }

    /// Read the current committed row without tracking it.
    pub async fn find_untracked(&mut self, id: PersonId) -> Result<Person> {
        let values = self
            .select_with_retry(id)
            .await?
            .ok_or(DbError::NotFound(id))?;
        Ok(Person::from_parts(id, values))
    }

    /// A tracked record, if this session loaded it.
    pub fn tracked(&self, id: PersonId) -> Option<&Person> {
        self.tracker.entry(id).map(|entry| &entry.person)
    }

    /// Records staged by `add` and not yet saved.
    pub fn pending_inserts(&self) -> &[Person] {
        self.tracker.added()
    }

    pub fn entry_state(&self, id: PersonId) -> Option<EntityState> {
        self.tracker
            .entry(id)
            .map(|entry| entry.current_state(self.config.auto_detect_changes))
    }

    /// Flag a tracked record as modified. Required for edits to be saved
    /// when automatic change detection is off.
    pub fn mark_modified(&mut self, id: PersonId) -> Result<()> {
        let entry = self
            .tracker
            .entry_mut(id)
            .ok_or_else(|| DbError::InvalidState(format!("person {} is not tracked", id)))?;
        if entry.state == EntityState::Detached {
            return Err(DbError::InvalidState(format!(
                "person {} was loaded without tracking",
                id
            )));
        }
        entry.marked_modified = true;
        Ok(())
    }

    /// Replace a tracked record with the committed row, discarding local
    /// edits. This is how a conflicted record becomes saveable again. An
    /// entry loaded without tracking stays detached.
    pub async fn reload(&mut self, id: PersonId) -> Result<&mut Person> {
        if self.tracker.entry(id).is_none() {
            return Err(DbError::InvalidState(format!(
                "person {} is not tracked",
                id
            )));
        }

        match self.select_with_retry(id).await? {
            Some(values) => {
                let state = match self.tracker.entry(id).map(|entry| entry.state) {
                    Some(EntityState::Detached) => EntityState::Detached,
                    _ => EntityState::Unmodified,
                };
                let entry = self
                    .tracker
                    .attach(id, TrackedEntry::loaded(id, values, state));
                Ok(&mut entry.person)
            }
            None => {
                self.tracker.remove(id);
                Err(DbError::NotFound(id))
            }
        }
    }

    pub fn has_changes(&self) -> bool {
        self.tracker.has_changes(self.config.auto_detect_changes)
    }

    /// Persist staged inserts and modified records.
    ///
    /// Each record gets a new row version. Updates are conditioned on the
    /// concurrency values selected by the configured token policy; a
    /// statement affecting no row fails the save with `DbError::Conflict`
    /// and rolls back everything this save wrote. Transient failures retry
    /// the whole save on a fresh connection.
    pub async fn save_changes(&mut self) -> Result<SaveReport> {
        let span = info_span!(
            "save_changes",
            session = self.id,
            policy = %self.config.token_policy
        );
        self.save_changes_inner().instrument(span).await
    }

    async fn save_changes_inner(&mut self) -> Result<SaveReport> {
        let writes = self.tracker.plan(
            self.config.auto_detect_changes,
            self.config.token_policy,
            self.config.sensitive_data_logging,
        );
        if writes.is_empty() {
            debug!("nothing to save");
            return Ok(SaveReport::default());
        }

        // After a failed attempt the backend may already hold some of the
        // writes; later attempts look for the planned row versions first.
        let mut verify = false;
        let mut attempt = 0;
        let outcomes = loop {
            attempt += 1;
            match self.execute_writes(&writes, verify).await {
                Ok(outcomes) => break outcomes,
                Err(DbError::Conflict { person_id, expected }) => {
                    self.tracker.mark_conflicted(person_id);
                    warn!(person_id = %person_id, expected = %expected, "save rejected: concurrency conflict");
                    return Err(DbError::Conflict {
                        person_id,
                        expected,
                    });
                }
                Err(err) if self.config.retry.should_retry(attempt, &err) => {
                    self.back_off(attempt, &err).await;
                    verify = true;
                }
                Err(err) => return Err(err),
            }
        };

        self.tracker.apply(&writes, &outcomes);

        let mut report = SaveReport {
            attempts: attempt,
            ..SaveReport::default()
        };
        for outcome in &outcomes {
            match outcome {
                WriteOutcome::Inserted { id, .. } => report.inserted.push(*id),
                WriteOutcome::Updated { id } => report.updated.push(*id),
            }
        }

        info!(
            inserted = report.inserted.len(),
            updated = report.updated.len(),
            rows = report.rows_written(),
            attempts = report.attempts,
            "changes saved"
        );
        Ok(report)
    }

    /// One attempt: all statements, wrapped in a transaction when more than
    /// one is needed.
    async fn execute_writes(
        &mut self,
        writes: &[PlannedWrite],
        verify: bool,
    ) -> Result<Vec<WriteOutcome>> {
        let timeout = self.config.command_timeout;
        let use_transaction = writes.len() > 1;
        let store = self.store().await?;

        if use_transaction {
            with_timeout(timeout, store.begin()).await?;
        }

        let result = run_writes(&mut **store, writes, timeout, verify).await;

        match result {
            Ok(outcomes) => {
                if use_transaction {
                    with_timeout(timeout, store.commit()).await?;
                }
                Ok(outcomes)
            }
            Err(err) => {
                if use_transaction {
                    let rolled_back = with_timeout(timeout, store.rollback()).await;
                    if let Err(rollback_err) = rolled_back {
                        warn!(error = %rollback_err, "rollback failed, dropping connection");
                        self.store = None;
                    }
                }
                Err(err)
            }
        }
    }

    /// Release the connection. Unsaved changes are discarded.
    pub fn close(self) {
        debug!(session = self.id, tracked = self.tracker.tracked_count(), "session closed");
    }

    async fn store(&mut self) -> Result<&mut Box<dyn PersonStore>> {
        if self.store.is_none() {
            let store =
                with_timeout(self.config.command_timeout, self.connector.connect()).await?;
            self.store = Some(store);
        }
        self.store
            .as_mut()
            .ok_or_else(|| DbError::InvalidState("no backend connection".into()))
    }

    async fn select_with_retry(&mut self, id: PersonId) -> Result<Option<PersonValues>> {
        let timeout = self.config.command_timeout;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.store().await {
                Ok(store) => with_timeout(timeout, store.select_by_id(id)).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(values) => return Ok(values),
                Err(err) if self.config.retry.should_retry(attempt, &err) => {
                    self.back_off(attempt, &err).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Drop the connection and wait before the next attempt.
    async fn back_off(&mut self, attempt: usize, err: &DbError) {
        let backoff = self.config.retry.backoff_ms(attempt);
        warn!(
            session = self.id,
            attempt,
            backoff_ms = backoff,
            error = %err,
            "transient backend failure, retrying"
        );
        self.store = None;
        tokio::time::sleep(Duration::from_millis(backoff)).await;
    }
}

async fn run_writes(
    store: &mut dyn PersonStore,
    writes: &[PlannedWrite],
    timeout: Duration,
    verify: bool,
) -> Result<Vec<WriteOutcome>> {
    let mut outcomes = Vec::with_capacity(writes.len());

    for write in writes {
        match write {
            PlannedWrite::Insert { slot, values } => {
                let existing = if verify {
                    with_timeout(timeout, store.find_by_row_version(values.row_version)).await?
                } else {
                    None
                };
                let id = match existing {
                    Some(id) => {
                        debug!(person_id = %id, "insert already applied by an earlier attempt");
                        id
                    }
                    None => with_timeout(timeout, store.insert(values)).await?,
                };
                outcomes.push(WriteOutcome::Inserted { slot: *slot, id });
            }
            PlannedWrite::Update {
                id,
                values,
                condition,
                expected,
            } => {
                let affected =
                    with_timeout(timeout, store.conditional_update(*id, values, condition))
                        .await?;
                if affected == 0 {
                    let applied = verify
                        && with_timeout(timeout, store.find_by_row_version(values.row_version))
                            .await?
                            == Some(*id);
                    if !applied {
                        return Err(DbError::Conflict {
                            person_id: *id,
                            expected: *expected,
                        });
                    }
                    debug!(person_id = %id, "update already applied by an earlier attempt");
                }
                outcomes.push(WriteOutcome::Updated { id: *id });
            }
        }
    }

    Ok(outcomes)
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.has_changes() {
            warn!(
                session = self.id,
                staged = self.tracker.added().len(),
                "session discarded with unsaved changes"
            );
        }
    }
}
