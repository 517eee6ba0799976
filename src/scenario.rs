//! The lost-update scenario.
//!
//! One row is inserted, read by two independent sessions, and updated by
//! both. The first save moves the row to a new version; the second session
//! still holds the initial version and asserts it explicitly before saving.
//! A correct conflict check rejects the second save.

use crate::connection::config::TokenPolicy;
use crate::core::{DbError, PersonId, Result, RowVersion};
use crate::facade::Database;
use crate::model::Person;
use crate::session::Session;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Barrier;
use tracing::{info, warn};

pub const PERSON_NAME: &str = "John Doe";
pub const PERSON_SSN: &str = "123-45-6789";
pub const INITIAL_PHONE: &str = "555-555-5555";
pub const FIRST_SESSION_PHONE: &str = "555-555-5556";
pub const SECOND_SESSION_PHONE: &str = "555-555-5557";

/// Which row version the second session writes into its record before saving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenAssertion {
    /// The version both sessions read (no-op overwrite).
    #[default]
    Initial,
    /// The version the first session's save produced.
    Current,
    /// Leave the record's version alone.
    None,
}

/// How the second session's save ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SecondSaveOutcome {
    Conflict { expected: RowVersion },
    Saved { row_version: RowVersion },
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub backend: String,
    pub policy: TokenPolicy,
    pub assertion: TokenAssertion,
    pub person_id: PersonId,
    pub initial_version: RowVersion,
    pub first_save_version: RowVersion,
    pub second_save: SecondSaveOutcome,
    pub final_phone_number: Option<String>,
    pub final_version: RowVersion,
    /// The first session's committed change was overwritten.
    pub lost_update: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ScenarioReport {
    pub fn conflict_detected(&self) -> bool {
        matches!(self.second_save, SecondSaveOutcome::Conflict { .. })
    }

    pub fn verdict(&self) -> &'static str {
        if self.lost_update {
            "lost update: the second save succeeded and overwrote the first"
        } else {
            "conflict detected: the second save was rejected"
        }
    }
}

fn tracked_version(session: &Session, id: PersonId) -> Result<RowVersion> {
    session
        .tracked(id)
        .map(Person::row_version)
        .ok_or_else(|| DbError::InvalidState(format!("person {} is not tracked", id)))
}

/// Recreate the table and insert the scenario's person. Returns its key and
/// initial row version.
pub async fn seed(db: &Database) -> Result<(PersonId, RowVersion)> {
    db.recreate().await?;

    let mut session = db.session().await?;
    session.add(Person::new(PERSON_NAME, INITIAL_PHONE, PERSON_SSN));
    let report = session.save_changes().await?;
    let id = report
        .inserted
        .first()
        .copied()
        .ok_or_else(|| DbError::InvalidState("insert returned no key".into()))?;
    let version = tracked_version(&session, id)?;
    session.close();

    info!(person_id = %id, row_version = %version, "person seeded");
    Ok((id, version))
}

/// Run the two-session scenario with the default assertion.
pub async fn run(db: &Database) -> Result<ScenarioReport> {
    run_with(db, TokenAssertion::default()).await
}

pub async fn run_with(db: &Database, assertion: TokenAssertion) -> Result<ScenarioReport> {
    let started_at = Utc::now();
    let (id, initial_version) = seed(db).await?;

    let mut first = db.session().await?;
    let mut second = db.session().await?;

    // Both sessions read the row before either writes.
    first.find(id).await?;
    second.find(id).await?;

    first.find(id).await?.set_phone_number(FIRST_SESSION_PHONE);
    first.save_changes().await?;
    let first_save_version = tracked_version(&first, id)?;
    info!(person_id = %id, row_version = %first_save_version, "first session saved");

    {
        let person = second.find(id).await?;
        match assertion {
            TokenAssertion::Initial => person.set_row_version(initial_version),
            TokenAssertion::Current => person.set_row_version(first_save_version),
            TokenAssertion::None => {}
        }
        person.set_phone_number(SECOND_SESSION_PHONE);
    }

    let second_save = match second.save_changes().await {
        Ok(_) => {
            let row_version = tracked_version(&second, id)?;
            warn!(person_id = %id, row_version = %row_version, "second session saved over a stale read");
            SecondSaveOutcome::Saved { row_version }
        }
        Err(DbError::Conflict { expected, .. }) => {
            info!(person_id = %id, expected = %expected, "second session rejected");
            SecondSaveOutcome::Conflict { expected }
        }
        Err(err) => return Err(err),
    };

    let mut verifier = db.session().await?;
    let stored = verifier.find_untracked(id).await?;
    let lost_update = stored.phone_number() == Some(SECOND_SESSION_PHONE);

    Ok(ScenarioReport {
        backend: db.describe(),
        policy: db.config().token_policy,
        assertion,
        person_id: id,
        initial_version,
        first_save_version,
        second_save,
        final_phone_number: stored.phone_number().map(str::to_string),
        final_version: stored.row_version(),
        lost_update,
        started_at,
        finished_at: Utc::now(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParallelReport {
    pub rounds: usize,
    pub saved: usize,
    pub conflicts: usize,
    /// Rounds in which both sessions saved.
    pub lost_updates: usize,
}

/// Load, wait for the other task, then edit and save. `Ok(false)` means the
/// save was rejected as a conflict.
///
/// The barrier is reached even when the load fails, so the other task is
/// never left waiting.
async fn contend(
    mut session: Session,
    id: PersonId,
    barrier: Arc<Barrier>,
    phone: String,
) -> Result<bool> {
    let loaded = session.find(id).await.map(|_| ());
    barrier.wait().await;
    loaded?;

    session.find(id).await?.set_phone_number(phone);
    match session.save_changes().await {
        Ok(_) => Ok(true),
        Err(err) if err.is_conflict() => Ok(false),
        Err(err) => Err(err),
    }
}

/// Two sessions per round load the same row, wait for each other, then
/// mutate and save from separate tasks.
pub async fn run_parallel(db: &Database, rounds: usize) -> Result<ParallelReport> {
    let (id, _) = seed(db).await?;
    let mut report = ParallelReport {
        rounds,
        ..ParallelReport::default()
    };

    for round in 0..rounds {
        // Both sessions are open before either task starts waiting.
        let sessions = [db.session().await?, db.session().await?];
        let barrier = Arc::new(Barrier::new(sessions.len()));

        let handles: Vec<_> = sessions
            .into_iter()
            .enumerate()
            .map(|(task, session)| {
                let phone = format!("round-{}-task-{}", round, task);
                tokio::spawn(contend(session, id, Arc::clone(&barrier), phone))
            })
            .collect();

        let mut saved_this_round = 0;
        for joined in futures::future::join_all(handles).await {
            let saved = joined
                .map_err(|e| DbError::InvalidState(format!("session task failed: {}", e)))??;
            if saved {
                saved_this_round += 1;
            } else {
                report.conflicts += 1;
            }
        }

        report.saved += saved_this_round;
        if saved_this_round > 1 {
            report.lost_updates += 1;
        }
    }

    info!(
        rounds = report.rounds,
        saved = report.saved,
        conflicts = report.conflicts,
        lost_updates = report.lost_updates,
        "parallel run finished"
    );
    Ok(report)
}
