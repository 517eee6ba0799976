use crate::connection::config::TokenPolicy;
use crate::core::{PersonId, RowVersion};
use crate::interface::UpdateCondition;
use crate::model::{Person, PersonValues};
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;
use tracing::warn;

/// Lifecycle of a record inside one session.
///
/// ```text
/// Added ──save──> Unmodified ──edit──> Modified ──save──> Unmodified
///                                          │
///                                          └──conflict──> Conflicted ──reload──> Unmodified
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntityState {
    Added,
    Unmodified,
    Modified,
    Conflicted,
    /// Loaded without tracking; never saved.
    Detached,
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Added => "added",
            Self::Unmodified => "unmodified",
            Self::Modified => "modified",
            Self::Conflicted => "conflicted",
            Self::Detached => "detached",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug)]
pub(crate) struct TrackedEntry {
    pub(crate) person: Person,
    /// Values as of load or last successful save.
    pub(crate) original: PersonValues,
    pub(crate) state: EntityState,
    pub(crate) marked_modified: bool,
}

impl TrackedEntry {
    pub(crate) fn loaded(id: PersonId, values: PersonValues, state: EntityState) -> Self {
        Self {
            person: Person::from_parts(id, values.clone()),
            original: values,
            state,
            marked_modified: false,
        }
    }

    /// Current state, running change detection when `auto_detect` is set.
    pub(crate) fn current_state(&self, auto_detect: bool) -> EntityState {
        match self.state {
            EntityState::Unmodified | EntityState::Modified => {
                let changed = if auto_detect {
                    self.marked_modified || self.person.values() != &self.original
                } else {
                    self.marked_modified
                };
                if changed {
                    EntityState::Modified
                } else {
                    EntityState::Unmodified
                }
            }
            other => other,
        }
    }

    fn accept(&mut self, written: PersonValues) {
        self.person.replace_values(written.clone());
        self.original = written;
        self.state = EntityState::Unmodified;
        self.marked_modified = false;
    }
}

/// One statement a save will issue.
#[derive(Debug, Clone)]
pub(crate) enum PlannedWrite {
    Insert {
        slot: usize,
        values: PersonValues,
    },
    Update {
        id: PersonId,
        values: PersonValues,
        condition: UpdateCondition,
        expected: RowVersion,
    },
}

/// What a successful statement produced.
#[derive(Debug, Clone)]
pub(crate) enum WriteOutcome {
    Inserted { slot: usize, id: PersonId },
    Updated { id: PersonId },
}

/// Identity map plus staged inserts of one session.
#[derive(Debug, Default)]
pub(crate) struct ChangeTracker {
    added: Vec<Person>,
    entries: BTreeMap<PersonId, TrackedEntry>,
}

impl ChangeTracker {
    pub(crate) fn add(&mut self, person: Person) {
        self.added.push(person);
    }

    pub(crate) fn entry(&self, id: PersonId) -> Option<&TrackedEntry> {
        self.entries.get(&id)
    }

    pub(crate) fn entry_mut(&mut self, id: PersonId) -> Option<&mut TrackedEntry> {
        self.entries.get_mut(&id)
    }

    pub(crate) fn attach(&mut self, id: PersonId, entry: TrackedEntry) -> &mut TrackedEntry {
        match self.entries.entry(id) {
            Entry::Occupied(mut occupied) => {
                occupied.insert(entry);
                occupied.into_mut()
            }
            Entry::Vacant(vacant) => vacant.insert(entry),
        }
    }

    pub(crate) fn remove(&mut self, id: PersonId) {
        self.entries.remove(&id);
    }

    pub(crate) fn added(&self) -> &[Person] {
        &self.added
    }

    pub(crate) fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn has_changes(&self, auto_detect: bool) -> bool {
        !self.added.is_empty()
            || self.entries.values().any(|entry| {
                matches!(
                    entry.current_state(auto_detect),
                    EntityState::Modified | EntityState::Conflicted
                )
            })
    }

    /// Build the statements of a save. Every written record gets a fresh
    /// row version; `policy` decides the condition of each update.
    pub(crate) fn plan(
        &self,
        auto_detect: bool,
        policy: TokenPolicy,
        sensitive: bool,
    ) -> Vec<PlannedWrite> {
        let mut writes = Vec::new();

        for (slot, person) in self.added.iter().enumerate() {
            writes.push(PlannedWrite::Insert {
                slot,
                values: person.next_values(RowVersion::generate()),
            });
        }

        for (id, entry) in &self.entries {
            let state = entry.current_state(auto_detect);
            if !matches!(state, EntityState::Modified | EntityState::Conflicted) {
                continue;
            }

            let client_version = entry.person.row_version();
            let (condition, expected) = match policy {
                TokenPolicy::SessionManaged => {
                    if client_version != entry.original.row_version {
                        warn!(
                            person_id = %id,
                            client_version = %client_version,
                            expected = %entry.original.row_version,
                            "row version overwritten by caller; using the version read by this session"
                        );
                    }
                    let expected = entry.original.row_version;
                    (
                        UpdateCondition::Matches(entry.original.concurrency_values()),
                        expected,
                    )
                }
                TokenPolicy::ClientAsserted => {
                    let mut witness = entry.original.concurrency_values();
                    witness.row_version = client_version;
                    (UpdateCondition::Matches(witness), client_version)
                }
                TokenPolicy::Unchecked => (UpdateCondition::KeyOnly, entry.original.row_version),
            };

            let values = entry.person.next_values(RowVersion::generate());
            tracing::debug!(
                person_id = %id,
                state = %state,
                values = %values.log_view(sensitive),
                "planned update"
            );

            writes.push(PlannedWrite::Update {
                id: *id,
                values,
                condition,
                expected,
            });
        }

        writes
    }

    /// Fold the results of a committed save back into the tracker.
    pub(crate) fn apply(&mut self, writes: &[PlannedWrite], outcomes: &[WriteOutcome]) {
        let mut inserted_slots = Vec::new();

        for outcome in outcomes {
            match outcome {
                WriteOutcome::Inserted { slot, id } => {
                    let written = writes.iter().find_map(|write| match write {
                        PlannedWrite::Insert { slot: s, values } if s == slot => {
                            Some(values.clone())
                        }
                        _ => None,
                    });
                    if let (Some(values), Some(person)) = (written, self.added.get(*slot)) {
                        let mut person = person.clone();
                        person.set_id(*id);
                        person.replace_values(values.clone());
                        self.entries.insert(
                            *id,
                            TrackedEntry {
                                person,
                                original: values,
                                state: EntityState::Unmodified,
                                marked_modified: false,
                            },
                        );
                        inserted_slots.push(*slot);
                    }
                }
                WriteOutcome::Updated { id } => {
                    let written = writes.iter().find_map(|write| match write {
                        PlannedWrite::Update { id: w, values, .. } if w == id => {
                            Some(values.clone())
                        }
                        _ => None,
                    });
                    if let (Some(values), Some(entry)) = (written, self.entries.get_mut(id)) {
                        entry.accept(values);
                    }
                }
            }
        }

        inserted_slots.sort_unstable();
        for slot in inserted_slots.into_iter().rev() {
            self.added.remove(slot);
        }
    }

    pub(crate) fn mark_conflicted(&mut self, id: PersonId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.state = EntityState::Conflicted;
        }
    }
}
