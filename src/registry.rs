//! Known library locations and their last committed fingerprints.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::DbError;
use crate::model::{Fingerprint, LibraryLocation, LibraryVersion};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LibraryState {
    Registered,
    Committed,
    Stale { reason: String },
}

#[derive(Debug, Clone)]
pub struct RegisteredLibrary {
    pub location: LibraryLocation,
    pub ordinal: u64,
    pub state: LibraryState,
    pub committed: Option<Arc<LibraryVersion>>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Registration {
    pub added: Vec<LibraryLocation>,
    pub known: Vec<LibraryLocation>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub changed: Vec<LibraryLocation>,
    pub unchanged: Vec<LibraryLocation>,
    pub unreachable: Vec<(LibraryLocation, String)>,
}

/// Registration-ordered set of libraries. Guarded by the session's registry lock.
#[derive(Debug, Default)]
pub struct LibraryRegistry {
    entries: Vec<RegisteredLibrary>,
    index: HashMap<LibraryLocation, usize>,
    next_ordinal: u64,
}

impl LibraryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers new locations; duplicates (in the input or already known) are
    /// reported as known and keep their first position.
    pub fn add_libraries(&mut self, locations: &[LibraryLocation]) -> Registration {
        let mut registration = Registration::default();
        for location in locations {
            if self.index.contains_key(location) {
                if !registration.known.contains(location) && !registration.added.contains(location)
                {
                    registration.known.push(location.clone());
                }
                continue;
            }
            self.push(RegisteredLibrary {
                location: location.clone(),
                ordinal: self.next_ordinal,
                state: LibraryState::Registered,
                committed: None,
            });
            registration.added.push(location.clone());
        }
        registration
    }

    /// Classifies freshly computed fingerprints against the last committed
    /// versions. Unreachable libraries are marked stale; reachable ones lose
    /// any stale marker.
    pub fn detect_changes(
        &mut self,
        probes: Vec<(LibraryLocation, Result<Fingerprint, DbError>)>,
    ) -> ChangeSet {
        let mut changes = ChangeSet::default();
        for (location, probe) in probes {
            let Some(&idx) = self.index.get(&location) else {
                continue;
            };
            let entry = &mut self.entries[idx];
            match probe {
                Ok(fingerprint) => {
                    if matches!(entry.state, LibraryState::Stale { .. }) {
                        entry.state = settled_state(entry);
                    }
                    let same = entry
                        .committed
                        .as_ref()
                        .is_some_and(|v| v.fingerprint == fingerprint);
                    if same {
                        changes.unchanged.push(location);
                    } else {
                        changes.changed.push(location);
                    }
                }
                Err(err) => {
                    let reason = match err {
                        DbError::LibraryUnreachable { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    entry.state = LibraryState::Stale {
                        reason: reason.clone(),
                    };
                    changes.unreachable.push((location, reason));
                }
            }
        }
        changes
    }

    pub fn mark_committed(&mut self, version: Arc<LibraryVersion>) {
        if let Some(&idx) = self.index.get(&version.location) {
            let entry = &mut self.entries[idx];
            entry.state = LibraryState::Committed;
            entry.committed = Some(version);
        }
    }

    pub fn mark_stale(&mut self, location: &LibraryLocation, reason: impl Into<String>) {
        if let Some(&idx) = self.index.get(location) {
            self.entries[idx].state = LibraryState::Stale {
                reason: reason.into(),
            };
        }
    }

    pub fn remove(&mut self, location: &LibraryLocation) -> Option<RegisteredLibrary> {
        let idx = self.index.remove(location)?;
        let removed = self.entries.remove(idx);
        for entry in &self.entries[idx..] {
            if let Some(slot) = self.index.get_mut(&entry.location) {
                *slot -= 1;
            }
        }
        Some(removed)
    }

    pub fn get(&self, location: &LibraryLocation) -> Option<&RegisteredLibrary> {
        self.index.get(location).map(|&idx| &self.entries[idx])
    }

    pub fn contains(&self, location: &LibraryLocation) -> bool {
        self.index.contains_key(location)
    }

    pub fn locations(&self) -> Vec<LibraryLocation> {
        self.entries.iter().map(|e| e.location.clone()).collect()
    }

    pub fn entries(&self) -> &[RegisteredLibrary] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Re-registers a persisted library with its committed version.
    pub fn restore(&mut self, ordinal: u64, version: Arc<LibraryVersion>) {
        if self.index.contains_key(&version.location) {
            return;
        }
        self.push(RegisteredLibrary {
            location: version.location.clone(),
            ordinal,
            state: LibraryState::Committed,
            committed: Some(version),
        });
        self.entries.sort_by_key(|e| e.ordinal);
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(idx, e)| (e.location.clone(), idx))
            .collect();
    }

    fn push(&mut self, entry: RegisteredLibrary) {
        self.next_ordinal = self.next_ordinal.max(entry.ordinal + 1);
        self.index.insert(entry.location.clone(), self.entries.len());
        self.entries.push(entry);
    }
}

fn settled_state(entry: &RegisteredLibrary) -> LibraryState {
    if entry.committed.is_some() {
        LibraryState::Committed
    } else {
        LibraryState::Registered
    }
}
