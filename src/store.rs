//! Versioned symbol store.
//!
//! Every library commit produces one immutable [`Generation`]. The store keeps
//! a strong reference only to each library's current generation; superseded
//! generations stay reachable through `Weak` lineage links for as long as some
//! snapshot pins them, and are reclaimed once the last pin is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde::Serialize;

use crate::error::Result;
use crate::model::{
    ClassRecord, DatabaseVersion, DecodedClass, Fingerprint, GenerationId, LibraryLocation,
    LibraryVersion, UnreadableEntry,
};
use crate::sync;

/// All class records of one library version.
#[derive(Debug)]
pub struct Generation {
    version: Arc<LibraryVersion>,
    classes: Vec<Arc<ClassRecord>>,
    by_name: HashMap<String, usize>,
    unreadable: Vec<UnreadableEntry>,
}

impl Generation {
    pub fn version(&self) -> &Arc<LibraryVersion> {
        &self.version
    }

    pub fn id(&self) -> GenerationId {
        self.version.generation
    }

    pub fn location(&self) -> &LibraryLocation {
        &self.version.location
    }

    pub fn classes(&self) -> &[Arc<ClassRecord>] {
        &self.classes
    }

    pub fn class(&self, fqn: &str) -> Option<&Arc<ClassRecord>> {
        self.by_name.get(fqn).map(|&idx| &self.classes[idx])
    }

    pub fn unreadable(&self) -> &[UnreadableEntry] {
        &self.unreadable
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// Handed to the publish hook while the store's write lock is held.
pub struct PublishContext<'a> {
    pub location: &'a LibraryLocation,
    pub previous: Option<&'a Arc<Generation>>,
    pub next: Option<&'a Arc<Generation>>,
    pub database_version: DatabaseVersion,
    pub next_generation: u64,
}

#[derive(Debug, Clone)]
pub struct Published {
    pub previous: Option<Arc<Generation>>,
    pub current: Option<Arc<Generation>>,
    pub database_version: DatabaseVersion,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub database_version: u64,
    pub libraries: usize,
    pub classes: usize,
    pub unreadable_entries: usize,
    pub retained_generations: usize,
}

#[derive(Debug)]
struct LineageEntry {
    since: DatabaseVersion,
    /// `None` marks a tombstone.
    generation: Option<Weak<Generation>>,
}

impl LineageEntry {
    fn is_dead(&self) -> bool {
        self.generation
            .as_ref()
            .is_none_or(|weak| weak.strong_count() == 0)
    }
}

#[derive(Debug, Default)]
struct StoreState {
    database_version: DatabaseVersion,
    order: Vec<LibraryLocation>,
    current: HashMap<LibraryLocation, Arc<Generation>>,
    lineage: HashMap<LibraryLocation, Vec<LineageEntry>>,
}

#[derive(Debug)]
pub struct SymbolStore {
    state: RwLock<StoreState>,
    next_generation: AtomicU64,
}

impl Default for SymbolStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Builds a generation outside of any lock. Duplicate FQNs keep the first
    /// entry; later ones are recorded as unreadable.
    pub fn prepare(
        &self,
        location: &LibraryLocation,
        fingerprint: Fingerprint,
        decoded: Vec<DecodedClass>,
        unreadable: Vec<UnreadableEntry>,
    ) -> Arc<Generation> {
        let id = GenerationId(self.next_generation.fetch_add(1, Ordering::SeqCst));
        build_generation(location, fingerprint, id, decoded, unreadable)
    }

    /// Atomically replaces (or, with `next == None`, tombstones) a library's
    /// current generation and bumps the database version.
    ///
    /// `hook` runs under the write lock before anything is mutated; if it fails
    /// the store is left untouched. A tombstone for a library with no current
    /// generation is a no-op and does not bump the version.
    pub fn publish<F>(
        &self,
        location: &LibraryLocation,
        next: Option<Arc<Generation>>,
        hook: F,
    ) -> Result<Published>
    where
        F: FnOnce(&PublishContext<'_>) -> Result<()>,
    {
        let mut state = sync::write(&self.state);
        let previous = state.current.get(location).cloned();
        if previous.is_none() && next.is_none() {
            return Ok(Published {
                previous: None,
                current: None,
                database_version: state.database_version,
            });
        }

        let database_version = state.database_version.next();
        hook(&PublishContext {
            location,
            previous: previous.as_ref(),
            next: next.as_ref(),
            database_version,
            next_generation: self.next_generation.load(Ordering::SeqCst),
        })?;

        state.database_version = database_version;
        match &next {
            Some(generation) => {
                state
                    .current
                    .insert(location.clone(), Arc::clone(generation));
            }
            None => {
                state.current.remove(location);
            }
        }
        if !state.order.contains(location) {
            state.order.push(location.clone());
        }
        let lineage = state.lineage.entry(location.clone()).or_default();
        lineage.push(LineageEntry {
            since: database_version,
            generation: next.as_ref().map(Arc::downgrade),
        });
        prune_lineage(lineage);

        Ok(Published {
            previous,
            current: next,
            database_version,
        })
    }

    /// The record for `fqn` visible at `as_of`, searching `precedence` in
    /// order (registration order for a whole-classpath lookup). Reclaimed
    /// generations resolve to not-found.
    pub fn lookup(
        &self,
        fqn: &str,
        as_of: DatabaseVersion,
        precedence: &[LibraryLocation],
    ) -> Option<Arc<ClassRecord>> {
        let state = sync::read(&self.state);
        for location in precedence {
            let Some(lineage) = state.lineage.get(location) else {
                continue;
            };
            let Some(entry) = lineage.iter().rev().find(|e| e.since <= as_of) else {
                continue;
            };
            let Some(generation) = entry.generation.as_ref().and_then(Weak::upgrade) else {
                continue;
            };
            if let Some(record) = generation.class(fqn) {
                return Some(Arc::clone(record));
            }
        }
        None
    }

    pub fn current(&self, location: &LibraryLocation) -> Option<Arc<Generation>> {
        sync::read(&self.state).current.get(location).cloned()
    }

    /// Current generations in first-commit order.
    pub fn current_generations(&self) -> Vec<Arc<Generation>> {
        let state = sync::read(&self.state);
        state
            .order
            .iter()
            .filter_map(|loc| state.current.get(loc).cloned())
            .collect()
    }

    /// Resolves `locations` to their current generations together with the
    /// version they were observed at, under one read lock.
    pub fn pin(
        &self,
        locations: &[LibraryLocation],
    ) -> (DatabaseVersion, Vec<Option<Arc<Generation>>>) {
        let state = sync::read(&self.state);
        let pinned = locations
            .iter()
            .map(|loc| state.current.get(loc).cloned())
            .collect();
        (state.database_version, pinned)
    }

    /// Runs `f` only if `generation` is still its library's current one,
    /// holding the read lock so no publish can interleave.
    pub fn while_current<R>(&self, generation: &Arc<Generation>, f: impl FnOnce() -> R) -> Option<R> {
        let state = sync::read(&self.state);
        let is_current = state
            .current
            .get(generation.location())
            .is_some_and(|g| Arc::ptr_eq(g, generation));
        is_current.then(f)
    }

    pub fn database_version(&self) -> DatabaseVersion {
        sync::read(&self.state).database_version
    }

    pub fn next_generation(&self) -> u64 {
        self.next_generation.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StoreStats {
        let state = sync::read(&self.state);
        let retained_generations = state
            .lineage
            .values()
            .flatten()
            .filter(|e| !e.is_dead())
            .count();
        StoreStats {
            database_version: state.database_version.0,
            libraries: state.current.len(),
            classes: state.current.values().map(|g| g.len()).sum(),
            unreadable_entries: state.current.values().map(|g| g.unreadable().len()).sum(),
            retained_generations,
        }
    }

    /// Installs persisted generations as current without bumping the version.
    pub fn restore(
        &self,
        database_version: DatabaseVersion,
        next_generation: u64,
        generations: Vec<Arc<Generation>>,
    ) {
        let mut state = sync::write(&self.state);
        state.database_version = state.database_version.max(database_version);
        for generation in generations {
            let location = generation.location().clone();
            if !state.order.contains(&location) {
                state.order.push(location.clone());
            }
            state.lineage.entry(location.clone()).or_default().push(LineageEntry {
                since: database_version,
                generation: Some(Arc::downgrade(&generation)),
            });
            state.current.insert(location, generation);
        }
        let floor = state
            .current
            .values()
            .map(|g| g.id().0 + 1)
            .max()
            .unwrap_or(1)
            .max(next_generation);
        self.next_generation.fetch_max(floor, Ordering::SeqCst);
    }

    /// Drops every current generation. Pinned snapshots keep theirs alive.
    pub fn clear(&self) {
        let mut state = sync::write(&self.state);
        state.current.clear();
        state.lineage.clear();
        state.order.clear();
    }
}

pub(crate) fn build_generation(
    location: &LibraryLocation,
    fingerprint: Fingerprint,
    id: GenerationId,
    decoded: Vec<DecodedClass>,
    mut unreadable: Vec<UnreadableEntry>,
) -> Arc<Generation> {
    let version = Arc::new(LibraryVersion {
        location: location.clone(),
        fingerprint,
        generation: id,
    });
    let mut classes: Vec<Arc<ClassRecord>> = Vec::with_capacity(decoded.len());
    let mut by_name = HashMap::with_capacity(decoded.len());
    for item in decoded {
        if let Some(&first) = by_name.get(&item.class.name) {
            let first: &Arc<ClassRecord> = &classes[first];
            unreadable.push(UnreadableEntry {
                reason: format!(
                    "duplicate class {} (already defined by {})",
                    item.class.name, first.entry
                ),
                entry: item.entry,
            });
            continue;
        }
        by_name.insert(item.class.name.clone(), classes.len());
        classes.push(Arc::new(ClassRecord {
            library: Arc::clone(&version),
            entry: item.entry,
            content_hash: item.content_hash,
            class: item.class,
        }));
    }
    Arc::new(Generation {
        version,
        classes,
        by_name,
        unreadable,
    })
}

/// Drops leading lineage entries that can no longer resolve to anything.
fn prune_lineage(lineage: &mut Vec<LineageEntry>) {
    let keep_from = lineage
        .iter()
        .position(|e| !e.is_dead())
        .unwrap_or(lineage.len().saturating_sub(1));
    lineage.drain(..keep_from);
}
