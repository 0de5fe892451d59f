//! Session facade: the public lifecycle entry point.
//!
//! Every mutating operation is split into background jobs keyed by the
//! library (or feature) it touches and returns a handle immediately. Reads
//! go through [`ClasspathSnapshot`]s, which never wait on parsing.
//!
//! Lock order: registry, then store, then feature tables. A store publish
//! never takes the registry lock; registry bookkeeping happens after it.

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::bytecode::ClassParser;
use crate::config::{ClosePolicy, SessionSettings};
use crate::error::{DbError, JobError, Result};
use crate::feature::{Feature, FeatureRegistry, FeatureStats};
use crate::jobs::{
    AwaitReport, Completer, JobContext, JobFailure, JobHandle, JobKey, JobKind, Scheduler,
    SchedulerCounts, SchedulerRuntime,
};
use crate::library;
use crate::model::{
    DatabaseVersion, DecodedClass, Fingerprint, GenerationId, LibraryLocation, UnreadableEntry,
};
use crate::persistence::{CommitWrite, PersistenceStats, PersistentStore};
use crate::registry::{LibraryRegistry, LibraryState, RegisteredLibrary};
use crate::snapshot::{ClasspathSnapshot, Selection};
use crate::store::{Generation, Published, StoreStats, SymbolStore, build_generation};
use crate::sync;

/// State shared by the session, its jobs and its snapshots.
pub(crate) struct Shared {
    pub(crate) registry: RwLock<LibraryRegistry>,
    pub(crate) store: SymbolStore,
    pub(crate) features: FeatureRegistry,
    persistence: Option<PersistentStore>,
    parser: Arc<dyn ClassParser>,
    closed: AtomicBool,
}

impl Shared {
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::SessionClosed);
        }
        Ok(())
    }

    /// Publishes (or tombstones) one library generation. Feature partitions
    /// are swapped and the commit is persisted inside the store's publish
    /// section; a persistence failure leaves everything untouched.
    fn publish(
        &self,
        location: &LibraryLocation,
        next: Option<Arc<Generation>>,
    ) -> Result<Published> {
        let ordinal = sync::read(&self.registry)
            .get(location)
            .map(|entry| entry.ordinal)
            .unwrap_or_default();
        self.store.publish(location, next, |ctx| {
            let plan = self.features.plan_publish(ctx);
            if let Some(persistence) = &self.persistence {
                persistence
                    .write_commit(&CommitWrite {
                        location: ctx.location,
                        ordinal,
                        previous: ctx.previous.map(|g| g.id()),
                        next: ctx.next.map(|g| &**g),
                        database_version: ctx.database_version,
                        next_generation: ctx.next_generation,
                        partitions: plan.partition_writes(),
                    })
                    .map_err(DbError::storage)?;
            }
            self.features.apply_publish(plan);
            Ok(())
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LibraryStatus {
    /// A new generation was committed.
    Committed,
    /// Fingerprint matched the committed version; nothing was parsed.
    Unchanged,
    /// The library was tombstoned and unregistered.
    Removed,
    /// The library was not registered when its job ran.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LibraryOutcome {
    pub location: LibraryLocation,
    pub status: LibraryStatus,
    pub fingerprint: Option<Fingerprint>,
    pub generation: Option<GenerationId>,
    pub classes: usize,
    pub unreadable: Vec<UnreadableEntry>,
}

impl LibraryOutcome {
    fn of(
        location: &LibraryLocation,
        status: LibraryStatus,
        generation: Option<&Generation>,
    ) -> Self {
        Self {
            location: location.clone(),
            status,
            fingerprint: generation.map(|g| g.version().fingerprint.clone()),
            generation: generation.map(Generation::id),
            classes: generation.map_or(0, Generation::len),
            unreadable: generation.map(|g| g.unreadable().to_vec()).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnreachableLibrary {
    pub location: LibraryLocation,
    pub reason: String,
}

/// Result of `load`, `refresh` and `unload`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub database_version: DatabaseVersion,
    pub libraries: Vec<LibraryOutcome>,
    pub unreachable: Vec<UnreachableLibrary>,
    pub failures: Vec<JobFailure>,
}

impl LoadReport {
    pub fn committed(&self) -> impl Iterator<Item = &LibraryOutcome> {
        self.libraries
            .iter()
            .filter(|l| l.status == LibraryStatus::Committed)
    }

    pub fn is_success(&self) -> bool {
        self.unreachable.is_empty() && self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub database_version: DatabaseVersion,
    pub registered_libraries: usize,
    pub stale_libraries: usize,
    pub store: StoreStats,
    pub features: Vec<FeatureStats>,
    pub jobs: SchedulerCounts,
    pub persistence: Option<PersistenceStats>,
}

pub struct Session {
    shared: Arc<Shared>,
    scheduler: Scheduler,
    runtime: Mutex<Option<SchedulerRuntime>>,
    close_policy: ClosePolicy,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("database_version", &self.shared.store.database_version())
            .field("features", &self.shared.features.names())
            .field("close_policy", &self.close_policy)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Opens a session: installs the configured features, starts the
    /// scheduler and, when persistence is configured, restores the last
    /// committed state.
    pub fn open(settings: SessionSettings) -> Result<Session> {
        let persistence = settings
            .persistence
            .map(PersistentStore::open)
            .transpose()
            .map_err(DbError::storage)?;

        let shared = Arc::new(Shared {
            registry: RwLock::new(LibraryRegistry::new()),
            store: SymbolStore::new(),
            features: FeatureRegistry::new(),
            persistence,
            parser: settings.parser,
            closed: AtomicBool::new(false),
        });
        for feature in settings.features {
            if let Some(persistence) = &shared.persistence {
                persistence
                    .ensure_feature(feature.name())
                    .map_err(DbError::storage)?;
            }
            shared.features.install(feature)?;
        }

        let (scheduler, runtime) = Scheduler::start(settings.workers)?;
        let session = Session {
            shared,
            scheduler,
            runtime: Mutex::new(Some(runtime)),
            close_policy: settings.close_policy,
        };
        if session.shared.persistence.is_some() {
            session.restore()?;
        }
        tracing::debug!(
            workers = settings.workers,
            features = ?session.shared.features.names(),
            "session opened"
        );
        Ok(session)
    }

    fn restore(&self) -> Result<()> {
        let Some(persistence) = &self.shared.persistence else {
            return Ok(());
        };
        let restored = persistence.restore().map_err(DbError::storage)?;
        let generations: Vec<(u64, Arc<Generation>)> = restored
            .libraries
            .into_iter()
            .map(|lib| {
                let generation = build_generation(
                    &lib.location,
                    lib.fingerprint,
                    lib.generation,
                    lib.classes,
                    lib.unreadable,
                );
                (lib.ordinal, generation)
            })
            .collect();

        {
            let mut registry = sync::write(&self.shared.registry);
            for (ordinal, generation) in &generations {
                registry.restore(*ordinal, Arc::clone(generation.version()));
            }
        }
        self.shared.store.restore(
            restored.database_version,
            restored.next_generation,
            generations.iter().map(|(_, g)| Arc::clone(g)).collect(),
        );

        let live: Vec<GenerationId> = generations.iter().map(|(_, g)| g.id()).collect();
        let mut needs_sync = Vec::new();
        for name in self.shared.features.names() {
            persistence
                .retain_feature_partitions(&name, &live)
                .map_err(DbError::storage)?;
            for (_, generation) in &generations {
                let rows = persistence
                    .feature_partition(&name, generation.id())
                    .map_err(DbError::storage)?;
                let pending = self.shared.store.while_current(generation, || {
                    self.shared.features.restore_partition(&name, generation, rows)
                });
                if pending == Some(true) && !needs_sync.contains(generation.location()) {
                    needs_sync.push(generation.location().clone());
                }
            }
        }
        for location in needs_sync {
            self.submit_sync(location);
        }

        tracing::info!(
            libraries = generations.len(),
            version = %restored.database_version,
            "restored persisted state"
        );
        Ok(())
    }

    /// Registers `libraries` and schedules a parse+commit job for each, then
    /// a feature sync job. Libraries whose fingerprint matches their last
    /// committed version are reported unchanged without being parsed. The
    /// handle resolves once the commits have landed.
    pub fn load<I, P>(&self, libraries: I) -> Result<JobHandle<LoadReport>>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.shared.ensure_open()?;
        let locations = dedup_locations(libraries);
        let registration = sync::write(&self.shared.registry).add_libraries(&locations);
        tracing::debug!(
            added = registration.added.len(),
            known = registration.known.len(),
            "registered libraries"
        );
        Ok(self.submit_loads(JobKind::Load, locations))
    }

    /// Recomputes every known library's fingerprint and reloads the changed
    /// ones. Unreachable libraries are marked stale, keep their data and are
    /// retried on the next refresh.
    pub fn refresh(&self) -> Result<JobHandle<LoadReport>> {
        self.shared.ensure_open()?;
        let locations = sync::read(&self.shared.registry).locations();
        Ok(self.submit_loads(JobKind::Refresh, locations))
    }

    /// Tombstones `libraries` and forgets them.
    pub fn unload<I, P>(&self, libraries: I) -> Result<JobHandle<LoadReport>>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.shared.ensure_open()?;
        let handles = dedup_locations(libraries)
            .into_iter()
            .map(|location| {
                let shared = Arc::clone(&self.shared);
                self.scheduler.submit(
                    JobKind::UnloadLibrary,
                    vec![JobKey::Library(location.clone())],
                    move |ctx| unload_library(&shared, &location, ctx),
                )
            })
            .collect();
        let shared = Arc::clone(&self.shared);
        Ok(self.composite(JobKind::Unload, handles, move |_, handles| {
            collect_report(&shared, handles)
        }))
    }

    /// Fully re-derives every installed feature from current store contents.
    pub fn rebuild_features(&self) -> Result<JobHandle<AwaitReport>> {
        self.shared.ensure_open()?;
        let handles = self
            .shared
            .features
            .names()
            .into_iter()
            .map(|name| self.submit_rebuild(JobKind::RebuildFeature, name))
            .collect();
        Ok(self.composite(JobKind::RebuildFeatures, handles, |report, _| report))
    }

    /// Installs a feature after construction. When the store already holds
    /// data, returns the catch-up job deriving that feature's rows.
    pub fn install_feature(&self, feature: Arc<dyn Feature>) -> Result<Option<JobHandle<()>>> {
        self.shared.ensure_open()?;
        let name = feature.name().to_string();
        if let Some(persistence) = &self.shared.persistence {
            persistence
                .ensure_feature(&name)
                .map_err(DbError::storage)?;
        }
        self.shared.features.install(feature)?;
        if self.shared.store.current_generations().is_empty() {
            return Ok(None);
        }
        Ok(Some(self.submit_rebuild(JobKind::CatchUpFeature, name)))
    }

    /// Resolves when every job submitted before this call is terminal.
    pub fn await_background_jobs(&self) -> Result<JobHandle<AwaitReport>> {
        self.shared.ensure_open()?;
        Ok(self.scheduler.await_all())
    }

    pub fn classpath(&self, selection: Selection) -> Result<ClasspathSnapshot> {
        ClasspathSnapshot::create(&self.shared, selection)
    }

    pub fn feature(&self, name: &str) -> Result<Arc<dyn Feature>> {
        self.shared.ensure_open()?;
        self.shared
            .features
            .get(name)
            .ok_or_else(|| DbError::UnknownFeature(name.to_string()))
    }

    /// Registered libraries in registration order.
    pub fn libraries(&self) -> Result<Vec<RegisteredLibrary>> {
        self.shared.ensure_open()?;
        Ok(sync::read(&self.shared.registry).entries().to_vec())
    }

    pub fn database_version(&self) -> Result<DatabaseVersion> {
        self.shared.ensure_open()?;
        Ok(self.shared.store.database_version())
    }

    pub fn stats(&self) -> Result<SessionStats> {
        self.shared.ensure_open()?;
        let (registered_libraries, stale_libraries) = {
            let registry = sync::read(&self.shared.registry);
            let stale = registry
                .entries()
                .iter()
                .filter(|e| matches!(e.state, LibraryState::Stale { .. }))
                .count();
            (registry.len(), stale)
        };
        let persistence = self
            .shared
            .persistence
            .as_ref()
            .map(PersistentStore::stats)
            .transpose()
            .map_err(DbError::storage)?;
        Ok(SessionStats {
            database_version: self.shared.store.database_version(),
            registered_libraries,
            stale_libraries,
            store: self.shared.store.stats(),
            features: self.shared.features.stats(),
            jobs: self.scheduler.stats(),
            persistence,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Cancels or awaits outstanding jobs per the close policy, then releases
    /// store and feature data. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.close_policy == ClosePolicy::Cancel {
            self.scheduler.cancel_all();
        }
        self.scheduler.shutdown();
        if let Some(runtime) = sync::lock(&self.runtime).take() {
            runtime.join();
        }
        self.shared.store.clear();
        self.shared.features.clear();
        tracing::debug!(policy = ?self.close_policy, "session closed");
    }

    fn submit_loads(&self, kind: JobKind, locations: Vec<LibraryLocation>) -> JobHandle<LoadReport> {
        let handles = locations
            .into_iter()
            .map(|location| {
                let shared = Arc::clone(&self.shared);
                let job_location = location.clone();
                let register = kind == JobKind::Load;
                let handle = self.scheduler.submit(
                    JobKind::LoadLibrary,
                    vec![JobKey::Library(location.clone())],
                    move |ctx| load_library(&shared, &job_location, register, ctx),
                );
                self.submit_sync(location);
                handle
            })
            .collect();
        let shared = Arc::clone(&self.shared);
        self.composite(kind, handles, move |_, handles| collect_report(&shared, handles))
    }

    fn submit_sync(&self, location: LibraryLocation) -> JobHandle<usize> {
        let shared = Arc::clone(&self.shared);
        self.scheduler.submit(
            JobKind::SyncFeatures,
            vec![JobKey::Library(location.clone())],
            move |ctx| sync_features(&shared, &location, ctx),
        )
    }

    fn submit_rebuild(&self, kind: JobKind, name: String) -> JobHandle<()> {
        let shared = Arc::clone(&self.shared);
        self.scheduler
            .submit(kind, vec![JobKey::Feature(name.clone())], move |ctx| {
                rebuild_feature(&shared, &name, ctx)
            })
    }

    /// A handle that resolves once every handle in `parts` is terminal.
    fn composite<S, T, F>(&self, kind: JobKind, parts: Vec<JobHandle<S>>, finish: F) -> JobHandle<T>
    where
        S: Clone + Send + 'static,
        T: Send + 'static,
        F: FnOnce(AwaitReport, &[JobHandle<S>]) -> T + Send + 'static,
    {
        let (handle, completer) = Completer::new(self.scheduler.next_id(), kind);
        completer.start();
        let ids = parts.iter().map(JobHandle::id).collect();
        self.scheduler.when_all(Some(ids), move |report| {
            completer.complete(Ok(finish(report, &parts)));
        });
        handle
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn dedup_locations<I, P>(libraries: I) -> Vec<LibraryLocation>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut seen = HashSet::new();
    libraries
        .into_iter()
        .map(LibraryLocation::new)
        .filter(|location| seen.insert(location.clone()))
        .collect()
}

fn collect_report(shared: &Shared, handles: &[JobHandle<LibraryOutcome>]) -> LoadReport {
    let mut report = LoadReport {
        database_version: shared.store.database_version(),
        ..LoadReport::default()
    };
    for handle in handles {
        match handle.outcome() {
            Some(Ok(outcome)) => report.libraries.push(outcome),
            Some(Err(JobError::LibraryUnreachable { location, reason })) => {
                report
                    .unreachable
                    .push(UnreachableLibrary { location, reason });
            }
            Some(Err(error)) => report.failures.push(JobFailure {
                id: handle.id(),
                kind: handle.kind(),
                error,
            }),
            None => report.failures.push(JobFailure {
                id: handle.id(),
                kind: handle.kind(),
                error: JobError::Cancelled,
            }),
        }
    }
    report
}

/// Parses and commits one library. A `register` job (an explicit load)
/// re-registers its location first, since an unload queued ahead of it may
/// have dropped the entry; a refresh job skips libraries unloaded meanwhile.
fn load_library(
    shared: &Shared,
    location: &LibraryLocation,
    register: bool,
    ctx: &JobContext,
) -> Result<LibraryOutcome> {
    ctx.checkpoint()?;
    let probe = library::fingerprint(location);
    let changes = {
        let mut registry = sync::write(&shared.registry);
        if register {
            registry.add_libraries(std::slice::from_ref(location));
        }
        registry.detect_changes(vec![(location.clone(), probe)])
    };
    if let Some((_, reason)) = changes.unreachable.into_iter().next() {
        tracing::warn!(library = %location, %reason, "library unreachable");
        return Err(DbError::LibraryUnreachable {
            location: location.clone(),
            reason,
        });
    }
    if !changes.unchanged.is_empty() {
        tracing::debug!(library = %location, "fingerprint unchanged");
        let current = shared.store.current(location);
        return Ok(LibraryOutcome::of(
            location,
            LibraryStatus::Unchanged,
            current.as_deref(),
        ));
    }
    if changes.changed.is_empty() {
        return Ok(LibraryOutcome::of(location, LibraryStatus::Skipped, None));
    }

    let opened = match library::open_library(location) {
        Ok(opened) => opened,
        Err(err) => {
            if let DbError::LibraryUnreachable { reason, .. } = &err {
                tracing::warn!(library = %location, %reason, "library unreachable");
                sync::write(&shared.registry).mark_stale(location, reason.clone());
            }
            return Err(err);
        }
    };
    let fingerprint = opened.fingerprint().clone();
    let mut decoded = Vec::with_capacity(opened.entries().len());
    let mut unreadable = Vec::new();
    for entry in opened.into_entries() {
        ctx.checkpoint()?;
        match shared.parser.parse(&entry.bytes) {
            Ok(class) => decoded.push(DecodedClass {
                content_hash: library::hash_content(&entry.bytes),
                entry: entry.name,
                class,
            }),
            Err(err) => {
                tracing::warn!(library = %location, entry = %entry.name, %err, "unreadable class entry");
                unreadable.push(UnreadableEntry {
                    entry: entry.name,
                    reason: err.to_string(),
                });
            }
        }
    }

    let generation = shared
        .store
        .prepare(location, fingerprint, decoded, unreadable);
    ctx.checkpoint()?;
    let published = shared.publish(location, Some(Arc::clone(&generation)))?;
    sync::write(&shared.registry).mark_committed(Arc::clone(generation.version()));
    tracing::info!(
        library = %location,
        generation = %generation.id(),
        version = %published.database_version,
        classes = generation.len(),
        unreadable = generation.unreadable().len(),
        "committed library"
    );
    Ok(LibraryOutcome::of(
        location,
        LibraryStatus::Committed,
        Some(&generation),
    ))
}

fn unload_library(
    shared: &Shared,
    location: &LibraryLocation,
    ctx: &JobContext,
) -> Result<LibraryOutcome> {
    ctx.checkpoint()?;
    let known = sync::read(&shared.registry).contains(location);
    let published = shared.publish(location, None)?;
    sync::write(&shared.registry).remove(location);
    match &published.previous {
        Some(previous) => {
            tracing::info!(
                library = %location,
                version = %published.database_version,
                "unloaded library"
            );
            let mut outcome =
                LibraryOutcome::of(location, LibraryStatus::Removed, Some(previous.as_ref()));
            outcome.unreadable.clear();
            Ok(outcome)
        }
        None if known => Ok(LibraryOutcome::of(location, LibraryStatus::Removed, None)),
        None => Ok(LibraryOutcome::of(location, LibraryStatus::Skipped, None)),
    }
}

/// Derives rows for classes left pending by the last commit of `location`.
/// Rows derived against a generation that was superseded meanwhile are
/// discarded.
fn sync_features(shared: &Shared, location: &LibraryLocation, ctx: &JobContext) -> Result<usize> {
    let Some(generation) = shared.store.current(location) else {
        return Ok(0);
    };
    let mut synced = 0;
    for batch in shared.features.pending_batches(&generation) {
        ctx.checkpoint()?;
        let derived = batch.derive();
        let classes = derived.rows().len();
        let applied = shared.store.while_current(&generation, || -> Result<()> {
            if let Some(persistence) = &shared.persistence {
                persistence
                    .write_feature_rows(derived.feature(), generation.id(), derived.rows())
                    .map_err(DbError::storage)?;
            }
            shared.features.apply_sync(derived);
            Ok(())
        });
        match applied {
            Some(result) => {
                result?;
                synced += classes;
            }
            None => {
                tracing::debug!(
                    library = %location,
                    generation = %generation.id(),
                    "generation superseded before sync"
                );
                break;
            }
        }
    }
    Ok(synced)
}

/// Replaces the rows of feature `name` for every current generation with a
/// full derivation.
fn rebuild_feature(shared: &Shared, name: &str, ctx: &JobContext) -> Result<()> {
    let mut rebuilt = 0usize;
    for generation in shared.store.current_generations() {
        ctx.checkpoint()?;
        let derived = shared
            .features
            .derive_full(name, &generation)
            .ok_or_else(|| DbError::UnknownFeature(name.to_string()))?;
        let applied = shared.store.while_current(&generation, || -> Result<()> {
            if let Some(persistence) = &shared.persistence {
                persistence
                    .replace_feature_partition(name, generation.id(), derived.rows())
                    .map_err(DbError::storage)?;
            }
            shared.features.apply_rebuild(derived);
            Ok(())
        });
        if let Some(result) = applied {
            result?;
            rebuilt += 1;
        }
    }
    tracing::debug!(feature = name, generations = rebuilt, "rebuilt feature");
    Ok(())
}
