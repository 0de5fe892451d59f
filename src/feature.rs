//! Pluggable derived indices ("features") over class records.
//!
//! Each installed feature owns a row table partitioned by generation. When a
//! library commits, the partition of the superseded generation is dropped in
//! the same publish step as the store swap; rows of byte-identical classes are
//! carried into the new partition and every other class is queued as pending
//! until a sync job derives its rows.
//!
//! Lock order: the store lock is always taken before any feature lock.
//! Feature tables are only mutated while the store lock is held.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{DbError, Result};
use crate::model::{ClassRecord, GenerationId};
use crate::store::{Generation, PublishContext};
use crate::sync;

/// Capability implemented by every derived index.
pub trait Feature: Send + Sync + 'static {
    /// Unique name; also the suffix of its persisted table.
    fn name(&self) -> &str;

    /// Classes this feature derives rows from. Uninteresting classes never
    /// reach [`Feature::on_classes_changed`].
    fn interested_in(&self, _class: &ClassRecord) -> bool {
        true
    }

    /// Emits rows for added and updated classes. Rows of removed classes are
    /// dropped by the table itself.
    fn on_classes_changed(&self, changes: &ClassChanges<'_>, sink: &mut FeatureSink);

    fn as_any(&self) -> &dyn Any;
}

pub struct ClassChanges<'a> {
    pub added: &'a [Arc<ClassRecord>],
    pub removed: &'a [Arc<ClassRecord>],
    /// `(old, new)` pairs.
    pub updated: &'a [(Arc<ClassRecord>, Arc<ClassRecord>)],
}

impl ClassChanges<'_> {
    /// Added classes and the new side of updated ones.
    pub fn current(&self) -> impl Iterator<Item = &Arc<ClassRecord>> {
        self.added.iter().chain(self.updated.iter().map(|(_, new)| new))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeatureRow {
    pub key: String,
    pub class: String,
    pub payload: String,
}

/// Collects rows emitted by a feature for one batch of classes.
#[derive(Debug, Default)]
pub struct FeatureSink {
    rows: HashMap<(GenerationId, String), Vec<FeatureRow>>,
}

impl FeatureSink {
    pub fn emit(&mut self, class: &ClassRecord, key: impl Into<String>, payload: impl Into<String>) {
        self.rows
            .entry((class.generation(), class.name().to_string()))
            .or_default()
            .push(FeatureRow {
                key: key.into(),
                class: class.name().to_string(),
                payload: payload.into(),
            });
    }

    fn take(&mut self, generation: GenerationId, class: &str) -> Vec<FeatureRow> {
        self.rows
            .remove(&(generation, class.to_string()))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
struct PendingClass {
    current: Arc<ClassRecord>,
    previous: Option<Arc<ClassRecord>>,
}

#[derive(Debug, Clone, Default)]
struct Partition {
    indexed: BTreeMap<String, Vec<FeatureRow>>,
    pending: Vec<PendingClass>,
}

#[derive(Debug, Default)]
struct FeatureTable {
    partitions: HashMap<GenerationId, Partition>,
    by_key: HashMap<String, BTreeSet<(GenerationId, String)>>,
}

impl FeatureTable {
    fn index_rows(&mut self, generation: GenerationId, class: &str, rows: &[FeatureRow]) {
        for row in rows {
            self.by_key
                .entry(row.key.clone())
                .or_default()
                .insert((generation, class.to_string()));
        }
    }

    fn unindex_rows(&mut self, generation: GenerationId, class: &str, rows: &[FeatureRow]) {
        for row in rows {
            if let Some(set) = self.by_key.get_mut(&row.key) {
                set.remove(&(generation, class.to_string()));
                if set.is_empty() {
                    self.by_key.remove(&row.key);
                }
            }
        }
    }

    fn drop_partition(&mut self, generation: GenerationId) {
        if let Some(partition) = self.partitions.remove(&generation) {
            for (class, rows) in &partition.indexed {
                self.unindex_rows(generation, class, rows);
            }
        }
    }

    fn insert_partition(&mut self, generation: GenerationId, partition: Partition) {
        self.drop_partition(generation);
        for (class, rows) in &partition.indexed {
            self.index_rows(generation, class, rows);
        }
        self.partitions.insert(generation, partition);
    }

    fn set_class_rows(&mut self, generation: GenerationId, class: &str, rows: Vec<FeatureRow>) {
        let previous = self
            .partitions
            .get_mut(&generation)
            .and_then(|p| p.indexed.remove(class));
        if let Some(previous) = previous {
            self.unindex_rows(generation, class, &previous);
        }
        self.index_rows(generation, class, &rows);
        let partition = self.partitions.entry(generation).or_default();
        partition.pending.retain(|p| p.current.name() != class);
        partition.indexed.insert(class.to_string(), rows);
    }

    fn rows(&self, key: &str, scope: &[GenerationId]) -> Vec<FeatureRow> {
        let Some(holders) = self.by_key.get(key) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for generation in scope {
            let in_generation = holders
                .range((*generation, String::new())..)
                .take_while(|(g, _)| g == generation);
            for (_, class) in in_generation {
                let Some(rows) = self
                    .partitions
                    .get(generation)
                    .and_then(|p| p.indexed.get(class))
                else {
                    continue;
                };
                out.extend(rows.iter().filter(|r| r.key == key).cloned());
            }
        }
        out
    }
}

struct FeatureSlot {
    feature: Arc<dyn Feature>,
    table: RwLock<FeatureTable>,
}

/// Name-keyed registry of installed features.
#[derive(Default)]
pub struct FeatureRegistry {
    slots: RwLock<Vec<Arc<FeatureSlot>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeatureStats {
    pub name: String,
    pub rows: usize,
    pub pending_classes: usize,
    pub partitions: usize,
}

/// Rows of one feature partition as they should be persisted by a commit.
pub struct PartitionWrite<'a> {
    pub feature: &'a str,
    pub dropped: Option<GenerationId>,
    pub written: Option<(GenerationId, &'a BTreeMap<String, Vec<FeatureRow>>)>,
}

struct SlotPlan {
    slot: Arc<FeatureSlot>,
    dropped: Option<GenerationId>,
    next: Option<(GenerationId, Partition)>,
    removed: Vec<Arc<ClassRecord>>,
}

/// Feature-side effects of one store publish, computed before anything is
/// mutated so the commit can be persisted first.
pub struct PublishPlan {
    slots: Vec<SlotPlan>,
}

impl PublishPlan {
    pub fn partition_writes(&self) -> Vec<PartitionWrite<'_>> {
        self.slots
            .iter()
            .map(|plan| PartitionWrite {
                feature: plan.slot.feature.name(),
                dropped: plan.dropped,
                written: plan
                    .next
                    .as_ref()
                    .map(|(generation, partition)| (*generation, &partition.indexed)),
            })
            .collect()
    }
}

/// Classes of one generation awaiting derivation by one feature.
pub struct PendingBatch {
    slot: Arc<FeatureSlot>,
    generation: Arc<Generation>,
    classes: Vec<PendingClass>,
}

/// Rows derived for a [`PendingBatch`], not yet visible.
pub struct DerivedRows {
    slot: Arc<FeatureSlot>,
    generation: Arc<Generation>,
    rows: Vec<(String, Vec<FeatureRow>)>,
}

impl DerivedRows {
    pub fn feature(&self) -> &str {
        self.slot.feature.name()
    }

    pub fn generation(&self) -> &Arc<Generation> {
        &self.generation
    }

    pub fn rows(&self) -> &[(String, Vec<FeatureRow>)] {
        &self.rows
    }
}

impl PendingBatch {
    pub fn feature(&self) -> &str {
        self.slot.feature.name()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Runs the feature callback outside of any lock.
    pub fn derive(self) -> DerivedRows {
        let mut added = Vec::new();
        let mut updated = Vec::new();
        for pending in &self.classes {
            match &pending.previous {
                Some(previous) => updated.push((Arc::clone(previous), Arc::clone(&pending.current))),
                None => added.push(Arc::clone(&pending.current)),
            }
        }
        let mut sink = FeatureSink::default();
        self.slot.feature.on_classes_changed(
            &ClassChanges {
                added: &added,
                removed: &[],
                updated: &updated,
            },
            &mut sink,
        );
        let generation_id = self.generation.id();
        let rows = self
            .classes
            .iter()
            .map(|p| {
                let name = p.current.name().to_string();
                let rows = sink.take(generation_id, &name);
                (name, rows)
            })
            .collect();
        DerivedRows {
            slot: self.slot,
            generation: self.generation,
            rows,
        }
    }
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a feature with an empty table.
    pub fn install(&self, feature: Arc<dyn Feature>) -> Result<()> {
        let mut slots = sync::write(&self.slots);
        if slots.iter().any(|s| s.feature.name() == feature.name()) {
            return Err(DbError::FeatureInstallConflict {
                name: feature.name().to_string(),
            });
        }
        tracing::debug!(feature = feature.name(), "installed feature");
        slots.push(Arc::new(FeatureSlot {
            feature,
            table: RwLock::new(FeatureTable::default()),
        }));
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        sync::read(&self.slots)
            .iter()
            .map(|s| s.feature.name().to_string())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Feature>> {
        self.slot(name).map(|s| Arc::clone(&s.feature))
    }

    fn slot(&self, name: &str) -> Option<Arc<FeatureSlot>> {
        sync::read(&self.slots)
            .iter()
            .find(|s| s.feature.name() == name)
            .cloned()
    }

    fn all_slots(&self) -> Vec<Arc<FeatureSlot>> {
        sync::read(&self.slots).clone()
    }

    /// Computes partition changes for a store publish. Must run inside the
    /// publish hook.
    pub fn plan_publish(&self, ctx: &PublishContext<'_>) -> PublishPlan {
        let slots = self
            .all_slots()
            .into_iter()
            .map(|slot| plan_slot(slot, ctx.previous, ctx.next))
            .collect();
        PublishPlan { slots }
    }

    /// Applies a plan computed by [`FeatureRegistry::plan_publish`] and
    /// delivers removal notifications.
    pub fn apply_publish(&self, plan: PublishPlan) {
        for SlotPlan {
            slot,
            dropped,
            next,
            removed,
        } in plan.slots
        {
            {
                let mut table = sync::write(&slot.table);
                if let Some(generation) = dropped {
                    table.drop_partition(generation);
                }
                if let Some((generation, partition)) = next {
                    table.insert_partition(generation, partition);
                }
            }
            if !removed.is_empty() {
                let mut sink = FeatureSink::default();
                slot.feature.on_classes_changed(
                    &ClassChanges {
                        added: &[],
                        removed: &removed,
                        updated: &[],
                    },
                    &mut sink,
                );
            }
        }
    }

    /// Pending work for `generation`, one batch per feature that has any.
    pub fn pending_batches(&self, generation: &Arc<Generation>) -> Vec<PendingBatch> {
        self.all_slots()
            .into_iter()
            .filter_map(|slot| {
                let classes = sync::read(&slot.table)
                    .partitions
                    .get(&generation.id())
                    .map(|p| p.pending.clone())
                    .unwrap_or_default();
                (!classes.is_empty()).then(|| PendingBatch {
                    slot,
                    generation: Arc::clone(generation),
                    classes,
                })
            })
            .collect()
    }

    /// Makes derived rows visible. Callers hold the store lock and have checked
    /// that the generation is still current.
    pub fn apply_sync(&self, derived: DerivedRows) {
        let generation = derived.generation.id();
        let mut table = sync::write(&derived.slot.table);
        if !table.partitions.contains_key(&generation) {
            return;
        }
        for (class, rows) in derived.rows {
            table.set_class_rows(generation, &class, rows);
        }
    }

    /// Full derivation of `generation` for one feature, bypassing the
    /// incremental path.
    pub fn derive_full(&self, name: &str, generation: &Arc<Generation>) -> Option<DerivedRows> {
        let slot = self.slot(name)?;
        let classes = generation
            .classes()
            .iter()
            .filter(|c| slot.feature.interested_in(c))
            .map(|c| PendingClass {
                current: Arc::clone(c),
                previous: None,
            })
            .collect();
        Some(
            PendingBatch {
                slot,
                generation: Arc::clone(generation),
                classes,
            }
            .derive(),
        )
    }

    /// Replaces a whole partition with fully derived rows. Same locking
    /// contract as [`FeatureRegistry::apply_sync`].
    pub fn apply_rebuild(&self, derived: DerivedRows) {
        let generation = derived.generation.id();
        let partition = Partition {
            indexed: derived.rows.into_iter().collect(),
            pending: Vec::new(),
        };
        sync::write(&derived.slot.table).insert_partition(generation, partition);
    }

    pub fn rows(&self, name: &str, key: &str, scope: &[GenerationId]) -> Result<Vec<FeatureRow>> {
        let slot = self
            .slot(name)
            .ok_or_else(|| DbError::UnknownFeature(name.to_string()))?;
        let table = sync::read(&slot.table);
        Ok(table.rows(key, scope))
    }

    /// Every indexed row of `generation`, sorted. Used to compare index states.
    pub fn partition_rows(&self, name: &str, generation: GenerationId) -> Vec<FeatureRow> {
        let Some(slot) = self.slot(name) else {
            return Vec::new();
        };
        let table = sync::read(&slot.table);
        let mut rows: Vec<FeatureRow> = table
            .partitions
            .get(&generation)
            .map(|p| p.indexed.values().flatten().cloned().collect())
            .unwrap_or_default();
        rows.sort();
        rows
    }

    /// Loads persisted rows for a restored generation; interested classes
    /// without rows become pending. Returns whether anything is pending.
    pub fn restore_partition(
        &self,
        name: &str,
        generation: &Arc<Generation>,
        mut indexed: BTreeMap<String, Vec<FeatureRow>>,
    ) -> bool {
        let Some(slot) = self.slot(name) else {
            return false;
        };
        indexed.retain(|class, _| generation.class(class).is_some());
        let pending: Vec<_> = generation
            .classes()
            .iter()
            .filter(|c| !indexed.contains_key(c.name()) && slot.feature.interested_in(c))
            .map(|c| PendingClass {
                current: Arc::clone(c),
                previous: None,
            })
            .collect();
        let has_pending = !pending.is_empty();
        sync::write(&slot.table).insert_partition(generation.id(), Partition { indexed, pending });
        has_pending
    }

    pub fn stats(&self) -> Vec<FeatureStats> {
        self.all_slots()
            .iter()
            .map(|slot| {
                let table = sync::read(&slot.table);
                FeatureStats {
                    name: slot.feature.name().to_string(),
                    rows: table
                        .partitions
                        .values()
                        .flat_map(|p| p.indexed.values())
                        .map(Vec::len)
                        .sum(),
                    pending_classes: table.partitions.values().map(|p| p.pending.len()).sum(),
                    partitions: table.partitions.len(),
                }
            })
            .collect()
    }

    pub fn clear(&self) {
        for slot in self.all_slots() {
            *sync::write(&slot.table) = FeatureTable::default();
        }
    }
}

fn plan_slot(
    slot: Arc<FeatureSlot>,
    previous: Option<&Arc<Generation>>,
    next: Option<&Arc<Generation>>,
) -> SlotPlan {
    let feature = &slot.feature;
    let old_partition = previous.and_then(|prev| {
        sync::read(&slot.table)
            .partitions
            .get(&prev.id())
            .map(|p| p.indexed.clone())
    });

    let next_partition = next.map(|next_gen| {
        let mut partition = Partition::default();
        for class in next_gen.classes() {
            if !feature.interested_in(class) {
                continue;
            }
            let old = previous.and_then(|prev| prev.class(class.name()));
            let carried = old
                .filter(|old| old.content_hash == class.content_hash)
                .and_then(|_| old_partition.as_ref())
                .and_then(|indexed| indexed.get(class.name()));
            match carried {
                Some(rows) => {
                    partition
                        .indexed
                        .insert(class.name().to_string(), rows.clone());
                }
                None => partition.pending.push(PendingClass {
                    current: Arc::clone(class),
                    previous: old.filter(|o| feature.interested_in(o)).cloned(),
                }),
            }
        }
        (next_gen.id(), partition)
    });

    let removed = previous
        .map(|prev| {
            prev.classes()
                .iter()
                .filter(|c| feature.interested_in(c))
                .filter(|c| next.is_none_or(|n| n.class(c.name()).is_none()))
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    SlotPlan {
        dropped: previous.map(|p| p.id()),
        next: next_partition,
        removed,
        slot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccessFlags, DecodedClass, Fingerprint, LibraryLocation, ParsedClass};
    use crate::store::SymbolStore;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Emits one row per class keyed by its superclass.
    #[derive(Default)]
    struct SuperIndex {
        calls: Mutex<Vec<(usize, usize, usize)>>,
    }

    impl Feature for SuperIndex {
        fn name(&self) -> &str {
            "supers"
        }

        fn on_classes_changed(&self, changes: &ClassChanges<'_>, sink: &mut FeatureSink) {
            self.calls.lock().unwrap().push((
                changes.added.len(),
                changes.removed.len(),
                changes.updated.len(),
            ));
            for class in changes.current() {
                if let Some(parent) = class.super_class() {
                    sink.emit(class, parent, class.name());
                }
            }
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn decoded(name: &str, parent: &str, hash: &str) -> DecodedClass {
        DecodedClass {
            entry: format!("{name}.class"),
            content_hash: hash.to_string(),
            class: ParsedClass {
                name: name.to_string(),
                super_class: Some(parent.to_string()),
                interfaces: Vec::new(),
                access: AccessFlags::default(),
                fields: Vec::new(),
                methods: Vec::new(),
                annotations: Vec::new(),
            },
        }
    }

    fn commit(
        store: &SymbolStore,
        features: &FeatureRegistry,
        location: &LibraryLocation,
        classes: Vec<DecodedClass>,
    ) -> Arc<Generation> {
        let generation = store.prepare(location, Fingerprint("fp".into()), classes, Vec::new());
        store
            .publish(location, Some(Arc::clone(&generation)), |ctx| {
                let plan = features.plan_publish(ctx);
                features.apply_publish(plan);
                Ok(())
            })
            .unwrap();
        generation
    }

    fn sync_all(store: &SymbolStore, features: &FeatureRegistry, generation: &Arc<Generation>) {
        for batch in features.pending_batches(generation) {
            let derived = batch.derive();
            store.while_current(generation, || features.apply_sync(derived));
        }
    }

    fn setup() -> (SymbolStore, FeatureRegistry, Arc<SuperIndex>, LibraryLocation) {
        let features = FeatureRegistry::new();
        let feature = Arc::new(SuperIndex::default());
        features.install(feature.clone()).unwrap();
        let location = LibraryLocation::from_canonical(PathBuf::from("/libs/a.jar"));
        (SymbolStore::new(), features, feature, location)
    }

    #[test]
    fn duplicate_install_conflicts() {
        let (_, features, _, _) = setup();
        let err = features
            .install(Arc::new(SuperIndex::default()))
            .unwrap_err();
        assert!(matches!(err, DbError::FeatureInstallConflict { name } if name == "supers"));
    }

    #[test]
    fn rows_appear_after_sync_and_vanish_on_replace() {
        let (store, features, _, a) = setup();
        let g1 = commit(&store, &features, &a, vec![decoded("a.A", "p.Base", "h1")]);
        assert!(features.rows("supers", "p.Base", &[g1.id()]).unwrap().is_empty());

        sync_all(&store, &features, &g1);
        let rows = features.rows("supers", "p.Base", &[g1.id()]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].class, "a.A");

        let g2 = commit(&store, &features, &a, vec![decoded("a.A", "p.Other", "h2")]);
        assert!(features.rows("supers", "p.Base", &[g1.id()]).unwrap().is_empty());
        sync_all(&store, &features, &g2);
        assert!(features.rows("supers", "p.Base", &[g2.id()]).unwrap().is_empty());
        assert_eq!(features.rows("supers", "p.Other", &[g2.id()]).unwrap().len(), 1);
    }

    #[test]
    fn identical_classes_are_carried_over_without_rederivation() {
        let (store, features, feature, a) = setup();
        let g1 = commit(
            &store,
            &features,
            &a,
            vec![decoded("a.A", "p.Base", "same"), decoded("a.B", "p.Base", "b1")],
        );
        sync_all(&store, &features, &g1);

        let g2 = commit(
            &store,
            &features,
            &a,
            vec![decoded("a.A", "p.Base", "same"), decoded("a.B", "p.Base", "b2")],
        );
        assert_eq!(features.rows("supers", "p.Base", &[g2.id()]).unwrap().len(), 1);
        let batches = features.pending_batches(&g2);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);

        sync_all(&store, &features, &g2);
        let calls = feature.calls.lock().unwrap().clone();
        assert_eq!(calls.last(), Some(&(0, 0, 1)));
        assert_eq!(features.rows("supers", "p.Base", &[g2.id()]).unwrap().len(), 2);
    }

    #[test]
    fn tombstone_notifies_removed_classes() {
        let (store, features, feature, a) = setup();
        let g1 = commit(&store, &features, &a, vec![decoded("a.A", "p.Base", "h")]);
        sync_all(&store, &features, &g1);
        store
            .publish(&a, None, |ctx| {
                features.apply_publish(features.plan_publish(ctx));
                Ok(())
            })
            .unwrap();
        assert_eq!(feature.calls.lock().unwrap().last(), Some(&(0, 1, 0)));
        assert!(features.rows("supers", "p.Base", &[g1.id()]).unwrap().is_empty());
        assert_eq!(features.stats()[0].partitions, 0);
    }

    #[test]
    fn sync_against_superseded_generation_is_discarded() {
        let (store, features, _, a) = setup();
        let g1 = commit(&store, &features, &a, vec![decoded("a.A", "p.Base", "h1")]);
        let batches = features.pending_batches(&g1);
        commit(&store, &features, &a, vec![decoded("a.A", "p.Base", "h2")]);
        for batch in batches {
            let derived = batch.derive();
            assert!(store.while_current(&g1, || features.apply_sync(derived)).is_none());
        }
        assert!(features.rows("supers", "p.Base", &[g1.id()]).unwrap().is_empty());
    }

    #[test]
    fn full_derivation_matches_incremental_rows() {
        let (store, features, _, a) = setup();
        let g1 = commit(
            &store,
            &features,
            &a,
            vec![decoded("a.A", "p.Base", "x"), decoded("a.B", "p.Mid", "y")],
        );
        sync_all(&store, &features, &g1);
        let incremental = features.partition_rows("supers", g1.id());

        let derived = features.derive_full("supers", &g1).unwrap();
        store.while_current(&g1, || features.apply_rebuild(derived));
        assert_eq!(features.partition_rows("supers", g1.id()), incremental);
    }
}
