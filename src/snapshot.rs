//! Point-in-time classpath views.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{DbError, Result};
use crate::feature::FeatureRow;
use crate::model::{ClassRecord, DatabaseVersion, GenerationId, LibraryLocation, LibraryVersion};
use crate::session::Shared;
use crate::store::Generation;
use crate::sync;

/// Which libraries a snapshot covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Every committed library, in registration order.
    All,
    /// The given libraries, in lookup precedence order.
    Explicit(Vec<LibraryLocation>),
}

impl Selection {
    pub fn explicit<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<std::path::Path>,
    {
        Selection::Explicit(paths.into_iter().map(LibraryLocation::new).collect())
    }
}

type Pins = Arc<[Arc<Generation>]>;

/// Immutable view over a set of pinned library generations.
///
/// The visible class set is fixed when the snapshot is created; later
/// commits never change what it returns.
pub struct ClasspathSnapshot {
    shared: Arc<Shared>,
    selection: Selection,
    requested: Vec<LibraryLocation>,
    database_version: DatabaseVersion,
    missing: Vec<LibraryLocation>,
    pins: RwLock<Option<Pins>>,
    cache: Mutex<Option<Arc<HashMap<String, usize>>>>,
}

impl ClasspathSnapshot {
    pub(crate) fn create(shared: &Arc<Shared>, selection: Selection) -> Result<Self> {
        shared.ensure_open()?;
        let registry = sync::read(&shared.registry);
        let requested = match &selection {
            Selection::All => registry.locations(),
            Selection::Explicit(locations) => {
                let mut seen = HashSet::new();
                locations
                    .iter()
                    .filter(|loc| seen.insert((*loc).clone()))
                    .cloned()
                    .collect()
            }
        };
        let (database_version, resolved) = shared.store.pin(&requested);
        drop(registry);

        let mut pins = Vec::with_capacity(resolved.len());
        let mut missing = Vec::new();
        for (location, generation) in requested.iter().zip(resolved) {
            match generation {
                Some(generation) => pins.push(generation),
                None => missing.push(location.clone()),
            }
        }
        if matches!(selection, Selection::All) {
            missing.clear();
        }
        tracing::debug!(
            version = %database_version,
            libraries = pins.len(),
            missing = missing.len(),
            "created classpath snapshot"
        );

        Ok(Self {
            shared: Arc::clone(shared),
            selection,
            requested,
            database_version,
            missing,
            pins: RwLock::new(Some(pins.into())),
            cache: Mutex::new(None),
        })
    }

    pub fn database_version(&self) -> DatabaseVersion {
        self.database_version
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// Requested libraries that had no committed generation at creation.
    pub fn missing(&self) -> &[LibraryLocation] {
        &self.missing
    }

    pub fn is_closed(&self) -> bool {
        sync::read(&self.pins).is_none()
    }

    fn pins(&self) -> Result<Pins> {
        self.shared.ensure_open()?;
        sync::read(&self.pins)
            .as_ref()
            .cloned()
            .ok_or(DbError::SnapshotClosed)
    }

    fn lookup_index(&self, pins: &Pins) -> Arc<HashMap<String, usize>> {
        let mut cache = sync::lock(&self.cache);
        if let Some(index) = cache.as_ref() {
            return Arc::clone(index);
        }
        let mut index = HashMap::new();
        for (idx, generation) in pins.iter().enumerate() {
            for class in generation.classes() {
                index.entry(class.name().to_string()).or_insert(idx);
            }
        }
        let index = Arc::new(index);
        *cache = Some(Arc::clone(&index));
        index
    }

    /// First match in precedence order, or `None`.
    pub fn find_class_or_null(&self, fqn: &str) -> Result<Option<Arc<ClassRecord>>> {
        let pins = self.pins()?;
        let index = self.lookup_index(&pins);
        Ok(index
            .get(fqn)
            .and_then(|&idx| pins[idx].class(fqn))
            .cloned())
    }

    pub fn find_class(&self, fqn: &str) -> Result<Arc<ClassRecord>> {
        self.find_class_or_null(fqn)?
            .ok_or_else(|| DbError::ClassNotFound(fqn.to_string()))
    }

    /// Visible classes: for duplicated names only the first in precedence order.
    pub fn classes(&self) -> Result<Vec<Arc<ClassRecord>>> {
        let pins = self.pins()?;
        let mut seen = HashSet::new();
        Ok(pins
            .iter()
            .flat_map(|g| g.classes().iter())
            .filter(|c| seen.insert(c.name()))
            .cloned()
            .collect())
    }

    pub fn libraries(&self) -> Result<Vec<Arc<LibraryVersion>>> {
        Ok(self
            .pins()?
            .iter()
            .map(|g| Arc::clone(g.version()))
            .collect())
    }

    pub fn generations(&self) -> Result<Vec<GenerationId>> {
        Ok(self.pins()?.iter().map(|g| g.id()).collect())
    }

    /// Classes declaring `fqn` as superclass or interface; with
    /// `all_hierarchy`, transitively.
    pub fn find_sub_classes(&self, fqn: &str, all_hierarchy: bool) -> Result<Vec<Arc<ClassRecord>>> {
        let visible = self.classes()?;
        let mut children: HashMap<&str, Vec<&Arc<ClassRecord>>> = HashMap::new();
        for class in &visible {
            for parent in class.supertypes() {
                children.entry(parent).or_default().push(class);
            }
        }

        let mut found = Vec::new();
        let mut seen: HashSet<&str> = HashSet::from([fqn]);
        let mut queue = VecDeque::from([fqn]);
        while let Some(parent) = queue.pop_front() {
            for child in children.get(parent).into_iter().flatten() {
                if !seen.insert(child.name()) {
                    continue;
                }
                found.push(Arc::clone(child));
                if all_hierarchy {
                    queue.push_back(child.name());
                }
            }
        }
        Ok(found)
    }

    /// Rows of feature `name` for `key`, restricted to this snapshot's generations.
    pub fn feature_rows(&self, name: &str, key: &str) -> Result<Vec<FeatureRow>> {
        let scope = self.generations()?;
        self.shared.features.rows(name, key, &scope)
    }

    /// A new snapshot at the current database version. With `keep_subset` the
    /// same libraries are re-resolved; otherwise the original selection rule
    /// is applied again.
    pub fn refreshed(&self, keep_subset: bool) -> Result<ClasspathSnapshot> {
        let pins = self.pins()?;
        let selection = match (&self.selection, keep_subset) {
            (Selection::All, true) => {
                Selection::Explicit(pins.iter().map(|g| g.location().clone()).collect())
            }
            (Selection::Explicit(_), true) => Selection::Explicit(self.requested.clone()),
            (selection, false) => selection.clone(),
        };
        ClasspathSnapshot::create(&self.shared, selection)
    }

    /// Releases pins and the lookup cache. Idempotent.
    pub fn close(&self) {
        sync::write(&self.pins).take();
        sync::lock(&self.cache).take();
    }
}

impl std::fmt::Debug for ClasspathSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClasspathSnapshot")
            .field("database_version", &self.database_version)
            .field("selection", &self.selection)
            .field("missing", &self.missing)
            .field("closed", &self.is_closed())
            .finish()
    }
}
