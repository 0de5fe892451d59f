//! Optional LMDB mirror of the store (via heed).
//!
//! Tables:
//! - `libraries`: canonical path → library row (ordinal, fingerprint, generation)
//! - `class_records`: `<generation>/<fqn>` → decoded class
//! - `feature_<name>`: `<generation>/<class>` → rows derived for that class
//! - `meta`: `next_generation`, `database_version`
//!
//! All values are JSON strings.

use anyhow::{Context, Result};
use heed::types::Str;
use heed::{Database, Env, EnvFlags, EnvOpenOptions, RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::feature::{FeatureRow, PartitionWrite};
use crate::model::{
    DatabaseVersion, DecodedClass, Fingerprint, GenerationId, LibraryLocation, UnreadableEntry,
};
use crate::store::Generation;
use crate::sync;

pub const LIBRARIES_DB: &str = "libraries";
pub const CLASS_RECORDS_DB: &str = "class_records";
pub const META_DB: &str = "meta";
const FEATURE_DB_PREFIX: &str = "feature_";

const META_NEXT_GENERATION: &str = "next_generation";
const META_DATABASE_VERSION: &str = "database_version";

const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;
const DEFAULT_MAX_DBS: u32 = 32;

type StrDb = Database<Str, Str>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LibraryRow {
    id: u64,
    canonical_path: PathBuf,
    last_version: u64,
    fingerprint: String,
    #[serde(default)]
    unreadable: Vec<UnreadableEntry>,
}

/// Everything needed to persist one store publish.
pub struct CommitWrite<'a> {
    pub location: &'a LibraryLocation,
    pub ordinal: u64,
    pub previous: Option<GenerationId>,
    pub next: Option<&'a Generation>,
    pub database_version: DatabaseVersion,
    pub next_generation: u64,
    pub partitions: Vec<PartitionWrite<'a>>,
}

#[derive(Debug)]
pub struct RestoredLibrary {
    pub ordinal: u64,
    pub location: LibraryLocation,
    pub fingerprint: Fingerprint,
    pub generation: GenerationId,
    pub classes: Vec<DecodedClass>,
    pub unreadable: Vec<UnreadableEntry>,
}

#[derive(Debug, Default)]
pub struct Restored {
    pub database_version: DatabaseVersion,
    pub next_generation: u64,
    pub libraries: Vec<RestoredLibrary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PersistenceStats {
    pub db_path: String,
    pub libraries: u64,
    pub class_records: u64,
    pub feature_rows: BTreeMap<String, u64>,
}

pub struct PersistentStore {
    env: Arc<Env>,
    db_path: PathBuf,
    libraries: StrDb,
    class_records: StrDb,
    meta: StrDb,
    features: RwLock<HashMap<String, StrDb>>,
}

impl std::fmt::Debug for PersistentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentStore")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

impl PersistentStore {
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }

        let env = Arc::new(open_env(&db_path)?);
        let mut wtxn = env.write_txn()?;
        let libraries = env.create_database::<Str, Str>(&mut wtxn, Some(LIBRARIES_DB))?;
        let class_records = env.create_database::<Str, Str>(&mut wtxn, Some(CLASS_RECORDS_DB))?;
        let meta = env.create_database::<Str, Str>(&mut wtxn, Some(META_DB))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            db_path,
            libraries,
            class_records,
            meta,
            features: RwLock::new(HashMap::new()),
        })
    }

    /// Opens (creating if needed) the row table of feature `name`.
    pub fn ensure_feature(&self, name: &str) -> Result<()> {
        if sync::read(&self.features).contains_key(name) {
            return Ok(());
        }
        let table = format!("{FEATURE_DB_PREFIX}{name}");
        let mut wtxn = self.env.write_txn()?;
        let db = self
            .env
            .create_database::<Str, Str>(&mut wtxn, Some(table.as_str()))
            .with_context(|| format!("Failed to open feature table {table}"))?;
        wtxn.commit()?;
        sync::write(&self.features).insert(name.to_string(), db);
        Ok(())
    }

    fn feature_db(&self, name: &str) -> Result<StrDb> {
        sync::read(&self.features)
            .get(name)
            .copied()
            .with_context(|| format!("Feature table for `{name}` is not open"))
    }

    /// Writes one publish in a single transaction: the new generation's
    /// records, the library row, dropped/carried feature partitions and meta.
    pub fn write_commit(&self, commit: &CommitWrite<'_>) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        let location_key = commit.location.key();

        if let Some(previous) = commit.previous {
            delete_prefix(&self.class_records, &mut wtxn, &generation_prefix(previous))?;
        }
        match commit.next {
            Some(generation) => {
                for class in generation.classes() {
                    let key = record_key(generation.id(), class.name());
                    let value = serde_json::to_string(&class.decoded())?;
                    self.class_records.put(&mut wtxn, &key, &value)?;
                }
                let row = LibraryRow {
                    id: commit.ordinal,
                    canonical_path: commit.location.path().to_path_buf(),
                    last_version: generation.id().0,
                    fingerprint: generation.version().fingerprint.0.clone(),
                    unreadable: generation.unreadable().to_vec(),
                };
                self.libraries
                    .put(&mut wtxn, &location_key, &serde_json::to_string(&row)?)?;
            }
            None => {
                self.libraries.delete(&mut wtxn, &location_key)?;
            }
        }

        for partition in &commit.partitions {
            let db = self.feature_db(partition.feature)?;
            if let Some(dropped) = partition.dropped {
                delete_prefix(&db, &mut wtxn, &generation_prefix(dropped))?;
            }
            if let Some((generation, rows)) = partition.written {
                for (class, class_rows) in rows {
                    db.put(
                        &mut wtxn,
                        &record_key(generation, class),
                        &serde_json::to_string(class_rows)?,
                    )?;
                }
            }
        }

        write_meta(
            &self.meta,
            &mut wtxn,
            commit.database_version,
            commit.next_generation,
        )?;
        wtxn.commit()
            .with_context(|| format!("Failed to commit {}", commit.location))?;
        Ok(())
    }

    /// Stores freshly derived rows of one feature for some classes of a generation.
    pub fn write_feature_rows(
        &self,
        feature: &str,
        generation: GenerationId,
        rows: &[(String, Vec<FeatureRow>)],
    ) -> Result<()> {
        let db = self.feature_db(feature)?;
        let mut wtxn = self.env.write_txn()?;
        for (class, class_rows) in rows {
            db.put(
                &mut wtxn,
                &record_key(generation, class),
                &serde_json::to_string(class_rows)?,
            )?;
        }
        wtxn.commit()?;
        Ok(())
    }

    /// Replaces every row of one feature partition.
    pub fn replace_feature_partition(
        &self,
        feature: &str,
        generation: GenerationId,
        rows: &[(String, Vec<FeatureRow>)],
    ) -> Result<()> {
        let db = self.feature_db(feature)?;
        let mut wtxn = self.env.write_txn()?;
        delete_prefix(&db, &mut wtxn, &generation_prefix(generation))?;
        for (class, class_rows) in rows {
            db.put(
                &mut wtxn,
                &record_key(generation, class),
                &serde_json::to_string(class_rows)?,
            )?;
        }
        wtxn.commit()?;
        Ok(())
    }

    /// Drops feature partitions of generations not listed in `live`.
    pub fn retain_feature_partitions(&self, feature: &str, live: &[GenerationId]) -> Result<()> {
        let db = self.feature_db(feature)?;
        let keep: Vec<String> = live.iter().map(|g| generation_prefix(*g)).collect();
        let mut wtxn = self.env.write_txn()?;
        let mut stale = Vec::new();
        for item in db.iter(&wtxn)? {
            let (key, _) = item?;
            if !keep.iter().any(|prefix| key.starts_with(prefix.as_str())) {
                stale.push(key.to_string());
            }
        }
        for key in stale {
            db.delete(&mut wtxn, &key)?;
        }
        wtxn.commit()?;
        Ok(())
    }

    /// Reads every persisted library with its current generation.
    pub fn restore(&self) -> Result<Restored> {
        let rtxn = self.env.read_txn()?;
        let database_version = read_meta_u64(&self.meta, &rtxn, META_DATABASE_VERSION)?;
        let next_generation = read_meta_u64(&self.meta, &rtxn, META_NEXT_GENERATION)?;

        let mut libraries = Vec::new();
        for item in self.libraries.iter(&rtxn)? {
            let (key, value) = item?;
            let row: LibraryRow = serde_json::from_str(value)
                .with_context(|| format!("Corrupt library row for {key}"))?;
            let generation = GenerationId(row.last_version);
            let mut classes = Vec::new();
            for item in self
                .class_records
                .prefix_iter(&rtxn, &generation_prefix(generation))?
            {
                let (key, value) = item?;
                let decoded: DecodedClass = serde_json::from_str(value)
                    .with_context(|| format!("Corrupt class record {key}"))?;
                classes.push(decoded);
            }
            classes.sort_by(|a, b| a.entry.cmp(&b.entry));
            libraries.push(RestoredLibrary {
                ordinal: row.id,
                location: LibraryLocation::from_canonical(row.canonical_path),
                fingerprint: Fingerprint(row.fingerprint),
                generation,
                classes,
                unreadable: row.unreadable,
            });
        }
        libraries.sort_by_key(|l| l.ordinal);

        Ok(Restored {
            database_version: DatabaseVersion(database_version),
            next_generation,
            libraries,
        })
    }

    /// Persisted rows of one feature partition, by class.
    pub fn feature_partition(
        &self,
        feature: &str,
        generation: GenerationId,
    ) -> Result<BTreeMap<String, Vec<FeatureRow>>> {
        let db = self.feature_db(feature)?;
        let rtxn = self.env.read_txn()?;
        let prefix = generation_prefix(generation);
        let mut out = BTreeMap::new();
        for item in db.prefix_iter(&rtxn, &prefix)? {
            let (key, value) = item?;
            let rows: Vec<FeatureRow> = serde_json::from_str(value)
                .with_context(|| format!("Corrupt feature row {key}"))?;
            let class = key.strip_prefix(prefix.as_str()).unwrap_or(key);
            out.insert(class.to_string(), rows);
        }
        Ok(out)
    }

    pub fn stats(&self) -> Result<PersistenceStats> {
        let rtxn = self.env.read_txn()?;
        let mut feature_rows = BTreeMap::new();
        for (name, db) in sync::read(&self.features).iter() {
            let mut rows = 0u64;
            for item in db.iter(&rtxn)? {
                let (_, value) = item?;
                rows += serde_json::from_str::<Vec<FeatureRow>>(value)
                    .map(|r| r.len() as u64)
                    .unwrap_or(0);
            }
            feature_rows.insert(name.clone(), rows);
        }
        Ok(PersistenceStats {
            db_path: self.db_path.to_string_lossy().to_string(),
            libraries: table_len(&self.libraries, &rtxn)?,
            class_records: table_len(&self.class_records, &rtxn)?,
            feature_rows,
        })
    }
}

fn open_env(db_path: &Path) -> Result<Env> {
    let mut options = EnvOpenOptions::new();
    options.map_size(DEFAULT_MAP_SIZE);
    options.max_dbs(DEFAULT_MAX_DBS);
    // SAFETY: We do not use NO_LOCK and keep default LMDB locking guarantees.
    // NO_SUB_DIR keeps the database a single file at `db_path`.
    unsafe {
        options.flags(EnvFlags::NO_SUB_DIR);
        options
            .open(db_path)
            .with_context(|| format!("Failed to create/open db env: {}", db_path.display()))
    }
}

fn generation_prefix(generation: GenerationId) -> String {
    format!("{:020}/", generation.0)
}

fn record_key(generation: GenerationId, name: &str) -> String {
    format!("{:020}/{name}", generation.0)
}

fn delete_prefix(db: &StrDb, wtxn: &mut RwTxn<'_>, prefix: &str) -> Result<usize> {
    let mut keys = Vec::new();
    for item in db.prefix_iter(wtxn, prefix)? {
        let (key, _) = item?;
        keys.push(key.to_string());
    }
    for key in &keys {
        db.delete(wtxn, key)?;
    }
    Ok(keys.len())
}

fn write_meta(
    db: &StrDb,
    wtxn: &mut RwTxn<'_>,
    database_version: DatabaseVersion,
    next_generation: u64,
) -> Result<()> {
    db.put(wtxn, META_DATABASE_VERSION, &database_version.0.to_string())?;
    db.put(wtxn, META_NEXT_GENERATION, &next_generation.to_string())?;
    Ok(())
}

fn read_meta_u64(db: &StrDb, rtxn: &RoTxn<'_>, key: &str) -> Result<u64> {
    match db.get(rtxn, key)? {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("Corrupt meta value for {key}: {raw}")),
        None => Ok(0),
    }
}

fn table_len(db: &StrDb, rtxn: &RoTxn<'_>) -> Result<u64> {
    let mut count = 0u64;
    for item in db.iter(rtxn)? {
        let _ = item?;
        count += 1;
    }
    Ok(count)
}
