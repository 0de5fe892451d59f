use anyhow::{Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bytecode::{BytecodeParser, ClassParser};
use crate::cli::Cli;
use crate::feature::Feature;

/// What `Session::close` does with jobs that are still queued or running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClosePolicy {
    /// Let every outstanding job finish first.
    #[default]
    Await,
    /// Cancel queued jobs and stop running ones at their next checkpoint.
    Cancel,
}

/// Construction-time configuration of a session.
pub struct SessionSettings {
    pub features: Vec<Arc<dyn Feature>>,
    pub workers: usize,
    pub close_policy: ClosePolicy,
    pub persistence: Option<PathBuf>,
    pub parser: Arc<dyn ClassParser>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionSettings {
    pub fn new() -> Self {
        Self {
            features: Vec::new(),
            workers: default_workers(),
            close_policy: ClosePolicy::default(),
            persistence: None,
            parser: Arc::new(BytecodeParser),
        }
    }

    pub fn install_features<I>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Feature>>,
    {
        self.features.extend(features);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn close_policy(mut self, policy: ClosePolicy) -> Self {
        self.close_policy = policy;
        self
    }

    /// Mirrors the store into an LMDB file at `db_path`.
    pub fn persistent(mut self, db_path: impl Into<PathBuf>) -> Self {
        self.persistence = Some(db_path.into());
        self
    }

    pub fn parser(mut self, parser: Arc<dyn ClassParser>) -> Self {
        self.parser = parser;
        self
    }
}

impl fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let features: Vec<&str> = self.features.iter().map(|feature| feature.name()).collect();
        f.debug_struct("SessionSettings")
            .field("features", &features)
            .field("workers", &self.workers)
            .field("close_policy", &self.close_policy)
            .field("persistence", &self.persistence)
            .finish_non_exhaustive()
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(1, 8)
}

pub fn resolve_db_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(p) = cli.db.clone() {
        return Ok(p);
    }

    Ok(classdb_home()?.join("db.lmdb"))
}

pub fn clear_db(db_path: &Path) -> Result<()> {
    remove_file_if_exists(db_path, "db")?;
    remove_file_if_exists(&lmdb_lock_path(db_path), "db lock")?;
    Ok(())
}

fn classdb_home() -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .or_else(dirs::cache_dir)
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow::anyhow!("Failed to resolve data directory"))?;
    Ok(base.join("classdb"))
}

pub fn lmdb_lock_path(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_os_string();
    os.push("-lock");
    PathBuf::from(os)
}

fn remove_file_if_exists(path: &Path, kind: &str) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove {kind} file: {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usages::Usages;

    #[test]
    fn builder_collects_features_and_clamps_workers() {
        let settings = SessionSettings::new()
            .install_features([Arc::new(Usages::new()) as Arc<dyn Feature>])
            .workers(0)
            .close_policy(ClosePolicy::Cancel)
            .persistent("/tmp/classdb.lmdb");
        assert_eq!(settings.features.len(), 1);
        assert_eq!(settings.workers, 1);
        assert_eq!(settings.close_policy, ClosePolicy::Cancel);
        assert_eq!(settings.persistence, Some(PathBuf::from("/tmp/classdb.lmdb")));
        assert!(format!("{settings:?}").contains("usages"));
    }

    #[test]
    fn lock_path_appends_suffix() {
        assert_eq!(
            lmdb_lock_path(Path::new("/data/db.lmdb")),
            PathBuf::from("/data/db.lmdb-lock")
        );
    }

    #[test]
    fn clear_db_removes_db_and_lock() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("classdb_clear_{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        let db = dir.join("db.lmdb");
        std::fs::write(&db, b"x")?;
        std::fs::write(lmdb_lock_path(&db), b"x")?;
        clear_db(&db)?;
        assert!(!db.exists());
        assert!(!lmdb_lock_path(&db).exists());
        clear_db(&db)?;
        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }
}
