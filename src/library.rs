//! Reading libraries from disk: jar archives and class directories.

use anyhow::{Context, Result as AnyResult};
use ignore::WalkBuilder;
use memmap2::Mmap;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;
use zip::ZipArchive;

use crate::error::{DbError, Result};
use crate::model::{Fingerprint, LibraryLocation};

const SKIPPED_ENTRIES: [&str; 2] = ["module-info.class", "package-info.class"];

#[derive(Debug, Clone)]
pub struct ClassEntry {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// A library read in one pass: its fingerprint plus every class entry.
#[derive(Debug)]
pub struct OpenLibrary {
    location: LibraryLocation,
    fingerprint: Fingerprint,
    entries: Vec<ClassEntry>,
}

impl OpenLibrary {
    pub fn location(&self) -> &LibraryLocation {
        &self.location
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn entries(&self) -> &[ClassEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<ClassEntry> {
        self.entries
    }
}

pub fn open_library(location: &LibraryLocation) -> Result<OpenLibrary> {
    let path = location.path();
    let read = if path.is_dir() {
        read_directory(path)
    } else {
        read_jar(path)
    };
    let (fingerprint, entries) = read.map_err(|err| unreachable_library(location, err))?;
    Ok(OpenLibrary {
        location: location.clone(),
        fingerprint,
        entries,
    })
}

/// Recomputes the content fingerprint without decoding the archive.
pub fn fingerprint(location: &LibraryLocation) -> Result<Fingerprint> {
    let path = location.path();
    let computed = if path.is_dir() {
        read_directory(path).map(|(fp, _)| fp)
    } else {
        fingerprint_file(path)
    };
    computed.map_err(|err| unreachable_library(location, err))
}

pub fn hash_content(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn unreachable_library(location: &LibraryLocation, err: anyhow::Error) -> DbError {
    DbError::LibraryUnreachable {
        location: location.clone(),
        reason: format!("{err:#}"),
    }
}

fn map_file(path: &Path) -> AnyResult<Mmap> {
    let file =
        File::open(path).with_context(|| format!("Failed to open library: {}", path.display()))?;
    // SAFETY: The file is opened read-only and the map is dropped before the file handle
    // goes out of scope in every caller.
    unsafe { Mmap::map(&file) }.with_context(|| format!("Failed to mmap: {}", path.display()))
}

fn fingerprint_file(path: &Path) -> AnyResult<Fingerprint> {
    let mmap = map_file(path)?;
    Ok(Fingerprint(hash_content(&mmap[..])))
}

fn read_jar(path: &Path) -> AnyResult<(Fingerprint, Vec<ClassEntry>)> {
    let mmap = map_file(path)?;
    let fingerprint = Fingerprint(hash_content(&mmap[..]));
    let mut archive = ZipArchive::new(Cursor::new(&mmap[..]))
        .with_context(|| format!("Failed to read zip structure: {}", path.display()))?;

    let mut entries = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() || !is_class_entry(entry.name()) {
            continue;
        }
        let name = entry.name().to_string();
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut bytes)
            .with_context(|| format!("Failed to inflate {name} in {}", path.display()))?;
        entries.push(ClassEntry { name, bytes });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok((fingerprint, entries))
}

fn read_directory(root: &Path) -> AnyResult<(Fingerprint, Vec<ClassEntry>)> {
    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .ignore(false)
        .parents(false)
        .build();

    let mut entries = Vec::new();
    for item in walker {
        let item = item.with_context(|| format!("Failed to walk: {}", root.display()))?;
        if !item.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let path = item.path();
        let rel = path.strip_prefix(root).unwrap_or(path);
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if !is_class_entry(&name) {
            continue;
        }
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read: {}", path.display()))?;
        entries.push(ClassEntry { name, bytes });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    let mut hasher = Sha256::new();
    for entry in &entries {
        hasher.update(entry.name.as_bytes());
        hasher.update([0u8]);
        hasher.update((entry.bytes.len() as u64).to_le_bytes());
        hasher.update(&entry.bytes);
    }
    Ok((Fingerprint(hex::encode(hasher.finalize())), entries))
}

fn is_class_entry(name: &str) -> bool {
    if !name.ends_with(".class") {
        return false;
    }
    let base = name.rsplit('/').next().unwrap_or(name);
    !SKIPPED_ENTRIES.contains(&base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};
    use zip::write::FileOptions;

    fn temp_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "classdb_library_test_{}_{}_{}",
            std::process::id(),
            nanos,
            name
        ))
    }

    fn write_jar(path: &Path, entries: &[(&str, &[u8])]) -> AnyResult<()> {
        let file = File::create(path)?;
        let mut zip = zip::ZipWriter::new(file);
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, content) in entries {
            zip.start_file(*name, options)?;
            zip.write_all(content)?;
        }
        zip.finish()?;
        Ok(())
    }

    #[test]
    fn jar_lists_class_entries_sorted_and_skips_metadata() -> AnyResult<()> {
        let jar = temp_path("entries.jar");
        write_jar(
            &jar,
            &[
                ("org/example/B.class", b"b"),
                ("org/example/A.class", b"a"),
                ("org/example/package-info.class", b"p"),
                ("module-info.class", b"m"),
                ("META-INF/MANIFEST.MF", b""),
            ],
        )?;

        let lib = open_library(&LibraryLocation::new(&jar))?;
        let names: Vec<_> = lib.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["org/example/A.class", "org/example/B.class"]);
        assert_eq!(lib.entries()[0].bytes, b"a");
        assert_eq!(*lib.fingerprint(), fingerprint(&LibraryLocation::new(&jar))?);

        std::fs::remove_file(jar)?;
        Ok(())
    }

    #[test]
    fn directory_fingerprint_tracks_class_content() -> AnyResult<()> {
        let dir = temp_path("classes");
        std::fs::create_dir_all(dir.join("org/example"))?;
        std::fs::write(dir.join("org/example/A.class"), b"one")?;
        std::fs::write(dir.join("notes.txt"), b"ignored")?;

        let loc = LibraryLocation::new(&dir);
        let before = fingerprint(&loc)?;
        std::fs::write(dir.join("notes.txt"), b"still ignored")?;
        assert_eq!(fingerprint(&loc)?, before);

        std::fs::write(dir.join("org/example/A.class"), b"two")?;
        assert_ne!(fingerprint(&loc)?, before);

        let lib = open_library(&loc)?;
        assert_eq!(lib.entries().len(), 1);
        assert_eq!(lib.entries()[0].name, "org/example/A.class");

        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn empty_directory_hashes_nothing() -> AnyResult<()> {
        let dir = temp_path("empty");
        std::fs::create_dir_all(&dir)?;
        let fp = fingerprint(&LibraryLocation::new(&dir))?;
        assert_eq!(fp.as_str(), hash_content(b""));
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn missing_path_is_unreachable() {
        let loc = LibraryLocation::new(temp_path("gone.jar"));
        let err = open_library(&loc).unwrap_err();
        assert!(matches!(err, DbError::LibraryUnreachable { .. }));
    }
}
