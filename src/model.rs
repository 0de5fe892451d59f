//! Core data model: library identities, versions and class records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Canonical identity of one classpath entry (jar file or class directory).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LibraryLocation(PathBuf);

impl LibraryLocation {
    /// Canonicalizes `path` when it exists; a missing path is kept verbatim so
    /// that it can still be reported as unreachable.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        Self(canonical)
    }

    pub(crate) fn from_canonical(path: PathBuf) -> Self {
        Self(path)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    pub fn key(&self) -> String {
        self.0.to_string_lossy().to_string()
    }
}

impl fmt::Display for LibraryLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Hex SHA-256 over a library's content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GenerationId(pub u64);

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Global commit counter. Bumped exactly once per library commit.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DatabaseVersion(pub u64);

impl DatabaseVersion {
    pub(crate) fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for DatabaseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryVersion {
    pub location: LibraryLocation,
    pub fingerprint: Fingerprint,
    pub generation: GenerationId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessFlags(pub u16);

impl AccessFlags {
    pub const PUBLIC: u16 = 0x0001;
    pub const PRIVATE: u16 = 0x0002;
    pub const PROTECTED: u16 = 0x0004;
    pub const STATIC: u16 = 0x0008;
    pub const FINAL: u16 = 0x0010;
    pub const INTERFACE: u16 = 0x0200;
    pub const ABSTRACT: u16 = 0x0400;
    pub const ANNOTATION: u16 = 0x2000;
    pub const ENUM: u16 = 0x4000;

    pub fn contains(self, flag: u16) -> bool {
        self.0 & flag == flag
    }

    pub fn is_public(self) -> bool {
        self.contains(Self::PUBLIC)
    }

    pub fn is_static(self) -> bool {
        self.contains(Self::STATIC)
    }

    pub fn is_interface(self) -> bool {
        self.contains(Self::INTERFACE)
    }

    pub fn is_abstract(self) -> bool {
        self.contains(Self::ABSTRACT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemberKind {
    Method,
    InterfaceMethod,
    Field,
}

/// A member symbol statically referenced from a method body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberRef {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
    pub kind: MemberKind,
}

impl MemberRef {
    pub fn new(
        owner: impl Into<String>,
        name: impl Into<String>,
        descriptor: impl Into<String>,
        kind: MemberKind,
    ) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            descriptor: descriptor.into(),
            kind,
        }
    }

    /// Index key: `owner#name+descriptor`.
    pub fn key(&self) -> String {
        member_key(&self.owner, &self.name, &self.descriptor)
    }
}

pub(crate) fn member_key(owner: &str, name: &str, descriptor: &str) -> String {
    format!("{owner}#{name}{descriptor}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRecord {
    pub name: String,
    pub descriptor: String,
    pub access: AccessFlags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodRecord {
    pub name: String,
    pub descriptor: String,
    pub access: AccessFlags,
    #[serde(default)]
    pub references: Vec<MemberRef>,
}

/// Output of the parser adapter for one class-file entry. Names are dotted FQNs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedClass {
    pub name: String,
    pub super_class: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<String>,
    pub access: AccessFlags,
    #[serde(default)]
    pub fields: Vec<FieldRecord>,
    #[serde(default)]
    pub methods: Vec<MethodRecord>,
    #[serde(default)]
    pub annotations: Vec<String>,
}

/// A parsed class together with the entry it came from, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedClass {
    pub entry: String,
    pub content_hash: String,
    pub class: ParsedClass,
}

/// One class as committed into a library generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassRecord {
    pub library: Arc<LibraryVersion>,
    pub entry: String,
    pub content_hash: String,
    pub class: ParsedClass,
}

impl ClassRecord {
    pub fn name(&self) -> &str {
        &self.class.name
    }

    pub fn super_class(&self) -> Option<&str> {
        self.class.super_class.as_deref()
    }

    pub fn interfaces(&self) -> &[String] {
        &self.class.interfaces
    }

    pub fn access(&self) -> AccessFlags {
        self.class.access
    }

    pub fn methods(&self) -> &[MethodRecord] {
        &self.class.methods
    }

    pub fn fields(&self) -> &[FieldRecord] {
        &self.class.fields
    }

    pub fn annotations(&self) -> &[String] {
        &self.class.annotations
    }

    pub fn generation(&self) -> GenerationId {
        self.library.generation
    }

    pub fn location(&self) -> &LibraryLocation {
        &self.library.location
    }

    /// Direct supertypes: declared superclass first, then interfaces.
    pub fn supertypes(&self) -> impl Iterator<Item = &str> {
        self.super_class()
            .into_iter()
            .chain(self.interfaces().iter().map(String::as_str))
    }

    pub(crate) fn decoded(&self) -> DecodedClass {
        DecodedClass {
            entry: self.entry.clone(),
            content_hash: self.content_hash.clone(),
            class: self.class.clone(),
        }
    }
}

/// An entry that could not be decoded; excluded from its generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadableEntry {
    pub entry: String,
    pub reason: String,
}
