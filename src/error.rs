use serde::Serialize;
use thiserror::Error;

use crate::jobs::{JobId, JobKind};
use crate::model::LibraryLocation;

/// Failure to decode a single artifact entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unexpected end of class file")]
    UnexpectedEof,
    #[error("invalid class file magic header")]
    InvalidMagic,
    #[error("unsupported constant pool tag {tag}")]
    UnsupportedConstant { tag: u8 },
    #[error("invalid constant pool index {index}")]
    InvalidConstantIndex { index: u16 },
    #[error("unknown opcode 0x{opcode:02x} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },
    #[error("malformed class entry: {0}")]
    Malformed(String),
}

/// Failure carried on a background job's own completion handle.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobError {
    #[error("job was cancelled")]
    Cancelled,
    #[error("library {location} is unreachable: {reason}")]
    LibraryUnreachable {
        location: LibraryLocation,
        reason: String,
    },
    #[error("{message}")]
    Failed { message: String },
    #[error("job panicked: {message}")]
    Panicked { message: String },
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to decode class entry: {0}")]
    Parse(#[from] ParseError),

    #[error("library {location} is unreachable: {reason}")]
    LibraryUnreachable {
        location: LibraryLocation,
        reason: String,
    },

    #[error("session is closed")]
    SessionClosed,

    #[error("job was cancelled")]
    Cancelled,

    #[error("background job {id} ({kind}) failed: {source}")]
    JobFailed {
        id: JobId,
        kind: JobKind,
        #[source]
        source: JobError,
    },

    #[error("feature `{name}` is already installed")]
    FeatureInstallConflict { name: String },

    #[error("feature `{0}` is not installed")]
    UnknownFeature(String),

    #[error("classpath snapshot is closed")]
    SnapshotClosed,

    #[error("class {0} not found in classpath")]
    ClassNotFound(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("scheduler failure: {0}")]
    Scheduler(String),
}

impl DbError {
    pub(crate) fn storage(err: anyhow::Error) -> Self {
        Self::Storage(format!("{err:#}"))
    }
}

impl From<DbError> for JobError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::LibraryUnreachable { location, reason } => {
                JobError::LibraryUnreachable { location, reason }
            }
            DbError::JobFailed { source, .. } => source,
            DbError::Cancelled | DbError::SessionClosed => JobError::Cancelled,
            other => JobError::Failed {
                message: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
