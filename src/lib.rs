//! # classdb
//!
//! An incrementally maintained database of bytecode-derived facts about a
//! JVM classpath: classes, members, hierarchy and pluggable derived indices.
//!
//! ## Architecture
//!
//! - **session**: Lifecycle facade; load/refresh/unload/rebuild as background jobs
//! - **registry**: Known library locations and their committed fingerprints
//! - **library**: Jar and class-directory reading, content fingerprints
//! - **bytecode**: Parser adapter and the default JVM class-file decoder
//! - **store**: Versioned symbol store, one immutable generation per library commit
//! - **feature**: Pluggable derived indices fed by class-record changes
//! - **usages**: Default feature indexing statically referenced members
//! - **snapshot**: Pinned, read-consistent classpath views
//! - **jobs**: Dispatcher thread plus bounded rayon pool with per-key FIFO ordering
//! - **persistence**: Optional LMDB mirror of the store using heed
//! - **config**: Session settings and database path resolution

pub mod bytecode;
pub mod cli;
pub mod config;
pub mod error;
pub mod feature;
pub mod jobs;
pub mod library;
pub mod model;
pub mod persistence;
pub mod registry;
pub mod session;
pub mod snapshot;
pub mod store;
mod sync;
pub mod usages;

pub use config::{ClosePolicy, SessionSettings};
pub use error::{DbError, JobError, ParseError, Result};
pub use feature::{ClassChanges, Feature, FeatureRow, FeatureSink};
pub use jobs::{AwaitReport, JobHandle, JobId, JobKind, JobState};
pub use model::{ClassRecord, DatabaseVersion, LibraryLocation, MemberRef};
pub use session::{LibraryStatus, LoadReport, Session};
pub use snapshot::{ClasspathSnapshot, Selection};
pub use usages::{Usage, Usages};
