//! chainreader-storage — persistent backends for the ChainReader collaborator traits.
//!
//! Backends:
//! - in-memory implementations ship with `chainreader-core` (dev/testing)
//! - [`sqlite`]: SQLite via `sqlx` (embedded, single-file persistence)

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteEntityRepository, SqliteStorage};
