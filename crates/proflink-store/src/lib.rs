//! Profile artifact lookup abstractions plus remote (Turso/libsql over HTTP)
//! and local (SQLite directory) backends.
//!
//! A profile run is addressed by the tuple `(runner, dataset, name)` inside a
//! named database. Each run stores one or more files: the profile itself plus
//! optional symbolication side files. Backends only answer point lookups; the
//! caller decides what to do with the returned files.

mod hrana;
mod mem;
mod sqlite;

pub use hrana::{HranaConfig, HranaStore};
pub use mem::MemStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use std::{path::PathBuf, sync::Arc};

pub type StoreResult<T> = Result<T, StoreError>;
pub type DynArtifactStore = Arc<dyn ArtifactStore>;

/// One stored file belonging to a profile run.
#[derive(Clone, PartialEq, Eq)]
pub struct Artifact {
    pub filename: String,
    pub content: Vec<u8>,
}

impl std::fmt::Debug for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Artifact")
            .field("filename", &self.filename)
            .field("content_len", &self.content.len())
            .finish()
    }
}

/// Lookup key for a profile run: which database to ask plus the row tuple.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ArtifactQuery {
    pub db: String,
    pub runner: String,
    pub dataset: String,
    pub name: String,
}

/// Trait implemented by all profile artifact backends.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Fetch every stored file for the given run tuple. The result may be
    /// empty; ordering follows the backend's row order.
    async fn fetch(&self, query: &ArtifactQuery) -> StoreResult<Vec<Artifact>>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("database '{db}' rejected the query: {message}")]
    Rejected { db: String, message: String },
    #[error("malformed response from '{db}': {message}")]
    Malformed { db: String, message: String },
    #[error("SQLite error at {path:?}: {source}")]
    Sqlite {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("invalid database URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },
    #[error("invalid database name '{db}'")]
    InvalidDbName { db: String },
    #[error("artifact query task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Both concrete backends interpolate the database name into an URL host or a
/// file path, so it is restricted to a conservative identifier alphabet.
pub(crate) fn valid_db_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_names_are_restricted_to_identifier_chars() {
        assert!(valid_db_name("profiles"));
        assert!(valid_db_name("bench_2024-q3"));
        assert!(!valid_db_name(""));
        assert!(!valid_db_name(".."));
        assert!(!valid_db_name("a/b"));
        assert!(!valid_db_name("host.evil.io"));
        assert!(!valid_db_name("name with space"));
    }
}
