use crate::{Artifact, ArtifactQuery, ArtifactStore, StoreError, StoreResult, valid_db_name};
use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags, params};
use std::path::{Path, PathBuf};

const SELECT_SQL: &str =
    "SELECT filename, content FROM profiles WHERE runner = ?1 AND dataset = ?2 AND name = ?3";

/// Local backend reading `<db>.db` SQLite files from one directory, in the
/// schema the benchmark uploader writes.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    base_dir: PathBuf,
}

impl SqliteStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn db_path(&self, db: &str) -> PathBuf {
        self.base_dir.join(format!("{db}.db"))
    }

    fn query_blocking(path: &Path, query: &ArtifactQuery) -> StoreResult<Vec<Artifact>> {
        let sqlite_err = |source| StoreError::Sqlite {
            path: path.to_path_buf(),
            source,
        };
        // Read-only open so a mistyped database name fails instead of
        // leaving an empty file behind.
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(sqlite_err)?;
        let mut stmt = conn.prepare(SELECT_SQL).map_err(sqlite_err)?;
        let rows = stmt
            .query_map(params![query.runner, query.dataset, query.name], |row| {
                Ok(Artifact {
                    filename: row.get(0)?,
                    content: row.get(1)?,
                })
            })
            .map_err(sqlite_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sqlite_err)?;
        Ok(rows)
    }
}

#[async_trait]
impl ArtifactStore for SqliteStore {
    async fn fetch(&self, query: &ArtifactQuery) -> StoreResult<Vec<Artifact>> {
        if !valid_db_name(&query.db) {
            return Err(StoreError::InvalidDbName {
                db: query.db.clone(),
            });
        }
        let path = self.db_path(&query.db);
        let query = query.clone();
        tokio::task::spawn_blocking(move || Self::query_blocking(&path, &query)).await?
    }
}
