use crate::{Artifact, ArtifactQuery, ArtifactStore, StoreResult};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

/// In-memory backend for tests and fixtures.
#[derive(Clone, Default)]
pub struct MemStore {
    rows: Arc<RwLock<HashMap<ArtifactQuery, Vec<Artifact>>>>,
}

impl std::fmt::Debug for MemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemStore")
            .field("runs", &self.rows.read().unwrap().len())
            .finish()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one file to the given run, creating the run if absent.
    pub fn insert(
        &self,
        query: ArtifactQuery,
        filename: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) {
        let mut guard = self.rows.write().unwrap();
        guard.entry(query).or_default().push(Artifact {
            filename: filename.into(),
            content: content.into(),
        });
    }
}

#[async_trait]
impl ArtifactStore for MemStore {
    async fn fetch(&self, query: &ArtifactQuery) -> StoreResult<Vec<Artifact>> {
        let guard = self.rows.read().unwrap();
        Ok(guard.get(query).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(name: &str) -> ArtifactQuery {
        ArtifactQuery {
            db: "profiles".into(),
            runner: "linux-x64".into(),
            dataset: "checkout".into(),
            name: name.into(),
        }
    }

    #[tokio::test]
    async fn returns_rows_in_insertion_order() {
        let store = MemStore::new();
        store.insert(query("warm"), "warm.json.gz", b"gz".to_vec());
        store.insert(query("warm"), "warm.json.syms.json", b"{}".to_vec());

        let rows = store.fetch(&query("warm")).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].filename, "warm.json.gz");
        assert_eq!(rows[1].filename, "warm.json.syms.json");
    }

    #[tokio::test]
    async fn unknown_run_is_empty_not_error() {
        let store = MemStore::new();
        let rows = store.fetch(&query("missing")).await.unwrap();
        assert!(rows.is_empty());
    }
}
