use crate::error::PoolError;
use proflink_store::{ArtifactQuery, ArtifactStore};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Prefix of staging directories, visible while sessions are alive.
const STAGING_PREFIX: &str = "samply-tmp-";

/// Marker distinguishing symbolication side files from launchable profiles.
const SYMBOL_MARKER: &str = "syms.json";

/// A profile run staged on local disk, ready to hand to the viewer.
/// Dropping it removes the directory.
#[derive(Debug)]
pub struct Staged {
    pub dir: TempDir,
    pub target: PathBuf,
}

/// Fetch all files for a run and write them into a fresh staging directory.
///
/// The launch target is the last fetched file whose name does not carry the
/// symbol marker; the remaining files stay alongside it so the viewer can
/// resolve symbols from the same directory. An empty row set, or one made up
/// solely of symbol files, means there is nothing to launch.
pub async fn materialize(
    store: &dyn ArtifactStore,
    query: &ArtifactQuery,
    work_root: &Path,
) -> Result<Staged, PoolError> {
    let artifacts = store.fetch(query).await?;
    if artifacts.is_empty() {
        return Err(PoolError::ProfileNotFound {
            key: describe(query),
        });
    }

    let dir = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempdir_in(work_root)
        .map_err(|source| PoolError::Io {
            path: work_root.to_path_buf(),
            source,
        })?;

    let mut target = None;
    for artifact in &artifacts {
        if !plain_filename(&artifact.filename) {
            return Err(PoolError::Io {
                path: dir.path().join("<invalid>"),
                source: io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("artifact filename {:?} escapes the staging dir", artifact.filename),
                ),
            });
        }
        let path = dir.path().join(&artifact.filename);
        tokio::fs::write(&path, &artifact.content)
            .await
            .map_err(|source| PoolError::Io {
                path: path.clone(),
                source,
            })?;
        if !artifact.filename.contains(SYMBOL_MARKER) {
            target = Some(path);
        }
    }

    let target = target.ok_or_else(|| PoolError::ProfileNotFound {
        key: describe(query),
    })?;
    Ok(Staged { dir, target })
}

/// Stored filenames must stay inside the staging directory.
fn plain_filename(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

fn describe(query: &ArtifactQuery) -> String {
    format!(
        "{}/{}/{}/{}",
        query.db, query.runner, query.dataset, query.name
    )
}
