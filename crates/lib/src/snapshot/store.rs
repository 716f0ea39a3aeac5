//! Content-addressed snapshot storage.
//!
//! # Storage Layout
//!
//! ```text
//! {root}/snapshots/<digest>/   # immutable trees, named by hash_directory()
//! {root}/scratch/<tmp>/        # private working copies, removed on drop
//! ```
//!
//! Trees are built in scratch space and renamed into place, so a directory
//! under `snapshots/` is always complete. Nothing under `snapshots/` is ever
//! modified after the rename; executors copy before they mutate.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

use crate::platform::paths::EnginePaths;
use crate::util::fs::dir_size;
use crate::util::hash::{ContentHash, hash_directory};

use super::types::{SnapshotError, SnapshotRef};

#[derive(Debug, Clone)]
pub struct SnapshotStore {
  snapshots: PathBuf,
  scratch: PathBuf,
}

impl SnapshotStore {
  pub fn new(paths: &EnginePaths) -> Self {
    Self {
      snapshots: paths.snapshots(),
      scratch: paths.scratch(),
    }
  }

  /// Directory holding committed snapshots.
  pub fn base_path(&self) -> &Path {
    &self.snapshots
  }

  /// Directory holding scratch space.
  pub fn scratch_path(&self) -> &Path {
    &self.scratch
  }

  /// Allocate a private scratch directory for one executor invocation.
  ///
  /// The directory is removed when the returned guard drops.
  pub fn scratch(&self, label: &str) -> Result<TempDir, SnapshotError> {
    fs::create_dir_all(&self.scratch).map_err(|source| SnapshotError::CreateDir {
      path: self.scratch.clone(),
      source,
    })?;
    tempfile::Builder::new()
      .prefix(&format!("{}-", label))
      .tempdir_in(&self.scratch)
      .map_err(|source| SnapshotError::CreateDir {
        path: self.scratch.clone(),
        source,
      })
  }

  /// Hash `dir` and move it into the store.
  ///
  /// `dir` must live on the same filesystem as the store (scratch space
  /// does). When an identical snapshot already exists it is returned and
  /// `dir` is left for its owner to clean up.
  pub fn commit(&self, dir: &Path) -> Result<SnapshotRef, SnapshotError> {
    let digest = hash_directory(dir)?;
    let target = self.snapshots.join(&digest.0);

    if target.is_dir() {
      debug!(digest = %digest, "snapshot already stored");
      return Ok(SnapshotRef { digest, path: target });
    }

    fs::create_dir_all(&self.snapshots).map_err(|source| SnapshotError::CreateDir {
      path: self.snapshots.clone(),
      source,
    })?;

    match fs::rename(dir, &target) {
      Ok(()) => {
        debug!(digest = %digest, path = %target.display(), "snapshot committed");
        Ok(SnapshotRef { digest, path: target })
      }
      // Lost a race against an identical commit.
      Err(_) if target.is_dir() => Ok(SnapshotRef { digest, path: target }),
      Err(source) => Err(SnapshotError::Commit {
        from: dir.to_path_buf(),
        source,
      }),
    }
  }

  /// Commit an empty tree.
  pub fn empty(&self) -> Result<SnapshotRef, SnapshotError> {
    let scratch = self.scratch("empty")?;
    let dir = scratch.path().join("tree");
    fs::create_dir_all(&dir).map_err(|source| SnapshotError::CreateDir { path: dir.clone(), source })?;
    self.commit(&dir)
  }

  pub fn get(&self, digest: &ContentHash) -> Option<SnapshotRef> {
    let path = self.snapshots.join(&digest.0);
    path.is_dir().then(|| SnapshotRef {
      digest: digest.clone(),
      path,
    })
  }

  pub fn contains(&self, digest: &ContentHash) -> bool {
    self.snapshots.join(&digest.0).is_dir()
  }

  /// All committed snapshots, sorted by digest.
  pub fn list(&self) -> Result<Vec<SnapshotRef>, SnapshotError> {
    let entries = match fs::read_dir(&self.snapshots) {
      Ok(entries) => entries,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(SnapshotError::Read(e)),
    };

    let mut refs: Vec<SnapshotRef> = entries
      .flatten()
      .filter(|entry| entry.path().is_dir())
      .filter_map(|entry| {
        let name = entry.file_name().to_str()?.to_string();
        Some(SnapshotRef {
          digest: ContentHash(name),
          path: entry.path(),
        })
      })
      .collect();
    refs.sort_by(|a, b| a.digest.cmp(&b.digest));
    Ok(refs)
  }

  /// Delete a snapshot, returning the number of bytes freed.
  pub fn remove(&self, digest: &ContentHash) -> Result<u64, SnapshotError> {
    let path = self.snapshots.join(&digest.0);
    let size = dir_size(&path);
    match fs::remove_dir_all(&path) {
      Ok(()) => Ok(size),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
      Err(source) => Err(SnapshotError::Remove {
        digest: digest.clone(),
        source,
      }),
    }
  }
}
