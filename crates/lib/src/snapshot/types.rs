use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::hash::{ContentHash, DirHashError};

/// Handle to an immutable filesystem tree in the snapshot store.
///
/// The digest is the [`hash_directory`](crate::util::hash::hash_directory)
/// of the tree, and the tree lives at `path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotRef {
  pub digest: ContentHash,
  pub path: PathBuf,
}

impl SnapshotRef {
  /// First twelve characters of the digest.
  pub fn short(&self) -> &str {
    &self.digest.0[..self.digest.0.len().min(12)]
  }
}

/// Errors from the snapshot store.
#[derive(Debug, Error)]
pub enum SnapshotError {
  #[error("failed to create snapshot directory {path}: {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to hash snapshot contents: {0}")]
  Hash(#[from] DirHashError),

  #[error("failed to move {from} into the store: {source}")]
  Commit {
    from: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to read snapshot store: {0}")]
  Read(#[source] io::Error),

  #[error("failed to remove snapshot {digest}: {source}")]
  Remove {
    digest: ContentHash,
    #[source]
    source: io::Error,
  },
}
