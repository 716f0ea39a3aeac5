use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::execute::ResolvedResult;
use crate::util::hash::Fingerprint;

/// One cached resolution.
///
/// Stored entries are never modified. `last_accessed` is filled in from the
/// store's access bookkeeping when an entry is listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub key: Fingerprint,
  pub result: ResolvedResult,
  /// Unix seconds.
  pub created_at: u64,
  /// Unix seconds.
  pub last_accessed: u64,
  pub size_bytes: u64,
}

/// Bounds enforced by [`CacheStore::evict`](super::CacheStore::evict).
/// `None` means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachePolicy {
  pub max_entries: Option<usize>,
  pub max_bytes: Option<u64>,
  pub max_age: Option<Duration>,
}

impl CachePolicy {
  pub fn unbounded() -> Self {
    Self::default()
  }
}

/// What an eviction pass removed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictStats {
  pub expired: usize,
  pub evicted: usize,
  pub bytes_freed: u64,
  /// Entries that would have been removed but were pinned.
  pub pinned_skipped: usize,
}

impl EvictStats {
  pub fn removed(&self) -> usize {
    self.expired + self.evicted
  }
}

#[derive(Debug, Error)]
pub enum CacheError {
  /// The backing directory could not be used. The in-memory view is still
  /// consistent; only persistence was lost.
  #[error("cache unavailable at {path}: {message}")]
  Unavailable { path: PathBuf, message: String },
}
