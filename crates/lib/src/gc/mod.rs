//! Garbage collection of the engine root.
//!
//! A pass applies the cache policy, then deletes every snapshot no
//! remaining cache entry refers to and every leftover scratch directory.
//! Callers hold the store lock exclusively while collecting, so no build
//! can be between committing a snapshot and caching the result that refers
//! to it.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::snapshot::SnapshotStore;
use crate::util::fs::dir_size;
use crate::util::hash::ContentHash;

#[derive(Debug, Error)]
pub enum GcError {
  #[error("failed to list snapshots: {0}")]
  ListSnapshots(String),

  #[error("failed to read scratch directory: {0}")]
  ReadScratch(#[from] io::Error),
}

#[derive(Debug, Default, Serialize)]
pub struct GcStats {
  pub cache_entries_evicted: usize,
  pub cache_bytes_freed: u64,
  pub snapshots_scanned: usize,
  pub snapshots_deleted: usize,
  pub snapshots_bytes_freed: u64,
  pub scratch_deleted: usize,
  pub scratch_bytes_freed: u64,
}

impl GcStats {
  /// Snapshot and scratch directories removed.
  pub fn total_deleted(&self) -> usize {
    self.snapshots_deleted + self.scratch_deleted
  }

  /// Disk space reclaimed by deleting directories. Cache entries only
  /// account for the snapshots they pinned, which are counted here once
  /// they become unreferenced.
  pub fn total_bytes_freed(&self) -> u64 {
    self.snapshots_bytes_freed + self.scratch_bytes_freed
  }
}

#[derive(Debug, Serialize)]
pub struct GcResult {
  pub stats: GcStats,
  pub deleted_paths: Vec<PathBuf>,
}

/// Collect garbage. With `dry_run` nothing is evicted or deleted; the
/// result lists what is unreferenced by the cache as it stands.
pub fn collect_garbage(cache: &CacheStore, snapshots: &SnapshotStore, dry_run: bool) -> Result<GcResult, GcError> {
  let mut stats = GcStats::default();
  let mut deleted_paths = Vec::new();

  if !dry_run {
    let evicted = cache.evict();
    stats.cache_entries_evicted = evicted.removed();
    stats.cache_bytes_freed = evicted.bytes_freed;
  }

  let live = cache.referenced_snapshots();
  debug!(count = live.len(), "collected live snapshots from cache");

  sweep_snapshots(snapshots, &live, dry_run, &mut stats, &mut deleted_paths)?;
  sweep_scratch(snapshots.scratch_path(), dry_run, &mut stats, &mut deleted_paths)?;

  info!(
    evicted = stats.cache_entries_evicted,
    snapshots_deleted = stats.snapshots_deleted,
    scratch_deleted = stats.scratch_deleted,
    bytes_freed = stats.total_bytes_freed(),
    dry_run,
    "garbage collection complete"
  );

  Ok(GcResult { stats, deleted_paths })
}

fn sweep_snapshots(
  snapshots: &SnapshotStore,
  live: &HashSet<ContentHash>,
  dry_run: bool,
  stats: &mut GcStats,
  deleted_paths: &mut Vec<PathBuf>,
) -> Result<(), GcError> {
  let all = snapshots.list().map_err(|e| GcError::ListSnapshots(e.to_string()))?;

  for snapshot in all {
    stats.snapshots_scanned += 1;
    if live.contains(&snapshot.digest) {
      continue;
    }

    debug!(snapshot = %snapshot.short(), "removing unreferenced snapshot");

    if dry_run {
      stats.snapshots_deleted += 1;
      stats.snapshots_bytes_freed += dir_size(&snapshot.path);
      deleted_paths.push(snapshot.path);
      continue;
    }

    match snapshots.remove(&snapshot.digest) {
      Ok(size) => {
        stats.snapshots_deleted += 1;
        stats.snapshots_bytes_freed += size;
        deleted_paths.push(snapshot.path);
      }
      Err(e) => {
        warn!(snapshot = %snapshot.short(), error = %e, "failed to delete snapshot");
      }
    }
  }

  Ok(())
}

fn sweep_scratch(
  scratch: &Path,
  dry_run: bool,
  stats: &mut GcStats,
  deleted_paths: &mut Vec<PathBuf>,
) -> Result<(), GcError> {
  let entries = match fs::read_dir(scratch) {
    Ok(entries) => entries,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
    Err(e) => return Err(e.into()),
  };

  for entry in entries.flatten() {
    let path = entry.path();
    let size = if path.is_dir() {
      dir_size(&path)
    } else {
      entry.metadata().map(|m| m.len()).unwrap_or(0)
    };

    debug!(path = %path.display(), "removing stale scratch space");

    if !dry_run {
      let removed = if path.is_dir() {
        fs::remove_dir_all(&path)
      } else {
        fs::remove_file(&path)
      };
      if let Err(e) = removed {
        warn!(path = %path.display(), error = %e, "failed to delete scratch space");
        continue;
      }
    }

    stats.scratch_deleted += 1;
    stats.scratch_bytes_freed += size;
    deleted_paths.push(path);
  }

  Ok(())
}
