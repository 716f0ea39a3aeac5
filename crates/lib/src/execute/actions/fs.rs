//! Filesystem steps of the sandbox executor.
//!
//! Everything here is blocking and runs under `spawn_blocking`. Snapshot
//! trees are only ever read; writes go to scratch copies.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::execute::types::normalize;
use crate::filter::FilterMatcher;
use crate::util::fs::{CopyStats, copy_tree};

/// Host location of the container path `path` inside `rootfs`.
pub fn container_path(rootfs: &Path, path: &str) -> PathBuf {
  let normalized = normalize(path);
  let relative = normalized.trim_start_matches('/');
  if relative.is_empty() {
    rootfs.to_path_buf()
  } else {
    rootfs.join(relative)
  }
}

/// Make a private, writable copy of a snapshot tree.
pub fn stage(snapshot: &Path, dst: &Path) -> io::Result<CopyStats> {
  copy_tree(snapshot, dst, &FilterMatcher::default())
}

/// How a directory is placed into a rootfs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
  /// Whatever was at the target is replaced.
  Replace,
  /// The directory is merged over existing content.
  Merge,
}

/// Copy `src` into the staged `rootfs` at container path `path`.
pub fn place(rootfs: &Path, path: &str, src: &Path, matcher: &FilterMatcher, mode: Placement) -> io::Result<CopyStats> {
  let target = container_path(rootfs, path);
  if target == rootfs && mode == Placement::Replace {
    return Err(io::Error::new(
      io::ErrorKind::InvalidInput,
      "cannot replace the container root",
    ));
  }

  if mode == Placement::Replace {
    match fs::symlink_metadata(&target) {
      Ok(meta) if meta.is_dir() => fs::remove_dir_all(&target)?,
      Ok(_) => fs::remove_file(&target)?,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {}
      Err(e) => return Err(e),
    }
  }

  copy_tree(src, &target, matcher)
}

/// Copy the container path `path` out of `rootfs` into `dst`.
///
/// Returns `NotFound` if the path does not exist or is not a directory.
pub fn extract(rootfs: &Path, path: &str, dst: &Path) -> io::Result<CopyStats> {
  let src = container_path(rootfs, path);
  let meta = fs::symlink_metadata(&src)?;
  if !meta.is_dir() {
    return Err(io::Error::new(
      io::ErrorKind::NotFound,
      format!("{} is not a directory", path),
    ));
  }
  copy_tree(&src, dst, &FilterMatcher::default())
}
