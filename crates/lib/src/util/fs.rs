//! Filesystem helpers for materializing snapshots.
//!
//! All functions here are blocking; async callers go through
//! `tokio::task::spawn_blocking`.

use std::fs;
use std::io;
use std::path::Path;

use walkdir::WalkDir;

use crate::filter::FilterMatcher;

/// Counters reported by [`copy_tree`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CopyStats {
  pub files: usize,
  pub dirs: usize,
  pub symlinks: usize,
  pub skipped: usize,
}

/// Copy the contents of `src` into `dst`, applying `matcher` to paths
/// relative to `src`.
///
/// `dst` is created if missing and existing files are overwritten. Excluded
/// directories are not descended into. Symlinks are recreated, not followed,
/// but a link to a directory matches directory-only patterns.
pub fn copy_tree(src: &Path, dst: &Path, matcher: &FilterMatcher) -> io::Result<CopyStats> {
  let mut stats = CopyStats::default();
  fs::create_dir_all(dst)?;

  let walker = WalkDir::new(src).min_depth(1).sort_by_file_name().into_iter().filter_entry(|e| {
    let rel = relative(src, e.path());
    !matcher.is_excluded(&rel, matches_as_dir(e))
  });

  for entry in walker {
    let entry = entry.map_err(io::Error::other)?;
    let rel = relative(src, entry.path());
    let file_type = entry.file_type();
    let target = dst.join(&rel);

    if file_type.is_dir() {
      // With includes, a directory is only materialized once something in it survives.
      if matcher.is_included(&rel, true) {
        fs::create_dir_all(&target)?;
        stats.dirs += 1;
      }
      continue;
    }

    if !matcher.is_included(&rel, matches_as_dir(&entry)) {
      stats.skipped += 1;
      continue;
    }

    if let Some(parent) = target.parent() {
      fs::create_dir_all(parent)?;
    }

    if file_type.is_symlink() {
      let link = fs::read_link(entry.path())?;
      remove_existing(&target)?;
      create_symlink(&link, &target)?;
      stats.symlinks += 1;
    } else if file_type.is_file() {
      remove_existing(&target)?;
      fs::copy(entry.path(), &target)?;
      stats.files += 1;
    } else {
      stats.skipped += 1;
    }
  }

  Ok(stats)
}

fn matches_as_dir(entry: &walkdir::DirEntry) -> bool {
  let file_type = entry.file_type();
  file_type.is_dir() || (file_type.is_symlink() && entry.path().is_dir())
}

/// Total size in bytes of regular files below `path`.
pub fn dir_size(path: &Path) -> u64 {
  WalkDir::new(path)
    .into_iter()
    .filter_map(|e| e.ok())
    .filter(|e| e.file_type().is_file())
    .filter_map(|e| e.metadata().ok())
    .map(|m| m.len())
    .sum()
}

fn relative(root: &Path, path: &Path) -> String {
  path
    .strip_prefix(root)
    .unwrap_or(path)
    .to_string_lossy()
    .replace('\\', "/")
}

fn remove_existing(target: &Path) -> io::Result<()> {
  match fs::symlink_metadata(target) {
    Ok(meta) if meta.is_dir() => fs::remove_dir_all(target),
    Ok(_) => fs::remove_file(target),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(e),
  }
}

#[cfg(unix)]
fn create_symlink(link: &Path, target: &Path) -> io::Result<()> {
  std::os::unix::fs::symlink(link, target)
}

#[cfg(windows)]
fn create_symlink(link: &Path, target: &Path) -> io::Result<()> {
  std::os::windows::fs::symlink_file(link, target)
}
