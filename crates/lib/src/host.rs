//! Access to the caller's filesystem.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::filter::CopyFilter;
use crate::util::fs::{CopyStats, copy_tree};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
  #[error("host filesystem access is disabled")]
  Disabled,

  #[error("path {0:?} escapes the workdir; use an absolute path instead")]
  EscapesWorkdir(String),

  #[error("cannot resolve {path}: {message}")]
  Resolve { path: String, message: String },

  #[error("{0} is not a directory")]
  NotADirectory(PathBuf),

  #[error("invalid filter: {0}")]
  Filter(String),

  #[error("failed to copy {path}: {message}")]
  Copy { path: PathBuf, message: String },
}

/// The host side of `host.directory`.
#[derive(Debug, Clone)]
pub struct HostSource {
  workdir: PathBuf,
  disable_rw: bool,
}

impl HostSource {
  pub fn new(workdir: impl Into<PathBuf>) -> Self {
    Self {
      workdir: workdir.into(),
      disable_rw: false,
    }
  }

  /// A source that refuses every read.
  pub fn disabled() -> Self {
    Self {
      workdir: PathBuf::new(),
      disable_rw: true,
    }
  }

  pub fn workdir(&self) -> &Path {
    &self.workdir
  }

  /// Absolute, symlink-free location of `path`.
  ///
  /// Relative paths are joined onto the workdir and must stay inside it.
  /// Absolute paths are taken as-is.
  pub fn resolve(&self, path: &str) -> Result<PathBuf, HostError> {
    if self.disable_rw {
      return Err(HostError::Disabled);
    }

    let requested = Path::new(path);
    let joined = if requested.is_absolute() {
      requested.to_path_buf()
    } else {
      let mut depth = 0usize;
      for component in requested.components() {
        match component {
          Component::Normal(_) => depth += 1,
          Component::ParentDir if depth == 0 => return Err(HostError::EscapesWorkdir(path.to_string())),
          Component::ParentDir => depth -= 1,
          _ => {}
        }
      }
      self.workdir.join(requested)
    };

    dunce::canonicalize(&joined).map_err(|e| HostError::Resolve {
      path: joined.display().to_string(),
      message: e.to_string(),
    })
  }

  /// Copy the directory at `path` into `dst`, honoring `filter`.
  ///
  /// Blocking; call from `spawn_blocking`.
  pub fn read_into(&self, path: &str, filter: &CopyFilter, dst: &Path) -> Result<CopyStats, HostError> {
    let src = self.resolve(path)?;
    if !src.is_dir() {
      return Err(HostError::NotADirectory(src));
    }
    let matcher = filter.compile().map_err(|e| HostError::Filter(e.to_string()))?;

    let stats = copy_tree(&src, dst, &matcher).map_err(|e| HostError::Copy {
      path: src.clone(),
      message: e.to_string(),
    })?;

    debug!(
      path = %src.display(),
      files = stats.files,
      dirs = stats.dirs,
      skipped = stats.skipped,
      "read host directory"
    );
    Ok(stats)
  }
}
