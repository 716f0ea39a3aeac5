//! Engine directory layout.
//!
//! ```text
//! {root}/
//! ├── .lock        # StoreLock
//! ├── snapshots/   # content-addressed snapshot trees
//! ├── scratch/     # per-invocation working copies
//! ├── cache/       # persisted cache entries (<key>.json)
//! ├── images/      # LocalImageSource: <name>/<tag>/rootfs
//! └── registry/    # LocalRegistry: published manifests
//! ```

use std::path::PathBuf;

use crate::consts::{APP_NAME, ROOT_ENV};

/// Returns the user's home directory
#[cfg(windows)]
pub fn home_dir() -> PathBuf {
  std::env::var("USERPROFILE")
    .map(PathBuf::from)
    .unwrap_or_else(|_| std::env::temp_dir())
}

/// Returns the user's home directory
#[cfg(not(windows))]
pub fn home_dir() -> PathBuf {
  std::env::var("HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| std::env::temp_dir())
}

/// Returns the directory for cache files for the application
#[cfg(windows)]
pub fn cache_dir() -> PathBuf {
  std::env::var("LOCALAPPDATA")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir())
    .join(APP_NAME)
    .join("Cache")
}

/// Returns the directory for cache files for the application
#[cfg(not(windows))]
pub fn cache_dir() -> PathBuf {
  let cache_home = std::env::var("XDG_CACHE_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".cache"));
  cache_home.join(APP_NAME)
}

/// Engine root: `$KILN_ROOT` if set, otherwise the cache directory.
pub fn root_dir() -> PathBuf {
  if let Ok(path) = std::env::var(ROOT_ENV)
    && !path.is_empty()
  {
    return PathBuf::from(path);
  }
  cache_dir()
}

/// Resolved locations of everything the engine keeps on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnginePaths {
  pub root: PathBuf,
}

impl EnginePaths {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn current() -> Self {
    Self::new(root_dir())
  }

  pub fn snapshots(&self) -> PathBuf {
    self.root.join("snapshots")
  }

  pub fn scratch(&self) -> PathBuf {
    self.root.join("scratch")
  }

  pub fn cache(&self) -> PathBuf {
    self.root.join("cache")
  }

  pub fn images(&self) -> PathBuf {
    self.root.join("images")
  }

  pub fn registry(&self) -> PathBuf {
    self.root.join("registry")
  }
}
