//! Engine configuration.
//!
//! Values come from, in increasing precedence: built-in defaults, the
//! environment (`KILN_ROOT`, `KILN_PARALLELISM`, `KILN_EXEC_TIMEOUT`), and
//! whatever the caller sets on the struct afterwards (CLI flags).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::cache::CachePolicy;
use crate::consts::{EXEC_TIMEOUT_ENV, PARALLELISM_ENV};
use crate::platform::paths::{EnginePaths, root_dir};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
  #[error("{var} must be a positive integer, got {value:?}")]
  InvalidParallelism { var: &'static str, value: String },

  #[error("{var} must be a duration like \"90s\" or \"10m\", got {value:?}: {message}")]
  InvalidDuration {
    var: &'static str,
    value: String,
    message: String,
  },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
  /// Directory holding snapshots, scratch space, the persisted cache, local
  /// images and the local registry.
  pub root: PathBuf,
  /// Maximum number of concurrent executor invocations.
  pub parallelism: usize,
  /// Default limit for each exec invocation.
  pub exec_timeout: Option<Duration>,
  pub cache_policy: CachePolicy,
  /// Keep cache entries on disk across runs.
  pub persist_cache: bool,
  /// Directory relative host paths are resolved against.
  pub host_workdir: PathBuf,
  /// Refuse every host filesystem read.
  pub disable_host_access: bool,
  /// Extra variables added to every exec environment.
  pub exec_env: BTreeMap<String, String>,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      root: root_dir(),
      parallelism: default_parallelism(),
      exec_timeout: None,
      cache_policy: CachePolicy::default(),
      persist_cache: true,
      host_workdir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
      disable_host_access: false,
      exec_env: BTreeMap::new(),
    }
  }
}

impl EngineConfig {
  /// Defaults overlaid with the environment.
  pub fn from_env() -> Result<Self, ConfigError> {
    let mut config = Self::default();

    if let Ok(value) = std::env::var(PARALLELISM_ENV)
      && !value.is_empty()
    {
      config.parallelism = match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => n,
        _ => {
          return Err(ConfigError::InvalidParallelism {
            var: PARALLELISM_ENV,
            value,
          });
        }
      };
    }

    if let Ok(value) = std::env::var(EXEC_TIMEOUT_ENV)
      && !value.is_empty()
    {
      let timeout = humantime::parse_duration(value.trim()).map_err(|e| ConfigError::InvalidDuration {
        var: EXEC_TIMEOUT_ENV,
        value: value.clone(),
        message: e.to_string(),
      })?;
      config.exec_timeout = Some(timeout);
    }

    Ok(config)
  }

  /// A throwaway configuration rooted at `root`: nothing persisted, host
  /// paths resolved against `root`.
  pub fn ephemeral(root: impl Into<PathBuf>) -> Self {
    let root = root.into();
    Self {
      host_workdir: root.clone(),
      root,
      persist_cache: false,
      ..Self::default()
    }
  }

  pub fn paths(&self) -> EnginePaths {
    EnginePaths::new(&self.root)
  }
}

fn default_parallelism() -> usize {
  std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}
