//! Types shared by the executor and the evaluator.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::events::EventSender;
use crate::graph::NodeSummary;
use crate::snapshot::SnapshotRef;

/// Runtime configuration carried alongside a container's root filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
  /// Absolute working directory inside the rootfs.
  #[serde(default = "default_workdir")]
  pub workdir: String,
  #[serde(default)]
  pub env: BTreeMap<String, String>,
}

fn default_workdir() -> String {
  "/".to_string()
}

impl Default for ImageConfig {
  fn default() -> Self {
    Self {
      workdir: default_workdir(),
      env: BTreeMap::new(),
    }
  }
}

impl ImageConfig {
  /// Resolve `path` against the working directory. The result is always
  /// absolute and free of `.`/`..` components; `..` never climbs above `/`.
  pub fn resolve_path(&self, path: &str) -> String {
    let joined = if path.starts_with('/') {
      path.to_string()
    } else {
      format!("{}/{}", self.workdir.trim_end_matches('/'), path)
    };
    normalize(&joined)
  }
}

/// Lexically normalize an absolute container path.
pub(crate) fn normalize(path: &str) -> String {
  let mut parts: Vec<&str> = Vec::new();
  for part in path.split('/') {
    match part {
      "" | "." => {}
      ".." => {
        parts.pop();
      }
      other => parts.push(other),
    }
  }
  format!("/{}", parts.join("/"))
}

/// The output of resolving a node.
///
/// Filesystem content is referenced by snapshot handles; the bytes live in
/// the [`SnapshotStore`](crate::snapshot::SnapshotStore).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResolvedResult {
  Container {
    rootfs: SnapshotRef,
    config: ImageConfig,
  },
  Directory {
    snapshot: SnapshotRef,
  },
  /// A finished process. The container is the state after the process
  /// exited; a non-zero `exit_code` is data, not an error.
  Exec {
    rootfs: SnapshotRef,
    config: ImageConfig,
    exit_code: i32,
    stdout: String,
    stderr: String,
  },
  Published {
    reference: String,
  },
}

impl ResolvedResult {
  pub fn type_name(&self) -> &'static str {
    match self {
      ResolvedResult::Container { .. } => "container",
      ResolvedResult::Directory { .. } => "directory",
      ResolvedResult::Exec { .. } => "exec",
      ResolvedResult::Published { .. } => "published",
    }
  }

  /// Root filesystem and config, for container and exec results.
  pub fn container(&self) -> Option<(&SnapshotRef, &ImageConfig)> {
    match self {
      ResolvedResult::Container { rootfs, config } | ResolvedResult::Exec { rootfs, config, .. } => {
        Some((rootfs, config))
      }
      _ => None,
    }
  }

  pub fn directory(&self) -> Option<&SnapshotRef> {
    match self {
      ResolvedResult::Directory { snapshot } => Some(snapshot),
      _ => None,
    }
  }

  pub fn exit_code(&self) -> Option<i32> {
    match self {
      ResolvedResult::Exec { exit_code, .. } => Some(*exit_code),
      _ => None,
    }
  }

  /// An exec result whose process did not exit with status zero.
  pub fn is_failed_exec(&self) -> bool {
    self.exit_code().is_some_and(|code| code != 0)
  }

  /// Every snapshot this result keeps alive.
  pub fn snapshots(&self) -> Vec<&SnapshotRef> {
    match self {
      ResolvedResult::Container { rootfs, .. } | ResolvedResult::Exec { rootfs, .. } => vec![rootfs],
      ResolvedResult::Directory { snapshot } => vec![snapshot],
      ResolvedResult::Published { .. } => Vec::new(),
    }
  }
}

/// Why an executor invocation did not produce a result.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FailureCause {
  #[error("process exited with status {code}")]
  NonZeroExit { code: i32, stderr: String },

  #[error("timed out after {}", humantime::format_duration(*.0))]
  Timeout(Duration),

  #[error("isolation setup failed: {0}")]
  IsolationSetup(String),

  #[error("base image not found: {0}")]
  MissingBaseImage(String),

  #[error("host access failed: {0}")]
  HostAccess(String),

  #[error("registry error: {0}")]
  Registry(String),

  #[error("cancelled")]
  Cancelled,
}

impl FailureCause {
  pub(crate) fn setup(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
    FailureCause::IsolationSetup(format!("{}: {}", context, err))
  }
}

/// Everything one executor invocation may use. Built fresh for each cache
/// miss and dropped afterwards, which removes the scratch directory.
#[derive(Debug)]
pub struct ExecutionContext {
  pub node: NodeSummary,
  /// Private working directory for this invocation.
  pub scratch: TempDir,
  /// Extra variables added to every process environment.
  pub env: BTreeMap<String, String>,
  pub timeout: Option<Duration>,
  pub cancel: CancellationToken,
  pub events: EventSender,
}
