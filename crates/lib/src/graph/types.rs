use std::collections::BTreeMap;
use std::fmt;

use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::filter::CopyFilter;
use crate::util::hash::{Fingerprint, Hashable};

/// What an operation produces, used to type-check dependency edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
  /// A root filesystem plus image config.
  Container,
  /// A standalone directory tree.
  Directory,
  /// A reference to an image outside the engine.
  Image,
}

impl fmt::Display for OutputKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      OutputKind::Container => "container",
      OutputKind::Directory => "directory",
      OutputKind::Image => "image",
    };
    f.write_str(name)
  }
}

/// Tag of an [`Operation`], without its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
  FromImage,
  HostDirectory,
  MountDirectory,
  SetWorkdir,
  Exec,
  Directory,
  CopyOutput,
  Publish,
}

impl fmt::Display for OperationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      OperationKind::FromImage => "from",
      OperationKind::HostDirectory => "host.directory",
      OperationKind::MountDirectory => "with_directory",
      OperationKind::SetWorkdir => "with_workdir",
      OperationKind::Exec => "exec",
      OperationKind::Directory => "directory",
      OperationKind::CopyOutput => "copy_into",
      OperationKind::Publish => "publish",
    };
    f.write_str(name)
  }
}

/// A single build step and its parameters.
///
/// The serialized form is part of every fingerprint, so field names and
/// variant tags are stable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
  /// Start from a base image. No dependencies.
  FromImage { image: String },

  /// Read a directory from the host. No dependencies.
  HostDirectory {
    path: String,
    #[serde(default)]
    filter: CopyFilter,
  },

  /// Place a directory into a container at `path`.
  /// Dependencies: `[container, directory]`.
  MountDirectory {
    path: String,
    #[serde(default)]
    filter: CopyFilter,
  },

  /// Change the working directory of a container.
  /// Dependencies: `[container]`.
  SetWorkdir { path: String },

  /// Run a process in a container.
  /// Dependencies: `[container]`.
  Exec {
    args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    env: BTreeMap<String, String>,
  },

  /// Extract a directory out of a container. Relative paths are resolved
  /// against the container's working directory.
  /// Dependencies: `[container]`.
  Directory { path: String },

  /// Copy a directory produced elsewhere into a container at `path`.
  /// Dependencies: `[container, directory]`.
  CopyOutput {
    path: String,
    #[serde(default)]
    filter: CopyFilter,
  },

  /// Push a container to a registry. Terminal.
  /// Dependencies: `[container]`.
  Publish { reference: String },
}

impl Operation {
  pub fn kind(&self) -> OperationKind {
    match self {
      Operation::FromImage { .. } => OperationKind::FromImage,
      Operation::HostDirectory { .. } => OperationKind::HostDirectory,
      Operation::MountDirectory { .. } => OperationKind::MountDirectory,
      Operation::SetWorkdir { .. } => OperationKind::SetWorkdir,
      Operation::Exec { .. } => OperationKind::Exec,
      Operation::Directory { .. } => OperationKind::Directory,
      Operation::CopyOutput { .. } => OperationKind::CopyOutput,
      Operation::Publish { .. } => OperationKind::Publish,
    }
  }

  pub fn output(&self) -> OutputKind {
    match self {
      Operation::FromImage { .. }
      | Operation::MountDirectory { .. }
      | Operation::SetWorkdir { .. }
      | Operation::Exec { .. }
      | Operation::CopyOutput { .. } => OutputKind::Container,
      Operation::HostDirectory { .. } | Operation::Directory { .. } => OutputKind::Directory,
      Operation::Publish { .. } => OutputKind::Image,
    }
  }

  /// Expected output kinds of the dependencies, in order.
  pub fn inputs(&self) -> &'static [OutputKind] {
    match self {
      Operation::FromImage { .. } | Operation::HostDirectory { .. } => &[],
      Operation::MountDirectory { .. } | Operation::CopyOutput { .. } => {
        &[OutputKind::Container, OutputKind::Directory]
      }
      Operation::SetWorkdir { .. }
      | Operation::Exec { .. }
      | Operation::Directory { .. }
      | Operation::Publish { .. } => &[OutputKind::Container],
    }
  }

  /// Volatile operations observe state outside the engine and are executed
  /// on every `resolve` instead of being served from the cache.
  pub fn is_volatile(&self) -> bool {
    matches!(self, Operation::HostDirectory { .. } | Operation::Publish { .. })
  }

  /// Terminal operations cannot be used as dependencies.
  pub fn is_terminal(&self) -> bool {
    matches!(self, Operation::Publish { .. })
  }

  /// One-line description of the parameters for logs and error reports.
  pub fn summary(&self) -> String {
    match self {
      Operation::FromImage { image } => image.clone(),
      Operation::HostDirectory { path, filter } => with_filter(path, filter),
      Operation::MountDirectory { path, filter } | Operation::CopyOutput { path, filter } => {
        with_filter(path, filter)
      }
      Operation::SetWorkdir { path } | Operation::Directory { path } => path.clone(),
      Operation::Exec { args, .. } => args.join(" "),
      Operation::Publish { reference } => reference.clone(),
    }
  }

  pub(crate) fn validate(&self) -> Result<(), String> {
    match self {
      Operation::FromImage { image } if image.trim().is_empty() => Err("image reference is empty".to_string()),
      Operation::Exec { args, .. } if args.is_empty() || args[0].is_empty() => {
        Err("command must have at least one argument".to_string())
      }
      Operation::Publish { reference } if reference.trim().is_empty() => {
        Err("publish reference is empty".to_string())
      }
      Operation::HostDirectory { path, filter }
      | Operation::MountDirectory { path, filter }
      | Operation::CopyOutput { path, filter } => {
        if path.is_empty() {
          return Err("path is empty".to_string());
        }
        filter.compile().map(|_| ()).map_err(|e| e.to_string())
      }
      Operation::SetWorkdir { path } | Operation::Directory { path } if path.is_empty() => {
        Err("path is empty".to_string())
      }
      _ => Ok(()),
    }
  }
}

fn with_filter(path: &str, filter: &CopyFilter) -> String {
  if filter.exclude.is_empty() {
    path.to_string()
  } else {
    format!("{} (exclude {})", path, filter.exclude.join(", "))
  }
}

/// Identifies the graph instance a [`NodeRef`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphId(pub(crate) u64);

/// Handle to a node of an [`OperationGraph`](super::OperationGraph).
///
/// Only meaningful together with the graph that returned it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRef {
  pub(crate) graph: GraphId,
  pub(crate) index: NodeIndex,
  pub(crate) fingerprint: Fingerprint,
}

impl NodeRef {
  pub fn fingerprint(&self) -> &Fingerprint {
    &self.fingerprint
  }

  /// Position of the node in its graph's arena.
  pub fn index(&self) -> usize {
    self.index.index()
  }
}

impl fmt::Display for NodeRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}:{}", self.index.index(), self.fingerprint.short())
  }
}

/// An immutable node: the operation plus the nodes it consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationNode {
  pub op: Operation,
  pub deps: Vec<NodeRef>,
  pub fingerprint: Fingerprint,
}

/// What a node is, for error reports and events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeSummary {
  pub kind: OperationKind,
  pub params: String,
  pub fingerprint: Fingerprint,
}

impl From<&OperationNode> for NodeSummary {
  fn from(node: &OperationNode) -> Self {
    Self {
      kind: node.op.kind(),
      params: node.op.summary(),
      fingerprint: node.fingerprint.clone(),
    }
  }
}

impl fmt::Display for NodeSummary {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}({}) [{}]", self.kind, self.params, self.fingerprint.short())
  }
}

/// The serialized shape that a fingerprint is computed from.
#[derive(Serialize)]
pub(crate) struct NodeIdentity<'a> {
  pub op: &'a Operation,
  pub deps: Vec<&'a Fingerprint>,
}

impl Hashable for NodeIdentity<'_> {}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
  #[error("invalid reference: {0}")]
  InvalidReference(String),

  #[error("invalid {kind} operation: {message}")]
  InvalidOperation { kind: OperationKind, message: String },

  #[error("failed to fingerprint operation: {0}")]
  Fingerprint(String),
}
