use thiserror::Error;

use crate::execute::FailureCause;
use crate::graph::{GraphError, NodeSummary};

/// Why a `resolve` call did not produce a result.
///
/// Cloneable: every request waiting on the same execution receives the
/// same error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
  #[error("invalid reference: {0}")]
  InvalidReference(String),

  /// `node` is the node that actually failed, which may be a dependency of
  /// the node being resolved.
  #[error("{node} failed: {cause}")]
  ExecutionFailed { node: NodeSummary, cause: FailureCause },

  #[error("publishing {node} failed: {message}")]
  PublishFailed { node: NodeSummary, message: String },

  #[error("resolution cancelled")]
  Cancelled,
}

impl ResolveError {
  /// The node the error is attributed to, if any.
  pub fn node(&self) -> Option<&NodeSummary> {
    match self {
      ResolveError::ExecutionFailed { node, .. } | ResolveError::PublishFailed { node, .. } => Some(node),
      ResolveError::InvalidReference(_) | ResolveError::Cancelled => None,
    }
  }

  pub(crate) fn from_cause(node: &NodeSummary, cause: FailureCause) -> Self {
    match cause {
      FailureCause::Cancelled => ResolveError::Cancelled,
      FailureCause::Registry(message) => ResolveError::PublishFailed {
        node: node.clone(),
        message,
      },
      cause => ResolveError::ExecutionFailed {
        node: node.clone(),
        cause,
      },
    }
  }
}

impl From<GraphError> for ResolveError {
  fn from(err: GraphError) -> Self {
    ResolveError::InvalidReference(err.to_string())
  }
}
