//! Progress events emitted while a graph is resolved.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::graph::NodeSummary;

/// Default capacity of the event channel. Slow subscribers that fall further
/// behind than this observe `RecvError::Lagged`.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
  Stdout,
  Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
  /// The executor was invoked for a node.
  NodeStarted { node: NodeSummary },
  /// A node was served from the cache.
  NodeCached { node: NodeSummary },
  NodeCompleted { node: NodeSummary, duration_ms: u64 },
  NodeFailed { node: NodeSummary, error: String },
  /// One line of process output.
  Log {
    node: NodeSummary,
    stream: LogStream,
    line: String,
  },
}

impl EngineEvent {
  pub fn node(&self) -> &NodeSummary {
    match self {
      EngineEvent::NodeStarted { node }
      | EngineEvent::NodeCached { node }
      | EngineEvent::NodeCompleted { node, .. }
      | EngineEvent::NodeFailed { node, .. }
      | EngineEvent::Log { node, .. } => node,
    }
  }
}

/// Cloneable handle for publishing [`EngineEvent`]s.
///
/// Sending never blocks and never fails; events are dropped when nobody is
/// subscribed.
#[derive(Debug, Clone)]
pub struct EventSender {
  sender: broadcast::Sender<EngineEvent>,
}

impl Default for EventSender {
  fn default() -> Self {
    Self::new(DEFAULT_EVENT_CAPACITY)
  }
}

impl EventSender {
  pub fn new(capacity: usize) -> Self {
    let (sender, _) = broadcast::channel(capacity.max(1));
    Self { sender }
  }

  pub fn emit(&self, event: EngineEvent) {
    let _ = self.sender.send(event);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
    self.sender.subscribe()
  }
}
