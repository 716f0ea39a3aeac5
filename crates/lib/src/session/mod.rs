//! The client-facing surface of the engine.
//!
//! A [`Session`] owns one operation graph plus everything needed to
//! evaluate it, and exposes the small command set callers build pipelines
//! with. Builder calls only extend the graph; [`Session::directory`],
//! [`Session::publish`] and [`Session::resolve`] request concrete values and
//! trigger evaluation.

pub mod script;

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::CacheStore;
use crate::config::EngineConfig;
use crate::eval::{Evaluator, EvaluatorSettings, ResolveError};
use crate::events::{EngineEvent, EventSender};
use crate::execute::{Executor, ResolvedResult, SandboxExecutor};
use crate::filter::CopyFilter;
use crate::graph::{GraphError, NodeRef, Operation, OperationGraph};
use crate::host::HostSource;
use crate::image::{ImageSource, LocalImageSource};
use crate::registry::{LocalRegistry, Registry};
use crate::snapshot::{SnapshotRef, SnapshotStore};

#[derive(Debug, Error)]
pub enum SessionError {
  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error(transparent)]
  Resolve(#[from] ResolveError),

  #[error("expected a {expected} result, got {found}")]
  UnexpectedResult { expected: &'static str, found: &'static str },
}

/// A directory requested through [`Session::directory`]: the node that
/// produces it, usable as input to later calls, and its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryHandle {
  pub node: NodeRef,
  pub snapshot: SnapshotRef,
}

pub struct Session {
  config: EngineConfig,
  graph: Arc<OperationGraph>,
  cache: Arc<CacheStore>,
  snapshots: SnapshotStore,
  events: EventSender,
  evaluator: Evaluator,
}

impl Session {
  /// A session backed by the local image store, registry and host
  /// filesystem found under the configured root.
  pub fn new(config: EngineConfig) -> Self {
    let paths = config.paths();
    let images: Arc<dyn ImageSource> = Arc::new(LocalImageSource::new(paths.images()));
    let registry: Arc<dyn Registry> = Arc::new(LocalRegistry::new(paths.registry()));
    Self::with_sources(config, images, registry)
  }

  /// A session pulling and publishing through the given interfaces.
  pub fn with_sources(config: EngineConfig, images: Arc<dyn ImageSource>, registry: Arc<dyn Registry>) -> Self {
    let snapshots = SnapshotStore::new(&config.paths());
    let host = if config.disable_host_access {
      HostSource::disabled()
    } else {
      HostSource::new(&config.host_workdir)
    };
    let executor = Arc::new(SandboxExecutor::new(snapshots.clone(), images, registry, host));
    Self::with_executor(config, executor)
  }

  /// A session running every operation through `executor`.
  pub fn with_executor(config: EngineConfig, executor: Arc<dyn Executor>) -> Self {
    let snapshots = SnapshotStore::new(&config.paths());
    let cache = Arc::new(open_cache(&config));
    let graph = Arc::new(OperationGraph::new());
    let events = EventSender::default();

    let evaluator = Evaluator::new(
      Arc::clone(&graph),
      Arc::clone(&cache),
      executor,
      snapshots.clone(),
      events.clone(),
      EvaluatorSettings {
        parallelism: config.parallelism,
        exec_timeout: config.exec_timeout,
        exec_env: config.exec_env.clone(),
      },
    );

    info!(
      root = %config.root.display(),
      parallelism = config.parallelism,
      cached = cache.len(),
      "session started"
    );

    Self {
      config,
      graph,
      cache,
      snapshots,
      events,
      evaluator,
    }
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  pub fn graph(&self) -> &Arc<OperationGraph> {
    &self.graph
  }

  pub fn cache(&self) -> &Arc<CacheStore> {
    &self.cache
  }

  pub fn snapshots(&self) -> &SnapshotStore {
    &self.snapshots
  }

  pub fn evaluator(&self) -> &Evaluator {
    &self.evaluator
  }

  /// Receive engine events emitted from now on.
  pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
    self.events.subscribe()
  }

  /// A container started from `image`.
  pub fn base(&self, image: &str) -> Result<NodeRef, SessionError> {
    Ok(self.graph.add_node(
      Operation::FromImage {
        image: image.to_string(),
      },
      &[],
    )?)
  }

  /// A directory read from the host, relative to the session's workdir.
  pub fn host_directory(&self, host_path: &str, exclude: &[String]) -> Result<NodeRef, SessionError> {
    Ok(self.graph.add_node(
      Operation::HostDirectory {
        path: host_path.to_string(),
        filter: CopyFilter::exclude(exclude),
      },
      &[],
    )?)
  }

  /// `container` with the host directory `host_path` placed at `path`,
  /// replacing whatever was there.
  pub fn mount(
    &self,
    container: &NodeRef,
    path: &str,
    host_path: &str,
    exclude: &[String],
  ) -> Result<NodeRef, SessionError> {
    let source = self.host_directory(host_path, exclude)?;
    Ok(self.graph.add_node(
      Operation::MountDirectory {
        path: path.to_string(),
        filter: CopyFilter::default(),
      },
      &[container.clone(), source],
    )?)
  }

  pub fn set_workdir(&self, container: &NodeRef, path: &str) -> Result<NodeRef, SessionError> {
    Ok(self.graph.add_node(
      Operation::SetWorkdir { path: path.to_string() },
      std::slice::from_ref(container),
    )?)
  }

  pub fn exec(&self, container: &NodeRef, args: &[String]) -> Result<NodeRef, SessionError> {
    self.exec_with_env(container, args, BTreeMap::new())
  }

  /// Like [`Session::exec`] with extra environment variables. They take
  /// part in the fingerprint.
  pub fn exec_with_env(
    &self,
    container: &NodeRef,
    args: &[String],
    env: BTreeMap<String, String>,
  ) -> Result<NodeRef, SessionError> {
    Ok(self.graph.add_node(
      Operation::Exec {
        args: args.to_vec(),
        env,
      },
      std::slice::from_ref(container),
    )?)
  }

  /// The node extracting `path` from `container`, without resolving it.
  pub fn directory_node(&self, container: &NodeRef, path: &str) -> Result<NodeRef, SessionError> {
    Ok(self.graph.add_node(
      Operation::Directory { path: path.to_string() },
      std::slice::from_ref(container),
    )?)
  }

  /// Extract `path` from `container` and resolve it.
  pub async fn directory(&self, container: &NodeRef, path: &str) -> Result<DirectoryHandle, SessionError> {
    let node = self.directory_node(container, path)?;
    let result = self.resolve(&node).await?;
    match result {
      ResolvedResult::Directory { snapshot } => Ok(DirectoryHandle { node, snapshot }),
      other => Err(SessionError::UnexpectedResult {
        expected: "directory",
        found: other.type_name(),
      }),
    }
  }

  /// `container` with the contents of `directory` merged into `path`.
  pub fn copy_into(
    &self,
    container: &NodeRef,
    path: &str,
    directory: &NodeRef,
    filter: CopyFilter,
  ) -> Result<NodeRef, SessionError> {
    Ok(self.graph.add_node(
      Operation::CopyOutput {
        path: path.to_string(),
        filter,
      },
      &[container.clone(), directory.clone()],
    )?)
  }

  /// The node publishing `container` as `reference`, without resolving it.
  pub fn publish_node(&self, container: &NodeRef, reference: &str) -> Result<NodeRef, SessionError> {
    Ok(self.graph.add_node(
      Operation::Publish {
        reference: reference.to_string(),
      },
      std::slice::from_ref(container),
    )?)
  }

  /// Publish `container` and return the resulting image reference.
  pub async fn publish(&self, container: &NodeRef, reference: &str) -> Result<String, SessionError> {
    let node = self.publish_node(container, reference)?;
    match self.resolve(&node).await? {
      ResolvedResult::Published { reference } => Ok(reference),
      other => Err(SessionError::UnexpectedResult {
        expected: "published",
        found: other.type_name(),
      }),
    }
  }

  pub async fn resolve(&self, node: &NodeRef) -> Result<ResolvedResult, SessionError> {
    Ok(self.evaluator.resolve(node).await?)
  }

  pub async fn resolve_with_cancel(
    &self,
    node: &NodeRef,
    cancel: CancellationToken,
  ) -> Result<ResolvedResult, SessionError> {
    Ok(self.evaluator.resolve_with_cancel(node, cancel).await?)
  }
}

fn open_cache(config: &EngineConfig) -> CacheStore {
  if !config.persist_cache {
    return CacheStore::in_memory(config.cache_policy.clone());
  }
  let dir = config.paths().cache();
  match CacheStore::open(&dir, config.cache_policy.clone()) {
    Ok(cache) => cache,
    Err(e) => {
      warn!(error = %e, "cache directory unavailable; using an in-memory cache");
      CacheStore::in_memory(config.cache_policy.clone())
    }
  }
}
