//! Resolving nodes of an [`OperationGraph`] into results.
//!
//! A `resolve` call walks the subgraph under the requested node depth-first
//! in declared dependency order, resolving siblings concurrently. Each node
//! is visited at most once per call. For every node the evaluator computes
//! a cache key, serves the result from the [`CacheStore`] when it can, and
//! otherwise runs the [`Executor`] inside a single-flight execution shared
//! with every other request for the same key.
//!
//! # Cache keys
//!
//! A node's key is its fingerprint as long as nothing upstream reads state
//! from outside the engine. Host directories are re-read on every call and
//! keyed by their fingerprint plus the digest of what was read; keys of
//! dependents are derived from the keys of their dependencies. Changing a
//! file on the host therefore changes every key downstream of it, and
//! leaving it alone reproduces the same keys.
//!
//! Publish nodes are neither cached nor shared: they run once per call.

mod error;
mod flight;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, Shared, try_join_all};
use futures::FutureExt;
use parking_lot::Mutex;
use petgraph::graph::NodeIndex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, PinGuard};
use crate::events::{EngineEvent, EventSender};
use crate::execute::{ExecutionContext, Executor, FailureCause, ResolvedResult};
use crate::graph::{NodeIdentity, NodeRef, NodeSummary, Operation, OperationGraph, OperationNode};
use crate::snapshot::SnapshotStore;
use crate::util::hash::{ContentHash, Fingerprint, Hashable};

pub use error::ResolveError;
use flight::{FlightMap, Outcome};

/// Knobs for an [`Evaluator`].
#[derive(Debug, Clone)]
pub struct EvaluatorSettings {
  /// Maximum number of concurrent executor invocations.
  pub parallelism: usize,
  /// Applied to every executor invocation.
  pub exec_timeout: Option<Duration>,
  /// Added to every process environment.
  pub exec_env: BTreeMap<String, String>,
}

impl Default for EvaluatorSettings {
  fn default() -> Self {
    Self {
      parallelism: 4,
      exec_timeout: None,
      exec_env: BTreeMap::new(),
    }
  }
}

/// A node's result together with the key it was resolved under.
#[derive(Debug)]
struct Resolved {
  key: Fingerprint,
  node: NodeSummary,
  result: ResolvedResult,
}

type NodeOutcome = Result<Arc<Resolved>, ResolveError>;
type NodeFuture = Shared<BoxFuture<'static, NodeOutcome>>;

/// State of one `resolve` call.
struct Call {
  memo: Mutex<HashMap<NodeIndex, NodeFuture>>,
  pins: Mutex<Vec<PinGuard>>,
  cancel: CancellationToken,
}

/// Releases what a call holds once it ends, however it ends. Pending memo
/// futures hold the call itself, so the memo must be cleared explicitly.
///
/// A call dropped before it finished was abandoned by its caller: its token
/// is cancelled first so every waiter it still holds withdraws.
struct CallGuard {
  call: Arc<Call>,
  finished: bool,
}

impl Drop for CallGuard {
  fn drop(&mut self) {
    if !self.finished {
      debug!("resolve abandoned; withdrawing pending requests");
      self.call.cancel.cancel();
    }
    let pending: Vec<NodeFuture> = self.call.memo.lock().drain().map(|(_, f)| f).collect();
    drop(pending);
    self.call.pins.lock().clear();
  }
}

struct Inner {
  graph: Arc<OperationGraph>,
  cache: Arc<CacheStore>,
  executor: Arc<dyn Executor>,
  snapshots: SnapshotStore,
  events: EventSender,
  flights: Arc<FlightMap>,
  permits: Arc<Semaphore>,
  settings: EvaluatorSettings,
}

/// Cloneable handle; clones share the cache, the in-flight executions and
/// the parallelism budget.
#[derive(Clone)]
pub struct Evaluator {
  inner: Arc<Inner>,
}

impl Evaluator {
  pub fn new(
    graph: Arc<OperationGraph>,
    cache: Arc<CacheStore>,
    executor: Arc<dyn Executor>,
    snapshots: SnapshotStore,
    events: EventSender,
    settings: EvaluatorSettings,
  ) -> Self {
    let permits = Arc::new(Semaphore::new(settings.parallelism.max(1)));
    Self {
      inner: Arc::new(Inner {
        graph,
        cache,
        executor,
        snapshots,
        events,
        flights: Arc::new(FlightMap::default()),
        permits,
        settings,
      }),
    }
  }

  pub fn graph(&self) -> &Arc<OperationGraph> {
    &self.inner.graph
  }

  pub fn cache(&self) -> &Arc<CacheStore> {
    &self.inner.cache
  }

  pub fn events(&self) -> &EventSender {
    &self.inner.events
  }

  /// Number of executions currently running or awaiting a permit.
  pub fn in_flight(&self) -> usize {
    self.inner.flights.len()
  }

  pub async fn resolve(&self, node: &NodeRef) -> Result<ResolvedResult, ResolveError> {
    self.resolve_with_cancel(node, CancellationToken::new()).await
  }

  /// Resolve `node`. Cancelling `cancel`, or dropping the returned future,
  /// withdraws this request from every execution it waits on; executions
  /// other requests still wait on keep running. A cancelled request returns
  /// [`ResolveError::Cancelled`].
  pub async fn resolve_with_cancel(
    &self,
    node: &NodeRef,
    cancel: CancellationToken,
  ) -> Result<ResolvedResult, ResolveError> {
    self.inner.graph.check(node)?;
    if cancel.is_cancelled() {
      return Err(ResolveError::Cancelled);
    }

    let call = Arc::new(Call {
      memo: Mutex::new(HashMap::new()),
      pins: Mutex::new(Vec::new()),
      cancel: cancel.child_token(),
    });
    let mut guard = CallGuard {
      call: Arc::clone(&call),
      finished: false,
    };

    let started = Instant::now();
    let outcome = self.node_future(&call, node.clone()).await;
    guard.finished = true;

    match &outcome {
      Ok(resolved) => debug!(
        node = %resolved.node,
        key = %resolved.key.short(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "resolved"
      ),
      Err(err) => debug!(node = %node, error = %err, "resolve failed"),
    }

    outcome.map(|resolved| resolved.result.clone())
  }

  /// The memoized future resolving `node` within `call`.
  fn node_future(&self, call: &Arc<Call>, node: NodeRef) -> NodeFuture {
    let mut memo = call.memo.lock();
    if let Some(existing) = memo.get(&node.index) {
      return existing.clone();
    }

    let this = self.clone();
    let call_ref = Arc::clone(call);
    let index = node.index;
    let future = async move { this.resolve_node(call_ref, node).await }.boxed().shared();
    memo.insert(index, future.clone());
    future
  }

  async fn resolve_node(&self, call: Arc<Call>, node: NodeRef) -> NodeOutcome {
    let op_node = self.inner.graph.node(&node)?;
    let summary = NodeSummary::from(&op_node);

    let deps = try_join_all(op_node.deps.iter().map(|dep| self.node_future(&call, dep.clone()))).await?;

    // A finished process with a non-zero exit cannot feed anything.
    for dep in &deps {
      if let ResolvedResult::Exec { exit_code, stderr, .. } = &dep.result
        && *exit_code != 0
      {
        return Err(ResolveError::ExecutionFailed {
          node: dep.node.clone(),
          cause: FailureCause::NonZeroExit {
            code: *exit_code,
            stderr: stderr.clone(),
          },
        });
      }
    }

    let dep_results: Vec<ResolvedResult> = deps.iter().map(|d| d.result.clone()).collect();

    match &op_node.op {
      Operation::Publish { .. } => {
        let result = self
          .execute(&op_node, &summary, dep_results, call.cancel.clone())
          .await?;
        Ok(Arc::new(Resolved {
          key: op_node.fingerprint.clone(),
          node: summary,
          result,
        }))
      }
      Operation::HostDirectory { .. } => {
        let result = self
          .execute(&op_node, &summary, dep_results, call.cancel.clone())
          .await?;
        let key = match result.directory() {
          Some(snapshot) => host_key(&op_node.fingerprint, &snapshot.digest)?,
          None => op_node.fingerprint.clone(),
        };
        call.pins.lock().push(self.inner.cache.pin(&key));
        self.store(&key, &result).await;
        Ok(Arc::new(Resolved {
          key,
          node: summary,
          result,
        }))
      }
      _ => {
        let key = derived_key(&op_node, &deps)?;
        call.pins.lock().push(self.inner.cache.pin(&key));

        if let Some(result) = self.inner.cache.get(&key) {
          info!(node = %summary, "cached");
          self.inner.events.emit(EngineEvent::NodeCached { node: summary.clone() });
          return Ok(Arc::new(Resolved {
            key,
            node: summary,
            result,
          }));
        }

        let result = self.shared_execution(&key, op_node, summary.clone(), dep_results, &call).await?;
        Ok(Arc::new(Resolved {
          key,
          node: summary,
          result,
        }))
      }
    }
  }

  /// Run the node through the single-flight map for `key`.
  async fn shared_execution(
    &self,
    key: &Fingerprint,
    op_node: OperationNode,
    summary: NodeSummary,
    deps: Vec<ResolvedResult>,
    call: &Call,
  ) -> Outcome {
    let this = self.clone();
    let flight_key = key.clone();
    let flight_summary = summary.clone();

    let waiter = self.inner.flights.join(key, &call.cancel, move |token| {
      async move {
        // Another flight may have finished between our lookup and this one starting.
        if let Some(result) = this.inner.cache.get(&flight_key) {
          this.inner.events.emit(EngineEvent::NodeCached { node: flight_summary });
          return Ok(result);
        }
        let result = this.execute(&op_node, &flight_summary, deps, token).await?;
        this.store(&flight_key, &result).await;
        Ok(result)
      }
      .boxed()
    });

    waiter.wait().await.unwrap_or_else(|| {
      Err(ResolveError::ExecutionFailed {
        node: summary,
        cause: FailureCause::IsolationSetup("execution ended without a result".to_string()),
      })
    })
  }

  /// Invoke the executor once, bounded by the parallelism budget.
  async fn execute(
    &self,
    op_node: &OperationNode,
    summary: &NodeSummary,
    deps: Vec<ResolvedResult>,
    cancel: CancellationToken,
  ) -> Outcome {
    let _permit = tokio::select! {
      permit = Arc::clone(&self.inner.permits).acquire_owned() => {
        permit.map_err(|_| ResolveError::Cancelled)?
      }
      _ = cancel.cancelled() => return Err(ResolveError::Cancelled),
    };

    let scratch = self
      .inner
      .snapshots
      .scratch(&op_node.op.kind().to_string().replace('.', "-"))
      .map_err(|e| ResolveError::from_cause(summary, FailureCause::setup("failed to allocate scratch space", e)))?;

    let ctx = ExecutionContext {
      node: summary.clone(),
      scratch,
      env: self.inner.settings.exec_env.clone(),
      timeout: self.inner.settings.exec_timeout,
      cancel,
      events: self.inner.events.clone(),
    };

    info!(node = %summary, "running");
    self.inner.events.emit(EngineEvent::NodeStarted { node: summary.clone() });
    let started = Instant::now();

    match self.inner.executor.run(&op_node.op, &deps, &ctx).await {
      Ok(result) => {
        let duration_ms = started.elapsed().as_millis() as u64;
        if let Some(code) = result.exit_code()
          && code != 0
        {
          warn!(node = %summary, exit_code = code, "process exited with non-zero status");
        }
        info!(node = %summary, duration_ms, "done");
        self.inner.events.emit(EngineEvent::NodeCompleted {
          node: summary.clone(),
          duration_ms,
        });
        Ok(result)
      }
      Err(cause) => {
        let err = ResolveError::from_cause(summary, cause);
        if err != ResolveError::Cancelled {
          warn!(node = %summary, error = %err, "failed");
          self.inner.events.emit(EngineEvent::NodeFailed {
            node: summary.clone(),
            error: err.to_string(),
          });
        }
        Err(err)
      }
    }
  }

  /// Insert into the cache. Sizing snapshots and writing the entry touch
  /// the disk, so the put runs on the blocking pool.
  async fn store(&self, key: &Fingerprint, result: &ResolvedResult) {
    let cache = Arc::clone(&self.inner.cache);
    let key = key.clone();
    let result = result.clone();
    let short = key.short().to_string();

    match tokio::task::spawn_blocking(move || cache.put(&key, result)).await {
      Ok(Ok(())) => {}
      Ok(Err(e)) => warn!(key = %short, error = %e, "cache write failed; continuing without persistence"),
      Err(e) => warn!(key = %short, error = %e, "cache write task failed"),
    }
  }
}

#[derive(Serialize)]
struct HostKey<'a> {
  fingerprint: &'a Fingerprint,
  content: &'a ContentHash,
}

impl Hashable for HostKey<'_> {}

/// Key of a node whose dependencies resolved under `deps` keys. Equal to
/// the fingerprint when every dependency key is its fingerprint.
fn derived_key(node: &OperationNode, deps: &[Arc<Resolved>]) -> Result<Fingerprint, ResolveError> {
  if deps.iter().all(|d| d.key == d.node.fingerprint) {
    return Ok(node.fingerprint.clone());
  }
  NodeIdentity {
    op: &node.op,
    deps: deps.iter().map(|d| &d.key).collect(),
  }
  .fingerprint()
  .map_err(|e| ResolveError::InvalidReference(format!("cannot derive cache key: {}", e)))
}

fn host_key(fingerprint: &Fingerprint, content: &ContentHash) -> Result<Fingerprint, ResolveError> {
  HostKey { fingerprint, content }
    .fingerprint()
    .map_err(|e| ResolveError::InvalidReference(format!("cannot derive cache key: {}", e)))
}
