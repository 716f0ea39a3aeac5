//! Executing single operations.
//!
//! The evaluator decides *whether* a node runs; an [`Executor`] decides
//! *how*. Each call receives the operation, the already-resolved results of
//! its dependencies in declared order, and a fresh [`ExecutionContext`].
//!
//! [`SandboxExecutor`] is the local implementation. It never mutates a
//! snapshot: every filesystem-changing step stages a private copy in the
//! invocation's scratch directory and commits the result as a new snapshot.

pub mod actions;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::filter::CopyFilter;
use crate::graph::Operation;
use crate::host::{HostError, HostSource};
use crate::image::{ImageError, ImageSource};
use crate::registry::Registry;
use crate::snapshot::{SnapshotRef, SnapshotStore};

use actions::{Placement, ProcessSpec};

pub use types::{ExecutionContext, FailureCause, ImageConfig, ResolvedResult};

#[async_trait]
pub trait Executor: Send + Sync {
  /// Perform one operation. Called once per cache miss.
  async fn run(
    &self,
    op: &Operation,
    deps: &[ResolvedResult],
    ctx: &ExecutionContext,
  ) -> Result<ResolvedResult, FailureCause>;
}

pub struct SandboxExecutor {
  snapshots: SnapshotStore,
  images: Arc<dyn ImageSource>,
  registry: Arc<dyn Registry>,
  host: HostSource,
}

impl SandboxExecutor {
  pub fn new(
    snapshots: SnapshotStore,
    images: Arc<dyn ImageSource>,
    registry: Arc<dyn Registry>,
    host: HostSource,
  ) -> Self {
    Self {
      snapshots,
      images,
      registry,
      host,
    }
  }

  pub fn snapshots(&self) -> &SnapshotStore {
    &self.snapshots
  }

  async fn from_image(&self, image: &str, ctx: &ExecutionContext) -> Result<ResolvedResult, FailureCause> {
    let pulled = self.images.pull(image).await.map_err(|e| match e {
      ImageError::Read { .. } => FailureCause::IsolationSetup(e.to_string()),
      ImageError::NotFound(_) | ImageError::InvalidReference(_) => FailureCause::MissingBaseImage(e.to_string()),
    })?;

    let tree = tree_dir(ctx);
    let src = pulled.rootfs.clone();
    let dst = tree.clone();
    blocking(move || actions::stage(&src, &dst), "failed to unpack image").await?;
    let rootfs = self.commit(tree, ctx).await?;

    let mut config = pulled.config;
    config.workdir = config.resolve_path(".");

    info!(image = %pulled.reference, rootfs = %rootfs.short(), "base image ready");
    Ok(ResolvedResult::Container { rootfs, config })
  }

  async fn host_directory(
    &self,
    path: &str,
    filter: &CopyFilter,
    ctx: &ExecutionContext,
  ) -> Result<ResolvedResult, FailureCause> {
    let tree = tree_dir(ctx);
    let host = self.host.clone();
    let path_owned = path.to_string();
    let filter = filter.clone();
    let dst = tree.clone();

    tokio::task::spawn_blocking(move || host.read_into(&path_owned, &filter, &dst))
      .await
      .map_err(|e| FailureCause::setup("host read task failed", e))?
      .map_err(|e: HostError| FailureCause::HostAccess(e.to_string()))?;

    let snapshot = self.commit(tree, ctx).await?;
    debug!(path, snapshot = %snapshot.short(), "host directory snapshotted");
    Ok(ResolvedResult::Directory { snapshot })
  }

  async fn place(
    &self,
    deps: &[ResolvedResult],
    path: &str,
    filter: &CopyFilter,
    mode: Placement,
    ctx: &ExecutionContext,
  ) -> Result<ResolvedResult, FailureCause> {
    let (base, config) = container_input(deps)?;
    let dir = directory_input(deps)?;
    let matcher = filter
      .compile()
      .map_err(|e| FailureCause::IsolationSetup(e.to_string()))?;

    let tree = tree_dir(ctx);
    let (base_path, dir_path, dst) = (base.path.clone(), dir.path.clone(), tree.clone());
    let container_dir = config.resolve_path(path);

    blocking(
      move || {
        actions::stage(&base_path, &dst)?;
        actions::place(&dst, &container_dir, &dir_path, &matcher, mode)
      },
      "failed to place directory",
    )
    .await?;

    let rootfs = self.commit(tree, ctx).await?;
    Ok(ResolvedResult::Container {
      rootfs,
      config: config.clone(),
    })
  }

  async fn exec(
    &self,
    deps: &[ResolvedResult],
    args: &[String],
    env: &std::collections::BTreeMap<String, String>,
    ctx: &ExecutionContext,
  ) -> Result<ResolvedResult, FailureCause> {
    let (base, config) = container_input(deps)?;

    let tree = tree_dir(ctx);
    let tmp = ctx.scratch.path().join("tmp");
    let cwd = actions::container_path(&tree, &config.workdir);
    let (base_path, dst, tmp_dir, cwd_dir) = (base.path.clone(), tree.clone(), tmp.clone(), cwd.clone());

    blocking(
      move || {
        actions::stage(&base_path, &dst)?;
        std::fs::create_dir_all(&cwd_dir)?;
        std::fs::create_dir_all(&tmp_dir)
      },
      "failed to stage rootfs",
    )
    .await?;

    let spec = ProcessSpec {
      args,
      env: actions::process_env(config, &ctx.env, env, &tree, &tmp),
      cwd,
    };
    let output = actions::run_process(&spec, ctx).await?;

    let rootfs = self.commit(tree, ctx).await?;
    Ok(ResolvedResult::Exec {
      rootfs,
      config: config.clone(),
      exit_code: output.exit_code,
      stdout: output.stdout,
      stderr: output.stderr,
    })
  }

  async fn directory(
    &self,
    deps: &[ResolvedResult],
    path: &str,
    ctx: &ExecutionContext,
  ) -> Result<ResolvedResult, FailureCause> {
    let (base, config) = container_input(deps)?;
    let container_dir = config.resolve_path(path);

    let tree = tree_dir(ctx);
    let (base_path, dst) = (base.path.clone(), tree.clone());
    let context = format!("cannot read {} from container", container_dir);

    blocking(move || actions::extract(&base_path, &container_dir, &dst), &context).await?;

    let snapshot = self.commit(tree, ctx).await?;
    Ok(ResolvedResult::Directory { snapshot })
  }

  async fn publish(&self, deps: &[ResolvedResult], reference: &str) -> Result<ResolvedResult, FailureCause> {
    let (rootfs, config) = container_input(deps)?;
    let published = self
      .registry
      .publish(reference, rootfs, config)
      .await
      .map_err(|e| FailureCause::Registry(e.to_string()))?;
    Ok(ResolvedResult::Published { reference: published })
  }

  async fn commit(&self, tree: PathBuf, ctx: &ExecutionContext) -> Result<SnapshotRef, FailureCause> {
    if ctx.cancel.is_cancelled() {
      return Err(FailureCause::Cancelled);
    }
    let store = self.snapshots.clone();
    tokio::task::spawn_blocking(move || {
      std::fs::create_dir_all(&tree)?;
      store.commit(&tree).map_err(std::io::Error::other)
    })
    .await
    .map_err(|e| FailureCause::setup("commit task failed", e))?
    .map_err(|e| FailureCause::setup("failed to commit snapshot", e))
  }
}

#[async_trait]
impl Executor for SandboxExecutor {
  async fn run(
    &self,
    op: &Operation,
    deps: &[ResolvedResult],
    ctx: &ExecutionContext,
  ) -> Result<ResolvedResult, FailureCause> {
    if ctx.cancel.is_cancelled() {
      return Err(FailureCause::Cancelled);
    }

    match op {
      Operation::FromImage { image } => self.from_image(image, ctx).await,
      Operation::HostDirectory { path, filter } => self.host_directory(path, filter, ctx).await,
      Operation::MountDirectory { path, filter } => self.place(deps, path, filter, Placement::Replace, ctx).await,
      Operation::CopyOutput { path, filter } => self.place(deps, path, filter, Placement::Merge, ctx).await,
      Operation::SetWorkdir { path } => {
        let (rootfs, config) = container_input(deps)?;
        Ok(ResolvedResult::Container {
          rootfs: rootfs.clone(),
          config: ImageConfig {
            workdir: config.resolve_path(path),
            env: config.env.clone(),
          },
        })
      }
      Operation::Exec { args, env } => self.exec(deps, args, env, ctx).await,
      Operation::Directory { path } => self.directory(deps, path, ctx).await,
      Operation::Publish { reference } => self.publish(deps, reference).await,
    }
  }
}

fn tree_dir(ctx: &ExecutionContext) -> PathBuf {
  ctx.scratch.path().join("tree")
}

fn container_input(deps: &[ResolvedResult]) -> Result<(&SnapshotRef, &ImageConfig), FailureCause> {
  deps
    .first()
    .and_then(ResolvedResult::container)
    .ok_or_else(|| FailureCause::IsolationSetup("expected a container as the first input".to_string()))
}

fn directory_input(deps: &[ResolvedResult]) -> Result<&SnapshotRef, FailureCause> {
  deps
    .get(1)
    .and_then(ResolvedResult::directory)
    .ok_or_else(|| FailureCause::IsolationSetup("expected a directory as the second input".to_string()))
}

async fn blocking<F, T>(f: F, context: &str) -> Result<T, FailureCause>
where
  F: FnOnce() -> std::io::Result<T> + Send + 'static,
  T: Send + 'static,
{
  tokio::task::spawn_blocking(f)
    .await
    .map_err(|e| FailureCause::setup(context, e))?
    .map_err(|e| FailureCause::setup(context, e))
}
