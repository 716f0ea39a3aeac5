//! Publishing images.
//!
//! [`LocalRegistry`] lays published images out the same way
//! [`LocalImageSource`](crate::image::LocalImageSource) reads them, so an
//! image published to a local registry can be used as a base image by
//! pointing an image source at the same directory.
//!
//! ```text
//! {root}/<name>/<tag>/rootfs/
//! {root}/<name>/<tag>/config.json
//! {root}/<name>/<tag>/manifest.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::execute::ImageConfig;
use crate::filter::FilterMatcher;
use crate::image::{ImageError, ImageRef};
use crate::platform::ImagePlatform;
use crate::snapshot::SnapshotRef;
use crate::util::fs::copy_tree;
use crate::util::hash::{ContentHash, hash_bytes};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
  #[error(transparent)]
  Reference(#[from] ImageError),

  #[error("failed to write {path}: {message}")]
  Write { path: PathBuf, message: String },

  #[error("failed to encode manifest: {0}")]
  Manifest(String),

  #[error("registry rejected {reference}: {message}")]
  Rejected { reference: String, message: String },
}

/// What gets recorded for a published image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
  pub reference: String,
  pub rootfs: ContentHash,
  pub config: ImageConfig,
  pub platform: ImagePlatform,
}

#[async_trait]
pub trait Registry: Send + Sync {
  /// Push an image and return its digest-qualified reference.
  async fn publish(&self, reference: &str, rootfs: &SnapshotRef, config: &ImageConfig) -> Result<String, RegistryError>;
}

#[derive(Debug, Clone)]
pub struct LocalRegistry {
  root: PathBuf,
}

impl LocalRegistry {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Read back the manifest of a published image.
  pub fn manifest(&self, reference: &str) -> Option<ImageManifest> {
    let image = ImageRef::parse(reference).ok()?;
    let raw = fs::read_to_string(self.root.join(image.relative_dir()).join("manifest.json")).ok()?;
    serde_json::from_str(&raw).ok()
  }
}

#[async_trait]
impl Registry for LocalRegistry {
  async fn publish(&self, reference: &str, rootfs: &SnapshotRef, config: &ImageConfig) -> Result<String, RegistryError> {
    let image = ImageRef::parse(reference)?;
    let manifest = ImageManifest {
      reference: image.to_string(),
      rootfs: rootfs.digest.clone(),
      config: config.clone(),
      platform: ImagePlatform::host(),
    };
    let encoded = serde_json::to_vec_pretty(&manifest).map_err(|e| RegistryError::Manifest(e.to_string()))?;
    let digest = hash_bytes(&encoded);

    let dir = self.root.join(image.relative_dir());
    let src = rootfs.path.clone();
    let config = serde_json::to_vec_pretty(config).map_err(|e| RegistryError::Manifest(e.to_string()))?;

    tokio::task::spawn_blocking(move || write_image(&dir, &src, &config, &encoded))
      .await
      .map_err(|e| RegistryError::Rejected {
        reference: reference.to_string(),
        message: e.to_string(),
      })??;

    let published = format!("{}@sha256:{}", image, digest.0);
    info!(reference = %published, "image published");
    Ok(published)
  }
}

fn write_image(dir: &Path, rootfs: &Path, config: &[u8], manifest: &[u8]) -> Result<(), RegistryError> {
  let write_err = |path: &Path, e: std::io::Error| RegistryError::Write {
    path: path.to_path_buf(),
    message: e.to_string(),
  };

  // Replace the tag wholesale; a stale tree would otherwise leak files.
  if dir.exists() {
    fs::remove_dir_all(dir).map_err(|e| write_err(dir, e))?;
  }
  let target = dir.join("rootfs");
  copy_tree(rootfs, &target, &FilterMatcher::default()).map_err(|e| write_err(&target, e))?;

  let config_path = dir.join("config.json");
  fs::write(&config_path, config).map_err(|e| write_err(&config_path, e))?;
  let manifest_path = dir.join("manifest.json");
  fs::write(&manifest_path, manifest).map_err(|e| write_err(&manifest_path, e))?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::image::{ImageSource, LocalImageSource};
  use crate::util::hash::hash_directory;
  use tempfile::tempdir;

  fn rootfs(root: &Path) -> SnapshotRef {
    let path = root.join("snap");
    fs::create_dir_all(path.join("usr/share/nginx/html")).unwrap();
    fs::write(path.join("usr/share/nginx/html/index.html"), "<h1>hi</h1>").unwrap();
    SnapshotRef {
      digest: hash_directory(&path).unwrap(),
      path,
    }
  }

  #[tokio::test]
  async fn publish_returns_digest_reference() {
    let temp = tempdir().unwrap();
    let registry = LocalRegistry::new(temp.path().join("registry"));
    let snap = rootfs(temp.path());

    let published = registry
      .publish("ttl.sh/hello-dagger", &snap, &ImageConfig::default())
      .await
      .unwrap();

    assert!(published.starts_with("ttl.sh/hello-dagger:latest@sha256:"));
    let manifest = registry.manifest("ttl.sh/hello-dagger").unwrap();
    assert_eq!(manifest.rootfs, snap.digest);
  }

  #[tokio::test]
  async fn published_images_can_be_pulled() {
    let temp = tempdir().unwrap();
    let registry = LocalRegistry::new(temp.path().join("registry"));
    let config = ImageConfig {
      workdir: "/usr/share/nginx/html".to_string(),
      ..Default::default()
    };

    registry.publish("web:1", &rootfs(temp.path()), &config).await.unwrap();

    let pulled = LocalImageSource::new(registry.root()).pull("web:1").await.unwrap();
    assert_eq!(pulled.config, config);
    assert!(pulled.rootfs.join("usr/share/nginx/html/index.html").exists());
  }

  #[tokio::test]
  async fn invalid_reference_is_rejected() {
    let temp = tempdir().unwrap();
    let registry = LocalRegistry::new(temp.path());
    let err = registry
      .publish("", &rootfs(temp.path()), &ImageConfig::default())
      .await
      .unwrap_err();
    assert!(matches!(err, RegistryError::Reference(_)));
  }
}
