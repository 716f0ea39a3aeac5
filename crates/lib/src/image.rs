//! Base images.
//!
//! The engine does not speak any registry protocol. An [`ImageSource`] hands
//! back an unpacked root filesystem plus its config, and the executor takes
//! it from there. [`LocalImageSource`] serves images from a directory tree:
//!
//! ```text
//! {root}/<name>/<tag>/rootfs/        # unpacked filesystem
//! {root}/<name>/<tag>/config.json    # optional ImageConfig
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::execute::ImageConfig;
use crate::platform::ImagePlatform;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImageError {
  #[error("invalid image reference {0:?}")]
  InvalidReference(String),

  #[error("image {0} not found")]
  NotFound(String),

  #[error("failed to read image {image}: {message}")]
  Read { image: String, message: String },
}

/// `name[:tag]`, where `name` may contain a registry host with a port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
  pub name: String,
  pub tag: String,
}

impl ImageRef {
  pub fn parse(reference: &str) -> Result<Self, ImageError> {
    let reference = reference.trim();
    let invalid = || ImageError::InvalidReference(reference.to_string());

    if reference.is_empty() || reference.contains('@') || reference.contains("..") {
      return Err(invalid());
    }

    // A colon after the last slash separates the tag; earlier ones belong to a host:port.
    let last_slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    let (name, tag) = match reference[last_slash..].rfind(':') {
      Some(i) => (&reference[..last_slash + i], &reference[last_slash + i + 1..]),
      None => (reference, "latest"),
    };

    if name.is_empty() || tag.is_empty() || name.starts_with('/') || name.ends_with('/') {
      return Err(invalid());
    }

    Ok(Self {
      name: name.to_string(),
      tag: tag.to_string(),
    })
  }

  /// Relative directory of this image in a local layout. Host ports are
  /// flattened so the path stays portable.
  pub fn relative_dir(&self) -> PathBuf {
    PathBuf::from(self.name.replace(':', "_")).join(&self.tag)
  }
}

impl fmt::Display for ImageRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.name, self.tag)
  }
}

/// An unpacked image ready to be snapshotted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulledImage {
  pub reference: ImageRef,
  pub rootfs: PathBuf,
  pub config: ImageConfig,
  pub platform: ImagePlatform,
}

#[async_trait]
pub trait ImageSource: Send + Sync {
  async fn pull(&self, image: &str) -> Result<PulledImage, ImageError>;
}

/// Serves images unpacked under a local directory.
#[derive(Debug, Clone)]
pub struct LocalImageSource {
  root: PathBuf,
}

impl LocalImageSource {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }
}

#[async_trait]
impl ImageSource for LocalImageSource {
  async fn pull(&self, image: &str) -> Result<PulledImage, ImageError> {
    let reference = ImageRef::parse(image)?;
    let dir = self.root.join(reference.relative_dir());
    let rootfs = dir.join("rootfs");

    if !tokio::fs::metadata(&rootfs).await.is_ok_and(|m| m.is_dir()) {
      return Err(ImageError::NotFound(reference.to_string()));
    }

    let config = match tokio::fs::read_to_string(dir.join("config.json")).await {
      Ok(raw) => serde_json::from_str(&raw).map_err(|e| ImageError::Read {
        image: reference.to_string(),
        message: format!("config.json: {}", e),
      })?,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => ImageConfig::default(),
      Err(e) => {
        return Err(ImageError::Read {
          image: reference.to_string(),
          message: e.to_string(),
        });
      }
    };

    debug!(image = %reference, rootfs = %rootfs.display(), "pulled local image");

    Ok(PulledImage {
      reference,
      rootfs,
      config,
      platform: ImagePlatform::host(),
    })
  }
}
