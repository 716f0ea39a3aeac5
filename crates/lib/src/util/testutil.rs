//! Test fixtures shared across the crate's unit tests.
//!
//! Processes run straight on the host, so "images" here are plain
//! directories and commands go through the host's `/bin/sh`.

use std::fs;
use std::path::Path;

use crate::graph::{NodeSummary, OperationKind};
use crate::util::hash::Fingerprint;

/// Arguments running `script` with `/bin/sh -c`.
pub fn sh(script: &str) -> Vec<String> {
  vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
}

/// Install `<images>/<name>/<tag>` with the given rootfs files and an
/// optional `config.json`.
pub fn install_image(images: &Path, name: &str, tag: &str, files: &[(&str, &str)], config: Option<&str>) {
  let dir = images.join(name).join(tag);
  let rootfs = dir.join("rootfs");
  fs::create_dir_all(&rootfs).unwrap();
  write_files(&rootfs, files);
  if let Some(config) = config {
    fs::write(dir.join("config.json"), config).unwrap();
  }
}

/// Write `files` (relative path, content) under `root`, creating parents.
pub fn write_files(root: &Path, files: &[(&str, &str)]) {
  for (rel, content) in files {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
  }
}

/// A node project with sources and an installed dependency.
pub fn write_project(root: &Path) {
  write_files(
    root,
    &[
      ("package.json", "{}"),
      ("src/app.js", "app"),
      ("node_modules/dep/index.js", "dep"),
    ],
  );
}

/// Summary of a made-up node of `kind`.
pub fn summary(kind: OperationKind, params: &str) -> NodeSummary {
  NodeSummary {
    kind,
    params: params.to_string(),
    fingerprint: Fingerprint("0".repeat(32)),
  }
}
