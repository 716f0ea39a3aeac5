//! Shared test helpers for CLI integration tests.

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// Isolated engine root plus a project directory.
///
/// Steps run straight on the host, so images are plain directories under
/// the root's image store and commands go through the host's `/bin/sh`.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  /// An engine with an `alpine:3` image and an empty project.
  pub fn new() -> Self {
    let env = Self {
      temp: TempDir::new().unwrap(),
    };
    fs::create_dir_all(env.project_path()).unwrap();
    env.install_image("alpine", "3", &[("etc/os-release", "alpine\n")]);
    env
  }

  pub fn root_path(&self) -> PathBuf {
    self.temp.path().join("root")
  }

  pub fn project_path(&self) -> PathBuf {
    self.temp.path().join("project")
  }

  pub fn install_image(&self, name: &str, tag: &str, files: &[(&str, &str)]) {
    let rootfs = self.root_path().join("images").join(name).join(tag).join("rootfs");
    write_files(&rootfs, files);
    fs::create_dir_all(rootfs).unwrap();
  }

  /// Write a file relative to the project directory.
  pub fn write_file(&self, relative_path: &str, content: &str) {
    write_files(&self.project_path(), &[(relative_path, content)]);
  }

  /// Write `kiln.json` into the project directory.
  pub fn write_script(&self, content: &str) {
    self.write_file("kiln.json", content);
  }

  pub fn snapshot_count(&self) -> usize {
    fs::read_dir(self.root_path().join("snapshots"))
      .map(|entries| entries.flatten().filter(|e| e.path().is_dir()).count())
      .unwrap_or(0)
  }

  /// A kiln command running in the project directory against the isolated
  /// root.
  pub fn kiln_cmd(&self) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("kiln");
    cmd.current_dir(self.project_path());
    cmd.env("KILN_ROOT", self.root_path());
    cmd.env_remove("KILN_PARALLELISM");
    cmd.env_remove("KILN_EXEC_TIMEOUT");
    cmd.env_remove("RUST_LOG");
    cmd
  }
}

fn write_files(root: &Path, files: &[(&str, &str)]) {
  for (rel, content) in files {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
  }
}

/// Copy the project into an alpine image, build it and export `dist/`.
pub const BUILD_SCRIPT: &str = r#"{
  "steps": [
    { "name": "base", "call": "base", "image": "alpine:3" },
    { "name": "source", "call": "mount", "container": "base", "path": "/src",
      "host_path": ".", "exclude": ["kiln.json"] },
    { "name": "workdir", "call": "set_workdir", "container": "source", "path": "/src" },
    { "name": "build", "call": "exec", "container": "workdir",
      "args": ["/bin/sh", "-c", "mkdir -p dist && cp app.txt dist/ && echo building"] },
    { "name": "dist", "call": "directory", "container": "build", "path": "./dist" }
  ]
}"#;
