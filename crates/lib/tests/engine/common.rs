//! Shared test helpers for engine integration tests.

use std::fs;
use std::path::{Path, PathBuf};

use kiln_lib::config::EngineConfig;
use kiln_lib::events::EngineEvent;
use kiln_lib::graph::OperationKind;
use kiln_lib::session::Session;
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Isolated engine root plus a host project directory.
pub struct TestEngine {
  pub temp: TempDir,
}

impl TestEngine {
  /// An engine with `node:16-slim` and `nginx:1.23-alpine` images and a
  /// small web project on the host.
  pub fn new() -> Self {
    let engine = Self {
      temp: TempDir::new().unwrap(),
    };

    engine.install_image("node", "16-slim", &[("etc/os-release", "ID=debian\n")], Some(NODE_CONFIG));
    engine.install_image(
      "nginx",
      "1.23-alpine",
      &[
        ("etc/os-release", "ID=alpine\n"),
        ("usr/share/nginx/html/50x.html", "<h1>error</h1>\n"),
      ],
      None,
    );

    engine.write_project("package.json", r#"{"name": "hello"}"#);
    engine.write_project("src/index.html", "<h1>hello</h1>\n");
    engine.write_project("node_modules/stale/index.js", "stale");
    engine.write_project("ci/pipeline.json", "{}");
    engine
  }

  pub fn root(&self) -> PathBuf {
    self.temp.path().join("engine")
  }

  pub fn project(&self) -> PathBuf {
    self.temp.path().join("project")
  }

  pub fn config(&self) -> EngineConfig {
    EngineConfig {
      root: self.root(),
      host_workdir: self.project(),
      parallelism: 4,
      persist_cache: true,
      ..EngineConfig::default()
    }
  }

  pub fn session(&self) -> Session {
    Session::new(self.config())
  }

  pub fn install_image(&self, name: &str, tag: &str, files: &[(&str, &str)], config: Option<&str>) {
    let dir = self.root().join("images").join(name).join(tag);
    for (rel, content) in files {
      write(&dir.join("rootfs").join(rel), content);
    }
    fs::create_dir_all(dir.join("rootfs")).unwrap();
    if let Some(config) = config {
      write(&dir.join("config.json"), config);
    }
  }

  pub fn write_project(&self, rel: &str, content: &str) {
    write(&self.project().join(rel), content);
  }
}

const NODE_CONFIG: &str = r#"{"workdir": "/", "env": {"NODE_VERSION": "16.20.2"}}"#;

fn write(path: &Path, content: &str) {
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).unwrap();
  }
  fs::write(path, content).unwrap();
}

pub fn args(list: &[&str]) -> Vec<String> {
  list.iter().map(|s| s.to_string()).collect()
}

pub fn sh(script: &str) -> Vec<String> {
  args(&["/bin/sh", "-c", script])
}

/// Events received so far.
pub fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
  let mut events = Vec::new();
  while let Ok(event) = rx.try_recv() {
    events.push(event);
  }
  events
}

/// Number of executor invocations for nodes of `kind`.
pub fn started(events: &[EngineEvent], kind: OperationKind) -> usize {
  events
    .iter()
    .filter(|e| matches!(e, EngineEvent::NodeStarted { node } if node.kind == kind))
    .count()
}
