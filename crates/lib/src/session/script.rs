//! Pipeline scripts: a JSON list of named session calls.
//!
//! ```json
//! {
//!   "steps": [
//!     { "name": "node", "call": "base", "image": "node:16-slim" },
//!     { "name": "src", "call": "mount", "container": "node", "path": "/src",
//!       "host_path": ".", "exclude": ["node_modules/", "ci/"] },
//!     { "name": "build", "call": "exec", "container": "src", "args": ["npm", "run", "build"] },
//!     { "name": "dist", "call": "directory", "container": "build", "path": "./build" }
//!   ]
//! }
//! ```
//!
//! Steps refer to earlier steps by name. `directory`, `publish` and
//! `resolve` steps are evaluated when reached; everything else only extends
//! the graph.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::execute::ResolvedResult;
use crate::filter::CopyFilter;
use crate::graph::{NodeRef, OutputKind};

use super::{Session, SessionError};

#[derive(Debug, Error)]
pub enum ScriptError {
  #[error("failed to read pipeline script {path}: {source}")]
  Read {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid pipeline script: {0}")]
  Parse(#[from] serde_json::Error),

  #[error("step {index}: {message}")]
  Invalid { index: usize, message: String },

  #[error("step '{step}' failed: {source}")]
  Step {
    step: String,
    #[source]
    source: SessionError,
  },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineScript {
  pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
  pub name: String,
  #[serde(flatten)]
  pub call: Call,
}

/// One session call. Fields naming another step hold that step's name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum Call {
  Base {
    image: String,
  },
  Mount {
    container: String,
    path: String,
    host_path: String,
    #[serde(default)]
    exclude: Vec<String>,
  },
  SetWorkdir {
    container: String,
    path: String,
  },
  Exec {
    container: String,
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
  },
  Directory {
    container: String,
    path: String,
  },
  CopyInto {
    container: String,
    path: String,
    directory: String,
    #[serde(default)]
    exclude: Vec<String>,
  },
  Publish {
    container: String,
    reference: String,
  },
  Resolve {
    node: String,
  },
}

impl Call {
  fn name(&self) -> &'static str {
    match self {
      Call::Base { .. } => "base",
      Call::Mount { .. } => "mount",
      Call::SetWorkdir { .. } => "set_workdir",
      Call::Exec { .. } => "exec",
      Call::Directory { .. } => "directory",
      Call::CopyInto { .. } => "copy_into",
      Call::Publish { .. } => "publish",
      Call::Resolve { .. } => "resolve",
    }
  }

  /// What the step produces.
  fn output(&self) -> Option<OutputKind> {
    match self {
      Call::Base { .. } | Call::Mount { .. } | Call::SetWorkdir { .. } | Call::Exec { .. } | Call::CopyInto { .. } => {
        Some(OutputKind::Container)
      }
      Call::Directory { .. } => Some(OutputKind::Directory),
      Call::Publish { .. } => Some(OutputKind::Image),
      Call::Resolve { .. } => None,
    }
  }

  /// Referenced steps and the output kind each must have.
  fn references(&self) -> Vec<(&str, Option<OutputKind>)> {
    match self {
      Call::Base { .. } => vec![],
      Call::Mount { container, .. }
      | Call::SetWorkdir { container, .. }
      | Call::Exec { container, .. }
      | Call::Directory { container, .. }
      | Call::Publish { container, .. } => vec![(container.as_str(), Some(OutputKind::Container))],
      Call::CopyInto { container, directory, .. } => vec![
        (container.as_str(), Some(OutputKind::Container)),
        (directory.as_str(), Some(OutputKind::Directory)),
      ],
      Call::Resolve { node } => vec![(node.as_str(), None)],
    }
  }
}

/// What running one step produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
  pub name: String,
  pub call: &'static str,
  pub node: String,
  /// Present for steps that were evaluated.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub output: Option<String>,
}

impl fmt::Display for StepOutcome {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} ({}) {}", self.name, self.call, self.node)?;
    if let Some(output) = &self.output {
      write!(f, " -> {}", output)?;
    }
    Ok(())
  }
}

impl PipelineScript {
  pub fn load(path: &Path) -> Result<Self, ScriptError> {
    let content = fs::read_to_string(path).map_err(|source| ScriptError::Read {
      path: path.display().to_string(),
      source,
    })?;
    Self::parse(&content)
  }

  /// Parse and validate a script.
  pub fn parse(content: &str) -> Result<Self, ScriptError> {
    let script: PipelineScript = serde_json::from_str(content)?;
    script.validate()?;
    Ok(script)
  }

  /// Check names are unique and every reference names an earlier step of
  /// the right kind.
  pub fn validate(&self) -> Result<(), ScriptError> {
    let mut outputs: HashMap<&str, Option<OutputKind>> = HashMap::new();

    for (index, step) in self.steps.iter().enumerate() {
      let invalid = |message: String| ScriptError::Invalid { index, message };

      if step.name.trim().is_empty() {
        return Err(invalid("step name is empty".to_string()));
      }

      for (reference, expected) in step.call.references() {
        let Some(found) = outputs.get(reference) else {
          return Err(invalid(format!(
            "'{}' refers to unknown step '{}'",
            step.name, reference
          )));
        };
        match (expected, found) {
          (_, None) => {
            return Err(invalid(format!(
              "'{}' refers to '{}', which produces nothing",
              step.name, reference
            )));
          }
          (Some(expected), Some(found)) if expected != *found => {
            return Err(invalid(format!(
              "'{}' needs a {} but '{}' produces a {}",
              step.name, expected, reference, found
            )));
          }
          _ => {}
        }
      }

      if outputs.insert(&step.name, step.call.output()).is_some() {
        return Err(invalid(format!("duplicate step name '{}'", step.name)));
      }
    }
    Ok(())
  }

  /// Add every step to the session's graph without evaluating anything.
  pub fn plan(&self, session: &Session) -> Result<Vec<(String, NodeRef)>, ScriptError> {
    let mut nodes: HashMap<&str, NodeRef> = HashMap::new();
    let mut planned = Vec::with_capacity(self.steps.len());

    for step in &self.steps {
      let node = self.build(session, step, &nodes).map_err(|source| ScriptError::Step {
        step: step.name.clone(),
        source,
      })?;
      nodes.insert(&step.name, node.clone());
      planned.push((step.name.clone(), node));
    }
    Ok(planned)
  }

  /// Run every step in order, evaluating the ones that request a value.
  pub async fn run(&self, session: &Session) -> Result<Vec<StepOutcome>, ScriptError> {
    let mut nodes: HashMap<&str, NodeRef> = HashMap::new();
    let mut outcomes = Vec::with_capacity(self.steps.len());

    for step in &self.steps {
      let fail = |source: SessionError| ScriptError::Step {
        step: step.name.clone(),
        source,
      };

      let node = self.build(session, step, &nodes).map_err(fail)?;
      let output = match &step.call {
        Call::Directory { .. } | Call::Publish { .. } | Call::Resolve { .. } => {
          let result = session.resolve(&node).await.map_err(fail)?;
          Some(describe(&result))
        }
        _ => None,
      };

      let outcome = StepOutcome {
        name: step.name.clone(),
        call: step.call.name(),
        node: node.to_string(),
        output,
      };
      info!(step = %outcome.name, call = outcome.call, node = %outcome.node, "step done");
      outcomes.push(outcome);

      nodes.insert(&step.name, node);
    }
    Ok(outcomes)
  }

  fn build(&self, session: &Session, step: &Step, nodes: &HashMap<&str, NodeRef>) -> Result<NodeRef, SessionError> {
    // validate() guarantees every reference is present.
    let get = |name: &str| nodes[name].clone();

    match &step.call {
      Call::Base { image } => session.base(image),
      Call::Mount {
        container,
        path,
        host_path,
        exclude,
      } => session.mount(&get(container), path, host_path, exclude),
      Call::SetWorkdir { container, path } => session.set_workdir(&get(container), path),
      Call::Exec { container, args, env } => session.exec_with_env(&get(container), args, env.clone()),
      Call::Directory { container, path } => session.directory_node(&get(container), path),
      Call::CopyInto {
        container,
        path,
        directory,
        exclude,
      } => session.copy_into(&get(container), path, &get(directory), CopyFilter::exclude(exclude)),
      Call::Publish { container, reference } => session.publish_node(&get(container), reference),
      Call::Resolve { node } => Ok(get(node)),
    }
  }
}

fn describe(result: &ResolvedResult) -> String {
  match result {
    ResolvedResult::Container { rootfs, .. } => format!("container {}", rootfs.short()),
    ResolvedResult::Directory { snapshot } => format!("directory {}", snapshot.short()),
    ResolvedResult::Exec { exit_code, .. } => format!("exit {}", exit_code),
    ResolvedResult::Published { reference } => reference.clone(),
  }
}
