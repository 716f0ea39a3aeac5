//! Implementation of the `kiln plan` command.
//!
//! Builds a pipeline script's graph without evaluating it and prints, for
//! each step that would be evaluated, the waves of nodes it depends on.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use kiln_lib::config::EngineConfig;
use kiln_lib::graph::{NodeRef, NodeSummary, OperationGraph};
use kiln_lib::session::Session;
use kiln_lib::session::script::{Call, PipelineScript};

use crate::output::{OutputFormat, print_info, print_json, print_stat, truncate_hash};

#[derive(Serialize)]
struct PlannedTarget {
  step: String,
  waves: Vec<Vec<NodeSummary>>,
}

#[derive(Serialize)]
struct Plan {
  steps: usize,
  nodes: usize,
  targets: Vec<PlannedTarget>,
}

pub fn cmd_plan(script_path: &Path, config: EngineConfig, output: OutputFormat) -> Result<()> {
  let script = PipelineScript::load(script_path)
    .with_context(|| format!("Failed to load pipeline script: {}", script_path.display()))?;

  // Planning never reads or writes the engine root.
  let session = Session::new(EngineConfig {
    persist_cache: false,
    ..config
  });
  let planned = script.plan(&session).context("Failed to build graph")?;

  let mut targets = Vec::new();
  for (step, (name, node)) in script.steps.iter().zip(&planned) {
    if matches!(step.call, Call::Directory { .. } | Call::Publish { .. } | Call::Resolve { .. }) {
      targets.push(PlannedTarget {
        step: name.clone(),
        waves: summarize_waves(session.graph(), node)?,
      });
    }
  }

  let plan = Plan {
    steps: script.steps.len(),
    nodes: session.graph().len(),
    targets,
  };

  if output.is_json() {
    return print_json(&plan);
  }

  print_info(&format!("Plan for {}", script_path.display()));
  print_stat("Steps", &plan.steps.to_string());
  print_stat("Nodes", &plan.nodes.to_string());
  for target in &plan.targets {
    println!();
    println!("{}:", target.step);
    for (i, wave) in target.waves.iter().enumerate() {
      println!("  wave {}:", i + 1);
      for node in wave {
        println!("    {} {} [{}]", node.kind, node.params, truncate_hash(&node.fingerprint.0));
      }
    }
  }

  Ok(())
}

fn summarize_waves(graph: &OperationGraph, root: &NodeRef) -> Result<Vec<Vec<NodeSummary>>> {
  let waves = graph.waves(root).context("Failed to order graph")?;
  waves
    .iter()
    .map(|wave| {
      wave
        .iter()
        .map(|node| Ok(NodeSummary::from(&graph.node(node)?)))
        .collect::<Result<Vec<_>, kiln_lib::graph::GraphError>>()
        .context("Failed to read graph node")
    })
    .collect()
}
