//! Implementation of the `kiln run` command.
//!
//! Runs a pipeline script against a fresh session, streaming progress to
//! stderr, then applies the cache policy.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use kiln_lib::config::EngineConfig;
use kiln_lib::session::Session;
use kiln_lib::session::script::{PipelineScript, StepOutcome};
use kiln_lib::store_lock::{LockMode, StoreLock};

use crate::output::{
  OutputFormat, format_duration, print_error, print_event, print_json, print_stat, print_success, print_warning,
};

#[derive(Serialize)]
struct RunReport {
  steps: Vec<StepOutcome>,
  cache_entries: usize,
  cache_entries_evicted: usize,
  duration_ms: u64,
}

pub fn cmd_run(script_path: &Path, config: EngineConfig, quiet: bool, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let script = PipelineScript::load(script_path)
    .with_context(|| format!("Failed to load pipeline script: {}", script_path.display()))?;

  debug!(script = %script_path.display(), steps = script.steps.len(), "pipeline script loaded");

  let _lock = StoreLock::acquire(&config.root, LockMode::Shared, "run").context("Failed to acquire store lock")?;

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let session = Session::new(config);

  let outcome = rt.block_on(async {
    let mut events = session.subscribe();
    let run = script.run(&session);
    tokio::pin!(run);

    let mut open = true;
    let result = loop {
      tokio::select! {
        result = &mut run => break Some(result),
        _ = tokio::signal::ctrl_c() => break None,
        event = events.recv(), if open => match event {
          Ok(event) => {
            if !output.is_json() {
              print_event(&event, quiet);
            }
          }
          Err(RecvError::Lagged(missed)) => print_warning(&format!("{} progress events dropped", missed)),
          Err(RecvError::Closed) => open = false,
        },
      }
    };

    while let Ok(event) = events.try_recv() {
      if !output.is_json() {
        print_event(&event, quiet);
      }
    }
    result
  });

  // The run future was dropped on interrupt. Each abandoned request
  // withdrew from its executions, so their processes are already being
  // killed; shutting the runtime down reaps them.
  let Some(result) = outcome else {
    bail!("Interrupted");
  };

  let steps = match result {
    Ok(steps) => steps,
    Err(e) => {
      if !output.is_json() {
        print_error(&e.to_string());
      }
      return Err(e).context("Pipeline failed");
    }
  };

  let evicted = session.cache().evict();
  info!(
    evicted = evicted.removed(),
    pinned_skipped = evicted.pinned_skipped,
    remaining = session.cache().len(),
    "cache policy applied"
  );

  if output.is_json() {
    print_json(&RunReport {
      cache_entries: session.cache().len(),
      cache_entries_evicted: evicted.removed(),
      duration_ms: start.elapsed().as_millis() as u64,
      steps,
    })?;
  } else {
    println!();
    for step in steps.iter().filter(|s| s.output.is_some()) {
      println!("{}", step);
    }
    println!();
    print_success("Pipeline complete!");
    print_stat("Steps", &steps.len().to_string());
    print_stat("Cache entries", &session.cache().len().to_string());
    if evicted.removed() > 0 {
      print_stat("Evicted", &evicted.removed().to_string());
    }
    print_stat("Duration", &format_duration(start.elapsed()));
  }

  Ok(())
}
