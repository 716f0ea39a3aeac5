//! CLI output formatting utilities.
//!
//! Colored status lines, build progress, and human-readable sizes and
//! durations. Progress and process output go to stderr so stdout stays
//! parseable.

use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream};

use kiln_lib::events::{EngineEvent, LogStream};
use kiln_lib::graph::NodeSummary;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
  pub const ARROW: &str = "→";
  pub const CACHED: &str = "=";
  pub const PIPE: &str = "│";
}

pub fn truncate_hash(hash: &str) -> &str {
  let len = hash.len().min(12);
  &hash[..len]
}

pub fn format_bytes(bytes: u64) -> String {
  const UNITS: [&str; 3] = ["KB", "MB", "GB"];

  if bytes < 1024 {
    return format!("{} B", bytes);
  }
  let mut value = bytes as f64 / 1024.0;
  let mut unit = 0;
  while value >= 1024.0 && unit + 1 < UNITS.len() {
    value /= 1024.0;
    unit += 1;
  }
  format!("{:.1} {}", value, UNITS[unit])
}

pub fn format_duration(duration: Duration) -> String {
  let secs = duration.as_secs();
  let millis = duration.subsec_millis();

  if secs >= 60 {
    let mins = secs / 60;
    let remaining_secs = secs % 60;
    format!("{}m {}s", mins, remaining_secs)
  } else if secs > 0 {
    format!("{}.{:02}s", secs, millis / 10)
  } else {
    format!("{}ms", millis)
  }
}

pub fn print_success(message: &str) {
  println!(
    "{} {}",
    symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
    message
  );
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_warning(message: &str) {
  eprintln!(
    "{} {}",
    symbols::WARNING.if_supports_color(Stream::Stderr, |s| s.yellow()),
    message.if_supports_color(Stream::Stderr, |s| s.yellow())
  );
}

pub fn print_info(message: &str) {
  println!(
    "{} {}",
    symbols::INFO.if_supports_color(Stream::Stdout, |s| s.blue()),
    message
  );
}

pub fn print_stat(label: &str, value: &str) {
  println!(
    "  {}: {}",
    label.if_supports_color(Stream::Stdout, |s| s.dimmed()),
    value
  );
}

fn node_label(node: &NodeSummary) -> String {
  format!("{} {}", node.kind, truncate(&node.params, 60))
}

fn truncate(text: &str, max: usize) -> String {
  if text.chars().count() <= max {
    return text.to_string();
  }
  let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
  out.push('…');
  out
}

/// One progress line for a build event. Process output is skipped when
/// `quiet`.
pub fn print_event(event: &EngineEvent, quiet: bool) {
  match event {
    EngineEvent::NodeStarted { node } => eprintln!(
      "{} {}",
      symbols::ARROW.if_supports_color(Stream::Stderr, |s| s.cyan()),
      node_label(node)
    ),
    EngineEvent::NodeCached { node } => eprintln!(
      "{} {} {}",
      symbols::CACHED.if_supports_color(Stream::Stderr, |s| s.dimmed()),
      node_label(node),
      "(cached)".if_supports_color(Stream::Stderr, |s| s.dimmed())
    ),
    EngineEvent::NodeCompleted { node, duration_ms } => eprintln!(
      "{} {} {}",
      symbols::SUCCESS.if_supports_color(Stream::Stderr, |s| s.green()),
      node_label(node),
      format_duration(Duration::from_millis(*duration_ms)).if_supports_color(Stream::Stderr, |s| s.dimmed())
    ),
    EngineEvent::NodeFailed { node, error } => eprintln!(
      "{} {}: {}",
      symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
      node_label(node),
      error.if_supports_color(Stream::Stderr, |s| s.red())
    ),
    EngineEvent::Log { stream, line, .. } if !quiet => {
      let pipe = match stream {
        LogStream::Stdout => symbols::PIPE.if_supports_color(Stream::Stderr, |s| s.dimmed()).to_string(),
        LogStream::Stderr => symbols::PIPE.if_supports_color(Stream::Stderr, |s| s.yellow()).to_string(),
      };
      eprintln!("  {} {}", pipe, line);
    }
    EngineEvent::Log { .. } => {}
  }
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}
