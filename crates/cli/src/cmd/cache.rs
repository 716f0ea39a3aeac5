//! Implementation of the `kiln cache` commands.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use kiln_lib::cache::{CachePolicy, CacheStore};
use kiln_lib::config::EngineConfig;
use kiln_lib::store_lock::{LockMode, StoreLock};

use crate::output::{OutputFormat, format_bytes, print_info, print_json, print_stat, print_success, truncate_hash};

fn open(config: &EngineConfig) -> Result<CacheStore> {
  CacheStore::open(config.paths().cache(), CachePolicy::unbounded()).context("Failed to open cache")
}

pub fn cmd_cache_list(config: &EngineConfig, output: OutputFormat) -> Result<()> {
  let _lock = StoreLock::acquire(&config.root, LockMode::Shared, "cache list").context("Failed to acquire store lock")?;
  let cache = open(config)?;
  let entries = cache.entries();

  if output.is_json() {
    return print_json(&entries);
  }

  if entries.is_empty() {
    print_info("Cache is empty");
    return Ok(());
  }

  for entry in &entries {
    let used = humantime::format_duration(std::time::Duration::from_secs(
      now_secs().saturating_sub(entry.last_accessed),
    ));
    println!(
      "{}  {:<9}  {:>9}  used {} ago",
      truncate_hash(&entry.key.0),
      entry.result.type_name(),
      format_bytes(entry.size_bytes),
      used
    );
  }
  println!();
  print_stat("Entries", &entries.len().to_string());
  print_stat("Size", &format_bytes(cache.total_bytes()));
  Ok(())
}

#[derive(Serialize)]
struct ClearReport {
  removed: usize,
  bytes_freed: u64,
}

/// Drops every entry. Snapshots stay on disk until the next `kiln gc`.
pub fn cmd_cache_clear(config: &EngineConfig, output: OutputFormat) -> Result<()> {
  let _lock = StoreLock::acquire(&config.root, LockMode::Exclusive, "cache clear").context("Failed to acquire store lock")?;
  let cache = open(config)?;
  let stats = cache.clear();
  info!(removed = stats.removed(), pinned_skipped = stats.pinned_skipped, "cache cleared");

  if output.is_json() {
    return print_json(&ClearReport {
      removed: stats.removed(),
      bytes_freed: stats.bytes_freed,
    });
  }

  print_success("Cache cleared");
  print_stat("Entries removed", &stats.removed().to_string());
  print_info("Run `kiln gc` to delete the unreferenced snapshots");
  Ok(())
}

fn now_secs() -> u64 {
  std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .map(|d| d.as_secs())
    .unwrap_or(0)
}
