//! Implementation of the `kiln gc` command.

use std::time::Instant;

use anyhow::{Context, Result};

use kiln_lib::cache::CacheStore;
use kiln_lib::config::EngineConfig;
use kiln_lib::gc::collect_garbage;
use kiln_lib::snapshot::SnapshotStore;
use kiln_lib::store_lock::{LockMode, StoreLock};

use crate::output::{OutputFormat, format_bytes, format_duration, print_info, print_json, print_stat, print_success};

pub fn cmd_gc(config: &EngineConfig, dry_run: bool, output: OutputFormat) -> Result<()> {
  let start = Instant::now();

  let _lock = StoreLock::acquire(&config.root, LockMode::Exclusive, "gc").context("Failed to acquire store lock")?;

  let paths = config.paths();
  let cache = CacheStore::open(paths.cache(), config.cache_policy.clone()).context("Failed to open cache")?;
  let snapshots = SnapshotStore::new(&paths);

  let result = collect_garbage(&cache, &snapshots, dry_run).context("Garbage collection failed")?;

  if output.is_json() {
    print_json(&result)?;
  } else {
    println!();
    if dry_run {
      print_info("Dry run - no changes made");
    } else {
      print_success("Garbage collection complete!");
    }
    let stats = &result.stats;
    print_stat("Cache entries evicted", &stats.cache_entries_evicted.to_string());
    print_stat(
      "Snapshots removed",
      &format!("{} of {}", stats.snapshots_deleted, stats.snapshots_scanned),
    );
    print_stat("Scratch directories removed", &stats.scratch_deleted.to_string());
    print_stat("Space freed", &format_bytes(stats.total_bytes_freed()));
    print_stat("Duration", &format_duration(start.elapsed()));
  }

  Ok(())
}
