//! Result cache keyed by node cache keys.
//!
//! # Storage Layout
//!
//! ```text
//! {root}/cache/<key>.json   # serialized CacheEntry, written on put
//! ```
//!
//! The in-memory map is authoritative while the process runs. The directory
//! is only read on [`CacheStore::open`]; losing it degrades the store to a
//! purely in-memory cache instead of failing builds.

mod types;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::execute::ResolvedResult;
use crate::util::fs::dir_size;
use crate::util::hash::{ContentHash, Fingerprint};

pub use types::{CacheEntry, CacheError, CachePolicy, EvictStats};

struct Slot {
  entry: Arc<CacheEntry>,
  last_accessed: u64,
  /// Monotonic access counter; breaks ties between accesses in the same second.
  seq: u64,
}

#[derive(Default)]
struct CacheInner {
  slots: HashMap<Fingerprint, Slot>,
  pins: HashMap<Fingerprint, usize>,
  seq: u64,
}

impl CacheInner {
  fn touch(&mut self) -> u64 {
    self.seq += 1;
    self.seq
  }

  fn is_pinned(&self, key: &Fingerprint) -> bool {
    self.pins.get(key).is_some_and(|n| *n > 0)
  }
}

pub struct CacheStore {
  inner: Arc<Mutex<CacheInner>>,
  dir: Option<PathBuf>,
  policy: CachePolicy,
}

impl std::fmt::Debug for CacheStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CacheStore")
      .field("dir", &self.dir)
      .field("policy", &self.policy)
      .field("len", &self.len())
      .finish()
  }
}

impl CacheStore {
  /// A cache that lives only as long as the process.
  pub fn in_memory(policy: CachePolicy) -> Self {
    Self {
      inner: Arc::new(Mutex::new(CacheInner::default())),
      dir: None,
      policy,
    }
  }

  /// A cache persisted under `dir`. Existing entries are loaded; unreadable
  /// ones and ones whose snapshots are gone are dropped.
  pub fn open(dir: impl Into<PathBuf>, policy: CachePolicy) -> Result<Self, CacheError> {
    let dir = dir.into();
    fs::create_dir_all(&dir).map_err(|e| unavailable(&dir, e))?;

    let mut inner = CacheInner::default();
    let mut dropped = 0usize;

    for item in fs::read_dir(&dir).map_err(|e| unavailable(&dir, e))?.flatten() {
      let path = item.path();
      if path.extension().is_none_or(|ext| ext != "json") {
        continue;
      }
      match load_entry(&path) {
        Some(entry) if entry.result.snapshots().iter().all(|s| s.path.is_dir()) => {
          let seq = inner.touch();
          inner.slots.insert(
            entry.key.clone(),
            Slot {
              last_accessed: entry.last_accessed,
              entry: Arc::new(entry),
              seq,
            },
          );
        }
        _ => {
          dropped += 1;
          let _ = fs::remove_file(&path);
        }
      }
    }

    debug!(dir = %dir.display(), entries = inner.slots.len(), dropped, "cache loaded");

    Ok(Self {
      inner: Arc::new(Mutex::new(inner)),
      dir: Some(dir),
      policy,
    })
  }

  pub fn policy(&self) -> &CachePolicy {
    &self.policy
  }

  pub fn dir(&self) -> Option<&Path> {
    self.dir.as_deref()
  }

  pub fn len(&self) -> usize {
    self.inner.lock().slots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn contains(&self, key: &Fingerprint) -> bool {
    self.inner.lock().slots.contains_key(key)
  }

  /// Look up a result and record the access.
  ///
  /// An entry whose snapshots were deleted behind the store's back is
  /// treated as a miss and dropped.
  pub fn get(&self, key: &Fingerprint) -> Option<ResolvedResult> {
    let entry = {
      let mut inner = self.inner.lock();
      let seq = inner.touch();
      let slot = inner.slots.get_mut(key)?;
      slot.last_accessed = now_secs();
      slot.seq = seq;
      Arc::clone(&slot.entry)
    };

    if entry.result.snapshots().iter().all(|s| s.path.is_dir()) {
      debug!(key = %key.short(), "cache hit");
      Some(entry.result.clone())
    } else {
      warn!(key = %key.short(), "cached result refers to missing snapshots; dropping entry");
      self.remove(key);
      None
    }
  }

  /// Store a result, replacing any previous entry for `key`.
  ///
  /// The in-memory insert always happens. An error means the entry could
  /// not be persisted.
  pub fn put(&self, key: &Fingerprint, result: ResolvedResult) -> Result<(), CacheError> {
    let size_bytes = result.snapshots().iter().map(|s| dir_size(&s.path)).sum();
    let now = now_secs();
    let entry = Arc::new(CacheEntry {
      key: key.clone(),
      result,
      created_at: now,
      last_accessed: now,
      size_bytes,
    });

    {
      let mut inner = self.inner.lock();
      let seq = inner.touch();
      inner.slots.insert(
        key.clone(),
        Slot {
          entry: Arc::clone(&entry),
          last_accessed: now,
          seq,
        },
      );
    }
    debug!(key = %key.short(), size_bytes, "cache put");

    match &self.dir {
      Some(dir) => persist(dir, &entry),
      None => Ok(()),
    }
  }

  /// Drop an entry. Pinned entries are removed too; pins only guard
  /// against eviction.
  pub fn remove(&self, key: &Fingerprint) -> Option<CacheEntry> {
    let slot = self.inner.lock().slots.remove(key)?;
    if let Some(dir) = &self.dir {
      let path = entry_path(dir, key);
      if let Err(e) = fs::remove_file(&path)
        && e.kind() != io::ErrorKind::NotFound
      {
        warn!(path = %path.display(), error = %e, "failed to remove cache entry file");
      }
    }
    Some(listed(&slot))
  }

  /// Snapshot of all entries, most recently used first.
  pub fn entries(&self) -> Vec<CacheEntry> {
    let inner = self.inner.lock();
    let mut slots: Vec<&Slot> = inner.slots.values().collect();
    slots.sort_by(|a, b| b.seq.cmp(&a.seq));
    slots.into_iter().map(listed).collect()
  }

  pub fn total_bytes(&self) -> u64 {
    self.inner.lock().slots.values().map(|s| s.entry.size_bytes).sum()
  }

  /// Protect `key` from eviction until the guard drops.
  pub fn pin(&self, key: &Fingerprint) -> PinGuard {
    *self.inner.lock().pins.entry(key.clone()).or_insert(0) += 1;
    PinGuard {
      inner: Arc::clone(&self.inner),
      key: key.clone(),
    }
  }

  pub fn is_pinned(&self, key: &Fingerprint) -> bool {
    self.inner.lock().is_pinned(key)
  }

  /// Apply the policy: drop expired entries, then least recently used ones
  /// until the entry and byte bounds hold. Pinned entries always stay.
  pub fn evict(&self) -> EvictStats {
    self.evict_with(&self.policy, now_secs())
  }

  /// Remove every unpinned entry.
  pub fn clear(&self) -> EvictStats {
    let policy = CachePolicy {
      max_entries: Some(0),
      ..Default::default()
    };
    self.evict_with(&policy, now_secs())
  }

  fn evict_with(&self, policy: &CachePolicy, now: u64) -> EvictStats {
    let mut stats = EvictStats::default();
    let mut removed = Vec::new();

    {
      let mut inner = self.inner.lock();

      if let Some(max_age) = policy.max_age {
        let cutoff = now.saturating_sub(max_age.as_secs());
        let expired: Vec<Fingerprint> = inner
          .slots
          .iter()
          .filter(|(_, slot)| slot.entry.created_at < cutoff)
          .map(|(key, _)| key.clone())
          .collect();
        for key in expired {
          if inner.is_pinned(&key) {
            stats.pinned_skipped += 1;
          } else if let Some(slot) = inner.slots.remove(&key) {
            stats.expired += 1;
            stats.bytes_freed += slot.entry.size_bytes;
            removed.push(key);
          }
        }
      }

      let mut lru: Vec<(u64, Fingerprint, u64)> = inner
        .slots
        .iter()
        .map(|(key, slot)| (slot.seq, key.clone(), slot.entry.size_bytes))
        .collect();
      lru.sort();

      let mut count = inner.slots.len();
      let mut bytes: u64 = lru.iter().map(|(_, _, size)| size).sum();
      let over = |count: usize, bytes: u64| {
        policy.max_entries.is_some_and(|max| count > max) || policy.max_bytes.is_some_and(|max| bytes > max)
      };

      for (_, key, size) in lru {
        if !over(count, bytes) {
          break;
        }
        if inner.is_pinned(&key) {
          stats.pinned_skipped += 1;
          continue;
        }
        inner.slots.remove(&key);
        count -= 1;
        bytes = bytes.saturating_sub(size);
        stats.evicted += 1;
        stats.bytes_freed += size;
        removed.push(key);
      }
    }

    if let Some(dir) = &self.dir {
      for key in &removed {
        let _ = fs::remove_file(entry_path(dir, key));
      }
    }

    if stats.removed() > 0 {
      debug!(
        expired = stats.expired,
        evicted = stats.evicted,
        bytes_freed = stats.bytes_freed,
        pinned_skipped = stats.pinned_skipped,
        "cache evicted"
      );
    }
    stats
  }

  /// Digests of every snapshot referenced by a cached result.
  pub fn referenced_snapshots(&self) -> HashSet<ContentHash> {
    self
      .inner
      .lock()
      .slots
      .values()
      .flat_map(|slot| slot.entry.result.snapshots().into_iter().map(|s| s.digest.clone()))
      .collect()
  }
}

/// Keeps a cache key pinned while alive.
#[must_use = "the key is unpinned when the guard drops"]
pub struct PinGuard {
  inner: Arc<Mutex<CacheInner>>,
  key: Fingerprint,
}

impl PinGuard {
  pub fn key(&self) -> &Fingerprint {
    &self.key
  }
}

impl Drop for PinGuard {
  fn drop(&mut self) {
    let mut inner = self.inner.lock();
    if let Some(count) = inner.pins.get_mut(&self.key) {
      *count -= 1;
      if *count == 0 {
        inner.pins.remove(&self.key);
      }
    }
  }
}

fn listed(slot: &Slot) -> CacheEntry {
  CacheEntry {
    last_accessed: slot.last_accessed,
    ..(*slot.entry).clone()
  }
}

fn entry_path(dir: &Path, key: &Fingerprint) -> PathBuf {
  dir.join(format!("{}.json", key.0))
}

fn load_entry(path: &Path) -> Option<CacheEntry> {
  let raw = fs::read_to_string(path).ok()?;
  let entry: CacheEntry = serde_json::from_str(&raw).ok()?;
  let stem = path.file_stem()?.to_str()?;
  (stem == entry.key.0).then_some(entry)
}

fn persist(dir: &Path, entry: &CacheEntry) -> Result<(), CacheError> {
  let path = entry_path(dir, &entry.key);
  let tmp = path.with_extension("json.tmp");
  let encoded = serde_json::to_vec_pretty(entry).map_err(|e| unavailable(&path, io::Error::other(e)))?;

  fs::write(&tmp, encoded)
    .and_then(|_| fs::rename(&tmp, &path))
    .map_err(|e| unavailable(&path, e))
}

fn unavailable(path: &Path, err: io::Error) -> CacheError {
  CacheError::Unavailable {
    path: path.to_path_buf(),
    message: err.to_string(),
  }
}

fn now_secs() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::execute::ImageConfig;
  use crate::snapshot::SnapshotRef;
  use crate::util::hash::hash_directory;
  use std::time::Duration;
  use tempfile::{TempDir, tempdir};

  fn key(n: u8) -> Fingerprint {
    Fingerprint(format!("{:02x}", n).repeat(16))
  }

  fn snapshot(temp: &TempDir, name: &str, bytes: usize) -> SnapshotRef {
    let path = temp.path().join(name);
    fs::create_dir_all(&path).unwrap();
    fs::write(path.join("blob"), vec![b'x'; bytes]).unwrap();
    SnapshotRef {
      digest: hash_directory(&path).unwrap(),
      path,
    }
  }

  fn directory(snap: SnapshotRef) -> ResolvedResult {
    ResolvedResult::Directory { snapshot: snap }
  }

  fn published(name: &str) -> ResolvedResult {
    ResolvedResult::Published {
      reference: name.to_string(),
    }
  }

  #[test]
  fn put_then_get() {
    let temp = tempdir().unwrap();
    let cache = CacheStore::in_memory(CachePolicy::unbounded());
    let result = directory(snapshot(&temp, "a", 10));

    cache.put(&key(1), result.clone()).unwrap();

    assert_eq!(cache.get(&key(1)), Some(result));
    assert_eq!(cache.get(&key(2)), None);
    assert_eq!(cache.entries()[0].size_bytes, 10);
  }

  #[test]
  fn put_replaces_entry() {
    let cache = CacheStore::in_memory(CachePolicy::unbounded());
    cache.put(&key(1), published("a")).unwrap();
    cache.put(&key(1), published("b")).unwrap();

    assert_eq!(cache.len(), 1);
    assert_eq!(cache.get(&key(1)), Some(published("b")));
  }

  #[test]
  fn missing_snapshot_is_a_miss() {
    let temp = tempdir().unwrap();
    let cache = CacheStore::in_memory(CachePolicy::unbounded());
    let snap = snapshot(&temp, "gone", 1);
    cache.put(&key(1), directory(snap.clone())).unwrap();

    fs::remove_dir_all(&snap.path).unwrap();

    assert_eq!(cache.get(&key(1)), None);
    assert!(cache.is_empty());
  }

  #[test]
  fn evict_removes_least_recently_used_first() {
    let cache = CacheStore::in_memory(CachePolicy {
      max_entries: Some(2),
      ..Default::default()
    });
    cache.put(&key(1), published("1")).unwrap();
    cache.put(&key(2), published("2")).unwrap();
    cache.put(&key(3), published("3")).unwrap();
    // Touch 1 so 2 becomes the oldest.
    cache.get(&key(1));

    let stats = cache.evict();

    assert_eq!(stats.evicted, 1);
    assert!(cache.contains(&key(1)));
    assert!(!cache.contains(&key(2)));
    assert!(cache.contains(&key(3)));
  }

  #[test]
  fn evict_respects_byte_bound() {
    let temp = tempdir().unwrap();
    let cache = CacheStore::in_memory(CachePolicy {
      max_bytes: Some(150),
      ..Default::default()
    });
    cache.put(&key(1), directory(snapshot(&temp, "a", 100))).unwrap();
    cache.put(&key(2), directory(snapshot(&temp, "b", 100))).unwrap();

    let stats = cache.evict();

    assert_eq!(stats.bytes_freed, 100);
    assert_eq!(cache.total_bytes(), 100);
    assert!(cache.contains(&key(2)));
  }

  #[test]
  fn pinned_entries_survive_eviction() {
    let cache = CacheStore::in_memory(CachePolicy {
      max_entries: Some(0),
      ..Default::default()
    });
    cache.put(&key(1), published("1")).unwrap();
    cache.put(&key(2), published("2")).unwrap();

    let guard = cache.pin(&key(1));
    let stats = cache.evict();

    assert_eq!(stats.evicted, 1);
    assert_eq!(stats.pinned_skipped, 1);
    assert!(cache.contains(&key(1)));

    drop(guard);
    assert!(!cache.is_pinned(&key(1)));
    cache.evict();
    assert!(cache.is_empty());
  }

  #[test]
  fn pins_are_counted() {
    let cache = CacheStore::in_memory(CachePolicy::unbounded());
    let a = cache.pin(&key(1));
    let b = cache.pin(&key(1));
    drop(a);
    assert!(cache.is_pinned(&key(1)));
    drop(b);
    assert!(!cache.is_pinned(&key(1)));
  }

  #[test]
  fn expired_entries_are_removed() {
    let cache = CacheStore::in_memory(CachePolicy {
      max_age: Some(Duration::from_secs(60)),
      ..Default::default()
    });
    cache.put(&key(1), published("1")).unwrap();

    // Evaluate an hour into the future.
    let stats = cache.evict_with(cache.policy(), now_secs() + 3600);

    assert_eq!(stats.expired, 1);
    assert!(cache.is_empty());
  }

  #[test]
  fn persisted_entries_reload() {
    let temp = tempdir().unwrap();
    let dir = temp.path().join("cache");
    let snap = snapshot(&temp, "snap", 3);
    let result = ResolvedResult::Container {
      rootfs: snap,
      config: ImageConfig::default(),
    };

    {
      let cache = CacheStore::open(&dir, CachePolicy::unbounded()).unwrap();
      cache.put(&key(7), result.clone()).unwrap();
      cache.put(&key(8), published("x")).unwrap();
      cache.remove(&key(8));
    }

    let reopened = CacheStore::open(&dir, CachePolicy::unbounded()).unwrap();
    assert_eq!(reopened.len(), 1);
    assert_eq!(reopened.get(&key(7)), Some(result));
  }

  #[test]
  fn reload_drops_entries_with_missing_snapshots() {
    let temp = tempdir().unwrap();
    let dir = temp.path().join("cache");
    let snap = snapshot(&temp, "snap", 3);

    CacheStore::open(&dir, CachePolicy::unbounded())
      .unwrap()
      .put(&key(1), directory(snap.clone()))
      .unwrap();
    fs::remove_dir_all(&snap.path).unwrap();
    fs::write(dir.join("garbage.json"), "not json").unwrap();

    let reopened = CacheStore::open(&dir, CachePolicy::unbounded()).unwrap();
    assert!(reopened.is_empty());
    assert!(!dir.join("garbage.json").exists());
  }

  #[test]
  fn unwritable_directory_degrades_to_memory() {
    let temp = tempdir().unwrap();
    let dir = temp.path().join("cache");
    let cache = CacheStore::open(&dir, CachePolicy::unbounded()).unwrap();
    fs::remove_dir_all(&dir).unwrap();

    let err = cache.put(&key(1), published("1")).unwrap_err();

    assert!(matches!(err, CacheError::Unavailable { .. }));
    assert_eq!(cache.get(&key(1)), Some(published("1")));
  }

  #[test]
  fn referenced_snapshots_cover_all_entries() {
    let temp = tempdir().unwrap();
    let cache = CacheStore::in_memory(CachePolicy::unbounded());
    let a = snapshot(&temp, "a", 1);
    let b = snapshot(&temp, "b", 2);
    cache.put(&key(1), directory(a.clone())).unwrap();
    cache.put(&key(2), directory(b.clone())).unwrap();
    cache.put(&key(3), published("p")).unwrap();

    let referenced = cache.referenced_snapshots();
    assert_eq!(referenced.len(), 2);
    assert!(referenced.contains(&a.digest) && referenced.contains(&b.digest));
  }
}
