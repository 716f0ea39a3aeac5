//! Advisory locking of the engine root.
//!
//! Builds hold the lock shared so several can run side by side; garbage
//! collection holds it exclusive so it never deletes a snapshot a running
//! build is about to reference.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const LOCK_FILENAME: &str = ".lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  Shared,
  Exclusive,
}

/// Written by exclusive holders so contenders can say who is in the way.
#[derive(Debug, Serialize, Deserialize)]
pub struct LockMetadata {
  pub pid: u32,
  pub started_at_unix: u64,
  pub command: String,
  pub root: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreLockError {
  #[error(
    "engine root is locked by another process: {command} (pid {pid}, started {started_at})\n\
     if no kiln process is running, remove the lock file:\n  {lock_path}"
  )]
  Contention {
    command: String,
    pid: u32,
    started_at: String,
    lock_path: PathBuf,
  },

  #[error(
    "engine root is locked by another process\n\
     if no kiln process is running, remove the lock file:\n  {lock_path}"
  )]
  ContentionUnknown { lock_path: PathBuf },

  #[error("failed to create engine root {path}: {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to open lock file: {0}")]
  OpenFile(#[source] io::Error),

  #[error("failed to write lock metadata: {0}")]
  WriteMetadata(#[source] io::Error),

  #[error("failed to acquire lock: {0}")]
  LockFailed(#[source] io::Error),
}

/// Held lock; released when dropped.
pub struct StoreLock {
  file: File,
  lock_path: PathBuf,
  mode: LockMode,
}

impl StoreLock {
  /// Take the lock on `root` without blocking.
  pub fn acquire(root: &Path, mode: LockMode, command: &str) -> Result<Self, StoreLockError> {
    std::fs::create_dir_all(root).map_err(|source| StoreLockError::CreateDir {
      path: root.to_path_buf(),
      source,
    })?;
    let lock_path = root.join(LOCK_FILENAME);

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(StoreLockError::OpenFile)?;

    if let Err(err) = try_lock(&file, mode) {
      if err.kind() == io::ErrorKind::WouldBlock {
        return Err(contention_error(&lock_path));
      }
      return Err(StoreLockError::LockFailed(err));
    }

    if mode == LockMode::Exclusive {
      write_metadata(&file, command, root)?;
    }

    debug!(path = %lock_path.display(), ?mode, command, "engine root locked");
    Ok(StoreLock { file, lock_path, mode })
  }

  /// Metadata as written by this holder. Only exclusive holders write any.
  pub fn read_metadata(&self) -> io::Result<LockMetadata> {
    let mut file = &self.file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }

  pub fn mode(&self) -> LockMode {
    self.mode
  }
}

fn write_metadata(file: &File, command: &str, root: &Path) -> Result<(), StoreLockError> {
  let metadata = LockMetadata {
    pid: std::process::id(),
    started_at_unix: SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .unwrap_or_default()
      .as_secs(),
    command: command.to_string(),
    root: root.to_path_buf(),
  };

  file.set_len(0).map_err(StoreLockError::WriteMetadata)?;
  let mut writer = io::BufWriter::new(file);
  serde_json::to_writer_pretty(&mut writer, &metadata)
    .map_err(|e| StoreLockError::WriteMetadata(io::Error::other(e)))?;
  writer.flush().map_err(StoreLockError::WriteMetadata)?;
  Ok(())
}

fn contention_error(lock_path: &Path) -> StoreLockError {
  if let Ok(mut file) = File::open(lock_path) {
    let mut contents = String::new();
    if file.read_to_string(&mut contents).is_ok()
      && let Ok(metadata) = serde_json::from_str::<LockMetadata>(&contents)
    {
      let started = UNIX_EPOCH + std::time::Duration::from_secs(metadata.started_at_unix);
      return StoreLockError::Contention {
        command: metadata.command,
        pid: metadata.pid,
        started_at: humantime::format_rfc3339_seconds(started).to_string(),
        lock_path: lock_path.to_path_buf(),
      };
    }
  }

  StoreLockError::ContentionUnknown {
    lock_path: lock_path.to_path_buf(),
  }
}

#[cfg(unix)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  let operation = match mode {
    LockMode::Shared => FlockOperation::NonBlockingLockShared,
    LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
  };

  flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};

  let handle = file.as_raw_handle() as HANDLE;
  let flags = match mode {
    LockMode::Shared => LOCKFILE_FAIL_IMMEDIATELY,
    LockMode::Exclusive => LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK,
  };

  // SAFETY: OVERLAPPED is valid zero-initialized and the handle is open.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(handle, flags, 0, 1, 0, &mut overlapped)
  };

  if result == 0 {
    Err(io::Error::last_os_error())
  } else {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn creates_the_root_and_lock_file() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("engine");

    let lock = StoreLock::acquire(&root, LockMode::Shared, "kiln run").unwrap();

    assert!(lock.lock_path().exists());
    assert_eq!(lock.mode(), LockMode::Shared);
  }

  #[test]
  fn shared_locks_coexist() {
    let temp = TempDir::new().unwrap();
    let _a = StoreLock::acquire(temp.path(), LockMode::Shared, "kiln run a.json").unwrap();
    let _b = StoreLock::acquire(temp.path(), LockMode::Shared, "kiln run b.json").unwrap();
  }

  #[test]
  fn exclusive_holder_writes_metadata() {
    let temp = TempDir::new().unwrap();
    let lock = StoreLock::acquire(temp.path(), LockMode::Exclusive, "kiln gc").unwrap();

    let metadata = lock.read_metadata().unwrap();
    assert_eq!(metadata.command, "kiln gc");
    assert_eq!(metadata.pid, std::process::id());
    assert_eq!(metadata.root, temp.path());
  }

  #[cfg(unix)]
  #[test]
  fn contention_names_the_holder() {
    let temp = TempDir::new().unwrap();
    let _held = StoreLock::acquire(temp.path(), LockMode::Exclusive, "kiln gc").unwrap();

    // flock locks belong to the open file description, so a second open in
    // the same process contends like another process would.
    let err = StoreLock::acquire(temp.path(), LockMode::Shared, "kiln run").err().unwrap();
    match err {
      StoreLockError::Contention { command, pid, .. } => {
        assert_eq!(command, "kiln gc");
        assert_eq!(pid, std::process::id());
      }
      other => panic!("expected contention, got {}", other),
    }
  }

  #[test]
  fn released_on_drop() {
    let temp = TempDir::new().unwrap();
    {
      let _lock = StoreLock::acquire(temp.path(), LockMode::Exclusive, "kiln gc").unwrap();
    }
    StoreLock::acquire(temp.path(), LockMode::Exclusive, "kiln gc").unwrap();
  }
}
