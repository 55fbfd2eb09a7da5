//! Advisory lock on a store root.
//!
//! A run holds the exclusive lock for its whole lifetime so two orchestrator
//! processes never interleave writes to the cache index. Read-only commands
//! (`cache stats`) take a shared lock. The lock file records who holds it so
//! a contended caller can say which process is in the way.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const LOCK_FILENAME: &str = "store.lock";
const HOLDER_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
  Shared,
  Exclusive,
}

/// Who holds an exclusive lock. Written into the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
  pub version: u32,
  pub pid: u32,
  pub command: String,
  pub acquired_at_unix: u64,
}

impl LockHolder {
  fn current(command: &str) -> Self {
    Self {
      version: HOLDER_FORMAT_VERSION,
      pid: std::process::id(),
      command: command.to_string(),
      acquired_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
    }
  }

  /// RFC 3339 acquisition time.
  pub fn acquired_at(&self) -> String {
    let at = UNIX_EPOCH + Duration::from_secs(self.acquired_at_unix);
    humantime::format_rfc3339_seconds(at).to_string()
  }
}

#[derive(Debug, Error)]
pub enum StoreLockError {
  #[error(
    "store {store} is in use by '{}' (pid {}, since {}); remove {lock_path} if that process is gone",
    .holder.command,
    .holder.pid,
    .holder.acquired_at()
  )]
  Held {
    store: PathBuf,
    holder: LockHolder,
    lock_path: PathBuf,
  },

  #[error("store {store} is in use by another process; remove {lock_path} if none is running")]
  HeldByUnknown { store: PathBuf, lock_path: PathBuf },

  #[error("cannot create store directory {path}: {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("cannot open lock file {path}: {source}")]
  Open {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("cannot record lock holder in {path}: {source}")]
  RecordHolder {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("cannot lock {path}: {source}")]
  Lock {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// A held lock on a store root; released on drop.
#[derive(Debug)]
pub struct StoreLock {
  file: File,
  path: PathBuf,
  mode: LockMode,
}

impl StoreLock {
  /// Lock `store` without waiting, creating the directory if needed.
  ///
  /// `command` is recorded for exclusive locks and shown to contending
  /// callers.
  pub fn acquire(store: &Path, mode: LockMode, command: &str) -> Result<Self, StoreLockError> {
    std::fs::create_dir_all(store).map_err(|source| StoreLockError::CreateDir {
      path: store.to_path_buf(),
      source,
    })?;

    let path = store.join(LOCK_FILENAME);
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&path)
      .map_err(|source| StoreLockError::Open {
        path: path.clone(),
        source,
      })?;

    match try_lock(&file, mode) {
      Ok(()) => {}
      Err(e) if is_contention(&e) => return Err(contention(store, &path)),
      Err(source) => return Err(StoreLockError::Lock { path, source }),
    }

    let lock = StoreLock { file, path, mode };
    if mode == LockMode::Exclusive {
      lock.record_holder(&LockHolder::current(command))?;
    }

    debug!(store = %store.display(), ?mode, command, "store locked");
    Ok(lock)
  }

  pub fn mode(&self) -> LockMode {
    self.mode
  }

  pub fn lock_path(&self) -> &Path {
    &self.path
  }

  /// The recorded holder, read through the held handle.
  ///
  /// Opening a second handle would fail on Windows while the lock is held.
  pub fn holder(&self) -> io::Result<LockHolder> {
    let mut file = &self.file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  fn record_holder(&self, holder: &LockHolder) -> Result<(), StoreLockError> {
    let err = |source| StoreLockError::RecordHolder {
      path: self.path.clone(),
      source,
    };
    let mut file = &self.file;
    file.set_len(0).map_err(err)?;
    file.seek(SeekFrom::Start(0)).map_err(err)?;
    serde_json::to_writer(&mut file, holder).map_err(|e| err(io::Error::other(e)))?;
    file.flush().map_err(err)
  }
}

fn contention(store: &Path, lock_path: &Path) -> StoreLockError {
  let holder = std::fs::read_to_string(lock_path)
    .ok()
    .and_then(|contents| serde_json::from_str::<LockHolder>(&contents).ok());

  match holder {
    Some(holder) => {
      warn!(store = %store.display(), pid = holder.pid, command = %holder.command, "store is locked");
      StoreLockError::Held {
        store: store.to_path_buf(),
        holder,
        lock_path: lock_path.to_path_buf(),
      }
    }
    None => StoreLockError::HeldByUnknown {
      store: store.to_path_buf(),
      lock_path: lock_path.to_path_buf(),
    },
  }
}

#[cfg(unix)]
fn is_contention(e: &io::Error) -> bool {
  e.kind() == io::ErrorKind::WouldBlock
}

#[cfg(windows)]
fn is_contention(e: &io::Error) -> bool {
  use windows_sys::Win32::Foundation::ERROR_LOCK_VIOLATION;
  e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32)
}

#[cfg(unix)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  let operation = match mode {
    LockMode::Shared => FlockOperation::NonBlockingLockShared,
    LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
  };
  flock(file.as_fd(), operation).map_err(io::Error::from)
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

  // SAFETY: the handle is valid for the lifetime of `file` and a zeroed
  // OVERLAPPED is a valid argument.
  let locked = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(handle, flags, 0, 1, 0, &mut overlapped)
  };

  if locked == 0 {
    Err(io::Error::last_os_error())
  } else {
    Ok(())
  }
}
