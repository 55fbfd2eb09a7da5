//! Content-addressed cache store.
//!
//! Blobs are stored under their SHA-256 digest, so putting identical content
//! under any number of keys writes it once. An index maps cache keys to blobs
//! and tracks access order for least-recently-used eviction.
//!
//! Entries pinned by an in-flight step are never evicted.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::StoreError;
use crate::util::hash::{ContentHash, hash_bytes};

const INDEX_FILENAME: &str = "index.json";
const INDEX_VERSION: u32 = 1;
const BLOBS_DIR: &str = "blobs";
const TMP_DIR: &str = "tmp";

/// Reference to a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
  pub digest: ContentHash,
  pub size: u64,
}

/// One cache index entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub blob: ContentHash,
  pub size: u64,
  /// Logical access clock; larger is more recent.
  pub last_access: u64,
  pub last_access_unix: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheIndex {
  version: u32,
  tick: u64,
  entries: BTreeMap<ContentHash, CacheEntry>,
}

impl CacheIndex {
  fn new() -> Self {
    Self {
      version: INDEX_VERSION,
      tick: 0,
      entries: BTreeMap::new(),
    }
  }

  fn next_tick(&mut self) -> u64 {
    self.tick += 1;
    self.tick
  }

  /// Total size of distinct blobs referenced by the index.
  fn total_bytes(&self) -> u64 {
    let mut seen: HashMap<&ContentHash, u64> = HashMap::new();
    for entry in self.entries.values() {
      seen.insert(&entry.blob, entry.size);
    }
    seen.values().sum()
  }

  fn blob_referenced(&self, blob: &ContentHash) -> bool {
    self.entries.values().any(|e| &e.blob == blob)
  }
}

/// Eviction policy for [`CacheStore::evict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictPolicy {
  /// Evict least-recently-used entries until the cache fits in `max_bytes`.
  Lru { max_bytes: u64 },
  /// Evict entries not accessed within the given duration.
  OlderThan(Duration),
  /// Evict every unpinned entry.
  All,
}

/// Outcome of an eviction pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct EvictionReport {
  pub entries_removed: usize,
  pub blobs_removed: usize,
  pub bytes_freed: u64,
  /// Entries that matched the policy but were pinned by an in-flight step.
  pub pinned_skipped: usize,
}

/// Snapshot of cache occupancy.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
  pub entries: usize,
  pub total_bytes: u64,
  pub max_bytes: u64,
}

struct CacheState {
  index: CacheIndex,
  pins: HashMap<ContentHash, usize>,
}

/// On-disk, capacity-bounded cache of bundles keyed by cache key.
pub struct CacheStore {
  root: PathBuf,
  max_bytes: u64,
  state: Mutex<CacheState>,
}

impl std::fmt::Debug for CacheStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CacheStore")
      .field("root", &self.root)
      .field("max_bytes", &self.max_bytes)
      .finish()
  }
}

/// Keeps a cache entry safe from eviction while held.
pub struct CachePin<'a> {
  store: &'a CacheStore,
  key: ContentHash,
}

impl Drop for CachePin<'_> {
  fn drop(&mut self) {
    let mut state = self.store.lock();
    if let Some(count) = state.pins.get_mut(&self.key) {
      *count -= 1;
      if *count == 0 {
        state.pins.remove(&self.key);
      }
    }
  }
}

fn unix_now() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs()
}

impl CacheStore {
  /// Open (or create) the cache rooted at `root`.
  ///
  /// Fails if the directory cannot be created or the index is unreadable.
  pub fn open(root: &Path, max_bytes: u64) -> Result<Self, StoreError> {
    for dir in [root.to_path_buf(), root.join(BLOBS_DIR), root.join(TMP_DIR)] {
      fs::create_dir_all(&dir).map_err(|source| StoreError::CreateDir { path: dir.clone(), source })?;
    }

    let index = load_index(&root.join(INDEX_FILENAME))?;
    debug!(root = %root.display(), entries = index.entries.len(), "opened cache store");

    Ok(Self {
      root: root.to_path_buf(),
      max_bytes,
      state: Mutex::new(CacheState {
        index,
        pins: HashMap::new(),
      }),
    })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn max_bytes(&self) -> u64 {
    self.max_bytes
  }

  fn lock(&self) -> MutexGuard<'_, CacheState> {
    // A panic while holding the lock leaves the index consistent (every
    // mutation is a single insert/remove), so poisoning is ignored.
    self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn blob_path(&self, digest: &ContentHash) -> PathBuf {
    self.root.join(BLOBS_DIR).join(&digest.0)
  }

  /// Protect `key` from eviction until the returned guard is dropped.
  pub fn pin(&self, key: &ContentHash) -> CachePin<'_> {
    let mut state = self.lock();
    *state.pins.entry(key.clone()).or_insert(0) += 1;
    CachePin {
      store: self,
      key: key.clone(),
    }
  }

  /// Look up a key, returning the blob if present.
  ///
  /// A hit refreshes the entry's access time. Entries whose blob is missing
  /// or corrupt are dropped and reported as a miss.
  pub fn get(&self, key: &ContentHash) -> Result<Option<Vec<u8>>, StoreError> {
    let blob = {
      let state = self.lock();
      match state.index.entries.get(key) {
        Some(entry) => entry.blob.clone(),
        None => return Ok(None),
      }
    };

    let path = self.blob_path(&blob);
    let data = match fs::read(&path) {
      Ok(data) => data,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        warn!(key = %key.short(), blob = %blob.short(), "cache blob missing, dropping entry");
        self.drop_entry(key)?;
        return Ok(None);
      }
      Err(source) => return Err(StoreError::Read { path, source }),
    };

    if hash_bytes(&data) != blob {
      warn!(key = %key.short(), blob = %blob.short(), "cache blob corrupt, dropping entry");
      self.drop_entry(key)?;
      let _ = fs::remove_file(&path);
      return Ok(None);
    }

    let mut state = self.lock();
    let tick = state.index.next_tick();
    if let Some(entry) = state.index.entries.get_mut(key) {
      entry.last_access = tick;
      entry.last_access_unix = unix_now();
    }
    self.save_index(&state.index)?;

    debug!(key = %key.short(), bytes = data.len(), "cache hit");
    Ok(Some(data))
  }

  /// Store `blob` under `key`.
  ///
  /// The blob file is addressed by its own digest, so identical content is
  /// written once no matter how many keys or concurrent writers share it.
  /// After insertion the cache is trimmed back under capacity.
  pub fn put(&self, key: &ContentHash, blob: &[u8]) -> Result<BlobRef, StoreError> {
    let digest = hash_bytes(blob);
    let size = blob.len() as u64;
    let path = self.blob_path(&digest);

    // Held from the existence check to the insert so an eviction cannot
    // delete the blob in between.
    let mut state = self.lock();
    if !path.exists() {
      self.write_blob(&path, blob)?;
    } else {
      debug!(blob = %digest.short(), "blob already stored");
    }

    let tick = state.index.next_tick();
    state.index.entries.insert(
      key.clone(),
      CacheEntry {
        blob: digest.clone(),
        size,
        last_access: tick,
        last_access_unix: unix_now(),
      },
    );

    let max_bytes = self.max_bytes;
    let report = self.evict_locked(&mut state, EvictPolicy::Lru { max_bytes })?;
    if report.entries_removed > 0 {
      info!(
        removed = report.entries_removed,
        bytes_freed = report.bytes_freed,
        "evicted cache entries to stay under capacity"
      );
    }
    self.save_index(&state.index)?;

    debug!(key = %key.short(), blob = %digest.short(), size, "cache put");
    Ok(BlobRef { digest, size })
  }

  /// Remove entries according to `policy`, never touching pinned entries.
  pub fn evict(&self, policy: EvictPolicy) -> Result<EvictionReport, StoreError> {
    let mut state = self.lock();
    let report = self.evict_locked(&mut state, policy)?;
    self.save_index(&state.index)?;

    info!(
      removed = report.entries_removed,
      blobs = report.blobs_removed,
      bytes_freed = report.bytes_freed,
      pinned_skipped = report.pinned_skipped,
      "cache eviction complete"
    );
    Ok(report)
  }

  pub fn stats(&self) -> CacheStats {
    let state = self.lock();
    CacheStats {
      entries: state.index.entries.len(),
      total_bytes: state.index.total_bytes(),
      max_bytes: self.max_bytes,
    }
  }

  fn evict_locked(&self, state: &mut CacheState, policy: EvictPolicy) -> Result<EvictionReport, StoreError> {
    let mut report = EvictionReport::default();

    // Oldest first
    let mut candidates: Vec<(ContentHash, u64, u64)> = state
      .index
      .entries
      .iter()
      .map(|(k, e)| (k.clone(), e.last_access, e.last_access_unix))
      .collect();
    candidates.sort_by_key(|(_, tick, _)| *tick);

    let now = unix_now();

    for (key, _, accessed_unix) in candidates {
      let selected = match policy {
        EvictPolicy::Lru { max_bytes } => state.index.total_bytes() > max_bytes,
        EvictPolicy::OlderThan(age) => now.saturating_sub(accessed_unix) >= age.as_secs(),
        EvictPolicy::All => true,
      };
      if !selected {
        if matches!(policy, EvictPolicy::Lru { .. }) {
          break;
        }
        continue;
      }

      if state.pins.contains_key(&key) {
        report.pinned_skipped += 1;
        continue;
      }

      let Some(entry) = state.index.entries.remove(&key) else {
        continue;
      };
      report.entries_removed += 1;

      if !state.index.blob_referenced(&entry.blob) {
        let path = self.blob_path(&entry.blob);
        match fs::remove_file(&path) {
          Ok(()) => {}
          Err(e) if e.kind() == io::ErrorKind::NotFound => {}
          Err(source) => return Err(StoreError::Write { path, source }),
        }
        report.blobs_removed += 1;
        report.bytes_freed += entry.size;
      }
    }

    if let EvictPolicy::Lru { max_bytes } = policy
      && state.index.total_bytes() > max_bytes
    {
      warn!(
        total = state.index.total_bytes(),
        max_bytes, "cache over capacity; remaining entries are pinned by running steps"
      );
    }

    Ok(report)
  }

  fn drop_entry(&self, key: &ContentHash) -> Result<(), StoreError> {
    let mut state = self.lock();
    state.index.entries.remove(key);
    self.save_index(&state.index)
  }

  fn write_blob(&self, path: &Path, blob: &[u8]) -> Result<(), StoreError> {
    let tmp_dir = self.root.join(TMP_DIR);
    let mut tmp = NamedTempFile::new_in(&tmp_dir).map_err(|source| StoreError::Write {
      path: tmp_dir.clone(),
      source,
    })?;
    tmp.write_all(blob).map_err(|source| StoreError::Write {
      path: tmp.path().to_path_buf(),
      source,
    })?;
    tmp.persist(path).map_err(|e| StoreError::Write {
      path: path.to_path_buf(),
      source: e.error,
    })?;
    Ok(())
  }

  /// Atomically rewrite the index (write to temp, then rename).
  fn save_index(&self, index: &CacheIndex) -> Result<(), StoreError> {
    let path = self.root.join(INDEX_FILENAME);
    let content = serde_json::to_vec_pretty(index).map_err(|e| StoreError::Write {
      path: path.clone(),
      source: io::Error::other(e),
    })?;
    self.write_blob(&path, &content)
  }
}

fn load_index(path: &Path) -> Result<CacheIndex, StoreError> {
  let content = match fs::read_to_string(path) {
    Ok(content) => content,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(CacheIndex::new()),
    Err(source) => {
      return Err(StoreError::Read {
        path: path.to_path_buf(),
        source,
      });
    }
  };

  let index: CacheIndex = serde_json::from_str(&content).map_err(|source| StoreError::ParseIndex {
    path: path.to_path_buf(),
    source,
  })?;

  if index.version != INDEX_VERSION {
    return Err(StoreError::UnsupportedVersion(index.version));
  }

  Ok(index)
}
