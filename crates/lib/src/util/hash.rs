//! SHA-256 content addressing.
//!
//! [`ContentHash`] is the full hex digest used for cache keys and blob
//! addresses. [`ObjectHash`] is a truncated digest of a serialized value,
//! used to identify a project definition in plans and logs.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::consts::OBJ_HASH_PREFIX_LEN;

pub type HashError = serde_json::Error;

/// Short digest of a serialized value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHash(pub String);

impl std::fmt::Display for ObjectHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

/// Values identified by the digest of their JSON form.
pub trait Hashable: Serialize {
  fn compute_hash(&self) -> Result<ObjectHash, HashError> {
    let json = serde_json::to_vec(self)?;
    let mut digest = hash_bytes(&json).0;
    digest.truncate(OBJ_HASH_PREFIX_LEN);
    Ok(ObjectHash(digest))
  }
}

/// Full hex SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl ContentHash {
  /// Prefix for logs and reports.
  pub fn short(&self) -> &str {
    &self.0[..self.0.len().min(OBJ_HASH_PREFIX_LEN)]
  }
}

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, thiserror::Error)]
#[error("cannot hash {path}: {source}")]
pub struct FileHashError {
  pub path: PathBuf,
  #[source]
  pub source: io::Error,
}

fn finish(hasher: Sha256) -> ContentHash {
  ContentHash(format!("{:x}", hasher.finalize()))
}

/// Digest of a set of files below `root`, independent of their order.
///
/// Each file contributes its `/`-separated relative path and its content
/// digest, so renaming a file changes the result as much as editing it.
pub fn hash_files(root: &Path, files: &[PathBuf]) -> Result<ContentHash, FileHashError> {
  let mut entries = BTreeMap::new();
  for rel in files {
    let key = rel.to_string_lossy().replace('\\', "/");
    if !entries.contains_key(&key) {
      let digest = hash_file(&root.join(rel))?;
      entries.insert(key, digest);
    }
  }

  let mut hasher = Sha256::new();
  for (path, digest) in &entries {
    hasher.update(path.as_bytes());
    hasher.update(b"\0");
    hasher.update(digest.0.as_bytes());
    hasher.update(b"\n");
  }
  Ok(finish(hasher))
}

/// Digest of one file's contents, streamed.
pub fn hash_file(path: &Path) -> Result<ContentHash, FileHashError> {
  let err = |source| FileHashError {
    path: path.to_path_buf(),
    source,
  };
  let mut file = File::open(path).map_err(err)?;
  let mut hasher = Sha256::new();
  io::copy(&mut file, &mut hasher).map_err(err)?;
  Ok(finish(hasher))
}

pub fn hash_bytes(data: &[u8]) -> ContentHash {
  finish(Sha256::new_with_prefix(data))
}
