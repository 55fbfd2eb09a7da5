//! Persistent stores shared by all steps of a run.
//!
//! # Layout
//!
//! ```text
//! <store>/
//! ├── store.lock                  # Run lock and holder (see `store_lock`)
//! ├── cache/
//! │   ├── index.json              # key -> blob, size, last access
//! │   ├── blobs/<sha256>          # Content-addressed bundles
//! │   └── tmp/                    # Staging area for atomic writes
//! └── artifacts/
//!     └── <run_id>/<step_id>/<name>.tar
//! ```
//!
//! Both stores hold bundles: uncompressed tar archives of workspace-relative
//! files (see [`bundle`]).

pub mod artifact;
pub mod bundle;
pub mod cache;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::util::hash::ContentHash;

pub use artifact::{ArtifactKey, ArtifactRef, ArtifactStore};
pub use cache::{BlobRef, CacheEntry, CachePin, CacheStats, CacheStore, EvictPolicy, EvictionReport};

/// Errors raised by the cache and artifact stores.
///
/// Any of these during a run is an infrastructure failure: the orchestrator
/// cannot vouch for cache correctness once the store misbehaves.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("failed to create store directory {path}: {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse cache index {path}: {source}")]
  ParseIndex {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("unsupported cache index version: {0}")]
  UnsupportedVersion(u32),

  #[error("artifact already exists and will not be overwritten: {0}")]
  AlreadyExists(PathBuf),

  #[error("blob {0} is corrupt (content hash mismatch)")]
  Corrupt(ContentHash),

  #[error("bundle error: {0}")]
  Bundle(String),
}
