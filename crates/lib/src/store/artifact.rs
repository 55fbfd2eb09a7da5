//! Append-only artifact store.
//!
//! Artifacts are namespaced by run id and step id. A path, once written, is
//! never overwritten: earlier runs stay intact for reproducibility audits.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::debug;

use super::StoreError;
use crate::util::hash::{ContentHash, hash_bytes, hash_file};

const ARTIFACT_EXT: &str = "tar";

/// Address of one artifact within the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
  pub run_id: String,
  pub step_id: String,
  pub name: String,
}

impl ArtifactKey {
  pub fn new(run_id: impl Into<String>, step_id: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      run_id: run_id.into(),
      step_id: step_id.into(),
      name: name.into(),
    }
  }
}

/// A stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactRef {
  pub run_id: String,
  pub step_id: String,
  pub name: String,
  pub path: PathBuf,
  pub digest: ContentHash,
  pub size: u64,
}

/// Map an identifier to a single safe path component.
///
/// Matrix ids (`test#os=linux,node=16`) keep their shape; anything that could
/// act as a separator or is otherwise unsafe becomes `_`.
pub fn path_component(id: &str) -> String {
  let mapped: String = id
    .chars()
    .map(|c| {
      if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '#' | '=' | ',' | '+') {
        c
      } else {
        '_'
      }
    })
    .collect();

  if mapped.is_empty() || mapped.chars().all(|c| c == '.') {
    format!("_{}", mapped)
  } else {
    mapped
  }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
  root: PathBuf,
}

impl ArtifactStore {
  /// Open (or create) the artifact store rooted at `root`.
  pub fn open(root: &Path) -> Result<Self, StoreError> {
    fs::create_dir_all(root).map_err(|source| StoreError::CreateDir {
      path: root.to_path_buf(),
      source,
    })?;
    Ok(Self {
      root: root.to_path_buf(),
    })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn step_dir(&self, run_id: &str, step_id: &str) -> PathBuf {
    self.root.join(path_component(run_id)).join(path_component(step_id))
  }

  pub fn artifact_path(&self, key: &ArtifactKey) -> PathBuf {
    self
      .step_dir(&key.run_id, &key.step_id)
      .join(format!("{}.{}", path_component(&key.name), ARTIFACT_EXT))
  }

  /// Write an artifact. Fails with [`StoreError::AlreadyExists`] if the key
  /// was already written.
  pub fn put(&self, key: &ArtifactKey, blob: &[u8]) -> Result<ArtifactRef, StoreError> {
    let path = self.artifact_path(key);
    if path.exists() {
      return Err(StoreError::AlreadyExists(path));
    }

    let dir = self.step_dir(&key.run_id, &key.step_id);
    fs::create_dir_all(&dir).map_err(|source| StoreError::CreateDir {
      path: dir.clone(),
      source,
    })?;

    let mut tmp = NamedTempFile::new_in(&dir).map_err(|source| StoreError::Write {
      path: dir.clone(),
      source,
    })?;
    tmp.write_all(blob).map_err(|source| StoreError::Write {
      path: tmp.path().to_path_buf(),
      source,
    })?;

    // persist_noclobber refuses to replace a file that appeared meanwhile
    tmp.persist_noclobber(&path).map_err(|e| {
      if e.error.kind() == io::ErrorKind::AlreadyExists {
        StoreError::AlreadyExists(path.clone())
      } else {
        StoreError::Write {
          path: path.clone(),
          source: e.error,
        }
      }
    })?;

    debug!(run = %key.run_id, step = %key.step_id, name = %key.name, size = blob.len(), "stored artifact");

    Ok(ArtifactRef {
      run_id: key.run_id.clone(),
      step_id: key.step_id.clone(),
      name: key.name.clone(),
      path,
      digest: hash_bytes(blob),
      size: blob.len() as u64,
    })
  }

  pub fn get(&self, key: &ArtifactKey) -> Result<Option<Vec<u8>>, StoreError> {
    let path = self.artifact_path(key);
    match fs::read(&path) {
      Ok(data) => Ok(Some(data)),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
      Err(source) => Err(StoreError::Read { path, source }),
    }
  }

  /// Run ids that have stored artifacts, sorted.
  pub fn list_runs(&self) -> Result<Vec<String>, StoreError> {
    let mut runs = list_dir_names(&self.root)?;
    runs.sort();
    Ok(runs)
  }

  /// All artifacts of a run, sorted by step directory and name.
  pub fn list(&self, run_id: &str) -> Result<Vec<ArtifactRef>, StoreError> {
    let run_dir = self.root.join(path_component(run_id));
    let mut refs = Vec::new();

    let mut steps = list_dir_names(&run_dir)?;
    steps.sort();

    for step in steps {
      let step_dir = run_dir.join(&step);
      let entries = fs::read_dir(&step_dir).map_err(|source| StoreError::Read {
        path: step_dir.clone(),
        source,
      })?;

      let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == ARTIFACT_EXT))
        .collect();
      files.sort();

      for path in files {
        let name = path
          .file_stem()
          .map(|s| s.to_string_lossy().to_string())
          .unwrap_or_default();
        let size = fs::metadata(&path)
          .map_err(|source| StoreError::Read {
            path: path.clone(),
            source,
          })?
          .len();
        let digest = hash_file(&path).map_err(|e| StoreError::Bundle(e.to_string()))?;
        refs.push(ArtifactRef {
          run_id: run_id.to_string(),
          step_id: step.clone(),
          name,
          path,
          digest,
          size,
        });
      }
    }

    Ok(refs)
  }
}

fn list_dir_names(dir: &Path) -> Result<Vec<String>, StoreError> {
  let entries = match fs::read_dir(dir) {
    Ok(entries) => entries,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
    Err(source) => {
      return Err(StoreError::Read {
        path: dir.to_path_buf(),
        source,
      });
    }
  };

  Ok(
    entries
      .flatten()
      .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
      .filter_map(|e| e.file_name().to_str().map(str::to_string))
      .collect(),
  )
}
