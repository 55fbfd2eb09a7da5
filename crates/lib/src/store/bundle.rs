//! Bundling workspace files into tar archives.
//!
//! Bundles are built with deterministic headers (zeroed mtime, uid, gid) so
//! the same files produce byte-identical archives, which lets the cache store
//! deduplicate them by content hash.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use tar::{Archive, Builder, HeaderMode};
use tracing::debug;

use super::StoreError;

/// Archive `files` (relative to `root`) into an in-memory tar.
pub fn create_bundle(root: &Path, files: &[PathBuf]) -> Result<Vec<u8>, StoreError> {
  let mut builder = Builder::new(Vec::new());
  builder.mode(HeaderMode::Deterministic);
  builder.follow_symlinks(true);

  let mut sorted: Vec<&PathBuf> = files.iter().collect();
  sorted.sort();

  for rel in sorted {
    let name = rel.to_string_lossy().replace('\\', "/");
    builder
      .append_path_with_name(root.join(rel), &name)
      .map_err(|e| StoreError::Bundle(format!("failed to add {}: {}", name, e)))?;
  }

  let bytes = builder
    .into_inner()
    .map_err(|e| StoreError::Bundle(format!("failed to finish archive: {}", e)))?;

  debug!(files = files.len(), bytes = bytes.len(), "created bundle");
  Ok(bytes)
}

/// Extract a bundle into `dest`, overwriting existing files.
///
/// Entries that would land outside `dest` are rejected. Returns the relative
/// paths that were written.
pub fn unpack_bundle(bytes: &[u8], dest: &Path) -> Result<Vec<PathBuf>, StoreError> {
  std::fs::create_dir_all(dest).map_err(|source| StoreError::CreateDir {
    path: dest.to_path_buf(),
    source,
  })?;

  let mut archive = Archive::new(Cursor::new(bytes));
  archive.set_preserve_mtime(false);
  let mut written = Vec::new();

  let entries = archive
    .entries()
    .map_err(|e| StoreError::Bundle(format!("failed to read archive: {}", e)))?;

  for entry in entries {
    let mut entry = entry.map_err(|e| StoreError::Bundle(format!("failed to read entry: {}", e)))?;
    let path = entry
      .path()
      .map_err(|e| StoreError::Bundle(format!("invalid entry path: {}", e)))?
      .into_owned();

    let unpacked = entry
      .unpack_in(dest)
      .map_err(|e| StoreError::Bundle(format!("failed to unpack {}: {}", path.display(), e)))?;

    if !unpacked {
      return Err(StoreError::Bundle(format!(
        "entry {} escapes the destination directory",
        path.display()
      )));
    }
    written.push(path);
  }

  debug!(files = written.len(), dest = %dest.display(), "unpacked bundle");
  Ok(written)
}
