use std::path::PathBuf;

use crate::consts::{APP_NAME, STORE_ENV};

/// Returns the user's home directory
#[cfg(windows)]
pub fn home_dir() -> Option<PathBuf> {
  std::env::var_os("USERPROFILE").map(PathBuf::from)
}

/// Returns the user's home directory
#[cfg(not(windows))]
pub fn home_dir() -> Option<PathBuf> {
  std::env::var_os("HOME").map(PathBuf::from)
}

/// Returns the directory for cache files for the application
#[cfg(windows)]
pub fn cache_dir() -> Option<PathBuf> {
  std::env::var_os("LOCALAPPDATA").map(|p| PathBuf::from(p).join(APP_NAME).join("Cache"))
}

/// Returns the directory for cache files for the application
#[cfg(not(windows))]
pub fn cache_dir() -> Option<PathBuf> {
  std::env::var_os("XDG_CACHE_HOME")
    .map(PathBuf::from)
    .or_else(|| home_dir().map(|h| h.join(".cache")))
    .map(|p| p.join(APP_NAME))
}

/// Returns the store root holding the cache and artifact stores.
///
/// Resolution order: `STEPWISE_STORE`, the platform cache directory, then
/// `.stepwise` in the current directory.
pub fn store_dir() -> PathBuf {
  if let Some(path) = std::env::var_os(STORE_ENV) {
    return PathBuf::from(path);
  }

  cache_dir().unwrap_or_else(|| PathBuf::from(format!(".{}", APP_NAME)))
}
