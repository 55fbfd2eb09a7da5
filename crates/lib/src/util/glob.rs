//! Glob matching for cache and artifact path patterns.
//!
//! Patterns are relative to a workspace root and use `/` as separator:
//! - `*` matches within one path segment
//! - `?` matches one character within a segment
//! - `**` matches any number of segments (including none)
//! - `[abc]` / `[!abc]` character classes
//!
//! A pattern without metacharacters that names a directory selects every file
//! below it.

use std::path::{Path, PathBuf};

use regex::Regex;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum GlobError {
  #[error("invalid glob pattern '{pattern}': {message}")]
  Invalid { pattern: String, message: String },

  #[error("failed to walk {path}: {message}")]
  Walk { path: String, message: String },
}

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct Glob {
  pattern: String,
  regex: Regex,
}

impl Glob {
  pub fn new(pattern: &str) -> Result<Self, GlobError> {
    let normalized = normalize(pattern);
    if normalized.is_empty() {
      return Err(GlobError::Invalid {
        pattern: pattern.to_string(),
        message: "empty pattern".to_string(),
      });
    }
    if normalized.starts_with('/') || normalized.split('/').any(|seg| seg == "..") {
      return Err(GlobError::Invalid {
        pattern: pattern.to_string(),
        message: "patterns must stay inside the workspace".to_string(),
      });
    }

    let regex = Regex::new(&to_regex(&normalized)).map_err(|e| GlobError::Invalid {
      pattern: pattern.to_string(),
      message: e.to_string(),
    })?;

    Ok(Self {
      pattern: normalized,
      regex,
    })
  }

  pub fn as_str(&self) -> &str {
    &self.pattern
  }

  /// Whether the pattern contains glob metacharacters.
  pub fn is_literal(&self) -> bool {
    !self.pattern.contains(['*', '?', '['])
  }

  /// Match a `/`-separated relative path.
  pub fn matches(&self, rel_path: &str) -> bool {
    self.regex.is_match(rel_path)
  }
}

fn normalize(pattern: &str) -> String {
  let p = pattern.trim().replace('\\', "/");
  let p = p.strip_prefix("./").unwrap_or(&p);
  p.trim_end_matches('/').to_string()
}

fn to_regex(pattern: &str) -> String {
  let chars: Vec<char> = pattern.chars().collect();
  let mut out = String::from("^");
  let mut i = 0;

  while i < chars.len() {
    match chars[i] {
      '*' if chars.get(i + 1) == Some(&'*') => {
        let at_start = i == 0 || chars[i - 1] == '/';
        let followed_by_slash = chars.get(i + 2) == Some(&'/');
        if at_start && followed_by_slash {
          out.push_str("(?:.*/)?");
          i += 3;
        } else if at_start && i + 2 == chars.len() {
          out.push_str(".*");
          i += 2;
        } else {
          out.push_str("[^/]*");
          i += 2;
        }
      }
      '*' => {
        out.push_str("[^/]*");
        i += 1;
      }
      '?' => {
        out.push_str("[^/]");
        i += 1;
      }
      '[' => {
        let close = chars[i + 1..].iter().position(|&c| c == ']').map(|p| p + i + 1);
        match close {
          Some(end) if end > i + 1 => {
            out.push('[');
            let mut j = i + 1;
            if chars[j] == '!' {
              out.push('^');
              j += 1;
            }
            for &c in &chars[j..end] {
              if c == '\\' || c == '[' || c == '^' {
                out.push('\\');
              }
              out.push(c);
            }
            out.push(']');
            i = end + 1;
          }
          _ => {
            out.push_str(r"\[");
            i += 1;
          }
        }
      }
      c => {
        out.push_str(&regex::escape(&c.to_string()));
        i += 1;
      }
    }
  }

  out.push('$');
  out
}

/// Expand patterns against the files under `root`.
///
/// Returns sorted, de-duplicated paths relative to `root`. Only regular files
/// are returned; missing directories simply yield no matches.
pub fn expand(root: &Path, patterns: &[String]) -> Result<Vec<PathBuf>, GlobError> {
  if patterns.is_empty() {
    return Ok(Vec::new());
  }

  let globs = patterns.iter().map(|p| Glob::new(p)).collect::<Result<Vec<_>, _>>()?;
  let mut matched: Vec<PathBuf> = Vec::new();

  for entry in WalkDir::new(root).sort_by_file_name() {
    let entry = entry.map_err(|e| GlobError::Walk {
      path: root.display().to_string(),
      message: e.to_string(),
    })?;

    if !entry.file_type().is_file() {
      continue;
    }

    let rel = match entry.path().strip_prefix(root) {
      Ok(rel) => rel,
      Err(_) => continue,
    };
    let rel_str = rel.to_string_lossy().replace('\\', "/");

    let selected = globs.iter().any(|g| {
      g.matches(&rel_str) || (g.is_literal() && rel_str.starts_with(&format!("{}/", g.as_str())))
    });

    if selected {
      matched.push(rel.to_path_buf());
    }
  }

  matched.sort();
  matched.dedup();
  Ok(matched)
}
