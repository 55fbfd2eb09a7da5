use std::path::PathBuf;

use thiserror::Error;

use crate::util::glob::GlobError;

/// A project definition that cannot be scheduled.
///
/// Every variant is reported before any step executes.
#[derive(Debug, Error)]
pub enum DefinitionError {
  #[error("failed to read project file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse project file {path}: {message}")]
  Parse { path: PathBuf, message: String },

  #[error("invalid step id '{id}': {message}")]
  InvalidStepId { id: String, message: String },

  #[error("step '{step}' depends on unknown step '{dependency}'")]
  UnknownDependency { step: String, dependency: String },

  #[error("step '{0}' depends on itself")]
  SelfDependency(String),

  #[error("dependency cycle detected between steps: {}", .0.join(", "))]
  Cycle(Vec<String>),

  #[error("step '{step}' has an invalid matrix: {message}")]
  InvalidMatrix { step: String, message: String },

  #[error("invalid matrix filter '{0}': expected axis=value")]
  InvalidFilter(String),

  #[error("matrix filter names axis '{0}' which no step uses")]
  UnknownFilterAxis(String),

  #[error("matrix filter removes every combination of step '{0}'")]
  EmptyMatrix(String),

  #[error("step '{step}': {source}")]
  InvalidPattern {
    step: String,
    #[source]
    source: GlobError,
  },

  #[error("step '{step}' declares an invalid artifact name '{name}'")]
  InvalidArtifactName { step: String, name: String },

  #[error("step '{step}' has an invalid working directory '{dir}'")]
  InvalidWorkingDir { step: String, dir: String },

  #[error("step '{step}' has an invalid retry policy: {message}")]
  InvalidRetry { step: String, message: String },
}
