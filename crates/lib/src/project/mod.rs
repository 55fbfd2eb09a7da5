//! Project definitions.
//!
//! A project file (YAML, or JSON by extension) is parsed into a
//! [`ProjectDef`] and structurally validated before anything is scheduled.

mod error;
mod load;
mod types;

pub use error::DefinitionError;
pub use load::{Format, validate_step_id};
pub use types::{
  ArtifactSpec, AxisValues, CacheSpec, MatrixSpec, ProjectDef, RetryPolicy, SecondaryArtifact, StepCacheSpec, StepDef,
};
