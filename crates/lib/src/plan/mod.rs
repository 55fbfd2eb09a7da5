//! Scheduling: matrix expansion, dependency resolution and wave computation.
//!
//! [`schedule`] turns a [`ProjectDef`] into an [`ExecutionPlan`]:
//! 1. Every step's matrix is filtered and expanded into concrete steps
//! 2. `depends_on` entries are resolved to concrete ids
//! 3. The resulting DAG is checked for cycles and split into waves
//!
//! A dependency on a matrix step's base id waits for all of its combinations
//! (join-all). A dependency may also name one combination exactly, e.g.
//! `test#os=linux`.

pub mod dag;
pub mod matrix;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, info};

use crate::project::{ArtifactSpec, DefinitionError, ProjectDef, RetryPolicy};
use crate::util::duration::human_opt;
use crate::util::hash::{Hashable, ObjectHash};

pub use dag::StepDag;
pub use matrix::{MatrixAxis, MatrixSelections};

/// A step after matrix expansion: the unit the executor runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConcreteStep {
  pub id: String,
  pub base_id: String,

  /// Axis assignment, in axis declaration order.
  pub matrix: IndexMap<String, String>,

  pub commands: Vec<String>,

  /// Project env, overlaid with step env, overlaid with matrix values.
  pub env: BTreeMap<String, String>,

  /// Concrete ids this step waits for.
  pub depends_on: BTreeSet<String>,

  #[serde(with = "human_opt")]
  pub timeout: Option<Duration>,

  pub retry: RetryPolicy,
  pub cache_paths: Vec<String>,
  pub cache_inputs: Vec<String>,
  pub artifacts: ArtifactSpec,
  pub working_dir: Option<String>,
}

impl ConcreteStep {
  pub fn is_cacheable(&self) -> bool {
    !self.cache_paths.is_empty()
  }
}

/// The scheduled form of a project.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
  /// Short hash of the project definition.
  pub project_hash: ObjectHash,

  pub steps: BTreeMap<String, ConcreteStep>,

  /// Step ids grouped into waves; ids within a wave are sorted.
  pub waves: Vec<Vec<String>>,

  /// Wall-clock bound for the whole run.
  #[serde(with = "human_opt")]
  pub timeout: Option<Duration>,
}

impl ExecutionPlan {
  pub fn len(&self) -> usize {
    self.steps.len()
  }

  pub fn is_empty(&self) -> bool {
    self.steps.is_empty()
  }

  pub fn step(&self, id: &str) -> Option<&ConcreteStep> {
    self.steps.get(id)
  }

  /// Step ids in execution order: wave by wave, sorted within a wave.
  pub fn ordered_ids(&self) -> impl Iterator<Item = &str> {
    self.waves.iter().flatten().map(String::as_str)
  }

  /// Index of the wave containing `id`.
  pub fn wave_of(&self, id: &str) -> Option<usize> {
    self.waves.iter().position(|wave| wave.iter().any(|w| w == id))
  }
}

/// Expand, resolve and order a project's steps.
pub fn schedule(project: &ProjectDef, selections: &MatrixSelections) -> Result<ExecutionPlan, DefinitionError> {
  project.validate()?;

  let project_hash = project.compute_hash().map_err(|e| DefinitionError::Parse {
    path: Default::default(),
    message: format!("failed to hash project: {}", e),
  })?;

  // Resolve every step's axes before filtering so unknown filter axes are
  // reported regardless of step order.
  let mut step_axes = IndexMap::new();
  for (id, step) in &project.steps {
    step_axes.insert(id.as_str(), matrix::step_axes(project, id, step)?);
  }

  let used_axes: BTreeSet<&str> = step_axes.values().flatten().map(|a| a.name.as_str()).collect();
  if let Some(axis) = selections.axes().find(|a| !used_axes.contains(a)) {
    return Err(DefinitionError::UnknownFilterAxis(axis.to_string()));
  }

  // Expand
  let mut expanded: BTreeMap<&str, Vec<String>> = BTreeMap::new();
  let mut steps: BTreeMap<String, ConcreteStep> = BTreeMap::new();

  for (id, step) in &project.steps {
    let axes = matrix::filter_axes(id, &step_axes[id.as_str()], selections)?;
    let cache = step.cache.clone().unwrap_or_default();
    let cache_paths = cache.paths.unwrap_or_else(|| project.cache.paths.clone());
    let artifacts = step.artifacts.clone().unwrap_or_else(|| project.artifacts.clone());

    let mut ids = Vec::new();
    for combination in matrix::combinations(&axes) {
      let concrete_id = matrix::derived_id(id, &combination);

      let mut env = project.env.clone();
      env.extend(step.env.iter().map(|(k, v)| (k.clone(), v.clone())));
      env.extend(combination.iter().cloned());

      steps.insert(
        concrete_id.clone(),
        ConcreteStep {
          id: concrete_id.clone(),
          base_id: id.clone(),
          matrix: combination.into_iter().collect(),
          commands: step.commands.clone(),
          env,
          depends_on: BTreeSet::new(),
          timeout: step.timeout,
          retry: step.retry.clone().unwrap_or_default(),
          cache_paths: cache_paths.clone(),
          cache_inputs: cache.inputs.clone(),
          artifacts: artifacts.clone(),
          working_dir: step.working_dir.clone(),
        },
      );
      ids.push(concrete_id);
    }

    debug!(step = %id, combinations = ids.len(), "expanded step");
    expanded.insert(id.as_str(), ids);
  }

  // Resolve dependencies to concrete ids
  let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
  for (id, step) in &project.steps {
    let mut deps = BTreeSet::new();
    for dep in &step.depends_on {
      if let Some(all) = expanded.get(dep.as_str()) {
        deps.extend(all.iter().cloned());
      } else if steps.contains_key(dep) {
        deps.insert(dep.clone());
      } else {
        return Err(DefinitionError::UnknownDependency {
          step: id.clone(),
          dependency: dep.clone(),
        });
      }
    }

    for concrete_id in &expanded[id.as_str()] {
      if deps.contains(concrete_id) {
        return Err(DefinitionError::SelfDependency(concrete_id.clone()));
      }
      if let Some(concrete) = steps.get_mut(concrete_id) {
        concrete.depends_on = deps.clone();
      }
      edges.insert(concrete_id.clone(), deps.clone());
    }
  }

  let dag = StepDag::new(&edges)?;
  let waves = dag.waves()?;

  info!(
    project = %project_hash,
    steps = steps.len(),
    waves = waves.len(),
    "scheduled project"
  );

  Ok(ExecutionPlan {
    project_hash,
    steps,
    waves,
    timeout: project.timeout,
  })
}
