//! Matrix selection and expansion.
//!
//! A step with axes `{version: [14, 16], os: [linux, windows]}` becomes one
//! concrete step per combination, identified as
//! `test#version=14,os=linux`. Axes keep declaration order; the first axis
//! varies slowest.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use serde::Serialize;

use crate::consts::MATRIX_ID_SEPARATOR;
use crate::project::{DefinitionError, MatrixSpec, ProjectDef, StepDef};

/// One matrix axis: a name and its ordered values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatrixAxis {
  pub name: String,
  pub values: Vec<String>,
}

/// One point of a matrix: `(axis, value)` pairs in axis order.
pub type Combination = Vec<(String, String)>;

/// User filters restricting which axis values run.
///
/// Several values for the same axis are unioned; different axes intersect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatrixSelections {
  filters: BTreeMap<String, BTreeSet<String>>,
}

impl MatrixSelections {
  pub fn new() -> Self {
    Self::default()
  }

  /// Parse `axis=value` filters.
  pub fn parse<S: AsRef<str>>(filters: &[S]) -> Result<Self, DefinitionError> {
    let mut selections = Self::new();
    for filter in filters {
      let filter = filter.as_ref();
      let (axis, value) = filter
        .split_once('=')
        .map(|(a, v)| (a.trim(), v.trim()))
        .filter(|(a, v)| !a.is_empty() && !v.is_empty())
        .ok_or_else(|| DefinitionError::InvalidFilter(filter.to_string()))?;
      selections.insert(axis, value);
    }
    Ok(selections)
  }

  pub fn insert(&mut self, axis: impl Into<String>, value: impl Into<String>) {
    self.filters.entry(axis.into()).or_default().insert(value.into());
  }

  pub fn is_empty(&self) -> bool {
    self.filters.is_empty()
  }

  pub fn axes(&self) -> impl Iterator<Item = &str> {
    self.filters.keys().map(String::as_str)
  }

  /// Whether `value` of `axis` survives the filters.
  pub fn allows(&self, axis: &str, value: &str) -> bool {
    self.filters.get(axis).is_none_or(|values| values.contains(value))
  }
}

impl FromStr for MatrixSelections {
  type Err = DefinitionError;

  /// A single filter, e.g. `os=linux`.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(&[s])
  }
}

/// The axes a step declares, resolving references to project-level axes.
pub fn step_axes(project: &ProjectDef, step_id: &str, step: &StepDef) -> Result<Vec<MatrixAxis>, DefinitionError> {
  match &step.matrix {
    None => Ok(Vec::new()),
    Some(MatrixSpec::Axes(axes)) => Ok(
      axes
        .iter()
        .map(|(name, values)| MatrixAxis {
          name: name.clone(),
          values: values.0.clone(),
        })
        .collect(),
    ),
    Some(MatrixSpec::Shared(names)) => names
      .iter()
      .map(|name| {
        project
          .matrix
          .get(name)
          .map(|values| MatrixAxis {
            name: name.clone(),
            values: values.0.clone(),
          })
          .ok_or_else(|| DefinitionError::InvalidMatrix {
            step: step_id.to_string(),
            message: format!("unknown project axis '{}'", name),
          })
      })
      .collect(),
  }
}

/// Apply filters to a step's axes. An axis with no surviving value means the
/// step has no combinations left.
pub fn filter_axes(
  step_id: &str,
  axes: &[MatrixAxis],
  selections: &MatrixSelections,
) -> Result<Vec<MatrixAxis>, DefinitionError> {
  let mut filtered = Vec::with_capacity(axes.len());
  for axis in axes {
    let values: Vec<String> = axis
      .values
      .iter()
      .filter(|v| selections.allows(&axis.name, v))
      .cloned()
      .collect();
    if values.is_empty() {
      return Err(DefinitionError::EmptyMatrix(step_id.to_string()));
    }
    filtered.push(MatrixAxis {
      name: axis.name.clone(),
      values,
    });
  }
  Ok(filtered)
}

/// Cross product of `axes` in declaration order. No axes yields one empty
/// combination.
pub fn combinations(axes: &[MatrixAxis]) -> Vec<Combination> {
  let mut result: Vec<Combination> = vec![Vec::new()];
  for axis in axes {
    let mut next = Vec::with_capacity(result.len() * axis.values.len());
    for prefix in &result {
      for value in &axis.values {
        let mut combo = prefix.clone();
        combo.push((axis.name.clone(), value.clone()));
        next.push(combo);
      }
    }
    result = next;
  }
  result
}

/// Identifier of one concrete matrix step.
pub fn derived_id(base: &str, combination: &[(String, String)]) -> String {
  if combination.is_empty() {
    return base.to_string();
  }
  let assignment: Vec<String> = combination.iter().map(|(axis, value)| format!("{}={}", axis, value)).collect();
  format!("{}{}{}", base, MATRIX_ID_SEPARATOR, assignment.join(","))
}

/// Base id of a possibly derived id.
pub fn base_id(id: &str) -> &str {
  id.split(MATRIX_ID_SEPARATOR).next().unwrap_or(id)
}
