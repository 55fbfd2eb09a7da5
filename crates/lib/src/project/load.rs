//! Loading and structural validation of project files.

use std::collections::BTreeSet;
use std::path::{Component, Path};

use tracing::debug;

use super::error::DefinitionError;
use super::types::{ArtifactSpec, MatrixSpec, ProjectDef, StepDef};
use crate::consts::{MATRIX_ID_SEPARATOR, MAX_RETRIES, PRIMARY_ARTIFACT};
use crate::plan::matrix::base_id;
use crate::util::glob::Glob;

/// Serialization format of a project file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
  Yaml,
  Json,
}

impl Format {
  /// `.json` is JSON; everything else is read as YAML.
  pub fn from_path(path: &Path) -> Self {
    match path.extension().and_then(|e| e.to_str()) {
      Some(ext) if ext.eq_ignore_ascii_case("json") => Format::Json,
      _ => Format::Yaml,
    }
  }
}

impl ProjectDef {
  /// Read, parse and validate a project file.
  pub fn load(path: &Path) -> Result<Self, DefinitionError> {
    let content = std::fs::read_to_string(path).map_err(|source| DefinitionError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let project = Self::parse(&content, Format::from_path(path), path)?;
    debug!(path = %path.display(), steps = project.steps.len(), "loaded project");
    Ok(project)
  }

  /// Parse and validate project text. `origin` is only used in errors.
  pub fn parse(content: &str, format: Format, origin: &Path) -> Result<Self, DefinitionError> {
    let parse_err = |message: String| DefinitionError::Parse {
      path: origin.to_path_buf(),
      message,
    };

    let project: ProjectDef = match format {
      Format::Yaml => serde_yaml::from_str(content).map_err(|e| parse_err(e.to_string()))?,
      Format::Json => serde_json::from_str(content).map_err(|e| parse_err(e.to_string()))?,
    };

    project.validate()?;
    Ok(project)
  }

  /// Structural checks that need no graph: ids, axes, patterns, paths.
  ///
  /// Dependency resolution and cycle detection happen when the project is
  /// scheduled, after matrix expansion.
  pub fn validate(&self) -> Result<(), DefinitionError> {
    for (axis, values) in &self.matrix {
      validate_axis("<project>", axis, &values.0)?;
    }
    validate_patterns("<project>", &self.cache.paths)?;
    validate_artifacts("<project>", &self.artifacts)?;

    for (id, step) in &self.steps {
      validate_step_id(id)?;
      self.validate_step(id, step)?;
    }
    Ok(())
  }

  fn validate_step(&self, id: &str, step: &StepDef) -> Result<(), DefinitionError> {
    match &step.matrix {
      Some(MatrixSpec::Axes(axes)) => {
        if axes.is_empty() {
          return Err(DefinitionError::InvalidMatrix {
            step: id.to_string(),
            message: "matrix declares no axes".to_string(),
          });
        }
        for (axis, values) in axes {
          validate_axis(id, axis, &values.0)?;
        }
      }
      Some(MatrixSpec::Shared(names)) => {
        if names.is_empty() {
          return Err(DefinitionError::InvalidMatrix {
            step: id.to_string(),
            message: "matrix references no axes".to_string(),
          });
        }
        let mut seen = BTreeSet::new();
        for name in names {
          if !self.matrix.contains_key(name) {
            return Err(DefinitionError::InvalidMatrix {
              step: id.to_string(),
              message: format!("unknown project axis '{}'", name),
            });
          }
          if !seen.insert(name) {
            return Err(DefinitionError::InvalidMatrix {
              step: id.to_string(),
              message: format!("axis '{}' listed twice", name),
            });
          }
        }
      }
      None => {}
    }

    for dep in &step.depends_on {
      if dep == id {
        return Err(DefinitionError::SelfDependency(id.to_string()));
      }
      if !self.steps.contains_key(base_id(dep)) {
        return Err(DefinitionError::UnknownDependency {
          step: id.to_string(),
          dependency: dep.clone(),
        });
      }
    }

    if let Some(cache) = &step.cache {
      if let Some(paths) = &cache.paths {
        validate_patterns(id, paths)?;
      }
      validate_patterns(id, &cache.inputs)?;
    }
    if let Some(artifacts) = &step.artifacts {
      validate_artifacts(id, artifacts)?;
    }

    if let Some(dir) = &step.working_dir {
      let path = Path::new(dir);
      let escapes = path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
      if dir.trim().is_empty() || escapes {
        return Err(DefinitionError::InvalidWorkingDir {
          step: id.to_string(),
          dir: dir.clone(),
        });
      }
    }

    if let Some(retry) = &step.retry
      && retry.retries > MAX_RETRIES
    {
      return Err(DefinitionError::InvalidRetry {
        step: id.to_string(),
        message: format!("retries must be at most {}", MAX_RETRIES),
      });
    }

    Ok(())
  }
}

/// Step ids become path components and matrix id prefixes.
pub fn validate_step_id(id: &str) -> Result<(), DefinitionError> {
  let invalid = |message: &str| DefinitionError::InvalidStepId {
    id: id.to_string(),
    message: message.to_string(),
  };

  if id.is_empty() {
    return Err(invalid("must not be empty"));
  }
  if id.starts_with('.') {
    return Err(invalid("must not start with '.'"));
  }
  if let Some(c) = id
    .chars()
    .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
  {
    return Err(invalid(&format!("character '{}' is not allowed", c)));
  }
  Ok(())
}

fn validate_axis(step: &str, axis: &str, values: &[String]) -> Result<(), DefinitionError> {
  let invalid = |message: String| DefinitionError::InvalidMatrix {
    step: step.to_string(),
    message,
  };

  if axis.is_empty() || axis.contains(['=', ',', MATRIX_ID_SEPARATOR]) || axis.contains(char::is_whitespace) {
    return Err(invalid(format!("invalid axis name '{}'", axis)));
  }
  if values.is_empty() {
    return Err(invalid(format!("axis '{}' has no values", axis)));
  }

  let mut seen = BTreeSet::new();
  for value in values {
    if value.is_empty() || value.contains([',', '=', MATRIX_ID_SEPARATOR]) {
      return Err(invalid(format!("axis '{}' has invalid value '{}'", axis, value)));
    }
    if !seen.insert(value) {
      return Err(invalid(format!("axis '{}' repeats value '{}'", axis, value)));
    }
  }
  Ok(())
}

fn validate_patterns(step: &str, patterns: &[String]) -> Result<(), DefinitionError> {
  for pattern in patterns {
    Glob::new(pattern).map_err(|source| DefinitionError::InvalidPattern {
      step: step.to_string(),
      source,
    })?;
  }
  Ok(())
}

fn validate_artifacts(step: &str, artifacts: &ArtifactSpec) -> Result<(), DefinitionError> {
  validate_patterns(step, &artifacts.files)?;
  for (name, secondary) in &artifacts.secondary {
    if name == PRIMARY_ARTIFACT || validate_step_id(name).is_err() {
      return Err(DefinitionError::InvalidArtifactName {
        step: step.to_string(),
        name: name.clone(),
      });
    }
    validate_patterns(step, &secondary.files)?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::TempDir;

  fn parse_yaml(content: &str) -> Result<ProjectDef, DefinitionError> {
    ProjectDef::parse(content, Format::Yaml, Path::new("project.yaml"))
  }

  #[test]
  fn parses_full_project() {
    let project = parse_yaml(
      r#"
timeout: 30m
env: { CI: "true" }
matrix:
  os: [linux, windows]
cache:
  paths: ["node_modules/**"]
artifacts:
  files: ["dist/**"]
  secondary:
    reports: { files: ["reports/*.xml"] }
steps:
  build:
    commands: ["npm ci", "npm run build"]
    cache: { inputs: ["package-lock.json"] }
  test:
    depends_on: [build]
    matrix: { version: [14, 16] }
    commands: ["npm test"]
    timeout: 10m
    retry: { retries: 2, backoff: 1s, exponential: true }
"#,
    )
    .unwrap();

    assert_eq!(project.timeout, Some(std::time::Duration::from_secs(1800)));
    assert_eq!(project.steps.keys().collect::<Vec<_>>(), vec!["build", "test"]);
    assert_eq!(project.steps["test"].retry.as_ref().unwrap().retries, 2);
    assert_eq!(project.artifacts.secondary["reports"].files, vec!["reports/*.xml"]);
  }

  #[test]
  fn loads_json_by_extension() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("project.json");
    fs::write(&path, r#"{"steps": {"a": {"commands": ["true"]}}}"#).unwrap();

    let project = ProjectDef::load(&path).unwrap();
    assert_eq!(project.steps["a"].commands, vec!["true"]);
  }

  #[test]
  fn repeated_step_id_in_json_is_rejected() {
    let content = r#"{"steps": {"a": {"commands": ["one"]}, "a": {"commands": ["two"]}}}"#;
    let err = ProjectDef::parse(content, Format::Json, Path::new("project.json")).unwrap_err();

    let DefinitionError::Parse { message, .. } = &err else {
      panic!("expected a parse error, got {err}");
    };
    assert!(message.contains("duplicate"), "{message}");
  }

  #[test]
  fn repeated_step_id_in_yaml_is_rejected() {
    let err = parse_yaml("steps:\n  a: { commands: [one] }\n  a: { commands: [two] }\n").unwrap_err();

    let DefinitionError::Parse { message, .. } = &err else {
      panic!("expected a parse error, got {err}");
    };
    assert!(message.contains("duplicate"), "{message}");
  }

  #[test]
  fn repeated_axis_name_is_rejected() {
    let err = parse_yaml("matrix:\n  os: [linux]\n  os: [windows]\nsteps: {}\n").unwrap_err();
    assert!(matches!(err, DefinitionError::Parse { .. }));
  }

  #[test]
  fn missing_file_is_read_error() {
    let err = ProjectDef::load(Path::new("/definitely/not/here.yaml")).unwrap_err();
    assert!(matches!(err, DefinitionError::Read { .. }));
  }

  #[test]
  fn malformed_yaml_is_parse_error() {
    let err = parse_yaml("steps: [").unwrap_err();
    assert!(matches!(err, DefinitionError::Parse { .. }));
  }

  #[test]
  fn rejects_invalid_step_ids() {
    assert!(validate_step_id("build-1.x_y").is_ok());
    assert!(validate_step_id("").is_err());
    assert!(validate_step_id("a#b").is_err());
    assert!(validate_step_id("a/b").is_err());
    assert!(validate_step_id(".hidden").is_err());
  }

  #[test]
  fn unknown_dependency_is_rejected() {
    let err = parse_yaml("steps: { a: { depends_on: [ghost] } }").unwrap_err();
    match err {
      DefinitionError::UnknownDependency { step, dependency } => {
        assert_eq!(step, "a");
        assert_eq!(dependency, "ghost");
      }
      other => panic!("unexpected error: {other}"),
    }
  }

  #[test]
  fn self_dependency_is_rejected() {
    let err = parse_yaml("steps: { a: { depends_on: [a] } }").unwrap_err();
    assert!(matches!(err, DefinitionError::SelfDependency(id) if id == "a"));
  }

  #[test]
  fn empty_axis_is_rejected() {
    let err = parse_yaml("steps: { a: { matrix: { os: [] } } }").unwrap_err();
    assert!(matches!(err, DefinitionError::InvalidMatrix { .. }));
  }

  #[test]
  fn repeated_axis_value_is_rejected() {
    let err = parse_yaml("steps: { a: { matrix: { os: [linux, linux] } } }").unwrap_err();
    assert!(matches!(err, DefinitionError::InvalidMatrix { .. }));
  }

  #[test]
  fn unknown_shared_axis_is_rejected() {
    let err = parse_yaml("matrix: { os: [linux] }\nsteps: { a: { matrix: [arch] } }").unwrap_err();
    assert!(err.to_string().contains("unknown project axis 'arch'"));
  }

  #[test]
  fn escaping_patterns_are_rejected() {
    let err = parse_yaml("steps: { a: { cache: { paths: ['../outside'] } } }").unwrap_err();
    assert!(matches!(err, DefinitionError::InvalidPattern { .. }));
  }

  #[test]
  fn escaping_working_dir_is_rejected() {
    let err = parse_yaml("steps: { a: { working_dir: '../up' } }").unwrap_err();
    assert!(matches!(err, DefinitionError::InvalidWorkingDir { .. }));
  }

  #[test]
  fn excessive_retries_are_rejected() {
    let err = parse_yaml("steps: { a: { retry: { retries: 99 } } }").unwrap_err();
    assert!(matches!(err, DefinitionError::InvalidRetry { .. }));
  }

  #[test]
  fn secondary_artifact_cannot_shadow_primary() {
    let err = parse_yaml("artifacts: { secondary: { primary: { files: [a] } } }\nsteps: {}").unwrap_err();
    assert!(matches!(err, DefinitionError::InvalidArtifactName { .. }));
  }

  #[test]
  fn empty_project_is_valid() {
    let project = parse_yaml("steps: {}").unwrap();
    assert!(project.steps.is_empty());
  }
}
