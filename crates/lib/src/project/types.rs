//! Project definition data model.
//!
//! A project file declares named build steps, their command units and
//! dependencies, plus project-wide environment, matrix axes, cache paths and
//! artifact outputs. The model is immutable once loaded.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use indexmap::IndexMap;
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::util::duration::{human, human_opt};
use crate::util::hash::Hashable;

/// A scalar YAML/JSON value accepted where a string is expected.
///
/// Matrix values and env values are opaque strings; `14` and `true` are
/// accepted and stringified. Fractional numbers must be quoted: `3.10` would
/// parse as `3.1` and silently change derived step ids.
#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
  Bool(bool),
  Int(i64),
  Float(f64),
  Str(String),
}

impl TryFrom<Scalar> for String {
  type Error = String;

  fn try_from(value: Scalar) -> Result<Self, Self::Error> {
    match value {
      Scalar::Bool(b) => Ok(b.to_string()),
      Scalar::Int(i) => Ok(i.to_string()),
      Scalar::Float(f) => Err(format!("number {} must be quoted to keep its exact spelling", f)),
      Scalar::Str(s) => Ok(s),
    }
  }
}

fn scalar_map<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error> {
  let raw = BTreeMap::<String, Scalar>::deserialize(deserializer)?;
  raw
    .into_iter()
    .map(|(k, v)| match String::try_from(v) {
      Ok(v) => Ok((k, v)),
      Err(e) => Err(de::Error::custom(format!("{}: {}", k, e))),
    })
    .collect()
}

/// Map keyed by name where a repeated key is an error instead of
/// replacing the earlier entry.
fn unique_keys<'de, D, T>(deserializer: D) -> Result<IndexMap<String, T>, D::Error>
where
  D: Deserializer<'de>,
  T: Deserialize<'de>,
{
  struct UniqueKeys<T>(PhantomData<T>);

  impl<'de, T: Deserialize<'de>> Visitor<'de> for UniqueKeys<T> {
    type Value = IndexMap<String, T>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
      f.write_str("a map with unique keys")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
      let mut map = IndexMap::with_capacity(access.size_hint().unwrap_or(0));
      while let Some(key) = access.next_key::<String>()? {
        if map.contains_key(&key) {
          return Err(de::Error::custom(format!("duplicate key '{}'", key)));
        }
        let value = access.next_value()?;
        map.insert(key, value);
      }
      Ok(map)
    }
  }

  deserializer.deserialize_map(UniqueKeys(PhantomData))
}

/// The ordered values of one matrix axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ScalarValue>")]
pub struct AxisValues(pub Vec<String>);

#[derive(Deserialize)]
#[serde(transparent)]
struct ScalarValue(Scalar);

impl TryFrom<Vec<ScalarValue>> for AxisValues {
  type Error = String;

  fn try_from(values: Vec<ScalarValue>) -> Result<Self, Self::Error> {
    values
      .into_iter()
      .map(|v| String::try_from(v.0))
      .collect::<Result<_, _>>()
      .map(AxisValues)
  }
}

/// A step's matrix: its own axes, or names of project-level axes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MatrixSpec {
  Axes(#[serde(deserialize_with = "unique_keys")] IndexMap<String, AxisValues>),
  Shared(Vec<String>),
}

/// Retry policy for a single step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
  /// Extra attempts after the first failure.
  #[serde(default)]
  pub retries: u32,

  /// Delay before the first retry.
  #[serde(default = "default_backoff", with = "human")]
  pub backoff: Duration,

  /// Double the delay on every further retry.
  #[serde(default)]
  pub exponential: bool,

  /// Whether a timed-out attempt is retried.
  #[serde(default)]
  pub retry_on_timeout: bool,
}

fn default_backoff() -> Duration {
  Duration::from_secs(1)
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      retries: 0,
      backoff: default_backoff(),
      exponential: false,
      retry_on_timeout: false,
    }
  }
}

impl RetryPolicy {
  /// Delay before retry number `retry` (1-based).
  pub fn delay_for(&self, retry: u32) -> Duration {
    if !self.exponential || retry <= 1 {
      return self.backoff;
    }
    let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
    self.backoff.saturating_mul(factor)
  }
}

/// Project-wide cache settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSpec {
  #[serde(default)]
  pub paths: Vec<String>,
}

/// Per-step cache settings.
///
/// `paths` overrides the project-wide paths when present (an empty list turns
/// caching off for the step). `inputs` are the files whose content keys the
/// cache entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepCacheSpec {
  #[serde(default)]
  pub paths: Option<Vec<String>>,

  #[serde(default)]
  pub inputs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecondaryArtifact {
  #[serde(default)]
  pub files: Vec<String>,
}

/// Declared build outputs: the primary file set plus named secondary sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactSpec {
  #[serde(default)]
  pub files: Vec<String>,

  #[serde(default)]
  pub secondary: IndexMap<String, SecondaryArtifact>,
}

impl ArtifactSpec {
  pub fn is_empty(&self) -> bool {
    self.files.is_empty() && self.secondary.values().all(|s| s.files.is_empty())
  }
}

/// A named unit of build work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDef {
  /// Command units, run in order.
  #[serde(default)]
  pub commands: Vec<String>,

  #[serde(default, deserialize_with = "scalar_map")]
  pub env: BTreeMap<String, String>,

  #[serde(default, alias = "depends-on", alias = "dependsOn")]
  pub depends_on: Vec<String>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub matrix: Option<MatrixSpec>,

  #[serde(default, with = "human_opt", skip_serializing_if = "Option::is_none")]
  pub timeout: Option<Duration>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub retry: Option<RetryPolicy>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cache: Option<StepCacheSpec>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub artifacts: Option<ArtifactSpec>,

  #[serde(default, alias = "working-dir", skip_serializing_if = "Option::is_none")]
  pub working_dir: Option<String>,
}

/// A complete project definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectDef {
  /// Wall-clock bound for the whole run.
  #[serde(default, with = "human_opt", skip_serializing_if = "Option::is_none")]
  pub timeout: Option<Duration>,

  #[serde(default, deserialize_with = "scalar_map")]
  pub env: BTreeMap<String, String>,

  /// Shared axes that steps reference by name.
  #[serde(default, deserialize_with = "unique_keys")]
  pub matrix: IndexMap<String, AxisValues>,

  #[serde(default)]
  pub cache: CacheSpec,

  #[serde(default)]
  pub artifacts: ArtifactSpec,

  #[serde(default, deserialize_with = "unique_keys")]
  pub steps: IndexMap<String, StepDef>,
}

impl Hashable for ProjectDef {}
