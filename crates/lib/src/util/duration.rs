//! Serde helpers for durations.
//!
//! Project files write durations as humantime strings (`"90s"`, `"10m"`,
//! `"1h 30m"`) or as a bare integer number of seconds.

use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
  Secs(u64),
  Text(String),
}

fn parse(raw: RawDuration) -> Result<Duration, String> {
  match raw {
    RawDuration::Secs(secs) => Ok(Duration::from_secs(secs)),
    RawDuration::Text(text) => humantime::parse_duration(text.trim()).map_err(|e| format!("invalid duration '{}': {}", text, e)),
  }
}

/// Required humantime duration.
pub mod human {
  use super::*;

  pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&humantime::format_duration(*value).to_string())
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    parse(RawDuration::deserialize(deserializer)?).map_err(de::Error::custom)
  }
}

/// Optional humantime duration.
pub mod human_opt {
  use super::*;

  pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
      Some(d) => serializer.serialize_some(&humantime::format_duration(*d).to_string()),
      None => serializer.serialize_none(),
    }
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
    match Option::<RawDuration>::deserialize(deserializer)? {
      Some(raw) => parse(raw).map(Some).map_err(de::Error::custom),
      None => Ok(None),
    }
  }
}

/// Serialize a duration as integer milliseconds (reports).
pub fn serialize_millis<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
  serializer.serialize_u64(value.as_millis().min(u128::from(u64::MAX)) as u64)
}
