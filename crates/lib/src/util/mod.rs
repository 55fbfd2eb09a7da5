//! Shared utilities.
//!
//! Common utilities used across the crate including hashing, glob expansion,
//! duration serde helpers and test helpers.

pub mod duration;
pub mod glob;
pub mod hash;

#[cfg(test)]
pub mod testutil;
