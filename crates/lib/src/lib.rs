//! stepwise-lib: build orchestration engine
//!
//! This crate turns declarative project definitions into scheduled,
//! cached runs:
//! - `project`: the YAML/JSON project model and its validation
//! - `plan`: matrix expansion, dependency resolution and execution waves
//! - `execute`: the step executor and the bounded-concurrency wave runner
//! - `store`: the content-addressed cache and the append-only artifact store
//! - `coordinator`: wiring a whole run together

pub mod consts;
pub mod coordinator;
pub mod execute;
pub mod plan;
pub mod platform;
pub mod project;
pub mod store;
pub mod store_lock;
pub mod util;
