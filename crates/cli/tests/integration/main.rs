//! CLI integration tests for stepwise.

mod common;

mod cache_tests;
mod plan_tests;
mod run_tests;
