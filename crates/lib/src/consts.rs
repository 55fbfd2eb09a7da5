/// Application name, used for platform directories and env var prefixes.
pub const APP_NAME: &str = "stepwise";

/// Overrides the store root (cache + artifacts).
pub const STORE_ENV: &str = "STEPWISE_STORE";

/// Overrides the cache capacity in bytes.
pub const CACHE_MAX_BYTES_ENV: &str = "STEPWISE_CACHE_MAX_BYTES";

/// Default cache capacity: 5 GiB.
pub const DEFAULT_CACHE_MAX_BYTES: u64 = 5 * 1024 * 1024 * 1024;

/// Default per-step timeout when neither the step nor the caller sets one.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 60 * 60;

/// Length of the truncated hash used for short display ids.
pub const OBJ_HASH_PREFIX_LEN: usize = 20;

/// Separator between a matrix step's base id and its axis assignment.
pub const MATRIX_ID_SEPARATOR: char = '#';

/// Upper bound on `retry.retries` for a single step.
pub const MAX_RETRIES: u32 = 10;

/// Artifact name used for a step's primary `files` output.
pub const PRIMARY_ARTIFACT: &str = "primary";

/// Environment variables set on every command unit.
pub const STEP_ID_ENV: &str = "STEPWISE_STEP_ID";
pub const RUN_ID_ENV: &str = "STEPWISE_RUN_ID";
pub const ATTEMPT_ENV: &str = "STEPWISE_ATTEMPT";
