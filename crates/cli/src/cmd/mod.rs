mod cache;
mod plan;
mod run;

pub use cache::{CacheCommand, cmd_cache};
pub use plan::{PlanArgs, cmd_plan};
pub use run::{RunArgs, cmd_run};
