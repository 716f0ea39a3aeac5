mod cache;
mod gc;
mod info;
mod plan;
mod run;

pub use cache::{cmd_cache_clear, cmd_cache_list};
pub use gc::cmd_gc;
pub use info::cmd_info;
pub use plan::cmd_plan;
pub use run::cmd_run;
