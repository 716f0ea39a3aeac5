//! Building blocks of the sandbox executor: process execution and the
//! filesystem steps around it.

pub mod exec;
pub mod fs;

pub use exec::{ProcessOutput, ProcessSpec, process_env, run_process};
pub use fs::{Placement, container_path, extract, place, stage};
