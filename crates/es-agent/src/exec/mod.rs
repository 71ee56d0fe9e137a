//! Script execution

mod job;
mod runner;

pub use job::{JobExecutor, JobOutcome, DEFAULT_JOB_TIMEOUT};
pub use runner::{ProcessRunner, RunError, RunOutput, DEFAULT_SCRIPT_SHELL, NO_EXIT_CODE};
