pub mod auth;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod host;
pub mod orchestrator;
pub mod scheduler;
pub mod ssh;
pub mod utils;

pub use cli::Cli;
pub use config::Config;
pub use context::{ContextScope, ExecutionContext, Overrides, Settings};
pub use error::{Error, Result};
pub use host::HostSpec;
pub use orchestrator::{
    task_fn, ExecutionResults, HostContext, HostSelection, Orchestrator, RunOptions, Task,
    TaskArgs, TaskMetadata, TaskValue,
};
pub use scheduler::HostScheduler;
