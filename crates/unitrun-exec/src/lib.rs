//! unitrun-exec: phased execution of test categories
//!
//! Provides the run pipeline that:
//! - Builds one subprocess invocation per category
//! - Runs each phase's categories concurrently with per-category timeouts
//! - Kills whole process trees on timeout
//! - Applies fail-fast between phases and aggregates a run report

pub mod command;
pub mod context;
pub mod counts;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod process;
pub mod runner;

// Re-export key types
pub use command::{
    BuildContext, CommandBuilder, InvocationDescriptor, ServiceTemplate, TemplateCommandBuilder,
};
pub use context::{EnvironmentView, RunContext};
pub use counts::parse_test_counts;
pub use error::{ExecError, ExecResult, RunError};
pub use executor::{ExecutionOutcome, PhaseExecutor};
pub use orchestrator::{exit_code_for, RunOrchestrator};
pub use process::{ProcessExit, ProcessHandle};
pub use runner::CategoryRunner;
