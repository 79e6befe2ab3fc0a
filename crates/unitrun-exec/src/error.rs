//! Error types for category execution.

use thiserror::Error;
use unitrun_core::CoreError;
use unitrun_env::EnvError;

/// Errors raised while building or running a single category invocation.
#[derive(Error, Debug)]
pub enum ExecError {
    /// The category resolved to an empty command line
    #[error("category {category} resolved to an empty command")]
    EmptyCommand { category: String },

    /// No template is registered for the category's service
    #[error("no command template for service {service} (category {category})")]
    UnknownService { service: String, category: String },

    /// The program could not be started
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Signalling the process tree failed
    #[error("failed to kill process tree {pid}: {reason}")]
    Kill { pid: u32, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for execution operations.
pub type ExecResult<T> = std::result::Result<T, ExecError>;

/// Errors that abort a whole run before or around execution.
///
/// Per-category failures never show up here; they are recorded in the
/// run report instead.
#[derive(Error, Debug)]
pub enum RunError {
    /// Registry, configuration or planning failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The service environment could not be acquired and `category` needs it.
    #[error("environment acquisition failed (required by {category}): {source}")]
    EnvironmentAcquisition {
        category: String,
        #[source]
        source: EnvError,
    },

    /// The plan contained nothing to run.
    #[error("no tests were executed: the execution plan is empty")]
    ZeroTestsExecuted,
}
