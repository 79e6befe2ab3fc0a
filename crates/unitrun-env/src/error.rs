//! Error types for service environment provisioning

use thiserror::Error;

/// Errors raised while provisioning or inspecting a service environment.
#[derive(Error, Debug)]
pub enum EnvError {
    /// The container runtime binary is missing or its daemon is unreachable
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// A container runtime command exited unsuccessfully
    #[error("container command failed: {0}")]
    CommandFailed(String),

    /// The environment could not be brought to a healthy state
    #[error("failed to acquire environment {env_id}: {reason}")]
    AcquisitionFailed { env_id: String, reason: String },

    /// A service did not report healthy within the budget
    #[error("service {service} not healthy after {waited_ms} ms")]
    HealthTimeout { service: String, waited_ms: u64 },

    /// No free host port in the probe window
    #[error("no free port for {service} in {first}..={last}")]
    PortExhausted { service: String, first: u16, last: u16 },

    /// Status change not permitted by the lifecycle
    #[error("environment {env_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        env_id: String,
        from: String,
        to: String,
    },

    /// No environment with this id is tracked
    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),

    /// The environment has no service with this name
    #[error("unknown service {service} in environment {env_id}")]
    UnknownService { env_id: String, service: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP health probe error
    #[error("HTTP error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for EnvError {
    fn from(err: reqwest::Error) -> Self {
        EnvError::Http(err.to_string())
    }
}

/// Result type for environment operations
pub type EnvResult<T> = std::result::Result<T, EnvError>;
