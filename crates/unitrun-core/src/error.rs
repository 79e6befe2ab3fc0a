//! Error taxonomy for category configuration and planning.

use thiserror::Error;

/// Errors produced while loading categories or building an execution plan.
///
/// Every variant is fatal for the request that produced it and surfaces
/// before any subprocess is spawned.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The category registry or run configuration is malformed.
    #[error("configuration error: {0}")]
    Config(String),

    /// The dependency graph contains a cycle. The path repeats its first node.
    #[error("cyclic category dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// A run requested a category the registry does not know.
    #[error("unknown category requested: {name}")]
    UnknownCategory { name: String },

    /// Lookup of a category that is not registered.
    #[error("category not found: {name}")]
    NotFound { name: String },

    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;
