//! Explicit per-run context threaded through execution.

use std::fmt;
use std::sync::Arc;

use unitrun_core::{CategoryRegistry, EnvironmentSelector, RunConfig};

/// What the run knows about its service environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentView {
    /// Nothing in the plan needs services.
    NotRequired,
    /// The selector points at services this process does not provision.
    External { selector: EnvironmentSelector },
    /// Provisioned for this run (or joined, when shared).
    Acquired {
        env_id: String,
        vars: Vec<(String, String)>,
    },
    /// Acquisition failed or was disabled; needing categories fail.
    Unavailable { reason: String },
}

impl EnvironmentView {
    pub fn is_available(&self) -> bool {
        !matches!(self, EnvironmentView::Unavailable { .. })
    }

    /// Variables exported to category subprocesses.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        match self {
            EnvironmentView::Acquired { vars, .. } => vars.clone(),
            _ => Vec::new(),
        }
    }

    pub fn env_id(&self) -> Option<&str> {
        match self {
            EnvironmentView::Acquired { env_id, .. } => Some(env_id),
            _ => None,
        }
    }

    pub fn unavailable_reason(&self) -> Option<&str> {
        match self {
            EnvironmentView::Unavailable { reason } => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for EnvironmentView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentView::NotRequired => f.write_str("not required"),
            EnvironmentView::External { selector } => write!(f, "external ({selector})"),
            EnvironmentView::Acquired { env_id, .. } => write!(f, "{env_id}"),
            EnvironmentView::Unavailable { reason } => write!(f, "unavailable: {reason}"),
        }
    }
}

/// Everything one run needs, passed by reference instead of held in globals.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub config: Arc<RunConfig>,
    pub registry: Arc<CategoryRegistry>,
    pub environment: EnvironmentView,
}

impl RunContext {
    pub fn new(
        run_id: impl Into<String>,
        config: Arc<RunConfig>,
        registry: Arc<CategoryRegistry>,
        environment: EnvironmentView,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            config,
            registry,
            environment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_blocks_categories() {
        assert!(EnvironmentView::NotRequired.is_available());
        assert!(EnvironmentView::External {
            selector: EnvironmentSelector::Staging
        }
        .is_available());
        let down = EnvironmentView::Unavailable {
            reason: "docker down".into(),
        };
        assert!(!down.is_available());
        assert_eq!(down.unavailable_reason(), Some("docker down"));
        assert_eq!(down.to_string(), "unavailable: docker down");
    }

    #[test]
    fn test_acquired_exports_vars() {
        let view = EnvironmentView::Acquired {
            env_id: "unitrun-r1".into(),
            vars: vec![("POSTGRES_PORT".into(), "5434".into())],
        };
        assert_eq!(view.env_id(), Some("unitrun-r1"));
        assert_eq!(view.env_vars().len(), 1);
        assert!(EnvironmentView::NotRequired.env_vars().is_empty());
    }
}
