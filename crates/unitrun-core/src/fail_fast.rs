//! Fail-fast policies: whether to stop dispatching after a phase.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::category::Priority;
use crate::error::CoreError;
use crate::result::CategoryResult;

/// Built-in fail-fast behaviours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailFastMode {
    /// Never stop early.
    Disabled,
    /// Stop after any category fails.
    FirstFailure,
    /// Stop on a critical failure or when the failure rate passes the threshold.
    #[default]
    CategoryFailure,
    /// Stop only when a critical-priority category fails.
    CriticalFailure,
}

impl FailFastMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailFastMode::Disabled => "disabled",
            FailFastMode::FirstFailure => "first_failure",
            FailFastMode::CategoryFailure => "category_failure",
            FailFastMode::CriticalFailure => "critical_failure",
        }
    }
}

impl fmt::Display for FailFastMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailFastMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "disabled" | "off" | "none" => Ok(FailFastMode::Disabled),
            "first_failure" => Ok(FailFastMode::FirstFailure),
            "category_failure" => Ok(FailFastMode::CategoryFailure),
            "critical_failure" => Ok(FailFastMode::CriticalFailure),
            other => Err(CoreError::Config(format!("unknown fail-fast mode: {other}"))),
        }
    }
}

/// Why a run stopped dispatching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopDecision {
    /// Category whose failure tripped the policy.
    pub triggered_by: String,
    pub reason: String,
}

/// Pluggable decision seam consulted by the phase executor after every phase.
pub trait FailFastStrategy: Send + Sync {
    /// `results` holds every result recorded so far, in execution order.
    fn should_stop(&self, results: &[CategoryResult]) -> Option<StopDecision>;
}

/// Configurable policy implementing the built-in modes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailFastPolicy {
    #[serde(default)]
    pub mode: FailFastMode,

    /// Failure-rate trip point for `category_failure`; `None` disables it.
    #[serde(default = "default_threshold")]
    pub failure_rate_threshold: Option<f64>,

    /// Executed categories required before the rate is considered.
    #[serde(default = "default_min_executed")]
    pub min_executed_for_rate: usize,
}

fn default_threshold() -> Option<f64> {
    Some(0.5)
}

fn default_min_executed() -> usize {
    4
}

impl Default for FailFastPolicy {
    fn default() -> Self {
        Self::new(FailFastMode::default())
    }
}

impl FailFastPolicy {
    pub fn new(mode: FailFastMode) -> Self {
        Self {
            mode,
            failure_rate_threshold: default_threshold(),
            min_executed_for_rate: default_min_executed(),
        }
    }

    pub fn with_threshold(mut self, threshold: Option<f64>, min_executed: usize) -> Self {
        self.failure_rate_threshold = threshold;
        self.min_executed_for_rate = min_executed;
        self
    }

    fn first_critical_failure(results: &[CategoryResult]) -> Option<StopDecision> {
        results
            .iter()
            .find(|r| r.failed() && r.priority == Priority::Critical)
            .map(|r| StopDecision {
                triggered_by: r.category_name.clone(),
                reason: format!("critical category '{}' failed", r.category_name),
            })
    }

    fn rate_exceeded(&self, results: &[CategoryResult]) -> Option<StopDecision> {
        let threshold = self.failure_rate_threshold?;
        let executed: Vec<&CategoryResult> = results.iter().filter(|r| !r.skipped).collect();
        if executed.is_empty() || executed.len() < self.min_executed_for_rate {
            return None;
        }
        let failed: Vec<&&CategoryResult> = executed.iter().filter(|r| r.failed()).collect();
        let rate = failed.len() as f64 / executed.len() as f64;
        if rate > threshold {
            let last = failed.last()?;
            Some(StopDecision {
                triggered_by: last.category_name.clone(),
                reason: format!(
                    "failure rate {:.2} exceeds threshold {:.2} ({} of {} categories)",
                    rate,
                    threshold,
                    failed.len(),
                    executed.len()
                ),
            })
        } else {
            None
        }
    }
}

impl FailFastStrategy for FailFastPolicy {
    fn should_stop(&self, results: &[CategoryResult]) -> Option<StopDecision> {
        match self.mode {
            FailFastMode::Disabled => None,
            FailFastMode::FirstFailure => results.iter().find(|r| r.failed()).map(|r| StopDecision {
                triggered_by: r.category_name.clone(),
                reason: format!("category '{}' failed", r.category_name),
            }),
            FailFastMode::CriticalFailure => Self::first_critical_failure(results),
            FailFastMode::CategoryFailure => {
                Self::first_critical_failure(results).or_else(|| self.rate_exceeded(results))
            }
        }
    }
}
