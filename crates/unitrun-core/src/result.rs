//! Per-category outcome records.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::category::Priority;

/// Test counts reported by a category's runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCounts {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl TestCounts {
    pub fn new(passed: u64, failed: u64, skipped: u64) -> Self {
        Self {
            total: passed + failed + skipped,
            passed,
            failed,
            skipped,
        }
    }

    /// Tests that actually executed (skipped tests excluded).
    pub fn executed(&self) -> u64 {
        self.passed + self.failed
    }

    pub fn merge(&mut self, other: &TestCounts) {
        self.total += other.total;
        self.passed += other.passed;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

/// Why a category did not succeed, or why it never ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CategoryOutcomeReason {
    /// The subprocess exited with a non-zero code.
    ExitCode { code: i32 },
    /// The subprocess tree was killed at its timeout.
    TimedOut { after_ms: u64 },
    /// The subprocess could not be started.
    SpawnFailed { message: String },
    /// The command builder had no invocation for this category.
    CommandUnavailable { message: String },
    /// The service environment the category needs was not available.
    EnvironmentUnavailable { message: String },
    /// Never dispatched because fail-fast stopped the run.
    SkippedByFailFast { triggered_by: String },
}

impl fmt::Display for CategoryOutcomeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CategoryOutcomeReason::ExitCode { code } => write!(f, "exit code {code}"),
            CategoryOutcomeReason::TimedOut { .. } => f.write_str("TimedOut"),
            CategoryOutcomeReason::SpawnFailed { message } => write!(f, "spawn failed: {message}"),
            CategoryOutcomeReason::CommandUnavailable { message } => {
                write!(f, "no command: {message}")
            }
            CategoryOutcomeReason::EnvironmentUnavailable { message } => {
                write!(f, "environment unavailable: {message}")
            }
            CategoryOutcomeReason::SkippedByFailFast { triggered_by } => {
                write!(f, "skipped: fail-fast triggered by '{triggered_by}'")
            }
        }
    }
}

/// Outcome of one category in one run. Created once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryResult {
    pub category_name: String,
    pub priority: Priority,
    /// Phase index the category was planned into.
    pub phase: usize,
    pub success: bool,
    /// True when fail-fast short-circuited the category.
    pub skipped: bool,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    pub test_counts: TestCounts,
    pub stdout_excerpt: String,
    pub stderr_excerpt: String,
    pub reason: Option<CategoryOutcomeReason>,
}

impl CategoryResult {
    /// Record for a category that fail-fast prevented from starting.
    pub fn skipped_by_fail_fast(
        name: impl Into<String>,
        priority: Priority,
        phase: usize,
        triggered_by: impl Into<String>,
    ) -> Self {
        Self {
            category_name: name.into(),
            priority,
            phase,
            success: false,
            skipped: true,
            duration_ms: 0,
            exit_code: None,
            test_counts: TestCounts::default(),
            stdout_excerpt: String::new(),
            stderr_excerpt: String::new(),
            reason: Some(CategoryOutcomeReason::SkippedByFailFast {
                triggered_by: triggered_by.into(),
            }),
        }
    }

    /// Failed record for a category that could not run without its environment.
    pub fn environment_unavailable(
        name: impl Into<String>,
        priority: Priority,
        phase: usize,
        message: impl Into<String>,
    ) -> Self {
        Self::not_started(
            name,
            priority,
            phase,
            CategoryOutcomeReason::EnvironmentUnavailable {
                message: message.into(),
            },
        )
    }

    /// Failed record for a category that was dispatched but never spawned.
    pub fn not_started(
        name: impl Into<String>,
        priority: Priority,
        phase: usize,
        reason: CategoryOutcomeReason,
    ) -> Self {
        Self {
            category_name: name.into(),
            priority,
            phase,
            success: false,
            skipped: false,
            duration_ms: 0,
            exit_code: None,
            test_counts: TestCounts::default(),
            stdout_excerpt: String::new(),
            stderr_excerpt: reason.to_string(),
            reason: Some(reason),
        }
    }

    /// Whether the category ran (or was attempted) and did not succeed.
    pub fn failed(&self) -> bool {
        !self.skipped && !self.success
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.reason, Some(CategoryOutcomeReason::TimedOut { .. }))
    }
}

/// Keep at most `max_bytes` of the tail of `text`, cut on a char boundary.
pub fn excerpt(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
