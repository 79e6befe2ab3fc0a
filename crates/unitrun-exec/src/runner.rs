//! Single-category execution.

use std::time::{Duration, Instant};

use tracing::{debug, warn};
use unitrun_core::{excerpt, Category, CategoryOutcomeReason, CategoryResult};

use crate::command::InvocationDescriptor;
use crate::counts::parse_test_counts;
use crate::error::ExecError;
use crate::process::{ProcessExit, ProcessHandle};

/// Runs one category invocation to completion and classifies the outcome.
#[derive(Debug, Clone, Copy)]
pub struct CategoryRunner {
    /// Kill the process tree after this long.
    pub timeout: Duration,
    /// Tail bytes of stdout/stderr kept in the result.
    pub excerpt_bytes: usize,
}

impl CategoryRunner {
    pub fn new(timeout: Duration, excerpt_bytes: usize) -> Self {
        Self {
            timeout,
            excerpt_bytes,
        }
    }

    /// Execute `invocation` for `category` planned into `phase`.
    ///
    /// Never fails: spawn errors and timeouts become failed results.
    pub async fn run(
        &self,
        category: &Category,
        phase: usize,
        invocation: &InvocationDescriptor,
    ) -> CategoryResult {
        let started = Instant::now();
        let handle = match ProcessHandle::spawn(invocation) {
            Ok(handle) => handle,
            Err(e) => return self.spawn_failed(category, phase, e, started.elapsed()),
        };
        match handle.wait(self.timeout).await {
            Ok(exit) => self.classify(category, phase, exit, started.elapsed()),
            Err(e) => {
                warn!(category = %category.name, error = %e, "waiting on category failed");
                self.spawn_failed(category, phase, e, started.elapsed())
            }
        }
    }

    fn classify(
        &self,
        category: &Category,
        phase: usize,
        exit: ProcessExit,
        elapsed: Duration,
    ) -> CategoryResult {
        let combined = format!("{}\n{}", exit.stdout, exit.stderr);
        let test_counts = parse_test_counts(&combined).unwrap_or_default();
        let success = exit.success();
        let exit_code = if exit.timed_out {
            None
        } else {
            // Killed by a signal.
            Some(exit.code().unwrap_or(-1))
        };
        let reason = if exit.timed_out {
            Some(CategoryOutcomeReason::TimedOut {
                after_ms: self.timeout.as_millis() as u64,
            })
        } else if success {
            None
        } else {
            Some(CategoryOutcomeReason::ExitCode {
                code: exit_code.unwrap_or(-1),
            })
        };
        debug!(
            category = %category.name,
            success,
            exit_code = ?exit_code,
            passed = test_counts.passed,
            failed = test_counts.failed,
            "category exited"
        );

        CategoryResult {
            category_name: category.name.clone(),
            priority: category.priority,
            phase,
            success,
            skipped: false,
            duration_ms: elapsed.as_millis() as u64,
            exit_code,
            test_counts,
            stdout_excerpt: excerpt(&exit.stdout, self.excerpt_bytes),
            stderr_excerpt: excerpt(&exit.stderr, self.excerpt_bytes),
            reason,
        }
    }

    fn spawn_failed(
        &self,
        category: &Category,
        phase: usize,
        error: ExecError,
        elapsed: Duration,
    ) -> CategoryResult {
        let mut result = CategoryResult::not_started(
            &category.name,
            category.priority,
            phase,
            CategoryOutcomeReason::SpawnFailed {
                message: error.to_string(),
            },
        );
        result.duration_ms = elapsed.as_millis() as u64;
        result
    }
}
