//! Progress callbacks invoked by the phase executor.

use crate::planner::ExecutionPlan;
use crate::result::TestCounts;

/// Observer of run progress. Calls for categories in the same phase may
/// arrive concurrently from different tasks.
pub trait ProgressReporter: Send + Sync {
    fn start_run(&self, run_id: &str, plan: &ExecutionPlan);
    fn start_phase(&self, index: usize, categories: &[String]);
    fn start_category(&self, name: &str, phase: usize);
    fn complete_category(&self, name: &str, success: bool, counts: &TestCounts);
    fn complete_run(&self, success: bool);
}

/// Logs progress as human-readable tracing messages. Structured run events
/// are emitted by the executor regardless of the reporter.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressReporter for TracingProgress {
    fn start_run(&self, run_id: &str, plan: &ExecutionPlan) {
        tracing::info!(
            run_id = %run_id,
            phases = plan.phases.len(),
            digest = %plan.short_digest(),
            "executing plan"
        );
    }

    fn start_phase(&self, index: usize, categories: &[String]) {
        tracing::info!("phase {index}: {}", categories.join(", "));
    }

    fn start_category(&self, name: &str, phase: usize) {
        tracing::info!("phase {phase}: starting {name}");
    }

    fn complete_category(&self, name: &str, success: bool, counts: &TestCounts) {
        tracing::debug!(
            category = %name,
            success = success,
            passed = counts.passed,
            failed = counts.failed,
            skipped = counts.skipped,
            "category counts"
        );
    }

    fn complete_run(&self, success: bool) {
        tracing::debug!(success = success, "plan execution complete");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn start_run(&self, _run_id: &str, _plan: &ExecutionPlan) {}
    fn start_phase(&self, _index: usize, _categories: &[String]) {}
    fn start_category(&self, _name: &str, _phase: usize) {}
    fn complete_category(&self, _name: &str, _success: bool, _counts: &TestCounts) {}
    fn complete_run(&self, _success: bool) {}
}
