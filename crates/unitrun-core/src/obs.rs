//! Structured lifecycle events for runs, phases, categories and environments.
//!
//! Every event carries an `event = "..."` field so log pipelines can filter
//! on it without parsing messages. Use [`RunSpan`] to tag everything emitted
//! during a run with its `run_id`.

use tracing::{info, warn};

/// RAII guard that keeps a run-scoped span entered.
///
/// ```ignore
/// let _span = RunSpan::enter("3f2c...");
/// // events below carry run_id
/// ```
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str) -> Self {
        let span = tracing::info_span!("unitrun.run", run_id = %run_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Build the run span without entering it, for use with `Instrument`.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("unitrun.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, environment: &str, phases: usize, categories: usize) {
    info!(
        event = "run.started",
        run_id = %run_id,
        environment = %environment,
        phases = phases,
        categories = categories,
    );
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, tests_run: u64, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        tests_run = tests_run,
        success = success,
    );
}

pub fn emit_phase_started(phase: usize, categories: &[String]) {
    info!(
        event = "phase.started",
        phase = phase,
        categories = %categories.join(","),
    );
}

pub fn emit_phase_finished(phase: usize, passed: usize, failed: usize) {
    info!(
        event = "phase.finished",
        phase = phase,
        passed = passed,
        failed = failed,
    );
}

pub fn emit_category_started(name: &str, phase: usize) {
    info!(event = "category.started", category = %name, phase = phase);
}

/// `outcome` is a short human label such as `passed`, `exit code 2` or `TimedOut`.
pub fn emit_category_finished(name: &str, success: bool, duration_ms: u64, outcome: &str) {
    if success {
        info!(
            event = "category.finished",
            category = %name,
            success = success,
            duration_ms = duration_ms,
            outcome = %outcome,
        );
    } else {
        warn!(
            event = "category.finished",
            category = %name,
            success = success,
            duration_ms = duration_ms,
            outcome = %outcome,
        );
    }
}

pub fn emit_fail_fast_triggered(triggered_by: &str, reason: &str, skipped: usize) {
    warn!(
        event = "fail_fast.triggered",
        triggered_by = %triggered_by,
        reason = %reason,
        skipped = skipped,
    );
}

pub fn emit_environment_transition(env_id: &str, from: &str, to: &str) {
    info!(
        event = "environment.transition",
        env_id = %env_id,
        from = %from,
        to = %to,
    );
}

/// Release problems are logged, never propagated.
pub fn emit_environment_release_error(env_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "environment.release_error", env_id = %env_id, error = %error);
}
