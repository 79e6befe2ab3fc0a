//! Structured lifecycle events carry their `event` field and identifiers.

use unitrun_core::obs::{
    emit_category_finished, emit_category_started, emit_environment_release_error,
    emit_environment_transition, emit_fail_fast_triggered, emit_phase_finished,
    emit_phase_started, emit_run_finished, emit_run_started, RunSpan,
};
use unitrun_core::{
    CategoryRegistry, ExecutionPlanner, ProgressReporter, TestCounts, TracingProgress,
};
use tracing_test::traced_test;

#[traced_test]
#[test]
fn test_run_started_logs_run_id_and_environment() {
    emit_run_started("run-123", "test", 3, 7);
    assert!(logs_contain("run.started"));
    assert!(logs_contain("run-123"));
}

#[traced_test]
#[test]
fn test_run_finished_logs_outcome() {
    emit_run_finished("run-456", 5000, 42, true);
    assert!(logs_contain("run.finished"));
    assert!(logs_contain("tests_run=42"));
}

#[traced_test]
#[test]
fn test_phase_events_list_categories() {
    emit_phase_started(1, &["api".to_string(), "websocket".to_string()]);
    emit_phase_finished(1, 2, 0);
    assert!(logs_contain("phase.started"));
    assert!(logs_contain("api,websocket"));
    assert!(logs_contain("phase.finished"));
}

#[traced_test]
#[test]
fn test_failed_category_logs_at_warn() {
    emit_category_started("integration", 2);
    emit_category_finished("integration", false, 1200, "TimedOut");
    assert!(logs_contain("category.finished"));
    assert!(logs_contain("TimedOut"));
    assert!(logs_contain("WARN"));
}

#[traced_test]
#[test]
fn test_fail_fast_and_environment_events() {
    emit_fail_fast_triggered("unit", "critical category 'unit' failed", 4);
    emit_environment_transition("unitrun-abc", "acquiring", "healthy");
    emit_environment_release_error("unitrun-abc", &"docker rm exited 1");
    assert!(logs_contain("fail_fast.triggered"));
    assert!(logs_contain("environment.transition"));
    assert!(logs_contain("environment.release_error"));
}

#[traced_test]
#[test]
fn test_run_span_tags_nested_events() {
    let span = RunSpan::enter("span-run-1");
    emit_category_started("smoke", 0);
    drop(span);
    assert!(logs_contain("span-run-1"));
}

#[traced_test]
#[test]
fn test_tracing_progress_logs_phase_and_category() {
    let registry = CategoryRegistry::builtin().unwrap();
    let plan = ExecutionPlanner::new(&registry)
        .create_plan(["smoke"], 4)
        .unwrap();
    let progress = TracingProgress;
    progress.start_run("run-progress", &plan);
    progress.start_phase(0, &plan.phases[0].categories);
    progress.start_category("smoke", 0);
    progress.complete_category("smoke", true, &TestCounts::new(3, 0, 0));
    progress.complete_run(true);
    assert!(logs_contain("executing plan"));
    assert!(logs_contain("phase 0: smoke"));
    assert!(logs_contain("phase 0: starting smoke"));
}
