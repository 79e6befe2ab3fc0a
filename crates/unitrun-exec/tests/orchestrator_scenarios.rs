//! End-to-end runs against shell-script categories and a fake container runtime.

#![cfg(unix)]

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tracing_test::traced_test;

use unitrun_core::{
    Category, CategoryOutcomeReason, CategoryRegistry, EnvironmentSelector, EnvironmentType,
    ExecutionPlan, FailFastMode, FailFastPolicy, NoopProgress, Priority, ProgressReporter,
    RegistryConfig, RunConfig, RunOutcome, TestCounts,
};
use unitrun_env::fakes::FakeContainerRuntime;
use unitrun_env::{EnvironmentStatus, ManagerConfig, ServiceEnvironmentManager};
use unitrun_exec::{
    exit_code_for, BuildContext, CommandBuilder, ExecResult, InvocationDescriptor, RunError,
    RunOrchestrator, TemplateCommandBuilder,
};

fn script(name: &str, priority: Priority, body: &str) -> Category {
    Category::new(name, priority).with_command(["sh", "-c", body])
}

fn passing(name: &str, priority: Priority) -> Category {
    script(name, priority, "echo '===== 2 passed in 0.01s ====='")
}

fn failing(name: &str, priority: Priority) -> Category {
    script(name, priority, "echo '===== 1 passed, 1 failed in 0.01s ====='; exit 1")
}

fn registry(categories: Vec<Category>) -> Arc<CategoryRegistry> {
    Arc::new(CategoryRegistry::load(RegistryConfig::new(categories)).unwrap())
}

fn manager(runtime: Arc<FakeContainerRuntime>) -> Arc<ServiceEnvironmentManager> {
    let mut config = ManagerConfig::for_selector(EnvironmentSelector::Test);
    config.host_probes = false;
    config.health_budget = Duration::from_millis(200);
    config.health_interval = Duration::from_millis(10);
    Arc::new(ServiceEnvironmentManager::new(runtime, config))
}

fn orchestrator(categories: Vec<Category>, runtime: Arc<FakeContainerRuntime>) -> RunOrchestrator {
    RunOrchestrator::new(registry(categories), manager(runtime))
        .with_progress(Arc::new(NoopProgress))
}

/// Records which categories had an invocation built.
#[derive(Default)]
struct RecordingBuilder {
    inner: TemplateCommandBuilder,
    built: Mutex<Vec<String>>,
}

impl RecordingBuilder {
    fn built(&self) -> Vec<String> {
        self.built.lock().unwrap().clone()
    }
}

impl CommandBuilder for RecordingBuilder {
    fn build(
        &self,
        service: &str,
        category: &Category,
        ctx: &BuildContext<'_>,
    ) -> ExecResult<InvocationDescriptor> {
        self.built.lock().unwrap().push(category.name.clone());
        self.inner.build(service, category, ctx)
    }
}

struct PanickingBuilder;

impl CommandBuilder for PanickingBuilder {
    fn build(
        &self,
        _service: &str,
        _category: &Category,
        _ctx: &BuildContext<'_>,
    ) -> ExecResult<InvocationDescriptor> {
        panic!("builder exploded");
    }
}

/// Panics while building `target`, after giving siblings time to start.
struct SlowPanicBuilder {
    target: &'static str,
    inner: TemplateCommandBuilder,
}

impl CommandBuilder for SlowPanicBuilder {
    fn build(
        &self,
        service: &str,
        category: &Category,
        ctx: &BuildContext<'_>,
    ) -> ExecResult<InvocationDescriptor> {
        if category.name == self.target {
            std::thread::sleep(Duration::from_millis(500));
            panic!("builder exploded");
        }
        self.inner.build(service, category, ctx)
    }
}

/// Records run-level progress callbacks.
#[derive(Default)]
struct RecordingProgress {
    events: Mutex<Vec<String>>,
}

impl RecordingProgress {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressReporter for RecordingProgress {
    fn start_run(&self, run_id: &str, _plan: &ExecutionPlan) {
        self.events.lock().unwrap().push(format!("start_run:{run_id}"));
    }

    fn start_phase(&self, _index: usize, _categories: &[String]) {}

    fn start_category(&self, _name: &str, _phase: usize) {}

    fn complete_category(&self, _name: &str, _success: bool, _counts: &TestCounts) {}

    fn complete_run(&self, success: bool) {
        self.events.lock().unwrap().push(format!("complete_run:{success}"));
    }
}

/// Alive and not a zombie.
#[cfg(target_os = "linux")]
fn is_running(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| stat.rsplit(')').next().map(|rest| !rest.trim_start().starts_with('Z')))
        .unwrap_or(false)
}

#[tokio::test]
async fn test_dependency_runs_in_earlier_phase() {
    let orch = orchestrator(
        vec![
            passing("A", Priority::High).depends_on("B"),
            passing("B", Priority::High),
        ],
        Arc::new(FakeContainerRuntime::new()),
    );
    let config = RunConfig::default();

    let plan = orch.plan(&["A"], &config).unwrap();
    assert_eq!(plan.phases.len(), 2);
    assert_eq!(plan.phases[0].categories, vec!["B".to_string()]);
    assert_eq!(plan.phases[1].categories, vec!["A".to_string()]);

    let report = orch.run(&["A"], config).await.unwrap();
    let order: Vec<&str> = report.results.iter().map(|r| r.category_name.as_str()).collect();
    assert_eq!(order, vec!["B", "A"]);
    assert!(report.overall_success);
    assert_eq!(report.totals().passed, 4);
    assert_eq!(exit_code_for(&Ok(report)), 0);
}

#[tokio::test]
async fn test_conflicting_pair_runs_in_separate_phases() {
    let orch = orchestrator(
        vec![
            passing("X", Priority::Medium).conflicts_with("Y"),
            passing("Y", Priority::Medium),
        ],
        Arc::new(FakeContainerRuntime::new()),
    );
    let config = RunConfig {
        max_parallel: 2,
        ..RunConfig::default()
    };
    let report = orch.run(&["X", "Y"], config).await.unwrap();
    assert_eq!(report.plan.phases.len(), 2);
    assert!(report.plan.phases.iter().all(|p| p.len() == 1));
    assert!(report.overall_success);
}

#[tokio::test]
async fn test_empty_request_fails_without_running_anything() {
    let runtime = Arc::new(FakeContainerRuntime::new());
    let orch = orchestrator(vec![passing("A", Priority::High)], Arc::clone(&runtime));
    let empty: [&str; 0] = [];
    let result = orch.run(&empty, RunConfig::default()).await;
    assert!(matches!(result, Err(RunError::ZeroTestsExecuted)));
    assert_eq!(exit_code_for(&result), 1);
    assert_eq!(runtime.start_count(), 0);
}

#[tokio::test]
async fn test_timeout_fails_category_and_later_phases_still_run() {
    let orch = orchestrator(
        vec![
            script("slow", Priority::High, "sleep 30 & sleep 30")
                .with_timeout(Duration::from_millis(300)),
            passing("after", Priority::Medium).depends_on("slow"),
        ],
        Arc::new(FakeContainerRuntime::new()),
    );
    let started = Instant::now();
    let report = orch.run(&["after"], RunConfig::default()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));

    let slow = &report.results[0];
    assert_eq!(slow.category_name, "slow");
    assert!(!slow.success);
    assert!(slow.timed_out());
    assert_eq!(slow.reason.as_ref().unwrap().to_string(), "TimedOut");

    let after = &report.results[1];
    assert!(after.success);
    assert!(!after.skipped);
    assert!(!report.overall_success);
    assert_eq!(report.outcome, RunOutcome::TestsFailed);
}

#[tokio::test]
async fn test_acquisition_failure_is_not_fatal_without_needing_categories() {
    let runtime = Arc::new(FakeContainerRuntime::unavailable());
    let orch = orchestrator(vec![passing("lint", Priority::Low)], runtime);
    let config = RunConfig {
        real_services: true,
        ..RunConfig::default()
    };
    let report = orch.run(&["lint"], config).await.unwrap();
    assert!(report.overall_success);
    assert!(report
        .environment_status
        .as_deref()
        .unwrap()
        .starts_with("unavailable"));
}

#[tokio::test]
async fn test_acquisition_failure_aborts_before_spawning_when_required() {
    let runtime = Arc::new(FakeContainerRuntime::unavailable());
    let builder = Arc::new(RecordingBuilder::default());
    let orch = orchestrator(
        vec![
            passing("db", Priority::High).docker(),
            passing("unit", Priority::Critical),
        ],
        runtime,
    )
    .with_command_builder(builder.clone());

    let result = orch.run(&["db", "unit"], RunConfig::default()).await;
    match &result {
        Err(RunError::EnvironmentAcquisition { category, .. }) => assert_eq!(category, "db"),
        other => panic!("expected acquisition error, got {other:?}"),
    }
    assert_eq!(exit_code_for(&result), 1);
    assert!(builder.built().is_empty());
}

#[traced_test]
#[tokio::test]
async fn test_acquisition_failure_completes_progress() {
    let runtime = Arc::new(FakeContainerRuntime::unavailable());
    let progress = Arc::new(RecordingProgress::default());
    let orch = orchestrator(vec![passing("db", Priority::High).docker()], runtime)
        .with_progress(progress.clone());

    let result = orch.run_with_id("nodb", &["db"], RunConfig::default()).await;
    assert!(matches!(result, Err(RunError::EnvironmentAcquisition { .. })));
    assert_eq!(
        progress.events(),
        vec!["start_run:nodb".to_string(), "complete_run:false".to_string()]
    );
    assert!(logs_contain("run.finished"));
}

#[tokio::test]
async fn test_optional_category_fails_individually_without_environment() {
    let runtime = Arc::new(FakeContainerRuntime::unavailable());
    let orch = orchestrator(
        vec![
            passing("perf", Priority::Low).docker().optional(),
            passing("unit", Priority::Critical),
        ],
        runtime,
    );
    let config = RunConfig {
        fail_fast: FailFastPolicy::new(FailFastMode::Disabled),
        ..RunConfig::default()
    };
    let report = orch.run(&["perf", "unit"], config).await.unwrap();
    let perf = report
        .results
        .iter()
        .find(|r| r.category_name == "perf")
        .unwrap();
    assert!(perf.failed());
    assert!(matches!(
        perf.reason,
        Some(CategoryOutcomeReason::EnvironmentUnavailable { .. })
    ));
    let unit = report
        .results
        .iter()
        .find(|r| r.category_name == "unit")
        .unwrap();
    assert!(unit.success);
    assert!(!report.overall_success);
}

#[tokio::test]
#[traced_test]
async fn test_first_failure_skips_every_later_phase() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("phase3-ran");
    let builder = Arc::new(RecordingBuilder::default());
    let orch = orchestrator(
        vec![
            failing("first", Priority::Medium),
            passing("second", Priority::Medium).depends_on("first"),
            script(
                "third",
                Priority::Medium,
                &format!("touch {}", marker.display()),
            )
            .depends_on("second"),
        ],
        Arc::new(FakeContainerRuntime::new()),
    )
    .with_command_builder(builder.clone());

    let config = RunConfig {
        fail_fast: FailFastPolicy::new(FailFastMode::FirstFailure),
        ..RunConfig::default()
    };
    let result = orch.run(&["third"], config).await;
    assert_eq!(exit_code_for(&result), 1);
    let report = result.unwrap();

    assert_eq!(report.plan.phases.len(), 3);
    assert_eq!(report.results.len(), 3);
    for skipped in &report.results[1..] {
        assert!(skipped.skipped);
        assert_eq!(
            skipped.reason,
            Some(CategoryOutcomeReason::SkippedByFailFast {
                triggered_by: "first".to_string()
            })
        );
    }
    assert_eq!(report.fail_fast.as_ref().unwrap().triggered_by, "first");
    assert_eq!(builder.built(), vec!["first".to_string()]);
    assert!(!marker.exists());
    assert!(logs_contain("fail_fast.triggered"));
}

#[tokio::test]
async fn test_category_failure_mode_continues_past_non_critical_failure() {
    let orch = orchestrator(
        vec![
            failing("flaky", Priority::Medium),
            passing("next", Priority::Medium).depends_on("flaky"),
        ],
        Arc::new(FakeContainerRuntime::new()),
    );
    let report = orch.run(&["next"], RunConfig::default()).await.unwrap();
    assert!(report.fail_fast.is_none());
    assert!(report.results[1].success);
    assert!(!report.overall_success);
}

#[tokio::test]
async fn test_critical_failure_stops_under_default_mode() {
    let orch = orchestrator(
        vec![
            failing("smoke", Priority::Critical),
            passing("api", Priority::High).depends_on("smoke"),
        ],
        Arc::new(FakeContainerRuntime::new()),
    );
    let report = orch.run(&["api"], RunConfig::default()).await.unwrap();
    assert!(report.results[1].skipped);
    assert_eq!(report.skipped_categories().len(), 1);
    assert_eq!(report.failed_categories().len(), 1);
}

#[tokio::test]
async fn test_successful_categories_without_tests_fail_the_run() {
    let orch = orchestrator(
        vec![script("quiet", Priority::Medium, "echo nothing collected")],
        Arc::new(FakeContainerRuntime::new()),
    );
    let report = orch.run(&["quiet"], RunConfig::default()).await.unwrap();
    assert!(report.results[0].success);
    assert!(!report.overall_success);
    assert_eq!(report.outcome, RunOutcome::NoTestsExecuted);
    assert!(report.render_summary().contains("no tests were executed"));
    assert_eq!(exit_code_for(&Ok(report)), 1);
}

#[tokio::test]
async fn test_environment_ports_reach_categories_and_are_released() {
    let runtime = Arc::new(FakeContainerRuntime::new());
    let orch = orchestrator(
        vec![script(
            "db",
            Priority::High,
            "test -n \"$POSTGRES_PORT\" && test -n \"$UNITRUN_ENV_ID\" && echo '1 passed in 0.01s'",
        )
        .docker()],
        Arc::clone(&runtime),
    );
    let report = orch
        .run_with_id("ports1", &["db"], RunConfig::default())
        .await
        .unwrap();
    assert!(report.overall_success, "{}", report.render_summary());
    assert_eq!(runtime.start_count(), 3);
    assert!(runtime.running().is_empty());
    assert_eq!(
        report.environment_status.as_deref(),
        Some("unitrun-ports1: released")
    );
    assert_eq!(
        orch.environments().status("unitrun-ports1").await,
        Some(EnvironmentStatus::Released)
    );
}

#[tokio::test]
async fn test_environment_released_when_execution_panics() {
    let runtime = Arc::new(FakeContainerRuntime::new());
    let orch = orchestrator(
        vec![passing("db", Priority::High).docker()],
        Arc::clone(&runtime),
    )
    .with_command_builder(Arc::new(PanickingBuilder));

    let outcome = AssertUnwindSafe(orch.run_with_id("boom", &["db"], RunConfig::default()))
        .catch_unwind()
        .await;
    assert!(outcome.is_err());
    assert!(runtime.running().is_empty());
    assert_eq!(
        orch.environments().status("unitrun-boom").await,
        Some(EnvironmentStatus::Released)
    );
}

#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_category_kills_running_siblings() {
    let dir = tempfile::tempdir().unwrap();
    let pidfile = dir.path().join("sleeper.pid");
    let sleeper = script(
        "sleeper",
        Priority::Low,
        &format!("sleep 30 & echo $! > {}; wait", pidfile.display()),
    );
    let orch = orchestrator(
        vec![passing("boom", Priority::Critical), sleeper],
        Arc::new(FakeContainerRuntime::new()),
    )
    .with_command_builder(Arc::new(SlowPanicBuilder {
        target: "boom",
        inner: TemplateCommandBuilder::default(),
    }));

    let outcome = AssertUnwindSafe(orch.run(&["boom", "sleeper"], RunConfig::default()))
        .catch_unwind()
        .await;
    assert!(outcome.is_err());

    let pid: u32 = std::fs::read_to_string(&pidfile)
        .expect("sleeper started before the panic")
        .trim()
        .parse()
        .unwrap();
    let started = Instant::now();
    while is_running(pid) {
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "sleeper tree {pid} outlived the panicked run"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_shared_environment_survives_concurrent_runs() {
    let runtime = Arc::new(FakeContainerRuntime::new());
    let orch = orchestrator(
        vec![script("db", Priority::High, "sleep 0.2; echo '1 passed in 0.2s'").docker()],
        Arc::clone(&runtime),
    );
    let config = RunConfig {
        env_type: EnvironmentType::Shared,
        ..RunConfig::default()
    };
    let (a, b) = tokio::join!(
        orch.run_with_id("run-a", &["db"], config.clone()),
        orch.run_with_id("run-b", &["db"], config.clone()),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.overall_success);
    assert!(b.overall_success);
    for report in [&a, &b] {
        assert!(report
            .environment_status
            .as_deref()
            .unwrap()
            .starts_with("unitrun-shared-test"));
    }
    assert!(runtime.running().is_empty());
}

#[tokio::test]
async fn test_disabled_provisioning_fails_needing_categories_only() {
    let runtime = Arc::new(FakeContainerRuntime::new());
    let orch = orchestrator(
        vec![
            passing("db", Priority::High).docker(),
            passing("unit", Priority::High),
        ],
        Arc::clone(&runtime),
    )
    .without_provisioning();
    let report = orch.run(&["db", "unit"], RunConfig::default()).await.unwrap();
    assert_eq!(runtime.start_count(), 0);
    assert_eq!(report.failed_categories().len(), 1);
    assert_eq!(report.failed_categories()[0].category_name, "db");
}

#[tokio::test]
async fn test_report_written_when_path_configured() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reports").join("run.json");
    let orch = orchestrator(
        vec![passing("unit", Priority::Critical)],
        Arc::new(FakeContainerRuntime::new()),
    );
    let config = RunConfig {
        report_path: Some(path.clone()),
        ..RunConfig::default()
    };
    let report = orch.run(&["unit"], config).await.unwrap();
    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(written["run_id"], report.run_id.as_str());
    assert_eq!(written["overall_success"], true);
}

#[tokio::test]
async fn test_unknown_category_is_fatal_before_provisioning() {
    let runtime = Arc::new(FakeContainerRuntime::new());
    let orch = orchestrator(vec![passing("unit", Priority::Critical)], Arc::clone(&runtime));
    let result = orch.run(&["nope"], RunConfig::default()).await;
    assert!(matches!(result, Err(RunError::Core(_))));
    assert_eq!(runtime.start_count(), 0);
}
