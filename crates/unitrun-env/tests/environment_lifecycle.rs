//! Environment lifecycle against the in-memory container runtime.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing_test::traced_test;
use unitrun_core::{EnvironmentSelector, EnvironmentType};
use unitrun_env::fakes::FakeContainerRuntime;
use unitrun_env::{
    ContainerHealth, EnvError, EnvironmentStatus, ManagerConfig, ReleaseOutcome,
    ServiceEnvironmentManager, ENV_ID_VAR,
};

fn manager(fake: &Arc<FakeContainerRuntime>) -> ServiceEnvironmentManager {
    manager_with_budget(fake, Duration::from_millis(300))
}

fn manager_with_budget(
    fake: &Arc<FakeContainerRuntime>,
    budget: Duration,
) -> ServiceEnvironmentManager {
    let mut config = ManagerConfig::for_selector(EnvironmentSelector::Test);
    config.host_probes = false;
    config.health_budget = budget;
    config.health_interval = Duration::from_millis(20);
    config.port_probe_range = 200;
    ServiceEnvironmentManager::new(fake.clone(), config)
}

async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let started = Instant::now();
    while !done() {
        assert!(started.elapsed() < Duration::from_secs(5), "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[traced_test]
#[tokio::test]
async fn test_dedicated_acquire_and_release_is_idempotent() {
    let fake = Arc::new(FakeContainerRuntime::new());
    let m = manager(&fake);

    let env = m.acquire(EnvironmentType::Dedicated, "run-1").await.unwrap();
    assert_eq!(env.id, "unitrun-run-1");
    assert_eq!(env.status, EnvironmentStatus::Healthy);
    assert_eq!(env.port_map.len(), 3);
    assert_eq!(fake.running().len(), 3);
    assert_eq!(
        fake.label("unitrun-run-1-postgres", "unitrun.env").as_deref(),
        Some("unitrun-run-1")
    );
    let vars = env.env_vars();
    assert!(vars.contains(&(ENV_ID_VAR.to_string(), "unitrun-run-1".to_string())));
    assert!(vars.iter().any(|(k, _)| k == "POSTGRES_PORT"));

    assert_eq!(m.release(&env.id).await, ReleaseOutcome::Released);
    assert!(fake.running().is_empty());
    assert_eq!(m.status(&env.id).await, Some(EnvironmentStatus::Released));

    // Second release changes nothing and does not error.
    let stops = fake.stop_count();
    assert_eq!(m.release(&env.id).await, ReleaseOutcome::AlreadyReleased);
    assert_eq!(fake.stop_count(), stops);
    assert!(logs_contain("environment.transition"));
}

#[tokio::test]
async fn test_shared_environment_is_reference_counted() {
    let fake = Arc::new(FakeContainerRuntime::new());
    let m = manager(&fake);

    let a = m.acquire(EnvironmentType::Shared, "run-a").await.unwrap();
    let b = m.acquire(EnvironmentType::Shared, "run-b").await.unwrap();
    assert_eq!(a.id, "unitrun-shared-test");
    assert_eq!(a.id, b.id);
    assert_eq!(a.port_map, b.port_map);
    assert_eq!(fake.start_count(), 3);
    assert_eq!(m.references(&a.id).await, Some(2));

    assert_eq!(
        m.release(&a.id).await,
        ReleaseOutcome::StillReferenced { refs: 1 }
    );
    assert_eq!(fake.running().len(), 3);
    assert_eq!(m.release(&a.id).await, ReleaseOutcome::Released);
    assert!(fake.running().is_empty());
}

#[tokio::test]
async fn test_concurrent_dedicated_environments_get_distinct_ports() {
    let fake = Arc::new(FakeContainerRuntime::new());
    let m = Arc::new(manager(&fake));

    let (a, b) = tokio::join!(
        m.acquire(EnvironmentType::Dedicated, "run-x"),
        m.acquire(EnvironmentType::Dedicated, "run-y")
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    for (service, port) in &a.port_map {
        assert_ne!(b.port_map.get(service), Some(port), "{service} port reused");
    }
}

#[tokio::test]
async fn test_unhealthy_service_fails_acquisition_and_cleans_up() {
    let fake = Arc::new(FakeContainerRuntime::new());
    fake.set_health("redis", ContainerHealth::Unhealthy);
    let m = manager(&fake);

    let err = m.acquire(EnvironmentType::Dedicated, "run-2").await.unwrap_err();
    match err {
        EnvError::AcquisitionFailed { env_id, reason } => {
            assert_eq!(env_id, "unitrun-run-2");
            assert!(reason.contains("redis"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(m.status("unitrun-run-2").await, Some(EnvironmentStatus::Failed));
    assert!(fake.running().is_empty());

    // Releasing a failed environment is still safe.
    assert_eq!(m.release("unitrun-run-2").await, ReleaseOutcome::Released);
    assert_eq!(m.release("unitrun-run-2").await, ReleaseOutcome::AlreadyReleased);
}

#[tokio::test]
async fn test_start_failure_fails_acquisition() {
    let fake = Arc::new(FakeContainerRuntime::new());
    fake.fail_start("clickhouse");
    let m = manager(&fake);
    let err = m.acquire(EnvironmentType::Dedicated, "run-3").await.unwrap_err();
    assert!(matches!(err, EnvError::AcquisitionFailed { .. }));
    assert!(fake.running().is_empty());
}

#[tokio::test]
async fn test_recheck_degrades_and_restart_recovers() {
    let fake = Arc::new(FakeContainerRuntime::new());
    let m = manager(&fake);
    let env = m.acquire(EnvironmentType::Dedicated, "run-4").await.unwrap();

    fake.set_health("redis", ContainerHealth::Unhealthy);
    assert_eq!(m.recheck(&env.id).await.unwrap(), EnvironmentStatus::Degraded);

    fake.set_health("redis", ContainerHealth::Healthy);
    assert_eq!(
        m.restart_unhealthy(&env.id, "redis").await.unwrap(),
        EnvironmentStatus::Healthy
    );
    assert_eq!(
        fake.host_port("unitrun-run-4-redis"),
        env.port_map.get("redis").copied()
    );
}

#[tokio::test]
async fn test_restart_that_does_not_recover_marks_failed() {
    let fake = Arc::new(FakeContainerRuntime::new());
    let m = manager(&fake);
    let env = m.acquire(EnvironmentType::Dedicated, "run-5").await.unwrap();

    fake.set_health("postgres", ContainerHealth::Unhealthy);
    assert_eq!(m.recheck(&env.id).await.unwrap(), EnvironmentStatus::Degraded);
    assert_eq!(
        m.restart_unhealthy(&env.id, "postgres").await.unwrap(),
        EnvironmentStatus::Failed
    );

    let err = m.restart_unhealthy(&env.id, "mysql").await.unwrap_err();
    assert!(matches!(err, EnvError::UnknownService { .. }));
}

#[tokio::test]
async fn test_cleanup_stale_spares_live_environments() {
    let fake = Arc::new(FakeContainerRuntime::new());
    let m = manager(&fake);
    fake.insert_orphan("unitrun-crashed-postgres", "postgres");
    fake.insert_orphan("someone-elses-db", "postgres");

    let env = m.acquire(EnvironmentType::Dedicated, "run-6").await.unwrap();
    assert_eq!(m.cleanup_stale().await.unwrap(), 1);
    let running = fake.running();
    assert!(running.contains(&"someone-elses-db".to_string()));
    assert!(!running.contains(&"unitrun-crashed-postgres".to_string()));
    assert_eq!(running.len(), 4);

    m.release(&env.id).await;
}

#[tokio::test]
async fn test_release_all_tears_down_everything() {
    let fake = Arc::new(FakeContainerRuntime::new());
    let m = manager(&fake);
    m.acquire(EnvironmentType::Shared, "run-a").await.unwrap();
    m.acquire(EnvironmentType::Shared, "run-b").await.unwrap();
    m.acquire(EnvironmentType::Dedicated, "run-c").await.unwrap();

    assert_eq!(m.release_all().await, 2);
    assert!(fake.running().is_empty());
    assert_eq!(
        m.release("unitrun-shared-test").await,
        ReleaseOutcome::AlreadyReleased
    );
}

#[tokio::test]
async fn test_release_outcome_serializes_with_kind_tag() {
    let json = serde_json::to_value(ReleaseOutcome::StillReferenced { refs: 2 }).unwrap();
    assert_eq!(json["kind"], "still_referenced");
    assert_eq!(json["refs"], 2);
}

#[tokio::test]
async fn test_interrupted_acquire_is_removed_by_release_all() {
    let fake = Arc::new(FakeContainerRuntime::new());
    fake.set_health("clickhouse", ContainerHealth::Starting);
    let m = Arc::new(manager_with_budget(&fake, Duration::from_secs(30)));

    let acquiring = {
        let m = Arc::clone(&m);
        tokio::spawn(async move { m.acquire(EnvironmentType::Dedicated, "run-int").await })
    };
    wait_for("containers to start", || fake.running().len() == 3).await;
    assert_eq!(
        m.status("unitrun-run-int").await,
        Some(EnvironmentStatus::Acquiring)
    );

    // What a Ctrl-C `select!` does to the run future.
    acquiring.abort();
    assert!(acquiring.await.unwrap_err().is_cancelled());

    m.release_all().await;
    assert!(fake.running().is_empty(), "left behind: {:?}", fake.running());
    assert_eq!(
        m.status("unitrun-run-int").await,
        Some(EnvironmentStatus::Released)
    );
}

#[tokio::test]
async fn test_dropped_shared_acquire_cleans_up_and_can_be_retried() {
    let fake = Arc::new(FakeContainerRuntime::new());
    fake.set_health("redis", ContainerHealth::Starting);
    let m = Arc::new(manager_with_budget(&fake, Duration::from_secs(30)));

    let acquiring = {
        let m = Arc::clone(&m);
        tokio::spawn(async move { m.acquire(EnvironmentType::Shared, "run-a").await })
    };
    wait_for("containers to start", || fake.running().len() == 3).await;
    acquiring.abort();
    let _ = acquiring.await;
    wait_for("interrupted acquisition teardown", || fake.running().is_empty()).await;

    fake.set_health("redis", ContainerHealth::Healthy);
    let env = tokio::time::timeout(
        Duration::from_secs(5),
        m.acquire(EnvironmentType::Shared, "run-b"),
    )
    .await
    .expect("acquire waited on a dead acquisition")
    .unwrap();
    assert_eq!(env.status, EnvironmentStatus::Healthy);
    assert_eq!(m.references(&env.id).await, Some(1));
    assert_eq!(fake.running().len(), 3);
}

#[tokio::test]
async fn test_health_budget_covers_all_services_together() {
    let fake = Arc::new(FakeContainerRuntime::new());
    // Each service alone fits the budget; three in turn do not.
    fake.set_ready_after(Duration::from_millis(400));
    let m = manager_with_budget(&fake, Duration::from_millis(500));

    let started = Instant::now();
    let err = m
        .acquire(EnvironmentType::Dedicated, "run-slow")
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    match err {
        EnvError::AcquisitionFailed { reason, .. } => {
            assert!(reason.contains("not healthy"), "{reason}")
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(elapsed < Duration::from_millis(900), "waited {elapsed:?}");
    assert!(fake.running().is_empty());
}

#[tokio::test]
async fn test_slow_services_within_budget_are_acquired() {
    let fake = Arc::new(FakeContainerRuntime::new());
    fake.set_ready_after(Duration::from_millis(100));
    let m = manager_with_budget(&fake, Duration::from_secs(2));

    let env = m.acquire(EnvironmentType::Dedicated, "run-ok").await.unwrap();
    assert_eq!(env.status, EnvironmentStatus::Healthy);
}

#[tokio::test]
async fn test_slow_acquire_does_not_block_other_environments() {
    let fake = Arc::new(FakeContainerRuntime::new());
    fake.set_ready_after(Duration::from_millis(500));
    let m = Arc::new(manager_with_budget(&fake, Duration::from_secs(5)));

    let slow = {
        let m = Arc::clone(&m);
        tokio::spawn(async move { m.acquire(EnvironmentType::Dedicated, "run-slow").await })
    };
    wait_for("containers to start", || fake.running().len() == 3).await;

    let outcome = tokio::time::timeout(
        Duration::from_millis(100),
        m.release("unitrun-other-run"),
    )
    .await
    .expect("release waited on another environment's acquisition");
    assert_eq!(outcome, ReleaseOutcome::Unknown);
    assert_eq!(
        m.status("unitrun-run-slow").await,
        Some(EnvironmentStatus::Acquiring)
    );

    let env = slow.await.unwrap().unwrap();
    assert_eq!(env.status, EnvironmentStatus::Healthy);
    m.release(&env.id).await;
}

#[tokio::test]
async fn test_shared_acquire_joins_acquisition_in_progress() {
    let fake = Arc::new(FakeContainerRuntime::new());
    fake.set_ready_after(Duration::from_millis(100));
    let m = manager_with_budget(&fake, Duration::from_secs(2));

    let (a, b) = tokio::join!(
        m.acquire(EnvironmentType::Shared, "run-a"),
        m.acquire(EnvironmentType::Shared, "run-b")
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.port_map, b.port_map);
    assert_eq!(fake.start_count(), 3);
    assert_eq!(m.references(&a.id).await, Some(2));
}
