//! In-memory container runtime (testing only)
//!
//! `FakeContainerRuntime` records every start/stop and reports scripted
//! health per service, so environment lifecycle tests never need Docker.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::{EnvError, EnvResult};
use crate::runtime::{ContainerHealth, ContainerRuntime};
use crate::service::ServiceSpec;

#[derive(Debug, Clone)]
struct FakeContainer {
    service: String,
    host_port: u16,
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct FakeState {
    available: bool,
    containers: HashMap<String, FakeContainer>,
    /// Health reported per service name; absent means healthy.
    health: HashMap<String, ContainerHealth>,
    failing_starts: HashSet<String>,
    /// Containers report `Starting` until this long after their first poll.
    ready_after: Option<Duration>,
    first_polled: HashMap<String, Instant>,
    started: Vec<String>,
    stopped: Vec<String>,
}

/// Container runtime backed by a `HashMap<container, FakeContainer>`.
#[derive(Debug)]
pub struct FakeContainerRuntime {
    state: Mutex<FakeState>,
}

impl Default for FakeContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeContainerRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                available: true,
                ..FakeState::default()
            }),
        }
    }

    /// A runtime whose daemon is "down".
    pub fn unavailable() -> Self {
        let fake = Self::new();
        fake.lock().available = false;
        fake
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Report `health` for every container running `service`.
    pub fn set_health(&self, service: &str, health: ContainerHealth) {
        self.lock().health.insert(service.to_string(), health);
    }

    /// Every container becomes healthy `delay` after it is first polled.
    pub fn set_ready_after(&self, delay: Duration) {
        self.lock().ready_after = Some(delay);
    }

    /// Make `start_service` fail for `service`.
    pub fn fail_start(&self, service: &str) {
        self.lock().failing_starts.insert(service.to_string());
    }

    /// Pretend a container exists that nobody in this process owns.
    pub fn insert_orphan(&self, container: &str, service: &str) {
        self.lock().containers.insert(
            container.to_string(),
            FakeContainer {
                service: service.to_string(),
                host_port: 0,
                labels: BTreeMap::new(),
            },
        );
    }

    /// Names of containers currently present, sorted.
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().containers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn host_port(&self, container: &str) -> Option<u16> {
        self.lock().containers.get(container).map(|c| c.host_port)
    }

    pub fn label(&self, container: &str, key: &str) -> Option<String> {
        self.lock()
            .containers
            .get(container)
            .and_then(|c| c.labels.get(key).cloned())
    }

    pub fn start_count(&self) -> usize {
        self.lock().started.len()
    }

    pub fn stop_count(&self) -> usize {
        self.lock().stopped.len()
    }
}

#[async_trait]
impl ContainerRuntime for FakeContainerRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn is_available(&self) -> bool {
        self.lock().available
    }

    async fn start_service(
        &self,
        container: &str,
        spec: &ServiceSpec,
        host_port: u16,
        labels: &BTreeMap<String, String>,
    ) -> EnvResult<()> {
        let mut state = self.lock();
        if !state.available {
            return Err(EnvError::RuntimeUnavailable("fake runtime is down".into()));
        }
        if state.failing_starts.contains(&spec.name) {
            return Err(EnvError::CommandFailed(format!(
                "run {container}: image {} failed to start",
                spec.image
            )));
        }
        state.containers.insert(
            container.to_string(),
            FakeContainer {
                service: spec.name.clone(),
                host_port,
                labels: labels.clone(),
            },
        );
        state.started.push(container.to_string());
        Ok(())
    }

    async fn query_health(&self, container: &str) -> EnvResult<ContainerHealth> {
        let mut state = self.lock();
        let Some(service) = state.containers.get(container).map(|c| c.service.clone()) else {
            return Ok(ContainerHealth::Missing);
        };
        if let Some(health) = state.health.get(&service) {
            return Ok(*health);
        }
        if let Some(delay) = state.ready_after {
            let first = *state
                .first_polled
                .entry(container.to_string())
                .or_insert_with(Instant::now);
            if first.elapsed() < delay {
                return Ok(ContainerHealth::Starting);
            }
        }
        Ok(ContainerHealth::Healthy)
    }

    async fn stop_service(&self, container: &str) -> EnvResult<()> {
        let mut state = self.lock();
        if !state.available {
            return Err(EnvError::RuntimeUnavailable("fake runtime is down".into()));
        }
        if state.containers.remove(container).is_some() {
            state.stopped.push(container.to_string());
        }
        state.first_polled.remove(container);
        Ok(())
    }

    async fn list_containers(&self, prefix: &str) -> EnvResult<Vec<String>> {
        let mut names: Vec<String> = self
            .lock()
            .containers
            .keys()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }
}
