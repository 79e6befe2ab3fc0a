//! Acquire, monitor and release service environments.
//!
//! Environments are tracked per id in a map whose lock is only held to read
//! or update entries, never while containers start, stop or get probed.
//! Shared environments are reference counted: every successful `acquire`
//! adds a reference and every `release` drops one; containers go away with
//! the last reference. Release never fails from the caller's point of view.
//!
//! An acquisition in progress is tracked as an `Acquiring` entry from the
//! start, with each service's port recorded before its container starts, so
//! `release_all` can remove whatever an interrupted acquisition left behind.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use unitrun_core::{obs, EnvironmentSelector, EnvironmentType};

use crate::environment::{EnvironmentStatus, ServiceEnvironment};
use crate::error::{EnvError, EnvResult};
use crate::health::HealthChecker;
use crate::ports::PortAllocator;
use crate::runtime::{ContainerHealth, ContainerRuntime, CONTAINER_PREFIX, ENV_LABEL};
use crate::service::{default_services, ServiceSpec};

/// Manager settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub selector: EnvironmentSelector,
    pub services: Vec<ServiceSpec>,
    /// Total time `acquire` waits for all services to become healthy.
    pub health_budget: Duration,
    pub health_interval: Duration,
    pub port_probe_range: u16,
    pub host_probes: bool,
}

impl ManagerConfig {
    pub fn for_selector(selector: EnvironmentSelector) -> Self {
        Self {
            selector,
            services: default_services(selector),
            health_budget: Duration::from_secs(60),
            health_interval: Duration::from_secs(1),
            port_probe_range: 10,
            host_probes: true,
        }
    }
}

/// Result of a `release` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReleaseOutcome {
    /// Containers removed; the environment is now `Released`.
    Released,
    /// Other holders remain.
    StillReferenced { refs: usize },
    AlreadyReleased,
    Unknown,
}

#[derive(Debug)]
struct Tracked {
    env: ServiceEnvironment,
    refs: usize,
    /// Operations starting or removing containers with the lock released.
    /// A new acquisition waits until this drops to zero.
    pending: usize,
    settled: watch::Sender<u64>,
}

impl Tracked {
    fn new(env: ServiceEnvironment, refs: usize) -> Self {
        let (settled, _) = watch::channel(0);
        Self {
            env,
            refs,
            pending: 1,
            settled,
        }
    }

    /// Mark the environment released and hand back its containers.
    fn begin_release(&mut self) -> Vec<String> {
        self.refs = 0;
        self.pending += 1;
        if let Err(e) = self.env.transition(EnvironmentStatus::Released) {
            obs::emit_environment_release_error(&self.env.id, &e);
        }
        self.env.container_names()
    }

    fn settle(&mut self) {
        self.pending = self.pending.saturating_sub(1);
        self.settled.send_modify(|generation| *generation += 1);
    }
}

type EnvMap = Mutex<HashMap<String, Tracked>>;

fn lock_envs(envs: &EnvMap) -> MutexGuard<'_, HashMap<String, Tracked>> {
    envs.lock().unwrap_or_else(PoisonError::into_inner)
}

fn settle(envs: &EnvMap, env_id: &str) {
    if let Some(tracked) = lock_envs(envs).get_mut(env_id) {
        tracked.settle();
    }
}

/// Best-effort removal of `containers`.
async fn teardown(runtime: &dyn ContainerRuntime, env_id: &str, containers: &[String]) {
    for container in containers {
        if let Err(e) = runtime.stop_service(container).await {
            obs::emit_environment_release_error(env_id, &e);
        }
    }
}

/// Fails an acquisition whose future is dropped before it finishes and
/// removes the containers it had started.
struct AcquireGuard {
    envs: Arc<EnvMap>,
    runtime: Arc<dyn ContainerRuntime>,
    env_id: String,
    armed: bool,
}

impl AcquireGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AcquireGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let containers = {
            let mut envs = lock_envs(&self.envs);
            let Some(tracked) = envs.get_mut(&self.env_id) else {
                return;
            };
            if tracked.env.status != EnvironmentStatus::Acquiring {
                // Released underneath us; the releaser owns the teardown.
                tracked.settle();
                return;
            }
            tracked.refs = 0;
            if let Err(e) = tracked.env.transition(EnvironmentStatus::Failed) {
                obs::emit_environment_release_error(&self.env_id, &e);
            }
            tracked.env.container_names()
        };
        warn!(env_id = %self.env_id, containers = containers.len(), "acquisition interrupted");

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            settle(&self.envs, &self.env_id);
            return;
        };
        let envs = Arc::clone(&self.envs);
        let runtime = Arc::clone(&self.runtime);
        let env_id = self.env_id.clone();
        handle.spawn(async move {
            teardown(runtime.as_ref(), &env_id, &containers).await;
            let mut map = lock_envs(&envs);
            if let Some(tracked) = map.get_mut(&env_id) {
                if tracked.env.status == EnvironmentStatus::Failed {
                    if let Err(e) = tracked.env.transition(EnvironmentStatus::Released) {
                        obs::emit_environment_release_error(&env_id, &e);
                    }
                }
                tracked.settle();
            }
        });
    }
}

pub struct ServiceEnvironmentManager {
    runtime: Arc<dyn ContainerRuntime>,
    config: ManagerConfig,
    health: HealthChecker,
    ports: PortAllocator,
    envs: Arc<EnvMap>,
}

impl ServiceEnvironmentManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: ManagerConfig) -> Self {
        let mut health = HealthChecker::new(config.health_budget, config.health_interval);
        if !config.host_probes {
            health = health.without_host_probes();
        }
        let ports = PortAllocator::new(config.port_probe_range);
        Self {
            runtime,
            config,
            health,
            ports,
            envs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn selector(&self) -> EnvironmentSelector {
        self.config.selector
    }

    pub fn runtime_name(&self) -> &str {
        self.runtime.name()
    }

    /// Environment id for a given type and run.
    pub fn environment_id(&self, env_type: EnvironmentType, run_id: &str) -> String {
        match env_type {
            EnvironmentType::Dedicated => format!("{CONTAINER_PREFIX}{run_id}"),
            EnvironmentType::Shared => {
                format!("{CONTAINER_PREFIX}shared-{}", self.config.selector.as_str())
            }
        }
    }

    /// Provision (or join) an environment and wait until every service is
    /// healthy. Joining an environment another caller is still provisioning
    /// waits for that acquisition to settle.
    #[instrument(skip(self), fields(env_type = env_type.as_str()))]
    pub async fn acquire(
        &self,
        env_type: EnvironmentType,
        run_id: &str,
    ) -> EnvResult<ServiceEnvironment> {
        let env_id = self.environment_id(env_type, run_id);

        let env = loop {
            let mut settled = {
                let mut envs = lock_envs(&self.envs);
                let waiting = match envs.get_mut(&env_id) {
                    Some(tracked) if tracked.pending > 0 => Some(tracked.settled.subscribe()),
                    Some(tracked) if tracked.env.status.is_live() => {
                        tracked.refs += 1;
                        debug!(env_id = %env_id, refs = tracked.refs, "joined live environment");
                        return Ok(tracked.env.clone());
                    }
                    _ => None,
                };
                match waiting {
                    Some(settled) => settled,
                    None => {
                        let mut env = ServiceEnvironment::new(
                            &env_id,
                            env_type,
                            self.config.selector,
                            self.config.services.clone(),
                        );
                        env.transition(EnvironmentStatus::Acquiring)?;
                        envs.insert(env_id.clone(), Tracked::new(env.clone(), 1));
                        break env;
                    }
                }
            };
            debug!(env_id = %env_id, "waiting for environment to settle");
            // A dropped sender means the entry was replaced; look again.
            let _ = settled.changed().await;
        };

        let mut guard = AcquireGuard {
            envs: Arc::clone(&self.envs),
            runtime: Arc::clone(&self.runtime),
            env_id: env_id.clone(),
            armed: true,
        };
        let provisioned = self.provision(&env, run_id).await;
        guard.disarm();

        match provisioned {
            Ok(()) => self.finish_acquire(&env_id),
            Err(e) => {
                warn!(env_id = %env_id, error = %e, "environment acquisition failed");
                self.abandon(&env_id).await;
                Err(EnvError::AcquisitionFailed {
                    env_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn provision(&self, env: &ServiceEnvironment, run_id: &str) -> EnvResult<()> {
        if !self.runtime.is_available().await {
            return Err(EnvError::RuntimeUnavailable(format!(
                "'{}' is not reachable",
                self.runtime.name()
            )));
        }

        let labels: BTreeMap<String, String> = [
            (ENV_LABEL.to_string(), env.id.clone()),
            ("unitrun.run".to_string(), run_id.to_string()),
            ("unitrun.selector".to_string(), env.selector.as_str().to_string()),
        ]
        .into_iter()
        .collect();

        let mut ports = BTreeMap::new();
        for spec in &env.services {
            let port = self.reserve_port(&env.id, spec)?;
            ports.insert(spec.name.clone(), port);

            let container = env.container_name(&spec.name);
            self.runtime
                .start_service(&container, spec, port, &labels)
                .await?;
            if !self.still_acquiring(&env.id) {
                teardown(self.runtime.as_ref(), &env.id, &[container]).await;
                return Err(released_during_acquisition());
            }
        }

        let deadline = Instant::now() + self.health.budget;
        for spec in &env.services {
            let port = ports.get(&spec.name).copied().unwrap_or(spec.default_host_port);
            self.health
                .wait_healthy_until(
                    self.runtime.as_ref(),
                    &env.container_name(&spec.name),
                    spec,
                    port,
                    deadline,
                )
                .await?;
        }
        Ok(())
    }

    /// Allocate a host port for `spec` and record it on the tracked entry
    /// before its container starts. Ports held by any other unreleased
    /// environment, including ones still acquiring, are skipped.
    fn reserve_port(&self, env_id: &str, spec: &ServiceSpec) -> EnvResult<u16> {
        let mut envs = lock_envs(&self.envs);
        let reserved: BTreeSet<u16> = envs
            .values()
            .filter(|t| t.env.status != EnvironmentStatus::Released)
            .flat_map(|t| t.env.port_map.values().copied())
            .collect();
        match envs.get_mut(env_id) {
            Some(tracked) if tracked.env.status == EnvironmentStatus::Acquiring => {
                let port = self
                    .ports
                    .allocate(&spec.name, spec.default_host_port, &reserved)?;
                tracked.env.port_map.insert(spec.name.clone(), port);
                Ok(port)
            }
            _ => Err(released_during_acquisition()),
        }
    }

    fn still_acquiring(&self, env_id: &str) -> bool {
        lock_envs(&self.envs)
            .get(env_id)
            .is_some_and(|t| t.env.status == EnvironmentStatus::Acquiring)
    }

    fn finish_acquire(&self, env_id: &str) -> EnvResult<ServiceEnvironment> {
        let mut envs = lock_envs(&self.envs);
        let Some(tracked) = envs.get_mut(env_id) else {
            return Err(EnvError::UnknownEnvironment(env_id.to_string()));
        };
        if tracked.env.status != EnvironmentStatus::Acquiring {
            tracked.settle();
            return Err(EnvError::AcquisitionFailed {
                env_id: env_id.to_string(),
                reason: released_during_acquisition().to_string(),
            });
        }
        let healthy = tracked.env.transition(EnvironmentStatus::Healthy);
        tracked.settle();
        healthy?;
        info!(env_id = %env_id, ports = ?tracked.env.port_map, "environment healthy");
        Ok(tracked.env.clone())
    }

    /// Mark a failed acquisition and remove whatever it started. The entry
    /// stays `Failed` so callers can still inspect and release it.
    async fn abandon(&self, env_id: &str) {
        let containers = {
            let mut envs = lock_envs(&self.envs);
            let Some(tracked) = envs.get_mut(env_id) else {
                return;
            };
            if tracked.env.status != EnvironmentStatus::Acquiring {
                tracked.settle();
                return;
            }
            tracked.refs = 0;
            if let Err(e) = tracked.env.transition(EnvironmentStatus::Failed) {
                obs::emit_environment_release_error(env_id, &e);
            }
            tracked.env.container_names()
        };
        teardown(self.runtime.as_ref(), env_id, &containers).await;
        settle(&self.envs, env_id);
    }

    /// Drop one reference; remove containers with the last one.
    #[instrument(skip(self))]
    pub async fn release(&self, env_id: &str) -> ReleaseOutcome {
        let containers = {
            let mut envs = lock_envs(&self.envs);
            let Some(tracked) = envs.get_mut(env_id) else {
                debug!(env_id = %env_id, "release of unknown environment");
                return ReleaseOutcome::Unknown;
            };
            if tracked.env.status == EnvironmentStatus::Released {
                return ReleaseOutcome::AlreadyReleased;
            }
            if tracked.refs > 1 {
                tracked.refs -= 1;
                debug!(env_id = %env_id, refs = tracked.refs, "environment still referenced");
                return ReleaseOutcome::StillReferenced { refs: tracked.refs };
            }
            tracked.begin_release()
        };
        teardown(self.runtime.as_ref(), env_id, &containers).await;
        settle(&self.envs, env_id);
        info!(env_id = %env_id, "environment released");
        ReleaseOutcome::Released
    }

    /// Release every tracked environment regardless of references,
    /// including acquisitions still in progress.
    pub async fn release_all(&self) -> usize {
        let batch: Vec<(String, Vec<String>)> = {
            let mut envs = lock_envs(&self.envs);
            envs.iter_mut()
                .filter(|(_, t)| t.env.status != EnvironmentStatus::Released)
                .map(|(id, t)| (id.clone(), t.begin_release()))
                .collect()
        };
        for (env_id, containers) in &batch {
            teardown(self.runtime.as_ref(), env_id, containers).await;
            settle(&self.envs, env_id);
        }
        if !batch.is_empty() {
            info!(released = batch.len(), "released all environments");
        }
        batch.len()
    }

    fn live_snapshot(&self, env_id: &str) -> EnvResult<ServiceEnvironment> {
        lock_envs(&self.envs)
            .get(env_id)
            .map(|t| t.env.clone())
            .ok_or_else(|| EnvError::UnknownEnvironment(env_id.to_string()))
    }

    /// Re-probe every service: Healthy becomes Degraded on any failure and
    /// Degraded recovers to Healthy when all pass.
    pub async fn recheck(&self, env_id: &str) -> EnvResult<EnvironmentStatus> {
        let env = self.live_snapshot(env_id)?;
        if !env.status.is_live() {
            return Ok(env.status);
        }

        let mut all_healthy = true;
        for spec in &env.services {
            let port = env
                .port_map
                .get(&spec.name)
                .copied()
                .unwrap_or(spec.default_host_port);
            let health = self
                .health
                .check_once(self.runtime.as_ref(), &env.container_name(&spec.name), spec, port)
                .await?;
            if health != ContainerHealth::Healthy {
                warn!(env_id = %env_id, service = %spec.name, health = ?health, "service unhealthy");
                all_healthy = false;
            }
        }

        let next = if all_healthy {
            EnvironmentStatus::Healthy
        } else {
            EnvironmentStatus::Degraded
        };
        let mut envs = lock_envs(&self.envs);
        let tracked = envs
            .get_mut(env_id)
            .ok_or_else(|| EnvError::UnknownEnvironment(env_id.to_string()))?;
        // Released or failed while probing: keep that status.
        if tracked.env.status.is_live() {
            tracked.env.transition(next)?;
        }
        Ok(tracked.env.status)
    }

    /// One stop/start/health cycle for `service`. The environment is Failed
    /// if the service does not come back.
    #[instrument(skip(self))]
    pub async fn restart_unhealthy(
        &self,
        env_id: &str,
        service: &str,
    ) -> EnvResult<EnvironmentStatus> {
        let env = self.live_snapshot(env_id)?;
        let spec = env
            .service(service)
            .cloned()
            .ok_or_else(|| EnvError::UnknownService {
                env_id: env_id.to_string(),
                service: service.to_string(),
            })?;
        if env.status == EnvironmentStatus::Released {
            return Ok(env.status);
        }
        let port = env
            .port_map
            .get(service)
            .copied()
            .unwrap_or(spec.default_host_port);
        let container = env.container_name(service);
        let labels: BTreeMap<String, String> =
            [(ENV_LABEL.to_string(), env_id.to_string())].into_iter().collect();

        let restarted = async {
            self.runtime.stop_service(&container).await?;
            self.runtime
                .start_service(&container, &spec, port, &labels)
                .await?;
            self.health
                .wait_healthy(self.runtime.as_ref(), &container, &spec, port)
                .await
        }
        .await;

        let status = {
            let mut envs = lock_envs(&self.envs);
            let tracked = envs
                .get_mut(env_id)
                .ok_or_else(|| EnvError::UnknownEnvironment(env_id.to_string()))?;
            if tracked.env.status != EnvironmentStatus::Released {
                match &restarted {
                    Ok(()) => {
                        info!(env_id = %env_id, service = %service, "service restarted");
                        tracked.env.transition(EnvironmentStatus::Healthy)?;
                    }
                    Err(e) => {
                        warn!(env_id = %env_id, service = %service, error = %e, "restart did not recover service");
                        tracked.env.transition(EnvironmentStatus::Failed)?;
                    }
                }
            }
            tracked.env.status
        };
        if status == EnvironmentStatus::Released {
            // Released while restarting; do not leave the new container behind.
            teardown(self.runtime.as_ref(), env_id, &[container]).await;
        }
        Ok(status)
    }

    /// Remove `unitrun-` containers not owned by a live environment of this
    /// manager. Returns the number removed.
    pub async fn cleanup_stale(&self) -> EnvResult<usize> {
        if !self.runtime.is_available().await {
            debug!("container runtime unavailable, skipping stale cleanup");
            return Ok(0);
        }
        let owned: BTreeSet<String> = lock_envs(&self.envs)
            .values()
            .filter(|t| t.env.status != EnvironmentStatus::Released)
            .flat_map(|t| t.env.container_names())
            .collect();

        if owned.is_empty() {
            let removed = self.runtime.stop_matching(CONTAINER_PREFIX).await?;
            if removed > 0 {
                info!(removed, "removed stale containers");
            }
            return Ok(removed);
        }

        let mut removed = 0;
        for name in self.runtime.list_containers(CONTAINER_PREFIX).await? {
            if owned.contains(&name) {
                continue;
            }
            match self.runtime.stop_service(&name).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(container = %name, error = %e, "failed to remove stale container"),
            }
        }
        if removed > 0 {
            info!(removed, "removed stale containers");
        }
        Ok(removed)
    }

    pub async fn status(&self, env_id: &str) -> Option<EnvironmentStatus> {
        lock_envs(&self.envs).get(env_id).map(|t| t.env.status)
    }

    pub async fn environment(&self, env_id: &str) -> Option<ServiceEnvironment> {
        lock_envs(&self.envs).get(env_id).map(|t| t.env.clone())
    }

    /// Current reference count, if tracked.
    pub async fn references(&self, env_id: &str) -> Option<usize> {
        lock_envs(&self.envs).get(env_id).map(|t| t.refs)
    }
}

fn released_during_acquisition() -> EnvError {
    EnvError::CommandFailed("environment released during acquisition".to_string())
}
