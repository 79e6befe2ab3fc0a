//! Readiness polling for provisioned services.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, trace};

use crate::error::{EnvError, EnvResult};
use crate::runtime::{ContainerHealth, ContainerRuntime};
use crate::service::{HealthProbe, ServiceSpec};

/// Polls a service until it is healthy or the budget runs out.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    pub budget: Duration,
    pub interval: Duration,
    /// Probe host ports for `Tcp`/`Http` services. Off when the runtime
    /// does not publish real ports.
    pub host_probes: bool,
    http: reqwest::Client,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(1))
    }
}

impl HealthChecker {
    pub fn new(budget: Duration, interval: Duration) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(concat!("unitrun-env/", env!("CARGO_PKG_VERSION")))
            .timeout(interval.max(Duration::from_millis(250)))
            .build()
            .unwrap_or_default();
        Self {
            budget,
            interval,
            host_probes: true,
            http,
        }
    }

    pub fn without_host_probes(mut self) -> Self {
        self.host_probes = false;
        self
    }

    /// One readiness check.
    pub async fn check_once(
        &self,
        runtime: &dyn ContainerRuntime,
        container: &str,
        spec: &ServiceSpec,
        host_port: u16,
    ) -> EnvResult<ContainerHealth> {
        let health = runtime.query_health(container).await?;
        if health != ContainerHealth::Healthy || !self.host_probes {
            return Ok(health);
        }
        let reachable = match &spec.health {
            HealthProbe::Container => true,
            HealthProbe::Tcp => self.tcp_reachable(host_port).await,
            HealthProbe::Http { path } => self.http_ok(host_port, path).await,
        };
        Ok(if reachable {
            ContainerHealth::Healthy
        } else {
            ContainerHealth::Starting
        })
    }

    /// Poll until healthy within this checker's budget.
    pub async fn wait_healthy(
        &self,
        runtime: &dyn ContainerRuntime,
        container: &str,
        spec: &ServiceSpec,
        host_port: u16,
    ) -> EnvResult<()> {
        let deadline = Instant::now() + self.budget;
        self.wait_healthy_until(runtime, container, spec, host_port, deadline)
            .await
    }

    /// Poll until healthy or `deadline`. Several services waited on in turn
    /// share one deadline. A container that disappears fails immediately.
    pub async fn wait_healthy_until(
        &self,
        runtime: &dyn ContainerRuntime,
        container: &str,
        spec: &ServiceSpec,
        host_port: u16,
        deadline: Instant,
    ) -> EnvResult<()> {
        let started = Instant::now();
        loop {
            match self.check_once(runtime, container, spec, host_port).await? {
                ContainerHealth::Healthy => {
                    debug!(
                        service = %spec.name,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "service healthy"
                    );
                    return Ok(());
                }
                ContainerHealth::Missing => {
                    return Err(EnvError::CommandFailed(format!(
                        "container {container} exited before becoming healthy"
                    )));
                }
                other => trace!(service = %spec.name, health = ?other, "waiting for service"),
            }
            if Instant::now() + self.interval > deadline {
                return Err(EnvError::HealthTimeout {
                    service: spec.name.clone(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            sleep(self.interval).await;
        }
    }

    async fn tcp_reachable(&self, port: u16) -> bool {
        matches!(
            timeout(self.interval, TcpStream::connect(("127.0.0.1", port))).await,
            Ok(Ok(_))
        )
    }

    async fn http_ok(&self, port: u16, path: &str) -> bool {
        let url = format!("http://127.0.0.1:{port}{path}");
        match self.http.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                trace!(url = %url, error = %e, "http probe failed");
                false
            }
        }
    }
}
