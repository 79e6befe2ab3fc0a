//! Container runtime seam and the Docker CLI backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{EnvError, EnvResult};
use crate::service::ServiceSpec;

/// Label carrying the owning environment id on every container we start.
pub const ENV_LABEL: &str = "unitrun.env";
/// Prefix shared by every container name this crate creates.
pub const CONTAINER_PREFIX: &str = "unitrun-";

/// Health of a single container as the runtime reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerHealth {
    Starting,
    Healthy,
    Unhealthy,
    /// No such container.
    Missing,
}

/// Operations the environment manager needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Whether the runtime can be used at all.
    async fn is_available(&self) -> bool;

    /// Start `spec` as container `container`, publishing `host_port`.
    async fn start_service(
        &self,
        container: &str,
        spec: &ServiceSpec,
        host_port: u16,
        labels: &BTreeMap<String, String>,
    ) -> EnvResult<()>;

    async fn query_health(&self, container: &str) -> EnvResult<ContainerHealth>;

    /// Remove the container. Removing a missing container is not an error.
    async fn stop_service(&self, container: &str) -> EnvResult<()>;

    /// Names of containers (running or not) starting with `prefix`.
    async fn list_containers(&self, prefix: &str) -> EnvResult<Vec<String>>;

    /// Remove every container whose name starts with `prefix`.
    async fn stop_matching(&self, prefix: &str) -> EnvResult<usize> {
        let mut removed = 0;
        for name in self.list_containers(prefix).await? {
            match self.stop_service(&name).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(container = %name, error = %e, "failed to remove container"),
            }
        }
        Ok(removed)
    }
}

/// Shells out to the `docker` binary.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            binary: std::env::var("UNITRUN_DOCKER").unwrap_or_else(|_| "docker".to_string()),
        }
    }
}

impl DockerCli {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific binary, e.g. `podman`.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn exec(&self, args: &[String]) -> EnvResult<Output> {
        debug!(binary = %self.binary, args = ?args, "container command");
        Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    EnvError::RuntimeUnavailable(format!("{} not found in PATH", self.binary))
                }
                _ => EnvError::Io(e),
            })
    }

    async fn exec_ok(&self, args: &[String]) -> EnvResult<String> {
        let output = self.exec(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(EnvError::CommandFailed(format!(
                "{} {}: {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

fn is_missing(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("no such object")
}

/// Map `docker inspect` output of the form `<state>|<health>` to a health value.
pub(crate) fn parse_inspect(line: &str) -> ContainerHealth {
    let mut parts = line.trim().splitn(2, '|');
    let state = parts.next().unwrap_or_default();
    let health = parts.next().unwrap_or_default();
    match (state, health) {
        ("running", "healthy") | ("running", "") => ContainerHealth::Healthy,
        ("running", "unhealthy") => ContainerHealth::Unhealthy,
        ("running", _) | ("created", _) | ("restarting", _) => ContainerHealth::Starting,
        _ => ContainerHealth::Unhealthy,
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    fn name(&self) -> &str {
        &self.binary
    }

    async fn is_available(&self) -> bool {
        let args = ["info", "--format", "{{.ServerVersion}}"].map(String::from);
        matches!(self.exec(&args).await, Ok(o) if o.status.success())
    }

    async fn start_service(
        &self,
        container: &str,
        spec: &ServiceSpec,
        host_port: u16,
        labels: &BTreeMap<String, String>,
    ) -> EnvResult<()> {
        // A leftover container with the same name would make `run` fail.
        self.stop_service(container).await?;

        let mut args: Vec<String> = vec!["run".into(), "-d".into(), "--name".into(), container.into()];
        for (k, v) in labels {
            args.push("--label".into());
            args.push(format!("{k}={v}"));
        }
        args.push("-p".into());
        args.push(format!("127.0.0.1:{}:{}", host_port, spec.container_port));
        for (k, v) in &spec.env {
            args.push("-e".into());
            args.push(format!("{k}={v}"));
        }
        args.push(spec.image.clone());

        self.exec_ok(&args).await?;
        debug!(container = %container, host_port, image = %spec.image, "container started");
        Ok(())
    }

    async fn query_health(&self, container: &str) -> EnvResult<ContainerHealth> {
        let args = [
            "inspect",
            "--format",
            "{{.State.Status}}|{{if .State.Health}}{{.State.Health.Status}}{{end}}",
            container,
        ]
        .map(String::from);
        let output = self.exec(&args).await?;
        if output.status.success() {
            Ok(parse_inspect(&String::from_utf8_lossy(&output.stdout)))
        } else if is_missing(&String::from_utf8_lossy(&output.stderr)) {
            Ok(ContainerHealth::Missing)
        } else {
            Err(EnvError::CommandFailed(format!(
                "inspect {container}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn stop_service(&self, container: &str) -> EnvResult<()> {
        let args = ["rm", "-f", "-v", container].map(String::from);
        let output = self.exec(&args).await?;
        if output.status.success() || is_missing(&String::from_utf8_lossy(&output.stderr)) {
            Ok(())
        } else {
            Err(EnvError::CommandFailed(format!(
                "rm {container}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn list_containers(&self, prefix: &str) -> EnvResult<Vec<String>> {
        let args = [
            "ps".to_string(),
            "-a".to_string(),
            "--filter".to_string(),
            format!("name=^{prefix}"),
            "--format".to_string(),
            "{{.Names}}".to_string(),
        ];
        let stdout = self.exec_ok(&args).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|n| n.starts_with(prefix))
            .map(String::from)
            .collect())
    }
}
