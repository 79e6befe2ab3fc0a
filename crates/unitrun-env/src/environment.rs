//! Provisioned environment record and its status lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use unitrun_core::{obs, EnvironmentSelector, EnvironmentType};

use crate::error::{EnvError, EnvResult};
use crate::service::ServiceSpec;

/// Variable carrying the environment id into category subprocesses.
pub const ENV_ID_VAR: &str = "UNITRUN_ENV_ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    Uninitialized,
    Acquiring,
    Healthy,
    /// Was healthy; a later check found a service unhealthy.
    Degraded,
    Failed,
    /// Terminal.
    Released,
}

impl EnvironmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentStatus::Uninitialized => "uninitialized",
            EnvironmentStatus::Acquiring => "acquiring",
            EnvironmentStatus::Healthy => "healthy",
            EnvironmentStatus::Degraded => "degraded",
            EnvironmentStatus::Failed => "failed",
            EnvironmentStatus::Released => "released",
        }
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: EnvironmentStatus) -> bool {
        use EnvironmentStatus::*;
        match (self, next) {
            (Released, _) => false,
            (_, Released) => true,
            (Uninitialized, Acquiring) => true,
            (Acquiring, Healthy) | (Acquiring, Failed) => true,
            (Healthy, Degraded) | (Healthy, Failed) => true,
            (Degraded, Healthy) | (Degraded, Failed) => true,
            (Failed, Healthy) => true,
            _ => false,
        }
    }

    /// Usable by categories.
    pub fn is_live(&self) -> bool {
        matches!(self, EnvironmentStatus::Healthy | EnvironmentStatus::Degraded)
    }
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of running services bound to one environment id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEnvironment {
    pub id: String,
    pub env_type: EnvironmentType,
    pub selector: EnvironmentSelector,
    /// Service name to allocated host port.
    pub port_map: BTreeMap<String, u16>,
    pub status: EnvironmentStatus,
    pub services: Vec<ServiceSpec>,
    pub created_at: DateTime<Utc>,
}

impl ServiceEnvironment {
    pub fn new(
        id: impl Into<String>,
        env_type: EnvironmentType,
        selector: EnvironmentSelector,
        services: Vec<ServiceSpec>,
    ) -> Self {
        Self {
            id: id.into(),
            env_type,
            selector,
            port_map: BTreeMap::new(),
            status: EnvironmentStatus::Uninitialized,
            services,
            created_at: Utc::now(),
        }
    }

    /// Move to `next`, or fail with `InvalidTransition`. Staying put is a no-op
    /// except on a released environment.
    pub fn transition(&mut self, next: EnvironmentStatus) -> EnvResult<()> {
        if self.status == next && next != EnvironmentStatus::Released {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(EnvError::InvalidTransition {
                env_id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        obs::emit_environment_transition(&self.id, self.status.as_str(), next.as_str());
        self.status = next;
        Ok(())
    }

    /// Container name for `service` in this environment.
    pub fn container_name(&self, service: &str) -> String {
        format!("{}-{}", self.id, service)
    }

    /// Containers started (or being started) for this environment. A service
    /// gets its port recorded before its container is started.
    pub fn container_names(&self) -> Vec<String> {
        self.port_map
            .keys()
            .map(|service| self.container_name(service))
            .collect()
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Variables exported to category subprocesses.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars = vec![(ENV_ID_VAR.to_string(), self.id.clone())];
        for spec in &self.services {
            if let Some(port) = self.port_map.get(&spec.name) {
                vars.push((spec.port_env_var.clone(), port.to_string()));
            }
        }
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::default_services;

    fn env() -> ServiceEnvironment {
        ServiceEnvironment::new(
            "unitrun-r1",
            EnvironmentType::Dedicated,
            EnvironmentSelector::Test,
            default_services(EnvironmentSelector::Test),
        )
    }

    #[test]
    fn test_happy_lifecycle() {
        let mut e = env();
        e.transition(EnvironmentStatus::Acquiring).unwrap();
        e.transition(EnvironmentStatus::Healthy).unwrap();
        e.transition(EnvironmentStatus::Degraded).unwrap();
        e.transition(EnvironmentStatus::Healthy).unwrap();
        e.transition(EnvironmentStatus::Released).unwrap();
        assert_eq!(e.status, EnvironmentStatus::Released);
    }

    #[test]
    fn test_released_is_terminal() {
        let mut e = env();
        e.transition(EnvironmentStatus::Released).unwrap();
        let err = e.transition(EnvironmentStatus::Released).unwrap_err();
        assert!(matches!(err, EnvError::InvalidTransition { .. }));
        assert!(e.transition(EnvironmentStatus::Acquiring).is_err());
    }

    #[test]
    fn test_cannot_skip_acquiring() {
        let mut e = env();
        assert!(e.transition(EnvironmentStatus::Healthy).is_err());
        assert_eq!(e.status, EnvironmentStatus::Uninitialized);
    }

    #[test]
    fn test_env_vars_export_ports_and_id() {
        let mut e = env();
        e.port_map.insert("postgres".into(), 5434);
        e.port_map.insert("redis".into(), 6390);
        let vars = e.env_vars();
        assert!(vars.contains(&(ENV_ID_VAR.to_string(), "unitrun-r1".to_string())));
        assert!(vars.contains(&("POSTGRES_PORT".to_string(), "5434".to_string())));
        assert!(vars.contains(&("REDIS_PORT".to_string(), "6390".to_string())));
        assert!(!vars.iter().any(|(k, _)| k == "CLICKHOUSE_PORT"));
        assert_eq!(e.container_name("redis"), "unitrun-r1-redis");
        assert_eq!(
            e.container_names(),
            vec!["unitrun-r1-postgres".to_string(), "unitrun-r1-redis".to_string()]
        );
    }
}
