//! Backing service definitions per environment selector.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use unitrun_core::EnvironmentSelector;

/// How readiness of a service is established.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthProbe {
    /// Trust the runtime's own health status.
    Container,
    /// Container running and the host port accepts TCP connections.
    Tcp,
    /// Container running and `GET http://127.0.0.1:<port><path>` returns 2xx.
    Http { path: String },
}

/// A containerised dependency of the test suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub container_port: u16,
    /// Preferred host port; the allocator probes upward from here.
    pub default_host_port: u16,
    /// Variable carrying the allocated port into category subprocesses.
    pub port_env_var: String,
    pub health: HealthProbe,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ServiceSpec {
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        container_port: u16,
        default_host_port: u16,
        health: HealthProbe,
    ) -> Self {
        let name = name.into();
        let port_env_var = format!("{}_PORT", name.to_ascii_uppercase().replace('-', "_"));
        Self {
            name,
            image: image.into(),
            container_port,
            default_host_port,
            port_env_var,
            health,
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Services provisioned for `selector`.
///
/// The test selector shifts every host port by two so a developer's
/// locally running databases stay untouched.
pub fn default_services(selector: EnvironmentSelector) -> Vec<ServiceSpec> {
    let shift = match selector {
        EnvironmentSelector::Test => 2,
        _ => 0,
    };
    vec![
        ServiceSpec::new(
            "postgres",
            "postgres:16-alpine",
            5432,
            5432 + shift,
            HealthProbe::Tcp,
        )
        .with_env("POSTGRES_USER", "unitrun")
        .with_env("POSTGRES_PASSWORD", "unitrun")
        .with_env("POSTGRES_DB", format!("unitrun_{}", selector.as_str())),
        ServiceSpec::new("redis", "redis:7-alpine", 6379, 6379 + shift, HealthProbe::Tcp),
        ServiceSpec::new(
            "clickhouse",
            "clickhouse/clickhouse-server:24.3",
            8123,
            8123 + shift,
            HealthProbe::Http {
                path: "/ping".to_string(),
            },
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_selector_uses_shifted_ports() {
        let ports: Vec<u16> = default_services(EnvironmentSelector::Test)
            .iter()
            .map(|s| s.default_host_port)
            .collect();
        assert_eq!(ports, vec![5434, 6381, 8125]);
    }

    #[test]
    fn test_dev_selector_uses_standard_ports() {
        let services = default_services(EnvironmentSelector::Dev);
        assert_eq!(services[0].default_host_port, 5432);
        assert_eq!(services[0].env["POSTGRES_DB"], "unitrun_dev");
    }

    #[test]
    fn test_port_env_var_derived_from_name() {
        let spec = ServiceSpec::new("object-store", "minio", 9000, 9000, HealthProbe::Container);
        assert_eq!(spec.port_env_var, "OBJECT_STORE_PORT");
    }
}
