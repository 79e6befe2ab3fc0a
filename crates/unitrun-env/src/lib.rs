//! unitrun-env: service environments for test runs
//!
//! Provisions the containerised services (databases, caches) that
//! integration-style categories need, behind a [`ContainerRuntime`] seam.
//! Ports are allocated deterministically, readiness is polled within a
//! budget, and shared environments are reference counted across runs.

pub mod environment;
pub mod error;
pub mod fakes;
pub mod health;
pub mod manager;
pub mod ports;
pub mod runtime;
pub mod service;

pub use environment::{EnvironmentStatus, ServiceEnvironment, ENV_ID_VAR};
pub use error::{EnvError, EnvResult};
pub use health::HealthChecker;
pub use manager::{ManagerConfig, ReleaseOutcome, ServiceEnvironmentManager};
pub use ports::PortAllocator;
pub use runtime::{ContainerHealth, ContainerRuntime, DockerCli};
pub use service::{default_services, HealthProbe, ServiceSpec};
