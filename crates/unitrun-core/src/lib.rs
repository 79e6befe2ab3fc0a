//! unitrun core library
//!
//! Category model, registry, phase planner, fail-fast policies and the
//! result/report types shared by the environment manager, the executor and
//! the CLI. Nothing in this crate spawns processes or touches containers.

pub mod category;
pub mod config;
pub mod error;
pub mod fail_fast;
pub mod obs;
pub mod planner;
pub mod progress;
pub mod registry;
pub mod report;
pub mod result;
pub mod telemetry;

pub use category::{Category, CategoryKind, PatternFiltering, Priority};
pub use config::{EnvironmentSelector, EnvironmentType, RunConfig, TimeoutTable};
pub use error::{CoreError, CoreResult};
pub use fail_fast::{FailFastMode, FailFastPolicy, FailFastStrategy, StopDecision};
pub use planner::{ExecutionPlan, ExecutionPlanner, Phase, PlanOptions};
pub use progress::{NoopProgress, ProgressReporter, TracingProgress};
pub use registry::{CategoryRegistry, RegistryConfig, RegistryStats};
pub use report::{PlanSummary, RunOutcome, RunReport};
pub use result::{excerpt, CategoryOutcomeReason, CategoryResult, TestCounts};
pub use telemetry::{init_tracing, level_for_verbosity};
