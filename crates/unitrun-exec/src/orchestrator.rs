//! Top-level run orchestration.
//!
//! A run plans the requested categories, provisions the service environment
//! when the plan needs one, executes the phases and aggregates a
//! [`RunReport`]. The environment is released on every path out of the run,
//! including a panic inside execution.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use unitrun_core::{
    obs, CategoryRegistry, ExecutionPlan, ExecutionPlanner, FailFastStrategy, PlanOptions,
    ProgressReporter, RunConfig, RunReport, TracingProgress,
};
use unitrun_env::ServiceEnvironmentManager;

use crate::command::{CommandBuilder, TemplateCommandBuilder};
use crate::context::{EnvironmentView, RunContext};
use crate::error::RunError;
use crate::executor::PhaseExecutor;

/// Exit code for a finished (or aborted) run: 0 iff the report says success.
pub fn exit_code_for(result: &Result<RunReport, RunError>) -> i32 {
    match result {
        Ok(report) => report.exit_code(),
        Err(_) => 1,
    }
}

pub struct RunOrchestrator {
    registry: Arc<CategoryRegistry>,
    environments: Arc<ServiceEnvironmentManager>,
    builder: Arc<dyn CommandBuilder>,
    progress: Arc<dyn ProgressReporter>,
    strategy: Option<Arc<dyn FailFastStrategy>>,
    provisioning: bool,
}

impl RunOrchestrator {
    pub fn new(
        registry: Arc<CategoryRegistry>,
        environments: Arc<ServiceEnvironmentManager>,
    ) -> Self {
        Self {
            registry,
            environments,
            builder: Arc::new(TemplateCommandBuilder::default()),
            progress: Arc::new(TracingProgress),
            strategy: None,
            provisioning: true,
        }
    }

    pub fn with_command_builder(mut self, builder: Arc<dyn CommandBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Replace the configured fail-fast policy with a custom strategy.
    pub fn with_fail_fast_strategy(mut self, strategy: Arc<dyn FailFastStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Never start containers; categories needing services fail individually.
    pub fn without_provisioning(mut self) -> Self {
        self.provisioning = false;
        self
    }

    pub fn registry(&self) -> &Arc<CategoryRegistry> {
        &self.registry
    }

    pub fn environments(&self) -> &Arc<ServiceEnvironmentManager> {
        &self.environments
    }

    /// Plan without executing.
    pub fn plan<S: AsRef<str>>(
        &self,
        requested: &[S],
        config: &RunConfig,
    ) -> Result<ExecutionPlan, RunError> {
        let options = PlanOptions {
            max_parallel: config.max_parallel,
            resume_from: config.resume_from.clone(),
        };
        let plan = ExecutionPlanner::new(&self.registry)
            .create_plan_with(requested, &options)?;
        Ok(plan)
    }

    /// Run under a fresh run id.
    pub async fn run<S: AsRef<str>>(
        &self,
        requested: &[S],
        config: RunConfig,
    ) -> Result<RunReport, RunError> {
        let run_id = Uuid::new_v4().simple().to_string();
        self.run_with_id(&run_id[..12], requested, config).await
    }

    pub async fn run_with_id<S: AsRef<str>>(
        &self,
        run_id: &str,
        requested: &[S],
        config: RunConfig,
    ) -> Result<RunReport, RunError> {
        let span = obs::run_span(run_id);
        self.run_inner(run_id, requested, config).instrument(span).await
    }

    async fn run_inner<S: AsRef<str>>(
        &self,
        run_id: &str,
        requested: &[S],
        config: RunConfig,
    ) -> Result<RunReport, RunError> {
        let started_at = Utc::now();
        config.validate()?;

        if self.provisioning && config.environment.provisions_locally() {
            match self.environments.cleanup_stale().await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "removed stale containers before run"),
                Err(e) => warn!(error = %e, "stale cleanup failed, continuing"),
            }
        }

        let plan = self.plan(requested, &config)?;
        if plan.is_empty() {
            warn!("execution plan is empty");
            return Err(RunError::ZeroTestsExecuted);
        }
        obs::emit_run_started(
            run_id,
            config.environment.as_str(),
            plan.phases.len(),
            plan.category_count(),
        );
        self.progress.start_run(run_id, &plan);

        let environment = match self.prepare_environment(run_id, &plan, &config).await {
            Ok(view) => view,
            Err(e) => {
                let elapsed = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
                obs::emit_run_finished(run_id, elapsed, 0, false);
                self.progress.complete_run(false);
                return Err(e);
            }
        };
        let acquired = environment.env_id().map(str::to_string);
        let config = Arc::new(config);
        let ctx = RunContext::new(
            run_id,
            Arc::clone(&config),
            Arc::clone(&self.registry),
            environment,
        );

        let strategy: Arc<dyn FailFastStrategy> = match &self.strategy {
            Some(strategy) => Arc::clone(strategy),
            None => Arc::new(config.fail_fast.clone()),
        };
        let executor = PhaseExecutor::new(Arc::clone(&self.builder), Arc::clone(&self.progress));
        let executed = AssertUnwindSafe(executor.execute(&plan, &ctx, strategy.as_ref()))
            .catch_unwind()
            .await;

        let environment_status = match &acquired {
            Some(env_id) => {
                let outcome = self.environments.release(env_id).await;
                debug!(env_id = %env_id, outcome = ?outcome, "environment released");
                let status = self
                    .environments
                    .status(env_id)
                    .await
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                Some(format!("{env_id}: {status}"))
            }
            None => match &ctx.environment {
                EnvironmentView::NotRequired => None,
                other => Some(other.to_string()),
            },
        };

        let outcome = match executed {
            Ok(outcome) => outcome,
            Err(panic) => std::panic::resume_unwind(panic),
        };

        let report = RunReport::from_results(
            run_id,
            config.environment.as_str(),
            &plan,
            outcome.results,
            outcome.stop,
            environment_status,
            started_at,
        );
        obs::emit_run_finished(
            run_id,
            report.duration_ms,
            report.totals().executed(),
            report.overall_success,
        );
        self.progress.complete_run(report.overall_success);

        if let Some(path) = &config.report_path {
            if let Err(e) = report.write_json(path) {
                warn!(path = %path.display(), error = %e, "failed to write run report");
            }
        }
        Ok(report)
    }

    /// Acquire the environment if the plan needs one. Fails the run only
    /// when a non-optional category depends on it.
    async fn prepare_environment(
        &self,
        run_id: &str,
        plan: &ExecutionPlan,
        config: &RunConfig,
    ) -> Result<EnvironmentView, RunError> {
        let needing: Vec<_> = plan
            .execution_order
            .iter()
            .filter_map(|name| self.registry.get(name).ok())
            .filter(|c| c.needs_environment())
            .collect();

        if needing.is_empty() && !config.real_services {
            return Ok(EnvironmentView::NotRequired);
        }
        if !config.environment.provisions_locally() {
            return Ok(EnvironmentView::External {
                selector: config.environment,
            });
        }
        if !self.provisioning {
            return Ok(EnvironmentView::Unavailable {
                reason: "container provisioning disabled".to_string(),
            });
        }

        match self.environments.acquire(config.env_type, run_id).await {
            Ok(env) => Ok(EnvironmentView::Acquired {
                vars: env.env_vars(),
                env_id: env.id,
            }),
            Err(e) => {
                let env_id = self.environments.environment_id(config.env_type, run_id);
                if let Some(required) = needing.iter().find(|c| !c.optional) {
                    self.environments.release(&env_id).await;
                    return Err(RunError::EnvironmentAcquisition {
                        category: required.name.clone(),
                        source: e,
                    });
                }
                warn!(error = %e, "environment unavailable, continuing without it");
                self.environments.release(&env_id).await;
                Ok(EnvironmentView::Unavailable {
                    reason: e.to_string(),
                })
            }
        }
    }
}
