//! Phase-by-phase execution of a plan.
//!
//! Phases run strictly one after another. Inside a phase every category is
//! dispatched as its own tokio task, bounded by a semaphore of
//! `max_parallel`, and results are collected in plan order. After each phase
//! the fail-fast strategy decides whether later phases are dispatched at all.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{instrument, warn};

use unitrun_core::{
    obs, Category, CategoryOutcomeReason, CategoryResult, ExecutionPlan, FailFastStrategy, Phase,
    Priority, ProgressReporter, RunConfig, StopDecision,
};

use crate::command::{BuildContext, CommandBuilder};
use crate::context::RunContext;
use crate::runner::CategoryRunner;

/// Results of executing a plan.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// One result per planned category, in plan order.
    pub results: Vec<CategoryResult>,
    /// Set when fail-fast stopped dispatch before the last phase.
    pub stop: Option<StopDecision>,
}

enum Slot {
    Ready(CategoryResult),
    Running(JoinHandle<CategoryResult>),
}

/// Drives the phases of an [`ExecutionPlan`].
#[derive(Clone)]
pub struct PhaseExecutor {
    builder: Arc<dyn CommandBuilder>,
    progress: Arc<dyn ProgressReporter>,
}

impl PhaseExecutor {
    pub fn new(builder: Arc<dyn CommandBuilder>, progress: Arc<dyn ProgressReporter>) -> Self {
        Self { builder, progress }
    }

    #[instrument(skip_all, fields(run_id = %ctx.run_id, phases = plan.phases.len()))]
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        ctx: &RunContext,
        strategy: &dyn FailFastStrategy,
    ) -> ExecutionOutcome {
        let mut results: Vec<CategoryResult> = Vec::with_capacity(plan.category_count());
        let env_vars = Arc::new(ctx.environment.env_vars());

        for (position, phase) in plan.phases.iter().enumerate() {
            let phase_results = self.execute_phase(phase, ctx, &env_vars).await;
            let failed = phase_results.iter().filter(|r| r.failed()).count();
            obs::emit_phase_finished(phase.index, phase_results.len() - failed, failed);
            results.extend(phase_results);

            let remaining = &plan.phases[position + 1..];
            if remaining.is_empty() {
                break;
            }
            if let Some(stop) = strategy.should_stop(&results) {
                let mut skipped = 0;
                for later in remaining {
                    for name in &later.categories {
                        let priority = priority_of(ctx, name);
                        results.push(CategoryResult::skipped_by_fail_fast(
                            name,
                            priority,
                            later.index,
                            &stop.triggered_by,
                        ));
                        skipped += 1;
                    }
                }
                obs::emit_fail_fast_triggered(&stop.triggered_by, &stop.reason, skipped);
                return ExecutionOutcome {
                    results,
                    stop: Some(stop),
                };
            }
        }

        ExecutionOutcome {
            results,
            stop: None,
        }
    }

    async fn execute_phase(
        &self,
        phase: &Phase,
        ctx: &RunContext,
        env_vars: &Arc<Vec<(String, String)>>,
    ) -> Vec<CategoryResult> {
        obs::emit_phase_started(phase.index, &phase.categories);
        self.progress.start_phase(phase.index, &phase.categories);

        let semaphore = Arc::new(Semaphore::new(ctx.config.max_parallel.max(1)));
        let mut slots = Vec::with_capacity(phase.len());

        for name in &phase.categories {
            let category = match ctx.registry.get(name) {
                Ok(category) => category.clone(),
                Err(e) => {
                    let result = CategoryResult::not_started(
                        name,
                        Priority::Low,
                        phase.index,
                        CategoryOutcomeReason::CommandUnavailable {
                            message: e.to_string(),
                        },
                    );
                    record_finished(self.progress.as_ref(), &result);
                    slots.push(Slot::Ready(result));
                    continue;
                }
            };

            if category.needs_environment() && !ctx.environment.is_available() {
                let reason = ctx
                    .environment
                    .unavailable_reason()
                    .unwrap_or("no service environment")
                    .to_string();
                let result = CategoryResult::environment_unavailable(
                    &category.name,
                    category.priority,
                    phase.index,
                    reason,
                );
                record_finished(self.progress.as_ref(), &result);
                slots.push(Slot::Ready(result));
                continue;
            }

            let task = CategoryTask {
                category,
                phase: phase.index,
                run_id: ctx.run_id.clone(),
                config: Arc::clone(&ctx.config),
                env_vars: Arc::clone(env_vars),
                builder: Arc::clone(&self.builder),
                progress: Arc::clone(&self.progress),
            };
            let semaphore = Arc::clone(&semaphore);
            slots.push(Slot::Running(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                task.run().await
            })));
        }

        let mut results = Vec::with_capacity(slots.len());
        let mut pending = slots.into_iter().zip(&phase.categories);
        while let Some((slot, name)) = pending.next() {
            match slot {
                Slot::Ready(result) => results.push(result),
                Slot::Running(handle) => match handle.await {
                    Ok(result) => results.push(result),
                    Err(e) if e.is_panic() => {
                        // Aborting drops each task's process handle, which
                        // kills its tree.
                        for (rest, _) in pending.by_ref() {
                            if let Slot::Running(sibling) = rest {
                                sibling.abort();
                            }
                        }
                        std::panic::resume_unwind(e.into_panic());
                    }
                    Err(e) => {
                        warn!(category = %name, error = %e, "category task cancelled");
                        let priority = priority_of(ctx, name);
                        results.push(CategoryResult::not_started(
                            name,
                            priority,
                            phase.index,
                            CategoryOutcomeReason::SpawnFailed {
                                message: e.to_string(),
                            },
                        ));
                    }
                },
            }
        }
        results
    }
}

fn priority_of(ctx: &RunContext, name: &str) -> Priority {
    ctx.registry
        .get(name)
        .map(|c| c.priority)
        .unwrap_or(Priority::Low)
}

/// Owned inputs for one dispatched category.
struct CategoryTask {
    category: Category,
    phase: usize,
    run_id: String,
    config: Arc<RunConfig>,
    env_vars: Arc<Vec<(String, String)>>,
    builder: Arc<dyn CommandBuilder>,
    progress: Arc<dyn ProgressReporter>,
}

impl CategoryTask {
    async fn run(self) -> CategoryResult {
        let started = Instant::now();
        obs::emit_category_started(&self.category.name, self.phase);
        self.progress.start_category(&self.category.name, self.phase);

        let ctx = BuildContext {
            run_id: &self.run_id,
            config: &self.config,
            env_vars: &self.env_vars,
        };
        let result = match self.builder.build(&self.category.service, &self.category, &ctx) {
            Ok(invocation) => {
                let runner = CategoryRunner::new(
                    self.config.timeouts.timeout_for(&self.category),
                    self.config.excerpt_bytes,
                );
                runner.run(&self.category, self.phase, &invocation).await
            }
            Err(e) => {
                warn!(category = %self.category.name, error = %e, "no invocation for category");
                let mut result = CategoryResult::not_started(
                    &self.category.name,
                    self.category.priority,
                    self.phase,
                    CategoryOutcomeReason::CommandUnavailable {
                        message: e.to_string(),
                    },
                );
                result.duration_ms = started.elapsed().as_millis() as u64;
                result
            }
        };

        record_finished(self.progress.as_ref(), &result);
        result
    }
}

fn record_finished(progress: &dyn ProgressReporter, result: &CategoryResult) {
    let outcome = result
        .reason
        .as_ref()
        .map(|r| r.to_string())
        .unwrap_or_else(|| "passed".to_string());
    obs::emit_category_finished(
        &result.category_name,
        result.success,
        result.duration_ms,
        &outcome,
    );
    progress.complete_category(&result.category_name, result.success, &result.test_counts);
}
