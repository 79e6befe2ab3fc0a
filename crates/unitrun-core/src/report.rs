//! Aggregated run report.
//!
//! The report is the single source of truth for the process exit code: a
//! run succeeds only when every executed category succeeded and at least
//! one test actually ran.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::fail_fast::StopDecision;
use crate::planner::ExecutionPlan;
use crate::result::{CategoryResult, TestCounts};

pub const REPORT_SCHEMA_VERSION: &str = "1";

/// Overall classification of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Passed,
    /// Tests ran and at least one category failed.
    TestsFailed,
    /// Nothing executed a single test.
    NoTestsExecuted,
}

/// Plan layout as recorded in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub phases: Vec<Vec<String>>,
    pub skipped_by_resume: Vec<String>,
    pub digest: String,
}

impl From<&ExecutionPlan> for PlanSummary {
    fn from(plan: &ExecutionPlan) -> Self {
        Self {
            phases: plan.phases.iter().map(|p| p.categories.clone()).collect(),
            skipped_by_resume: plan.skipped.clone(),
            digest: plan.digest.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub schema_version: String,
    pub run_id: String,
    pub environment: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub plan: PlanSummary,
    /// One entry per planned category, in execution order.
    pub results: Vec<CategoryResult>,
    pub fail_fast: Option<StopDecision>,
    pub environment_status: Option<String>,
    pub outcome: RunOutcome,
    pub overall_success: bool,
}

impl RunReport {
    /// Aggregate results into a report finished now.
    pub fn from_results(
        run_id: impl Into<String>,
        environment: impl Into<String>,
        plan: &ExecutionPlan,
        results: Vec<CategoryResult>,
        fail_fast: Option<StopDecision>,
        environment_status: Option<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        let outcome = classify(&results);
        Self {
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            run_id: run_id.into(),
            environment: environment.into(),
            started_at,
            finished_at,
            duration_ms,
            plan: PlanSummary::from(plan),
            results,
            fail_fast,
            environment_status,
            outcome,
            overall_success: outcome == RunOutcome::Passed,
        }
    }

    /// Process exit code: 0 iff the run succeeded.
    pub fn exit_code(&self) -> i32 {
        if self.overall_success {
            0
        } else {
            1
        }
    }

    pub fn totals(&self) -> TestCounts {
        totals(&self.results)
    }

    pub fn failed_categories(&self) -> Vec<&CategoryResult> {
        self.results.iter().filter(|r| r.failed()).collect()
    }

    pub fn skipped_categories(&self) -> Vec<&CategoryResult> {
        self.results.iter().filter(|r| r.skipped).collect()
    }

    pub fn passed_categories(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    /// Human-readable summary for terminal output.
    pub fn render_summary(&self) -> String {
        let totals = self.totals();
        let mut out = String::new();
        out.push_str(&format!(
            "Run {} ({}) finished in {:.1}s\n",
            self.run_id,
            self.environment,
            self.duration_ms as f64 / 1000.0
        ));
        out.push_str(&format!(
            "Categories: {} passed, {} failed, {} skipped\n",
            self.passed_categories(),
            self.failed_categories().len(),
            self.skipped_categories().len()
        ));
        out.push_str(&format!(
            "Tests: {} passed, {} failed, {} skipped ({} total)\n",
            totals.passed, totals.failed, totals.skipped, totals.total
        ));

        for r in &self.results {
            let mark = if r.success {
                "✓"
            } else if r.skipped {
                "-"
            } else {
                "✗"
            };
            let detail = match &r.reason {
                Some(reason) => format!(" [{reason}]"),
                None => String::new(),
            };
            out.push_str(&format!(
                "  {mark} phase {} {} ({} ms){detail}\n",
                r.phase, r.category_name, r.duration_ms
            ));
        }

        if let Some(stop) = &self.fail_fast {
            out.push_str(&format!(
                "Fail-fast: stopped after '{}': {}\n",
                stop.triggered_by, stop.reason
            ));
        }
        if let Some(status) = &self.environment_status {
            out.push_str(&format!("Environment: {status}\n"));
        }

        match self.outcome {
            RunOutcome::Passed => out.push_str("Result: PASSED\n"),
            RunOutcome::TestsFailed => {
                let first = self.failed_categories().first().map(|r| {
                    format!(" (first failure: '{}' in phase {})", r.category_name, r.phase)
                });
                out.push_str(&format!(
                    "Result: FAILED, tests ran and failed{}\n",
                    first.unwrap_or_default()
                ));
            }
            RunOutcome::NoTestsExecuted => {
                out.push_str("Result: FAILED, no tests were executed\n");
            }
        }
        out
    }

    /// Persist the report as pretty JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("serialize run report")?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| format!("create {:?}", parent))?;
        }
        std::fs::write(path, content).with_context(|| format!("write {:?}", path))?;
        Ok(())
    }
}

fn totals(results: &[CategoryResult]) -> TestCounts {
    let mut acc = TestCounts::default();
    for r in results.iter().filter(|r| !r.skipped) {
        acc.merge(&r.test_counts);
    }
    acc
}

fn classify(results: &[CategoryResult]) -> RunOutcome {
    if totals(results).executed() == 0 {
        return RunOutcome::NoTestsExecuted;
    }
    if results.iter().filter(|r| !r.skipped).all(|r| r.success) {
        RunOutcome::Passed
    } else {
        RunOutcome::TestsFailed
    }
}
