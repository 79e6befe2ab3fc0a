//! Execution planning: topological phase batching.
//!
//! A plan is an ordered list of phases. Every category in phase `i` has all
//! of its dependencies in phases `0..i`, no two categories in a phase
//! conflict, and each phase holds at most `max_parallel` categories.
//! Categories that are not parallel-safe get a phase of their own.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::category::Category;
use crate::error::{CoreError, CoreResult};
use crate::registry::CategoryRegistry;

/// A batch of categories that may run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    /// 0-indexed position in the plan.
    pub index: usize,
    /// Categories in dispatch order (priority, then shortest estimate).
    pub categories: Vec<String>,
}

impl Phase {
    pub fn contains(&self, name: &str) -> bool {
        self.categories.iter().any(|c| c == name)
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

/// An ordered, validated phase plan for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Categories the caller asked for (before dependency closure).
    pub requested_categories: BTreeSet<String>,
    pub phases: Vec<Phase>,
    /// Flattening of `phases`.
    pub execution_order: Vec<String>,
    /// Categories dropped by `resume_from`.
    pub skipped: Vec<String>,
    /// SHA-256 of the phase layout.
    pub digest: String,
}

impl ExecutionPlan {
    fn from_phases(
        requested_categories: BTreeSet<String>,
        phases: Vec<Vec<String>>,
        skipped: Vec<String>,
    ) -> Self {
        let phases: Vec<Phase> = phases
            .into_iter()
            .filter(|p| !p.is_empty())
            .enumerate()
            .map(|(index, categories)| Phase { index, categories })
            .collect();
        let execution_order = phases
            .iter()
            .flat_map(|p| p.categories.iter().cloned())
            .collect();
        let digest = compute_plan_digest(&phases);
        Self {
            requested_categories,
            phases,
            execution_order,
            skipped,
            digest,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Number of scheduled categories across all phases.
    pub fn category_count(&self) -> usize {
        self.execution_order.len()
    }

    /// Index of the phase containing `name`.
    pub fn phase_of(&self, name: &str) -> Option<usize> {
        self.phases.iter().find(|p| p.contains(name)).map(|p| p.index)
    }

    pub fn short_digest(&self) -> &str {
        &self.digest[..12.min(self.digest.len())]
    }
}

/// Planner knobs beyond the requested set.
#[derive(Debug, Clone)]
pub struct PlanOptions {
    /// Upper bound on categories per phase. Zero is treated as one.
    pub max_parallel: usize,
    /// Drop everything scheduled before this category.
    pub resume_from: Option<String>,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            resume_from: None,
        }
    }
}

/// Builds [`ExecutionPlan`]s against a registry. Pure: no I/O.
pub struct ExecutionPlanner<'a> {
    registry: &'a CategoryRegistry,
}

impl<'a> ExecutionPlanner<'a> {
    pub fn new(registry: &'a CategoryRegistry) -> Self {
        Self { registry }
    }

    pub fn create_plan<I, S>(&self, requested: I, max_parallel: usize) -> CoreResult<ExecutionPlan>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.create_plan_with(
            requested,
            &PlanOptions {
                max_parallel,
                resume_from: None,
            },
        )
    }

    pub fn create_plan_with<I, S>(
        &self,
        requested: I,
        options: &PlanOptions,
    ) -> CoreResult<ExecutionPlan>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let requested: BTreeSet<String> = requested
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect();
        let closure = self.registry.dependency_closure(&requested)?;
        let max_parallel = options.max_parallel.max(1);

        let mut phases = self.batch_phases(&closure, max_parallel)?;

        let mut skipped = Vec::new();
        if let Some(resume) = &options.resume_from {
            if !self.registry.contains(resume) {
                return Err(CoreError::UnknownCategory {
                    name: resume.clone(),
                });
            }
            let order: Vec<&String> = phases.iter().flatten().collect();
            let position = order.iter().position(|c| *c == resume).ok_or_else(|| {
                CoreError::Config(format!(
                    "resume point '{resume}' is not part of the planned categories"
                ))
            })?;
            let drop: BTreeSet<String> = order[..position].iter().map(|c| c.to_string()).collect();
            skipped = order[..position].iter().map(|c| c.to_string()).collect();
            for phase in &mut phases {
                phase.retain(|c| !drop.contains(c));
            }
        }

        let plan = ExecutionPlan::from_phases(requested, phases, skipped);
        debug!(
            phases = plan.phases.len(),
            categories = plan.category_count(),
            digest = %plan.short_digest(),
            "execution plan built"
        );
        Ok(plan)
    }

    fn batch_phases(
        &self,
        closure: &BTreeSet<String>,
        max_parallel: usize,
    ) -> CoreResult<Vec<Vec<String>>> {
        let mut scheduled: BTreeSet<&str> = BTreeSet::new();
        let mut remaining: BTreeSet<&str> = closure.iter().map(String::as_str).collect();
        let mut phases = Vec::new();

        while !remaining.is_empty() {
            let mut ready: Vec<&Category> = Vec::new();
            for name in &remaining {
                let category = self.registry.get(name)?;
                if category
                    .dependencies
                    .iter()
                    .all(|d| scheduled.contains(d.as_str()))
                {
                    ready.push(category);
                }
            }

            if ready.is_empty() {
                return Err(CoreError::CyclicDependency {
                    cycle: remaining.iter().map(|s| s.to_string()).collect(),
                });
            }

            ready.sort_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(a.estimated_duration.cmp(&b.estimated_duration))
                    .then(a.name.cmp(&b.name))
            });

            let mut phase: Vec<&Category> = Vec::new();
            for candidate in ready {
                if phase.len() >= max_parallel {
                    break;
                }
                if !phase.is_empty()
                    && (!candidate.parallel_safe || phase.iter().any(|c| !c.parallel_safe))
                {
                    continue;
                }
                if phase.iter().any(|c| c.conflicts_with_category(candidate)) {
                    continue;
                }
                phase.push(candidate);
            }

            for category in &phase {
                remaining.remove(category.name.as_str());
                scheduled.insert(category.name.as_str());
            }
            phases.push(phase.iter().map(|c| c.name.clone()).collect());
        }

        Ok(phases)
    }
}

/// Order-sensitive digest of a phase layout.
fn compute_plan_digest(phases: &[Phase]) -> String {
    let mut hasher = Sha256::new();
    for phase in phases {
        for category in &phase.categories {
            hasher.update(category.as_bytes());
            hasher.update(b"\0");
        }
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::Priority;
    use crate::registry::RegistryConfig;
    use std::time::Duration;

    fn registry(categories: Vec<Category>) -> CategoryRegistry {
        CategoryRegistry::load(RegistryConfig::new(categories)).unwrap()
    }

    fn names(plan: &ExecutionPlan) -> Vec<Vec<&str>> {
        plan.phases
            .iter()
            .map(|p| p.categories.iter().map(String::as_str).collect())
            .collect()
    }

    #[test]
    fn test_dependency_yields_two_phases() {
        let reg = registry(vec![
            Category::new("A", Priority::High).depends_on("B"),
            Category::new("B", Priority::High),
        ]);
        let plan = ExecutionPlanner::new(&reg).create_plan(["A"], 4).unwrap();
        assert_eq!(names(&plan), vec![vec!["B"], vec!["A"]]);
        assert_eq!(plan.execution_order, vec!["B", "A"]);
    }

    #[test]
    fn test_conflicting_pair_is_split() {
        let reg = registry(vec![
            Category::new("X", Priority::High).conflicts_with("Y"),
            Category::new("Y", Priority::High),
        ]);
        let plan = ExecutionPlanner::new(&reg).create_plan(["X", "Y"], 2).unwrap();
        assert_eq!(plan.phases.len(), 2);
        assert_eq!(plan.phases[0].len(), 1);
        assert_eq!(plan.phases[1].len(), 1);
    }

    #[test]
    fn test_higher_priority_wins_conflict() {
        let reg = registry(vec![
            Category::new("low", Priority::Low).conflicts_with("crit"),
            Category::new("crit", Priority::Critical),
        ]);
        let plan = ExecutionPlanner::new(&reg).create_plan(["low", "crit"], 4).unwrap();
        assert_eq!(names(&plan), vec![vec!["crit"], vec!["low"]]);
    }

    #[test]
    fn test_empty_request_yields_empty_plan() {
        let reg = registry(vec![Category::new("a", Priority::High)]);
        let plan = ExecutionPlanner::new(&reg)
            .create_plan(Vec::<String>::new(), 4)
            .unwrap();
        assert!(plan.is_empty());
        assert!(plan.execution_order.is_empty());
    }

    #[test]
    fn test_unknown_category_is_not_dropped() {
        let reg = registry(vec![Category::new("a", Priority::High)]);
        let err = ExecutionPlanner::new(&reg)
            .create_plan(["a", "typo"], 4)
            .unwrap_err();
        assert!(matches!(err, CoreError::UnknownCategory { name } if name == "typo"));
    }

    #[test]
    fn test_max_parallel_caps_phase_and_prefers_short_jobs() {
        let reg = registry(vec![
            Category::new("long", Priority::Medium).with_estimate(Duration::from_secs(600)),
            Category::new("short", Priority::Medium).with_estimate(Duration::from_secs(10)),
            Category::new("mid", Priority::Medium).with_estimate(Duration::from_secs(100)),
        ]);
        let plan = ExecutionPlanner::new(&reg)
            .create_plan(["long", "short", "mid"], 2)
            .unwrap();
        assert_eq!(names(&plan), vec![vec!["short", "mid"], vec!["long"]]);
    }

    #[test]
    fn test_zero_max_parallel_treated_as_one() {
        let reg = registry(vec![
            Category::new("a", Priority::High),
            Category::new("b", Priority::High),
        ]);
        let plan = ExecutionPlanner::new(&reg).create_plan(["a", "b"], 0).unwrap();
        assert_eq!(plan.phases.len(), 2);
    }

    #[test]
    fn test_serial_category_runs_alone() {
        let reg = registry(vec![
            Category::new("a", Priority::High),
            Category::new("b", Priority::Critical).serial(),
            Category::new("c", Priority::High),
        ]);
        let plan = ExecutionPlanner::new(&reg)
            .create_plan(["a", "b", "c"], 4)
            .unwrap();
        assert_eq!(names(&plan), vec![vec!["b"], vec!["a", "c"]]);
    }

    #[test]
    fn test_resume_from_skips_earlier_categories() {
        let reg = registry(vec![
            Category::new("a", Priority::High),
            Category::new("b", Priority::High).depends_on("a"),
            Category::new("c", Priority::High).depends_on("b"),
        ]);
        let plan = ExecutionPlanner::new(&reg)
            .create_plan_with(
                ["c"],
                &PlanOptions {
                    max_parallel: 4,
                    resume_from: Some("b".to_string()),
                },
            )
            .unwrap();
        assert_eq!(names(&plan), vec![vec!["b"], vec!["c"]]);
        assert_eq!(plan.skipped, vec!["a"]);
        assert_eq!(plan.phases[0].index, 0);
    }

    #[test]
    fn test_resume_from_outside_plan_is_config_error() {
        let reg = registry(vec![
            Category::new("a", Priority::High),
            Category::new("b", Priority::High),
        ]);
        let err = ExecutionPlanner::new(&reg)
            .create_plan_with(
                ["a"],
                &PlanOptions {
                    max_parallel: 4,
                    resume_from: Some("b".to_string()),
                },
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn test_digest_is_order_sensitive() {
        let reg = registry(vec![
            Category::new("a", Priority::High).depends_on("b"),
            Category::new("b", Priority::High),
            Category::new("c", Priority::High),
        ]);
        let planner = ExecutionPlanner::new(&reg);
        let one = planner.create_plan(["a"], 4).unwrap();
        let two = planner.create_plan(["a"], 4).unwrap();
        let three = planner.create_plan(["c"], 4).unwrap();
        assert_eq!(one.digest, two.digest);
        assert_ne!(one.digest, three.digest);
    }
}
