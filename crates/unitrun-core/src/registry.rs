//! Category registry: validated, read-only category definitions.
//!
//! The registry is loaded once per process. Loading rejects duplicate names,
//! dangling dependency/conflict references and dependency cycles, so the
//! planner can assume a well-formed acyclic graph.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::category::{Category, CategoryKind, Priority};
use crate::error::{CoreError, CoreResult};

/// Raw registry definition as parsed from TOML (`[[categories]]` tables).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub categories: Vec<Category>,
}

impl RegistryConfig {
    pub fn new(categories: Vec<Category>) -> Self {
        Self { categories }
    }
}

/// Aggregate numbers about the loaded categories.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub by_priority: BTreeMap<Priority, usize>,
    pub requiring_docker: usize,
    pub requiring_real_services: usize,
    pub requiring_real_llm: usize,
    pub total_estimated: Duration,
}

/// Validated category definitions, keyed by name.
#[derive(Debug, Clone)]
pub struct CategoryRegistry {
    categories: BTreeMap<String, Category>,
}

impl CategoryRegistry {
    /// Validate `config` and build a registry.
    pub fn load(config: RegistryConfig) -> CoreResult<Self> {
        let mut categories = BTreeMap::new();

        for category in config.categories {
            if category.name.trim().is_empty() {
                return Err(CoreError::Config("category with empty name".to_string()));
            }
            if let Some(rate) = category.historical_success_rate {
                if !(0.0..=1.0).contains(&rate) {
                    return Err(CoreError::Config(format!(
                        "category '{}' has historical_success_rate {} outside [0, 1]",
                        category.name, rate
                    )));
                }
            }
            if category.conflicts.contains(&category.name) {
                return Err(CoreError::Config(format!(
                    "category '{}' conflicts with itself",
                    category.name
                )));
            }
            let name = category.name.clone();
            if categories.insert(name.clone(), category).is_some() {
                return Err(CoreError::Config(format!("duplicate category name: {name}")));
            }
        }

        for category in categories.values() {
            for dep in &category.dependencies {
                if !categories.contains_key(dep) {
                    return Err(CoreError::Config(format!(
                        "category '{}' depends on unknown category '{}'",
                        category.name, dep
                    )));
                }
            }
            for other in &category.conflicts {
                if !categories.contains_key(other) {
                    return Err(CoreError::Config(format!(
                        "category '{}' conflicts with unknown category '{}'",
                        category.name, other
                    )));
                }
            }
        }

        if let Some(cycle) = find_cycle(&categories) {
            return Err(CoreError::CyclicDependency { cycle });
        }

        debug!(categories = categories.len(), "category registry loaded");
        Ok(Self { categories })
    }

    /// Parse and load a TOML registry document.
    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        let config: RegistryConfig = toml::from_str(content)?;
        Self::load(config)
    }

    /// Read and load a TOML registry file.
    pub fn from_path(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// The default category table.
    pub fn builtin() -> CoreResult<Self> {
        Self::load(RegistryConfig::new(builtin_categories()))
    }

    pub fn get(&self, name: &str) -> CoreResult<&Category> {
        self.categories.get(name).ok_or_else(|| CoreError::NotFound {
            name: name.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.categories.contains_key(name)
    }

    /// Categories with the given priority, sorted by name.
    pub fn get_by_priority(&self, priority: Priority) -> Vec<&Category> {
        self.categories
            .values()
            .filter(|c| c.priority == priority)
            .collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.categories.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Category> {
        self.categories.values()
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// `names` plus every transitive dependency.
    ///
    /// Unknown names are rejected rather than dropped.
    pub fn dependency_closure<I, S>(&self, names: I) -> CoreResult<BTreeSet<String>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut closure = BTreeSet::new();
        let mut stack = Vec::new();

        for name in names {
            let name = name.as_ref();
            if !self.categories.contains_key(name) {
                return Err(CoreError::UnknownCategory {
                    name: name.to_string(),
                });
            }
            stack.push(name.to_string());
        }

        while let Some(current) = stack.pop() {
            if !closure.insert(current.clone()) {
                continue;
            }
            if let Some(category) = self.categories.get(&current) {
                for dep in &category.dependencies {
                    if !closure.contains(dep) {
                        stack.push(dep.clone());
                    }
                }
            }
        }

        Ok(closure)
    }

    pub fn statistics(&self) -> RegistryStats {
        let mut by_priority = BTreeMap::new();
        for priority in Priority::ALL {
            by_priority.insert(priority, 0);
        }
        for category in self.categories.values() {
            *by_priority.entry(category.priority).or_insert(0) += 1;
        }

        RegistryStats {
            total: self.categories.len(),
            by_priority,
            requiring_docker: self.iter().filter(|c| c.requires_docker).count(),
            requiring_real_services: self.iter().filter(|c| c.requires_real_services).count(),
            requiring_real_llm: self.iter().filter(|c| c.requires_real_llm).count(),
            total_estimated: self.iter().map(|c| c.estimated_duration).sum(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// DFS over dependency edges with an explicit recursion stack. Returns the
/// first cycle found, in name order, as a closed path.
fn find_cycle(categories: &BTreeMap<String, Category>) -> Option<Vec<String>> {
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut path: Vec<&str> = Vec::new();

    for name in categories.keys() {
        if marks.contains_key(name.as_str()) {
            continue;
        }
        if let Some(cycle) = visit(name, categories, &mut marks, &mut path) {
            return Some(cycle);
        }
    }
    None
}

fn visit<'a>(
    node: &'a str,
    categories: &'a BTreeMap<String, Category>,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    match marks.get(node) {
        Some(Mark::Done) => return None,
        Some(Mark::InProgress) => {
            let start = path.iter().position(|n| *n == node).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        None => {}
    }

    marks.insert(node, Mark::InProgress);
    path.push(node);

    if let Some(category) = categories.get(node) {
        for dep in &category.dependencies {
            if let Some(cycle) = visit(dep.as_str(), categories, marks, path) {
                return Some(cycle);
            }
        }
    }

    path.pop();
    marks.insert(node, Mark::Done);
    None
}

fn builtin_categories() -> Vec<Category> {
    let secs = Duration::from_secs;
    vec![
        Category::new("smoke", Priority::Critical)
            .with_description("Fast sanity checks of the critical path")
            .with_estimate(secs(30)),
        Category::new("unit", Priority::Critical)
            .with_description("Isolated unit tests")
            .with_estimate(secs(120)),
        Category::new("database", Priority::High)
            .with_description("Schema, migrations and repository tests")
            .with_kind(CategoryKind::Integration)
            .with_estimate(secs(180))
            .depends_on("smoke")
            .docker(),
        Category::new("api", Priority::High)
            .with_description("HTTP API contract tests")
            .with_kind(CategoryKind::Api)
            .with_estimate(secs(240))
            .depends_on("database")
            .real_services(),
        Category::new("websocket", Priority::Medium)
            .with_description("Websocket event delivery")
            .with_kind(CategoryKind::Api)
            .with_estimate(secs(180))
            .depends_on("api")
            .real_services(),
        Category::new("agent", Priority::Medium)
            .with_description("Agent workflows against a real LLM")
            .with_kind(CategoryKind::Integration)
            .with_estimate(secs(600))
            .depends_on("unit")
            .real_llm()
            .optional(),
        Category::new("integration", Priority::High)
            .with_description("Cross-service integration tests")
            .with_kind(CategoryKind::Integration)
            .with_estimate(secs(600))
            .depends_on("database")
            .depends_on("api")
            .docker(),
        Category::new("security", Priority::Medium)
            .with_description("Authentication and authorization checks")
            .with_service("auth")
            .with_estimate(secs(240))
            .depends_on("unit"),
        Category::new("e2e_critical", Priority::Critical)
            .with_description("Critical user journeys end to end")
            .with_kind(CategoryKind::E2e)
            .with_estimate(secs(900))
            .depends_on("integration")
            .docker()
            .serial(),
        Category::new("e2e", Priority::Medium)
            .with_description("Full end-to-end suite")
            .with_kind(CategoryKind::E2e)
            .with_estimate(secs(1800))
            .depends_on("integration")
            .conflicts_with("performance")
            .docker(),
        Category::new("frontend", Priority::Medium)
            .with_description("Frontend component tests")
            .with_kind(CategoryKind::Frontend)
            .with_service("frontend")
            .with_estimate(secs(300))
            .depends_on("smoke"),
        Category::new("performance", Priority::Low)
            .with_description("Load and latency benchmarks")
            .with_kind(CategoryKind::Performance)
            .with_estimate(secs(1200))
            .depends_on("integration")
            .docker()
            .optional(),
    ]
}
