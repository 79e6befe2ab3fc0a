//! Test category metadata.
//!
//! A [`Category`] is a named, independently executable slice of the test
//! suite. Its priority, dependencies, conflicts and resource flags drive the
//! planner; everything else is carried through to the command builder.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CoreError;

/// Scheduling priority. Declaration order is significance order, so
/// `Critical < High < Medium < Low` under `Ord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(CoreError::Config(format!("unknown priority: {other}"))),
        }
    }
}

/// Coarse class of a category, used to pick a default timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CategoryKind {
    #[default]
    Unit,
    Api,
    Integration,
    E2e,
    Frontend,
    Performance,
}

/// Whether a user-supplied test pattern (`-k` style selection) is applied
/// to a category's invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PatternFiltering {
    /// The pattern is ignored for this category.
    Never,
    /// The pattern is always applied.
    Always,
    /// Applied for backend services, ignored for the frontend runner.
    #[default]
    Default,
}

impl PatternFiltering {
    /// Resolve the setting for the service that runs the category.
    pub fn applies_to(&self, service: &str) -> bool {
        match self {
            PatternFiltering::Never => false,
            PatternFiltering::Always => true,
            PatternFiltering::Default => service != "frontend",
        }
    }
}

/// A test category definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    /// Unique key.
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub priority: Priority,

    /// Expected wall-clock time, used to order deferred work.
    #[serde(rename = "estimated_secs", with = "duration_secs", default)]
    pub estimated_duration: Duration,

    /// Categories that must complete before this one starts.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,

    /// Categories that must never share a phase with this one.
    #[serde(default)]
    pub conflicts: BTreeSet<String>,

    #[serde(default)]
    pub requires_docker: bool,

    #[serde(default)]
    pub requires_real_services: bool,

    #[serde(default)]
    pub requires_real_llm: bool,

    #[serde(default = "default_true")]
    pub parallel_safe: bool,

    /// Optional categories never make environment acquisition fatal.
    #[serde(default)]
    pub optional: bool,

    /// Informational success rate in `[0, 1]`.
    #[serde(default)]
    pub historical_success_rate: Option<f64>,

    #[serde(default)]
    pub kind: CategoryKind,

    /// Command-builder service that runs this category.
    #[serde(default = "default_service")]
    pub service: String,

    /// Explicit invocation; bypasses the service template when set.
    #[serde(default)]
    pub command: Option<Vec<String>>,

    #[serde(default)]
    pub pattern_filtering: PatternFiltering,

    /// Overrides the timeout table's kind default.
    #[serde(rename = "timeout_secs", with = "option_duration_secs", default)]
    pub timeout: Option<Duration>,
}

fn default_true() -> bool {
    true
}

fn default_service() -> String {
    "backend".to_string()
}

impl Category {
    /// Create a category with the given name and priority and neutral defaults.
    pub fn new(name: impl Into<String>, priority: Priority) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            priority,
            estimated_duration: Duration::from_secs(60),
            dependencies: BTreeSet::new(),
            conflicts: BTreeSet::new(),
            requires_docker: false,
            requires_real_services: false,
            requires_real_llm: false,
            parallel_safe: true,
            optional: false,
            historical_success_rate: None,
            kind: CategoryKind::Unit,
            service: default_service(),
            command: None,
            pattern_filtering: PatternFiltering::Default,
            timeout: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_estimate(mut self, estimate: Duration) -> Self {
        self.estimated_duration = estimate;
        self
    }

    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.dependencies.insert(name.into());
        self
    }

    pub fn conflicts_with(mut self, name: impl Into<String>) -> Self {
        self.conflicts.insert(name.into());
        self
    }

    pub fn with_kind(mut self, kind: CategoryKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = Some(command.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn docker(mut self) -> Self {
        self.requires_docker = true;
        self
    }

    pub fn real_services(mut self) -> Self {
        self.requires_real_services = true;
        self
    }

    pub fn real_llm(mut self) -> Self {
        self.requires_real_llm = true;
        self
    }

    pub fn serial(mut self) -> Self {
        self.parallel_safe = false;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Whether the category needs a provisioned service environment.
    pub fn needs_environment(&self) -> bool {
        self.requires_docker || self.requires_real_services
    }

    /// Whether `self` and `other` may not share a phase. Either side
    /// declaring the conflict is enough.
    pub fn conflicts_with_category(&self, other: &Category) -> bool {
        self.conflicts.contains(&other.name) || other.conflicts.contains(&self.name)
    }
}

/// Serde adapter storing a [`Duration`] as whole seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

pub(crate) mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}
