//! Run configuration: TOML file, then `UNITRUN_*` environment overrides.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::category::{Category, CategoryKind};
use crate::error::{CoreError, CoreResult};
use crate::fail_fast::{FailFastMode, FailFastPolicy};

pub const ENV_SELECTOR: &str = "UNITRUN_ENV";
pub const ENV_MAX_PARALLEL: &str = "UNITRUN_MAX_PARALLEL";
pub const ENV_FAIL_FAST: &str = "UNITRUN_FAIL_FAST";
pub const ENV_REAL_SERVICES: &str = "UNITRUN_REAL_SERVICES";
pub const ENV_REAL_LLM: &str = "UNITRUN_REAL_LLM";

/// Which deployment the run targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentSelector {
    #[default]
    Test,
    Dev,
    Staging,
    Prod,
}

impl EnvironmentSelector {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentSelector::Test => "test",
            EnvironmentSelector::Dev => "dev",
            EnvironmentSelector::Staging => "staging",
            EnvironmentSelector::Prod => "prod",
        }
    }

    /// Test and dev provision containers locally; staging and prod are
    /// assumed to be reachable already.
    pub fn provisions_locally(&self) -> bool {
        matches!(self, EnvironmentSelector::Test | EnvironmentSelector::Dev)
    }

    /// Variables exported to every category subprocess.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        vec![
            ("ENVIRONMENT".to_string(), self.as_str().to_string()),
            ("UNITRUN_ENVIRONMENT".to_string(), self.as_str().to_string()),
        ]
    }
}

impl fmt::Display for EnvironmentSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvironmentSelector {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "test" => Ok(EnvironmentSelector::Test),
            "dev" | "development" => Ok(EnvironmentSelector::Dev),
            "staging" => Ok(EnvironmentSelector::Staging),
            "prod" | "production" => Ok(EnvironmentSelector::Prod),
            other => Err(CoreError::Config(format!("unknown environment: {other}"))),
        }
    }
}

/// Whether a provisioned environment is reused across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentType {
    /// One environment per selector, reference counted across runs.
    Shared,
    /// One environment per run.
    #[default]
    Dedicated,
}

impl EnvironmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentType::Shared => "shared",
            EnvironmentType::Dedicated => "dedicated",
        }
    }
}

impl FromStr for EnvironmentType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shared" => Ok(EnvironmentType::Shared),
            "dedicated" => Ok(EnvironmentType::Dedicated),
            other => Err(CoreError::Config(format!("unknown environment type: {other}"))),
        }
    }
}

/// Default timeout per category kind, plus per-category overrides.
/// All values are seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutTable {
    pub unit_secs: u64,
    pub api_secs: u64,
    pub integration_secs: u64,
    pub frontend_secs: u64,
    pub e2e_secs: u64,
    pub performance_secs: u64,
    /// Keyed by category name; wins over everything else.
    pub overrides: BTreeMap<String, u64>,
}

impl Default for TimeoutTable {
    fn default() -> Self {
        Self {
            unit_secs: 300,
            api_secs: 600,
            integration_secs: 900,
            frontend_secs: 600,
            e2e_secs: 1800,
            performance_secs: 1800,
            overrides: BTreeMap::new(),
        }
    }
}

impl TimeoutTable {
    pub fn for_kind(&self, kind: CategoryKind) -> Duration {
        let secs = match kind {
            CategoryKind::Unit => self.unit_secs,
            CategoryKind::Api => self.api_secs,
            CategoryKind::Integration => self.integration_secs,
            CategoryKind::Frontend => self.frontend_secs,
            CategoryKind::E2e => self.e2e_secs,
            CategoryKind::Performance => self.performance_secs,
        };
        Duration::from_secs(secs)
    }

    /// Name override, then the category's own timeout, then its kind default.
    pub fn timeout_for(&self, category: &Category) -> Duration {
        if let Some(secs) = self.overrides.get(&category.name) {
            return Duration::from_secs(*secs);
        }
        category
            .timeout
            .unwrap_or_else(|| self.for_kind(category.kind))
    }
}

/// Everything a single run needs beyond the category registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub environment: EnvironmentSelector,
    pub env_type: EnvironmentType,
    /// Provision services even when no planned category asks for them.
    pub real_services: bool,
    pub real_llm: bool,
    pub max_parallel: usize,
    pub fail_fast: FailFastPolicy,
    pub timeouts: TimeoutTable,
    pub resume_from: Option<String>,
    /// Test-name selection passed to runners that honour it.
    pub pattern: Option<String>,
    /// Directory category commands run from.
    pub working_dir: Option<PathBuf>,
    /// Bytes of stdout/stderr tail kept per category.
    pub excerpt_bytes: usize,
    pub report_path: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            environment: EnvironmentSelector::default(),
            env_type: EnvironmentType::default(),
            real_services: false,
            real_llm: false,
            max_parallel: 4,
            fail_fast: FailFastPolicy::default(),
            timeouts: TimeoutTable::default(),
            resume_from: None,
            pattern: None,
            working_dir: None,
            excerpt_bytes: 4096,
            report_path: None,
        }
    }
}

impl RunConfig {
    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        let config: RunConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Apply `UNITRUN_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) -> CoreResult<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup; unset keys are ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> CoreResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_SELECTOR) {
            self.environment = v.parse()?;
        }
        if let Some(v) = lookup(ENV_MAX_PARALLEL) {
            self.max_parallel = v
                .trim()
                .parse()
                .map_err(|_| CoreError::Config(format!("{ENV_MAX_PARALLEL}: not a number: {v}")))?;
        }
        if let Some(v) = lookup(ENV_FAIL_FAST) {
            self.fail_fast.mode = v.parse::<FailFastMode>()?;
        }
        if let Some(v) = lookup(ENV_REAL_SERVICES) {
            self.real_services = parse_flag(ENV_REAL_SERVICES, &v)?;
        }
        if let Some(v) = lookup(ENV_REAL_LLM) {
            self.real_llm = parse_flag(ENV_REAL_LLM, &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.max_parallel == 0 {
            return Err(CoreError::Config("max_parallel must be at least 1".into()));
        }
        if let Some(t) = self.fail_fast.failure_rate_threshold {
            if !(0.0..=1.0).contains(&t) {
                return Err(CoreError::Config(format!(
                    "failure_rate_threshold must be within [0, 1], got {t}"
                )));
            }
        }
        if self.excerpt_bytes == 0 {
            return Err(CoreError::Config("excerpt_bytes must be positive".into()));
        }
        if let Some((name, _)) = self.timeouts.overrides.iter().find(|(_, s)| **s == 0) {
            return Err(CoreError::Config(format!("timeout override for '{name}' is zero")));
        }
        Ok(())
    }
}

fn parse_flag(key: &str, value: &str) -> CoreResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(CoreError::Config(format!("{key}: not a boolean: {other}"))),
    }
}
