//! Turning a category into a concrete subprocess invocation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use unitrun_core::{Category, RunConfig};

use crate::error::{ExecError, ExecResult};

/// Everything needed to start one subprocess.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationDescriptor {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Added on top of the inherited process environment.
    pub env: BTreeMap<String, String>,
}

impl InvocationDescriptor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

impl fmt::Display for InvocationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.contains(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Run-level inputs a builder may consult.
#[derive(Debug, Clone, Copy)]
pub struct BuildContext<'a> {
    pub run_id: &'a str,
    pub config: &'a RunConfig,
    /// Variables describing the service environment (ports, ids).
    pub env_vars: &'a [(String, String)],
}

/// Produces the invocation for a category run by `service`.
pub trait CommandBuilder: Send + Sync {
    fn build(
        &self,
        service: &str,
        category: &Category,
        ctx: &BuildContext<'_>,
    ) -> ExecResult<InvocationDescriptor>;
}

/// Command template for one service. `{category}` and `{pattern}` are
/// substituted in `args` and `pattern_args`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTemplate {
    pub program: String,
    pub args: Vec<String>,
    /// Relative to the run's working directory.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Appended when the category's pattern filtering applies.
    #[serde(default)]
    pub pattern_args: Vec<String>,
}

impl ServiceTemplate {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            working_dir: None,
            pattern_args: Vec::new(),
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_pattern_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pattern_args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Template-driven [`CommandBuilder`] keyed by service name.
#[derive(Debug, Clone)]
pub struct TemplateCommandBuilder {
    templates: BTreeMap<String, ServiceTemplate>,
}

impl Default for TemplateCommandBuilder {
    fn default() -> Self {
        let pytest = |dir: Option<&str>| {
            let t = ServiceTemplate::new("python", ["-m", "pytest", "-m", "{category}"])
                .with_pattern_args(["-k", "{pattern}"]);
            match dir {
                Some(d) => t.in_dir(d),
                None => t,
            }
        };
        let mut templates = BTreeMap::new();
        templates.insert("backend".to_string(), pytest(None));
        templates.insert("auth".to_string(), pytest(Some("auth_service")));
        templates.insert(
            "frontend".to_string(),
            ServiceTemplate::new("npm", ["run", "test", "--", "--testPathPattern={category}"])
                .in_dir("frontend")
                .with_pattern_args(["--testNamePattern={pattern}"]),
        );
        Self { templates }
    }
}

impl TemplateCommandBuilder {
    pub fn empty() -> Self {
        Self {
            templates: BTreeMap::new(),
        }
    }

    pub fn with_template(mut self, service: impl Into<String>, template: ServiceTemplate) -> Self {
        self.templates.insert(service.into(), template);
        self
    }

    pub fn template(&self, service: &str) -> Option<&ServiceTemplate> {
        self.templates.get(service)
    }
}

fn substitute(value: &str, category: &str, pattern: &str) -> String {
    value
        .replace("{category}", category)
        .replace("{pattern}", pattern)
}

fn resolve_dir(base: Option<&Path>, dir: Option<&Path>) -> Option<PathBuf> {
    match (base, dir) {
        (Some(base), Some(dir)) if dir.is_relative() => Some(base.join(dir)),
        (_, Some(dir)) => Some(dir.to_path_buf()),
        (Some(base), None) => Some(base.to_path_buf()),
        (None, None) => None,
    }
}

impl CommandBuilder for TemplateCommandBuilder {
    fn build(
        &self,
        service: &str,
        category: &Category,
        ctx: &BuildContext<'_>,
    ) -> ExecResult<InvocationDescriptor> {
        let template = self.templates.get(service);
        let pattern = ctx.config.pattern.as_deref().unwrap_or_default();
        let name = category.name.as_str();

        let (program, args, dir) = match (&category.command, template) {
            (Some(command), _) => {
                let (program, rest) = command.split_first().ok_or_else(|| ExecError::EmptyCommand {
                    category: name.to_string(),
                })?;
                (program.clone(), rest.to_vec(), None)
            }
            (None, Some(t)) => (t.program.clone(), t.args.clone(), t.working_dir.clone()),
            (None, None) => {
                return Err(ExecError::UnknownService {
                    service: service.to_string(),
                    category: name.to_string(),
                })
            }
        };
        if program.trim().is_empty() {
            return Err(ExecError::EmptyCommand {
                category: name.to_string(),
            });
        }

        let mut invocation = InvocationDescriptor::new(substitute(&program, name, pattern))
            .args(args.iter().map(|a| substitute(a, name, pattern)));

        if !pattern.is_empty() && category.pattern_filtering.applies_to(service) {
            if let Some(t) = template {
                invocation = invocation
                    .args(t.pattern_args.iter().map(|a| substitute(a, name, pattern)));
            }
        }

        invocation.working_dir = resolve_dir(ctx.config.working_dir.as_deref(), dir.as_deref());

        for (k, v) in ctx.config.environment.env_vars() {
            invocation = invocation.env(k, v);
        }
        for (k, v) in ctx.env_vars {
            invocation = invocation.env(k.clone(), v.clone());
        }
        let flag = |b: bool| if b { "1" } else { "0" };
        Ok(invocation
            .env("UNITRUN_RUN_ID", ctx.run_id)
            .env("UNITRUN_CATEGORY", name)
            .env("UNITRUN_REAL_SERVICES", flag(ctx.config.real_services))
            .env("UNITRUN_REAL_LLM", flag(ctx.config.real_llm)))
    }
}
