//! unitrun - unified category-based test runner
//!
//! ## Commands
//!
//! - `run`: plan, provision and execute test categories
//! - `plan`: print the phased execution plan without running anything
//! - `categories`: list the category registry with statistics
//! - `cleanup`: remove stale containers left by earlier runs

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use unitrun_core::{
    level_for_verbosity, CategoryRegistry, EnvironmentSelector, EnvironmentType, FailFastMode,
    Priority, RunConfig,
};
use unitrun_env::{DockerCli, ManagerConfig, ServiceEnvironmentManager};
use unitrun_exec::{exit_code_for, RunError, RunOrchestrator};

#[derive(Parser)]
#[command(name = "unitrun")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Unified category-based test runner", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit JSON-formatted log lines (and a JSON report for `run`)
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan, provision and execute test categories
    Run(RunArgs),

    /// Print the execution plan without running anything
    Plan {
        #[command(flatten)]
        selection: Selection,
    },

    /// List registered categories
    Categories {
        /// Category registry file (TOML); built-in registry when omitted
        #[arg(long)]
        registry: Option<PathBuf>,

        /// Only list categories of this priority
        #[arg(long)]
        priority: Option<Priority>,
    },

    /// Remove stale unitrun containers
    Cleanup {
        /// Environment selector the containers belong to
        #[arg(long, default_value = "test")]
        env: EnvironmentSelector,
    },
}

/// Which categories to plan and how.
#[derive(Args, Debug, Clone)]
struct Selection {
    /// Categories to run (comma-separated); all non-optional when omitted
    #[arg(short, long, value_delimiter = ',')]
    categories: Vec<String>,

    /// Category registry file (TOML); built-in registry when omitted
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Run configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum categories per phase
    #[arg(long)]
    max_parallel: Option<usize>,

    /// Skip every category scheduled before this one
    #[arg(long)]
    resume_from: Option<String>,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    #[command(flatten)]
    selection: Selection,

    /// Environment selector (test, dev, staging, prod)
    #[arg(long)]
    env: Option<EnvironmentSelector>,

    /// Environment type (shared, dedicated)
    #[arg(long)]
    env_type: Option<EnvironmentType>,

    /// Fail-fast mode (disabled, first-failure, category-failure, critical-failure)
    #[arg(long)]
    fail_fast: Option<FailFastMode>,

    /// Test-name pattern forwarded to runners that support it
    #[arg(long)]
    pattern: Option<String>,

    /// Run against real backing services
    #[arg(long)]
    real_services: bool,

    /// Allow categories to call real LLM providers
    #[arg(long)]
    real_llm: bool,

    /// Directory category commands run from
    #[arg(long)]
    working_dir: Option<PathBuf>,

    /// Write the JSON run report to this path
    #[arg(long)]
    report: Option<PathBuf>,

    /// Never start containers
    #[arg(long)]
    no_docker: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    unitrun_core::init_tracing(cli.json, level_for_verbosity(cli.verbose));

    let code = match cli.command {
        Commands::Run(args) => cmd_run(args, cli.json).await?,
        Commands::Plan { selection } => cmd_plan(&selection)?,
        Commands::Categories { registry, priority } => {
            cmd_categories(registry.as_deref(), priority)?
        }
        Commands::Cleanup { env } => cmd_cleanup(env).await?,
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn load_registry(path: Option<&Path>) -> Result<CategoryRegistry> {
    match path {
        Some(path) => CategoryRegistry::from_path(path)
            .with_context(|| format!("Failed to load category registry {}", path.display())),
        None => CategoryRegistry::builtin().context("Built-in category registry is invalid"),
    }
}

/// File, then `UNITRUN_*` variables, then flags.
fn build_config(selection: &Selection, args: Option<&RunArgs>) -> Result<RunConfig> {
    let mut config = match &selection.config {
        Some(path) => RunConfig::from_path(path)
            .with_context(|| format!("Failed to load run config {}", path.display()))?,
        None => RunConfig::default(),
    };
    config
        .apply_env_overrides()
        .context("Invalid UNITRUN_* environment override")?;

    if let Some(n) = selection.max_parallel {
        config.max_parallel = n;
    }
    if let Some(resume) = &selection.resume_from {
        config.resume_from = Some(resume.clone());
    }
    if let Some(args) = args {
        if let Some(env) = args.env {
            config.environment = env;
        }
        if let Some(env_type) = args.env_type {
            config.env_type = env_type;
        }
        if let Some(mode) = args.fail_fast {
            config.fail_fast.mode = mode;
        }
        if let Some(pattern) = &args.pattern {
            config.pattern = Some(pattern.clone());
        }
        if let Some(dir) = &args.working_dir {
            config.working_dir = Some(dir.clone());
        }
        if let Some(report) = &args.report {
            config.report_path = Some(report.clone());
        }
        config.real_services |= args.real_services;
        config.real_llm |= args.real_llm;
    }
    config.validate()?;
    Ok(config)
}

fn requested_categories(selection: &Selection, registry: &CategoryRegistry) -> Vec<String> {
    if !selection.categories.is_empty() {
        return selection
            .categories
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
    }
    registry
        .iter()
        .filter(|c| !c.optional)
        .map(|c| c.name.clone())
        .collect()
}

/// Run categories and return the process exit code.
async fn cmd_run(args: RunArgs, json: bool) -> Result<i32> {
    let registry = Arc::new(load_registry(args.selection.registry.as_deref())?);
    let config = build_config(&args.selection, Some(&args))?;
    let requested = requested_categories(&args.selection, &registry);

    let manager = Arc::new(ServiceEnvironmentManager::new(
        Arc::new(DockerCli::new()),
        ManagerConfig::for_selector(config.environment),
    ));
    let mut orchestrator = RunOrchestrator::new(registry, Arc::clone(&manager));
    if args.no_docker {
        orchestrator = orchestrator.without_provisioning();
    }

    info!(categories = ?requested, environment = %config.environment, "starting run");
    let result = tokio::select! {
        result = orchestrator.run(&requested, config) => result,
        Ok(()) = tokio::signal::ctrl_c() => {
            warn!("interrupted, releasing environments");
            let released = manager.release_all().await;
            eprintln!("\n✗ Interrupted: released {released} environment(s)");
            return Ok(1);
        }
    };

    match &result {
        Ok(report) if json => println!("{}", serde_json::to_string_pretty(report)?),
        Ok(report) => print!("{}", report.render_summary()),
        Err(e) => print_run_error(e),
    }
    Ok(exit_code_for(&result))
}

fn print_run_error(error: &RunError) {
    match error {
        RunError::ZeroTestsExecuted => {
            eprintln!("✗ Result: FAILED, no tests were executed (the plan is empty)");
        }
        RunError::EnvironmentAcquisition { category, source } => {
            eprintln!("✗ Result: FAILED, tests did not run");
            eprintln!("  Environment required by '{category}' could not be acquired: {source}");
        }
        RunError::Core(e) => {
            eprintln!("✗ Result: FAILED, tests did not run");
            eprintln!("  {e}");
        }
    }
}

fn cmd_plan(selection: &Selection) -> Result<i32> {
    let registry = load_registry(selection.registry.as_deref())?;
    let config = build_config(selection, None)?;
    let requested = requested_categories(selection, &registry);

    let plan = unitrun_core::ExecutionPlanner::new(&registry)
        .create_plan_with(
            &requested,
            &unitrun_core::PlanOptions {
                max_parallel: config.max_parallel,
                resume_from: config.resume_from.clone(),
            },
        )
        .context("Failed to build execution plan")?;

    if plan.is_empty() {
        println!("Plan is empty: nothing would run");
        return Ok(1);
    }
    println!("Plan {} ({} categories)", plan.short_digest(), plan.category_count());
    for phase in &plan.phases {
        let estimate: std::time::Duration = phase
            .categories
            .iter()
            .filter_map(|name| registry.get(name).ok())
            .map(|c| c.estimated_duration)
            .max()
            .unwrap_or_default();
        println!(
            "  Phase {} (~{}s): {}",
            phase.index,
            estimate.as_secs(),
            phase.categories.join(", ")
        );
    }
    if !plan.skipped.is_empty() {
        println!("  Skipped (resume): {}", plan.skipped.join(", "));
    }
    Ok(0)
}

fn cmd_categories(registry: Option<&Path>, priority: Option<Priority>) -> Result<i32> {
    let registry = load_registry(registry)?;
    for category in registry.iter() {
        if priority.is_some_and(|p| p != category.priority) {
            continue;
        }
        let mut flags = Vec::new();
        if category.requires_docker {
            flags.push("docker");
        }
        if category.requires_real_services {
            flags.push("real-services");
        }
        if category.requires_real_llm {
            flags.push("real-llm");
        }
        if !category.parallel_safe {
            flags.push("serial");
        }
        if category.optional {
            flags.push("optional");
        }
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(", "))
        };
        println!(
            "  {:<16} {:<8} {}{}",
            category.name,
            category.priority.as_str(),
            category.description,
            flags
        );
    }

    let stats = registry.statistics();
    println!();
    println!("Total: {} categories", stats.total);
    for (priority, count) in &stats.by_priority {
        println!("  {}: {}", priority.as_str(), count);
    }
    println!(
        "Requiring docker: {}, real services: {}, real LLM: {}",
        stats.requiring_docker, stats.requiring_real_services, stats.requiring_real_llm
    );
    println!("Estimated serial duration: {}s", stats.total_estimated.as_secs());
    Ok(0)
}

async fn cmd_cleanup(env: EnvironmentSelector) -> Result<i32> {
    let manager = ServiceEnvironmentManager::new(
        Arc::new(DockerCli::new()),
        ManagerConfig::for_selector(env),
    );
    let removed = manager
        .cleanup_stale()
        .await
        .context("Failed to remove stale containers")?;
    println!("✓ Removed {removed} stale container(s)");
    Ok(0)
}
