//! Keel CLI entrypoint.
//!
//! Human-facing progress and prompts go to stderr; command results go to
//! stdout so `--output json` can be piped.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use keel_deploy::catalog::AdapterRegistry;
use keel_deploy::cli::{Cli, Commands, DeploymentArg, OutputFormat, OutputFormatter, StateCommands};
use keel_deploy::config::{
    ConfigParser, ConfigValidator, DeploymentFile, StateBackend, ValidationResult, find_config_file,
};
use keel_deploy::engine::{Engine, RunResult};
use keel_deploy::error::{ConfigError, KeelError, Result};
use keel_deploy::model::DeploymentGraph;
use keel_deploy::planner::{CancelSignal, DependencyResolver, DiffEngine, Plan, cancel_pair};
use keel_deploy::provider::ProviderClient;
use keel_deploy::state::{LocalStateStore, S3StateStore, STATE_DIR, StateStore};

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(cli.verbose);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let formatter = OutputFormatter::new(cli.output);
    match runtime.block_on(run(cli, &formatter)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            let code = error_exit_code(&e);
            eprintln!("{}", formatter.format_error(&e.to_string(), i32::from(code)));
            ExitCode::from(code)
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` wins over `--verbose` when set.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Maps an error that aborted a command to a process exit code.
const fn error_exit_code(error: &KeelError) -> u8 {
    if error.is_planning_error() { 2 } else { 1 }
}

/// Main async entry point.
async fn run(cli: Cli, formatter: &OutputFormatter) -> Result<u8> {
    let state_dir = cli.state_dir.as_deref();

    match cli.command {
        Commands::Validate {
            deployment,
            warnings,
        } => cmd_validate(&deployment, warnings, formatter),
        Commands::Plan {
            deployment,
            detailed,
        } => cmd_plan(&deployment, state_dir, detailed, formatter).await,
        Commands::Apply { deployment, yes } => {
            cmd_apply(&deployment, state_dir, yes, formatter).await
        }
        Commands::Destroy { deployment, yes } => {
            cmd_destroy(&deployment, state_dir, yes, formatter).await
        }
        Commands::Drift { deployment } => cmd_drift(&deployment, state_dir, formatter).await,
        Commands::Output { deployment, name } => {
            cmd_output(&deployment, state_dir, name.as_deref(), formatter).await
        }
        Commands::State { command } => cmd_state(command, state_dir, formatter).await,
    }
}

/// Validate the deployment file, its graph and every resource.
fn cmd_validate(
    deployment: &DeploymentArg,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let (path, file, result) = load_deployment(deployment)?;
    info!("Validating deployment file: {}", path.display());

    let graph = DeploymentGraph::from_config(&file)?;
    DependencyResolver::new().resolve(&graph)?;
    DiffEngine::new(&AdapterRegistry::builtin(None)).validate(&graph)?;

    emit(&formatter.format_validation(&file, &result, show_warnings))?;
    Ok(0)
}

/// Show the converging plan.
async fn cmd_plan(
    deployment: &DeploymentArg,
    state_dir: Option<&Path>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let workspace = Workspace::open(deployment, state_dir).await?;
    let registry = AdapterRegistry::builtin(None);

    let plan = workspace.engine(&registry).plan().await?;
    emit(&formatter.format_plan(&plan, detailed))?;
    Ok(0)
}

/// Apply the converging plan.
async fn cmd_apply(
    deployment: &DeploymentArg,
    state_dir: Option<&Path>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let workspace = Workspace::open(deployment, state_dir).await?;
    let client = workspace.provider_client()?;
    let registry = AdapterRegistry::builtin(Some(&client));

    let result = workspace
        .engine(&registry)
        .with_cancel(install_interrupt_handler())
        .apply(|plan| approve(plan, auto_approve, formatter, "Do you want to apply this plan?"))
        .await?;

    finish(&result, formatter)
}

/// Destroy every recorded resource.
async fn cmd_destroy(
    deployment: &DeploymentArg,
    state_dir: Option<&Path>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let workspace = Workspace::open(deployment, state_dir).await?;
    let client = workspace.provider_client()?;
    let registry = AdapterRegistry::builtin(Some(&client));

    let result = workspace
        .engine(&registry)
        .with_cancel(install_interrupt_handler())
        .destroy(|plan| {
            approve(
                plan,
                auto_approve,
                formatter,
                "This deletes every resource listed above. Continue?",
            )
        })
        .await?;

    finish(&result, formatter)
}

/// Report drift between the deployment file and recorded state.
async fn cmd_drift(
    deployment: &DeploymentArg,
    state_dir: Option<&Path>,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let workspace = Workspace::open(deployment, state_dir).await?;
    let registry = AdapterRegistry::builtin(None);

    let report = workspace.engine(&registry).check_drift().await?;
    emit(&formatter.format_drift(&report))?;
    Ok(0)
}

/// Print recorded stack outputs.
async fn cmd_output(
    deployment: &DeploymentArg,
    state_dir: Option<&Path>,
    name: Option<&str>,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let workspace = Workspace::open(deployment, state_dir).await?;
    let snapshot = workspace.store.load().await?;

    match name {
        Some(name) => {
            let value = snapshot
                .output(name)
                .ok_or_else(|| KeelError::internal(format!("No output named '{name}' is recorded")))?;
            let rendered = match (formatter.format(), value) {
                (OutputFormat::Text, serde_json::Value::String(s)) => s.clone(),
                _ => value.to_string(),
            };
            emit(&format!("{rendered}\n"))?;
        }
        None => emit(&formatter.format_outputs(&snapshot.outputs))?,
    }
    Ok(0)
}

/// State management commands.
async fn cmd_state(
    command: StateCommands,
    state_dir: Option<&Path>,
    formatter: &OutputFormatter,
) -> Result<u8> {
    match command {
        StateCommands::Show { deployment } => {
            let workspace = Workspace::open(&deployment, state_dir).await?;
            let snapshot = workspace.store.load().await?;
            let lock = workspace.store.get_lock_info().await?;
            emit(&formatter.format_state(&snapshot, lock.as_ref()))?;
        }
        StateCommands::Unlock {
            deployment,
            lock_id,
            force,
        } => {
            let workspace = Workspace::open(&deployment, state_dir).await?;
            if force {
                if workspace.store.force_unlock().await? {
                    eprintln!("State forcefully unlocked.");
                } else {
                    eprintln!("State was not locked.");
                }
            } else if let Some(id) = lock_id {
                workspace.store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                return Err(KeelError::internal("Please provide --lock-id or use --force"));
            }
        }
    }
    Ok(0)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// A loaded deployment with its state backend.
struct Workspace {
    file: DeploymentFile,
    graph: DeploymentGraph,
    store: Box<dyn StateStore>,
}

impl Workspace {
    /// Loads, validates and builds the graph, then opens the state store.
    async fn open(deployment: &DeploymentArg, state_dir: Option<&Path>) -> Result<Self> {
        let (path, file, _) = load_deployment(deployment)?;
        let graph = DeploymentGraph::from_config(&file)?;
        let store = open_state_store(&file, &path, state_dir).await?;
        debug!("Using {} state backend", store.backend_type());

        Ok(Self { file, graph, store })
    }

    fn engine<'a>(&'a self, registry: &'a AdapterRegistry) -> Engine<'a> {
        Engine::new(&self.graph, registry, self.store.as_ref(), &self.file.execution)
    }

    /// Creates the provider client; only commands that touch resources need it.
    fn provider_client(&self) -> Result<ProviderClient> {
        ProviderClient::from_config(&self.file.provider, ConfigParser::provider_token())
    }
}

/// Resolves, parses and validates the deployment file.
fn load_deployment(deployment: &DeploymentArg) -> Result<(PathBuf, DeploymentFile, ValidationResult)> {
    let path = match &deployment.file {
        Some(path) => path.clone(),
        None => find_config_file(std::env::current_dir()?)?,
    };
    debug!("Loading deployment file from: {}", path.display());

    let parser = ConfigParser::new().with_base_path(base_dir(&path));
    let file = parser.load_with_env(&path)?;
    let result = ConfigValidator::new().validate(&file)?;

    Ok((path, file, result))
}

/// Creates the state store named by the `state` section.
async fn open_state_store(
    file: &DeploymentFile,
    path: &Path,
    state_dir: Option<&Path>,
) -> Result<Box<dyn StateStore>> {
    let deployment = &file.deployment;

    let store: Box<dyn StateStore> = match file.state.backend {
        StateBackend::Local => {
            let dir = state_dir.map_or_else(
                || {
                    file.state
                        .path
                        .as_ref()
                        .map_or_else(|| base_dir(path).join(STATE_DIR), PathBuf::from)
                },
                Path::to_path_buf,
            );
            Box::new(LocalStateStore::new(
                dir,
                &deployment.name,
                &deployment.environment,
            ))
        }
        StateBackend::S3 => {
            let bucket = file.state.bucket.as_deref().ok_or_else(|| {
                KeelError::Config(ConfigError::validation(
                    "S3 bucket not configured",
                    "state.bucket",
                ))
            })?;
            Box::new(
                S3StateStore::new(
                    bucket,
                    file.state.prefix.as_deref(),
                    file.state.region.as_deref(),
                    &deployment.name,
                    &deployment.environment,
                )
                .await,
            )
        }
    };

    Ok(store)
}

fn base_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Cancels the running plan on the first Ctrl-C.
fn install_interrupt_handler() -> CancelSignal {
    let (handle, signal) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling after in-flight actions finish");
            handle.cancel();
        }
    });
    signal
}

/// Shows the plan and asks for confirmation unless `auto_approve` is set.
fn approve(plan: &Plan, auto_approve: bool, formatter: &OutputFormatter, question: &str) -> bool {
    if auto_approve {
        return true;
    }

    eprintln!("{}", formatter.format_plan(plan, true));
    eprint!("{question} [y/N]: ");
    if std::io::stderr().flush().is_err() {
        return false;
    }

    let mut input = String::new();
    if std::io::stdin().read_line(&mut input).is_err() {
        return false;
    }
    input.trim().eq_ignore_ascii_case("y")
}

/// Prints the run result and picks the exit code.
fn finish(result: &RunResult, formatter: &OutputFormatter) -> Result<u8> {
    let Some(report) = &result.report else {
        eprintln!("{} cancelled.", capitalize(&result.plan.operation.to_string()));
        return Ok(0);
    };

    if result.plan.has_changes() {
        emit(&formatter.format_report(report))?;
    } else {
        emit(&formatter.format_plan(&result.plan, false))?;
    }

    Ok(u8::try_from(report.exit_code()).unwrap_or(1))
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}

/// Writes a command result to stdout.
fn emit(text: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    if !text.ends_with('\n') {
        stdout.write_all(b"\n")?;
    }
    stdout.flush()?;
    Ok(())
}
