//! fixbench CLI — run evaluations against a solver endpoint.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use fixbench::config::{EvalConfig, EvalRequest};
use fixbench::driver::EvalDriver;
use fixbench::registry::TaskRegistry;
use fixbench::sandbox::docker::DockerProvider;
use fixbench::solver::{GoldPatchChannel, HttpSolverChannel};

#[derive(Parser)]
#[command(name = "fixbench")]
#[command(about = "Evaluation harness for autonomous code-repair agents", long_about = None)]
#[command(version)]
struct Cli {
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an evaluation described by a request file
    Run {
        /// Task corpus (JSON array of task records)
        #[arg(short, long)]
        tasks: PathBuf,

        /// Evaluation request file ({"participants": {...}, "config": {...}})
        #[arg(short, long)]
        request: PathBuf,

        /// Where to write the structured result artifact
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List tasks in a corpus, with optional filters
    Tasks {
        /// Task corpus (JSON array of task records)
        #[arg(short, long)]
        tasks: PathBuf,

        /// Filter by repository
        #[arg(long)]
        repo: Option<String>,

        /// Filter by difficulty tag
        #[arg(long)]
        difficulty: Option<String>,
    },

    /// Validate an evaluation request file without running anything
    Validate {
        /// Evaluation request file ({"participants": {...}, "config": {...}})
        #[arg(short, long)]
        request: PathBuf,
    },

    /// Evaluate a task against its own reference patch (pipeline check)
    SelfTest {
        /// Task corpus (JSON array of task records)
        #[arg(short, long)]
        tasks: PathBuf,

        /// Task to self-test
        #[arg(short, long)]
        instance_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            tasks,
            request,
            output,
        } => run_evaluation(&tasks, &request, output.as_deref()).await,
        Commands::Tasks {
            tasks,
            repo,
            difficulty,
        } => list_tasks(&tasks, repo.as_deref(), difficulty.as_deref()),
        Commands::Validate { request } => validate_request(&request),
        Commands::SelfTest { tasks, instance_id } => self_test(&tasks, &instance_id).await,
    }
}

fn validate_request(request_path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(request_path)
        .with_context(|| format!("Failed to read request from {}", request_path.display()))?;
    let request = EvalRequest::parse(&text)?;
    println!(
        "Request is valid: solver={} max_turns={} max_attempts={} task_timeout={}s",
        request.solver_url(),
        request.config.max_turns,
        request.config.max_attempts,
        request.config.task_timeout
    );
    Ok(())
}

async fn run_evaluation(
    tasks_path: &Path,
    request_path: &Path,
    output: Option<&Path>,
) -> Result<()> {
    let request_text = std::fs::read_to_string(request_path)
        .with_context(|| format!("Failed to read request from {}", request_path.display()))?;
    let request = EvalRequest::parse(&request_text)?;

    let registry = TaskRegistry::from_json_file(tasks_path)
        .with_context(|| format!("Failed to load task corpus from {}", tasks_path.display()))?;

    info!(solver = %request.solver_url(), "starting evaluation");
    let provider = DockerProvider::new()?;
    let channel = HttpSolverChannel::new(request.solver_url())?;
    let driver = EvalDriver::new(&provider, request.config.clone());

    let report = driver.run(&registry, &channel).await;
    print!("{}", report.render_summary());

    if let Some(path) = output {
        report
            .write_artifact(path)
            .with_context(|| format!("Failed to write artifact to {}", path.display()))?;
        info!(path = %path.display(), "artifact written");
    }

    Ok(())
}

fn list_tasks(tasks_path: &Path, repo: Option<&str>, difficulty: Option<&str>) -> Result<()> {
    let registry = TaskRegistry::from_json_file(tasks_path)?;

    for task in registry.iter_all() {
        if repo.is_some_and(|r| task.repo != r) {
            continue;
        }
        if difficulty.is_some_and(|d| task.difficulty != d) {
            continue;
        }
        println!(
            "{}  {}  version={}  f2p={}  p2p={}  difficulty={}",
            task.instance_id,
            task.repo,
            task.version,
            task.fail_to_pass.len(),
            task.pass_to_pass.len(),
            task.difficulty
        );
    }
    Ok(())
}

/// Drive one task through the full pipeline with a channel that replies
/// with the task's own reference patch. A healthy setup scores 1.0.
async fn self_test(tasks_path: &Path, instance_id: &str) -> Result<()> {
    let registry = TaskRegistry::from_json_file(tasks_path)?;
    let task = registry
        .get_by_id(instance_id)
        .with_context(|| format!("No task with instance_id {instance_id}"))?
        .clone();

    let provider = DockerProvider::new()?;
    let channel = GoldPatchChannel::for_task(&task);
    let config = EvalConfig {
        instance_id: Some(instance_id.to_string()),
        ..EvalConfig::default()
    };
    let driver = EvalDriver::new(&provider, config);

    let report = driver.run_tasks(&[&task], &channel).await;
    print!("{}", report.render_summary());

    if report.resolved == 1 {
        info!("self-test resolved: sandbox, validator and scoring are healthy");
        Ok(())
    } else {
        anyhow::bail!("self-test did not resolve; see attempt records above")
    }
}
