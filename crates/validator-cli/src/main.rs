//! CLI binary for resolving, cooking and running validation pipelines.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};

use validator_core::{cook, resolve_pipeline, shared_registry};
use validator_mass::{
    Executor, InProcessExecutor, JobSpec, MassManager, MassOptions, MassQueue, ProcessExecutor,
    ProcessExecutorConfig, UpdateSchemaRequest,
};
use validator_types::{ExecutorKind, RunResult};

#[derive(Parser)]
#[command(name = "validator", version, about = "Schema-driven mass validation runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve, cook and run one or more pipeline schemas
    Run {
        /// Pipeline schema files (JSON)
        #[arg(required = true)]
        schemas: Vec<PathBuf>,

        /// Executor: 0 = in-process, 1 = one process per job
        #[arg(short, long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
        executor: u8,

        /// Print every job schema with its result when done
        #[arg(short, long)]
        print_result: bool,

        /// No progress output
        #[arg(short, long)]
        silent: bool,

        /// Global timeout in seconds
        #[arg(short, long, value_parser = parse_timeout)]
        timeout: Option<Duration>,

        /// Queue id the jobs report to
        #[arg(short, long)]
        queue_id: Option<String>,

        /// Maximum number of jobs running at once
        #[arg(long)]
        max_concurrent: Option<usize>,
    },

    /// Run one cooked schema in this process (used by the process executor)
    Single {
        /// Cooked pipeline schema file (JSON)
        #[arg(long)]
        schema: PathBuf,

        /// Queue to report the result to
        #[arg(long, requires = "job_id")]
        queue_id: Option<String>,

        /// Job id within the queue
        #[arg(long)]
        job_id: Option<String>,

        /// Print per-check results to stderr
        #[arg(short, long)]
        print_result: bool,
    },

    /// Resolve and cook schemas without running them
    Validate {
        /// Pipeline schema files (JSON)
        #[arg(required = true)]
        schemas: Vec<PathBuf>,
    },

    /// List registered plugins
    Plugins,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries results.
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let passed = match cli.command {
        Commands::Run {
            schemas,
            executor,
            print_result,
            silent,
            timeout,
            queue_id,
            max_concurrent,
        } => {
            let options = MassOptions {
                timeout,
                queue_id,
                ..MassOptions::default()
            };
            let kind = ExecutorKind::try_from(executor)?;
            cmd_run(&schemas, kind, options, max_concurrent, print_result, silent).await?
        }
        Commands::Single {
            schema,
            queue_id,
            job_id,
            print_result,
        } => cmd_single(&schema, queue_id.as_deref(), job_id.as_deref(), print_result).await?,
        Commands::Validate { schemas } => cmd_validate(&schemas).await?,
        Commands::Plugins => {
            cmd_plugins();
            true
        }
    };

    if !passed {
        std::process::exit(1);
    }
    Ok(())
}

/// Seconds as a non-negative, finite number.
fn parse_timeout(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .parse()
        .map_err(|e| format!("'{}' is not a number: {}", value, e))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid timeout '{}': {}", value, e))
}

fn read_schema(path: &Path) -> anyhow::Result<serde_json::Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read schema {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid JSON in {}", path.display()))
}

fn print_checks(result: &RunResult) {
    for check in &result.per_check {
        let mark = if check.passed { "PASS" } else { "FAIL" };
        eprintln!("  [{}] {}: {}", mark, check.name, check.message);
    }
}

async fn cmd_run(
    schemas: &[PathBuf],
    kind: ExecutorKind,
    options: MassOptions,
    max_concurrent: Option<usize>,
    print_result: bool,
    silent: bool,
) -> anyhow::Result<bool> {
    let values = schemas
        .iter()
        .map(|p| read_schema(p))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let registry = shared_registry();
    let queue_id = options.queue_id.clone();
    let grace_period = options.grace_period;

    let mut manager = MassManager::from_schemas(&registry, &values, kind, options).await?;
    if let Some(max) = max_concurrent {
        let process = ProcessExecutor::new(ProcessExecutorConfig {
            grace_period,
            max_concurrent: Some(max),
            ..ProcessExecutorConfig::default()
        })
        .with_queue(MassQueue::global());
        manager = manager
            .with_executor(Arc::new(InProcessExecutor::with_max_concurrent(max)))
            .with_executor(Arc::new(process));
    }
    let manager = Arc::new(manager);
    if let Some(queue_id) = &queue_id {
        MassQueue::global().enqueue(queue_id, manager.clone());
    }

    if !silent {
        println!("Running {} job(s) ({} executor)", manager.len(), kind);
    }
    let _progress = (!silent).then(|| {
        manager.subscribe_progress(|p| {
            println!("[{}/{}] {}", p.index + 1, p.total, p.message);
        })
    });

    let summary = manager.run().await?;
    if let Some(queue_id) = &queue_id {
        MassQueue::global().remove_manager(queue_id, manager.id());
    }

    if print_result {
        for schema in manager.schemas() {
            println!("{}", serde_json::to_string_pretty(&schema)?);
        }
    }
    if !silent {
        if summary.passed {
            println!("\nAll {} job(s) passed", manager.len());
        } else {
            println!(
                "\n{} of {} job(s) failed{}",
                summary.failed_job_ids.len(),
                manager.len(),
                if summary.timed_out { " (timed out)" } else { "" }
            );
            for (id, message) in summary.failed_job_ids.iter().zip(&summary.messages) {
                println!("  {}: {}", id, message);
            }
        }
    }
    Ok(summary.passed)
}

async fn cmd_single(
    schema: &Path,
    queue_id: Option<&str>,
    job_id: Option<&str>,
    print_result: bool,
) -> anyhow::Result<bool> {
    let value = read_schema(schema)?;
    let registry = shared_registry();
    let pipeline = resolve_pipeline(&registry, &value)?;
    let job_id = job_id.map(String::from).unwrap_or_else(|| pipeline.uuid.clone());

    let executor = InProcessExecutor::new();
    let handle = executor.submit(JobSpec {
        job_id: job_id.clone(),
        pipeline,
        queue_id: queue_id.map(String::from),
    });
    let result = executor.await_result(handle).await;

    if print_result {
        eprintln!("{}: {}", job_id, result.message);
        print_checks(&result);
    }
    if let Some(queue_id) = queue_id {
        let update = UpdateSchemaRequest::new(queue_id, &job_id, &result);
        println!("{}", serde_json::to_string(&update)?);
    }
    // Must stay the last stdout line.
    println!("{}", serde_json::to_string(&result)?);
    Ok(result.passed)
}

async fn cmd_validate(schemas: &[PathBuf]) -> anyhow::Result<bool> {
    let registry = shared_registry();
    let mut all_valid = true;

    for path in schemas {
        let value = read_schema(path)?;
        let cooked = match resolve_pipeline(&registry, &value) {
            Ok(model) => cook(&registry, &model).await,
            Err(e) => Err(e),
        };
        match cooked {
            Ok(models) => {
                println!("{}: valid, {} job(s)", path.display(), models.len());
                for model in &models {
                    println!("  {} ({})", model.name, model.uuid);
                }
            }
            Err(e) => {
                all_valid = false;
                let at = e.field_path().unwrap_or("-");
                println!("{}: invalid at {}: {}", path.display(), at, e);
            }
        }
    }
    Ok(all_valid)
}

fn cmd_plugins() {
    let registry = shared_registry();
    for factory in registry.factories() {
        println!("{:<14} {:<9} {}", factory.name, factory.kind.to_string(), factory.tooltip);
    }
}
