use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use patchbench::builder::CacheLevel;
use patchbench::collect::{self, CollectOptions};
use patchbench::instance::{self, Instance};
use patchbench::schedule::{self, EvalOptions};

#[derive(Parser, Debug)]
#[command(name = "patchbench")]
#[command(about = "Judge candidate patches against task instances in layered container environments.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate predictions (or oracle patches) against a dataset.
    Eval(EvalArgs),

    /// Populate FAIL_TO_PASS / PASS_TO_PASS labels with two-pass runs.
    Collect(CollectArgs),

    /// List instance ids in a dataset.
    List(ListArgs),
}

#[derive(Debug, Args)]
struct EvalArgs {
    /// Dataset file (JSON array or JSON-lines of instances).
    #[arg(long, value_name = "PATH")]
    dataset: PathBuf,

    /// Predictions file (JSON map or JSON-lines). Required unless --oracle.
    #[arg(long, value_name = "PATH", required_unless_present = "oracle", conflicts_with = "oracle")]
    predictions: Option<PathBuf>,

    /// Evaluate each instance's own gold patch instead of predictions.
    #[arg(long)]
    oracle: bool,

    /// Output namespace; results land under <results-root>/<run-id>/.
    #[arg(long, value_name = "ID")]
    run_id: String,

    #[arg(long, value_name = "DIR", default_value = "results")]
    results_root: PathBuf,

    #[arg(long, value_name = "N", default_value_t = 8)]
    max_workers: usize,

    /// Per-instance test timeout in seconds (default: profile timeout).
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Only evaluate these instance ids.
    #[arg(long = "instance-id", value_name = "ID")]
    instance_ids: Vec<String>,

    /// Redo completed instances and rebuild cached images.
    #[arg(long)]
    force_rebuild: bool,

    /// Highest image layer kept after the run.
    #[arg(long, value_enum, default_value_t = CacheLevel::Env)]
    cache_level: CacheLevel,

    /// Image-registry prefix for built tags; may be empty.
    #[arg(long, value_name = "PREFIX", default_value = "")]
    namespace: String,

    /// Seconds between graceful stop and force-kill on timeout/cancel.
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    grace_seconds: u64,

    #[arg(long, value_name = "N", default_value_t = 4)]
    max_concurrent_builds: usize,

    /// Wall-clock bound for a single image build.
    #[arg(long, value_name = "SECS", default_value_t = 3600)]
    build_timeout: u64,

    /// Container engine binary (any docker-compatible CLI).
    #[arg(long, value_name = "BIN", default_value = "docker")]
    engine_bin: String,
}

#[derive(Debug, Args)]
struct CollectArgs {
    /// Dataset file (JSON array or JSON-lines of instances).
    #[arg(long, value_name = "PATH")]
    dataset: PathBuf,

    /// Output dataset with populated expected-test sets.
    #[arg(long, value_name = "PATH")]
    out: PathBuf,

    #[arg(long, value_name = "ID", default_value = "collect")]
    run_id: String,

    #[arg(long, value_name = "DIR", default_value = "results")]
    results_root: PathBuf,

    #[arg(long, value_name = "N", default_value_t = 8)]
    max_workers: usize,

    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Only collect these instance ids.
    #[arg(long = "instance-id", value_name = "ID")]
    instance_ids: Vec<String>,

    /// Re-collect instances that already carry expected-test sets.
    #[arg(long)]
    force_rebuild: bool,

    #[arg(long, value_name = "PREFIX", default_value = "")]
    namespace: String,

    #[arg(long, value_name = "SECS", default_value_t = 10)]
    grace_seconds: u64,

    #[arg(long, value_name = "N", default_value_t = 4)]
    max_concurrent_builds: usize,

    #[arg(long, value_name = "SECS", default_value_t = 3600)]
    build_timeout: u64,

    #[arg(long, value_name = "BIN", default_value = "docker")]
    engine_bin: String,
}

#[derive(Debug, Args)]
struct ListArgs {
    /// Dataset file (JSON array or JSON-lines of instances).
    #[arg(long, value_name = "PATH")]
    dataset: PathBuf,

    /// Filter instance ids by substring.
    #[arg(long, value_name = "SUBSTR")]
    filter: Option<String>,

    /// Treat --filter as an exact id match.
    #[arg(long)]
    exact: bool,
}

fn main() -> std::process::ExitCode {
    init_logging();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            std::process::ExitCode::from(1)
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<std::process::ExitCode> {
    match cli.command {
        Command::Eval(args) => cmd_eval(args),
        Command::Collect(args) => cmd_collect(args),
        Command::List(args) => cmd_list(args),
    }
}

fn cmd_eval(args: EvalArgs) -> Result<std::process::ExitCode> {
    let (dataset, predictions) = match load_eval_inputs(&args) {
        Ok(v) => v,
        Err(err) => {
            eprintln!("{err:#}");
            return Ok(std::process::ExitCode::from(2));
        }
    };

    schedule::install_cancel_handler();

    let opts = EvalOptions {
        run_id: args.run_id,
        results_root: args.results_root,
        max_workers: args.max_workers.max(1),
        timeout_seconds: args.timeout,
        force_rebuild: args.force_rebuild,
        cache_level: args.cache_level,
        namespace: args.namespace,
        grace_seconds: args.grace_seconds,
        max_concurrent_builds: args.max_concurrent_builds.max(1),
        build_timeout_seconds: args.build_timeout,
        engine_bin: args.engine_bin,
        oracle: args.oracle,
        instance_ids: args.instance_ids,
    };

    let report = schedule::run_eval(&opts, dataset, predictions)?;

    let t = &report.summary.totals;
    println!(
        "run_id={} instances={} resolved={} partially_resolved={} unresolved={} build_error={} run_error={} timeout={} parse_error={}",
        report.summary.run_id,
        t.instances,
        t.resolved,
        t.partially_resolved,
        t.unresolved,
        t.build_error,
        t.run_error,
        t.timeout,
        t.parse_error,
    );

    if report.cancelled {
        return Ok(std::process::ExitCode::from(1));
    }
    Ok(std::process::ExitCode::SUCCESS)
}

fn load_eval_inputs(
    args: &EvalArgs,
) -> Result<(
    Vec<Instance>,
    Option<std::collections::BTreeMap<String, instance::Prediction>>,
)> {
    let dataset = instance::load_dataset(&args.dataset)
        .with_context(|| format!("load dataset {}", args.dataset.display()))?;
    let predictions = match (&args.predictions, args.oracle) {
        (_, true) => None,
        (Some(path), false) => Some(
            instance::load_predictions(path)
                .with_context(|| format!("load predictions {}", path.display()))?,
        ),
        (None, false) => anyhow::bail!("predictions are required unless --oracle"),
    };
    Ok((dataset, predictions))
}

fn cmd_collect(args: CollectArgs) -> Result<std::process::ExitCode> {
    let dataset = match instance::load_dataset(&args.dataset) {
        Ok(v) => v,
        Err(err) => {
            eprintln!("{err:#}");
            return Ok(std::process::ExitCode::from(2));
        }
    };

    schedule::install_cancel_handler();

    let opts = CollectOptions {
        run_id: args.run_id,
        results_root: args.results_root,
        out_path: args.out,
        max_workers: args.max_workers.max(1),
        timeout_seconds: args.timeout,
        force_rebuild: args.force_rebuild,
        namespace: args.namespace,
        grace_seconds: args.grace_seconds,
        max_concurrent_builds: args.max_concurrent_builds.max(1),
        build_timeout_seconds: args.build_timeout,
        engine_bin: args.engine_bin,
        instance_ids: args.instance_ids,
    };

    let report = collect::run_collect(&opts, dataset)?;
    println!(
        "run_id={} collected={} skipped={} errors={}",
        report.run_id, report.collected, report.skipped, report.errors
    );

    if schedule::cancel_requested() {
        return Ok(std::process::ExitCode::from(1));
    }
    Ok(std::process::ExitCode::SUCCESS)
}

fn cmd_list(args: ListArgs) -> Result<std::process::ExitCode> {
    let dataset = match instance::load_dataset(&args.dataset) {
        Ok(v) => v,
        Err(err) => {
            eprintln!("{err:#}");
            return Ok(std::process::ExitCode::from(2));
        }
    };

    let mut ids: Vec<String> = dataset
        .into_iter()
        .map(|i| i.instance_id)
        .filter(|id| match &args.filter {
            Some(f) if args.exact => id == f,
            Some(f) => id.contains(f.as_str()),
            None => true,
        })
        .collect();
    ids.sort();

    for id in ids {
        println!("{id}");
    }
    Ok(std::process::ExitCode::SUCCESS)
}
