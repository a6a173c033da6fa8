//! CLI argument definitions and entry point for benchrun.

use std::path::PathBuf;

use clap::Parser;

use crate::backend::context::timestamp;
use crate::backend::{DefaultBackendFactory, SetupMode};
use crate::config::STAMP_ENV;
use crate::orchestrator::{Invocation, Orchestrator, Outcome};
use crate::results::RunResults;

/// Name used for log files and nested invocations.
pub const SCRIPT_NAME: &str = "benchrun";

#[derive(Parser, Debug)]
#[command(name = "benchrun")]
#[command(about = "Set up a framework and run it against a benchmark, locally, in Docker or on AWS")]
#[command(version)]
pub struct Cli {
    /// Framework to evaluate, as named in a frameworks definition file.
    pub framework: String,

    /// Benchmark name, or path to a benchmark descriptor file.
    #[arg(default_value = "test")]
    pub benchmark: String,

    /// Where the tasks run: local, docker or aws.
    #[arg(short, long, default_value = "local")]
    pub mode: String,

    /// Run a single task of the benchmark.
    #[arg(short, long)]
    pub task: Option<String>,

    /// Folds of the task to run (all folds if omitted or empty). Requires --task.
    #[arg(short, long, num_args = 0..)]
    pub fold: Vec<u32>,

    /// Input directory for datasets.
    #[arg(short, long)]
    pub indir: Option<PathBuf>,

    /// Output directory for logs, predictions and scores.
    #[arg(short, long)]
    pub outdir: Option<PathBuf>,

    /// User directory with custom configuration and framework definitions.
    #[arg(short, long)]
    pub userdir: Option<PathBuf>,

    /// Number of units run concurrently.
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    pub parallel: u64,

    /// Setup policy for the execution environment.
    #[arg(short, long, value_enum, default_value_t = SetupMode::Auto)]
    pub setup: SetupMode,

    /// AWS region for the aws mode.
    #[arg(short, long)]
    pub region: Option<String>,

    /// Log level for the console (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

impl Cli {
    /// Builds the invocation described by the arguments.
    pub fn invocation(&self, stamp: &str) -> Invocation {
        let mut invocation = Invocation::new(&self.framework, &self.benchmark)
            .with_mode(&self.mode)
            .with_folds(self.fold.clone())
            .with_parallel_jobs(usize::try_from(self.parallel).unwrap_or(usize::MAX))
            .with_setup(self.setup)
            .with_script(SCRIPT_NAME)
            .with_stamp(stamp);
        if let Some(task) = &self.task {
            invocation = invocation.with_task(task, self.fold.clone());
        }
        if let Some(dir) = &self.indir {
            invocation = invocation.with_input_dir(dir);
        }
        if let Some(dir) = &self.outdir {
            invocation = invocation.with_output_dir(dir);
        }
        if let Some(dir) = &self.userdir {
            invocation = invocation.with_user_dir(dir);
        }
        if let Some(region) = &self.region {
            invocation = invocation.with_region(region);
        }
        invocation
    }
}

/// Parse CLI arguments without running.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Timestamp shared by the log files and score files of this invocation.
///
/// Nested invocations inherit their parent's stamp through the environment.
pub fn invocation_stamp() -> String {
    std::env::var(STAMP_ENV)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(timestamp)
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = parse_cli();
    run_with_cli(cli, &invocation_stamp()).await
}

/// Run the CLI with already-parsed arguments.
pub async fn run_with_cli(cli: Cli, stamp: &str) -> anyhow::Result<()> {
    let invocation = cli.invocation(stamp);
    match Orchestrator::execute(invocation, &DefaultBackendFactory).await? {
        Outcome::SetupOnly => {
            println!("Setup of {} complete", cli.framework);
        }
        Outcome::Completed(results) => print_summary(&cli, &results),
    }
    Ok(())
}

fn print_summary(cli: &Cli, results: &RunResults) {
    println!("\n=== {} on {} ===", cli.framework, cli.benchmark);
    for result in results.iter() {
        let score = result
            .scores
            .as_ref()
            .and_then(|s| s.score)
            .map(|s| format!("{s:.6}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} fold {:<3} {:<8} {:>12}",
            result.task, result.fold, result.status, score
        );
        if let Some(err) = &result.error {
            println!("    error: {err}");
        }
    }
    println!(
        "Succeeded: {}/{}",
        results.succeeded(),
        results.len()
    );
}
