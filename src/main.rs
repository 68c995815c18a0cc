use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, warn};

use fanout::scheduler::{self, RunOptions, DEFAULT_CONCURRENCY};
use fanout::types::ResultSet;
use fanout::{expand, logging};

/// fanout — run every expansion of a command template in parallel and print the results as JSON.
///
/// Any argument written as a list literal, e.g. `[1,2,3]` or `('a','b')`, is expanded; several
/// lists give their cartesian product.
#[derive(Debug, Clone, Parser)]
#[command(name = "fanout", version, long_about = None)]
struct Cli {
    /// Number of commands to execute at the same time.
    #[arg(short = 's', long = "semaphore", default_value_t = DEFAULT_CONCURRENCY)]
    semaphore: usize,

    /// Only keep output for commands exiting with this return code.
    #[arg(short = 'r', long = "returncode", allow_negative_numbers = true)]
    returncode: Option<i32>,

    /// Also write the JSON results to this path.
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Do not draw the progress line.
    #[arg(short = 'q', long, default_value_t = false)]
    quiet: bool,

    /// Debug logging on stderr.
    #[arg(short = 'v', long, default_value_t = false)]
    verbose: bool,

    /// Command template, e.g. `ping -c 1 "['10.0.0.1','10.0.0.2']"`.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let commands = expand::expand(&cli.command);
    debug!(
        template = ?cli.command,
        expanded = commands.len(),
        concurrency = cli.semaphore,
        returncode = ?cli.returncode,
        "configuration"
    );

    let opts = RunOptions {
        concurrency: cli.semaphore,
        returncode: cli.returncode,
        show_progress: !cli.quiet,
    };
    let report = scheduler::run_commands(commands, &opts).await?;
    if report.interrupted {
        warn!(
            finished = report.progress.finished,
            total = report.progress.total,
            "interrupted, printing partial results"
        );
    }

    println!("{}", serde_json::to_string_pretty(&report.results)?);

    if let Some(path) = cli.output.as_deref() {
        write_results_json(path, &report.results)
            .with_context(|| format!("failed to write JSON to {}", path.display()))?;
    }
    Ok(())
}

fn write_results_json(path: &Path, results: &ResultSet) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, results)?;
    Ok(())
}
