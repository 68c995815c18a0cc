use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, info, warn};

use fanout::logging;
use fanout::telemetry::transfer::{
    self, TransferOptions, DEFAULT_SSH_PORT, DEFAULT_TRANSFER_CONCURRENCY,
};

/// fanout-scp — parallel scp with live per-server byte counters and bitrates.
///
/// Takes the same operands as scp; list literals such as `"['web1','web2']":/tmp` are expanded.
#[derive(Debug, Clone, Parser)]
#[command(name = "fanout-scp", version, long_about = None)]
struct Cli {
    /// Number of scp commands to execute at the same time.
    #[arg(short = 's', long = "semaphore", default_value_t = DEFAULT_TRANSFER_CONCURRENCY)]
    semaphore: usize,

    /// Port to connect to on the remote hosts; also the port watched for telemetry.
    #[arg(short = 'P', long, default_value_t = DEFAULT_SSH_PORT)]
    port: u16,

    /// Telemetry refresh interval in milliseconds.
    #[arg(short = 'i', long = "interval-ms", default_value_t = 3000)]
    interval_ms: u64,

    /// Debug logging on stderr.
    #[arg(short = 'v', long, default_value_t = false)]
    verbose: bool,

    /// scp operands: `source... destination`.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    debug!(?cli, "configuration");

    let opts = TransferOptions {
        concurrency: cli.semaphore,
        port: cli.port,
        interval: Duration::from_millis(cli.interval_ms.max(1)),
        ..Default::default()
    };
    let report = transfer::run_transfers(&cli.command, &opts).await?;

    let p = report.run.progress;
    if report.run.interrupted {
        warn!(finished = p.finished, total = p.total, "interrupted");
    }
    info!(status = %p.status_line(), "transfers done");
    Ok(())
}
