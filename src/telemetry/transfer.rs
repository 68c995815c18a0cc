//! `scp` batch runner with the telemetry overlay wired in.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use colored::Colorize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::diag::{ConnectionSource, SockDiag};
use super::monitor::{TelemetryMonitor, TelemetryTable, TransferTracker, DEFAULT_POLL_INTERVAL};
use crate::error::DiagError;
use crate::expand;
use crate::scheduler::{self, CompletionHook, RunHooks, RunOptions, RunReport};
use crate::types::{ConcreteCommand, ExecutionResult};

/// Transfers are I/O heavy, so fewer run at once than in generic fan-out.
pub const DEFAULT_TRANSFER_CONCURRENCY: usize = 10;
pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub concurrency: usize,
    pub port: u16,
    pub interval: Duration,
    pub show_progress: bool,
    pub show_telemetry: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_TRANSFER_CONCURRENCY,
            port: DEFAULT_SSH_PORT,
            interval: DEFAULT_POLL_INTERVAL,
            show_progress: true,
            show_telemetry: true,
        }
    }
}

#[derive(Debug)]
pub struct TransferReport {
    pub run: RunReport,
    /// `None` when the diagnostic channel was unavailable from the start.
    pub telemetry: Option<TelemetryTable>,
}

/// Prefix user tokens with `scp -P <port>`.
pub fn transfer_template(tokens: &[String], port: u16) -> Vec<String> {
    let mut template = vec!["scp".to_string(), "-P".to_string(), port.to_string()];
    template.extend_from_slice(tokens);
    template
}

/// Host part of an `scp` remote operand: `[user@]host:path` or `scp://[user@]host[:port][/path]`.
///
/// Local paths (no colon, or a slash before the first colon) yield `None`.
pub fn destination_host(token: &str) -> Option<&str> {
    let host = if let Some(rest) = token.strip_prefix("scp://") {
        let authority = rest.split('/').next().unwrap_or(rest);
        strip_user(authority).split(':').next()?
    } else {
        let (head, _) = token.split_once(':')?;
        if head.contains('/') {
            return None;
        }
        strip_user(head)
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    (!host.is_empty()).then_some(host)
}

fn strip_user(s: &str) -> &str {
    s.rsplit_once('@').map_or(s, |(_, host)| host)
}

/// For each command, the first remote operand that resolves to an IPv4 address.
///
/// Unresolvable hosts are skipped; the commands still run.
pub async fn resolve_destinations(commands: &[ConcreteCommand]) -> Vec<(String, IpAddr)> {
    let mut cache: HashMap<String, Option<IpAddr>> = HashMap::new();
    let mut out = Vec::new();
    for command in commands {
        for host in command.args().iter().filter_map(|t| destination_host(t)) {
            let resolved = match cache.get(host) {
                Some(hit) => *hit,
                None => {
                    let ip = resolve_ipv4(host).await;
                    cache.insert(host.to_string(), ip);
                    ip
                }
            };
            if let Some(ip) = resolved {
                out.push((host.to_string(), ip));
                break;
            }
        }
    }
    out
}

async fn resolve_ipv4(host: &str) -> Option<IpAddr> {
    match tokio::net::lookup_host((host, 0)).await {
        Ok(mut addrs) => addrs.find(|a| a.is_ipv4()).map(|a| a.ip()),
        Err(e) => {
            warn!(host, error = %e, "cannot resolve destination, not tracking it");
            None
        }
    }
}

/// Run an `scp` batch with the kernel diagnostic source; Ctrl-C cancels.
pub async fn run_transfers(tokens: &[String], opts: &TransferOptions) -> Result<TransferReport> {
    run_transfers_with(
        tokens,
        opts,
        Arc::new(SockDiag),
        scheduler::interrupt_token(),
    )
    .await
}

pub async fn run_transfers_with(
    tokens: &[String],
    opts: &TransferOptions,
    source: Arc<dyn ConnectionSource>,
    cancel: CancellationToken,
) -> Result<TransferReport> {
    let commands = expand::expand(&transfer_template(tokens, opts.port));
    run_commands_with_telemetry(commands, opts, source, cancel).await
}

/// Run already expanded transfer commands while polling connection telemetry.
pub async fn run_commands_with_telemetry(
    commands: Vec<ConcreteCommand>,
    opts: &TransferOptions,
    source: Arc<dyn ConnectionSource>,
    cancel: CancellationToken,
) -> Result<TransferReport> {
    let run_opts = RunOptions {
        concurrency: opts.concurrency,
        returncode: None,
        show_progress: opts.show_progress,
    };

    let excluded = match snapshot_excluded(&source, opts.port).await {
        Ok(ports) => Some(ports),
        Err(e) => {
            report_diag_failure(&e);
            None
        }
    };

    let Some(excluded) = excluded else {
        let run = scheduler::run_commands_with_hooks(commands, &run_opts, cancel, RunHooks::default())
            .await?;
        return Ok(TransferReport {
            run,
            telemetry: None,
        });
    };

    let now = Instant::now();
    let mut table = TelemetryTable::new();
    for (name, ip) in resolve_destinations(&commands).await {
        table.track(name, ip, now);
    }
    info!(
        commands = commands.len(),
        servers = table.len(),
        excluded = excluded.len(),
        "starting transfers"
    );

    let tracker = TransferTracker::new(commands.len());
    let monitor = TelemetryMonitor::new(table, source, opts.port, excluded, tracker.clone())
        .with_interval(opts.interval)
        .with_render(opts.show_telemetry);
    let table = monitor.table();

    let on_complete: CompletionHook = Arc::new(move |_: &ConcreteCommand, _: &ExecutionResult| {
        tracker.complete_one();
    });
    let hooks = RunHooks {
        on_complete: Some(on_complete),
        companion: Some(Box::pin(async move {
            monitor.run().await.map_err(|e| {
                report_diag_failure(&e);
                anyhow::Error::new(e).context("telemetry monitor stopped")
            })
        })),
    };

    let run = scheduler::run_commands_with_hooks(commands, &run_opts, cancel, hooks).await?;
    let telemetry = snapshot_table(&table);
    Ok(TransferReport {
        run,
        telemetry: Some(telemetry),
    })
}

async fn snapshot_excluded(
    source: &Arc<dyn ConnectionSource>,
    port: u16,
) -> Result<HashSet<u16>, DiagError> {
    let source = source.clone();
    let records = tokio::task::spawn_blocking(move || source.query(port))
        .await
        .map_err(|e| DiagError::Io(std::io::Error::other(e)))??;
    let ports: HashSet<u16> = records.iter().map(|r| r.source_port).collect();
    debug!(port, excluded = ?ports, "pre-existing connections");
    Ok(ports)
}

fn snapshot_table(table: &Arc<Mutex<TelemetryTable>>) -> TelemetryTable {
    table.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

fn report_diag_failure(e: &DiagError) {
    error!("socket diagnostics unavailable: {e}");
    let hint = if e.is_permission_denied() {
        " (permission denied)"
    } else {
        ""
    };
    eprintln!(
        "\n{} {e}{hint}; transfers continue without telemetry",
        "telemetry disabled:".red().bold()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_prefixes_scp_and_port() {
        let t = transfer_template(&["a".into(), "h:/b".into()], 2222);
        assert_eq!(t, vec!["scp", "-P", "2222", "a", "h:/b"]);
    }

    #[test]
    fn destination_host_forms() {
        assert_eq!(destination_host("host:/tmp"), Some("host"));
        assert_eq!(destination_host("user@host:"), Some("host"));
        assert_eq!(destination_host("scp://u@10.0.0.1:2222/x"), Some("10.0.0.1"));
        assert_eq!(destination_host("./local:file"), None);
        assert_eq!(destination_host("plain.txt"), None);
        assert_eq!(destination_host(":nohost"), None);
    }

    #[tokio::test]
    async fn resolves_literal_addresses_once_per_command() {
        let cmds = vec![
            ConcreteCommand::new(["scp", "f", "127.0.0.1:/x"]),
            ConcreteCommand::new(["scp", "f", "nonexistent.invalid:/x", "127.0.0.2:/y"]),
            ConcreteCommand::new(["scp", "f", "local"]),
        ];
        let got = resolve_destinations(&cmds).await;
        assert_eq!(
            got,
            vec![
                ("127.0.0.1".to_string(), "127.0.0.1".parse::<IpAddr>().unwrap()),
                ("127.0.0.2".to_string(), "127.0.0.2".parse::<IpAddr>().unwrap()),
            ]
        );
    }
}
