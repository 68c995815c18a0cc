use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::exec;
use crate::progress::{Progress, ProgressCounts};
use crate::results::ResultCollector;
use crate::types::{ConcreteCommand, ExecutionResult, ResultSet};

/// Default concurrency cap for generic fan-out.
pub const DEFAULT_CONCURRENCY: usize = 100;

/// Called once per finished command, after progress and results are updated.
pub type CompletionHook = Arc<dyn Fn(&ConcreteCommand, &ExecutionResult) + Send + Sync>;

/// Extra task run alongside the workers for the whole batch.
pub type CompanionTask = BoxFuture<'static, Result<()>>;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub concurrency: usize,
    pub returncode: Option<i32>,
    pub show_progress: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            returncode: None,
            show_progress: true,
        }
    }
}

/// Optional extension points: a completion callback and one companion task.
///
/// The companion is awaited after the last worker finishes, so it must end on its own
/// once the batch is done (typically by watching state the hook updates).
#[derive(Default)]
pub struct RunHooks {
    pub on_complete: Option<CompletionHook>,
    pub companion: Option<CompanionTask>,
}

/// Outcome of a batch, possibly partial when interrupted.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub results: ResultSet,
    pub progress: ProgressCounts,
    pub peak_in_flight: usize,
    pub interrupted: bool,
    pub companion_error: Option<String>,
}

/// Run all commands with at most `opts.concurrency` processes alive at once.
///
/// Ctrl-C cancels the batch: running children are killed and the partial results returned.
pub async fn run_commands(commands: Vec<ConcreteCommand>, opts: &RunOptions) -> Result<RunReport> {
    run_commands_with_hooks(commands, opts, interrupt_token(), RunHooks::default()).await
}

/// Variant that accepts a `CancellationToken` to allow external cancellation.
pub async fn run_commands_with_cancel(
    commands: Vec<ConcreteCommand>,
    opts: &RunOptions,
    cancel: CancellationToken,
) -> Result<RunReport> {
    run_commands_with_hooks(commands, opts, cancel, RunHooks::default()).await
}

/// Token cancelled on Ctrl-C.
pub fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let cancel_ctrlc = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling batch");
            cancel_ctrlc.cancel();
        }
    });
    cancel
}

#[derive(Clone)]
struct Slots {
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Slots {
    fn new() -> Self {
        Self {
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub async fn run_commands_with_hooks(
    commands: Vec<ConcreteCommand>,
    opts: &RunOptions,
    cancel: CancellationToken,
    hooks: RunHooks,
) -> Result<RunReport> {
    let total = commands.len() as u64;
    let progress = Arc::new(Progress::new(total, opts.show_progress));
    let results = Arc::new(ResultCollector::new(opts.returncode));
    let slots = Slots::new();
    let sem = Arc::new(Semaphore::new(
        opts.concurrency.clamp(1, Semaphore::MAX_PERMITS),
    ));
    let mut set = JoinSet::new();
    let mut interrupted = false;

    debug!(total, concurrency = opts.concurrency, "starting batch");
    let companion = hooks.companion.map(tokio::spawn);

    for command in commands {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            p = sem.clone().acquire_owned() => Some(p),
        };
        let permit = match permit {
            Some(p) => p.context("permit pool closed")?,
            None => {
                interrupted = true;
                break;
            }
        };

        let progress = progress.clone();
        let results = results.clone();
        let slots = slots.clone();
        let hook = hooks.on_complete.clone();

        set.spawn(async move {
            let _permit = permit; // keep permit until the process is reaped

            slots.enter();
            let result = exec::run_command(&command).await;
            slots.leave();

            debug!(command = %command.render(), returncode = result.returncode, "finished");
            progress.on_complete(result.returncode);
            results.record(&command, &result);
            if let Some(hook) = hook {
                hook(&command, &result);
            }
        });
    }

    while !interrupted {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => interrupted = true,
            next = set.join_next() => match next {
                Some(Err(e)) if e.is_panic() => warn!("worker panicked: {e}"),
                Some(_) => {}
                None => break,
            },
        }
    }

    if interrupted {
        // dropping a worker drops its child, which is killed on drop
        set.abort_all();
        while set.join_next().await.is_some() {}
    }

    let mut companion_error = None;
    if let Some(handle) = companion {
        if interrupted {
            handle.abort();
        } else {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("companion task failed: {e:#}");
                    companion_error = Some(format!("{e:#}"));
                }
                Err(e) => {
                    error!("companion task aborted: {e}");
                    companion_error = Some(e.to_string());
                }
            }
        }
    }

    progress.finish();

    Ok(RunReport {
        results: results.snapshot(),
        progress: progress.snapshot(),
        peak_in_flight: slots.peak.load(Ordering::SeqCst),
        interrupted,
        companion_error,
    })
}
