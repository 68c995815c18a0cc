use std::io::Write;
use std::sync::Mutex;

use colored::Colorize;

/// Snapshot of completion counters. `finished == success + failure` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressCounts {
    pub total: u64,
    pub finished: u64,
    pub success: u64,
    pub failure: u64,
}

impl ProgressCounts {
    /// Plain status text, e.g. `3/3 SUCCESS: 3 FAILURE: 0`.
    pub fn status_line(&self) -> String {
        format!(
            "{}/{} SUCCESS: {} FAILURE: {}",
            self.finished, self.total, self.success, self.failure
        )
    }
}

/// Running success/failure tally, optionally redrawn on stderr after every completion.
#[derive(Debug)]
pub struct Progress {
    counts: Mutex<ProgressCounts>,
    render: bool,
}

impl Progress {
    pub fn new(total: u64, render: bool) -> Self {
        Self {
            counts: Mutex::new(ProgressCounts {
                total,
                ..Default::default()
            }),
            render,
        }
    }

    pub fn on_complete(&self, returncode: i32) {
        let snapshot = {
            let mut c = self.counts.lock().unwrap_or_else(|e| e.into_inner());
            c.finished += 1;
            if returncode == 0 {
                c.success += 1;
            } else {
                c.failure += 1;
            }
            *c
        };
        if self.render {
            draw(&snapshot);
        }
    }

    pub fn snapshot(&self) -> ProgressCounts {
        *self.counts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Terminate the redrawn line so later output starts on a fresh one.
    pub fn finish(&self) {
        if self.render {
            eprintln!();
        }
    }
}

fn draw(c: &ProgressCounts) {
    let mut err = std::io::stderr().lock();
    let _ = write!(
        err,
        "\rProgress {}/{} {}: {} {}: {}",
        c.finished,
        c.total,
        "SUCCESS".green(),
        c.success,
        "FAILURE".red(),
        c.failure
    );
    let _ = err.flush();
}
