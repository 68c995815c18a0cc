use std::sync::Mutex;

use crate::types::{ConcreteCommand, ExecutionResult, ResultSet};

/// Collects per-command results, keeping only those matching the optional return-code filter.
#[derive(Debug, Default)]
pub struct ResultCollector {
    returncode: Option<i32>,
    results: Mutex<ResultSet>,
}

impl ResultCollector {
    pub fn new(returncode: Option<i32>) -> Self {
        Self {
            returncode,
            results: Mutex::new(ResultSet::new()),
        }
    }

    /// Record a finished command. Returns whether it was retained.
    pub fn record(&self, command: &ConcreteCommand, result: &ExecutionResult) -> bool {
        if self.returncode.is_some_and(|rc| rc != result.returncode) {
            return false;
        }
        self.lock().insert(command.render(), result.clone());
        true
    }

    pub fn snapshot(&self) -> ResultSet {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ResultSet> {
        self.results.lock().unwrap_or_else(|e| e.into_inner())
    }
}
