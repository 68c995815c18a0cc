use std::process::{ExitStatus, Stdio};

use tokio::process::Command;
use tracing::debug;

use crate::types::{ConcreteCommand, ExecutionResult};

/// Return code reported when the executable cannot be started.
pub const SPAWN_FAILURE_CODE: i32 = 127;

/// Run one command to completion, buffering stdout and stderr fully.
///
/// Never fails: a spawn error becomes a result with return code 127 and the error text
/// on stderr. The child is killed if this future is dropped before it exits.
///
/// Stdin is closed: many children run at once and none of them may read the terminal.
pub async fn run_command(command: &ConcreteCommand) -> ExecutionResult {
    let Some(program) = command.program() else {
        return ExecutionResult::failure(SPAWN_FAILURE_CODE, "empty command");
    };

    let mut cmd = Command::new(program);
    cmd.args(command.args())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            debug!(command = %command.render(), error = %e, "spawn failed");
            return ExecutionResult::failure(
                SPAWN_FAILURE_CODE,
                format!("{program}: failed to spawn: {e}"),
            );
        }
    };

    match child.wait_with_output().await {
        Ok(output) => {
            ExecutionResult::from_output(exit_code(output.status), &output.stdout, &output.stderr)
        }
        Err(e) => ExecutionResult::failure(1, format!("{program}: failed to wait: {e}")),
    }
}

/// Exit code, or the negated signal number when the process was killed by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return -sig;
        }
    }
    -1
}
