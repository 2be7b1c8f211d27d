// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use crate::VirtualError;
use std::process::Stdio;
use std::time::Duration;
use tracing::debug;

/// Runs a CLI to completion and returns its stdout. A non-zero exit status turns into
/// [VirtualError::Command] carrying the combined output, and the child is killed once the timeout
/// expires.
pub(crate) async fn run<S: AsRef<str>>(
    program: &str,
    args: &[S],
    timeout: Duration,
    action: &str,
) -> Result<String, VirtualError> {
    let mut command = tokio::process::Command::new(program);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    command.kill_on_drop(true);
    command.args(args.iter().map(|arg| arg.as_ref()));

    debug! {
        program,
        action,
        "running command"
    }

    let child = command.spawn()?;
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(res) => res?,
        Err(_) => {
            return Err(VirtualError::Timeout {
                action: action.to_string(),
            })
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(VirtualError::Command {
            action: action.to_string(),
            output: format!("{}{}", stdout, stderr).trim().to_string(),
        });
    }

    Ok(stdout)
}
