//! Subprocess runner for the external tools the engine shells out to.
//!
//! Every call carries a timeout. The child is killed when the timeout
//! fires, so a hung `git` or `gh` never outlives its refresh pass.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::debug;

use crate::error::CommandError;

/// Captured result of a finished command
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run `program args..` in `cwd` and capture its output.
///
/// Returns `Err` only when the process could not be spawned or timed out;
/// a non-zero exit is reported through [`CommandOutput::exit_code`].
pub async fn execute(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    let start = Instant::now();

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    let result = tokio::time::timeout(timeout, command.output()).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    let output = match result {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(CommandError::Spawn {
                program: program.to_string(),
                source,
            })
        }
        Err(_) => {
            return Err(CommandError::Timeout {
                program: program.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    };

    debug!(
        component = "process",
        event = "process.finished",
        program,
        args = ?args,
        exit_code = ?output.status.code(),
        duration_ms,
    );

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code(),
        duration_ms,
    })
}

/// Like [`execute`], but a non-zero exit becomes [`CommandError::Failed`]
/// and the trimmed stdout is returned.
pub async fn run_checked(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<String, CommandError> {
    let output = execute(program, args, cwd, timeout).await?;
    if !output.success() {
        return Err(CommandError::Failed {
            program: program.to_string(),
            code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output.stdout.trim_end().to_string())
}

/// First non-empty trimmed line of `text`.
pub fn first_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|line| !line.is_empty())
}
