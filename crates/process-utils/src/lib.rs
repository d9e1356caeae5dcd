//! Small process-related helpers shared across the workspace.
//!
//! Everything the exporter shells out to (`virsh`, `guestfish`) goes through
//! these helpers so that children never outlive the future awaiting them and
//! every invocation is bounded in time.

use std::ffi::OsStr;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while running an external command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` did not finish within {after:?}")]
    Timeout { program: String, after: Duration },

    #[error("I/O error while waiting for `{program}`: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl CommandError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Trimmed stderr, falling back to stdout when stderr is empty.
    pub fn diagnostic(&self) -> &str {
        let err = self.stderr.trim();
        if err.is_empty() { self.stdout.trim() } else { err }
    }
}

/// Create a `tokio::process::Command` that is killed when its handle is dropped.
///
/// Stdin is closed so interactive tools never wait on the terminal.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.kill_on_drop(true).stdin(std::process::Stdio::null());
    cmd
}

/// Run `cmd` to completion, capturing stdout and stderr, bounded by `timeout`.
///
/// On timeout the child is dropped, which kills it because every command
/// built by [`tokio_command`] sets `kill_on_drop`.
#[cfg(feature = "tokio")]
pub async fn output_with_timeout(
    cmd: &mut tokio::process::Command,
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    use std::process::Stdio;

    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| CommandError::Spawn {
            program: program.clone(),
            source,
        })?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        Ok(Err(source)) => Err(CommandError::Wait { program, source }),
        Err(_) => {
            tracing::debug!(program = %program, ?timeout, "command timed out, killing");
            Err(CommandError::Timeout {
                program,
                after: timeout,
            })
        }
    }
}

/// Whether a process with this pid currently exists.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the permission and existence check.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Send SIGKILL to `pid`. Returns `true` if the signal was delivered.
#[cfg(unix)]
pub fn kill_pid(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: kill(2) has no memory-safety preconditions.
    unsafe { libc::kill(pid, libc::SIGKILL) == 0 }
}
