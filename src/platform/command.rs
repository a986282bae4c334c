use std::{ffi::OsStr, process::Stdio};

use tokio::process::Command;
use tracing::debug;

use crate::error::{BridgeError, Result};

/// Outcome of a native tool that could be launched.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    /// stdout followed by stderr, lossily decoded and trimmed.
    pub combined: String,
}

impl CommandOutput {
    /// Turn a non-zero exit into [`BridgeError::Command`].
    pub fn check(self, command: impl Into<String>) -> Result<String> {
        if self.success {
            Ok(self.combined)
        } else {
            Err(BridgeError::Command {
                command: command.into(),
                output: self.combined,
            })
        }
    }
}

pub fn describe<S: AsRef<OsStr>>(program: &str, args: &[S]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(&arg.as_ref().to_string_lossy());
    }
    line
}

/// Build a command that never inherits the host's stdin and never pops a
/// console window on Windows.
pub fn command<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null());
    #[cfg(windows)]
    {
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}

/// Run `program args…` as an argument vector (no shell) and collect its
/// output. Only a failure to launch is an `Err`.
pub async fn run<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<CommandOutput> {
    let line = describe(program, args);
    debug!(command = %line, "running native command");

    let output = command(program, args)
        .output()
        .await
        .map_err(|source| BridgeError::Spawn { command: line.clone(), source })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    let result = CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        combined: combined.trim().to_string(),
    };
    debug!(command = %line, code = ?result.code, "native command finished");
    Ok(result)
}

/// [`run`] and require a zero exit status.
pub async fn run_checked<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<String> {
    run(program, args).await?.check(describe(program, args))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn combines_stdout_and_stderr() {
        let out = run("sh", &["-c", "echo out; echo err 1>&2"]).await.unwrap();
        assert!(out.success);
        assert_eq!(out.combined, "out\nerr");
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported_with_output() {
        let err = run_checked("sh", &["-c", "echo nope; exit 3"]).await.unwrap_err();
        assert_eq!(err.to_string(), "`sh -c echo nope; exit 3` failed: nope");
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = run("definitely-not-a-real-tool-xnode", &["x"]).await.unwrap_err();
        assert!(matches!(err, BridgeError::Spawn { .. }));
    }
}
