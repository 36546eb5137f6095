//! Privileged command execution
//!
//! Connectors never spawn processes themselves. They build a [`CommandSpec`]
//! (an argument vector, never a shell string) and hand it to an
//! [`Executor`]. The production implementation is [`ProcessExecutor`];
//! tests substitute a recording fake.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

/// Default per-command timeout
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// A host command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Run through the configured root helper
    pub privileged: bool,
    /// Payload written to the child's stdin
    pub stdin: Option<String>,
    /// Exit codes treated as success
    pub ok_codes: Vec<i32>,
}

impl CommandSpec {
    /// A privileged command with no arguments yet.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            privileged: true,
            stdin: None,
            ok_codes: vec![0],
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run without the root helper.
    pub fn unprivileged(mut self) -> Self {
        self.privileged = false;
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn ok_codes(mut self, codes: &[i32]) -> Self {
        self.ok_codes = codes.to_vec();
        self
    }

    /// Write `value` into a sysfs control file.
    ///
    /// Goes through `tee -a` so the write happens with the root helper's
    /// privileges instead of the caller's.
    pub fn write_sysfs(path: impl Into<String>, value: impl Into<String>) -> Self {
        CommandSpec::new("tee").arg("-a").arg(path).stdin(value)
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }

    /// Render for logs and error messages.
    pub fn render(&self) -> String {
        self.argv().join(" ")
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Captured output of a command that exited with an accepted status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn new(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }
}

/// Failure to run a command or a command exiting with an unaccepted status.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with status {exit_code}: {}", stderr.trim())]
    Failed {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

impl ExecError {
    pub fn failed(cmd: &CommandSpec, exit_code: i32, stdout: &str, stderr: &str) -> Self {
        ExecError::Failed {
            command: cmd.render(),
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    /// Exit code, if the command ran to completion.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecError::Failed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    pub fn stderr(&self) -> &str {
        match self {
            ExecError::Failed { stderr, .. } => stderr,
            _ => "",
        }
    }

    pub fn stdout(&self) -> &str {
        match self {
            ExecError::Failed { stdout, .. } => stdout,
            _ => "",
        }
    }

    /// The program could not be started (missing binary, permissions).
    pub fn is_spawn_failure(&self) -> bool {
        matches!(self, ExecError::Spawn { .. })
    }

    /// True if either captured stream mentions `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        self.stderr().contains(needle) || self.stdout().contains(needle)
    }
}

/// Runs host commands on behalf of connectors.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, cmd: &CommandSpec) -> Result<ExecOutput, ExecError>;
}

/// Executor backed by real child processes.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    root_helper: Vec<String>,
    timeout: Duration,
}

impl ProcessExecutor {
    /// `root_helper` is prepended to privileged commands (e.g. `["sudo"]`).
    /// An empty helper runs everything as the current user.
    pub fn new(root_helper: Vec<String>) -> Self {
        Self {
            root_helper,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build(&self, cmd: &CommandSpec) -> Command {
        let mut argv: Vec<&str> = Vec::new();
        if cmd.privileged {
            argv.extend(self.root_helper.iter().map(String::as_str));
        }
        argv.extend(cmd.argv());

        let mut command = Command::new(argv[0]);
        command
            .args(&argv[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command.stdin(if cmd.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn execute(&self, cmd: &CommandSpec) -> Result<ExecOutput, ExecError> {
        debug!(command = %cmd, privileged = cmd.privileged, "Executing");

        let mut child = self.build(cmd).spawn().map_err(|source| ExecError::Spawn {
            program: cmd.program.clone(),
            source,
        })?;

        if let (Some(input), Some(mut stdin)) = (cmd.stdin.as_ref(), child.stdin.take()) {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|source| ExecError::Spawn {
                    program: cmd.program.clone(),
                    source,
                })?;
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| ExecError::Spawn {
                program: cmd.program.clone(),
                source,
            })?,
            Err(_) => {
                return Err(ExecError::Timeout {
                    command: cmd.render(),
                    timeout: self.timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        // Killed by a signal: report as -1
        let exit_code = output.status.code().unwrap_or(-1);
        trace!(command = %cmd, exit_code, "Command finished");

        if cmd.ok_codes.contains(&exit_code) {
            Ok(ExecOutput {
                stdout,
                stderr,
                exit_code,
            })
        } else {
            Err(ExecError::failed(cmd, exit_code, &stdout, &stderr))
        }
    }
}
