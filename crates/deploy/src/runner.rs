//! External command execution.
//!
//! Every command carries its own working directory and environment; nothing here touches
//! the process-wide cwd or environment.

use std::{
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
};

use tokio_util::sync::CancellationToken;

use crate::{RollupError, RollupResult};

/// A program invocation with explicit arguments, cwd and environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Values replaced by `***` whenever the command is displayed.
    secrets: Vec<String>,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            secrets: Vec::new(),
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

    /// Add an argument whose value must never show up in logs or errors.
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        let arg = arg.into();
        self.secrets.push(arg.clone());
        self.args.push(arg);
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// True if `needle` appears as one argument.
    pub fn has_arg(&self, needle: &str) -> bool {
        self.args.iter().any(|a| a == needle)
    }

    /// Value following `flag`, if any.
    pub fn arg_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if self.secrets.contains(arg) {
                write!(f, " ***")?;
            } else if arg.contains(char::is_whitespace) || arg.is_empty() {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Executes external commands on behalf of the pipeline.
pub trait CommandRunner: Send + Sync {
    /// Run `cmd` to completion and return its stdout.
    ///
    /// A non-zero exit is [`RollupError::ExternalCommand`]; a fired `cancel` aborts the child
    /// and yields [`RollupError::Cancelled`].
    fn run(
        &self,
        cmd: &ShellCommand,
        cancel: &CancellationToken,
    ) -> impl Future<Output = RollupResult<String>> + Send;
}

/// Runs commands as child processes through tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioCommandRunner;

impl CommandRunner for TokioCommandRunner {
    async fn run(&self, cmd: &ShellCommand, cancel: &CancellationToken) -> RollupResult<String> {
        tracing::debug!(command = %cmd, cwd = ?cmd.cwd, "Running command");

        let mut command = tokio::process::Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &cmd.cwd {
            command.current_dir(cwd);
        }

        let child = command.spawn().map_err(|e| RollupError::ExternalCommand {
            command: cmd.to_string(),
            status: "not started".to_string(),
            stderr: e.to_string(),
        })?;

        // Dropping the output future kills the child.
        let output = tokio::select! {
            output = child.wait_with_output() => output,
            _ = cancel.cancelled() => {
                tracing::warn!(command = %cmd, "Command cancelled");
                return Err(RollupError::Cancelled);
            }
        }
        .map_err(|e| RollupError::ExternalCommand {
            command: cmd.to_string(),
            status: "io error".to_string(),
            stderr: e.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = redact(stderr.trim(), &cmd.secrets);
            return Err(RollupError::ExternalCommand {
                command: cmd.to_string(),
                status: output.status.to_string(),
                stderr,
            });
        }

        tracing::trace!(command = %cmd, stdout = %stdout.trim(), "Command finished");
        Ok(stdout)
    }
}

fn redact(text: &str, secrets: &[String]) -> String {
    secrets
        .iter()
        .filter(|s| !s.is_empty())
        .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), "***"))
}
