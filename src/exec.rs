//! External command invocation for collaborator drivers
//!
//! Command lines come from configuration and are split with `shell-words`,
//! so quoting works the way operators expect from a shell, without running
//! one.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// A program with arguments and an optional working directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    /// Split a configured command line into program and arguments
    pub fn parse(line: &str) -> Result<Self> {
        let mut words = shell_words::split(line)
            .with_context(|| format!("Invalid command line: {}", line))?
            .into_iter();

        let program = words
            .next()
            .with_context(|| format!("Empty command line: {:?}", line))?;

        Ok(Self {
            program,
            args: words.collect(),
            cwd: None,
        })
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

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// The command line as it would be typed into a shell
    pub fn display(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(self.program.as_str());
        words.extend(self.args.iter().map(String::as_str));
        shell_words::join(words)
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs collaborator commands
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion and capture its output
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Run a command and fail unless it exits successfully
    fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let output = self.run(spec)?;

        if !output.success() {
            let status = output
                .status
                .map(|code| format!("exit code {}", code))
                .unwrap_or_else(|| "a signal".to_string());
            let detail = output.stderr.trim();
            if detail.is_empty() {
                anyhow::bail!("`{}` failed with {}", spec.display(), status);
            }
            anyhow::bail!("`{}` failed with {}: {}", spec.display(), status, detail);
        }

        Ok(output)
    }
}

/// Runs commands as child processes
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %spec.display(), cwd = ?spec.cwd, "Running command");

        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        if let Some(dir) = &spec.cwd {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .with_context(|| format!("Failed to run `{}`", spec.display()))?;

        let output = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        debug!(command = %spec.display(), status = ?output.status, "Command finished");
        Ok(output)
    }
}

/// Records every command and answers from canned rules
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingRunner {
    calls: parking_lot::Mutex<Vec<CommandSpec>>,
    failures: Vec<String>,
    stdout: Vec<(String, String)>,
}

#[cfg(test)]
impl RecordingRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Commands whose display line contains `needle` exit with status 1
    pub(crate) fn failing(mut self, needle: &str) -> Self {
        self.failures.push(needle.to_string());
        self
    }

    /// Commands whose display line contains `needle` print `stdout`
    pub(crate) fn with_stdout(mut self, needle: &str, stdout: &str) -> Self {
        self.stdout.push((needle.to_string(), stdout.to_string()));
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().iter().map(CommandSpec::display).collect()
    }

    pub(crate) fn specs(&self) -> Vec<CommandSpec> {
        self.calls.lock().clone()
    }
}

#[cfg(test)]
impl CommandRunner for RecordingRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let line = spec.display();
        self.calls.lock().push(spec.clone());

        if self.failures.iter().any(|needle| line.contains(needle.as_str())) {
            return Ok(CommandOutput {
                status: Some(1),
                stdout: String::new(),
                stderr: format!("simulated failure of {}", spec.program),
            });
        }

        let stdout = self
            .stdout
            .iter()
            .find(|(needle, _)| line.contains(needle.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default();

        Ok(CommandOutput {
            status: Some(0),
            stdout,
            stderr: String::new(),
        })
    }
}
