//! Command execution abstraction for `run_command` steps.
//!
//! The [`CommandExecutor`] trait decouples the scheduler from the shell. Tests
//! use scripted executors that return predetermined outputs without spawning
//! processes.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::io::config::RuntimeConfig;
use crate::io::process::{Shell, on_path, run_captured};

/// Exit code reported when a command exceeds its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code reported when the shell could not be spawned.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// Result of one command. Failures are encoded here, never raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandExecution {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandExecution {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Abstraction over command execution backends.
pub trait CommandExecutor {
    /// Run `command`. Timeouts and OS errors become a non-zero exit code.
    fn run(&self, command: &str) -> CommandExecution;

    /// Whether `program` can be invoked by commands run through this executor.
    fn program_available(&self, program: &str) -> bool {
        on_path(program)
    }
}

/// Executor that runs commands through the configured shell.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: Shell,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl ShellExecutor {
    pub fn new(runtime: &RuntimeConfig, workdir: PathBuf) -> Self {
        Self {
            shell: Shell::for_platform(&runtime.shell_linux, &runtime.shell_windows),
            workdir,
            timeout: Duration::from_secs(runtime.timeout_secs),
            output_limit_bytes: runtime.command_output_limit_bytes,
        }
    }
}

impl CommandExecutor for ShellExecutor {
    #[instrument(skip_all, fields(timeout_secs = self.timeout.as_secs()))]
    fn run(&self, command: &str) -> CommandExecution {
        info!(command, "running command");
        let child = self.shell.wrap(command, &self.workdir);
        match run_captured(child, self.timeout, self.output_limit_bytes) {
            Ok(run) if run.timed_out => {
                warn!(timeout_secs = self.timeout.as_secs(), "command timed out");
                let mut stderr = run.stderr.render("stderr");
                if !stderr.is_empty() && !stderr.ends_with('\n') {
                    stderr.push('\n');
                }
                stderr.push_str(&format!(
                    "Command timed out after {} seconds",
                    self.timeout.as_secs()
                ));
                CommandExecution {
                    command: command.to_string(),
                    exit_code: TIMEOUT_EXIT_CODE,
                    stdout: run.stdout.render("stdout"),
                    stderr,
                }
            }
            Ok(run) => CommandExecution {
                command: command.to_string(),
                // Signal-terminated children have no exit code.
                exit_code: run.exit_code.unwrap_or(1),
                stdout: run.stdout.render("stdout"),
                stderr: run.stderr.render("stderr"),
            },
            Err(err) => {
                warn!(err = %format!("{err:#}"), "failed to run command");
                CommandExecution {
                    command: command.to_string(),
                    exit_code: SPAWN_FAILURE_EXIT_CODE,
                    stdout: String::new(),
                    stderr: format!("{err:#}"),
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn executor(shell: &str, timeout_secs: u64) -> ShellExecutor {
        let runtime = RuntimeConfig {
            shell_linux: shell.to_string(),
            timeout_secs,
            ..RuntimeConfig::default()
        };
        let temp = std::env::temp_dir();
        ShellExecutor::new(&runtime, temp)
    }

    #[test]
    fn runs_through_shell() {
        let result = executor("/bin/sh", 5).run("echo hello");
        assert!(result.succeeded());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[test]
    fn missing_shell_becomes_exit_127() {
        let result = executor("/definitely/not/a/shell", 5).run("echo hello");
        assert_eq!(result.exit_code, SPAWN_FAILURE_EXIT_CODE);
        assert!(result.stderr.contains("spawn shell"));
    }

    #[test]
    fn timeout_becomes_exit_124() {
        let result = executor("/bin/sh", 1).run("sleep 3");
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.stderr.contains("timed out after 1 seconds"));
    }

    #[test]
    fn default_program_lookup_uses_path() {
        let exec = executor("/bin/sh", 5);
        assert!(exec.program_available("sh"));
        assert!(!exec.program_available("definitely-not-a-real-program-xyz"));
    }
}
