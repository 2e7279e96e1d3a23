//! Command execution primitive.
//!
//! Every external tool (kubectl, argocd, kind) is driven through the
//! `CommandRunner` trait so that callers can be exercised against a
//! scripted runner in tests. The real runner spawns subprocesses with
//! tokio, bounded by a per-command timeout.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// Default bound on a single command
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Flags whose following argument is a secret
const SECRET_FLAGS: &[&str] = &["--password", "--auth-token"];

/// A command to run: argv (program first), optional stdin and a timeout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    argv: Vec<String>,
    stdin: Option<String>,
    timeout: Duration,
}

impl CommandLine {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            stdin: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn stdin(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// True if argv begins with the given words
    pub fn starts_with(&self, prefix: &[&str]) -> bool {
        self.argv.len() >= prefix.len() && self.argv.iter().zip(prefix).all(|(a, p)| a == p)
    }

    /// Printable form with secret arguments masked
    pub fn display(&self) -> String {
        redact(&self.argv)
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

/// Join argv for display, masking the values of secret flags
pub fn redact(argv: &[String]) -> String {
    let mut out = Vec::with_capacity(argv.len());
    let mut mask_next = false;
    for arg in argv {
        if mask_next {
            out.push("******");
            mask_next = false;
            continue;
        }
        mask_next = SECRET_FLAGS.contains(&arg.as_str());
        out.push(arg.as_str());
    }
    out.join(" ")
}

/// Output of a successful command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Uniform failure of an external command
#[derive(Debug, Clone)]
pub struct ProcessError {
    pub message: String,

    /// Exit code (None when the process never exited, e.g. timeout or spawn failure)
    pub code: Option<i32>,

    pub stdout: String,
    pub stderr: String,
}

impl ProcessError {
    pub fn new(
        message: impl Into<String>,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn stderr_contains(&self, needle: &str) -> bool {
        self.stderr.contains(needle)
    }

    /// The target of a create already exists
    pub fn is_already_exists(&self) -> bool {
        self.stderr_contains("already exists") || self.stderr_contains("AlreadyExists")
    }
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stderr = self.stderr.trim();
        if stderr.is_empty() || self.message.contains(stderr) {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.message, stderr)
        }
    }
}

impl std::error::Error for ProcessError {}

/// Executes external commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command; non-zero exit, timeout and spawn failures are errors
    async fn run(&self, cmd: &CommandLine) -> Result<CommandOutput, ProcessError>;
}

/// Run a command and decode stdout as JSON
///
/// Decode failures surface as a `ProcessError` carrying the raw stdout.
pub async fn run_json<T: DeserializeOwned>(
    runner: &dyn CommandRunner,
    cmd: &CommandLine,
) -> Result<T, ProcessError> {
    let output = runner.run(cmd).await?;
    serde_json::from_str(&output.stdout).map_err(|e| {
        ProcessError::new(
            format!("Invalid JSON output from: {}", cmd.display()),
            Some(output.code),
            output.stdout,
            e.to_string(),
        )
    })
}

/// Runs commands as local subprocesses
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, cmd: &CommandLine) -> Result<CommandOutput, ProcessError> {
        let (program, args) = cmd
            .argv()
            .split_first()
            .ok_or_else(|| ProcessError::new("Empty command", None, "", ""))?;

        debug!(command = %cmd, "Running command");

        let mut child = Command::new(program)
            .args(args)
            .stdin(if cmd.stdin().is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the wait (timeout, Ctrl-C) must not leave the child behind
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProcessError::new(format!("Failed to spawn '{}': {}", program, e), None, "", ""))?;

        if let (Some(input), Some(mut stdin)) = (cmd.stdin(), child.stdin.take()) {
            stdin.write_all(input.as_bytes()).await.map_err(|e| {
                ProcessError::new(format!("Failed to write to '{}' stdin: {}", program, e), None, "", "")
            })?;
            // Drop stdin to signal EOF
        }

        let output = match timeout(cmd.timeout(), child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ProcessError::new(
                    format!("Failed to wait for '{}': {}", program, e),
                    None,
                    "",
                    "",
                ));
            }
            Err(_) => {
                return Err(ProcessError::new(
                    format!("Command timed out after {}s: {}", cmd.timeout().as_secs(), cmd),
                    None,
                    "",
                    "",
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            let code = output.status.code();
            debug!(command = %cmd, code = ?code, stderr = %stderr.trim(), "Command failed");
            return Err(ProcessError::new(
                format!("Command failed with exit code {}: {}", code.unwrap_or(-1), cmd),
                code,
                stdout,
                stderr,
            ));
        }

        Ok(CommandOutput {
            code: output.status.code().unwrap_or(0),
            stdout,
            stderr,
        })
    }
}

/// Scripted runner for exercising callers without spawning processes
///
/// Used by this crate's unit tests and by the integration tests under `tests/`.
pub mod scripted {
    use std::sync::{Mutex, MutexGuard};

    use super::*;

    type Responder = Box<dyn Fn(&CommandLine) -> Result<String, ProcessError> + Send + Sync>;

    /// Answers commands from a closure and records every invocation
    pub struct ScriptedRunner {
        calls: Mutex<Vec<CommandLine>>,
        respond: Responder,
    }

    impl ScriptedRunner {
        pub fn new<F>(respond: F) -> Self
        where
            F: Fn(&CommandLine) -> Result<String, ProcessError> + Send + Sync + 'static,
        {
            Self {
                calls: Mutex::new(Vec::new()),
                respond: Box::new(respond),
            }
        }

        fn recorded(&self) -> MutexGuard<'_, Vec<CommandLine>> {
            self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
        }

        /// Every command run so far, in order
        pub fn calls(&self) -> Vec<CommandLine> {
            self.recorded().clone()
        }

        /// Number of commands whose argv starts with `prefix`
        pub fn count(&self, prefix: &[&str]) -> usize {
            self.recorded().iter().filter(|c| c.starts_with(prefix)).count()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, cmd: &CommandLine) -> Result<CommandOutput, ProcessError> {
            self.recorded().push(cmd.clone());
            (self.respond)(cmd).map(|stdout| CommandOutput {
                code: 0,
                stdout,
                stderr: String::new(),
            })
        }
    }

    /// A failed command with exit code 1 and the given stderr
    pub fn fail(stderr: &str) -> ProcessError {
        ProcessError::new("Command failed with exit code 1", Some(1), "", stderr)
    }
}
