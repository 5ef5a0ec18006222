//! Exec transports used by the container filesystem bridge.
//!
//! The bridge never spawns processes itself: it hands a shell script and its
//! positional arguments to an [`ExecTransport`]. The transport runs
//! `sh -c <script> sandbox-fs <args...>` inside the named container and
//! returns the raw output.
//!
//! # Notes on stdout/stderr capture and timeouts
//!
//! Do not read stdout/stderr only after process exit: if the child writes enough
//! data to fill a pipe, the child can block forever and never exit (deadlock).
//! Both streams are drained concurrently, stdin is fed from its own thread, and
//! the timeout is enforced with millisecond precision and a hard kill.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, trace};

use crate::error::TransportError;

/// Name passed as `$0` to bridge scripts.
pub const SCRIPT_NAME: &str = "sandbox-fs";

/// Output from a command executed in the container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Raw standard output (file contents for reads).
    pub stdout: Vec<u8>,
    /// Standard error, lossily decoded.
    pub stderr: String,
    /// Exit code (0 typically indicates success).
    pub exit_code: i32,
}

impl CommandOutput {
    /// Returns `true` if the command exited successfully (exit code 0).
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns stdout decoded as UTF-8 (lossy).
    #[must_use]
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// One shell invocation inside a container.
#[derive(Debug, Clone)]
pub struct ExecRequest<'a> {
    /// Target container name.
    pub container: &'a str,
    /// POSIX shell script passed to `sh -c`.
    pub script: &'a str,
    /// Positional arguments (`$1`, `$2`, ...).
    pub args: Vec<String>,
    /// Bytes written to the script's stdin.
    pub stdin: Option<&'a [u8]>,
}

impl ExecRequest<'_> {
    /// Returns the in-container argv: `sh -c <script> sandbox-fs <args...>`.
    #[must_use]
    pub fn shell_argv(&self) -> Vec<String> {
        let mut argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            self.script.to_string(),
            SCRIPT_NAME.to_string(),
        ];
        argv.extend(self.args.iter().cloned());
        argv
    }
}

/// Runs shell scripts inside a container.
///
/// Implementations must be `Send + Sync` because one bridge may serve
/// concurrent tool invocations.
pub trait ExecTransport: Send + Sync {
    /// Runs the request and returns its output, whatever the exit code.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` only when the command could not be run or
    /// did not finish in time.
    fn exec(&self, request: &ExecRequest<'_>) -> Result<CommandOutput, TransportError>;
}

impl<T: ExecTransport + ?Sized> ExecTransport for std::sync::Arc<T> {
    fn exec(&self, request: &ExecRequest<'_>) -> Result<CommandOutput, TransportError> {
        (**self).exec(request)
    }
}

/// Transport that shells out to `docker exec -i`.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use sandbox_authz::sandbox::DockerExecTransport;
///
/// let transport = DockerExecTransport::new()
///     .with_program("podman")
///     .with_timeout(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct DockerExecTransport {
    program: String,
    timeout: Duration,
}

impl Default for DockerExecTransport {
    fn default() -> Self {
        Self {
            program: String::from("docker"),
            timeout: Duration::from_secs(30),
        }
    }
}

impl DockerExecTransport {
    /// Creates a transport using `docker` with a 30s timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the container CLI (e.g. `podman`).
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Sets the per-command timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the host argv used for a request.
    #[must_use]
    pub fn host_argv(&self, request: &ExecRequest<'_>) -> Vec<String> {
        let mut argv = vec![
            self.program.clone(),
            "exec".to_string(),
            "-i".to_string(),
            request.container.to_string(),
        ];
        argv.extend(request.shell_argv());
        argv
    }
}

impl ExecTransport for DockerExecTransport {
    #[instrument(
        skip(self, request),
        fields(container = %request.container, timeout_ms = %self.timeout.as_millis())
    )]
    fn exec(&self, request: &ExecRequest<'_>) -> Result<CommandOutput, TransportError> {
        let argv = self.host_argv(request);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| TransportError::Failed("empty argv".to_string()))?;

        trace!("Spawning exec client");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| TransportError::Spawn {
                program: program.clone(),
                source,
            })?;

        // Feed stdin from its own thread; dropping the handle closes the pipe.
        let stdin_bytes = request.stdin.map(<[u8]>::to_vec).unwrap_or_default();
        let stdin_handle = child.stdin.take();
        let stdin_join = thread::spawn(move || {
            if let Some(mut stdin) = stdin_handle {
                let _ = stdin.write_all(&stdin_bytes);
            }
        });

        // Drain stdout/stderr concurrently so the child can't deadlock on full pipes.
        let mut stdout_reader = child.stdout.take();
        let mut stderr_reader = child.stderr.take();

        let (stdout_tx, stdout_rx) = mpsc::channel::<Vec<u8>>();
        let (stderr_tx, stderr_rx) = mpsc::channel::<Vec<u8>>();

        let stdout_join = thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(mut r) = stdout_reader.take() {
                let _ = r.read_to_end(&mut buf);
            }
            let _ = stdout_tx.send(buf);
        });

        let stderr_join = thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(mut r) = stderr_reader.take() {
                let _ = r.read_to_end(&mut buf);
            }
            let _ = stderr_tx.send(buf);
        });

        let start = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if start.elapsed() > self.timeout {
                        debug!(
                            elapsed_ms = %start.elapsed().as_millis(),
                            "Command timed out, killing exec client"
                        );
                        let _ = child.kill();
                        let _ = child.wait();
                        let _ = stdin_join.join();
                        let _ = stdout_join.join();
                        let _ = stderr_join.join();
                        return Err(TransportError::Timeout {
                            timeout_ms: self.timeout.as_millis(),
                        });
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => {
                    let _ = child.kill();
                    let _ = stdin_join.join();
                    let _ = stdout_join.join();
                    let _ = stderr_join.join();
                    return Err(TransportError::Failed(format!(
                        "failed to wait for exec client: {e}"
                    )));
                }
            }
        };

        let stdout = stdout_rx.recv().unwrap_or_default();
        let stderr = stderr_rx.recv().unwrap_or_default();

        let _ = stdin_join.join();
        let _ = stdout_join.join();
        let _ = stderr_join.join();

        // A signal-terminated client has no exit code.
        let exit_code = status.code().unwrap_or(-1);
        debug!(exit_code, elapsed_ms = %start.elapsed().as_millis(), "Exec completed");
        Ok(CommandOutput {
            stdout,
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }
}
