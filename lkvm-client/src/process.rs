//! Subprocess-backed [`ProcessInvoker`].

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, instrument, warn};

use crate::config::ClientConfig;
use crate::error::ProcessError;
use crate::traits::{Invocation, ProcessInvoker};
use crate::types::{CommandResult, LaunchOutcome};

/// Maximum output captured per stream (default 1MB)
pub const DEFAULT_MAX_OUTPUT: usize = 1024 * 1024;

/// Time a child gets between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// Runs invocations as real child processes.
#[derive(Debug, Clone)]
pub struct SystemInvoker {
    /// Privilege helper prefixed to every command (e.g. "sudo")
    root_helper: Option<String>,
    /// Refuse to run as non-root without a helper
    require_root: bool,
    kill_grace: Duration,
    max_output: usize,
    /// File receiving the output of launched commands (discarded if unset)
    launch_log: Option<PathBuf>,
}

impl SystemInvoker {
    pub fn new() -> Self {
        Self {
            root_helper: None,
            require_root: false,
            kill_grace: DEFAULT_KILL_GRACE,
            max_output: DEFAULT_MAX_OUTPUT,
            launch_log: None,
        }
    }

    /// Build an invoker from client configuration.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            root_helper: config.root_helper.clone(),
            require_root: config.require_root,
            kill_grace: config.kill_grace(),
            max_output: config.max_output_bytes,
            launch_log: config.launch_log.as_ref().map(PathBuf::from),
        }
    }

    pub fn with_root_helper(mut self, helper: impl Into<String>) -> Self {
        self.root_helper = Some(helper.into());
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_max_output(mut self, max_output: usize) -> Self {
        self.max_output = max_output;
        self
    }

    pub fn with_require_root(mut self, require_root: bool) -> Self {
        self.require_root = require_root;
        self
    }

    pub fn with_launch_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.launch_log = Some(path.into());
        self
    }

    fn check_privileges(&self, program: &str) -> Result<(), ProcessError> {
        #[cfg(unix)]
        if self.require_root && self.root_helper.is_none() && !nix::unistd::geteuid().is_root() {
            return Err(ProcessError::PermissionDenied {
                program: program.to_string(),
                reason: "root privileges required and no root helper configured".to_string(),
            });
        }
        #[cfg(not(unix))]
        let _ = program;
        Ok(())
    }

    fn build_command(&self, tool: &Path, invocation: &Invocation) -> Result<Command, ProcessError> {
        let mut cmd = match &self.root_helper {
            Some(helper) => {
                let mut c = Command::new(self.resolve(helper)?);
                c.arg(tool);
                c
            }
            None => Command::new(tool),
        };

        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        Ok(cmd)
    }

    /// Stdout and stderr for a launched command.
    fn launch_stdio(&self, program: &str) -> Result<(Stdio, Stdio), ProcessError> {
        let Some(path) = &self.launch_log else {
            return Ok((Stdio::null(), Stdio::null()));
        };
        let io_error = |source| ProcessError::Io {
            program: program.to_string(),
            source,
        };
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_error)?;
        let stderr = file.try_clone().map_err(io_error)?;
        Ok((Stdio::from(file), Stdio::from(stderr)))
    }
}

impl Default for SystemInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessInvoker for SystemInvoker {
    #[instrument(skip(self, invocation), fields(program = %invocation.program, subcommand = ?invocation.subcommand()))]
    async fn run(&self, invocation: &Invocation) -> Result<CommandResult, ProcessError> {
        invocation.validate()?;
        self.check_privileges(&invocation.program)?;

        let tool = self.resolve(&invocation.program)?;
        let mut cmd = self.build_command(&tool, invocation)?;

        debug!(args = ?invocation.args, timeout = ?invocation.timeout, "Executing command");

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| spawn_error(&invocation.program, e))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let max_output = self.max_output;

        // Drain both pipes concurrently so a chatty stderr cannot stall stdout
        let waited = tokio::time::timeout(invocation.timeout, async {
            let (out, err) = tokio::join!(
                read_capped(stdout, max_output),
                read_capped(stderr, max_output)
            );
            let status = child.wait().await;
            (out, err, status)
        })
        .await;

        let (out, err, status) = match waited {
            Ok(done) => done,
            Err(_) => {
                warn!(
                    timeout = ?invocation.timeout,
                    "Command timed out, terminating"
                );
                terminate(&mut child, self.kill_grace).await;
                return Err(ProcessError::Timeout {
                    program: invocation.program.clone(),
                    timeout: invocation.timeout,
                });
            }
        };

        let io_error = |source| ProcessError::Io {
            program: invocation.program.clone(),
            source,
        };
        let (stdout, stdout_truncated) = out.map_err(io_error)?;
        let (stderr, stderr_truncated) = err.map_err(io_error)?;
        let status = status.map_err(io_error)?;

        let result = CommandResult {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
            duration: start.elapsed(),
            truncated: stdout_truncated || stderr_truncated,
        };

        debug!(
            exit_code = result.exit_code,
            duration_ms = result.duration.as_millis() as u64,
            stdout_bytes = result.stdout.len(),
            truncated = result.truncated,
            "Command completed"
        );

        invocation.check(result)
    }

    #[instrument(skip(self, invocation, window), fields(program = %invocation.program, subcommand = ?invocation.subcommand()))]
    async fn launch(
        &self,
        invocation: &Invocation,
        window: Duration,
    ) -> Result<LaunchOutcome, ProcessError> {
        invocation.validate()?;
        self.check_privileges(&invocation.program)?;

        let tool = self.resolve(&invocation.program)?;
        let mut cmd = self.build_command(&tool, invocation)?;
        let (stdout, stderr) = self.launch_stdio(&invocation.program)?;
        cmd.stdout(stdout).stderr(stderr).kill_on_drop(false);
        // Keep terminal signals aimed at the caller away from the VM
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(args = ?invocation.args, window = ?window, "Launching command");

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| spawn_error(&invocation.program, e))?;
        let pid = child.id();

        let status = match tokio::time::timeout(window, child.wait()).await {
            Ok(status) => status.map_err(|source| ProcessError::Io {
                program: invocation.program.clone(),
                source,
            })?,
            Err(_) => {
                // Not kill_on_drop: the runtime reaps it whenever it exits
                drop(child);
                info!(pid, "Command still running, detached");
                return Ok(LaunchOutcome::Detached { pid });
            }
        };

        let result = CommandResult {
            exit_code: status.code().unwrap_or(-1),
            duration: start.elapsed(),
            ..Default::default()
        };
        debug!(exit_code = result.exit_code, "Launched command exited early");
        invocation.check(result).map(LaunchOutcome::Exited)
    }

    fn resolve(&self, program: &str) -> Result<PathBuf, ProcessError> {
        let not_found = || ProcessError::NotFound {
            program: program.to_string(),
        };

        if program.contains(std::path::MAIN_SEPARATOR) {
            let path = PathBuf::from(program);
            return if is_executable(&path) { Ok(path) } else { Err(not_found()) };
        }

        which::which(program).map_err(|_| not_found())
    }
}

fn spawn_error(program: &str, error: std::io::Error) -> ProcessError {
    match error.kind() {
        std::io::ErrorKind::NotFound => ProcessError::NotFound {
            program: program.to_string(),
        },
        std::io::ErrorKind::PermissionDenied => ProcessError::PermissionDenied {
            program: program.to_string(),
            reason: error.to_string(),
        },
        _ => ProcessError::Io {
            program: program.to_string(),
            source: error,
        },
    }
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Read a pipe to EOF, keeping at most `max_output` bytes.
///
/// Bytes past the limit are still read and discarded so the child never
/// blocks on a full pipe.
async fn read_capped<R>(reader: Option<R>, max_output: usize) -> std::io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok((Vec::new(), false));
    };

    let mut captured = Vec::with_capacity(max_output.min(65536));
    let mut truncated = false;
    let mut buf = vec![0u8; 4096];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let remaining = max_output.saturating_sub(captured.len());
        let to_take = n.min(remaining);
        captured.extend_from_slice(&buf[..to_take]);
        if to_take < n {
            truncated = true;
        }
    }

    Ok((captured, truncated))
}

/// SIGTERM, wait out the grace period, then SIGKILL and reap.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => {
                if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
                    debug!(pid, ?status, "Child exited after SIGTERM");
                    return;
                }
            }
            Err(e) => debug!(pid, error = %e, "Failed to send SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    // kill() sends SIGKILL and waits, so the child is reaped here
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill timed out child");
    }
}
