//! Process invocation abstraction.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ProcessError;
use crate::types::{CommandResult, LaunchOutcome};

/// Timeout applied when an invocation does not set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One command line to execute.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Program path or bare name
    pub program: String,
    /// Arguments (the first is usually the tool subcommand)
    pub args: Vec<String>,
    /// Upper bound on wall-clock time
    pub timeout: Duration,
    /// Treat a nonzero exit as a result instead of an error
    pub tolerate_nonzero: bool,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            tolerate_nonzero: false,
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

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn tolerate_nonzero(mut self) -> Self {
        self.tolerate_nonzero = true;
        self
    }

    /// The tool subcommand, if any.
    pub fn subcommand(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    /// Check the invocation is well formed.
    pub fn validate(&self) -> Result<(), ProcessError> {
        if self.program.is_empty() {
            return Err(ProcessError::InvalidInvocation("program must not be empty".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(ProcessError::InvalidInvocation(format!(
                "timeout for {} must be positive",
                self.program
            )));
        }
        Ok(())
    }

    /// Map a finished run onto the exit-code contract.
    pub fn check(&self, result: CommandResult) -> Result<CommandResult, ProcessError> {
        if result.success() || self.tolerate_nonzero {
            return Ok(result);
        }
        Err(ProcessError::NonZeroExit {
            program: self.program.clone(),
            code: result.exit_code,
            stderr: result.stderr_lossy(),
        })
    }
}

/// Executes external commands.
///
/// Implementations spawn exactly one process per `run` call and must never
/// leave it behind: on every exit path, including timeout, the child is
/// terminated and reaped before `run` returns. `launch` is the one exception.
#[async_trait]
pub trait ProcessInvoker: Send + Sync {
    /// Run the invocation to completion.
    async fn run(&self, invocation: &Invocation) -> Result<CommandResult, ProcessError>;

    /// Start a command that keeps running as the VM itself.
    ///
    /// Only an exit within `window` is reported; a process still alive then
    /// is left running and never killed. Invokers without background
    /// processes run the command to completion.
    async fn launch(
        &self,
        invocation: &Invocation,
        window: Duration,
    ) -> Result<LaunchOutcome, ProcessError> {
        let _ = window;
        self.run(invocation).await.map(LaunchOutcome::Exited)
    }

    /// Resolve a program to the executable that would run.
    fn resolve(&self, program: &str) -> Result<PathBuf, ProcessError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_timeout_rejected() {
        let invocation = Invocation::new("lkvm").timeout(Duration::ZERO);
        assert!(matches!(
            invocation.validate(),
            Err(ProcessError::InvalidInvocation(_))
        ));
        assert!(Invocation::new("lkvm").validate().is_ok());
    }

    #[test]
    fn test_check_nonzero_exit() {
        let failed = CommandResult {
            exit_code: 2,
            stderr: b"no such instance\n".to_vec(),
            ..Default::default()
        };

        let strict = Invocation::new("lkvm").arg("stop");
        match strict.check(failed.clone()) {
            Err(ProcessError::NonZeroExit { code, stderr, .. }) => {
                assert_eq!(code, 2);
                assert_eq!(stderr, "no such instance");
            }
            other => panic!("expected NonZeroExit, got {:?}", other),
        }

        let tolerant = Invocation::new("lkvm").arg("stop").tolerate_nonzero();
        assert_eq!(tolerant.check(failed).unwrap().exit_code, 2);
    }
}
