use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::{DiskError, Result};

/// Default upper bound for a single external tool invocation.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs the external utilities (`setcd`, `isoinfo`, `wodim`) that device-backed media are probed
/// with.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` and return everything it printed (stdout followed by stderr).
    ///
    /// Failing to spawn, a non-zero exit status and running past the timeout are all reported as
    /// [`DiskError::DeviceQueryFailed`].
    async fn run(&self, program: &str, args: &[&str]) -> Result<String>;
}

/// [`CommandRunner`] backed by real child processes.
#[derive(Debug, Clone)]
pub struct SystemCommandRunner {
    timeout: Duration,
}

impl SystemCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for SystemCommandRunner {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL_TIMEOUT)
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(DiskError::query_failed(program, format!("cannot execute: {err}")))
            }
            Err(_elapsed) => {
                tracing::warn!(program, timeout_ms = self.timeout.as_millis() as u64, "tool timed out");
                return Err(DiskError::query_failed(
                    program,
                    format!("timed out after {:?}", self.timeout),
                ));
            }
        };

        if !output.status.success() {
            return Err(DiskError::query_failed(
                program,
                format!("exited with {}", output.status),
            ));
        }

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }
}
