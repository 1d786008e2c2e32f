use crate::stdio::{EngineStdErr, EngineStdOut};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;

/// Unique identifier for a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        ProcessId(pid)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How an engine process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStatus(pub ExitStatus);

impl ProcessStatus {
    /// Exit code of the process.
    ///
    /// A process killed by a signal reports `128 + signal` the way shells do.
    pub fn exit_code(&self) -> i32 {
        exit_code_of(&self.0)
    }

    pub fn success(&self) -> bool {
        self.0.success()
    }
}

impl From<ExitStatus> for ProcessStatus {
    fn from(status: ExitStatus) -> Self {
        ProcessStatus(status)
    }
}

fn exit_code_of(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Process was successfully terminated
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    AccessDenied,
    /// Operation failed with specific error message
    Failed(String),
}

impl TerminationResult {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            TerminationResult::Success | TerminationResult::ProcessNotFound
        )
    }
}

/// Starts engine processes
#[async_trait]
pub trait ProcessLifecycle: Send + Sync {
    /// Spawn a new process, forwarding its stdout and stderr to the given sinks
    async fn spawn_process(
        &self,
        command: &str,
        args: &[String],
        working_dir: Option<&Path>,
        env: &HashMap<String, String>,
        out: EngineStdOut,
        err: EngineStdErr,
    ) -> Result<Box<dyn ProcessHandle>>;
}

/// Trait for comprehensive process termination including process trees
#[async_trait]
pub trait ProcessTermination: Send + Sync {
    /// Terminate a single process gracefully (SIGTERM on Unix)
    async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult;

    /// Force kill a single process (SIGKILL on Unix)
    async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult;

    /// Find all child processes of a given process
    async fn find_child_processes(&self, pid: ProcessId) -> Result<Vec<ProcessId>>;

    /// Terminate an entire process tree (parent and all descendants)
    async fn terminate_process_tree(&self, root_pid: ProcessId) -> TerminationResult;

    /// Terminate a process group (Unix only, returns ProcessNotFound on Windows)
    async fn terminate_process_group(&self, pid: ProcessId) -> TerminationResult;

    /// Complete termination strategy: process group -> process tree -> individual process
    async fn terminate_completely(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
        if let Some(pid) = handle.get_pid() {
            if self.terminate_process_group(pid).await == TerminationResult::Success {
                return TerminationResult::Success;
            }

            if self.terminate_process_tree(pid).await == TerminationResult::Success {
                return TerminationResult::Success;
            }
        }

        match self.terminate_gracefully(handle).await {
            TerminationResult::Success => {
                tokio::time::sleep(Duration::from_millis(1000)).await;

                if handle.is_running().await {
                    self.force_kill(handle).await
                } else {
                    TerminationResult::Success
                }
            }
            TerminationResult::ProcessNotFound => TerminationResult::Success,
            _ => self.force_kill(handle).await,
        }
    }
}

/// Trait representing a handle to a running process
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID (None if process has exited)
    fn get_pid(&self) -> Option<ProcessId>;

    /// Get the command that started this process
    fn get_command(&self) -> &str;

    /// Check if the process is still running (non-blocking)
    async fn is_running(&self) -> bool;

    /// Wait for the process to exit. Cancel safe, and returns the same
    /// status again once the process is gone.
    async fn wait(&mut self) -> Result<ProcessStatus>;

    /// Kill the process (platform-specific implementation)
    async fn kill(&mut self) -> Result<()>;
}

/// High-level process manager trait that combines lifecycle and termination
pub trait ProcessManager: ProcessLifecycle + ProcessTermination {
    /// Create a new process manager instance
    fn new() -> Self
    where
        Self: Sized;
}

/// Factory trait for creating platform-specific process managers
pub trait ProcessManagerFactory {
    /// The type of process manager this factory creates
    type Manager: ProcessManager + 'static;

    /// Create a process manager for the current platform
    fn create_process_manager() -> Self::Manager;

    /// Get the platform name for logging and debugging
    fn platform_name() -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_termination_result_success() {
        assert!(TerminationResult::Success.is_success());
        assert!(TerminationResult::ProcessNotFound.is_success());
        assert!(!TerminationResult::AccessDenied.is_success());
        assert!(!TerminationResult::Failed("nope".to_string()).is_success());
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_code_from_status() {
        use std::os::unix::process::ExitStatusExt;

        let status = ProcessStatus::from(ExitStatus::from_raw(3 << 8));
        assert_eq!(status.exit_code(), 3);
        assert!(!status.success());

        // Raw wait status 9 means "killed by SIGKILL"
        let status = ProcessStatus::from(ExitStatus::from_raw(9));
        assert_eq!(status.exit_code(), 137);
    }
}
