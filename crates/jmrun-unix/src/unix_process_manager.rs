use anyhow::{Context, Result};
use async_trait::async_trait;
use jmrun_core::{
    EngineStdErr, EngineStdOut, ProcessHandle, ProcessId, ProcessLifecycle, ProcessManager,
    ProcessStatus, ProcessTermination, TerminationResult,
};
use std::collections::HashMap;
use std::path::Path;

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use jmrun_core::forward_lines;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    use std::process::Stdio;
    use std::time::Duration;
    use sysinfo::System;
    use tokio::process::{Child, Command};
    use tracing::{debug, info, warn};

    /// Unix-specific process handle implementation
    pub struct UnixProcessHandle {
        child: Child,
        command: String,
    }

    impl UnixProcessHandle {
        pub fn new(child: Child, command: String) -> Self {
            Self { child, command }
        }
    }

    #[async_trait]
    impl ProcessHandle for UnixProcessHandle {
        fn get_pid(&self) -> Option<ProcessId> {
            self.child.id().map(ProcessId::from)
        }

        fn get_command(&self) -> &str {
            &self.command
        }

        async fn is_running(&self) -> bool {
            let Some(pid) = self.get_pid() else {
                debug!("Engine process handle has no PID, process has exited");
                return false;
            };

            // Signal 0 only checks that the process exists
            let running = signal::kill(NixPid::from_raw(pid.0 as i32), None).is_ok();
            debug!(pid = pid.0, running, "Checked engine process");
            running
        }

        async fn wait(&mut self) -> Result<ProcessStatus> {
            let status = self
                .child
                .wait()
                .await
                .with_context(|| format!("Failed to wait for {}", self.command))?;
            Ok(ProcessStatus::from(status))
        }

        async fn kill(&mut self) -> Result<()> {
            self.child
                .kill()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to kill process: {}", e))
        }
    }

    /// Unix process manager: one process group per engine run, with a
    /// process tree walk as fallback
    pub struct UnixProcessManager {
        system: std::sync::Mutex<System>,
    }

    impl Default for UnixProcessManager {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ProcessLifecycle for UnixProcessManager {
        async fn spawn_process(
            &self,
            command: &str,
            args: &[String],
            working_dir: Option<&Path>,
            env: &HashMap<String, String>,
            out: EngineStdOut,
            err: EngineStdErr,
        ) -> Result<Box<dyn ProcessHandle>> {
            let mut cmd = Command::new(command);
            cmd.args(args)
                .envs(env)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            if let Some(dir) = working_dir {
                cmd.current_dir(dir);
            }

            // Own process group, so the whole engine tree can be signalled
            // and a Ctrl-C on the terminal reaches only the host
            cmd.process_group(0);

            let mut child = cmd
                .spawn()
                .with_context(|| format!("Failed to spawn {command}"))?;

            if let Some(stdout) = child.stdout.take() {
                forward_lines(stdout, out);
            }
            if let Some(stderr) = child.stderr.take() {
                forward_lines(stderr, err);
            }

            if let Some(pid) = child.id() {
                info!(pid, command, args = ?args, "Spawned engine process");
            }

            Ok(Box::new(UnixProcessHandle::new(child, command.to_string())))
        }
    }

    #[async_trait]
    impl ProcessTermination for UnixProcessManager {
        async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
            let Some(pid) = handle.get_pid() else {
                return TerminationResult::ProcessNotFound;
            };

            match signal::kill(NixPid::from_raw(pid.0 as i32), Signal::SIGTERM) {
                Ok(()) => {
                    info!(pid = pid.0, "Sent SIGTERM to process");
                    TerminationResult::Success
                }
                Err(nix::errno::Errno::ESRCH) => {
                    info!(pid = pid.0, "Process not found (already terminated)");
                    TerminationResult::ProcessNotFound
                }
                Err(nix::errno::Errno::EPERM) => {
                    warn!(pid = pid.0, "Permission denied to terminate process");
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!(pid = pid.0, error = %e, "Failed to send SIGTERM to process");
                    TerminationResult::Failed(format!("SIGTERM failed: {e}"))
                }
            }
        }

        async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
            let Some(pid) = handle.get_pid() else {
                return TerminationResult::ProcessNotFound;
            };

            match signal::kill(NixPid::from_raw(pid.0 as i32), Signal::SIGKILL) {
                Ok(()) => {
                    info!(pid = pid.0, "Sent SIGKILL to process");
                    // Reap the child through its handle
                    if let Err(e) = handle.kill().await {
                        debug!(pid = pid.0, error = %e, "Handle kill cleanup failed");
                    }
                    TerminationResult::Success
                }
                Err(nix::errno::Errno::ESRCH) => {
                    info!(pid = pid.0, "Process not found (already terminated)");
                    TerminationResult::ProcessNotFound
                }
                Err(nix::errno::Errno::EPERM) => {
                    warn!(pid = pid.0, "Permission denied to kill process");
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!(pid = pid.0, error = %e, "Failed to send SIGKILL to process");
                    TerminationResult::Failed(format!("SIGKILL failed: {e}"))
                }
            }
        }

        async fn find_child_processes(&self, parent_pid: ProcessId) -> Result<Vec<ProcessId>> {
            let mut system = self
                .system
                .lock()
                .map_err(|_| anyhow::anyhow!("Process table lock poisoned"))?;
            system.refresh_processes_specifics(
                sysinfo::ProcessesToUpdate::All,
                true,
                sysinfo::ProcessRefreshKind::default(),
            );

            let mut children = Vec::new();
            Self::find_children_recursive(&system, parent_pid.0, &mut children);

            Ok(children.into_iter().map(ProcessId::from).collect())
        }

        async fn terminate_process_tree(&self, root_pid: ProcessId) -> TerminationResult {
            info!(root_pid = root_pid.0, "Terminating engine process tree");

            let children = match self.find_child_processes(root_pid).await {
                Ok(children) => children,
                Err(e) => {
                    warn!(root_pid = root_pid.0, error = %e, "Failed to find child processes");
                    return TerminationResult::Failed(format!("Failed to enumerate children: {e}"));
                }
            };

            if !children.is_empty() {
                info!(count = children.len(), "Found child processes to terminate");

                // Deepest descendants first
                for child_pid in children.iter().rev() {
                    match self.terminate_single_process(*child_pid).await {
                        TerminationResult::Success | TerminationResult::ProcessNotFound => {}
                        result => {
                            warn!(pid = child_pid.0, ?result, "Failed to terminate child process");
                        }
                    }
                }
            }

            self.terminate_single_process(root_pid).await
        }

        async fn terminate_process_group(&self, pid: ProcessId) -> TerminationResult {
            let pgid = NixPid::from_raw(pid.0 as i32);

            match signal::killpg(pgid, Signal::SIGTERM) {
                Ok(()) => {
                    info!(pgid = pid.0, "Sent SIGTERM to process group");

                    // Grace period for the engine to flush its results
                    tokio::time::sleep(Duration::from_millis(2000)).await;

                    match signal::killpg(pgid, Signal::SIGKILL) {
                        Ok(()) => {
                            info!(pgid = pid.0, "Sent SIGKILL to process group");
                            TerminationResult::Success
                        }
                        Err(nix::errno::Errno::ESRCH) => {
                            debug!(pgid = pid.0, "Process group already terminated");
                            TerminationResult::Success
                        }
                        Err(e) => {
                            warn!(pgid = pid.0, error = %e, "Failed to send SIGKILL to process group");
                            TerminationResult::Failed(format!(
                                "SIGKILL to process group failed: {e}"
                            ))
                        }
                    }
                }
                Err(nix::errno::Errno::ESRCH) => {
                    info!(pgid = pid.0, "Process group not found (already terminated)");
                    TerminationResult::Success
                }
                Err(nix::errno::Errno::EPERM) => {
                    warn!(pgid = pid.0, "Permission denied to terminate process group");
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!(pgid = pid.0, error = %e, "Failed to send SIGTERM to process group");
                    TerminationResult::Failed(format!("SIGTERM to process group failed: {e}"))
                }
            }
        }
    }

    impl UnixProcessManager {
        /// Terminate a single process by PID with escalation
        async fn terminate_single_process(&self, pid: ProcessId) -> TerminationResult {
            let nix_pid = NixPid::from_raw(pid.0 as i32);

            match signal::kill(nix_pid, Signal::SIGTERM) {
                Ok(()) => {
                    info!(pid = pid.0, "Sent SIGTERM to process");

                    tokio::time::sleep(Duration::from_millis(500)).await;

                    match signal::kill(nix_pid, Signal::SIGKILL) {
                        Ok(()) => {
                            info!(pid = pid.0, "Sent SIGKILL to process");
                            TerminationResult::Success
                        }
                        Err(nix::errno::Errno::ESRCH) => TerminationResult::Success,
                        Err(e) => {
                            warn!(pid = pid.0, error = %e, "Failed to kill process");
                            TerminationResult::Failed(format!("SIGKILL failed: {e}"))
                        }
                    }
                }
                Err(nix::errno::Errno::ESRCH) => {
                    info!(pid = pid.0, "Process not found (already terminated)");
                    TerminationResult::Success
                }
                Err(nix::errno::Errno::EPERM) => {
                    warn!(pid = pid.0, "Permission denied to terminate process");
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!(pid = pid.0, error = %e, "Failed to send SIGTERM to process");
                    TerminationResult::Failed(format!("SIGTERM failed: {e}"))
                }
            }
        }

        /// Descendants of `parent_pid`, deepest first
        fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
            for (pid, process) in system.processes() {
                if process.parent().map(|p| p.as_u32()) == Some(parent_pid) {
                    let child_pid = pid.as_u32();
                    Self::find_children_recursive(system, child_pid, result);
                    result.push(child_pid);
                }
            }
        }
    }

    impl ProcessManager for UnixProcessManager {
        fn new() -> Self {
            debug!("Initializing Unix process manager");
            Self {
                system: std::sync::Mutex::new(System::new()),
            }
        }
    }
}

#[cfg(unix)]
pub use unix_impl::{UnixProcessHandle, UnixProcessManager};

// Stubs so the crate still builds on other platforms
#[cfg(not(unix))]
pub struct UnixProcessHandle;

#[cfg(not(unix))]
pub struct UnixProcessManager;

#[cfg(not(unix))]
impl UnixProcessManager {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(unix))]
impl Default for UnixProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_exit_code_and_output_are_forwarded() {
        let manager = UnixProcessManager::new();
        let (writer, mut reader) = tokio::io::duplex(4096);
        let out = EngineStdOut::new(Box::new(writer));

        let mut handle = manager
            .spawn_process(
                "sh",
                &sh("echo \"$GREETING\"; exit 3"),
                None,
                &HashMap::from([("GREETING".to_string(), "hello engine".to_string())]),
                out,
                EngineStdErr::sink(),
            )
            .await
            .unwrap();

        let status = handle.wait().await.unwrap();
        assert_eq!(status.exit_code(), 3);
        assert_eq!(handle.wait().await.unwrap().exit_code(), 3);

        let mut captured = String::new();
        reader.read_to_string(&mut captured).await.unwrap();
        assert_eq!(captured, "hello engine\n");
    }

    #[tokio::test]
    async fn test_working_dir() {
        let dir = std::env::temp_dir().canonicalize().unwrap();
        let manager = UnixProcessManager::new();
        let (writer, mut reader) = tokio::io::duplex(4096);

        let mut handle = manager
            .spawn_process(
                "sh",
                &sh("pwd"),
                Some(&dir),
                &HashMap::new(),
                EngineStdOut::new(Box::new(writer)),
                EngineStdErr::sink(),
            )
            .await
            .unwrap();
        handle.wait().await.unwrap();

        let mut captured = String::new();
        reader.read_to_string(&mut captured).await.unwrap();
        assert_eq!(Path::new(captured.trim()), dir.as_path());
    }

    #[tokio::test]
    async fn test_terminate_completely_stops_process_group() {
        let manager = UnixProcessManager::new();
        let mut handle = manager
            .spawn_process(
                "sh",
                &sh("sleep 30 & sleep 30"),
                None,
                &HashMap::new(),
                EngineStdOut::sink(),
                EngineStdErr::sink(),
            )
            .await
            .unwrap();
        assert!(handle.is_running().await);

        let result = manager.terminate_completely(handle.as_mut()).await;
        assert_eq!(result, TerminationResult::Success);

        let status = handle.wait().await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let manager = UnixProcessManager::new();
        let result = manager
            .spawn_process(
                "/nonexistent/engine",
                &[],
                None,
                &HashMap::new(),
                EngineStdOut::sink(),
                EngineStdErr::sink(),
            )
            .await;
        assert!(result.is_err());
    }
}
