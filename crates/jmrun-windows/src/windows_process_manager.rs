#[cfg(windows)]
mod windows_impl {
    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use jmrun_core::{
        EngineStdErr, EngineStdOut, ProcessHandle, ProcessId, ProcessLifecycle, ProcessManager,
        ProcessStatus, ProcessTermination, TerminationResult, forward_lines,
    };
    use std::collections::HashMap;
    use std::path::Path;
    use std::process::Stdio;
    use std::time::Duration;
    use sysinfo::System;
    use tokio::process::{Child, Command};
    use tracing::{debug, info, warn};

    /// CREATE_NO_WINDOW: no console window pops up for the engine
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;

    /// Windows-specific process handle implementation
    pub struct WindowsProcessHandle {
        child: Child,
        command: String,
    }

    impl WindowsProcessHandle {
        pub fn new(child: Child, command: String) -> Self {
            Self { child, command }
        }
    }

    fn process_exists(pid: u32) -> bool {
        let mut system = System::new();
        system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::All,
            true,
            sysinfo::ProcessRefreshKind::default(),
        );
        system.processes().keys().any(|p| p.as_u32() == pid)
    }

    #[async_trait]
    impl ProcessHandle for WindowsProcessHandle {
        fn get_pid(&self) -> Option<ProcessId> {
            self.child.id().map(ProcessId::from)
        }

        fn get_command(&self) -> &str {
            &self.command
        }

        async fn is_running(&self) -> bool {
            match self.get_pid() {
                Some(pid) => process_exists(pid.0),
                None => {
                    debug!("Engine process handle has no PID, process has exited");
                    false
                }
            }
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

    /// Windows process manager built on `taskkill`
    pub struct WindowsProcessManager {
        system: std::sync::Mutex<System>,
    }

    impl Default for WindowsProcessManager {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ProcessLifecycle for WindowsProcessManager {
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
                .kill_on_drop(true)
                .creation_flags(CREATE_NO_WINDOW);

            if let Some(dir) = working_dir {
                cmd.current_dir(dir);
            }

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

            Ok(Box::new(WindowsProcessHandle::new(child, command.to_string())))
        }
    }

    #[async_trait]
    impl ProcessTermination for WindowsProcessManager {
        async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
            let Some(pid) = handle.get_pid() else {
                return TerminationResult::ProcessNotFound;
            };

            match self.taskkill(pid.0, false).await {
                Ok(true) => {
                    info!(pid = pid.0, "Sent graceful termination to process");
                    TerminationResult::Success
                }
                Ok(false) => TerminationResult::ProcessNotFound,
                Err(e) => {
                    warn!(pid = pid.0, error = %e, "Failed to gracefully terminate process");
                    TerminationResult::Failed(format!("Graceful termination failed: {e}"))
                }
            }
        }

        async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
            let Some(pid) = handle.get_pid() else {
                return TerminationResult::ProcessNotFound;
            };

            match self.taskkill(pid.0, true).await {
                Ok(true) => {
                    info!(pid = pid.0, "Force killed process");
                    if let Err(e) = handle.kill().await {
                        debug!(error = %e, "Handle kill cleanup failed");
                    }
                    TerminationResult::Success
                }
                Ok(false) => TerminationResult::ProcessNotFound,
                Err(e) => {
                    warn!(pid = pid.0, error = %e, "Failed to force kill process");
                    TerminationResult::Failed(format!("Force kill failed: {e}"))
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

            match self.taskkill_tree(root_pid.0).await {
                Ok(true) => TerminationResult::Success,
                Ok(false) => TerminationResult::ProcessNotFound,
                Err(e) => {
                    warn!(root_pid = root_pid.0, error = %e, "taskkill /T failed, walking the tree");

                    let children = match self.find_child_processes(root_pid).await {
                        Ok(children) => children,
                        Err(e) => {
                            return TerminationResult::Failed(format!(
                                "Failed to enumerate children: {e}"
                            ));
                        }
                    };

                    for child_pid in children.iter().rev() {
                        match self.terminate_single_process(*child_pid).await {
                            TerminationResult::Success | TerminationResult::ProcessNotFound => {}
                            result => {
                                warn!(pid = child_pid.0, ?result, "Failed to terminate child process");
                            }
                        }
                    }

                    self.terminate_single_process(root_pid).await
                }
            }
        }

        async fn terminate_process_group(&self, _pid: ProcessId) -> TerminationResult {
            // No Unix-style process groups on Windows
            TerminationResult::ProcessNotFound
        }
    }

    impl WindowsProcessManager {
        async fn taskkill(&self, pid: u32, force: bool) -> Result<bool> {
            let pid_string = pid.to_string();
            let mut args = vec!["/PID", pid_string.as_str()];
            if force {
                args.push("/F");
            }

            let output = Command::new("taskkill").args(&args).output().await?;
            Ok(output.status.success())
        }

        async fn taskkill_tree(&self, pid: u32) -> Result<bool> {
            let output = Command::new("taskkill")
                .args(["/F", "/T", "/PID", &pid.to_string()])
                .output()
                .await?;
            Ok(output.status.success())
        }

        async fn terminate_single_process(&self, pid: ProcessId) -> TerminationResult {
            match self.taskkill(pid.0, false).await {
                Ok(true) => {
                    tokio::time::sleep(Duration::from_millis(1000)).await;
                    if !process_exists(pid.0) {
                        return TerminationResult::Success;
                    }
                    match self.taskkill(pid.0, true).await {
                        Ok(_) => TerminationResult::Success,
                        Err(e) => TerminationResult::Failed(format!("Force kill failed: {e}")),
                    }
                }
                Ok(false) => TerminationResult::Success,
                Err(e) => TerminationResult::Failed(format!("Graceful termination failed: {e}")),
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

    impl ProcessManager for WindowsProcessManager {
        fn new() -> Self {
            debug!("Initializing Windows process manager");
            Self {
                system: std::sync::Mutex::new(System::new()),
            }
        }
    }
}

#[cfg(windows)]
pub use windows_impl::{WindowsProcessHandle, WindowsProcessManager};

// Stubs so the crate still builds on other platforms
#[cfg(not(windows))]
pub struct WindowsProcessHandle;

#[cfg(not(windows))]
pub struct WindowsProcessManager;

#[cfg(not(windows))]
impl WindowsProcessManager {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(windows))]
impl Default for WindowsProcessManager {
    fn default() -> Self {
        Self::new()
    }
}
