use anyhow::Result;
use async_trait::async_trait;
use jmrun_core::{
    EngineStdErr, EngineStdOut, ProcessHandle, ProcessId, ProcessLifecycle, ProcessManager,
    ProcessTermination, TerminationResult,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Platform-specific process manager implementations
#[derive(Clone)]
pub enum PlatformProcessManager {
    #[cfg(unix)]
    Unix(Arc<jmrun_unix::UnixProcessManager>),
    #[cfg(windows)]
    Windows(Arc<jmrun_windows::WindowsProcessManager>),
}

impl PlatformProcessManager {
    pub fn platform_name() -> &'static str {
        #[cfg(unix)]
        {
            <jmrun_unix::UnixProcessManagerFactory as jmrun_core::ProcessManagerFactory>::platform_name()
        }

        #[cfg(windows)]
        {
            <jmrun_windows::WindowsProcessManagerFactory as jmrun_core::ProcessManagerFactory>::platform_name()
        }
    }
}

impl Default for PlatformProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessLifecycle for PlatformProcessManager {
    async fn spawn_process(
        &self,
        command: &str,
        args: &[String],
        working_dir: Option<&Path>,
        env: &HashMap<String, String>,
        out: EngineStdOut,
        err: EngineStdErr,
    ) -> Result<Box<dyn ProcessHandle>> {
        match self {
            #[cfg(unix)]
            Self::Unix(manager) => {
                manager
                    .spawn_process(command, args, working_dir, env, out, err)
                    .await
            }
            #[cfg(windows)]
            Self::Windows(manager) => {
                manager
                    .spawn_process(command, args, working_dir, env, out, err)
                    .await
            }
        }
    }
}

#[async_trait]
impl ProcessTermination for PlatformProcessManager {
    async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
        match self {
            #[cfg(unix)]
            Self::Unix(manager) => manager.terminate_gracefully(handle).await,
            #[cfg(windows)]
            Self::Windows(manager) => manager.terminate_gracefully(handle).await,
        }
    }

    async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
        match self {
            #[cfg(unix)]
            Self::Unix(manager) => manager.force_kill(handle).await,
            #[cfg(windows)]
            Self::Windows(manager) => manager.force_kill(handle).await,
        }
    }

    async fn find_child_processes(&self, parent_pid: ProcessId) -> Result<Vec<ProcessId>> {
        match self {
            #[cfg(unix)]
            Self::Unix(manager) => manager.find_child_processes(parent_pid).await,
            #[cfg(windows)]
            Self::Windows(manager) => manager.find_child_processes(parent_pid).await,
        }
    }

    async fn terminate_process_tree(&self, root_pid: ProcessId) -> TerminationResult {
        match self {
            #[cfg(unix)]
            Self::Unix(manager) => manager.terminate_process_tree(root_pid).await,
            #[cfg(windows)]
            Self::Windows(manager) => manager.terminate_process_tree(root_pid).await,
        }
    }

    async fn terminate_process_group(&self, pid: ProcessId) -> TerminationResult {
        match self {
            #[cfg(unix)]
            Self::Unix(manager) => manager.terminate_process_group(pid).await,
            #[cfg(windows)]
            Self::Windows(manager) => manager.terminate_process_group(pid).await,
        }
    }
}

impl ProcessManager for PlatformProcessManager {
    fn new() -> Self {
        #[cfg(unix)]
        {
            debug!("Creating Unix process manager");
            Self::Unix(Arc::new(
                <jmrun_unix::UnixProcessManagerFactory as jmrun_core::ProcessManagerFactory>::create_process_manager(),
            ))
        }

        #[cfg(windows)]
        {
            debug!("Creating Windows process manager");
            Self::Windows(Arc::new(
                <jmrun_windows::WindowsProcessManagerFactory as jmrun_core::ProcessManagerFactory>::create_process_manager(),
            ))
        }

        #[cfg(not(any(unix, windows)))]
        {
            compile_error!("Unsupported platform: only Unix and Windows are currently supported");
        }
    }
}

/// Platform-agnostic factory that selects the appropriate implementation at compile time
pub struct PlatformProcessManagerFactory;

impl jmrun_core::ProcessManagerFactory for PlatformProcessManagerFactory {
    type Manager = PlatformProcessManager;

    fn create_process_manager() -> PlatformProcessManager {
        PlatformProcessManager::new()
    }

    fn platform_name() -> &'static str {
        PlatformProcessManager::platform_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jmrun_core::ProcessManagerFactory;

    #[test]
    fn test_platform_detection() {
        let platform = PlatformProcessManagerFactory::platform_name();
        #[cfg(unix)]
        assert_eq!(platform, "Unix");
        #[cfg(windows)]
        assert_eq!(platform, "Windows");

        let _manager = PlatformProcessManagerFactory::create_process_manager();
    }
}
