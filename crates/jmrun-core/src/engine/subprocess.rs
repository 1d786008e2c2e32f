use super::{Engine, EngineExit, EngineRun, Isolation};
use crate::config::JmeterConfig;
use crate::error::JmrunError;
use crate::process::{ProcessHandle, ProcessLifecycle, ProcessManager, ProcessTermination};
use crate::stdio::{EngineStdErr, EngineStdOut};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Runs the engine binary as a child process, one per test plan
pub struct SubprocessEngine<M: ProcessManager + 'static> {
    manager: Arc<M>,
    command: String,
    leading_args: Vec<String>,
    working_dir: Option<PathBuf>,
    env: HashMap<String, String>,
    out: EngineStdOut,
    err: EngineStdErr,
}

impl<M: ProcessManager + 'static> SubprocessEngine<M> {
    pub fn new(manager: Arc<M>, command: impl Into<String>) -> Self {
        Self {
            manager,
            command: command.into(),
            leading_args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            out: EngineStdOut::stdout(),
            err: EngineStdErr::stderr(),
        }
    }

    /// Engine launched the way `config` describes.
    ///
    /// The engine writes its log to [`JmeterConfig::log_file`] so the
    /// completion watcher can follow it, and `search_paths` (see
    /// [`crate::plugins::resolve_search_paths`]) is passed as an engine
    /// property.
    pub fn from_config(manager: Arc<M>, config: &JmeterConfig, search_paths: Option<String>) -> Self {
        let log_file = config.log_file();
        let log_file = std::path::absolute(&log_file).unwrap_or(log_file);

        let mut leading_args = config.engine.args.clone();
        leading_args.push("-j".to_string());
        leading_args.push(log_file.to_string_lossy().into_owned());
        if let Some(paths) = search_paths {
            leading_args.push(format!("-Jsearch_paths={paths}"));
        }

        Self::new(manager, config.engine.command.clone())
            .with_leading_args(leading_args)
            .with_working_dir(config.project_dir.clone())
            .with_env(config.engine.env.clone())
    }

    /// Arguments placed before the run arguments of every launch
    pub fn with_leading_args(mut self, args: Vec<String>) -> Self {
        self.leading_args = args;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Where the engine's stdout and stderr are forwarded
    pub fn with_output(mut self, out: EngineStdOut, err: EngineStdErr) -> Self {
        self.out = out;
        self.err = err;
        self
    }

    pub fn leading_args(&self) -> &[String] {
        &self.leading_args
    }
}

#[async_trait]
impl<M: ProcessManager + 'static> Engine for SubprocessEngine<M> {
    fn name(&self) -> &str {
        &self.command
    }

    fn isolation(&self) -> Isolation {
        Isolation::Subprocess
    }

    async fn launch(&self, args: &[String]) -> Result<Box<dyn EngineRun>, JmrunError> {
        let mut full_args = self.leading_args.clone();
        full_args.extend_from_slice(args);

        let handle = self
            .manager
            .spawn_process(
                &self.command,
                &full_args,
                self.working_dir.as_deref(),
                &self.env,
                self.out.clone(),
                self.err.clone(),
            )
            .await
            .map_err(|e| {
                JmrunError::engine_error(format!("Failed to start {}: {e:#}", self.command))
            })?;

        Ok(Box::new(SubprocessRun {
            manager: self.manager.clone(),
            handle,
            exit: None,
        }))
    }
}

struct SubprocessRun<M: ProcessManager + 'static> {
    manager: Arc<M>,
    handle: Box<dyn ProcessHandle>,
    exit: Option<EngineExit>,
}

#[async_trait]
impl<M: ProcessManager + 'static> EngineRun for SubprocessRun<M> {
    async fn wait(&mut self) -> Result<EngineExit, JmrunError> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }

        let status = self.handle.wait().await?;
        let exit = EngineExit::Code(status.exit_code());
        self.exit = Some(exit);
        Ok(exit)
    }

    async fn stop(&mut self) -> Result<(), JmrunError> {
        if self.exit.is_some() {
            return Ok(());
        }

        let pid = self.handle.get_pid();
        match self.manager.terminate_completely(self.handle.as_mut()).await {
            result if result.is_success() => {
                info!(pid = ?pid, command = self.handle.get_command(), "Engine process stopped");
                Ok(())
            }
            result => {
                warn!(pid = ?pid, ?result, "Engine process could not be stopped");
                Err(JmrunError::engine_error(format!(
                    "Failed to stop engine process: {result:?}"
                )))
            }
        }
    }
}
