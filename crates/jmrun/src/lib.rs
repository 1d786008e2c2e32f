//! Run load test plans with the engine as part of a build.
//!
//! [`JmeterTask`] is the entry point: it discovers test plans, runs each one
//! in its own engine process, waits for completion, and collects, reports and
//! scans the results.

mod platform;

pub use platform::{PlatformProcessManager, PlatformProcessManagerFactory};

use jmrun_core::ProcessManagerFactory;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Subprocess engine for `config` on the current platform.
///
/// Resolves the plugin search path from `engine.libDir` when one is set.
pub fn create_engine(
    config: &JmeterConfig,
    out: EngineStdOut,
    err: EngineStdErr,
) -> Result<Arc<dyn Engine>, JmrunError> {
    config.validate()?;
    let version = config.jmeter_version.as_deref().unwrap_or_default();
    let search_paths =
        resolve_search_paths(config.engine.lib_dir.as_deref(), version, &config.plugin_jars)?;

    let manager = Arc::new(PlatformProcessManagerFactory::create_process_manager());
    info!(
        platform = PlatformProcessManagerFactory::platform_name(),
        command = %config.engine.command,
        "Using engine subprocess"
    );

    let engine = SubprocessEngine::from_config(manager, config, search_paths).with_output(out, err);
    Ok(Arc::new(engine))
}

/// One invocation of the load test task
pub struct JmeterTask {
    config: JmeterConfig,
    engine: Option<Arc<dyn Engine>>,
    renderer: Option<Box<dyn ReportRenderer>>,
    out: EngineStdOut,
    err: EngineStdErr,
}

impl JmeterTask {
    pub fn new(config: JmeterConfig) -> Self {
        Self {
            config,
            engine: None,
            renderer: None,
            out: EngineStdOut::stdout(),
            err: EngineStdErr::stderr(),
        }
    }

    /// Run plans on `engine` instead of the engine binary from the config
    pub fn with_engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_renderer(mut self, renderer: Box<dyn ReportRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Where the engine binary's output goes; defaults to the host's streams
    pub fn with_output(mut self, out: EngineStdOut, err: EngineStdErr) -> Self {
        self.out = out;
        self.err = err;
        self
    }

    pub fn config(&self) -> &JmeterConfig {
        &self.config
    }

    /// Run every test plan until done or until `token` is cancelled
    pub async fn execute(self, token: &CancellationToken) -> Result<BatchSummary, JmrunError> {
        let engine = match self.engine {
            Some(engine) => engine,
            None => create_engine(&self.config, self.out, self.err)?,
        };

        let mut batch = Batch::new(self.config, engine)?;
        if let Some(renderer) = self.renderer {
            batch = batch.with_renderer(renderer);
        }

        let summary = batch.run(token).await?;
        info!(
            results = summary.results.len(),
            reports = summary.reports.len(),
            findings = summary.findings.len(),
            "Load test task finished"
        );
        Ok(summary)
    }
}

// Re-export core functionality
pub use jmrun_core::*;
