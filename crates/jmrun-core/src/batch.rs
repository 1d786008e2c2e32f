//! Runs every discovered test plan and post-processes the results.

use crate::args::ArgumentBuilder;
use crate::collector::ResultCollector;
use crate::config::JmeterConfig;
use crate::discovery::discover;
use crate::engine::Engine;
use crate::error::JmrunError;
use crate::report::{ReportRenderer, renderer_for};
use crate::scanner::{ErrorScanner, ScanFinding};
use crate::supervisor::{RunOutcome, RunSupervisor};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Everything a batch produced
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    /// Result files of completed runs, in run order
    pub results: Vec<PathBuf>,
    /// Rendered reports, in the same order
    pub reports: Vec<PathBuf>,
    pub findings: Vec<ScanFinding>,
    /// Test plan whose run was interrupted, if any
    pub interrupted: Option<PathBuf>,
}

impl BatchSummary {
    pub fn has_problems(&self) -> bool {
        !self.findings.is_empty()
    }

    pub fn was_interrupted(&self) -> bool {
        self.interrupted.is_some()
    }

    /// Turn an interrupted batch into [`JmrunError::RunInterrupted`]
    pub fn into_result(self) -> Result<Self, JmrunError> {
        match self.interrupted {
            Some(file) => Err(JmrunError::RunInterrupted(file)),
            None => Ok(self),
        }
    }
}

/// One invocation of the task: discovery, sequential runs, reports and scan
pub struct Batch {
    config: JmeterConfig,
    supervisor: RunSupervisor,
    renderer: Option<Box<dyn ReportRenderer>>,
    scanner: ErrorScanner,
}

impl Batch {
    pub fn new(config: JmeterConfig, engine: Arc<dyn Engine>) -> Result<Self, JmrunError> {
        config.validate()?;

        let renderer = config.enable_reports.then(|| renderer_for(&config));
        let scanner = ErrorScanner::new(config.ignore_error, config.ignore_failure);
        let supervisor = RunSupervisor::from_config(engine, &config);

        Ok(Self {
            config,
            supervisor,
            renderer,
            scanner,
        })
    }

    /// Replace the configured renderer; ignored when reports are disabled
    pub fn with_renderer(mut self, renderer: Box<dyn ReportRenderer>) -> Self {
        if self.config.enable_reports {
            self.renderer = Some(renderer);
        }
        self
    }

    pub fn config(&self) -> &JmeterConfig {
        &self.config
    }

    /// Run every test plan in discovery order.
    ///
    /// A nonzero engine code aborts the batch with [`JmrunError::RunFailure`].
    /// Cancelling `token` stops the active run and schedules no further
    /// ones; the runs that completed are still reported and scanned.
    pub async fn run(&self, token: &CancellationToken) -> Result<BatchSummary, JmrunError> {
        let test_files = discover(&self.config)?;
        if test_files.is_empty() {
            warn!(src_dir = %self.config.src_dir.display(), "No test plans found");
        }

        for dir in [&self.config.report_dir, &self.config.work_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(JmrunError::io("creating directory", dir))?;
        }

        let property_file = self.config.property_file();
        if !property_file.is_file() {
            warn!(file = %property_file.display(), "Engine property file does not exist");
        }

        let builder = ArgumentBuilder::from_config(&self.config)?;
        let mut collector =
            ResultCollector::new(self.config.report_postfix.clone(), self.config.fail_on_scan_problems);
        let mut interrupted = None;

        for test_file in &test_files {
            if token.is_cancelled() {
                interrupted = Some(test_file.clone());
                break;
            }

            let request = builder.build(test_file)?;
            match self.supervisor.supervise(&request, token).await? {
                RunOutcome::Completed(result) if !result.is_file() => {
                    warn!(
                        test = %test_file.display(),
                        result = %result.display(),
                        "Engine finished without writing a result file, nothing to report"
                    );
                }
                RunOutcome::Completed(result) => {
                    info!(test = %test_file.display(), result = %result.display(), "Test completed");
                    collector.push(result);
                }
                RunOutcome::CompletedWithNonZeroCode(code) => {
                    return Err(JmrunError::RunFailure {
                        file: test_file.clone(),
                        code,
                    });
                }
                RunOutcome::Interrupted => {
                    interrupted = Some(test_file.clone());
                    break;
                }
            }
        }

        if let Some(file) = &interrupted {
            warn!(test = %file.display(), completed = collector.results().len(), "Batch interrupted");
        }

        let collected = collector.finish(self.renderer.as_deref(), &self.scanner).await?;
        Ok(BatchSummary {
            results: collected.results,
            reports: collected.reports,
            findings: collected.findings,
            interrupted,
        })
    }
}
