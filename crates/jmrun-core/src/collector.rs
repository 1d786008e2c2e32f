//! Result Collector: gathers result files and post-processes them.

use crate::error::JmrunError;
use crate::report::{ReportRenderer, report_file_name};
use crate::scanner::{ErrorScanner, ScanFinding};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// What [`ResultCollector::finish`] produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectedResults {
    pub results: Vec<PathBuf>,
    pub reports: Vec<PathBuf>,
    pub findings: Vec<ScanFinding>,
}

/// Result files of completed runs, in run order
#[derive(Debug, Clone)]
pub struct ResultCollector {
    results: Vec<PathBuf>,
    report_postfix: String,
    fail_on_scan_problems: bool,
}

impl ResultCollector {
    pub fn new(report_postfix: impl Into<String>, fail_on_scan_problems: bool) -> Self {
        Self {
            results: Vec::new(),
            report_postfix: report_postfix.into(),
            fail_on_scan_problems,
        }
    }

    pub fn push(&mut self, result_file: impl Into<PathBuf>) {
        self.results.push(result_file.into());
    }

    pub fn results(&self) -> &[PathBuf] {
        &self.results
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn report_file(&self, result_file: &Path) -> PathBuf {
        report_file_name(result_file, &self.report_postfix)
    }

    /// Render a report per result when `renderer` is set, then scan every
    /// result.
    ///
    /// Scan findings are logged as a warning, or fail with
    /// [`JmrunError::ScanProblems`] when the collector was built to do so.
    pub async fn finish(
        self,
        renderer: Option<&dyn ReportRenderer>,
        scanner: &ErrorScanner,
    ) -> Result<CollectedResults, JmrunError> {
        let mut reports = Vec::new();
        if let Some(renderer) = renderer {
            info!(renderer = renderer.name(), results = self.results.len(), "Building load test reports");
            for result in &self.results {
                let output = self.report_file(result);
                info!(result = %result.display(), report = %output.display(), "Transforming result");
                renderer.render(result, &output).await?;
                reports.push(output);
            }
        }

        let mut findings = Vec::new();
        for result in &self.results {
            let file_findings = scanner.scan(result).await?;
            if !file_findings.is_empty() {
                warn!(
                    result = %result.display(),
                    problems = file_findings.len(),
                    "There were test errors. See the jmeter logs for details"
                );
            }
            findings.extend(file_findings);
        }

        if self.fail_on_scan_problems && !findings.is_empty() {
            return Err(JmrunError::ScanProblems(findings.len()));
        }

        Ok(CollectedResults {
            results: self.results,
            reports,
            findings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::HtmlReportRenderer;
    use crate::scanner::FindingKind;
    use tempfile::TempDir;

    const CLEAN: &str = "<testResults>\n<httpSample t=\"10\" s=\"true\" lb=\"home\"/>\n</testResults>\n";
    const BROKEN: &str = "<testResults>\n<assertionResult><error>true</error></assertionResult>\n</testResults>\n";

    fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn test_reports_follow_result_order() {
        let dir = TempDir::new().unwrap();
        let first = write(&dir, "b.jmx-20240307.xml", CLEAN);
        let second = write(&dir, "a.jmx-20240307.xml", CLEAN);

        let mut collector = ResultCollector::new("-report.html", false);
        collector.push(&first);
        collector.push(&second);

        let collected = collector
            .finish(Some(&HtmlReportRenderer), &ErrorScanner::default())
            .await
            .unwrap();

        assert_eq!(collected.results, vec![first, second]);
        assert_eq!(
            collected.reports,
            vec![
                dir.path().join("b.jmx-20240307-report.html"),
                dir.path().join("a.jmx-20240307-report.html"),
            ]
        );
        assert!(collected.reports.iter().all(|r| r.exists()));
        assert!(collected.findings.is_empty());
    }

    #[tokio::test]
    async fn test_findings_are_warnings_by_default() {
        let dir = TempDir::new().unwrap();
        let broken = write(&dir, "broken.xml", BROKEN);

        let mut collector = ResultCollector::new("-report.html", false);
        collector.push(&broken);
        let collected = collector.finish(None, &ErrorScanner::default()).await.unwrap();

        assert!(collected.reports.is_empty());
        assert_eq!(collected.findings.len(), 1);
        assert_eq!(collected.findings[0].kind, FindingKind::Error);
    }

    #[tokio::test]
    async fn test_findings_can_fail_the_batch() {
        let dir = TempDir::new().unwrap();
        let broken = write(&dir, "broken.xml", BROKEN);

        let mut collector = ResultCollector::new("-report.html", true);
        collector.push(&broken);
        let result = collector.finish(None, &ErrorScanner::default()).await;

        assert!(matches!(result, Err(JmrunError::ScanProblems(1))));
    }
}
