//! Error scanner for engine result files.

use crate::error::JmrunError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

/// Marks an assertion that reported an error
pub const ERROR_MARKER: &str = "<error>true</error>";

/// Marks an assertion that failed
pub const FAILURE_MARKER: &str = "<failure>true</failure>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FindingKind {
    Failure,
    Error,
}

/// One marker found in a result file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanFinding {
    pub result_file: PathBuf,
    pub kind: FindingKind,
    /// 1-based
    pub line: usize,
}

/// Scans result files for failure and error markers
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorScanner {
    ignore_error: bool,
    ignore_failure: bool,
}

impl ErrorScanner {
    pub fn new(ignore_error: bool, ignore_failure: bool) -> Self {
        Self {
            ignore_error,
            ignore_failure,
        }
    }

    /// Every marker in `result_file` that the policy does not ignore
    pub async fn scan(&self, result_file: &Path) -> Result<Vec<ScanFinding>, JmrunError> {
        let file = tokio::fs::File::open(result_file)
            .await
            .map_err(JmrunError::io("opening result file", result_file))?;
        let mut lines = BufReader::new(file).lines();

        let mut findings = Vec::new();
        let mut number = 0;
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(JmrunError::io("reading result file", result_file))?
        {
            number += 1;
            if let Some(kind) = self.classify(&line) {
                findings.push(ScanFinding {
                    result_file: result_file.to_path_buf(),
                    kind,
                    line: number,
                });
            }
        }

        debug!(result = %result_file.display(), findings = findings.len(), "Scanned result file");
        Ok(findings)
    }

    /// True if `result_file` contains anything the policy does not ignore
    pub async fn scan_for_problems(&self, result_file: &Path) -> Result<bool, JmrunError> {
        let findings = self.scan(result_file).await?;
        for finding in &findings {
            warn!(
                result = %finding.result_file.display(),
                line = finding.line,
                kind = ?finding.kind,
                "Problem in result file"
            );
        }
        Ok(!findings.is_empty())
    }

    fn classify(&self, line: &str) -> Option<FindingKind> {
        if !self.ignore_failure && line.contains(FAILURE_MARKER) {
            Some(FindingKind::Failure)
        } else if !self.ignore_error && line.contains(ERROR_MARKER) {
            Some(FindingKind::Error)
        } else {
            None
        }
    }
}
