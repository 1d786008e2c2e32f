use std::path::{Path, PathBuf};
use thiserror::Error;

/// Core error types for jmrun operations
#[derive(Error, Debug)]
pub enum JmrunError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Test {} failed with exit code {code}", .file.display())]
    RunFailure { file: PathBuf, code: i32 },

    #[error("Run of {} was interrupted", .0.display())]
    RunInterrupted(PathBuf),

    #[error("I/O failure while {phase} {}: {source}", .path.display())]
    IoFailure {
        phase: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Report error: {0}")]
    ReportFailure(String),

    #[error("Result scan found {0} problem(s)")]
    ScanProblems(usize),

    #[error("An exit interception boundary is already installed")]
    BoundaryBusy,

    #[error("Engine error: {0}")]
    EngineError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl JmrunError {
    /// Wraps an I/O error with the phase and file it happened in.
    pub fn io(phase: &'static str, path: impl AsRef<Path>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        move |source| JmrunError::IoFailure {
            phase,
            path,
            source,
        }
    }

    pub fn engine_error(message: impl Into<String>) -> Self {
        JmrunError::EngineError(message.into())
    }

    /// Check if this error is an interruption rather than a pass/fail verdict
    pub fn is_interruption(&self) -> bool {
        matches!(self, JmrunError::RunInterrupted(_))
    }

    /// Check if this error must abort the remaining work of a batch
    pub fn is_fatal(&self) -> bool {
        !self.is_interruption()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = JmrunError::RunFailure {
            file: PathBuf::from("login.jmx"),
            code: 3,
        };
        assert_eq!(format!("{error}"), "Test login.jmx failed with exit code 3");

        let error = JmrunError::ConfigurationError("jmeterVersion is not set".to_string());
        assert!(format!("{error}").contains("Configuration error"));
    }

    #[test]
    fn test_io_failure_keeps_context() {
        let make = JmrunError::io("reading log file", "build/jmeter/jmeter.log");
        let error = make(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        let display = format!("{error}");
        assert!(display.contains("reading log file"));
        assert!(display.contains("jmeter.log"));
        assert!(std::error::Error::source(&error).is_some());
    }

    #[test]
    fn test_error_categorization() {
        assert!(JmrunError::RunInterrupted(PathBuf::from("a.jmx")).is_interruption());
        assert!(!JmrunError::RunInterrupted(PathBuf::from("a.jmx")).is_fatal());
        assert!(JmrunError::BoundaryBusy.is_fatal());
        assert!(JmrunError::ScanProblems(2).is_fatal());
    }

    #[test]
    fn test_error_debug_format() {
        let error = JmrunError::EngineError("spawn failed".to_string());
        let debug_str = format!("{error:?}");
        assert!(debug_str.contains("EngineError"));
        assert!(debug_str.contains("spawn failed"));
    }
}
