//! Argument Builder: turns one test plan into an engine invocation.

use crate::config::JmeterConfig;
use crate::error::JmrunError;
use chrono::{Local, NaiveDate};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Date stamp appended to result file names
pub const RESULT_DATE_FORMAT: &str = "%Y%m%d";

/// Everything the engine needs for one test plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    test_file: PathBuf,
    result_file: PathBuf,
    working_dir: PathBuf,
    property_file: PathBuf,
    extra_properties: Vec<String>,
    remote: bool,
}

impl RunRequest {
    pub fn test_file(&self) -> &Path {
        &self.test_file
    }

    pub fn result_file(&self) -> &Path {
        &self.result_file
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn property_file(&self) -> &Path {
        &self.property_file
    }

    pub fn extra_properties(&self) -> &[String] {
        &self.extra_properties
    }

    pub fn remote(&self) -> bool {
        self.remote
    }

    /// Ordered engine arguments for this run
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "-n".to_string(),
            "-t".to_string(),
            path_arg(&self.test_file),
            "-l".to_string(),
            path_arg(&self.result_file),
            "-d".to_string(),
            path_arg(&self.working_dir),
            "-p".to_string(),
            path_arg(&self.property_file),
        ];

        args.extend(self.extra_properties.iter().map(|p| format!("-J{p}")));

        if self.remote {
            args.push("-r".to_string());
        }

        args
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Builds a [`RunRequest`] per test plan from batch-wide settings
#[derive(Debug, Clone)]
pub struct ArgumentBuilder {
    report_dir: PathBuf,
    working_dir: PathBuf,
    property_file: PathBuf,
    user_properties: Vec<String>,
    remote: bool,
}

impl ArgumentBuilder {
    pub fn new(
        report_dir: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
        property_file: impl Into<PathBuf>,
        user_properties: Vec<String>,
        remote: bool,
    ) -> Self {
        Self {
            report_dir: report_dir.into(),
            working_dir: working_dir.into(),
            property_file: property_file.into(),
            user_properties,
            remote,
        }
    }

    /// Resolve report and working directories from the configuration.
    ///
    /// Both directories must exist; the batch creates the report directory
    /// before calling this.
    pub fn from_config(config: &JmeterConfig) -> Result<Self, JmrunError> {
        let report_dir = std::fs::canonicalize(&config.report_dir)
            .map_err(JmrunError::io("resolving report directory", &config.report_dir))?;
        let working_dir = std::fs::canonicalize(&config.project_dir)
            .map_err(JmrunError::io("resolving project directory", &config.project_dir))?;
        // The engine may not start in the host's working directory
        let property_file = std::path::absolute(config.property_file())
            .map_err(JmrunError::io("resolving property file", config.property_file()))?;

        Ok(Self::new(
            report_dir,
            working_dir,
            property_file,
            config.user_properties.clone(),
            config.remote,
        ))
    }

    /// Build the request for `test_file`, stamped with today's date
    pub fn build(&self, test_file: &Path) -> Result<RunRequest, JmrunError> {
        self.build_on(test_file, Local::now().date_naive())
    }

    /// Build the request for `test_file` stamped with `date`.
    ///
    /// A result file left over from an earlier run on the same day is deleted
    /// so the collector never picks up a stale artifact.
    pub fn build_on(&self, test_file: &Path, date: NaiveDate) -> Result<RunRequest, JmrunError> {
        let test_file = std::fs::canonicalize(test_file).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                JmrunError::InvalidInput(format!(
                    "Test file {} does not exist",
                    test_file.display()
                ))
            } else {
                JmrunError::io("resolving test file", test_file)(e)
            }
        })?;

        let result_file = self.report_dir.join(result_file_name(&test_file, date));
        match std::fs::remove_file(&result_file) {
            Ok(()) => debug!(result = %result_file.display(), "Removed stale result file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(JmrunError::io("removing stale result file", &result_file)(e)),
        }

        let request = RunRequest {
            test_file,
            result_file,
            working_dir: self.working_dir.clone(),
            property_file: self.property_file.clone(),
            extra_properties: self.user_properties.clone(),
            remote: self.remote,
        };

        debug!(args = ?request.to_args(), "Engine is called with the following arguments");
        Ok(request)
    }
}

/// `<testFileName>-<yyyyMMdd>.xml`
pub fn result_file_name(test_file: &Path, date: NaiveDate) -> String {
    let name = test_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{name}-{}.xml", date.format(RESULT_DATE_FORMAT))
}
