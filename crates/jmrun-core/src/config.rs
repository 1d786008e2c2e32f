use crate::error::JmrunError;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the engine log file inside the work directory
pub const LOG_FILE_NAME: &str = "jmeter.log";

/// Name of the engine property file inside the source directory
pub const DEFAULT_PROPERTY_FILE: &str = "jmeter.properties";

/// How the engine binary is launched
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Executable that starts the engine in non-GUI mode
    #[serde(default = "default_engine_command")]
    pub command: String,

    /// Arguments placed before the generated run arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Directory holding the engine jars and plugins, used for `search_paths`
    #[serde(default)]
    pub lib_dir: Option<PathBuf>,

    /// Extra environment variables for the engine process
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: default_engine_command(),
            args: Vec::new(),
            lib_dir: None,
            env: HashMap::new(),
        }
    }
}

/// Main task configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
#[builder(setter(into, strip_option))]
pub struct JmeterConfig {
    /// Engine version the plugin jars are resolved against
    #[serde(default)]
    #[builder(default)]
    pub jmeter_version: Option<String>,

    /// Directory under which test plans are stored
    #[serde(default = "default_src_dir")]
    #[builder(default = "default_src_dir()")]
    pub src_dir: PathBuf,

    /// Directory in which results and reports are stored
    #[serde(default = "default_report_dir")]
    #[builder(default = "default_report_dir()")]
    pub report_dir: PathBuf,

    /// Directory holding the engine log
    #[serde(default = "default_work_dir")]
    #[builder(default = "default_work_dir()")]
    pub work_dir: PathBuf,

    /// Working directory handed to the engine
    #[serde(default = "default_project_dir")]
    #[builder(default = "default_project_dir()")]
    pub project_dir: PathBuf,

    /// Explicit test plans; replaces the directory scan when set
    #[serde(default)]
    #[builder(default)]
    #[builder(setter(custom))]
    pub test_files: Option<Vec<PathBuf>>,

    /// Include patterns for the directory scan, relative to `src_dir`
    #[serde(default = "default_includes")]
    #[builder(default = "default_includes()")]
    #[builder(setter(custom))]
    pub includes: Vec<String>,

    /// Exclude patterns for the directory scan, relative to `src_dir`
    #[serde(default)]
    #[builder(default)]
    #[builder(setter(custom))]
    pub excludes: Vec<String>,

    #[serde(default = "default_enable_reports")]
    #[builder(default = "default_enable_reports()")]
    pub enable_reports: bool,

    /// Passes the remote flag through to the engine
    #[serde(default)]
    #[builder(default)]
    pub remote: bool,

    #[serde(default)]
    #[builder(default)]
    pub ignore_failure: bool,

    #[serde(default)]
    #[builder(default)]
    pub ignore_error: bool,

    /// Turns scanner findings into a batch error instead of a warning
    #[serde(default)]
    #[builder(default)]
    pub fail_on_scan_problems: bool,

    #[serde(default = "default_report_postfix")]
    #[builder(default = "default_report_postfix()")]
    pub report_postfix: String,

    /// Custom XSLT template used to render reports
    #[serde(default)]
    #[builder(default)]
    pub report_xslt: Option<PathBuf>,

    /// Raw `key=value` strings passed to the engine as `-J` properties
    #[serde(default)]
    #[builder(default)]
    #[builder(setter(custom))]
    pub user_properties: Vec<String>,

    /// Plugin jar names added to the engine search path
    #[serde(default)]
    #[builder(default)]
    #[builder(setter(custom))]
    pub plugin_jars: Vec<String>,

    #[serde(default)]
    #[builder(default)]
    pub engine: EngineConfig,

    /// Delay between two reads of the engine log (in milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    #[builder(default = "default_poll_interval_ms()")]
    pub poll_interval_ms: u64,
}

impl Default for JmeterConfig {
    fn default() -> Self {
        Self {
            jmeter_version: None,
            src_dir: default_src_dir(),
            report_dir: default_report_dir(),
            work_dir: default_work_dir(),
            project_dir: default_project_dir(),
            test_files: None,
            includes: default_includes(),
            excludes: Vec::new(),
            enable_reports: default_enable_reports(),
            remote: false,
            ignore_failure: false,
            ignore_error: false,
            fail_on_scan_problems: false,
            report_postfix: default_report_postfix(),
            report_xslt: None,
            user_properties: Vec::new(),
            plugin_jars: Vec::new(),
            engine: EngineConfig::default(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl JmeterConfig {
    pub fn builder() -> JmeterConfigBuilder {
        JmeterConfigBuilder::default()
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, JmrunError> {
        toml::from_str(text)
            .map_err(|e| JmrunError::ConfigurationError(format!("Invalid configuration: {e}")))
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, JmrunError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(JmrunError::io("reading configuration", path))?;
        Self::from_toml_str(&text)
    }

    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), JmrunError> {
        match self.jmeter_version.as_deref() {
            Some(version) if !version.trim().is_empty() => {}
            _ => {
                return Err(JmrunError::ConfigurationError(
                    "jmeterVersion must be set to the engine version in use".to_string(),
                ));
            }
        }

        if self.report_postfix.is_empty() {
            return Err(JmrunError::ConfigurationError(
                "reportPostfix cannot be empty".to_string(),
            ));
        }

        if self.poll_interval_ms == 0 {
            return Err(JmrunError::ConfigurationError(
                "pollIntervalMs must be greater than zero".to_string(),
            ));
        }

        if self.engine.command.trim().is_empty() {
            return Err(JmrunError::ConfigurationError(
                "engine.command cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Engine log tailed by the completion watcher
    pub fn log_file(&self) -> PathBuf {
        self.work_dir.join(LOG_FILE_NAME)
    }

    /// Property file handed to the engine with `-p`
    pub fn property_file(&self) -> PathBuf {
        self.src_dir.join(DEFAULT_PROPERTY_FILE)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl JmeterConfigBuilder {
    pub fn test_files<P: Into<PathBuf>, I: IntoIterator<Item = P>>(&mut self, iter: I) -> &mut Self {
        let files: Vec<PathBuf> = iter.into_iter().map(Into::into).collect();
        self.test_files = Some(Some(files));
        self
    }

    pub fn includes<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        self.includes = Some(iter.into_iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn excludes<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        self.excludes = Some(iter.into_iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn user_property<T: ToString>(&mut self, property: T) -> &mut Self {
        let properties = self.user_properties.get_or_insert_with(Vec::new);
        properties.push(property.to_string());
        self
    }

    pub fn user_properties<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let properties = self.user_properties.get_or_insert_with(Vec::new);
        properties.extend(iter.into_iter().map(|s| s.to_string()));
        self
    }

    pub fn plugin_jars<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        self.plugin_jars = Some(iter.into_iter().map(|s| s.to_string()).collect());
        self
    }
}

// Default value functions for serde
fn default_engine_command() -> String {
    "jmeter".to_string()
}
fn default_src_dir() -> PathBuf {
    PathBuf::from("src/test/jmeter")
}
fn default_report_dir() -> PathBuf {
    PathBuf::from("build/jmeter-report")
}
fn default_work_dir() -> PathBuf {
    PathBuf::from("build/jmeter")
}
fn default_project_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_includes() -> Vec<String> {
    vec!["**/*.jmx".to_string()]
}
fn default_enable_reports() -> bool {
    true
}
fn default_report_postfix() -> String {
    "-report.html".to_string()
}
fn default_poll_interval_ms() -> u64 {
    1_000
}
