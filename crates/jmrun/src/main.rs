use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use jmrun::{JmeterConfig, JmeterTask};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "jmrun.toml";

/// Exit code used when the batch was interrupted
const INTERRUPTED_EXIT_CODE: u8 = 130;

#[derive(Parser)]
#[command(name = "jmrun", version, about = "Run load test plans and collect their results")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every test plan, then render reports and scan the results
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Configuration file (default: jmrun.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Engine version used to resolve the plugin search path
    #[arg(long)]
    jmeter_version: Option<String>,

    /// Directory holding the test plans
    #[arg(long)]
    src_dir: Option<PathBuf>,

    /// Directory for result files and reports
    #[arg(long)]
    report_dir: Option<PathBuf>,

    /// Directory for the engine log
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Run only these test plans instead of scanning the source directory
    #[arg(long = "test-file", value_name = "FILE")]
    test_files: Vec<PathBuf>,

    /// Include pattern for the source directory scan
    #[arg(long = "include", value_name = "PATTERN")]
    includes: Vec<String>,

    /// Exclude pattern for the source directory scan
    #[arg(long = "exclude", value_name = "PATTERN")]
    excludes: Vec<String>,

    /// Pass the remote flag to the engine
    #[arg(long)]
    remote: bool,

    /// Skip report rendering
    #[arg(long)]
    no_reports: bool,

    /// Do not report assertion failures found in the results
    #[arg(long)]
    ignore_failure: bool,

    /// Do not report errors found in the results
    #[arg(long)]
    ignore_error: bool,

    /// Fail when the result scan finds problems
    #[arg(long)]
    fail_on_scan_problems: bool,

    /// Postfix replacing `.xml` in report file names
    #[arg(long)]
    report_postfix: Option<String>,

    /// Custom XSLT template for reports (rendered with xsltproc)
    #[arg(long)]
    report_xslt: Option<PathBuf>,

    /// Engine property, passed as -J<KEY=VALUE>
    #[arg(short = 'J', value_name = "KEY=VALUE")]
    properties: Vec<String>,

    /// Write the batch summary as JSON to this file
    #[arg(long)]
    summary_json: Option<PathBuf>,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
}

impl RunArgs {
    fn load_config(&self) -> anyhow::Result<JmeterConfig> {
        let mut config = match &self.config {
            Some(path) => JmeterConfig::load(path)
                .with_context(|| format!("Failed to load configuration {}", path.display()))?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                JmeterConfig::load(DEFAULT_CONFIG_FILE)
                    .with_context(|| format!("Failed to load configuration {DEFAULT_CONFIG_FILE}"))?
            }
            None => JmeterConfig::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }

    /// Command line flags win over the configuration file
    fn apply(&self, config: &mut JmeterConfig) {
        if let Some(version) = &self.jmeter_version {
            config.jmeter_version = Some(version.clone());
        }
        if let Some(dir) = &self.src_dir {
            config.src_dir = dir.clone();
        }
        if let Some(dir) = &self.report_dir {
            config.report_dir = dir.clone();
        }
        if let Some(dir) = &self.work_dir {
            config.work_dir = dir.clone();
        }
        if !self.test_files.is_empty() {
            config.test_files = Some(self.test_files.clone());
        }
        if !self.includes.is_empty() {
            config.includes = self.includes.clone();
        }
        if !self.excludes.is_empty() {
            config.excludes = self.excludes.clone();
        }
        if let Some(postfix) = &self.report_postfix {
            config.report_postfix = postfix.clone();
        }
        if let Some(template) = &self.report_xslt {
            config.report_xslt = Some(template.clone());
        }
        config.user_properties.extend(self.properties.iter().cloned());
        config.remote |= self.remote;
        config.enable_reports &= !self.no_reports;
        config.ignore_failure |= self.ignore_failure;
        config.ignore_error |= self.ignore_error;
        config.fail_on_scan_problems |= self.fail_on_scan_problems;
    }
}

fn init_tracing(quiet: bool, json: bool) {
    let default_filter = if quiet {
        "warn"
    } else {
        "jmrun=info,jmrun_core=info,jmrun_unix=info,jmrun_windows=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

async fn run(args: RunArgs) -> anyhow::Result<ExitCode> {
    let config = args.load_config()?;

    let token = CancellationToken::new();
    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping the active run");
            interrupt.cancel();
        }
    });

    let summary = JmeterTask::new(config).execute(&token).await?;

    if let Some(path) = &args.summary_json {
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write summary {}", path.display()))?;
        info!(summary = %path.display(), "Summary written");
    }

    match summary.into_result() {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            warn!("{e}");
            Ok(ExitCode::from(INTERRUPTED_EXIT_CODE))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => {
            init_tracing(args.quiet, args.json_logs);
            match run(args).await {
                Ok(code) => code,
                Err(e) => {
                    error!("{e:#}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
