//! Report renderers turning result files into human-readable pages.

use crate::config::JmeterConfig;
use crate::error::JmrunError;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

pub const DEFAULT_REPORT_POSTFIX: &str = "-report.html";

static SAMPLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<(?:httpSample|sample)\s([^>]*?)/?>").expect("sample pattern is valid")
});

static ATTRIBUTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([A-Za-z_][\w.-]*)="([^"]*)""#).expect("attribute pattern is valid"));

/// Report path for `result_file`: a trailing `.xml` is replaced by
/// `postfix`, any other name gets `postfix` appended
pub fn report_file_name(result_file: &Path, postfix: &str) -> PathBuf {
    let name = result_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let report = match name.strip_suffix(".xml") {
        Some(stem) => format!("{stem}{postfix}"),
        None => format!("{name}{postfix}"),
    };
    result_file.with_file_name(report)
}

#[async_trait]
pub trait ReportRenderer: Send + Sync {
    fn name(&self) -> &str;

    /// Render `result_file` into `output`
    async fn render(&self, result_file: &Path, output: &Path) -> Result<(), JmrunError>;
}

/// Pick the renderer `config` asks for
pub fn renderer_for(config: &JmeterConfig) -> Box<dyn ReportRenderer> {
    match &config.report_xslt {
        Some(template) => Box::new(XsltReportRenderer::new(template.clone())),
        None => Box::new(HtmlReportRenderer),
    }
}

/// Built-in summary page: one row per sample label plus a total
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlReportRenderer;

#[derive(Debug, Clone, Default, PartialEq)]
struct LabelStats {
    count: u64,
    failures: u64,
    total_ms: u64,
    min_ms: u64,
    max_ms: u64,
}

impl LabelStats {
    fn record(&mut self, elapsed_ms: u64, success: bool) {
        if self.count == 0 || elapsed_ms < self.min_ms {
            self.min_ms = elapsed_ms;
        }
        self.max_ms = self.max_ms.max(elapsed_ms);
        self.total_ms += elapsed_ms;
        self.count += 1;
        if !success {
            self.failures += 1;
        }
    }

    fn merge(&mut self, other: &LabelStats) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 || other.min_ms < self.min_ms {
            self.min_ms = other.min_ms;
        }
        self.max_ms = self.max_ms.max(other.max_ms);
        self.total_ms += other.total_ms;
        self.count += other.count;
        self.failures += other.failures;
    }

    fn average_ms(&self) -> u64 {
        if self.count == 0 { 0 } else { self.total_ms / self.count }
    }
}

fn collect_stats(xml: &str) -> BTreeMap<String, LabelStats> {
    let mut stats: BTreeMap<String, LabelStats> = BTreeMap::new();
    for sample in SAMPLE.captures_iter(xml) {
        let mut label = String::new();
        let mut elapsed = 0;
        let mut success = true;
        for attribute in ATTRIBUTE.captures_iter(&sample[1]) {
            match &attribute[1] {
                "lb" => label = attribute[2].to_string(),
                "t" => elapsed = attribute[2].parse().unwrap_or(0),
                "s" => success = &attribute[2] != "false",
                _ => {}
            }
        }
        stats.entry(label).or_default().record(elapsed, success);
    }
    stats
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn write_row(html: &mut String, label: &str, stats: &LabelStats) {
    let _ = writeln!(
        html,
        "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
        escape_html(label),
        stats.count,
        stats.failures,
        stats.average_ms(),
        stats.min_ms,
        stats.max_ms
    );
}

fn render_html(title: &str, stats: &BTreeMap<String, LabelStats>) -> String {
    let mut total = LabelStats::default();
    for label_stats in stats.values() {
        total.merge(label_stats);
    }

    let mut html = String::new();
    let _ = writeln!(html, "<!DOCTYPE html>");
    let _ = writeln!(html, "<html><head><meta charset=\"utf-8\">");
    let _ = writeln!(html, "<title>Load Test Results: {}</title>", escape_html(title));
    let _ = writeln!(html, "</head><body>");
    let _ = writeln!(html, "<h1>Load Test Results: {}</h1>", escape_html(title));
    let _ = writeln!(html, "<table border=\"1\">");
    let _ = writeln!(
        html,
        "<tr><th>Label</th><th>Samples</th><th>Failures</th><th>Average (ms)</th><th>Min (ms)</th><th>Max (ms)</th></tr>"
    );
    for (label, label_stats) in stats {
        write_row(&mut html, label, label_stats);
    }
    write_row(&mut html, "Total", &total);
    let _ = writeln!(html, "</table>");
    let _ = writeln!(html, "</body></html>");
    html
}

#[async_trait]
impl ReportRenderer for HtmlReportRenderer {
    fn name(&self) -> &str {
        "html"
    }

    async fn render(&self, result_file: &Path, output: &Path) -> Result<(), JmrunError> {
        let xml = tokio::fs::read_to_string(result_file)
            .await
            .map_err(JmrunError::io("reading result file", result_file))?;

        let stats = collect_stats(&xml);
        let title = result_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        debug!(result = %result_file.display(), labels = stats.len(), "Parsed result samples");

        tokio::fs::write(output, render_html(&title, &stats))
            .await
            .map_err(JmrunError::io("writing report", output))
    }
}

/// Renders through `xsltproc` with a custom stylesheet
#[derive(Debug, Clone)]
pub struct XsltReportRenderer {
    template: PathBuf,
    program: String,
}

impl XsltReportRenderer {
    pub fn new(template: impl Into<PathBuf>) -> Self {
        Self {
            template: template.into(),
            program: "xsltproc".to_string(),
        }
    }

    /// Use another XSLT processor accepting the same arguments
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn template(&self) -> &Path {
        &self.template
    }
}

#[async_trait]
impl ReportRenderer for XsltReportRenderer {
    fn name(&self) -> &str {
        "xslt"
    }

    async fn render(&self, result_file: &Path, output: &Path) -> Result<(), JmrunError> {
        if !self.template.is_file() {
            return Err(JmrunError::ReportFailure(format!(
                "Report template {} does not exist",
                self.template.display()
            )));
        }

        let result = Command::new(&self.program)
            .arg("-o")
            .arg(output)
            .arg(&self.template)
            .arg(result_file)
            .output()
            .await
            .map_err(|e| {
                JmrunError::ReportFailure(format!("Failed to run {}: {e}", self.program))
            })?;

        if !result.status.success() {
            return Err(JmrunError::ReportFailure(format!(
                "{} failed transforming {}: {}",
                self.program,
                result_file.display(),
                String::from_utf8_lossy(&result.stderr).trim()
            )));
        }

        info!(report = %output.display(), "Report written");
        Ok(())
    }
}
