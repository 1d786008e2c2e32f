//! Locates the test plans a batch runs.

use crate::config::JmeterConfig;
use crate::error::JmrunError;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

pub const DEFAULT_INCLUDE: &str = "**/*.jmx";

/// Ant-style path pattern: `**` spans directories, `*` and `?` stay within
/// one path segment, and a trailing `/` stands for `/**`
#[derive(Debug, Clone)]
pub struct AntPattern {
    source: String,
    regex: Regex,
}

impl AntPattern {
    pub fn new(pattern: &str) -> Result<Self, JmrunError> {
        let mut normalized = pattern.replace('\\', "/");
        if normalized.ends_with('/') {
            normalized.push_str("**");
        }
        let normalized = normalized.trim_start_matches('/');

        let segments: Vec<&str> = normalized.split('/').collect();
        let mut expression = String::from("^");
        for (index, segment) in segments.iter().enumerate() {
            let last = index + 1 == segments.len();
            if *segment == "**" {
                expression.push_str(if last { ".*" } else { "(?:[^/]*/)*" });
                continue;
            }
            for c in segment.chars() {
                match c {
                    '*' => expression.push_str("[^/]*"),
                    '?' => expression.push_str("[^/]"),
                    c => expression.push_str(&regex::escape(&c.to_string())),
                }
            }
            if !last {
                expression.push('/');
            }
        }
        expression.push('$');

        let regex = Regex::new(&expression).map_err(|e| {
            JmrunError::ConfigurationError(format!("Invalid file pattern {pattern}: {e}"))
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Match a `/`-separated path relative to the scanned directory
    pub fn matches(&self, relative: &str) -> bool {
        self.regex.is_match(relative)
    }
}

fn compile(patterns: &[String]) -> Result<Vec<AntPattern>, JmrunError> {
    patterns.iter().map(|p| AntPattern::new(p)).collect()
}

/// Validate explicitly listed test plans, keeping their order
pub fn explicit_files(files: &[PathBuf]) -> Result<Vec<PathBuf>, JmrunError> {
    files
        .iter()
        .map(|file| {
            if !file.is_file() {
                return Err(JmrunError::InvalidInput(format!(
                    "Test file {} does not exist or is not a file",
                    file.display()
                )));
            }
            std::fs::canonicalize(file).map_err(JmrunError::io("resolving test file", file))
        })
        .collect()
}

/// Files under `src_dir` matching any include and no exclude, sorted by path
pub fn scan_source_dir(
    src_dir: &Path,
    includes: &[String],
    excludes: &[String],
) -> Result<Vec<PathBuf>, JmrunError> {
    if !src_dir.is_dir() {
        return Err(JmrunError::InvalidInput(format!(
            "Source directory {} does not exist",
            src_dir.display()
        )));
    }

    let includes = if includes.is_empty() {
        vec![AntPattern::new(DEFAULT_INCLUDE)?]
    } else {
        compile(includes)?
    };
    let excludes = compile(excludes)?;

    let mut found = Vec::new();
    for entry in WalkDir::new(src_dir).sort_by_file_name() {
        let entry =
            entry.map_err(|e| JmrunError::io("scanning source directory", src_dir)(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let Ok(relative) = entry.path().strip_prefix(src_dir) else {
            continue;
        };
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let included = includes.iter().any(|p| p.matches(&relative));
        let excluded = excludes.iter().any(|p| p.matches(&relative));
        if included && !excluded {
            debug!(file = %relative, "Found test plan");
            found.push(entry.into_path());
        }
    }

    Ok(found)
}

/// Test plans for a batch: the explicit list when one is configured,
/// otherwise a scan of the source directory
pub fn discover(config: &JmeterConfig) -> Result<Vec<PathBuf>, JmrunError> {
    let files = match &config.test_files {
        Some(files) => {
            let files: Vec<PathBuf> = files.iter().map(|f| config.project_dir.join(f)).collect();
            explicit_files(&files)?
        }
        None => scan_source_dir(&config.src_dir, &config.includes, &config.excludes)?,
    };

    info!(count = files.len(), "Discovered test plans");
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &TempDir, relative: &str) -> PathBuf {
        let path = dir.path().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "<jmeterTestPlan/>").unwrap();
        path
    }

    #[test]
    fn test_ant_patterns() {
        let jmx = AntPattern::new("**/*.jmx").unwrap();
        assert!(jmx.matches("login.jmx"));
        assert!(jmx.matches("smoke/api/login.jmx"));
        assert!(!jmx.matches("login.jmx.bak"));

        let single = AntPattern::new("smoke/?ogin.jmx").unwrap();
        assert!(single.matches("smoke/login.jmx"));
        assert!(!single.matches("smoke/nested/login.jmx"));

        let directory = AntPattern::new("slow/").unwrap();
        assert!(directory.matches("slow/soak.jmx"));
        assert!(directory.matches("slow/deep/soak.jmx"));
        assert!(!directory.matches("fast/soak.jmx"));

        let middle = AntPattern::new("a/**/b.jmx").unwrap();
        assert!(middle.matches("a/b.jmx"));
        assert!(middle.matches("a/x/y/b.jmx"));
    }

    #[test]
    fn test_scan_with_excludes() {
        let dir = TempDir::new().unwrap();
        let login = touch(&dir, "login.jmx");
        let search = touch(&dir, "api/search.jmx");
        touch(&dir, "slow/soak.jmx");
        touch(&dir, "jmeter.properties");

        let found = scan_source_dir(
            dir.path(),
            &[DEFAULT_INCLUDE.to_string()],
            &["slow/**".to_string()],
        )
        .unwrap();

        assert_eq!(found, vec![search, login]);
    }

    #[test]
    fn test_missing_source_dir() {
        let dir = TempDir::new().unwrap();
        let result = scan_source_dir(&dir.path().join("nope"), &[], &[]);
        assert!(matches!(result, Err(JmrunError::InvalidInput(_))));
    }

    #[test]
    fn test_explicit_files_keep_order() {
        let dir = TempDir::new().unwrap();
        let b = touch(&dir, "b.jmx");
        let a = touch(&dir, "a.jmx");

        let files = explicit_files(&[b.clone(), a.clone()]).unwrap();
        assert_eq!(
            files,
            vec![b.canonicalize().unwrap(), a.canonicalize().unwrap()]
        );

        let missing = explicit_files(&[a, dir.path().join("missing.jmx")]);
        assert!(matches!(missing, Err(JmrunError::InvalidInput(_))));
    }

    #[test]
    fn test_discover_prefers_explicit_files() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "src/test/jmeter/scanned.jmx");
        let chosen = touch(&dir, "plans/chosen.jmx");

        let config = JmeterConfig {
            project_dir: dir.path().to_path_buf(),
            src_dir: dir.path().join("src/test/jmeter"),
            test_files: Some(vec![PathBuf::from("plans/chosen.jmx")]),
            ..Default::default()
        };
        assert_eq!(discover(&config).unwrap(), vec![chosen.canonicalize().unwrap()]);

        let config = JmeterConfig {
            test_files: None,
            ..config
        };
        let scanned = discover(&config).unwrap();
        assert_eq!(scanned.len(), 1);
        assert!(scanned[0].ends_with("scanned.jmx"));
    }
}
