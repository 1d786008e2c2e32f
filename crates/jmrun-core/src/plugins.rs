//! Engine plugin search path resolution.

use crate::error::JmrunError;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Separator the engine expects between `search_paths` entries
pub const SEARCH_PATH_SEPARATOR: &str = ";";

/// Jars from `lib_dir` the engine has to search for plugins: the engine's
/// own jars of `version`, any `bsh` jar, and jars ending in one of
/// `plugin_jars`.
///
/// Returns `None` without a library directory or when nothing matched.
pub fn resolve_search_paths(
    lib_dir: Option<&Path>,
    version: &str,
    plugin_jars: &[String],
) -> Result<Option<String>, JmrunError> {
    let Some(lib_dir) = lib_dir else {
        return Ok(None);
    };

    let jars = matching_jars(lib_dir, version, plugin_jars)?;
    if jars.is_empty() {
        info!(lib_dir = %lib_dir.display(), "No engine jars found for the plugin search path");
        return Ok(None);
    }

    let joined = jars
        .iter()
        .map(|jar| jar.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(SEARCH_PATH_SEPARATOR);
    debug!(search_paths = %joined, "Resolved plugin search path");
    Ok(Some(joined))
}

fn matching_jars(
    lib_dir: &Path,
    version: &str,
    plugin_jars: &[String],
) -> Result<Vec<PathBuf>, JmrunError> {
    if !lib_dir.is_dir() {
        return Err(JmrunError::ConfigurationError(format!(
            "Engine library directory {} does not exist",
            lib_dir.display()
        )));
    }

    let engine_jar = Regex::new(&format!(r"^jmeter-.*{}\.jar$", regex::escape(version)))
        .map_err(|e| JmrunError::ConfigurationError(format!("Invalid jmeterVersion {version}: {e}")))?;
    let bsh_jar = Regex::new(r"^.*bsh.*\.jar$")
        .map_err(|e| JmrunError::ConfigurationError(e.to_string()))?;

    let mut jars = Vec::new();
    for entry in WalkDir::new(lib_dir).sort_by_file_name() {
        let entry =
            entry.map_err(|e| JmrunError::io("scanning engine library directory", lib_dir)(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        let wanted = engine_jar.is_match(&name)
            || bsh_jar.is_match(&name)
            || plugin_jars.iter().any(|plugin| name.ends_with(plugin.as_str()));
        if wanted {
            jars.push(entry.into_path());
        }
    }

    Ok(jars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn jar(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"PK").unwrap();
        path
    }

    #[test]
    fn test_no_lib_dir() {
        assert_eq!(resolve_search_paths(None, "5.6.3", &[]).unwrap(), None);
    }

    #[test]
    fn test_matching_jars() {
        let dir = TempDir::new().unwrap();
        let core = jar(&dir, "jmeter-core-5.6.3.jar");
        let bsh = jar(&dir, "bsh-2.0b6.jar");
        let plugin = jar(&dir, "jmeter-plugins-casutg-2.10.jar");
        jar(&dir, "jmeter-core-5.6.2.jar");
        jar(&dir, "jmeter-core-5x6x3.jar");
        jar(&dir, "commons-io-2.15.jar");

        let paths = resolve_search_paths(
            Some(dir.path()),
            "5.6.3",
            &["casutg-2.10.jar".to_string()],
        )
        .unwrap()
        .unwrap();

        let expected = [bsh, core, plugin]
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(";");
        assert_eq!(paths, expected);
    }

    #[test]
    fn test_nothing_matches() {
        let dir = TempDir::new().unwrap();
        jar(&dir, "commons-io-2.15.jar");
        assert_eq!(
            resolve_search_paths(Some(dir.path()), "5.6.3", &[]).unwrap(),
            None
        );
    }
}
