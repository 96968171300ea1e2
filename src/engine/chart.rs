//! In-memory chart file trees

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use super::EngineError;
use crate::values::parse_values_document;

#[derive(Debug, Deserialize)]
struct ChartMeta {
    name: String,
    #[serde(default)]
    version: String,
}

/// A chart: metadata, default values and every template file by relative path.
#[derive(Debug, Clone)]
pub struct Chart {
    pub name: String,
    pub version: String,
    pub values: Value,
    files: BTreeMap<String, String>,
}

/// A partial and where it came from.
#[derive(Debug, Clone, Copy)]
pub struct Partial<'a> {
    pub path: &'a str,
    pub source: &'a str,
}

impl Chart {
    /// Build a chart from relative paths and contents.
    ///
    /// `Chart.yaml` is required, `values.yaml` is optional.
    pub fn from_files(files: BTreeMap<String, String>) -> Result<Self, EngineError> {
        let meta_src = files.get("Chart.yaml").ok_or_else(|| EngineError::ChartInvalid {
            path: "Chart.yaml".to_string(),
            reason: "missing".to_string(),
        })?;
        let meta: ChartMeta = serde_yaml::from_str(meta_src).map_err(|e| EngineError::ChartInvalid {
            path: "Chart.yaml".to_string(),
            reason: e.to_string(),
        })?;
        let values = match files.get("values.yaml") {
            Some(src) => parse_values_document(src, "values.yaml").map_err(|e| {
                EngineError::ChartInvalid {
                    path: "values.yaml".to_string(),
                    reason: e.to_string(),
                }
            })?,
            None => crate::values::empty(),
        };
        Ok(Self {
            name: meta.name,
            version: meta.version,
            values,
            files,
        })
    }

    /// Read a chart from a directory: `Chart.yaml`, `values.yaml`,
    /// `templates/**` and `charts/*/templates/**`.
    pub fn load(root: &Path) -> Result<Self, EngineError> {
        let mut files = BTreeMap::new();
        for name in ["Chart.yaml", "values.yaml"] {
            let path = root.join(name);
            if path.is_file() {
                files.insert(name.to_string(), read(&path)?);
            }
        }
        collect(root, &root.join("templates"), &mut files)?;

        let charts = root.join("charts");
        if charts.is_dir() {
            let entries = std::fs::read_dir(&charts).map_err(|e| read_error(&charts, e))?;
            let mut deps: Vec<_> = entries
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| path.is_dir())
                .collect();
            deps.sort();
            for dep in deps {
                collect(root, &dep.join("templates"), &mut files)?;
            }
        }
        Self::from_files(files)
    }

    /// Source of a template by relative path (`./` prefixes are ignored).
    pub fn template(&self, path: &str) -> Option<&str> {
        let normalized = path.trim_start_matches("./");
        self.files.get(normalized).map(String::as_str)
    }

    pub fn has_template(&self, path: &str) -> bool {
        self.template(path).is_some()
    }

    /// Every `_*.tpl` file, keyed by partial name.
    pub fn partials(&self) -> Vec<(String, Partial<'_>)> {
        self.files
            .iter()
            .filter_map(|(path, source)| {
                let partial = Partial {
                    path: path.as_str(),
                    source: source.as_str(),
                };
                partial_name(path).map(|name| (name, partial))
            })
            .collect()
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Partial name for a `_*.tpl` path.
///
/// `templates/_config.tpl` is `config`, `charts/talm/templates/_network.tpl`
/// is `talm_network`.
pub fn partial_name(path: &str) -> Option<String> {
    let file = path.rsplit('/').next()?;
    let stem = file.strip_prefix('_')?.strip_suffix(".tpl")?;
    let sanitize = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    };
    let mut parts = path.split('/');
    match (parts.next(), parts.next()) {
        (Some("charts"), Some(dep)) => Some(format!("{}_{}", sanitize(dep), sanitize(stem))),
        _ => Some(sanitize(stem)),
    }
}

fn read(path: &Path) -> Result<String, EngineError> {
    std::fs::read_to_string(path).map_err(|e| read_error(path, e))
}

fn read_error(path: &Path, e: std::io::Error) -> EngineError {
    EngineError::ChartRead {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

fn collect(root: &Path, dir: &Path, files: &mut BTreeMap<String, String>) -> Result<(), EngineError> {
    if !dir.is_dir() {
        return Ok(());
    }
    let entries = std::fs::read_dir(dir).map_err(|e| read_error(dir, e))?;
    for entry in entries {
        let path = entry.map_err(|e| read_error(dir, e))?.path();
        if path.is_dir() {
            collect(root, &path, files)?;
            continue;
        }
        let relative = path
            .strip_prefix(root)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_else(|_| path.to_string_lossy().into_owned());
        files.insert(relative, read(&path)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_partial_names() {
        assert_eq!(partial_name("templates/_config.tpl").as_deref(), Some("config"));
        assert_eq!(
            partial_name("charts/talm/templates/_network.tpl").as_deref(),
            Some("talm_network")
        );
        assert_eq!(
            partial_name("charts/talm/templates/_disk-select.tpl").as_deref(),
            Some("talm_disk_select")
        );
        assert_eq!(partial_name("templates/controlplane.yaml"), None);
        assert_eq!(partial_name("templates/config.tpl"), None);
    }

    #[test]
    fn test_from_files() {
        let chart = Chart::from_files(files(&[
            ("Chart.yaml", "name: demo\nversion: 0.1.0\n"),
            ("values.yaml", "endpoint: https://10.0.0.1:6443\n"),
            ("templates/worker.yaml", "machine: {}\n"),
            ("templates/_config.tpl", "x"),
        ]))
        .unwrap();
        assert_eq!(chart.name, "demo");
        assert_eq!(chart.version, "0.1.0");
        assert_eq!(chart.values["endpoint"], "https://10.0.0.1:6443");
        assert!(chart.has_template("./templates/worker.yaml"));
        let partials = chart.partials();
        assert_eq!(partials.len(), 1);
        assert_eq!(partials[0].0, "config");
        assert_eq!(partials[0].1.path, "templates/_config.tpl");
    }

    #[test]
    fn test_missing_chart_yaml() {
        let err = Chart::from_files(files(&[("values.yaml", "")])).unwrap_err();
        assert!(matches!(err, EngineError::ChartInvalid { .. }));
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("templates")).unwrap();
        std::fs::create_dir_all(root.join("charts/talm/templates")).unwrap();
        std::fs::create_dir_all(root.join("nodes")).unwrap();
        std::fs::write(root.join("Chart.yaml"), "name: demo\nversion: 0.1.0\n").unwrap();
        std::fs::write(root.join("templates/controlplane.yaml"), "a: 1\n").unwrap();
        std::fs::write(root.join("charts/talm/templates/_helpers.tpl"), "h").unwrap();
        std::fs::write(root.join("nodes/node1.yaml"), "ignored: true\n").unwrap();

        let chart = Chart::load(root).unwrap();
        assert!(chart.has_template("templates/controlplane.yaml"));
        assert!(!chart.has_template("nodes/node1.yaml"));
        assert_eq!(chart.partials()[0].0, "talm_helpers");
        assert_eq!(chart.values, serde_json::json!({}));
    }
}
