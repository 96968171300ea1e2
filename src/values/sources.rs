//! Ordered value sources folded into one tree

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use super::{merge, parse_set, parse_set_file, parse_set_json, type_name, ValuesError};

/// Every place a value can come from, lowest priority first.
///
/// Within each list, later entries win over earlier ones.
#[derive(Debug, Clone, Default)]
pub struct ValueSources {
    pub files: Vec<PathBuf>,
    pub values: Vec<String>,
    pub string_values: Vec<String>,
    pub file_values: Vec<String>,
    pub json_values: Vec<String>,
}

impl ValueSources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push(path.into());
        self
    }

    pub fn with_set(mut self, expr: impl Into<String>) -> Self {
        self.values.push(expr.into());
        self
    }

    pub fn with_set_string(mut self, expr: impl Into<String>) -> Self {
        self.string_values.push(expr.into());
        self
    }

    pub fn with_set_file(mut self, expr: impl Into<String>) -> Self {
        self.file_values.push(expr.into());
        self
    }

    pub fn with_set_json(mut self, expr: impl Into<String>) -> Self {
        self.json_values.push(expr.into());
        self
    }

    /// Fold `defaults` and every source into a single mapping.
    pub fn resolve(&self, defaults: &Value) -> Result<Value, ValuesError> {
        let mut tree = super::empty();
        merge(&mut tree, defaults.clone())?;

        for path in &self.files {
            debug!(path = %path.display(), "merging values file");
            merge(&mut tree, load_values_file(path)?)?;
        }
        for expr in &self.values {
            merge(&mut tree, parse_set(expr, true)?)?;
        }
        for expr in &self.string_values {
            merge(&mut tree, parse_set(expr, false)?)?;
        }
        for expr in &self.file_values {
            merge(&mut tree, parse_set_file(expr)?)?;
        }
        for expr in &self.json_values {
            merge(&mut tree, parse_set_json(expr)?)?;
        }
        Ok(tree)
    }
}

/// Parse a YAML values document. Empty documents are an empty mapping.
pub fn parse_values_document(content: &str, origin: &str) -> Result<Value, ValuesError> {
    if content.trim().is_empty() {
        return Ok(super::empty());
    }
    let value: Value = serde_yaml::from_str(content).map_err(|e| ValuesError::Parse {
        origin: origin.to_string(),
        reason: e.to_string(),
    })?;
    match value {
        Value::Object(_) => Ok(value),
        Value::Null => Ok(super::empty()),
        other => Err(ValuesError::Shape {
            origin: origin.to_string(),
            found: type_name(&other),
        }),
    }
}

/// Read and parse a values file.
pub fn load_values_file(path: &Path) -> Result<Value, ValuesError> {
    let content = std::fs::read_to_string(path).map_err(|e| ValuesError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_values_document(&content, &path.display().to_string())
}
