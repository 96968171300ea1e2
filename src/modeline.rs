//! Modeline: the first line of every rendered document
//!
//! ```text
//! # talm: nodes=["10.0.0.2"], endpoints=["10.0.0.2"], templates=["templates/controlplane.yaml"]
//! ```
//!
//! Values are JSON, so a modeline is always a single line. A trailing
//! `user="name@host"` key records who rendered the file.

use std::path::Path;

use serde_json::Value;
use thiserror::Error;

use crate::error::{Classify, ErrorKind};

pub const PREFIX: &str = "# talm:";

/// Errors raised while reading a modeline
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelineError {
    #[error("invalid modeline: {reason}")]
    Invalid { reason: String },

    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },
}

impl Classify for ModelineError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Invalid { .. } => ErrorKind::ModelineInvalid,
            Self::Read { .. } => ErrorKind::Filesystem,
        }
    }
}

/// Inputs needed to re-address a rendered file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Modeline {
    pub nodes: Vec<String>,
    pub endpoints: Vec<String>,
    pub templates: Vec<String>,
    pub user: Option<String>,
}

impl Modeline {
    pub fn new(nodes: Vec<String>, endpoints: Vec<String>, templates: Vec<String>) -> Self {
        Self {
            nodes,
            endpoints,
            templates,
            user: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// Render a modeline. `parse` inverts this exactly.
pub fn generate(modeline: &Modeline) -> String {
    let mut line = format!(
        "{PREFIX} nodes={}, endpoints={}, templates={}",
        json_list(&modeline.nodes),
        json_list(&modeline.endpoints),
        json_list(&modeline.templates)
    );
    if let Some(user) = &modeline.user {
        line.push_str(", user=");
        line.push_str(&Value::String(user.clone()).to_string());
    }
    line
}

fn json_list(items: &[String]) -> String {
    Value::Array(items.iter().cloned().map(Value::String).collect()).to_string()
}

/// Parse a modeline.
///
/// Keys are separated by `,` or `;`. Unknown or repeated keys, non-string
/// list items and trailing text are rejected.
pub fn parse(line: &str) -> Result<Modeline, ModelineError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let body = line
        .trim_start()
        .strip_prefix(PREFIX)
        .ok_or_else(|| invalid(format!("line does not start with '{PREFIX}'")))?;

    let mut modeline = Modeline::default();
    let mut seen: Vec<String> = Vec::new();
    let mut rest = body.trim_start();

    while !rest.is_empty() {
        let (key, after_key) = rest
            .split_once('=')
            .ok_or_else(|| invalid(format!("expected key=value at '{rest}'")))?;
        let key = key.trim();
        if seen.iter().any(|k| k == key) {
            return Err(invalid(format!("duplicate key '{key}'")));
        }

        let after_key = after_key.trim_start();
        let mut stream = serde_json::Deserializer::from_str(after_key).into_iter::<Value>();
        let value = match stream.next() {
            Some(Ok(value)) => value,
            Some(Err(e)) => return Err(invalid(format!("value of '{key}': {e}"))),
            None => return Err(invalid(format!("missing value for '{key}'"))),
        };
        let consumed = stream.byte_offset();

        match key {
            "nodes" => modeline.nodes = string_items(key, value)?,
            "endpoints" => modeline.endpoints = string_items(key, value)?,
            "templates" => modeline.templates = string_items(key, value)?,
            "user" => match value {
                Value::String(user) => modeline.user = Some(user),
                other => return Err(invalid(format!("'user' must be a string, got {other}"))),
            },
            other => return Err(invalid(format!("unknown key '{other}'"))),
        }
        seen.push(key.to_string());

        rest = after_key[consumed..].trim_start();
        if rest.is_empty() {
            break;
        }
        rest = rest
            .strip_prefix(',')
            .or_else(|| rest.strip_prefix(';'))
            .ok_or_else(|| invalid(format!("unexpected text '{rest}'")))?
            .trim_start();
        if rest.is_empty() {
            return Err(invalid("trailing separator".to_string()));
        }
    }
    Ok(modeline)
}

fn string_items(key: &str, value: Value) -> Result<Vec<String>, ModelineError> {
    let Value::Array(items) = value else {
        return Err(invalid(format!("'{key}' must be a list, got {value}")));
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::String(s) => Ok(s),
            other => Err(invalid(format!("'{key}' items must be strings, got {other}"))),
        })
        .collect()
}

fn invalid(reason: String) -> ModelineError {
    ModelineError::Invalid { reason }
}

/// Drop a leading modeline, if any.
pub fn strip(content: &str) -> &str {
    match content.split_once('\n') {
        Some((first, rest)) if first.trim_start().starts_with(PREFIX) => rest,
        None if content.trim_start().starts_with(PREFIX) => "",
        _ => content,
    }
}

/// Nodes and endpoints for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Targets {
    pub nodes: Vec<String>,
    pub endpoints: Vec<String>,
}

impl Targets {
    /// Command-line lists win; empty ones inherit from the modeline.
    pub fn resolve(cli_nodes: &[String], cli_endpoints: &[String], modeline: Option<&Modeline>) -> Self {
        let pick = |cli: &[String], from_file: Option<&Vec<String>>| -> Vec<String> {
            if cli.is_empty() {
                from_file.cloned().unwrap_or_default()
            } else {
                cli.to_vec()
            }
        };
        Self {
            nodes: pick(cli_nodes, modeline.map(|m| &m.nodes)),
            endpoints: pick(cli_endpoints, modeline.map(|m| &m.endpoints)),
        }
    }
}

// ============================================================================
// I/O boundary
// ============================================================================

/// Parse the modeline on the first line of `path`.
pub fn read_from_file(path: &Path) -> Result<Modeline, ModelineError> {
    let content = std::fs::read_to_string(path).map_err(|e| ModelineError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let first = content.lines().next().unwrap_or_default();
    parse(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Modeline {
        Modeline::new(
            vec!["10.0.0.2".into()],
            vec!["10.0.0.2".into()],
            vec!["templates/controlplane.yaml".into()],
        )
    }

    #[test]
    fn test_generate_format() {
        assert_eq!(
            generate(&sample()),
            r#"# talm: nodes=["10.0.0.2"], endpoints=["10.0.0.2"], templates=["templates/controlplane.yaml"]"#
        );
    }

    #[test]
    fn test_round_trip() {
        let cases = [
            sample(),
            Modeline::default(),
            Modeline::new(
                vec!["a".into(), "b\"c".into()],
                vec![],
                vec!["templates/x,y;z.yaml".into(), "new\nline".into()],
            ),
            sample().with_user("ops@workstation"),
        ];
        for case in cases {
            let line = generate(&case);
            assert!(!line.contains('\n'));
            assert_eq!(parse(&line).unwrap(), case);
        }
    }

    #[test]
    fn test_semicolon_separator() {
        let parsed = parse(r#"# talm: nodes=["1.2.3.4"]; endpoints=["5.6.7.8"]"#).unwrap();
        assert_eq!(parsed.nodes, vec!["1.2.3.4"]);
        assert_eq!(parsed.endpoints, vec!["5.6.7.8"]);
        assert!(parsed.templates.is_empty());
    }

    #[test]
    fn test_rejects_malformed_lines() {
        let bad = [
            r#"talm: nodes=["a"]"#,
            r#"# talm: nodes=["a"], extra=["b"]"#,
            r#"# talm: nodes=["a"], nodes=["b"]"#,
            r#"# talm: nodes=[1]"#,
            r#"# talm: nodes="a""#,
            r#"# talm: nodes=["a"] junk"#,
            r#"# talm: nodes=["a"],"#,
            r#"# talm: nodes"#,
            r#"# talm: user=["x"]"#,
        ];
        for line in bad {
            let err = parse(line).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ModelineInvalid, "{line}");
        }
    }

    #[test]
    fn test_strip() {
        assert_eq!(strip("# talm: nodes=[]\nmachine: {}\n"), "machine: {}\n");
        assert_eq!(strip("machine: {}\n"), "machine: {}\n");
    }

    #[test]
    fn test_targets_cli_wins() {
        let from_file = sample();
        let inherited = Targets::resolve(&[], &[], Some(&from_file));
        assert_eq!(inherited.endpoints, vec!["10.0.0.2"]);
        assert_eq!(inherited.nodes, vec!["10.0.0.2"]);

        let overridden = Targets::resolve(&[], &["10.0.0.9".to_string()], Some(&from_file));
        assert_eq!(overridden.endpoints, vec!["10.0.0.9"]);
        assert_eq!(overridden.nodes, vec!["10.0.0.2"]);

        assert_eq!(Targets::resolve(&[], &[], None), Targets::default());
    }

    #[test]
    fn test_read_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node1.yaml");
        std::fs::write(&path, format!("{}\nmachine: {{}}\n", generate(&sample()))).unwrap();
        assert_eq!(read_from_file(&path).unwrap(), sample());

        let missing = read_from_file(&dir.path().join("nope.yaml")).unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::Filesystem);
    }
}
