//! Inline value expressions (`--set`, `--set-string`, `--set-file`, `--set-json`)

use std::path::Path;

use serde_json::{Map, Value};

use super::{path_segments, type_name, Segment, ValuesError};

/// Parse a `--set` style expression into a value tree.
///
/// Assignments are separated by `,` (`\,` keeps a literal comma), keys are
/// dotted paths with optional `[n]` indices and `{a,b}` builds a list. When
/// `typed` is false every scalar stays a string (`--set-string`).
pub fn parse_set(expr: &str, typed: bool) -> Result<Value, ValuesError> {
    let mut tree = Value::Object(Map::new());
    for assignment in split_assignments(expr)? {
        let (key, raw) = split_key(expr, &assignment)?;
        let value = if raw.starts_with('{') && raw.ends_with('}') && raw.len() >= 2 {
            let inner = &raw[1..raw.len() - 1];
            let items = if inner.is_empty() {
                Vec::new()
            } else {
                split_unescaped(inner, ',')
                    .into_iter()
                    .map(|item| scalar(&unescape(&item), typed))
                    .collect()
            };
            Value::Array(items)
        } else {
            scalar(&unescape(raw), typed)
        };
        graft(&mut tree, &path_segments(key)?, value)?;
    }
    Ok(tree)
}

/// Parse a `--set-file` expression: `a.b=@path` or `a.b=path`.
///
/// The right-hand side is replaced by the file's verbatim contents.
pub fn parse_set_file(expr: &str) -> Result<Value, ValuesError> {
    let (key, raw) = split_key(expr, expr)?;
    let raw = raw.strip_prefix('@').unwrap_or(raw);
    if raw.is_empty() {
        return Err(ValuesError::Expression {
            expr: expr.to_string(),
            reason: "missing file path".to_string(),
        });
    }
    let expanded = shellexpand::tilde(raw);
    let path = Path::new(expanded.as_ref());
    let content = std::fs::read_to_string(path).map_err(|e| ValuesError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let mut tree = Value::Object(Map::new());
    graft(&mut tree, &path_segments(key)?, Value::String(content))?;
    Ok(tree)
}

/// Parse a `--set-json` expression: a whole JSON object or `a.b=<json>`.
pub fn parse_set_json(expr: &str) -> Result<Value, ValuesError> {
    let trimmed = expr.trim();
    if trimmed.starts_with('{') {
        let value: Value = serde_json::from_str(trimmed).map_err(|e| ValuesError::Expression {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;
        return match value {
            Value::Object(_) => Ok(value),
            other => Err(ValuesError::Shape {
                origin: "--set-json".to_string(),
                found: type_name(&other),
            }),
        };
    }

    let (key, raw) = split_key(expr, trimmed)?;
    let value: Value = serde_json::from_str(raw).map_err(|e| ValuesError::Expression {
        expr: expr.to_string(),
        reason: e.to_string(),
    })?;
    let mut tree = Value::Object(Map::new());
    graft(&mut tree, &path_segments(key)?, value)?;
    Ok(tree)
}

// ============================================================================
// SBIO: Pure helpers
// ============================================================================

fn split_key<'a>(expr: &str, assignment: &'a str) -> Result<(&'a str, &'a str), ValuesError> {
    let (key, value) = assignment.split_once('=').ok_or_else(|| ValuesError::Expression {
        expr: expr.to_string(),
        reason: format!("'{assignment}' is not a key=value pair"),
    })?;
    let key = key.trim();
    if key.is_empty() {
        return Err(ValuesError::Expression {
            expr: expr.to_string(),
            reason: "empty key".to_string(),
        });
    }
    Ok((key, value))
}

/// Split top-level assignments on unescaped commas outside `{...}` lists.
fn split_assignments(expr: &str) -> Result<Vec<String>, ValuesError> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut chars = expr.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '{' => {
                depth += 1;
                current.push(c);
            }
            '}' => {
                depth = depth.checked_sub(1).ok_or_else(|| ValuesError::Expression {
                    expr: expr.to_string(),
                    reason: "unbalanced '}'".to_string(),
                })?;
                current.push(c);
            }
            ',' if depth == 0 => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if depth != 0 {
        return Err(ValuesError::Expression {
            expr: expr.to_string(),
            reason: "unterminated list literal".to_string(),
        });
    }
    parts.push(current);
    Ok(parts.into_iter().filter(|p| !p.trim().is_empty()).collect())
}

/// Split on unescaped `sep`, keeping escapes for a later [`unescape`].
fn split_unescaped(input: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            current.push(c);
            if let Some(next) = chars.next() {
                current.push(next);
            }
        } else if c == sep {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

fn unescape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn scalar(raw: &str, typed: bool) -> Value {
    if !typed {
        return Value::String(raw.to_string());
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => match raw.parse::<i64>() {
            // Leading zeros stay strings so values like "0755" survive.
            Ok(n) if !(raw.len() > 1 && raw.starts_with('0')) => Value::from(n),
            _ => Value::String(raw.to_string()),
        },
    }
}

/// Place `value` at `segments` inside `tree`, creating maps and lists on the
/// way. Addressing a scalar as a map, or a map as a list, is a
/// [`ValuesError::TypeConflict`] naming the path that already holds it.
fn graft(tree: &mut Value, segments: &[Segment], value: Value) -> Result<(), ValuesError> {
    let mut node = tree;
    for (depth, segment) in segments.iter().enumerate() {
        let conflict = |found: &Value, wanted: &'static str| ValuesError::TypeConflict {
            path: format_path(&segments[..depth]),
            base: type_name(found),
            overlay: wanted,
        };
        node = match segment {
            Segment::Key(key) => {
                if node.is_null() {
                    *node = Value::Object(Map::new());
                }
                match node {
                    Value::Object(map) => map.entry(key.clone()).or_insert(Value::Null),
                    other => return Err(conflict(other, "map")),
                }
            }
            Segment::Index(index) => {
                if node.is_null() {
                    *node = Value::Array(Vec::new());
                }
                match node {
                    Value::Array(list) => {
                        if list.len() <= *index {
                            list.resize(index + 1, Value::Null);
                        }
                        &mut list[*index]
                    }
                    other => return Err(conflict(other, "sequence")),
                }
            }
        };
    }
    *node = value;
    Ok(())
}

/// `a.b[1].c` style rendering of a segment path.
fn format_path(segments: &[Segment]) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Key(key) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(key);
            }
            Segment::Index(index) => out.push_str(&format!("[{index}]")),
        }
    }
    if out.is_empty() {
        out.push_str("<root>");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Classify, ErrorKind};
    use serde_json::json;

    #[test]
    fn test_parse_set_nested_and_typed() {
        let tree = parse_set("a.b=c,replicas=3,enabled=true,gone=null", true).unwrap();
        assert_eq!(
            tree,
            json!({"a": {"b": "c"}, "replicas": 3, "enabled": true, "gone": null})
        );
    }

    #[test]
    fn test_parse_set_string_keeps_strings() {
        let tree = parse_set("replicas=3,enabled=true", false).unwrap();
        assert_eq!(tree, json!({"replicas": "3", "enabled": "true"}));
    }

    #[test]
    fn test_parse_set_escapes() {
        let tree = parse_set(r"msg=a\,b,labels.example\.com/role=cp", true).unwrap();
        assert_eq!(tree, json!({"msg": "a,b", "labels": {"example.com/role": "cp"}}));
    }

    #[test]
    fn test_parse_set_list_literal_and_index() {
        let tree = parse_set("certSANs={a.example,b.example},nodes[1].ip=10.0.0.3", true).unwrap();
        assert_eq!(
            tree,
            json!({"certSANs": ["a.example", "b.example"], "nodes": [null, {"ip": "10.0.0.3"}]})
        );
    }

    #[test]
    fn test_parse_set_value_may_contain_equals() {
        let tree = parse_set("args=--flag=x", true).unwrap();
        assert_eq!(tree, json!({"args": "--flag=x"}));
    }

    #[test]
    fn test_parse_set_rejects_garbage() {
        assert!(parse_set("novalue", true).is_err());
        assert!(parse_set("=x", true).is_err());
        assert!(parse_set("a={x,y", true).is_err());
    }

    #[test]
    fn test_parse_set_scalar_extended_into_map_is_type_conflict() {
        let err = parse_set("a=1,a.b=2", true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueType);
        assert_eq!(
            err,
            ValuesError::TypeConflict {
                path: "a".into(),
                base: "number",
                overlay: "map",
            }
        );

        let err = parse_set("nodes[0].ip=10.0.0.2,nodes.first=x", true).unwrap_err();
        assert_eq!(
            err,
            ValuesError::TypeConflict {
                path: "nodes".into(),
                base: "sequence",
                overlay: "map",
            }
        );

        let err = parse_set("cluster.name=demo,cluster.name[0]=x", true).unwrap_err();
        assert_eq!(
            err,
            ValuesError::TypeConflict {
                path: "cluster.name".into(),
                base: "string",
                overlay: "sequence",
            }
        );
    }

    #[test]
    fn test_parse_set_leading_zero_stays_string() {
        let tree = parse_set("mode=0755", true).unwrap();
        assert_eq!(tree, json!({"mode": "0755"}));
    }

    #[test]
    fn test_parse_set_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.pem");
        std::fs::write(&path, "line1\nline2\n").unwrap();

        let with_at = parse_set_file(&format!("tls.ca=@{}", path.display())).unwrap();
        assert_eq!(with_at, json!({"tls": {"ca": "line1\nline2\n"}}));

        let without_at = parse_set_file(&format!("tls.ca={}", path.display())).unwrap();
        assert_eq!(with_at, without_at);

        let missing = parse_set_file("tls.ca=@/nonexistent/ca.pem").unwrap_err();
        assert!(matches!(missing, ValuesError::Read { .. }));
    }

    #[test]
    fn test_parse_set_json_forms() {
        assert_eq!(
            parse_set_json(r#"{"a": {"b": [1, 2]}}"#).unwrap(),
            json!({"a": {"b": [1, 2]}})
        );
        assert_eq!(
            parse_set_json(r#"cluster.network={"cni": "none"}"#).unwrap(),
            json!({"cluster": {"network": {"cni": "none"}}})
        );
        assert!(parse_set_json("a=not json").is_err());
    }
}
