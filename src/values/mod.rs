//! Layered value tree
//!
//! Values reach a render from several places, lowest priority first:
//! - chart defaults (`values.yaml` of the chart)
//! - value files, in declaration order
//! - inline key paths (`--set a.b=c`, `--set-string`)
//! - file inlines (`--set-file a.b=@path`)
//! - JSON fragments (`--set-json`)
//!
//! Everything is folded into one `serde_json::Value` mapping with [`merge`].

mod sources;
mod strvals;

pub use sources::{load_values_file, parse_values_document, ValueSources};
pub use strvals::{parse_set, parse_set_file, parse_set_json};

use serde_json::map::Entry;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::{Classify, ErrorKind};

/// Errors raised while building the value tree
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValuesError {
    #[error("values from {origin} must be a mapping at the top level, found {found}")]
    Shape { origin: String, found: &'static str },

    #[error("cannot merge {overlay} into {base} at '{path}'")]
    TypeConflict {
        path: String,
        base: &'static str,
        overlay: &'static str,
    },

    #[error("invalid value expression '{expr}': {reason}")]
    Expression { expr: String, reason: String },

    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse {origin}: {reason}")]
    Parse { origin: String, reason: String },
}

impl Classify for ValuesError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Shape { .. } | Self::Parse { .. } => ErrorKind::ValueShape,
            Self::TypeConflict { .. } => ErrorKind::ValueType,
            Self::Expression { .. } => ErrorKind::Validation,
            Self::Read { .. } => ErrorKind::Filesystem,
        }
    }
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// An empty mapping, the identity element of [`merge`].
pub fn empty() -> Value {
    Value::Object(Map::new())
}

/// Human name of a value's type, used in error messages.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "map",
    }
}

/// Deep-merge `overlay` into `base`.
///
/// Maps recurse, scalars and sequences are replaced, a null overlay value
/// removes the key. A map meeting a non-map on either side is a
/// [`ValuesError::TypeConflict`] naming the dotted path of the collision.
///
/// Merging is associative only when sources are folded left to right, lowest
/// priority first, as [`ValueSources::resolve`] does. A null deletes what the
/// tree holds at that point, so `a + (b + c)` can differ from `(a + b) + c`
/// once a null is involved.
pub fn merge(base: &mut Value, overlay: Value) -> Result<(), ValuesError> {
    let mut path = Vec::new();
    merge_at(base, overlay, &mut path)
}

fn merge_at(base: &mut Value, overlay: Value, path: &mut Vec<String>) -> Result<(), ValuesError> {
    match overlay {
        Value::Object(overlay_map) => {
            match base {
                Value::Object(base_map) => {
                    for (key, value) in overlay_map {
                        if value.is_null() {
                            base_map.remove(&key);
                            continue;
                        }
                        path.push(key.clone());
                        match base_map.entry(key) {
                            Entry::Occupied(mut slot) => merge_at(slot.get_mut(), value, path)?,
                            Entry::Vacant(slot) => {
                                slot.insert(value);
                            }
                        }
                        path.pop();
                    }
                }
                Value::Null => *base = Value::Object(overlay_map),
                other => {
                    return Err(ValuesError::TypeConflict {
                        path: join_path(path),
                        base: type_name(other),
                        overlay: "map",
                    })
                }
            }
            Ok(())
        }
        // A null at the root merges nothing.
        Value::Null if path.is_empty() => Ok(()),
        other => {
            if base.is_object() {
                return Err(ValuesError::TypeConflict {
                    path: join_path(path),
                    base: "map",
                    overlay: type_name(&other),
                });
            }
            *base = other;
            Ok(())
        }
    }
}

fn join_path(path: &[String]) -> String {
    if path.is_empty() {
        "<root>".to_string()
    } else {
        path.join(".")
    }
}

/// One step of a value path such as `a.b[0].c`
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// Split a dotted value path into segments.
///
/// `\.` keeps a literal dot inside a key, `[n]` indexes a sequence.
pub fn path_segments(path: &str) -> Result<Vec<Segment>, ValuesError> {
    let invalid = |reason: &str| ValuesError::Expression {
        expr: path.to_string(),
        reason: reason.to_string(),
    };

    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) => current.push(escaped),
                None => return Err(invalid("dangling escape")),
            },
            '.' => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                } else if !matches!(segments.last(), Some(Segment::Index(_))) {
                    return Err(invalid("empty key segment"));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
                let mut digits = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(d) if d.is_ascii_digit() => digits.push(d),
                        _ => return Err(invalid("malformed list index")),
                    }
                }
                let index: usize = digits.parse().map_err(|_| invalid("malformed list index"))?;
                if index > MAX_INDEX {
                    return Err(invalid("list index too large"));
                }
                segments.push(Segment::Index(index));
            }
            other => current.push(other),
        }
    }

    if !current.is_empty() {
        segments.push(Segment::Key(current));
    }
    if segments.is_empty() {
        return Err(invalid("empty path"));
    }
    Ok(segments)
}

/// Largest list index accepted in a key path.
pub const MAX_INDEX: usize = 65_536;

/// Read-only lookup of a dotted path.
pub fn get_path<'a>(tree: &'a Value, path: &str) -> Option<&'a Value> {
    let segments = path_segments(path).ok()?;
    let mut node = tree;
    for segment in &segments {
        node = match segment {
            Segment::Key(key) => node.as_object()?.get(key)?,
            Segment::Index(index) => node.as_array()?.get(*index)?,
        };
    }
    Some(node)
}
