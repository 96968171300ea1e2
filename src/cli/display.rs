//! Display formatting for CLI output
//!
//! SBIO pattern: pure functions that format data for display

use std::path::{Path, PathBuf};

use crate::error::{Classify, ErrorKind};
use crate::presets::Preset;
use crate::scanner::NodeInfo;

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No resources found.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut output = String::new();
    let mut push_row = |cells: Vec<String>| {
        let last = cells.len().saturating_sub(1);
        for (i, cell) in cells.into_iter().enumerate() {
            if i > 0 {
                output.push_str("   ");
            }
            if i < last && i < widths.len() {
                output.push_str(&format!("{:width$}", cell, width = widths[i]));
            } else {
                output.push_str(&cell);
            }
        }
        output.push('\n');
    };

    push_row(headers.iter().map(|h| h.to_uppercase()).collect());
    for row in rows {
        push_row(row);
    }
    output
}

// ============================================================================
// Errors
// ============================================================================

/// `error[<code>]: <message>`
pub fn format_error(kind: ErrorKind, message: &str) -> String {
    format!("error[{}]: {}", kind.code(), message)
}

pub fn format_classified<E: Classify + std::fmt::Display>(error: &E) -> String {
    format_error(error.kind(), &error.to_string())
}

// ============================================================================
// Init output
// ============================================================================

/// Nodes found by a scan.
pub fn format_node_list(nodes: &[NodeInfo]) -> String {
    let rows = nodes
        .iter()
        .map(|node| {
            let facts = &node.facts;
            vec![
                node.ip.to_string(),
                node.hostname.clone(),
                node.mac.clone().unwrap_or_else(|| "-".to_string()),
                facts
                    .memory
                    .as_ref()
                    .map(|m| format!("{} MiB", m.total_mib))
                    .unwrap_or_else(|| "-".to_string()),
                facts
                    .disks
                    .iter()
                    .map(|d| d.dev_path.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
            ]
        })
        .collect();
    format_table(&["ip", "hostname", "mac", "memory", "disks"], rows)
}

/// Files written, relative to the project root when possible.
pub fn format_written(root: &Path, files: &[PathBuf]) -> String {
    let mut output = String::new();
    for file in files {
        let shown = file.strip_prefix(root).unwrap_or(file);
        output.push_str(&format!("  created {}\n", shown.display()));
    }
    output
}

pub fn format_preset_list(presets: &[Preset]) -> String {
    let rows = presets
        .iter()
        .map(|p| vec![p.name.to_string(), p.description.to_string()])
        .collect();
    format_table(&["preset", "description"], rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::NodeFacts;

    #[test]
    fn test_format_table() {
        let output = format_table(
            &["NAME", "AGE"],
            vec![
                vec!["Alice".to_string(), "30".to_string()],
                vec!["Bob".to_string(), "25".to_string()],
            ],
        );
        assert_eq!(output, "NAME    AGE\nAlice   30\nBob     25\n");
    }

    #[test]
    fn test_format_table_empty() {
        let output = format_table(&["NAME"], vec![]);
        assert!(output.contains("No resources found"));
    }

    #[test]
    fn test_format_error() {
        assert_eq!(
            format_error(ErrorKind::SecretsMissing, "secrets bundle not found: secrets.yaml"),
            "error[SecretsMissing]: secrets bundle not found: secrets.yaml"
        );
    }

    #[test]
    fn test_format_node_list() {
        let facts = NodeFacts {
            hostname: "alpha".into(),
            memory: None,
            processors: vec![],
            disks: vec![],
            interfaces: vec![],
            addresses: vec![],
            routes: vec![],
            default_route: None,
            resolvers: vec![],
        };
        let node = NodeInfo::new("10.0.0.2".parse().unwrap(), facts);
        let output = format_node_list(&[node]);
        assert!(output.starts_with("IP"));
        assert!(output.contains("10.0.0.2"));
        assert!(output.contains("alpha"));
    }

    #[test]
    fn test_format_written() {
        let output = format_written(
            Path::new("/work"),
            &[PathBuf::from("/work/secrets.yaml"), PathBuf::from("/elsewhere/x")],
        );
        assert_eq!(output, "  created secrets.yaml\n  created /elsewhere/x\n");
    }
}
