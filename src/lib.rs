//! talm: render and apply Talos Linux machine configurations from
//! Helm-style charts.
//!
//! A project is a chart (`Chart.yaml`, `values.yaml`, `templates/`) plus a
//! secrets bundle. Templates are rendered per node with facts read from the
//! node itself, patched with the node's own file, and pushed with talosctl.

pub mod cli;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod modeline;
pub mod observe;
pub mod presets;
pub mod render;
pub mod scanner;
pub mod secrets;
pub mod talosconfig;
pub mod values;
pub mod wizard;
