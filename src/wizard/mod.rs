//! Init wizard
//!
//! A presenter (the CLI, or an interactive front end) turns user input into
//! [`Intent`]s. The [`Controller`] checks each one against the transition
//! table, updates the collected [`InitData`] and reports the new state.
//! Scans and the Generate step run in the background and report through
//! [`WizardEvent`]s; their terminal events become intents again.

mod controller;
pub mod data;
pub mod generate;
pub mod state;

pub use controller::{run_generate, run_scan, Controller, Intent};
pub use data::{node_overlay, InitData, InitMode, NodeConfig, NodeRole};
pub use state::WizardState;

use std::path::PathBuf;

use thiserror::Error;

use crate::error::{Classify, ErrorKind};
use crate::render::RenderError;
use crate::scanner::{NodeInfo, ScanError};
use crate::secrets::SecretsError;
use crate::talosconfig::TalosconfigError;

/// Errors from the wizard. The wizard state is left as it was.
#[derive(Error, Debug)]
pub enum WizardError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: WizardState, to: WizardState },

    #[error("{0}")]
    Validation(String),

    #[error("refusing to overwrite existing file: {}", .0.display())]
    Exists(PathBuf),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("preset is broken: {0}")]
    Preset(String),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Secrets(#[from] SecretsError),

    #[error(transparent)]
    Talosconfig(#[from] TalosconfigError),

    #[error(transparent)]
    Render(#[from] RenderError),
}

impl Classify for WizardError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Exists(_) => ErrorKind::FilesystemExists,
            Self::Io { .. } => ErrorKind::Filesystem,
            Self::Preset(_) => ErrorKind::Internal,
            Self::Scan(e) => e.kind(),
            Self::Secrets(e) => e.kind(),
            Self::Talosconfig(e) => e.kind(),
            Self::Render(e) => e.kind(),
        }
    }
}

/// Reports from background work. Progress events may be dropped when the
/// presenter falls behind; terminal events are always delivered.
#[derive(Debug, Clone, PartialEq)]
pub enum WizardEvent {
    ScanProgress(u8),
    ScanFinished(Vec<NodeInfo>),
    ScanFailed {
        message: String,
        kind: ErrorKind,
        partial: Vec<NodeInfo>,
    },
    GenerateProgress {
        step: String,
        percent: u8,
    },
    GenerateFinished(Vec<PathBuf>),
    GenerateFailed {
        message: String,
        kind: ErrorKind,
    },
}

impl WizardEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::ScanProgress(_) | Self::GenerateProgress { .. })
    }

    /// The intent a terminal event feeds back into the controller.
    pub fn into_intent(self) -> Option<Intent> {
        match self {
            Self::ScanFinished(nodes) => Some(Intent::ScanFinished(nodes)),
            Self::ScanFailed { message, partial, .. } => Some(Intent::ScanFailed { message, partial }),
            Self::GenerateFinished(files) => Some(Intent::GenerateFinished(files)),
            Self::GenerateFailed { message, .. } => Some(Intent::GenerateFailed { message }),
            Self::ScanProgress(_) | Self::GenerateProgress { .. } => None,
        }
    }
}
