//! Stable error taxonomy
//!
//! Every component keeps its own `thiserror` enum. Each of them implements
//! [`Classify`] so that the CLI can map any failure onto a machine-readable
//! code and a process exit code without knowing the component it came from.

use std::fmt;

/// Machine-readable error kinds shared by all components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    ValueType,
    ValueShape,
    VersionContract,
    SecretsMissing,
    SecretsInvalid,
    SecretPathMissing,
    OfflineFactRequired,
    DiscoveryUnavailable,
    Timeout,
    Cancelled,
    TemplateParse,
    TemplateEval,
    TemplateTooComplex,
    OutputMalformed,
    SchemaMismatch,
    ModelineInvalid,
    InvalidTransition,
    FilesystemExists,
    Filesystem,
    Internal,
}

impl ErrorKind {
    /// Stable code printed next to every error message.
    pub fn code(self) -> &'static str {
        match self {
            Self::Validation => "Validation",
            Self::ValueType => "ValueType",
            Self::ValueShape => "ValueShape",
            Self::VersionContract => "VersionContract",
            Self::SecretsMissing => "SecretsMissing",
            Self::SecretsInvalid => "SecretsInvalid",
            Self::SecretPathMissing => "SecretPathMissing",
            Self::OfflineFactRequired => "OfflineFactRequired",
            Self::DiscoveryUnavailable => "DiscoveryUnavailable",
            Self::Timeout => "Timeout",
            Self::Cancelled => "Cancelled",
            Self::TemplateParse => "TemplateParse",
            Self::TemplateEval => "TemplateEval",
            Self::TemplateTooComplex => "TemplateTooComplex",
            Self::OutputMalformed => "OutputMalformed",
            Self::SchemaMismatch => "SchemaMismatch",
            Self::ModelineInvalid => "ModelineInvalid",
            Self::InvalidTransition => "InvalidTransition",
            Self::FilesystemExists => "FilesystemExists",
            Self::Filesystem => "Filesystem",
            Self::Internal => "Internal",
        }
    }

    /// Process exit code for this kind.
    ///
    /// `2` input/validation, `3` filesystem, `4` template, `5` external,
    /// `1` anything else.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Validation
            | Self::ValueType
            | Self::ValueShape
            | Self::VersionContract
            | Self::SecretsMissing
            | Self::SecretsInvalid
            | Self::ModelineInvalid
            | Self::InvalidTransition => 2,
            Self::FilesystemExists | Self::Filesystem => 3,
            Self::TemplateParse
            | Self::TemplateEval
            | Self::TemplateTooComplex
            | Self::OutputMalformed
            | Self::SchemaMismatch
            | Self::OfflineFactRequired
            | Self::SecretPathMissing => 4,
            Self::DiscoveryUnavailable | Self::Timeout | Self::Cancelled => 5,
            Self::Internal => 1,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Implemented by every component error so callers can classify failures.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_by_family() {
        assert_eq!(ErrorKind::Validation.exit_code(), 2);
        assert_eq!(ErrorKind::ValueType.exit_code(), 2);
        assert_eq!(ErrorKind::Filesystem.exit_code(), 3);
        assert_eq!(ErrorKind::FilesystemExists.exit_code(), 3);
        assert_eq!(ErrorKind::TemplateTooComplex.exit_code(), 4);
        assert_eq!(ErrorKind::OfflineFactRequired.exit_code(), 4);
        assert_eq!(ErrorKind::Timeout.exit_code(), 5);
        assert_eq!(ErrorKind::Internal.exit_code(), 1);
    }

    #[test]
    fn test_display_is_code() {
        assert_eq!(ErrorKind::ModelineInvalid.to_string(), "ModelineInvalid");
    }
}
