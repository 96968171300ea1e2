//! Talos version contracts

use std::fmt;
use std::str::FromStr;

use super::SecretsError;

/// `major.minor` of a Talos release, used to gate generated material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionContract {
    pub major: u32,
    pub minor: u32,
}

impl VersionContract {
    /// First contract that ships secretbox encryption at rest.
    pub const SECRETBOX: Self = Self { major: 1, minor: 0 };

    /// Works with any contract.
    pub const ANY: Self = Self { major: 0, minor: 0 };

    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Accepts `v1.9.0`, `1.9`, `v1.9.0-beta.1` and `v1.9.0+build`.
    pub fn parse(input: &str) -> Result<Self, SecretsError> {
        let invalid = || SecretsError::VersionContract(input.to_string());

        let trimmed = input.trim();
        let bare = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let core = bare.split(['-', '+']).next().unwrap_or_default();

        let parts: Vec<&str> = core.split('.').collect();
        if !(2..=3).contains(&parts.len()) {
            return Err(invalid());
        }
        let mut numbers = Vec::with_capacity(parts.len());
        for part in &parts {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid());
            }
            numbers.push(part.parse::<u32>().map_err(|_| invalid())?);
        }
        Ok(Self::new(numbers[0], numbers[1]))
    }

    pub fn supports_secretbox(&self) -> bool {
        *self >= Self::SECRETBOX
    }
}

impl FromStr for VersionContract {
    type Err = SecretsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for VersionContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Classify, ErrorKind};

    #[test]
    fn test_parse_accepted_forms() {
        assert_eq!(VersionContract::parse("v1.9.0").unwrap(), VersionContract::new(1, 9));
        assert_eq!(VersionContract::parse("1.9").unwrap(), VersionContract::new(1, 9));
        assert_eq!(VersionContract::parse("v1.10.0-beta.1").unwrap(), VersionContract::new(1, 10));
        assert_eq!(VersionContract::parse("v0.14.2+dirty").unwrap(), VersionContract::new(0, 14));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "v", "latest", "1", "v1.x", "1.2.3.4", "v1..2"] {
            let err = VersionContract::parse(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::VersionContract, "{bad}");
        }
    }

    #[test]
    fn test_ordering_and_secretbox_gate() {
        assert!(VersionContract::new(1, 10) > VersionContract::new(1, 9));
        assert!(VersionContract::new(1, 0).supports_secretbox());
        assert!(!VersionContract::new(0, 14).supports_secretbox());
    }

    #[test]
    fn test_display() {
        assert_eq!(VersionContract::new(1, 9).to_string(), "v1.9");
    }
}
