//! File transfer value objects.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{DomainError, DomainResult};

/// Bare name of a file in the server directory.
///
/// Names address files directly under the shared root, so they may not
/// contain path separators or be `.`/`..`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileName(String);

impl FileName {
    pub fn new(value: impl Into<String>) -> DomainResult<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(DomainError::file_name(&value, "must not be empty"));
        }
        if value == "." || value == ".." {
            return Err(DomainError::file_name(&value, "must name a file"));
        }
        if value.contains(['/', '\\']) {
            return Err(DomainError::file_name(
                &value,
                "must not contain path separators",
            ));
        }
        if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(DomainError::file_name(
                &value,
                "must not contain whitespace",
            ));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for FileName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FileName> for String {
    fn from(name: FileName) -> Self {
        name.0
    }
}

impl AsRef<str> for FileName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The `(filename, byte_length)` pair agreed before raw bytes flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferDescriptor {
    pub name: FileName,
    pub size: u64,
}

impl TransferDescriptor {
    pub fn new(name: FileName, size: u64) -> Self {
        Self { name, size }
    }

    /// Parses the size field of a control line.
    ///
    /// Accepts only plain non-negative decimal integers.
    pub fn parse_size(field: &str) -> DomainResult<u64> {
        if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DomainError::ParseError {
                field: "size".to_string(),
                reason: format!("'{field}' is not a non-negative integer"),
            });
        }
        field.parse::<u64>().map_err(|e| DomainError::ParseError {
            field: "size".to_string(),
            reason: e.to_string(),
        })
    }
}

impl fmt::Display for TransferDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.name, self.size)
    }
}
