use std::fmt;

use thiserror::Error;

use crate::permissions::Capability;

/// One failed structural check on an imported backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    /// JSON path of the offending field, e.g. `entries[3].id`.
    pub field: String,
    pub reason: String,
}

impl SchemaViolation {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

fn join_violations(violations: &[SchemaViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum KinError {
    #[error("PIN must be exactly 4 digits")]
    InvalidPin,

    #[error("Incorrect PIN")]
    IncorrectPin,

    #[error("No PIN has been set")]
    PinNotSet,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Failed to encrypt value, try again")]
    Encryption,

    #[error("Decryption failed (wrong key, corrupted ciphertext or tag mismatch)")]
    Decryption,

    #[error("Storage is locked; enter the PIN first")]
    Locked,

    #[error("Failed to persist security metadata: {0}")]
    MetadataPersist(String),

    #[error("Storage backend error: {0}")]
    StorageBackend(String),

    #[error("Backup checksum mismatch; the file was altered or corrupted")]
    ChecksumMismatch,

    #[error("Backup failed schema validation: {}", join_violations(.0))]
    SchemaValidation(Vec<SchemaViolation>),

    #[error("Backup file is malformed: {0}")]
    MalformedFile(String),

    #[error("Permission denied: {actor} may not {capability}")]
    PermissionDenied {
        actor: String,
        capability: Capability,
    },

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, KinError>;
