//! kin-core: local data protection for the Kin caregiving app
//!
//! # Module layout
//! - `crypto`       PIN type, PBKDF2 key derivation, AES-256-GCM envelopes, PIN hashes
//! - `metadata`     persisted salt / PIN hash / encryption flag record
//! - `local_store`  key/value stores (atomic file store, in-memory store)
//! - `remote`       PostgREST row store and key→table backend
//! - `field_map`    camelCase ↔ snake_case field table for remote rows
//! - `provider`     provider resolution, storage context, session key slot
//! - `storage`      save/load/remove over the resolved provider
//! - `security`     PIN and encryption lifecycle, permission checks, reset
//! - `backup`       checksummed export, validated import, merge-by-id
//! - `audit`        append-only security event trail
//! - `error`        unified error type

pub mod audit;
pub mod backup;
pub mod canonical;
pub mod config;
pub mod crypto;
pub mod error;
pub mod field_map;
pub mod keys;
pub mod local_store;
pub mod metadata;
pub mod permissions;
pub mod provider;
pub mod remote;
pub mod security;
pub mod storage;

pub use audit::{EventSeverity, SecurityAuditLog, SecurityEvent, SecurityEventType};
pub use backup::{export_backup, import_backup, BackupFile, BackupIntegrity, ImportSummary};
pub use config::{KinConfig, ProviderChoice};
pub use crypto::Pin;
pub use error::{KinError, Result};
pub use permissions::{Actor, Capability, Role};
pub use provider::{ProviderKind, StorageContext};
pub use storage::Storage;
