//! Append-only security audit trail.
//!
//! Events are held oldest-first. There is no per-event update or delete; the
//! only way to drop events is `clear`, used by a full data reset. Persistence
//! goes through the storage provider under `kin_security_logs`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityEventType {
    PinSet,
    PinChanged,
    PinFailed,
    PinHashUpgraded,
    Unlocked,
    Locked,
    EncryptionEnabled,
    EncryptionDisabled,
    BackupExported,
    BackupImported,
    ImportRejected,
    PermissionDenied,
    DecryptionFailure,
    DataReset,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: SecurityEventType,
    pub details: String,
    pub severity: EventSeverity,
    pub user: String,
}

#[derive(Debug, Default)]
pub struct SecurityAuditLog {
    events: Mutex<Vec<SecurityEvent>>,
}

impl SecurityAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        details: impl Into<String>,
        severity: EventSeverity,
        event_type: SecurityEventType,
        user: impl Into<String>,
    ) -> SecurityEvent {
        let event = SecurityEvent {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type,
            details: details.into(),
            severity,
            user: user.into(),
        };
        self.events.lock().push(event.clone());
        event
    }

    /// Oldest first, as stored.
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events.lock().clone()
    }

    /// Newest first, for display.
    pub fn recent(&self, limit: Option<usize>) -> Vec<SecurityEvent> {
        let mut out = self.events();
        out.reverse();
        if let Some(lim) = limit {
            out.truncate(lim);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge events read back from storage with those recorded in this
    /// process. Stored events come first; duplicates by id are dropped.
    pub fn hydrate(&self, stored: Vec<SecurityEvent>) {
        let mut events = self.events.lock();
        let known: HashSet<String> = stored.iter().map(|e| e.id.clone()).collect();
        let mut merged = stored;
        merged.extend(events.drain(..).filter(|e| !known.contains(&e.id)));
        *events = merged;
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}
