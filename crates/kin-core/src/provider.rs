//! Provider selection and the process-wide storage context.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

use crate::config::{KinConfig, ProviderChoice};
use crate::crypto::DerivedKey;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Local,
    Supabase,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Local => f.write_str("local"),
            ProviderKind::Supabase => f.write_str("supabase"),
        }
    }
}

/// Priority: explicit override, then the configured provider, then remote if
/// credentials are present, then local. `Auto` at either level defers to the
/// next rule.
pub fn resolve_provider(requested: Option<ProviderChoice>, config: &KinConfig) -> ProviderKind {
    match requested {
        Some(ProviderChoice::Local) => return ProviderKind::Local,
        Some(ProviderChoice::Supabase) => return ProviderKind::Supabase,
        Some(ProviderChoice::Auto) | None => {}
    }
    match config.provider {
        Some(ProviderChoice::Local) => ProviderKind::Local,
        Some(ProviderChoice::Supabase) => ProviderKind::Supabase,
        Some(ProviderChoice::Auto) | None => {
            if config.remote_credentials().is_some() {
                ProviderKind::Supabase
            } else {
                ProviderKind::Local
            }
        }
    }
}

/// Resolved once at startup and shared by reference. Tests that need a
/// different provider build a second context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageContext {
    provider: ProviderKind,
    family_id: String,
}

impl StorageContext {
    pub fn new(provider: ProviderKind, family_id: impl Into<String>) -> Self {
        Self {
            provider,
            family_id: family_id.into(),
        }
    }

    pub fn resolve(requested: Option<ProviderChoice>, config: &KinConfig) -> Self {
        let mut provider = resolve_provider(requested, config);
        if provider == ProviderKind::Supabase && config.remote_credentials().is_none() {
            warn!("supabase selected but SUPABASE_URL/SUPABASE_ANON_KEY missing; using local storage");
            provider = ProviderKind::Local;
        }
        let family_id = config.family_id();
        info!(%provider, family_id = %family_id, "storage provider resolved");
        Self {
            provider,
            family_id,
        }
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    pub fn family_id(&self) -> &str {
        &self.family_id
    }
}

/// In-memory home of the derived key for the current session.
#[derive(Debug, Default)]
pub struct KeySlot {
    key: RwLock<Option<DerivedKey>>,
}

impl KeySlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: DerivedKey) {
        *self.key.write() = Some(key);
    }

    /// Drops (and so zeroizes) the key.
    pub fn clear(&self) {
        *self.key.write() = None;
    }

    pub fn get(&self) -> Option<DerivedKey> {
        self.key.read().clone()
    }

    pub fn is_unlocked(&self) -> bool {
        self.key.read().is_some()
    }
}
