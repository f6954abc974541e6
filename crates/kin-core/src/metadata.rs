//! Security metadata: the salt, PIN hash and encryption flag. Stored in
//! plaintext in the local store because the salt is needed before any key
//! can be derived.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::crypto::generate_salt_hex;
use crate::error::{KinError, Result};
use crate::keys::SECURITY_METADATA;
use crate::local_store::KeyValueStore;

pub const METADATA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityMetadata {
    pub salt_hex: String,
    #[serde(default)]
    pub pin_hash: String,
    #[serde(default)]
    pub is_secure_pin_hash: bool,
    #[serde(default)]
    pub encryption_enabled: bool,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    METADATA_VERSION
}

impl Default for SecurityMetadata {
    /// What `get` reports when nothing usable is stored: no salt, no PIN,
    /// encryption off.
    fn default() -> Self {
        Self {
            salt_hex: String::new(),
            pin_hash: String::new(),
            is_secure_pin_hash: false,
            encryption_enabled: false,
            version: METADATA_VERSION,
        }
    }
}

impl SecurityMetadata {
    pub fn has_pin(&self) -> bool {
        !self.pin_hash.is_empty()
    }

    fn fresh() -> Self {
        Self {
            salt_hex: generate_salt_hex(),
            ..Self::default()
        }
    }
}

/// Partial update; `None` fields keep their stored value.
#[derive(Debug, Clone, Default)]
pub struct SecurityMetadataPatch {
    pub salt_hex: Option<String>,
    pub pin_hash: Option<String>,
    pub is_secure_pin_hash: Option<bool>,
    pub encryption_enabled: Option<bool>,
}

impl SecurityMetadataPatch {
    fn apply(self, meta: &mut SecurityMetadata) {
        if let Some(salt) = self.salt_hex {
            meta.salt_hex = salt;
        }
        if let Some(hash) = self.pin_hash {
            meta.pin_hash = hash;
        }
        if let Some(secure) = self.is_secure_pin_hash {
            meta.is_secure_pin_hash = secure;
        }
        if let Some(enabled) = self.encryption_enabled {
            meta.encryption_enabled = enabled;
        }
    }
}

#[derive(Clone)]
pub struct SecurityMetadataStore {
    store: Arc<dyn KeyValueStore>,
}

impl SecurityMetadataStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Never fails: unreadable or corrupt metadata reads as the default so a
    /// damaged install does not lock its owner out.
    pub async fn get(&self) -> SecurityMetadata {
        match self.store.get(SECURITY_METADATA).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!(error = %err, "security metadata corrupt, using defaults");
                SecurityMetadata::default()
            }),
            Ok(None) => SecurityMetadata::default(),
            Err(err) => {
                warn!(error = %err, "security metadata unreadable, using defaults");
                SecurityMetadata::default()
            }
        }
    }

    /// Read-modify-write merge. The first call on a fresh install creates the
    /// record with a new salt.
    pub async fn update(&self, patch: SecurityMetadataPatch) -> Result<SecurityMetadata> {
        let existing = self
            .store
            .get(SECURITY_METADATA)
            .await
            .map_err(|e| KinError::MetadataPersist(e.to_string()))?;
        let mut meta = match existing {
            Some(raw) => serde_json::from_str::<SecurityMetadata>(&raw).map_err(|e| {
                KinError::MetadataPersist(format!("stored metadata is corrupt: {e}"))
            })?,
            None => SecurityMetadata::fresh(),
        };
        if meta.salt_hex.is_empty() {
            meta.salt_hex = generate_salt_hex();
        }
        patch.apply(&mut meta);
        meta.version = METADATA_VERSION;

        let raw = serde_json::to_string(&meta)?;
        self.store
            .set(SECURITY_METADATA, &raw)
            .await
            .map_err(|e| KinError::MetadataPersist(e.to_string()))?;
        Ok(meta)
    }

    pub async fn clear(&self) -> Result<()> {
        self.store
            .delete(SECURITY_METADATA)
            .await
            .map_err(|e| KinError::MetadataPersist(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_store::MemoryStore;
    use async_trait::async_trait;

    struct BrokenStore;

    #[async_trait]
    impl KeyValueStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(KinError::StorageBackend("disk gone".into()))
        }
        async fn set(&self, _key: &str, _value: &str) -> Result<()> {
            Err(KinError::StorageBackend("disk gone".into()))
        }
        async fn delete(&self, _key: &str) -> Result<()> {
            Err(KinError::StorageBackend("disk gone".into()))
        }
        async fn keys(&self) -> Result<Vec<String>> {
            Err(KinError::StorageBackend("disk gone".into()))
        }
    }

    #[tokio::test]
    async fn first_update_creates_record_with_salt() {
        let store = SecurityMetadataStore::new(Arc::new(MemoryStore::new()));
        assert_eq!(store.get().await, SecurityMetadata::default());

        let meta = store.update(SecurityMetadataPatch::default()).await.unwrap();
        assert_eq!(meta.salt_hex.len(), 32);
        assert!(meta.salt_hex.bytes().all(|b| b.is_ascii_hexdigit()));
        assert!(!meta.encryption_enabled);
        assert_eq!(store.get().await, meta);
    }

    #[tokio::test]
    async fn update_merges_and_keeps_salt() {
        let store = SecurityMetadataStore::new(Arc::new(MemoryStore::new()));
        let first = store.update(SecurityMetadataPatch::default()).await.unwrap();
        let second = store
            .update(SecurityMetadataPatch {
                encryption_enabled: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(second.salt_hex, first.salt_hex);
        assert!(second.encryption_enabled);
        assert_eq!(second.pin_hash, "");
    }

    #[tokio::test]
    async fn broken_store_reads_default_and_fails_writes() {
        let store = SecurityMetadataStore::new(Arc::new(BrokenStore));
        assert_eq!(store.get().await, SecurityMetadata::default());
        assert!(matches!(
            store.update(SecurityMetadataPatch::default()).await,
            Err(KinError::MetadataPersist(_))
        ));
    }

    #[tokio::test]
    async fn corrupt_record_reads_default() {
        let kv = Arc::new(MemoryStore::new());
        kv.set(SECURITY_METADATA, "{not json").await.unwrap();
        let store = SecurityMetadataStore::new(kv);
        assert_eq!(store.get().await, SecurityMetadata::default());
    }
}
