//! Uniform save/load/remove over named keys.
//!
//! Local provider: values are JSON strings in a `KeyValueStore`; when the
//! security metadata says encryption is on they are sealed into envelopes
//! with the session key. Reads accept both envelopes and legacy plaintext.
//!
//! Remote provider: values go through `RemoteBackend` as rows; encryption is
//! not applied.
//!
//! The public `save`/`load`/`remove` never fail. Backend errors are logged;
//! `load` falls back to the caller's default and decryption failures are also
//! written to the audit trail.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::audit::{EventSeverity, SecurityAuditLog, SecurityEvent, SecurityEventType};
use crate::config::KinConfig;
use crate::crypto::{decrypt, encrypt, EncryptedEnvelope};
use crate::error::{KinError, Result};
use crate::keys::{SECURITY_LOGS, SECURITY_METADATA};
use crate::local_store::{FileStore, KeyValueStore};
use crate::metadata::SecurityMetadataStore;
use crate::provider::{KeySlot, ProviderKind, StorageContext};
use crate::remote::{PostgrestRowStore, RemoteBackend, RowStore};

pub const SYSTEM_USER: &str = "system";

pub struct Storage {
    pub(crate) context: Arc<StorageContext>,
    pub(crate) local: Arc<dyn KeyValueStore>,
    pub(crate) remote: Option<RemoteBackend>,
    pub(crate) metadata: SecurityMetadataStore,
    pub(crate) keys: KeySlot,
    pub(crate) audit: SecurityAuditLog,
    /// Set once the stored trail has been merged (or found absent); until then
    /// writing the in-memory trail back would drop the stored events.
    pub(crate) audit_loaded: AtomicBool,
}

impl Storage {
    /// `rows` is required when the context selects the remote provider.
    pub fn new(
        context: Arc<StorageContext>,
        local: Arc<dyn KeyValueStore>,
        rows: Option<Arc<dyn RowStore>>,
    ) -> Result<Self> {
        let remote = match (context.provider(), rows) {
            (ProviderKind::Supabase, Some(rows)) => {
                Some(RemoteBackend::new(rows, context.family_id()))
            }
            (ProviderKind::Supabase, None) => {
                return Err(KinError::StorageBackend(
                    "remote provider selected without a row store".into(),
                ))
            }
            (ProviderKind::Local, _) => None,
        };
        Ok(Self {
            metadata: SecurityMetadataStore::new(local.clone()),
            context,
            local,
            remote,
            keys: KeySlot::new(),
            audit: SecurityAuditLog::new(),
            audit_loaded: AtomicBool::new(false),
        })
    }

    /// Production wiring: file store in the configured data dir plus the
    /// Supabase REST client when the context selects it.
    pub fn open(context: Arc<StorageContext>, config: &KinConfig) -> Result<Self> {
        let local: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(config.data_dir()?)?);
        let rows: Option<Arc<dyn RowStore>> = match context.provider() {
            ProviderKind::Supabase => {
                let creds = config.remote_credentials().ok_or_else(|| {
                    KinError::StorageBackend("remote credentials missing".into())
                })?;
                Some(Arc::new(PostgrestRowStore::new(&creds)?))
            }
            ProviderKind::Local => None,
        };
        Self::new(context, local, rows)
    }

    pub fn context(&self) -> &StorageContext {
        &self.context
    }

    pub fn metadata(&self) -> &SecurityMetadataStore {
        &self.metadata
    }

    pub fn audit(&self) -> &SecurityAuditLog {
        &self.audit
    }

    pub fn is_unlocked(&self) -> bool {
        self.keys.is_unlocked()
    }

    // ── Public, failure-absorbing API ───────────────────────────────────────

    pub async fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(err) => {
                error!(key, error = %err, "cannot serialise value, not saved");
                return;
            }
        };
        if let Err(err) = self.write_value(key, &value).await {
            self.absorb("save", key, err).await;
        }
    }

    pub async fn load<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.read_value(key).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(v) => v,
                Err(err) => {
                    error!(key, error = %err, "stored value has unexpected shape, using default");
                    default
                }
            },
            Ok(None) => default,
            Err(err) => {
                self.absorb("load", key, err).await;
                default
            }
        }
    }

    pub async fn remove(&self, key: &str) {
        let result = match &self.remote {
            Some(remote) => remote.remove(key).await,
            None => self.local.delete(key).await,
        };
        if let Err(err) = result {
            self.absorb("remove", key, err).await;
        }
    }

    /// Spawn a save so a mutation can return immediately. Await the handle
    /// to wait for it; drop it to fire and forget.
    pub fn persist<T: Serialize + ?Sized>(self: &Arc<Self>, key: &str, value: &T) -> JoinHandle<()> {
        let storage = Arc::clone(self);
        let key = key.to_string();
        let value = serde_json::to_value(value);
        tokio::spawn(async move {
            match value {
                Ok(value) => storage.save(&key, &value).await,
                Err(err) => error!(key = %key, error = %err, "cannot serialise value, not saved"),
            }
        })
    }

    // ── Fallible core used by security and backup flows ─────────────────────

    pub(crate) async fn read_value(&self, key: &str) -> Result<Option<Value>> {
        if let Some(remote) = &self.remote {
            return remote.load(key).await;
        }
        let Some(raw) = self.local.get(key).await? else {
            return Ok(None);
        };
        if let Some(envelope) = EncryptedEnvelope::parse(&raw) {
            let key_material = self.keys.get().ok_or(KinError::Locked)?;
            return decrypt(&envelope, &key_material).map(Some);
        }
        debug!(key, "read plaintext value");
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub(crate) async fn write_value(&self, key: &str, value: &Value) -> Result<()> {
        if let Some(remote) = &self.remote {
            return remote.save(key, value.clone()).await;
        }
        let raw = self.seal_for_local(key, value).await?;
        self.local.set(key, &raw).await
    }

    /// Serialised form for the local store, encrypted when required.
    pub(crate) async fn seal_for_local(&self, key: &str, value: &Value) -> Result<String> {
        if key != SECURITY_METADATA && self.metadata.get().await.encryption_enabled {
            let key_material = self.keys.get().ok_or(KinError::Locked)?;
            return encrypt(value, &key_material)?.to_json();
        }
        Ok(serde_json::to_string(value)?)
    }

    /// Keys held by the local store, the metadata record excluded.
    pub(crate) async fn local_data_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .local
            .keys()
            .await?
            .into_iter()
            .filter(|k| k != SECURITY_METADATA)
            .collect())
    }

    async fn absorb(&self, op: &str, key: &str, err: KinError) {
        error!(
            op,
            key,
            provider = %self.context.provider(),
            error = %err,
            "storage operation failed"
        );
        if matches!(err, KinError::Decryption) {
            self.record_event(
                format!("could not decrypt {key}; value left untouched"),
                EventSeverity::Warning,
                SecurityEventType::DecryptionFailure,
                SYSTEM_USER,
            )
            .await;
        }
    }

    // ── Audit persistence ───────────────────────────────────────────────────

    /// Append an event and write the whole trail back through the provider.
    pub async fn record_event(
        &self,
        details: impl Into<String>,
        severity: EventSeverity,
        event_type: SecurityEventType,
        user: impl Into<String>,
    ) -> SecurityEvent {
        let event = self.audit.record(details, severity, event_type, user);
        self.persist_audit().await;
        event
    }

    pub(crate) async fn persist_audit(&self) {
        if !self.audit_loaded.load(Ordering::Acquire) {
            self.load_audit_log().await;
            if !self.audit_loaded.load(Ordering::Acquire) {
                debug!("stored audit trail not readable yet, keeping events in memory");
                return;
            }
        }
        let events = match serde_json::to_value(self.audit.events()) {
            Ok(v) => v,
            Err(err) => {
                error!(error = %err, "cannot serialise audit trail");
                return;
            }
        };
        if let Err(err) = self.write_value(SECURITY_LOGS, &events).await {
            warn!(error = %err, "audit trail not persisted yet");
        }
    }

    /// Merge the stored trail into memory. Quietly does nothing while the
    /// store is encrypted and locked; recording an event calls this first, so
    /// a fresh session never writes over events it has not read.
    pub async fn load_audit_log(&self) {
        match self.read_value(SECURITY_LOGS).await {
            Ok(Some(value)) => {
                match serde_json::from_value::<Vec<SecurityEvent>>(value) {
                    Ok(stored) => self.audit.hydrate(stored),
                    Err(err) => warn!(error = %err, "stored audit trail unreadable, starting over"),
                }
                self.audit_loaded.store(true, Ordering::Release);
            }
            Ok(None) => self.audit_loaded.store(true, Ordering::Release),
            Err(KinError::Locked) => {}
            Err(err) => warn!(error = %err, "cannot load audit trail"),
        }
    }
}
