//! PIN and encryption lifecycle, permission checks and full reset.
//!
//! Every state-changing operation authorises first and computes all new
//! ciphertexts in memory. Re-sealed values are written next and the metadata
//! record is flipped last; if any write or the metadata update fails, the
//! values already rewritten are restored from their original stored form, so
//! the PIN and the data stay readable together.

use serde_json::Value;
use std::sync::atomic::Ordering;
use tracing::{error, info, warn};

use crate::audit::{EventSeverity, SecurityEventType};
use crate::crypto::{
    decrypt, derive_key, encrypt, generate_salt_hex, hash_pin, verify_pin_hash, DerivedKey,
    EncryptedEnvelope, Pin,
};
use crate::error::{KinError, Result};
use crate::keys;
use crate::metadata::{SecurityMetadata, SecurityMetadataPatch};
use crate::permissions::{Actor, Capability};
use crate::storage::{Storage, SYSTEM_USER};

/// One local value during a migration: what is stored now and what replaces it.
struct Resealed {
    key: String,
    original: String,
    sealed: String,
}

/// How a value should be re-sealed during a migration.
#[derive(Clone, Copy)]
enum Reseal<'a> {
    Encrypt(&'a DerivedKey),
    Plaintext,
}

impl Storage {
    /// Fails with `PermissionDenied` before any state change, and records the
    /// denial.
    pub async fn authorize(&self, actor: &Actor, capability: Capability) -> Result<()> {
        if actor.role.allows(capability) {
            return Ok(());
        }
        warn!(actor = %actor.name, %capability, "permission denied");
        self.record_event(
            format!("{} ({:?}) attempted to {}", actor.name, actor.role, capability),
            EventSeverity::Warning,
            SecurityEventType::PermissionDenied,
            actor.name.clone(),
        )
        .await;
        Err(KinError::PermissionDenied {
            actor: actor.name.clone(),
            capability,
        })
    }

    /// Verify `pin` against the stored hash, recording a failed attempt.
    /// Legacy hashes are upgraded to Argon2id on success.
    async fn check_pin(&self, actor: &Actor, meta: &SecurityMetadata, pin: &Pin) -> Result<()> {
        if !meta.has_pin() {
            return Err(KinError::PinNotSet);
        }
        if !verify_pin_hash(pin, &meta.pin_hash, meta.is_secure_pin_hash) {
            self.record_event(
                "incorrect PIN entered",
                EventSeverity::Warning,
                SecurityEventType::PinFailed,
                actor.name.clone(),
            )
            .await;
            return Err(KinError::IncorrectPin);
        }
        if !meta.is_secure_pin_hash {
            let upgraded = hash_pin(pin)?;
            self.metadata
                .update(SecurityMetadataPatch {
                    pin_hash: Some(upgraded),
                    is_secure_pin_hash: Some(true),
                    ..Default::default()
                })
                .await?;
            self.record_event(
                "legacy PIN hash upgraded to argon2id",
                EventSeverity::Info,
                SecurityEventType::PinHashUpgraded,
                actor.name.clone(),
            )
            .await;
        }
        Ok(())
    }

    /// Derive the session key from `pin` and merge the stored audit trail.
    pub async fn unlock(&self, actor: &Actor, pin: &Pin) -> Result<()> {
        let meta = self.metadata.get().await;
        self.check_pin(actor, &meta, pin).await?;
        let key = derive_key(pin, &meta.salt_hex)?;
        self.keys.set(key);
        self.load_audit_log().await;
        self.record_event(
            "storage unlocked",
            EventSeverity::Info,
            SecurityEventType::Unlocked,
            actor.name.clone(),
        )
        .await;
        info!(actor = %actor.name, "unlocked");
        Ok(())
    }

    pub async fn lock(&self, actor: &Actor) {
        self.record_event(
            "storage locked",
            EventSeverity::Info,
            SecurityEventType::Locked,
            actor.name.clone(),
        )
        .await;
        self.keys.clear();
    }

    /// Set the first PIN, or change it (`current` must then verify). With
    /// encryption on, every local value is re-sealed under the new key.
    pub async fn set_pin(&self, actor: &Actor, current: Option<&Pin>, new: &Pin) -> Result<()> {
        self.authorize(actor, Capability::ManageSecurity).await?;
        let meta = self.metadata.get().await;
        let changing = meta.has_pin();
        if changing {
            let current = current.ok_or(KinError::IncorrectPin)?;
            self.check_pin(actor, &meta, current).await?;
        }

        let salt = if meta.salt_hex.is_empty() {
            generate_salt_hex()
        } else {
            meta.salt_hex.clone()
        };
        let new_hash = hash_pin(new)?;
        let new_key = derive_key(new, &salt)?;

        let resealed = if meta.encryption_enabled && self.remote.is_none() {
            let current = current.ok_or(KinError::Locked)?;
            let old_key = derive_key(current, &meta.salt_hex)?;
            self.reseal_local(Some(&old_key), Reseal::Encrypt(&new_key))
                .await?
        } else {
            Vec::new()
        };

        self.commit_local(&resealed).await?;
        self.update_or_restore(
            &resealed,
            SecurityMetadataPatch {
                salt_hex: Some(salt),
                pin_hash: Some(new_hash),
                is_secure_pin_hash: Some(true),
                ..Default::default()
            },
        )
        .await?;
        self.keys.set(new_key);

        let (event_type, details) = if changing {
            (SecurityEventType::PinChanged, "PIN changed")
        } else {
            (SecurityEventType::PinSet, "PIN set")
        };
        self.record_event(details, EventSeverity::Info, event_type, actor.name.clone())
            .await;
        Ok(())
    }

    /// Turn encryption on and migrate existing plaintext values to envelopes.
    pub async fn enable_encryption(&self, actor: &Actor, pin: &Pin) -> Result<()> {
        self.authorize(actor, Capability::ManageSecurity).await?;
        let meta = self.metadata.get().await;
        self.check_pin(actor, &meta, pin).await?;
        if meta.encryption_enabled {
            return Ok(());
        }
        let key = derive_key(pin, &meta.salt_hex)?;
        let resealed = if self.remote.is_none() {
            self.reseal_local(Some(&key), Reseal::Encrypt(&key)).await?
        } else {
            Vec::new()
        };

        self.commit_local(&resealed).await?;
        self.update_or_restore(
            &resealed,
            SecurityMetadataPatch {
                encryption_enabled: Some(true),
                ..Default::default()
            },
        )
        .await?;
        self.keys.set(key);
        self.record_event(
            "local encryption enabled",
            EventSeverity::Info,
            SecurityEventType::EncryptionEnabled,
            actor.name.clone(),
        )
        .await;
        Ok(())
    }

    /// Turn encryption off and write every value back as plaintext JSON.
    pub async fn disable_encryption(&self, actor: &Actor, pin: &Pin) -> Result<()> {
        self.authorize(actor, Capability::ManageSecurity).await?;
        let meta = self.metadata.get().await;
        self.check_pin(actor, &meta, pin).await?;
        if !meta.encryption_enabled {
            return Ok(());
        }
        let key = derive_key(pin, &meta.salt_hex)?;
        let resealed = if self.remote.is_none() {
            self.reseal_local(Some(&key), Reseal::Plaintext).await?
        } else {
            Vec::new()
        };

        self.commit_local(&resealed).await?;
        self.update_or_restore(
            &resealed,
            SecurityMetadataPatch {
                encryption_enabled: Some(false),
                ..Default::default()
            },
        )
        .await?;
        self.record_event(
            "local encryption disabled",
            EventSeverity::Critical,
            SecurityEventType::EncryptionDisabled,
            actor.name.clone(),
        )
        .await;
        Ok(())
    }

    /// Remove every stored collection, the security metadata and the audit
    /// trail, then lock.
    pub async fn reset_all(&self, actor: &Actor) -> Result<()> {
        self.authorize(actor, Capability::ResetData).await?;
        let mut failures = Vec::new();

        if let Some(remote) = &self.remote {
            for key in keys::ALL {
                if let Err(err) = remote.remove(key).await {
                    failures.push(format!("{key}: {err}"));
                }
            }
        }
        match self.local.keys().await {
            Ok(local_keys) => {
                for key in local_keys {
                    if let Err(err) = self.local.delete(&key).await {
                        failures.push(format!("{key}: {err}"));
                    }
                }
            }
            Err(err) => failures.push(format!("list local keys: {err}")),
        }
        if let Err(err) = self.metadata.clear().await {
            failures.push(err.to_string());
        }

        self.audit.clear();
        self.audit_loaded.store(true, Ordering::Release);
        self.keys.clear();
        self.record_event(
            "all family data erased",
            EventSeverity::Critical,
            SecurityEventType::DataReset,
            actor.name.clone(),
        )
        .await;

        if failures.is_empty() {
            Ok(())
        } else {
            error!(?failures, "reset incomplete");
            Err(KinError::StorageBackend(format!(
                "reset incomplete: {}",
                failures.join("; ")
            )))
        }
    }

    /// Read every local value with `old_key` and produce its new stored form.
    /// Any failure aborts before anything is written.
    async fn reseal_local(
        &self,
        old_key: Option<&DerivedKey>,
        target: Reseal<'_>,
    ) -> Result<Vec<Resealed>> {
        let mut out = Vec::new();
        for key in self.local_data_keys().await? {
            let Some(raw) = self.local.get(&key).await? else {
                continue;
            };
            let value: Value = match EncryptedEnvelope::parse(&raw) {
                Some(envelope) => decrypt(&envelope, old_key.ok_or(KinError::Locked)?)?,
                None => serde_json::from_str(&raw)?,
            };
            let sealed = match target {
                Reseal::Encrypt(new_key) => encrypt(&value, new_key)?.to_json()?,
                Reseal::Plaintext => serde_json::to_string(&value)?,
            };
            out.push(Resealed {
                key,
                original: raw,
                sealed,
            });
        }
        Ok(out)
    }

    /// Write every re-sealed value. On the first failure the values already
    /// written are put back and the error is returned.
    async fn commit_local(&self, values: &[Resealed]) -> Result<()> {
        for (i, value) in values.iter().enumerate() {
            if let Err(err) = self.local.set(&value.key, &value.sealed).await {
                error!(
                    key = %value.key,
                    error = %err,
                    "re-sealed value not written, rolling back"
                );
                self.restore_local(&values[..i]).await;
                return Err(KinError::StorageBackend(format!(
                    "could not rewrite {}: {err}",
                    value.key
                )));
            }
        }
        Ok(())
    }

    async fn update_or_restore(
        &self,
        values: &[Resealed],
        patch: SecurityMetadataPatch,
    ) -> Result<()> {
        if let Err(err) = self.metadata.update(patch).await {
            error!(error = %err, "metadata not updated, rolling back re-sealed values");
            self.restore_local(values).await;
            return Err(err);
        }
        Ok(())
    }

    async fn restore_local(&self, values: &[Resealed]) {
        for value in values {
            if let Err(err) = self.local.set(&value.key, &value.original).await {
                error!(key = %value.key, error = %err, "original value could not be restored");
            }
        }
    }
}
