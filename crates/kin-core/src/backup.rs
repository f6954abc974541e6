//! Portable backup files: export with a canonical SHA-256 checksum, import
//! with integrity check, schema validation and merge-by-id.
//!
//! Import is all-or-nothing. The file is parsed, its checksum verified and
//! its structure validated before anything is read from or written to
//! storage; merged collections are then sealed in memory and only written
//! once every one of them is ready. The stored form of every target key is
//! captured first, and if a write fails part way the keys already written are
//! put back before the error is returned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{error, info, warn};

use crate::audit::{EventSeverity, SecurityEventType};
use crate::canonical::to_canonical_bytes;
use crate::error::{KinError, Result, SchemaViolation};
use crate::keys;
use crate::permissions::{Actor, Capability};
use crate::remote::RemoteBackend;
use crate::storage::Storage;

pub const BACKUP_VERSION: &str = "1.0";
pub const CHECKSUM_VERSION: &str = "sha256-1";

const CHECKSUM_FIELD: &str = "checksum";
const CHECKSUM_VERSION_FIELD: &str = "checksumVersion";
const ID_FIELD: &str = "id";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupFile {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub settings: Map<String, Value>,
    pub entries: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documents: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_version: Option<String>,
}

/// What an imported file proved about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupIntegrity {
    /// Older export without a checksum; accepted on schema alone.
    Unsigned,
    Sha256V1 { checksum: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeCounts {
    pub key: &'static str,
    pub replaced: usize,
    pub added: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    pub integrity: BackupIntegrity,
    pub collections: Vec<MergeCounts>,
    pub settings_replaced: bool,
}

/// Payload for the current state, not yet checksummed.
pub fn build_export_payload(
    settings: Map<String, Value>,
    entries: Vec<Value>,
    tasks: Vec<Value>,
    documents: Vec<Value>,
) -> BackupFile {
    BackupFile {
        version: BACKUP_VERSION.to_string(),
        timestamp: Utc::now(),
        settings,
        entries,
        tasks: Some(tasks),
        documents: Some(documents),
        checksum: None,
        checksum_version: None,
    }
}

/// SHA-256 hex over the canonical serialisation of `payload` with the
/// checksum fields removed. Key insertion order does not matter.
pub fn compute_checksum(payload: &Value) -> String {
    let digest = match payload {
        Value::Object(map) => {
            let mut stripped = map.clone();
            stripped.remove(CHECKSUM_FIELD);
            stripped.remove(CHECKSUM_VERSION_FIELD);
            Sha256::digest(to_canonical_bytes(&Value::Object(stripped)))
        }
        other => Sha256::digest(to_canonical_bytes(other)),
    };
    hex::encode(digest)
}

pub fn verify_checksum(payload: &Value, expected: &str) -> bool {
    compute_checksum(payload).eq_ignore_ascii_case(expected)
}

/// Stamp `file` with its checksum.
pub fn seal(mut file: BackupFile) -> Result<BackupFile> {
    file.checksum = None;
    file.checksum_version = None;
    let checksum = compute_checksum(&serde_json::to_value(&file)?);
    file.checksum_version = Some(CHECKSUM_VERSION.to_string());
    file.checksum = Some(checksum);
    Ok(file)
}

/// Every structural problem in `payload`; empty means valid.
pub fn validate_schema(payload: &Value) -> Vec<SchemaViolation> {
    let mut violations = Vec::new();
    let Some(obj) = payload.as_object() else {
        violations.push(SchemaViolation::new("$", "must be an object"));
        return violations;
    };

    match obj.get("version") {
        Some(Value::String(v)) if v == BACKUP_VERSION => {}
        Some(Value::String(v)) => violations.push(SchemaViolation::new(
            "version",
            format!("unsupported version {v:?}"),
        )),
        Some(_) => violations.push(SchemaViolation::new("version", "must be a string")),
        None => violations.push(SchemaViolation::new("version", "missing")),
    }

    match obj.get("timestamp") {
        Some(Value::String(ts)) if DateTime::parse_from_rfc3339(ts).is_ok() => {}
        Some(Value::String(_)) => {
            violations.push(SchemaViolation::new("timestamp", "not an ISO-8601 timestamp"))
        }
        Some(_) => violations.push(SchemaViolation::new("timestamp", "must be a string")),
        None => violations.push(SchemaViolation::new("timestamp", "missing")),
    }

    match obj.get("settings") {
        Some(Value::Object(_)) => {}
        Some(_) => violations.push(SchemaViolation::new("settings", "must be an object")),
        None => violations.push(SchemaViolation::new("settings", "missing")),
    }

    check_collection(obj, "entries", true, &mut violations);
    check_collection(obj, "tasks", false, &mut violations);
    check_collection(obj, "documents", false, &mut violations);

    match obj.get(CHECKSUM_FIELD) {
        None | Some(Value::Null) => {}
        Some(Value::String(c)) if c.len() == 64 && c.chars().all(|ch| ch.is_ascii_hexdigit()) => {}
        Some(_) => violations.push(SchemaViolation::new(
            CHECKSUM_FIELD,
            "must be a 64-character hex string",
        )),
    }
    match obj.get(CHECKSUM_VERSION_FIELD) {
        None | Some(Value::Null) => {}
        Some(Value::String(v)) if v == CHECKSUM_VERSION => {}
        Some(_) => violations.push(SchemaViolation::new(
            CHECKSUM_VERSION_FIELD,
            format!("must be {CHECKSUM_VERSION:?}"),
        )),
    }

    violations
}

fn check_collection(
    obj: &Map<String, Value>,
    name: &str,
    required: bool,
    violations: &mut Vec<SchemaViolation>,
) {
    let items = match obj.get(name) {
        Some(Value::Array(items)) => items,
        Some(_) => {
            violations.push(SchemaViolation::new(name, "must be an array"));
            return;
        }
        None if required => {
            violations.push(SchemaViolation::new(name, "missing"));
            return;
        }
        None => return,
    };
    for (i, item) in items.iter().enumerate() {
        match item.as_object() {
            None => violations.push(SchemaViolation::new(format!("{name}[{i}]"), "must be an object")),
            Some(record) => match record.get(ID_FIELD) {
                Some(Value::String(id)) if !id.is_empty() => {}
                _ => violations.push(SchemaViolation::new(
                    format!("{name}[{i}].id"),
                    "must be a non-empty string",
                )),
            },
        }
    }
}

/// Parse, verify and validate a backup file. Nothing here touches storage.
pub fn parse_backup(raw: &str) -> Result<(BackupFile, BackupIntegrity)> {
    let payload: Value =
        serde_json::from_str(raw).map_err(|e| KinError::MalformedFile(e.to_string()))?;
    if !payload.is_object() {
        return Err(KinError::MalformedFile("top level is not a JSON object".into()));
    }

    let integrity = match payload.get(CHECKSUM_FIELD) {
        None | Some(Value::Null) => BackupIntegrity::Unsigned,
        Some(Value::String(expected)) => {
            if !verify_checksum(&payload, expected) {
                return Err(KinError::ChecksumMismatch);
            }
            BackupIntegrity::Sha256V1 {
                checksum: expected.to_ascii_lowercase(),
            }
        }
        Some(_) => return Err(KinError::ChecksumMismatch),
    };

    let violations = validate_schema(&payload);
    if !violations.is_empty() {
        return Err(KinError::SchemaValidation(violations));
    }
    let file: BackupFile =
        serde_json::from_value(payload).map_err(|e| KinError::MalformedFile(e.to_string()))?;
    Ok((file, integrity))
}

fn record_id(item: &Value) -> Option<&str> {
    item.get(ID_FIELD).and_then(Value::as_str)
}

/// Incoming items replace existing ones with the same id in place (no field
/// merge) or are appended. Existing items keep their relative order.
pub fn merge_by_id(existing: &[Value], incoming: &[Value]) -> (Vec<Value>, usize, usize) {
    let mut merged = existing.to_vec();
    let mut index: HashMap<String, usize> = HashMap::new();
    for (pos, item) in merged.iter().enumerate() {
        if let Some(id) = record_id(item) {
            index.entry(id.to_string()).or_insert(pos);
        }
    }
    let (mut replaced, mut added) = (0, 0);
    for item in incoming {
        match record_id(item).and_then(|id| index.get(id).copied()) {
            Some(pos) => {
                merged[pos] = item.clone();
                replaced += 1;
            }
            None => {
                if let Some(id) = record_id(item) {
                    index.insert(id.to_string(), merged.len());
                }
                merged.push(item.clone());
                added += 1;
            }
        }
    }
    (merged, replaced, added)
}

async fn read_collection(storage: &Storage, key: &str) -> Result<Vec<Value>> {
    match storage.read_value(key).await? {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items),
        Some(_) => Err(KinError::StorageBackend(format!(
            "{key} does not hold a list"
        ))),
    }
}

async fn read_settings(storage: &Storage) -> Result<Map<String, Value>> {
    match storage.read_value(keys::SETTINGS).await? {
        Some(Value::Object(map)) => Ok(map),
        _ => Ok(Map::new()),
    }
}

/// Serialise the current state as a checksummed backup file.
pub async fn export_backup(storage: &Storage, actor: &Actor) -> Result<String> {
    storage.authorize(actor, Capability::ExportBackup).await?;
    let file = build_export_payload(
        read_settings(storage).await?,
        read_collection(storage, keys::ENTRIES).await?,
        read_collection(storage, keys::TASKS).await?,
        read_collection(storage, keys::DOCUMENTS).await?,
    );
    let file = seal(file)?;
    let out = serde_json::to_string_pretty(&file)?;
    storage
        .record_event(
            format!(
                "backup exported ({} entries, {} tasks, {} documents)",
                file.entries.len(),
                file.tasks.as_ref().map_or(0, Vec::len),
                file.documents.as_ref().map_or(0, Vec::len),
            ),
            EventSeverity::Info,
            SecurityEventType::BackupExported,
            actor.name.clone(),
        )
        .await;
    Ok(out)
}

/// Verify and apply a backup file. On any error the stored state is left as
/// it was and an `IMPORT_REJECTED` event is recorded.
pub async fn import_backup(storage: &Storage, actor: &Actor, raw: &str) -> Result<ImportSummary> {
    storage.authorize(actor, Capability::ImportBackup).await?;
    match apply_import(storage, raw).await {
        Ok(summary) => {
            info!(integrity = ?summary.integrity, "backup imported");
            storage
                .record_event(
                    describe(&summary),
                    EventSeverity::Info,
                    SecurityEventType::BackupImported,
                    actor.name.clone(),
                )
                .await;
            Ok(summary)
        }
        Err(err) => {
            warn!(error = %err, "backup import rejected");
            storage
                .record_event(
                    format!("import rejected: {err}"),
                    EventSeverity::Warning,
                    SecurityEventType::ImportRejected,
                    actor.name.clone(),
                )
                .await;
            Err(err)
        }
    }
}

async fn apply_import(storage: &Storage, raw: &str) -> Result<ImportSummary> {
    let (file, integrity) = parse_backup(raw)?;

    let incoming: [(&'static str, Option<&Vec<Value>>); 3] = [
        (keys::ENTRIES, Some(&file.entries)),
        (keys::TASKS, file.tasks.as_ref()),
        (keys::DOCUMENTS, file.documents.as_ref()),
    ];
    let mut updates: Vec<(&'static str, Value)> =
        vec![(keys::SETTINGS, Value::Object(file.settings.clone()))];
    let mut collections = Vec::new();
    for (key, items) in incoming {
        let Some(items) = items else { continue };
        let existing = read_collection(storage, key).await?;
        let (merged, replaced, added) = merge_by_id(&existing, items);
        collections.push(MergeCounts {
            key,
            replaced,
            added,
        });
        updates.push((key, Value::Array(merged)));
    }

    if let Some(remote) = &storage.remote {
        let mut prior = Vec::with_capacity(updates.len());
        for (key, _) in &updates {
            prior.push((*key, storage.read_value(key).await?));
        }
        for (i, (key, value)) in updates.iter().enumerate() {
            if let Err(err) = storage.write_value(key, value).await {
                warn!(key, error = %err, "import write failed, restoring earlier values");
                // a failed collection save may have upserted before its delete failed
                restore_remote(storage, remote, &prior[..=i]).await;
                return Err(err);
            }
        }
    } else {
        let mut sealed = Vec::with_capacity(updates.len());
        for (key, value) in &updates {
            let before = storage.local.get(key).await?;
            sealed.push((*key, before, storage.seal_for_local(key, value).await?));
        }
        for (i, (key, _, raw)) in sealed.iter().enumerate() {
            if let Err(err) = storage.local.set(key, raw).await {
                warn!(key, error = %err, "import write failed, restoring earlier values");
                restore_local(storage, &sealed[..i]).await;
                return Err(err);
            }
        }
    }

    Ok(ImportSummary {
        integrity,
        collections,
        settings_replaced: true,
    })
}

async fn restore_remote(
    storage: &Storage,
    remote: &RemoteBackend,
    prior: &[(&str, Option<Value>)],
) {
    for (key, before) in prior {
        let restored = match before {
            Some(value) => storage.write_value(key, value).await,
            None => remote.remove(key).await,
        };
        if let Err(err) = restored {
            error!(key, error = %err, "value not restored after failed import");
        }
    }
}

async fn restore_local(storage: &Storage, prior: &[(&str, Option<String>, String)]) {
    for (key, before, _) in prior {
        let restored = match before {
            Some(raw) => storage.local.set(key, raw).await,
            None => storage.local.delete(key).await,
        };
        if let Err(err) = restored {
            error!(key, error = %err, "value not restored after failed import");
        }
    }
}

fn describe(summary: &ImportSummary) -> String {
    let parts: Vec<String> = summary
        .collections
        .iter()
        .map(|c| format!("{}: {} replaced, {} added", c.key, c.replaced, c.added))
        .collect();
    let integrity = match &summary.integrity {
        BackupIntegrity::Unsigned => "unsigned",
        BackupIntegrity::Sha256V1 { .. } => CHECKSUM_VERSION,
    };
    format!("backup imported ({integrity}); {}", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_store::{FailingStore, KeyValueStore, MemoryStore};
    use crate::permissions::Role;
    use crate::provider::{ProviderKind, StorageContext};
    use serde_json::json;
    use std::sync::Arc;

    fn storage() -> Storage {
        let ctx = Arc::new(StorageContext::new(ProviderKind::Local, "fam"));
        Storage::new(ctx, Arc::new(MemoryStore::new()), None).unwrap()
    }

    fn signed(mut payload: Value) -> String {
        let checksum = compute_checksum(&payload);
        payload["checksum"] = json!(checksum);
        payload["checksumVersion"] = json!(CHECKSUM_VERSION);
        payload.to_string()
    }

    fn sample() -> Value {
        json!({
            "version": "1.0",
            "timestamp": "2026-03-01T09:30:00Z",
            "settings": {"familyName": "Okafor"},
            "entries": [{"id": "e1", "note": "new"}, {"id": "e9", "note": "fresh"}],
        })
    }

    #[test]
    fn checksum_ignores_key_order_and_its_own_fields() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"y":2,"x":3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":{"x":3,"y":2},"b":1}"#).unwrap();
        assert_eq!(compute_checksum(&a), compute_checksum(&b));

        let mut c = a.clone();
        c["checksum"] = json!("00");
        c["checksumVersion"] = json!(CHECKSUM_VERSION);
        assert_eq!(compute_checksum(&a), compute_checksum(&c));
        assert!(verify_checksum(&c, &compute_checksum(&a)));
    }

    #[test]
    fn tampered_file_is_rejected_before_schema() {
        let mut payload: Value = serde_json::from_str(&signed(sample())).unwrap();
        payload["entries"][0]["note"] = json!("edited");
        payload["version"] = json!(7);
        assert!(matches!(
            parse_backup(&payload.to_string()),
            Err(KinError::ChecksumMismatch)
        ));
    }

    #[test]
    fn schema_reports_every_violation() {
        let raw = json!({
            "timestamp": "yesterday",
            "settings": [],
            "entries": [{"id": ""}, 3],
            "tasks": {},
        })
        .to_string();
        let Err(KinError::SchemaValidation(v)) = parse_backup(&raw) else {
            panic!("expected schema failure");
        };
        let fields: Vec<&str> = v.iter().map(|v| v.field.as_str()).collect();
        assert_eq!(
            fields,
            vec!["version", "timestamp", "settings", "entries[0].id", "entries[1]", "tasks"]
        );
    }

    #[test]
    fn not_json_is_malformed() {
        assert!(matches!(parse_backup("PK\u{3}\u{4}"), Err(KinError::MalformedFile(_))));
        assert!(matches!(parse_backup("[1,2]"), Err(KinError::MalformedFile(_))));
    }

    #[test]
    fn merge_replaces_whole_items_and_appends() {
        let existing = vec![
            json!({"id": "a", "n": 1, "extra": true}),
            json!({"id": "b", "n": 2}),
            json!({"id": "c", "n": 3}),
        ];
        let incoming = vec![json!({"id": "b", "n": 20}), json!({"id": "d", "n": 4})];
        let (merged, replaced, added) = merge_by_id(&existing, &incoming);
        assert_eq!(
            merged,
            vec![
                json!({"id": "a", "n": 1, "extra": true}),
                json!({"id": "b", "n": 20}),
                json!({"id": "c", "n": 3}),
                json!({"id": "d", "n": 4}),
            ]
        );
        assert_eq!((replaced, added), (1, 1));
    }

    #[tokio::test]
    async fn import_twice_is_idempotent() {
        let storage = storage();
        let admin = Actor::admin("ada");
        storage
            .save(keys::ENTRIES, &json!([{"id": "e0"}, {"id": "e1", "note": "old", "mood": 3}]))
            .await;
        let raw = signed(sample());

        let summary = import_backup(&storage, &admin, &raw).await.unwrap();
        assert!(matches!(summary.integrity, BackupIntegrity::Sha256V1 { .. }));
        let once: Value = storage.load(keys::ENTRIES, json!([])).await;
        import_backup(&storage, &admin, &raw).await.unwrap();
        let twice: Value = storage.load(keys::ENTRIES, json!([])).await;

        assert_eq!(once, twice);
        assert_eq!(
            once,
            json!([{"id": "e0"}, {"id": "e1", "note": "new"}, {"id": "e9", "note": "fresh"}])
        );
        assert_eq!(
            storage.load(keys::SETTINGS, json!({})).await,
            json!({"familyName": "Okafor"})
        );
    }

    #[tokio::test]
    async fn rejected_import_changes_nothing() {
        let storage = storage();
        let admin = Actor::admin("ada");
        storage.save(keys::ENTRIES, &json!([{"id": "e1", "note": "keep"}])).await;
        let mut tampered: Value = serde_json::from_str(&signed(sample())).unwrap();
        tampered["settings"]["familyName"] = json!("Mallory");

        let err = import_backup(&storage, &admin, &tampered.to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, KinError::ChecksumMismatch));
        assert_eq!(
            storage.load(keys::ENTRIES, json!([])).await,
            json!([{"id": "e1", "note": "keep"}])
        );
        assert_eq!(storage.load(keys::SETTINGS, json!(null)).await, json!(null));
        let last = storage.audit().recent(Some(1)).remove(0);
        assert_eq!(last.event_type, SecurityEventType::ImportRejected);
    }

    #[tokio::test]
    async fn failed_write_mid_import_restores_earlier_keys() {
        let store = Arc::new(FailingStore::default());
        let ctx = Arc::new(StorageContext::new(ProviderKind::Local, "fam"));
        let storage = Storage::new(ctx, store.clone(), None).unwrap();
        let admin = Actor::admin("ada");
        storage.save(keys::ENTRIES, &json!([{"id": "e0"}])).await;
        let mut payload = sample();
        payload["tasks"] = json!([{"id": "t1"}]);

        store.fail_writes_to(Some(keys::TASKS));
        let err = import_backup(&storage, &admin, &signed(payload))
            .await
            .unwrap_err();
        store.fail_writes_to(None);

        assert!(matches!(err, KinError::StorageBackend(_)));
        assert_eq!(store.get(keys::SETTINGS).await.unwrap(), None);
        assert_eq!(store.get(keys::TASKS).await.unwrap(), None);
        assert_eq!(
            storage.load(keys::ENTRIES, json!([])).await,
            json!([{"id": "e0"}])
        );
        let last = storage.audit().recent(Some(1)).remove(0);
        assert_eq!(last.event_type, SecurityEventType::ImportRejected);
    }

    #[tokio::test]
    async fn unsigned_legacy_file_is_accepted() {
        let storage = storage();
        let summary = import_backup(&storage, &Actor::admin("ada"), &sample().to_string())
            .await
            .unwrap();
        assert_eq!(summary.integrity, BackupIntegrity::Unsigned);
        assert_eq!(summary.collections.len(), 1);
    }

    #[tokio::test]
    async fn export_roundtrips_through_import() {
        let storage = storage();
        let admin = Actor::admin("ada");
        storage.save(keys::TASKS, &json!([{"id": "t1", "title": "Pharmacy"}])).await;
        let raw = export_backup(&storage, &admin).await.unwrap();

        let (file, integrity) = parse_backup(&raw).unwrap();
        assert!(matches!(integrity, BackupIntegrity::Sha256V1 { .. }));
        assert_eq!(file.checksum_version.as_deref(), Some(CHECKSUM_VERSION));
        assert_eq!(file.tasks.unwrap(), vec![json!({"id": "t1", "title": "Pharmacy"})]);
        assert!(file.entries.is_empty());
    }

    #[tokio::test]
    async fn viewers_cannot_export_or_import() {
        let storage = storage();
        let viewer = Actor::new("kid", Role::Viewer);
        assert!(matches!(
            export_backup(&storage, &viewer).await,
            Err(KinError::PermissionDenied { .. })
        ));
        let caregiver = Actor::new("cg", Role::Caregiver);
        assert!(export_backup(&storage, &caregiver).await.is_ok());
        assert!(matches!(
            import_backup(&storage, &caregiver, &sample().to_string()).await,
            Err(KinError::PermissionDenied { .. })
        ));
        assert_eq!(storage.load(keys::SETTINGS, json!(null)).await, json!(null));
    }
}
