use kin_core::backup::{compute_checksum, merge_by_id};
use kin_core::crypto::is_encrypted_envelope;
use kin_core::keys;
use kin_core::local_store::{FileStore, KeyValueStore};
use kin_core::metadata::SecurityMetadataPatch;
use kin_core::{
    export_backup, import_backup, Actor, KinError, Pin, ProviderKind, Storage, StorageContext,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::tempdir;

fn open(dir: &std::path::Path) -> (Storage, Arc<FileStore>) {
    let files = Arc::new(FileStore::open(dir).unwrap());
    let ctx = Arc::new(StorageContext::new(ProviderKind::Local, "family-1"));
    (Storage::new(ctx, files.clone(), None).unwrap(), files)
}

#[tokio::test]
async fn fresh_install_to_encrypted_settings() {
    let dir = tempdir().unwrap();
    let (storage, files) = open(dir.path());
    let admin = Actor::admin("ada");

    let meta = storage
        .metadata()
        .update(SecurityMetadataPatch::default())
        .await
        .unwrap();
    assert_eq!(meta.salt_hex.len(), 32);
    assert!(meta.salt_hex.chars().all(|c| c.is_ascii_hexdigit()));
    assert!(!meta.encryption_enabled);

    let pin = Pin::parse("4821").unwrap();
    storage.set_pin(&admin, None, &pin).await.unwrap();
    storage.enable_encryption(&admin, &pin).await.unwrap();
    storage.save(keys::SETTINGS, &json!({"a": 1})).await;

    let raw = files.get(keys::SETTINGS).await.unwrap().unwrap();
    assert!(is_encrypted_envelope(&raw));
    assert!(!raw.contains("\"a\""));
    assert_eq!(storage.load(keys::SETTINGS, json!({})).await, json!({"a": 1}));

    // A new process sees only ciphertext until the PIN is entered again.
    drop(storage);
    let (reopened, _) = open(dir.path());
    assert_eq!(reopened.load(keys::SETTINGS, json!({})).await, json!({}));
    reopened.unlock(&admin, &pin).await.unwrap();
    assert_eq!(reopened.load(keys::SETTINGS, json!({})).await, json!({"a": 1}));
    assert!(reopened.audit().len() >= 3);
}

#[tokio::test]
async fn tampered_export_is_rejected_and_entries_survive() {
    let dir = tempdir().unwrap();
    let (storage, _) = open(dir.path());
    let admin = Actor::admin("ada");
    let entries = json!([
        {"id": "e1", "description": "Morning blood pressure 120/80", "userId": "u1"},
        {"id": "e2", "description": "Walked to the park"},
    ]);
    storage.save(keys::ENTRIES, &entries).await;

    let exported = export_backup(&storage, &admin).await.unwrap();
    let file: Value = serde_json::from_str(&exported).unwrap();
    assert_eq!(file["checksum"].as_str().map(str::len), Some(64));
    assert_eq!(file["checksumVersion"], json!("sha256-1"));

    let tampered = exported.replacen("120/80", "180/80", 1);
    assert_ne!(tampered, exported);
    let err = import_backup(&storage, &admin, &tampered).await.unwrap_err();
    assert!(matches!(err, KinError::ChecksumMismatch));
    assert_eq!(storage.load(keys::ENTRIES, json!([])).await, entries);

    let summary = import_backup(&storage, &admin, &exported).await.unwrap();
    assert_eq!(summary.collections[0].replaced, 2);
    assert_eq!(storage.load(keys::ENTRIES, json!([])).await, entries);
}

#[tokio::test]
async fn encrypted_store_exports_plain_backup() {
    let dir = tempdir().unwrap();
    let (storage, files) = open(dir.path());
    let admin = Actor::admin("ada");
    let pin = Pin::parse("0007").unwrap();
    storage.set_pin(&admin, None, &pin).await.unwrap();
    storage.enable_encryption(&admin, &pin).await.unwrap();
    storage.save(keys::DOCUMENTS, &json!([{"id": "d1", "name": "POA.pdf"}])).await;

    let exported = export_backup(&storage, &admin).await.unwrap();
    assert!(exported.contains("POA.pdf"));

    storage.lock(&admin).await;
    assert!(matches!(
        import_backup(&storage, &admin, &exported).await,
        Err(KinError::Locked)
    ));
    assert!(is_encrypted_envelope(
        &files.get(keys::DOCUMENTS).await.unwrap().unwrap()
    ));
}

#[test]
fn checksum_is_key_order_independent() {
    let a = json!({"version": "1.0", "settings": {"x": 1, "y": [1, 2]}, "entries": []});
    let b: Value =
        serde_json::from_str(r#"{"entries":[],"settings":{"y":[1,2],"x":1},"version":"1.0"}"#)
            .unwrap();
    assert_eq!(compute_checksum(&a), compute_checksum(&b));
}

#[test]
fn merge_keeps_untouched_order() {
    let existing = vec![json!({"id": "1"}), json!({"id": "2", "old": true}), json!({"id": "3"})];
    let incoming = vec![json!({"id": "4"}), json!({"id": "2"})];
    let (merged, _, _) = merge_by_id(&existing, &incoming);
    let ids: Vec<&str> = merged.iter().filter_map(|v| v["id"].as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3", "4"]);
    assert_eq!(merged[1], json!({"id": "2"}));
}
