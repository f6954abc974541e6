//! Device-local key/value stores. Values are opaque strings; encryption is
//! applied above this layer.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

use crate::error::{KinError, Result};

const VALUE_EXT: &str = "json";
const STAGING_DIR: &str = "staging";

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn keys(&self) -> Result<Vec<String>>;
}

// ── File-backed ─────────────────────────────────────────────────────────────

/// One file per key under `root`; writes go through a staging file and an
/// atomic rename so a crash never leaves a half-written value.
pub struct FileStore {
    root: PathBuf,
    staging_root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let staging_root = root.join(STAGING_DIR);
        fs::create_dir_all(&staging_root).map_err(|e| backend_err("create data dir", e))?;
        restrict_dir_permissions(&root);
        cleanup_staging_dir(&staging_root);
        Ok(Self { root, staging_root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn value_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(format!("{key}.{VALUE_EXT}")))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.value_path(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(backend_err("read value", e)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let dest = self.value_path(key)?;
        let staging = self.staging_root.join(format!("{}.staging", Uuid::new_v4()));
        tokio::fs::write(&staging, value.as_bytes())
            .await
            .map_err(|e| backend_err("write staging file", e))?;
        if let Err(e) = tokio::fs::rename(&staging, &dest).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(backend_err("commit value", e));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.value_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(backend_err("delete value", e)),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| backend_err("list data dir", e))?;
        let mut keys = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| backend_err("list data dir", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(VALUE_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn validate_key(key: &str) -> Result<()> {
    let ok = !key.is_empty()
        && !key.starts_with('.')
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.');
    if ok {
        Ok(())
    } else {
        Err(KinError::StorageBackend(format!("invalid storage key {key:?}")))
    }
}

fn backend_err(action: &str, err: std::io::Error) -> KinError {
    KinError::StorageBackend(format!("{action}: {err}"))
}

fn restrict_dir_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o700)) {
            warn!("cannot restrict permissions on {}: {}", path.display(), e);
        }
    }
}

fn cleanup_staging_dir(staging_root: &Path) {
    if let Ok(entries) = fs::read_dir(staging_root) {
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().ends_with(".staging") {
                warn!(path = %entry.path().display(), "removing orphaned staging file");
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

// ── In-memory ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values.write().remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.values.read().keys().cloned().collect())
    }
}

/// Memory store whose `set` fails for one armed key, for exercising rollback.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct FailingStore {
    inner: MemoryStore,
    fail_on: parking_lot::Mutex<Option<String>>,
}

#[cfg(test)]
impl FailingStore {
    pub(crate) fn fail_writes_to(&self, key: Option<&str>) {
        *self.fail_on.lock() = key.map(str::to_string);
    }
}

#[cfg(test)]
#[async_trait]
impl KeyValueStore for FailingStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        if self.fail_on.lock().as_deref() == Some(key) {
            return Err(KinError::StorageBackend(format!("disk full writing {key}")));
        }
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.inner.keys().await
    }
}
