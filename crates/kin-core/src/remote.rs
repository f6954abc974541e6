//! Remote relational backend: each namespaced key maps to a table whose rows
//! are scoped by `family_id`. Settings-like keys are a single row per family;
//! collections are one row per element, upserted by `id`, with their position
//! kept in `sort_index` so a load returns them in the order they were saved.
//!
//! `PostgrestRowStore` speaks the Supabase REST dialect. Writes are last
//! writer wins; there is no row versioning.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::config::RemoteCredentials;
use crate::error::{KinError, Result};
use crate::field_map::{record_to_row, row_to_record};
use crate::keys::{remote_collection, KeyShape};

pub const FAMILY_COLUMN: &str = "family_id";
pub const ID_COLUMN: &str = "id";
pub const SORT_COLUMN: &str = "sort_index";

pub type Row = Map<String, Value>;

#[async_trait]
pub trait RowStore: Send + Sync {
    /// The family's rows, ascending by `order_by` when given.
    async fn select(
        &self,
        table: &str,
        family_id: &str,
        order_by: Option<&str>,
    ) -> Result<Vec<Row>>;
    async fn upsert(&self, table: &str, rows: Vec<Row>, on_conflict: &str) -> Result<()>;
    /// Delete the family's rows whose id is not in `keep_ids`.
    async fn delete_except(&self, table: &str, family_id: &str, keep_ids: &[String]) -> Result<()>;
    async fn delete_all(&self, table: &str, family_id: &str) -> Result<()>;
}

// ── Supabase / PostgREST ────────────────────────────────────────────────────

pub struct PostgrestRowStore {
    client: reqwest::Client,
    base_url: String,
}

impl PostgrestRowStore {
    pub fn new(credentials: &RemoteCredentials) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&credentials.api_key)
            .map_err(|e| KinError::StorageBackend(format!("invalid api key header: {e}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credentials.api_key))
            .map_err(|e| KinError::StorageBackend(format!("invalid api key header: {e}")))?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = reqwest::Client::builder()
            .user_agent("kin-core/0.1")
            .default_headers(headers)
            .build()
            .map_err(|e| KinError::StorageBackend(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: format!("{}/rest/v1", credentials.url),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.base_url, table)
    }
}

fn http_err(action: &str, err: reqwest::Error) -> KinError {
    KinError::StorageBackend(format!("{action}: {err}"))
}

async fn check_status(action: &str, res: reqwest::Response) -> Result<reqwest::Response> {
    if res.status().is_success() {
        return Ok(res);
    }
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    Err(KinError::StorageBackend(format!(
        "{action} failed with status {status}: {body}"
    )))
}

/// PostgREST `in.(...)` list with every value double-quoted.
fn quoted_list(ids: &[String]) -> String {
    let quoted: Vec<String> = ids
        .iter()
        .map(|id| format!("\"{}\"", id.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("({})", quoted.join(","))
}

#[async_trait]
impl RowStore for PostgrestRowStore {
    async fn select(
        &self,
        table: &str,
        family_id: &str,
        order_by: Option<&str>,
    ) -> Result<Vec<Row>> {
        let mut query = vec![
            ("select", "*".to_string()),
            (FAMILY_COLUMN, format!("eq.{family_id}")),
        ];
        if let Some(column) = order_by {
            query.push(("order", format!("{column}.asc")));
        }
        let res = self
            .client
            .get(self.table_url(table))
            .query(&query)
            .send()
            .await
            .map_err(|e| http_err("select", e))?;
        let res = check_status("select", res).await?;
        res.json::<Vec<Row>>().await.map_err(|e| http_err("decode rows", e))
    }

    async fn upsert(&self, table: &str, rows: Vec<Row>, on_conflict: &str) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let res = self
            .client
            .post(self.table_url(table))
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&rows)
            .send()
            .await
            .map_err(|e| http_err("upsert", e))?;
        check_status("upsert", res).await.map(|_| ())
    }

    async fn delete_except(&self, table: &str, family_id: &str, keep_ids: &[String]) -> Result<()> {
        if keep_ids.is_empty() {
            return self.delete_all(table, family_id).await;
        }
        let res = self
            .client
            .delete(self.table_url(table))
            .query(&[
                (FAMILY_COLUMN, format!("eq.{family_id}")),
                (ID_COLUMN, format!("not.in.{}", quoted_list(keep_ids))),
            ])
            .send()
            .await
            .map_err(|e| http_err("delete", e))?;
        check_status("delete", res).await.map(|_| ())
    }

    async fn delete_all(&self, table: &str, family_id: &str) -> Result<()> {
        let res = self
            .client
            .delete(self.table_url(table))
            .query(&[(FAMILY_COLUMN, format!("eq.{family_id}"))])
            .send()
            .await
            .map_err(|e| http_err("delete", e))?;
        check_status("delete", res).await.map(|_| ())
    }
}

// ── In-memory ───────────────────────────────────────────────────────────────

/// Table map standing in for a live backend. `set_offline(true)` makes every
/// call fail, to exercise the absorb-and-log paths.
#[derive(Default)]
pub struct MemoryRowStore {
    tables: Mutex<HashMap<String, Vec<Row>>>,
    offline: AtomicBool,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Every row of `table`, across families, in insertion order.
    pub fn dump(&self, table: &str) -> Vec<Row> {
        self.tables.lock().get(table).cloned().unwrap_or_default()
    }

    fn online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(KinError::StorageBackend("remote store offline".into()))
        } else {
            Ok(())
        }
    }
}

fn same_family(row: &Row, family_id: &str) -> bool {
    row.get(FAMILY_COLUMN).and_then(Value::as_str) == Some(family_id)
}

#[async_trait]
impl RowStore for MemoryRowStore {
    async fn select(
        &self,
        table: &str,
        family_id: &str,
        order_by: Option<&str>,
    ) -> Result<Vec<Row>> {
        self.online()?;
        let mut rows: Vec<Row> = self
            .dump(table)
            .into_iter()
            .filter(|row| same_family(row, family_id))
            .collect();
        if let Some(column) = order_by {
            rows.sort_by_key(|row| row.get(column).and_then(Value::as_u64).unwrap_or(u64::MAX));
        }
        Ok(rows)
    }

    async fn upsert(&self, table: &str, rows: Vec<Row>, on_conflict: &str) -> Result<()> {
        self.online()?;
        let mut tables = self.tables.lock();
        let existing = tables.entry(table.to_string()).or_default();
        for row in rows {
            let family = row.get(FAMILY_COLUMN).cloned();
            let conflict = row.get(on_conflict).cloned();
            match existing.iter_mut().find(|r| {
                r.get(FAMILY_COLUMN).cloned() == family && r.get(on_conflict).cloned() == conflict
            }) {
                Some(slot) => *slot = row,
                None => existing.push(row),
            }
        }
        Ok(())
    }

    async fn delete_except(&self, table: &str, family_id: &str, keep_ids: &[String]) -> Result<()> {
        self.online()?;
        if let Some(rows) = self.tables.lock().get_mut(table) {
            rows.retain(|row| {
                !same_family(row, family_id)
                    || row
                        .get(ID_COLUMN)
                        .and_then(Value::as_str)
                        .is_some_and(|id| keep_ids.iter().any(|k| k == id))
            });
        }
        Ok(())
    }

    async fn delete_all(&self, table: &str, family_id: &str) -> Result<()> {
        self.online()?;
        if let Some(rows) = self.tables.lock().get_mut(table) {
            rows.retain(|row| !same_family(row, family_id));
        }
        Ok(())
    }
}

// ── Key → table adapter ─────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RemoteBackend {
    rows: Arc<dyn RowStore>,
    family_id: String,
}

impl RemoteBackend {
    pub fn new(rows: Arc<dyn RowStore>, family_id: impl Into<String>) -> Self {
        Self {
            rows,
            family_id: family_id.into(),
        }
    }

    pub fn family_id(&self) -> &str {
        &self.family_id
    }

    pub async fn save(&self, key: &str, value: Value) -> Result<()> {
        let collection = mapped(key)?;
        match (collection.shape, value) {
            (KeyShape::Singleton, Value::Object(record)) => {
                let row = self.to_row(&record)?;
                self.rows
                    .upsert(collection.table, vec![row], FAMILY_COLUMN)
                    .await
            }
            (KeyShape::Collection, Value::Array(items)) => {
                let mut rows = Vec::with_capacity(items.len());
                let mut ids = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    let record = item.as_object().ok_or_else(|| {
                        KinError::StorageBackend(format!("{key}[{i}] is not an object"))
                    })?;
                    let id = record.get(ID_COLUMN).and_then(Value::as_str).ok_or_else(|| {
                        KinError::StorageBackend(format!("{key}[{i}] has no string id"))
                    })?;
                    ids.push(id.to_string());
                    let mut row = self.to_row(record)?;
                    row.insert(SORT_COLUMN.to_string(), Value::from(i));
                    rows.push(row);
                }
                debug!(table = collection.table, rows = rows.len(), "remote upsert");
                self.rows.upsert(collection.table, rows, ID_COLUMN).await?;
                self.rows
                    .delete_except(collection.table, &self.family_id, &ids)
                    .await
            }
            (shape, _) => Err(KinError::StorageBackend(format!(
                "{key} expects a {} value",
                match shape {
                    KeyShape::Singleton => "object",
                    KeyShape::Collection => "array",
                }
            ))),
        }
    }

    /// `Ok(None)` when the family has no rows for the key.
    pub async fn load(&self, key: &str) -> Result<Option<Value>> {
        let collection = mapped(key)?;
        let order_by = match collection.shape {
            KeyShape::Singleton => None,
            KeyShape::Collection => Some(SORT_COLUMN),
        };
        let rows = self
            .rows
            .select(collection.table, &self.family_id, order_by)
            .await?;
        let records: Vec<Value> = rows
            .into_iter()
            .map(|mut row| {
                row.remove(FAMILY_COLUMN);
                row.remove(SORT_COLUMN);
                Value::Object(row_to_record(&row))
            })
            .collect();
        Ok(match collection.shape {
            KeyShape::Singleton => records.into_iter().next(),
            KeyShape::Collection if records.is_empty() => None,
            KeyShape::Collection => Some(Value::Array(records)),
        })
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        let collection = mapped(key)?;
        self.rows.delete_all(collection.table, &self.family_id).await
    }

    fn to_row(&self, record: &Map<String, Value>) -> Result<Row> {
        let mut row = record_to_row(record)?;
        if let Some(column) = [FAMILY_COLUMN, SORT_COLUMN]
            .into_iter()
            .find(|c| row.contains_key(*c))
        {
            return Err(KinError::StorageBackend(format!(
                "record field maps to reserved column {column}"
            )));
        }
        row.insert(FAMILY_COLUMN.to_string(), Value::String(self.family_id.clone()));
        Ok(row)
    }
}

fn mapped(key: &str) -> Result<crate::keys::RemoteCollection> {
    remote_collection(key)
        .ok_or_else(|| KinError::StorageBackend(format!("no remote collection for key {key:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;
    use serde_json::json;

    fn backend(store: &Arc<MemoryRowStore>, family: &str) -> RemoteBackend {
        RemoteBackend::new(store.clone(), family)
    }

    #[tokio::test]
    async fn collections_become_rows_scoped_by_family() {
        let store = Arc::new(MemoryRowStore::new());
        let a = backend(&store, "fam-a");
        let b = backend(&store, "fam-b");

        a.save(
            keys::ENTRIES,
            json!([{"id": "e1", "userId": "u1", "timeDurationMinutes": 30}]),
        )
        .await
        .unwrap();
        b.save(keys::ENTRIES, json!([{"id": "e9"}])).await.unwrap();

        let rows = store.dump("entries");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["user_id"], json!("u1"));
        assert_eq!(rows[0]["time_duration_minutes"], json!(30));
        assert_eq!(rows[0]["family_id"], json!("fam-a"));

        let loaded = a.load(keys::ENTRIES).await.unwrap().unwrap();
        assert_eq!(
            loaded,
            json!([{"id": "e1", "userId": "u1", "timeDurationMinutes": 30}])
        );
    }

    #[tokio::test]
    async fn saving_a_shorter_collection_drops_missing_rows() {
        let store = Arc::new(MemoryRowStore::new());
        let a = backend(&store, "fam-a");
        a.save(keys::TASKS, json!([{"id": "t1"}, {"id": "t2"}]))
            .await
            .unwrap();
        a.save(keys::TASKS, json!([{"id": "t2", "title": "renamed"}]))
            .await
            .unwrap();
        assert_eq!(
            a.load(keys::TASKS).await.unwrap().unwrap(),
            json!([{"id": "t2", "title": "renamed"}])
        );

        a.save(keys::TASKS, json!([])).await.unwrap();
        assert_eq!(a.load(keys::TASKS).await.unwrap(), None);
    }

    #[tokio::test]
    async fn settings_are_a_singleton_row() {
        let store = Arc::new(MemoryRowStore::new());
        let a = backend(&store, "fam-a");
        a.save(keys::SETTINGS, json!({"familyName": "Okafor"}))
            .await
            .unwrap();
        a.save(keys::SETTINGS, json!({"familyName": "Okafor-Lee", "currency": "EUR"}))
            .await
            .unwrap();
        assert_eq!(store.dump("settings").len(), 1);
        assert_eq!(
            a.load(keys::SETTINGS).await.unwrap().unwrap(),
            json!({"familyName": "Okafor-Lee", "currency": "EUR"})
        );
        a.remove(keys::SETTINGS).await.unwrap();
        assert_eq!(a.load(keys::SETTINGS).await.unwrap(), None);
    }

    #[tokio::test]
    async fn shape_mismatch_and_unknown_keys_fail() {
        let store = Arc::new(MemoryRowStore::new());
        let a = backend(&store, "fam-a");
        assert!(a.save(keys::SETTINGS, json!([1])).await.is_err());
        assert!(a.save(keys::ENTRIES, json!([{"noid": 1}])).await.is_err());
        assert!(a.save("kin_unknown", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn collections_load_in_saved_order() {
        let store = Arc::new(MemoryRowStore::new());
        let a = backend(&store, "fam-a");
        a.save(keys::TASKS, json!([{"id": "a"}, {"id": "b"}]))
            .await
            .unwrap();
        a.save(keys::TASKS, json!([{"id": "b"}, {"id": "c"}, {"id": "a"}]))
            .await
            .unwrap();
        assert_eq!(
            a.load(keys::TASKS).await.unwrap().unwrap(),
            json!([{"id": "b"}, {"id": "c"}, {"id": "a"}])
        );
        assert_eq!(store.dump("tasks")[0][SORT_COLUMN], json!(2));
    }

    #[tokio::test]
    async fn record_family_id_survives_alongside_scope() {
        let store = Arc::new(MemoryRowStore::new());
        let a = backend(&store, "fam-a");
        let invites = json!([{"email": "x@y", "familyId": "fam-other", "id": "i1"}]);
        a.save(keys::FAMILY_INVITES, invites.clone()).await.unwrap();

        let row = &store.dump("family_invites")[0];
        assert_eq!(row["family_id"], json!("fam-a"));
        assert_eq!(row["record_family_id"], json!("fam-other"));
        assert_eq!(a.load(keys::FAMILY_INVITES).await.unwrap().unwrap(), invites);

        assert!(a
            .save(keys::TASKS, json!([{"id": "t1", "sortIndex": 4}]))
            .await
            .is_err());
        assert!(a
            .save(keys::TASKS, json!([{"id": "t1", "title_text": "x"}]))
            .await
            .is_err());
        assert!(store.dump("tasks").is_empty());
    }

    #[test]
    fn in_list_is_quoted() {
        assert_eq!(
            quoted_list(&["a".into(), "b,\"c\"".into()]),
            r#"("a","b,\"c\"")"#
        );
    }
}
