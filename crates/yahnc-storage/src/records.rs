//! Durable map of item id -> delivery record.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use yahnc_core::{DeliveryRecord, ItemId, MessageId, RecordKey, StorySnapshot, RECORD_ROOT};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Per-key result of a batched read.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyLookup {
    Found(DeliveryRecord),
    Missing,
    Failed(String),
}

/// Outcome of [`RecordStore::get_many`], one entry per requested key in request order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchLookup {
    entries: Vec<(ItemId, KeyLookup)>,
}

impl BatchLookup {
    pub fn new(entries: Vec<(ItemId, KeyLookup)>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[(ItemId, KeyLookup)] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<(ItemId, KeyLookup)> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn found_count(&self) -> usize {
        self.count(|l| matches!(l, KeyLookup::Found(_)))
    }

    pub fn missing_count(&self) -> usize {
        self.count(|l| matches!(l, KeyLookup::Missing))
    }

    pub fn failed_count(&self) -> usize {
        self.count(|l| matches!(l, KeyLookup::Failed(_)))
    }

    /// Every key resolved to a stored record.
    pub fn is_fully_known(&self) -> bool {
        self.found_count() == self.len()
    }

    /// No key resolved to a stored record.
    pub fn is_cold(&self) -> bool {
        self.found_count() == 0
    }

    fn count(&self, pred: impl Fn(&KeyLookup) -> bool) -> usize {
        self.entries.iter().filter(|(_, l)| pred(l)).count()
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, item_id: ItemId) -> Result<Option<DeliveryRecord>, StoreError>;

    /// Look up many keys at once. Missing or undecodable keys are reported per
    /// key; only a store-wide failure returns `Err`.
    async fn get_many(&self, item_ids: &[ItemId]) -> Result<BatchLookup, StoreError>;

    /// Upsert keyed by item id.
    async fn put(&self, record: &DeliveryRecord) -> Result<(), StoreError>;

    /// Returns whether a record was removed.
    async fn delete(&self, item_id: ItemId) -> Result<bool, StoreError>;

    /// Records with `last_saved <= cutoff`.
    async fn saved_before(&self, cutoff: DateTime<Utc>)
        -> Result<Vec<DeliveryRecord>, StoreError>;
}

/// Process-local store. Failure switches let callers exercise outage and
/// per-key error paths.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: Mutex<BTreeMap<RecordKey, DeliveryRecord>>,
    unavailable: AtomicBool,
    failing_keys: Mutex<HashSet<ItemId>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_records(records: impl IntoIterator<Item = DeliveryRecord>) -> Self {
        let store = Self::new();
        {
            let mut map = store.records.lock().await;
            for record in records {
                map.insert(record.key(), record);
            }
        }
        store
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make batched reads report a per-key failure for `item_id`.
    pub async fn fail_key(&self, item_id: ItemId) {
        self.failing_keys.lock().await.insert(item_id);
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("in-memory store switched off".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get(&self, item_id: ItemId) -> Result<Option<DeliveryRecord>, StoreError> {
        self.check_available()?;
        Ok(self
            .records
            .lock()
            .await
            .get(&RecordKey::new(item_id))
            .cloned())
    }

    async fn get_many(&self, item_ids: &[ItemId]) -> Result<BatchLookup, StoreError> {
        self.check_available()?;
        let failing = self.failing_keys.lock().await.clone();
        let records = self.records.lock().await;
        let entries = item_ids
            .iter()
            .map(|id| {
                let lookup = if failing.contains(id) {
                    KeyLookup::Failed(format!("read of {} failed", RecordKey::new(*id)))
                } else {
                    match records.get(&RecordKey::new(*id)) {
                        Some(record) => KeyLookup::Found(record.clone()),
                        None => KeyLookup::Missing,
                    }
                };
                (*id, lookup)
            })
            .collect();
        Ok(BatchLookup::new(entries))
    }

    async fn put(&self, record: &DeliveryRecord) -> Result<(), StoreError> {
        self.check_available()?;
        self.records
            .lock()
            .await
            .insert(record.key(), record.clone());
        Ok(())
    }

    async fn delete(&self, item_id: ItemId) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self
            .records
            .lock()
            .await
            .remove(&RecordKey::new(item_id))
            .is_some())
    }

    async fn saved_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DeliveryRecord>, StoreError> {
        self.check_available()?;
        Ok(self
            .records
            .lock()
            .await
            .values()
            .filter(|r| r.last_saved <= cutoff)
            .cloned()
            .collect())
    }
}

/// Postgres-backed store; every row is scoped under [`RECORD_ROOT`].
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS delivery_records (
                root TEXT NOT NULL,
                item_id BIGINT NOT NULL,
                message_id BIGINT NOT NULL,
                last_saved TIMESTAMPTZ NOT NULL,
                story JSONB,
                PRIMARY KEY (root, item_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS delivery_records_last_saved_idx ON delivery_records (root, last_saved)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn record_from_row(row: &PgRow) -> Result<DeliveryRecord, sqlx::Error> {
    let story: Option<Json<StorySnapshot>> = row.try_get("story")?;
    Ok(DeliveryRecord {
        item_id: ItemId(row.try_get("item_id")?),
        message_id: MessageId(row.try_get("message_id")?),
        last_saved: row.try_get("last_saved")?,
        story: story.map(|Json(s)| s),
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn get(&self, item_id: ItemId) -> Result<Option<DeliveryRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT item_id, message_id, last_saved, story FROM delivery_records WHERE root = $1 AND item_id = $2",
        )
        .bind(RECORD_ROOT)
        .bind(item_id.get())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    async fn get_many(&self, item_ids: &[ItemId]) -> Result<BatchLookup, StoreError> {
        let ids: Vec<i64> = item_ids.iter().map(|id| id.get()).collect();
        let rows = sqlx::query(
            "SELECT item_id, message_id, last_saved, story FROM delivery_records WHERE root = $1 AND item_id = ANY($2)",
        )
        .bind(RECORD_ROOT)
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_id: HashMap<i64, KeyLookup> = HashMap::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.try_get("item_id")?;
            let lookup = match record_from_row(row) {
                Ok(record) => KeyLookup::Found(record),
                Err(err) => KeyLookup::Failed(err.to_string()),
            };
            by_id.insert(id, lookup);
        }
        debug!(requested = ids.len(), found = by_id.len(), "batched record lookup");

        let entries = item_ids
            .iter()
            .map(|id| {
                let lookup = by_id.get(&id.get()).cloned().unwrap_or(KeyLookup::Missing);
                (*id, lookup)
            })
            .collect();
        Ok(BatchLookup::new(entries))
    }

    async fn put(&self, record: &DeliveryRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO delivery_records (root, item_id, message_id, last_saved, story)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (root, item_id) DO UPDATE
            SET message_id = EXCLUDED.message_id,
                last_saved = EXCLUDED.last_saved,
                story = EXCLUDED.story
            "#,
        )
        .bind(RECORD_ROOT)
        .bind(record.item_id.get())
        .bind(record.message_id.get())
        .bind(record.last_saved)
        .bind(record.story.as_ref().map(Json))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, item_id: ItemId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM delivery_records WHERE root = $1 AND item_id = $2")
            .bind(RECORD_ROOT)
            .bind(item_id.get())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn saved_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DeliveryRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT item_id, message_id, last_saved, story FROM delivery_records WHERE root = $1 AND last_saved <= $2 ORDER BY last_saved",
        )
        .bind(RECORD_ROOT)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn saved(id: i64, message: i64, at: DateTime<Utc>) -> DeliveryRecord {
        let mut record = DeliveryRecord::with_message(ItemId(id), MessageId(message));
        record.touch(at);
        record
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
    }

    #[tokio::test]
    async fn batched_read_reports_each_key() {
        let store = InMemoryRecordStore::with_records([saved(102, 9, noon())]).await;
        let lookup = store
            .get_many(&[ItemId(101), ItemId(102), ItemId(103)])
            .await
            .unwrap();

        assert_eq!(lookup.len(), 3);
        assert_eq!(lookup.found_count(), 1);
        assert_eq!(lookup.missing_count(), 2);
        assert!(!lookup.is_cold());
        assert!(!lookup.is_fully_known());
        assert_eq!(lookup.entries()[0], (ItemId(101), KeyLookup::Missing));
        assert!(matches!(&lookup.entries()[1].1, KeyLookup::Found(r) if r.message_id == MessageId(9)));
    }

    #[tokio::test]
    async fn cold_and_warm_batches() {
        let store = InMemoryRecordStore::with_records([saved(1, 1, noon())]).await;
        assert!(store.get_many(&[ItemId(5)]).await.unwrap().is_cold());
        assert!(store.get_many(&[ItemId(1)]).await.unwrap().is_fully_known());
    }

    #[tokio::test]
    async fn failing_key_does_not_fail_batch() {
        let store = InMemoryRecordStore::with_records([saved(1, 1, noon())]).await;
        store.fail_key(ItemId(2)).await;
        let lookup = store.get_many(&[ItemId(1), ItemId(2)]).await.unwrap();
        assert_eq!(lookup.failed_count(), 1);
        assert_eq!(lookup.found_count(), 1);
    }

    #[tokio::test]
    async fn unavailable_store_fails_whole_batch() {
        let store = InMemoryRecordStore::new();
        store.set_unavailable(true);
        let err = store.get_many(&[ItemId(1)]).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn put_upserts_single_record_per_item() {
        let store = InMemoryRecordStore::new();
        store.put(&saved(7, 1, noon())).await.unwrap();
        store.put(&saved(7, 2, noon())).await.unwrap();
        assert_eq!(store.len().await, 1);
        assert_eq!(
            store.get(ItemId(7)).await.unwrap().unwrap().message_id,
            MessageId(2)
        );
        assert!(store.delete(ItemId(7)).await.unwrap());
        assert!(!store.delete(ItemId(7)).await.unwrap());
    }

    #[tokio::test]
    async fn saved_before_filters_on_last_saved() {
        let now = noon();
        let store = InMemoryRecordStore::with_records([
            saved(1, 10, now - chrono::Duration::hours(25)),
            saved(2, 20, now - chrono::Duration::hours(23)),
        ])
        .await;
        let expired = store
            .saved_before(yahnc_core::expiry_cutoff(now))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].item_id, ItemId(1));
    }
}
