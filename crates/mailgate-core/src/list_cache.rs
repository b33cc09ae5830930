//! Scoped list-result cache
//!
//! Stores the most recent numbered list shown in a chat scope so a follow-up
//! like "open #3" can be answered without another upstream lookup.
//!
//! Every operation is fail-soft: a detached cache, a closed store or any
//! storage error degrades to a miss (or a no-op write) with a warning.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::{StorageHandle, now_secs};

/// A cached list row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListCacheRecord {
    pub cache_key: String,
    /// Epoch seconds
    pub created_at: i64,
    /// Epoch seconds
    pub expires_at: i64,
    pub items_json: String,
    pub channel: Option<String>,
    pub thread_ts: Option<String>,
}

impl ListCacheRecord {
    /// Strictly past `expires_at`
    #[must_use]
    pub fn is_expired(&self, now_sec: i64) -> bool {
        now_sec > self.expires_at
    }

    /// Decode `items_json`
    pub fn payload(&self) -> serde_json::Result<ListCachePayload> {
        serde_json::from_str(&self.items_json)
    }
}

/// One numbered entry of a cached list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListItem {
    /// 1-based position shown to the user
    pub index: u32,
    pub message_id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

/// Serialized form of `items_json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListCachePayload {
    #[serde(default)]
    pub items: Vec<ListItem>,
}

impl ListCachePayload {
    #[must_use]
    pub fn item(&self, index: u32) -> Option<&ListItem> {
        self.items.iter().find(|item| item.index == index)
    }
}

/// Optional columns for an upsert
#[derive(Debug, Clone, Default)]
pub struct UpsertMeta {
    pub channel: Option<String>,
    pub thread_ts: Option<String>,
    /// Defaults to now (epoch seconds)
    pub created_at: Option<i64>,
}

impl UpsertMeta {
    #[must_use]
    pub fn scope(channel: impl Into<String>, thread_ts: Option<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            thread_ts,
            created_at: None,
        }
    }
}

/// Outcome of resolving a numbered follow-up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexLookup {
    Found { item: ListItem, cache_key: String },
    /// Nothing cached for the scope
    NoList,
    Expired { cache_key: String },
    NotInList { cache_key: String },
    /// Row exists but `items_json` does not decode
    Unreadable { cache_key: String },
}

/// Fail-soft cache over the `email_list_cache` table
#[derive(Debug, Clone, Default)]
pub struct ScopedListCache {
    storage: Option<StorageHandle>,
}

impl ScopedListCache {
    #[must_use]
    pub fn new(storage: StorageHandle) -> Self {
        Self {
            storage: Some(storage),
        }
    }

    /// A cache with no store; every read misses and every write is dropped
    #[must_use]
    pub fn detached() -> Self {
        Self { storage: None }
    }

    pub fn is_attached(&self) -> bool {
        self.storage.is_some()
    }

    /// Insert or refresh `cache_key`; returns whether a row was written
    pub async fn upsert(
        &self,
        cache_key: &str,
        items_json: &str,
        expires_at_sec: i64,
        meta: UpsertMeta,
    ) -> bool {
        let Some(storage) = &self.storage else {
            tracing::debug!(cache_key, "list cache detached; upsert skipped");
            return false;
        };

        let created_at = meta.created_at.unwrap_or_else(now_secs);
        if expires_at_sec <= created_at {
            tracing::warn!(
                cache_key,
                created_at,
                expires_at = expires_at_sec,
                "refusing list cache row that is already expired"
            );
            return false;
        }

        let record = ListCacheRecord {
            cache_key: cache_key.to_string(),
            created_at,
            expires_at: expires_at_sec,
            items_json: items_json.to_string(),
            channel: meta.channel,
            thread_ts: meta.thread_ts,
        };

        match storage.upsert_list_cache(record).await {
            Ok(()) => {
                tracing::debug!(cache_key, expires_at = expires_at_sec, "list cache stored");
                true
            }
            Err(err) => {
                tracing::warn!(cache_key, error = %err, "list cache upsert failed");
                false
            }
        }
    }

    /// Serialize typed items and store them with `expires_at = now + ttl`
    pub async fn store_items(
        &self,
        cache_key: &str,
        items: &[ListItem],
        ttl: Duration,
        meta: UpsertMeta,
    ) -> bool {
        let payload = ListCachePayload {
            items: items.to_vec(),
        };
        let items_json = match serde_json::to_string(&payload) {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!(cache_key, error = %err, "list cache payload not serializable");
                return false;
            }
        };
        let created_at = meta.created_at.unwrap_or_else(now_secs);
        let expires_at = created_at.saturating_add(ttl.as_secs() as i64);
        let meta = UpsertMeta {
            created_at: Some(created_at),
            ..meta
        };
        self.upsert(cache_key, &items_json, expires_at, meta).await
    }

    /// Exact lookup; expiry is not checked
    pub async fn get_by_key(&self, cache_key: &str) -> Option<ListCacheRecord> {
        let storage = self.storage.as_ref()?;
        match storage.get_list_cache(cache_key).await {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(cache_key, error = %err, "list cache read failed");
                None
            }
        }
    }

    /// Newest row for (channel, thread), falling back to newest for the channel
    pub async fn get_latest_by_scope(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
    ) -> Option<ListCacheRecord> {
        let storage = self.storage.as_ref()?;
        match storage.latest_list_cache(channel, thread_ts).await {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(channel, thread_ts, error = %err, "list cache scope read failed");
                None
            }
        }
    }

    /// Resolve a 1-based follow-up index against the scope's latest list
    pub async fn resolve_index(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        index: u32,
        now_sec: i64,
    ) -> IndexLookup {
        let Some(record) = self.get_latest_by_scope(channel, thread_ts).await else {
            return IndexLookup::NoList;
        };
        let cache_key = record.cache_key.clone();

        if record.is_expired(now_sec) {
            return IndexLookup::Expired { cache_key };
        }

        let payload = match record.payload() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(cache_key = %cache_key, error = %err, "cached list does not decode");
                return IndexLookup::Unreadable { cache_key };
            }
        };

        match payload.item(index) {
            Some(item) => IndexLookup::Found {
                item: item.clone(),
                cache_key,
            },
            None => IndexLookup::NotInList { cache_key },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn temp_cache() -> (TempDir, StorageHandle, ScopedListCache) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.db");
        let storage = StorageHandle::new(path.to_str().unwrap()).await.unwrap();
        let cache = ScopedListCache::new(storage.clone());
        (dir, storage, cache)
    }

    fn item(index: u32, subject: &str) -> ListItem {
        ListItem {
            index,
            message_id: format!("m{index}"),
            subject: subject.to_string(),
            from: "bob@example.com".to_string(),
            date: None,
            thread_id: None,
        }
    }

    fn meta_at(created_at: i64, thread: Option<&str>) -> UpsertMeta {
        UpsertMeta {
            channel: Some("C1".to_string()),
            thread_ts: thread.map(str::to_string),
            created_at: Some(created_at),
        }
    }

    #[test]
    fn payload_keeps_wire_field_names() {
        let payload = ListCachePayload {
            items: vec![item(1, "Hello")],
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["items"][0]["messageId"], "m1");
        assert!(json["items"][0].get("threadId").is_none());
    }

    #[test]
    fn expiry_is_strict() {
        let record = ListCacheRecord {
            cache_key: "k".to_string(),
            created_at: 0,
            expires_at: 100,
            items_json: "{}".to_string(),
            channel: None,
            thread_ts: None,
        };
        assert!(!record.is_expired(100));
        assert!(record.is_expired(101));
    }

    #[tokio::test]
    async fn upsert_then_get_returns_same_json() {
        let (_dir, storage, cache) = temp_cache().await;
        let json = r#"{"items":[{"index":1,"messageId":"m1"}]}"#;
        assert!(cache.upsert("k1", json, now_secs() + 60, UpsertMeta::default()).await);

        let record = cache.get_by_key("k1").await.unwrap();
        assert_eq!(record.items_json, json);
        storage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn upsert_refuses_non_positive_lifetime() {
        let (_dir, storage, cache) = temp_cache().await;
        assert!(!cache.upsert("k1", "{}", 100, meta_at(100, None)).await);
        assert!(cache.get_by_key("k1").await.is_none());
        storage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn second_upsert_without_channel_keeps_stored_channel() {
        let (_dir, storage, cache) = temp_cache().await;
        let now = now_secs();
        assert!(cache.upsert("k1", "{}", now + 60, meta_at(now, Some("T1"))).await);
        assert!(cache.upsert("k1", r#"{"items":[]}"#, now + 120, UpsertMeta::default()).await);

        let record = cache.get_by_key("k1").await.unwrap();
        assert_eq!(record.channel.as_deref(), Some("C1"));
        assert_eq!(record.thread_ts.as_deref(), Some("T1"));
        assert_eq!(record.expires_at, now + 120);
        storage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn resolve_index_covers_each_outcome() {
        let (_dir, storage, cache) = temp_cache().await;
        let now = 1_000;

        assert_eq!(cache.resolve_index("C1", None, 1, now).await, IndexLookup::NoList);

        let items = vec![item(1, "First"), item(2, "Second")];
        assert!(
            cache
                .store_items("k1", &items, Duration::from_secs(300), meta_at(now, None))
                .await
        );

        match cache.resolve_index("C1", Some("T-other"), 2, now + 10).await {
            IndexLookup::Found { item, cache_key } => {
                assert_eq!(item.subject, "Second");
                assert_eq!(cache_key, "k1");
            }
            other => panic!("expected found, got {other:?}"),
        }

        assert_eq!(
            cache.resolve_index("C1", None, 7, now + 10).await,
            IndexLookup::NotInList {
                cache_key: "k1".to_string()
            }
        );
        assert_eq!(
            cache.resolve_index("C1", None, 1, now + 301).await,
            IndexLookup::Expired {
                cache_key: "k1".to_string()
            }
        );

        assert!(cache.upsert("k2", "not json", now + 600, meta_at(now + 5, None)).await);
        assert_eq!(
            cache.resolve_index("C1", None, 1, now + 10).await,
            IndexLookup::Unreadable {
                cache_key: "k2".to_string()
            }
        );
        storage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn detached_cache_misses_quietly() {
        let cache = ScopedListCache::detached();
        assert!(!cache.is_attached());
        assert!(!cache.upsert("k", "{}", i64::MAX, UpsertMeta::default()).await);
        assert!(cache.get_by_key("k").await.is_none());
        assert!(cache.get_latest_by_scope("C1", None).await.is_none());
    }

    #[tokio::test]
    async fn closed_store_degrades_to_miss() {
        let (_dir, storage, cache) = temp_cache().await;
        let now = now_secs();
        assert!(cache.upsert("k1", "{}", now + 60, meta_at(now, None)).await);
        storage.shutdown().await.unwrap();

        assert!(cache.get_by_key("k1").await.is_none());
        assert!(!cache.upsert("k2", "{}", now + 60, meta_at(now, None)).await);
        assert_eq!(cache.resolve_index("C1", None, 1, now).await, IndexLookup::NoList);
    }
}
