//! List cache behavior across keys, scopes and the sweeper.
//!
//! All timestamps are explicit epoch seconds.

use std::time::Duration;

use mailgate_core::cache_key::ListCacheKey;
use mailgate_core::list_cache::{IndexLookup, ListItem, ScopedListCache, UpsertMeta};
use mailgate_core::storage::StorageHandle;
use mailgate_core::sweeper::{CacheSweeper, SweepSchedule};
use tempfile::TempDir;

async fn temp_storage() -> (TempDir, StorageHandle) {
    let dir = TempDir::new().expect("create temp dir");
    let path = dir.path().join("cache.db").to_string_lossy().to_string();
    let storage = StorageHandle::new(&path).await.expect("open storage");
    (dir, storage)
}

fn meta(channel: &str, thread: Option<&str>, created_at: i64) -> UpsertMeta {
    UpsertMeta {
        channel: Some(channel.to_string()),
        thread_ts: thread.map(str::to_string),
        created_at: Some(created_at),
    }
}

fn items(subjects: &[&str]) -> Vec<ListItem> {
    subjects
        .iter()
        .enumerate()
        .map(|(i, subject)| ListItem {
            index: i as u32 + 1,
            message_id: format!("msg-{i}"),
            subject: (*subject).to_string(),
            from: "alice@example.com".to_string(),
            date: None,
            thread_id: None,
        })
        .collect()
}

#[tokio::test]
async fn upsert_roundtrip_and_channel_coalesce() {
    let (_dir, storage) = temp_storage().await;
    let cache = ScopedListCache::new(storage.clone());
    let key = ListCacheKey::new("U1").query("is:unread").page(1).build();

    assert!(
        cache
            .upsert(&key, r#"{"items":[]}"#, 2_000, meta("C1", Some("t1"), 1_000))
            .await
    );
    let stored = cache.get_by_key(&key).await.unwrap();
    assert_eq!(stored.items_json, r#"{"items":[]}"#);

    let no_scope = UpsertMeta {
        created_at: Some(1_500),
        ..UpsertMeta::default()
    };
    assert!(cache.upsert(&key, r#"{"items":[1]}"#, 3_000, no_scope).await);

    let refreshed = cache.get_by_key(&key).await.unwrap();
    assert_eq!(refreshed.items_json, r#"{"items":[1]}"#);
    assert_eq!(refreshed.expires_at, 3_000);
    assert_eq!(refreshed.channel.as_deref(), Some("C1"));
    assert_eq!(refreshed.thread_ts.as_deref(), Some("t1"));
    storage.shutdown().await.unwrap();
}

#[tokio::test]
async fn scope_prefers_thread_then_falls_back_to_channel() {
    let (_dir, storage) = temp_storage().await;
    let cache = ScopedListCache::new(storage.clone());

    cache.upsert("k_thread_old", "{}", 9_000, meta("C1", Some("t1"), 100)).await;
    cache.upsert("k_thread_new", "{}", 9_000, meta("C1", Some("t1"), 200)).await;
    cache.upsert("k_side", "{}", 9_000, meta("C1", Some("t2"), 300)).await;
    cache.upsert("k_other", "{}", 9_000, meta("C2", None, 400)).await;

    let exact = cache.get_latest_by_scope("C1", Some("t1")).await.unwrap();
    assert_eq!(exact.cache_key, "k_thread_new");

    let fallback = cache.get_latest_by_scope("C1", Some("t9")).await.unwrap();
    assert_eq!(fallback.cache_key, "k_side");

    let channel_only = cache.get_latest_by_scope("C1", None).await.unwrap();
    assert_eq!(channel_only.cache_key, "k_side");

    assert!(cache.get_latest_by_scope("C3", None).await.is_none());
    storage.shutdown().await.unwrap();
}

#[tokio::test]
async fn numbered_followups_resolve_and_go_stale() {
    let (_dir, storage) = temp_storage().await;
    let cache = ScopedListCache::new(storage.clone());
    let key = ListCacheKey::new("U1").mailbox("INBOX").page(1).build();

    assert!(
        cache
            .store_items(
                &key,
                &items(&["Invoice", "Lunch?", "Build failed"]),
                Duration::from_secs(300),
                meta("C1", Some("t1"), 1_000),
            )
            .await
    );

    match cache.resolve_index("C1", Some("t1"), 3, 1_100).await {
        IndexLookup::Found { item, cache_key } => {
            assert_eq!(item.subject, "Build failed");
            assert_eq!(cache_key, key);
        }
        other => panic!("expected a hit, got {other:?}"),
    }

    assert_eq!(
        cache.resolve_index("C1", Some("t1"), 7, 1_100).await,
        IndexLookup::NotInList {
            cache_key: key.clone()
        }
    );
    assert_eq!(
        cache.resolve_index("C1", Some("t1"), 1, 1_301).await,
        IndexLookup::Expired {
            cache_key: key.clone()
        }
    );
    assert_eq!(
        cache.resolve_index("C9", None, 1, 1_100).await,
        IndexLookup::NoList
    );

    // Stale rows stay readable by key
    assert!(cache.get_by_key(&key).await.is_some());
    storage.shutdown().await.unwrap();
}

#[tokio::test]
async fn sweep_removes_only_expired_rows_up_to_cap() {
    let (_dir, storage) = temp_storage().await;
    let cache = ScopedListCache::new(storage.clone());
    let sweeper = CacheSweeper::new(storage.clone(), SweepSchedule::default());

    for i in 0..150 {
        let created = UpsertMeta {
            created_at: Some(0),
            ..UpsertMeta::default()
        };
        assert!(cache.upsert(&format!("old-{i}"), "{}", 10, created).await);
    }
    let fresh = UpsertMeta {
        created_at: Some(0),
        ..UpsertMeta::default()
    };
    assert!(cache.upsert("fresh", "{}", 5_000, fresh).await);

    let first = sweeper.sweep(1_000, 0, 100).await.unwrap();
    assert_eq!(first.expired, 150);
    assert_eq!(first.deleted, 100);

    let second = sweeper.sweep(1_000, 0, 100).await.unwrap();
    assert_eq!(second.deleted, 50);

    let third = sweeper.sweep(1_000, 0, 100).await.unwrap();
    assert_eq!(third.deleted, 0);
    assert!(cache.get_by_key("fresh").await.is_some());
    storage.shutdown().await.unwrap();
}

#[tokio::test]
async fn cache_degrades_to_miss_when_store_is_gone() {
    let (_dir, storage) = temp_storage().await;
    let cache = ScopedListCache::new(storage.clone());
    storage.shutdown().await.unwrap();

    assert!(!cache.upsert("k", "{}", i64::MAX, UpsertMeta::default()).await);
    assert!(cache.get_by_key("k").await.is_none());
    assert_eq!(
        cache.resolve_index("C1", None, 1, 0).await,
        IndexLookup::NoList
    );

    let detached = ScopedListCache::detached();
    assert!(!detached.is_attached());
    assert!(detached.get_latest_by_scope("C1", None).await.is_none());
}
