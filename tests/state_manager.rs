//! End-to-end tests over the in-memory backend: manager wiring, lifecycle,
//! and cross-manager diff propagation through a shared bus.

use std::sync::Arc;
use std::time::Duration;

use au_state_keeper::models::au_state::{AuStateBean, CrawlResult, PollResult, PollVariant};
use au_state_keeper::models::{FieldSet, StateRecord};
use au_state_keeper::services::state_bus::StateBus;
use au_state_keeper::services::state_manager::StateManager;
use au_state_keeper::StateError;

#[tokio::test]
async fn au_state_is_a_singleton_until_deleted() {
    let manager = StateManager::in_memory(64);
    let a = manager.au_state("au1").await.unwrap();
    let b = manager.au_state("au1").await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));

    manager.au_deleted("au1").await;
    let c = manager.au_state("au1").await.unwrap();
    assert!(!Arc::ptr_eq(&a, &c));
}

#[tokio::test]
async fn state_survives_au_deletion() {
    let manager = StateManager::in_memory(64);
    let au = manager.au_state("au1").await.unwrap();
    au.set_num_agree_peers_last_por(7).await.unwrap();

    let suspects = manager.au_suspect_url_versions("au1").await.unwrap();
    suspects
        .mark_suspect("http://e.com/a", 1, None, None)
        .await
        .unwrap();

    // Deactivation evicts the live entries but not the persisted copies.
    manager.au_deleted("au1").await;

    let revived = manager.au_state("au1").await.unwrap();
    assert_eq!(revived.bean().num_agree_peers_last_por, 7);
    let revived_suspects = manager.au_suspect_url_versions("au1").await.unwrap();
    assert!(revived_suspects.is_suspect("http://e.com/a", 1));
}

#[tokio::test]
async fn exists_and_record_paths() {
    let manager = StateManager::in_memory(64);
    assert!(!manager.has_au_state("au1").await.unwrap());

    // Bean-only access creates and persists a default record.
    let record = manager.au_state_record("au1").await.unwrap();
    assert_eq!(record.au_id, "au1");
    assert!(record.au_creation_time > 0);
    assert!(manager.has_au_state("au1").await.unwrap());

    // Promotion to a live handle sees the same record.
    let au = manager.au_state("au1").await.unwrap();
    assert_eq!(au.bean().au_creation_time, record.au_creation_time);
}

#[tokio::test]
async fn store_then_restore_is_rejected() {
    let manager = StateManager::in_memory(64);
    let bean = AuStateBean::new_default("au1");
    manager.store_au_state(bean.clone()).await.unwrap();
    let err = manager.store_au_state(bean).await.unwrap_err();
    assert!(matches!(err, StateError::AlreadyExists { .. }));
}

#[tokio::test]
async fn service_update_requires_full_field_set() {
    let manager = StateManager::in_memory(64);

    let mut bean = AuStateBean::new_default("au1");
    bean.num_willing_repairers = 3;

    // Partial update can never materialize an entry.
    let err = manager
        .update_au_state_from_service(
            bean.clone(),
            &FieldSet::of(&["num_willing_repairers"]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StateError::NotCached { .. }));

    // Full set is an implicit store.
    manager
        .update_au_state_from_service(bean.clone(), &FieldSet::All)
        .await
        .unwrap();
    let au = manager.au_state("au1").await.unwrap();
    assert_eq!(au.bean().num_willing_repairers, 3);

    // Once a live instance exists, the key-based path is refused.
    let err = manager
        .update_au_state_from_service(bean, &FieldSet::All)
        .await
        .unwrap_err();
    assert!(matches!(err, StateError::StaleHandle { .. }));
}

#[tokio::test]
async fn diffs_propagate_to_a_peer_manager_with_a_cached_copy() {
    let bus = Arc::new(StateBus::new(64));
    let writer = StateManager::in_memory_with_bus(bus.clone());
    let reader = StateManager::in_memory_with_bus(bus.clone());
    let writer_router = writer.spawn_router();
    let reader_router = reader.spawn_router();

    // The reader caches its own copy of the key first.
    let theirs = reader.au_state("au1").await.unwrap();
    assert_eq!(theirs.bean().num_willing_repairers, 0);

    let ours = writer.au_state("au1").await.unwrap();
    ours.set_num_willing_repairers(5).await.unwrap();
    ours.new_crawl_started().await.unwrap();
    ours.new_crawl_finished(CrawlResult::Success, None, 0)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(theirs.bean().num_willing_repairers, 5);
    assert_eq!(theirs.last_crawl_result(), CrawlResult::Success);
    // Field-level overwrite only: the reader's unrelated fields are intact.
    assert_eq!(theirs.bean().au_id, "au1");

    writer_router.abort();
    reader_router.abort();
}

#[tokio::test]
async fn uncached_receiver_ignores_partial_diffs() {
    let bus = Arc::new(StateBus::new(64));
    let writer = StateManager::in_memory_with_bus(bus.clone());
    let reader = StateManager::in_memory_with_bus(bus.clone());
    let reader_router = reader.spawn_router();

    let ours = writer.au_state("au1").await.unwrap();
    ours.set_num_willing_repairers(5).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    // The reader held no copy, so the diff was dropped; its own lazy load
    // default-creates against its own (empty) backend.
    assert!(!reader.has_au_state("au1").await.unwrap());

    reader_router.abort();
}

#[tokio::test]
async fn own_echo_is_suppressed() {
    let bus = Arc::new(StateBus::new(64));
    let manager = StateManager::in_memory_with_bus(bus.clone());
    let router = manager.spawn_router();

    let au = manager.au_state("au1").await.unwrap();

    // A mid-crawl local view must survive our own echoed diffs: the echo
    // carries the Running sentinel, and reapplying it is skipped outright.
    au.new_crawl_finished(CrawlResult::Error, Some("boom"), 0)
        .await
        .unwrap();
    au.new_crawl_started().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(au.last_crawl_result(), CrawlResult::Error);
    assert_eq!(au.bean().last_crawl_result, CrawlResult::Running);

    router.abort();
}

#[tokio::test]
async fn suspect_count_feeds_back_into_au_state() {
    let manager = StateManager::in_memory(64);
    let suspects = manager.au_suspect_url_versions("au1").await.unwrap();
    suspects
        .mark_suspect("http://e.com/a", 1, Some("aa"), Some("bb"))
        .await
        .unwrap();
    suspects
        .mark_suspect("http://e.com/b", 2, None, None)
        .await
        .unwrap();

    let au = manager.au_state("au1").await.unwrap();
    au.set_num_currently_suspect_versions(suspects.len() as i32)
        .await
        .unwrap();
    assert_eq!(au.bean().num_currently_suspect_versions, 2);
}

#[tokio::test]
async fn full_crawl_and_poll_cycle_persists() {
    let manager = StateManager::in_memory(64);
    let au = manager.au_state("au1").await.unwrap();

    let batch = au.begin_batch();
    au.new_crawl_started().await.unwrap();
    au.content_changed().await.unwrap();
    au.new_crawl_finished(CrawlResult::Success, None, 2)
        .await
        .unwrap();
    batch.commit().await.unwrap();

    au.poll_attempted().await.unwrap();
    au.poll_started(PollVariant::Por).await.unwrap();
    au.poll_finished(PollVariant::Por, PollResult::Complete, Some(1200))
        .await
        .unwrap();

    // Evict and reload through the backend; everything round-trips.
    manager.au_deleted("au1").await;
    let reloaded = manager.au_state("au1").await.unwrap();
    let bean = reloaded.bean();
    assert_eq!(bean.last_crawl_result, CrawlResult::Success);
    assert_eq!(bean.last_deep_crawl_depth, 2);
    assert!(bean.last_content_change > 0);
    assert_eq!(bean.last_poll_result, PollResult::Complete);
    assert!(bean.last_top_level_poll > 0);
    assert_eq!(bean.average_poll_duration, 1200);
}
