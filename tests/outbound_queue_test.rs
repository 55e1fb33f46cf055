//! Outbound queue dedup, retry-to-exhaustion, and priority ordering against
//! a real `SQLite`-backed repository.

use sms_engine::database::{DatabaseConfig, DatabasePath, StorageEngine};
use sms_engine::domain_types::{OutboundStatus, Priority};
use sms_engine::storage::{OutboundQueueRepository, SqliteOutboundQueueRepository};
use sms_engine::time_provider::{test_time_provider, TimeProvider};
use std::time::Duration;
use tempfile::tempdir;

async fn open_engine(dir: &tempfile::TempDir, time_provider: &dyn TimeProvider) -> StorageEngine {
    let path = DatabasePath::new(dir.path().join("queue.db")).unwrap();
    let config = DatabaseConfig::for_testing(path);
    StorageEngine::open(config, time_provider).await.unwrap()
}

#[tokio::test]
async fn test_should_dedup_identical_enqueue_within_window() {
    let dir = tempdir().unwrap();
    let time_provider = test_time_provider();
    let engine = open_engine(&dir, time_provider.as_ref()).await;
    let repo = SqliteOutboundQueueRepository::new(engine.pool().clone(), time_provider);

    let first = repo
        .enqueue("+254712345678", "Hi", None, None, Priority::Normal, Duration::from_secs(60))
        .await
        .unwrap();
    let second = repo
        .enqueue("+254712345678", "Hi", None, None, Priority::Normal, Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(first, second, "identical enqueue within the dedup window must not create a second row");
    let pending = repo.get_pending(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, OutboundStatus::Pending);
    assert_eq!(pending[0].retry_count, 0);
}

#[tokio::test]
async fn test_should_exhaust_after_max_retries() {
    let dir = tempdir().unwrap();
    let time_provider = test_time_provider();
    let engine = open_engine(&dir, time_provider.as_ref()).await;
    let repo = SqliteOutboundQueueRepository::new(engine.pool().clone(), time_provider);
    let max_retries = 3;

    let id = repo
        .enqueue("+254700000099", "hi", None, None, Priority::Normal, Duration::ZERO)
        .await
        .unwrap();

    for expected_retry_count in 1..=max_retries {
        repo.mark_failed(id, "transport down", max_retries).await.unwrap();
        let pending = repo.get_pending(10).await.unwrap();
        if expected_retry_count < max_retries {
            let entry = pending.iter().find(|e| e.id == id).expect("entry still pending");
            assert_eq!(entry.retry_count, expected_retry_count);
            assert_eq!(entry.status, OutboundStatus::Failed);
        } else {
            assert!(pending.iter().all(|e| e.id != id), "exhausted entry must not be returned as pending");
        }
    }

    let stats = repo.get_stats().await.unwrap();
    assert_eq!(stats.exhausted, 1);
}

#[tokio::test]
async fn test_should_order_pending_by_priority_then_age() {
    let dir = tempdir().unwrap();
    let time_provider = test_time_provider();
    let engine = open_engine(&dir, time_provider.as_ref()).await;
    let repo = SqliteOutboundQueueRepository::new(engine.pool().clone(), time_provider);

    let low = repo.enqueue("+2547000001", "a", None, None, Priority::Low, Duration::ZERO).await.unwrap();
    let normal = repo.enqueue("+2547000002", "b", None, None, Priority::Normal, Duration::ZERO).await.unwrap();
    let urgent = repo.enqueue("+2547000003", "c", None, None, Priority::Urgent, Duration::ZERO).await.unwrap();

    let pending = repo.get_pending(10).await.unwrap();
    let ids: Vec<_> = pending.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![urgent, normal, low]);
}
