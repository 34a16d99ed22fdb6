//! RetryOutbox persistence tests
//!
//! Unit tests cover the age partition with a fixed clock; these exercise a
//! file-backed outbox the way the supervisor uses it.

use broker_link::resilience::RetryOutbox;
use std::time::Duration;
use tempfile::TempDir;

async fn file_outbox(dir: &TempDir) -> RetryOutbox {
    RetryOutbox::open(dir.path().join("outbox.db")).await.unwrap()
}

#[tokio::test]
async fn test_pending_batch_is_oldest_first() {
    let dir = TempDir::new().unwrap();
    let outbox = file_outbox(&dir).await;

    let first = outbox.enqueue("first").await.unwrap();
    let second = outbox.enqueue("second").await.unwrap();
    let third = outbox.enqueue("third").await.unwrap();

    let batch = outbox.pending_batch(100).await.unwrap();
    let ids: Vec<i64> = batch.iter().map(|record| record.id).collect();
    assert_eq!(ids, vec![first, second, third]);
    assert_eq!(batch[0].message, "first");
    assert!(batch.iter().all(|record| !record.processed && record.retry_count == 0));

    let limited = outbox.pending_batch(2).await.unwrap();
    assert_eq!(limited.len(), 2);
}

#[tokio::test]
async fn test_mark_processed_hides_row_but_keeps_it() {
    let dir = TempDir::new().unwrap();
    let outbox = file_outbox(&dir).await;

    let delivered = outbox.enqueue("delivered").await.unwrap();
    outbox.enqueue("pending").await.unwrap();

    assert!(outbox.mark_processed(delivered).await.unwrap());
    assert!(!outbox.mark_processed(delivered).await.unwrap());
    assert!(!outbox.mark_processed(9999).await.unwrap());

    let pending = outbox.pending_batch(100).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].message, "pending");
    assert_eq!(outbox.size().await.unwrap(), 1);
    assert_eq!(outbox.total_count().await.unwrap(), 2);

    let record = outbox.get(delivered).await.unwrap().unwrap();
    assert!(record.processed);
    assert!(record.processed_at.is_some());
}

#[tokio::test]
async fn test_rows_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let outbox = file_outbox(&dir).await;
        outbox.enqueue("parked before crash").await.unwrap();
        outbox.close().await;
    }

    let reopened = file_outbox(&dir).await;
    let pending = reopened.pending_batch(100).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].message, "parked before crash");
}

#[tokio::test]
async fn test_ids_are_not_reused_after_sweep() {
    let dir = TempDir::new().unwrap();
    let outbox = file_outbox(&dir).await;

    let old = outbox.enqueue("old").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let report = outbox.sweep(Duration::ZERO).await.unwrap();
    assert_eq!(report.expired_deleted, 1);
    assert_eq!(outbox.total_count().await.unwrap(), 0);

    let fresh = outbox.enqueue("fresh").await.unwrap();
    assert!(fresh > old);
}

#[tokio::test]
async fn test_sweep_keeps_recent_rows() {
    let outbox = RetryOutbox::in_memory().await.unwrap();
    let id = outbox.enqueue("recent").await.unwrap();
    outbox.mark_processed(id).await.unwrap();
    outbox.enqueue("recent pending").await.unwrap();

    let report = outbox.sweep(Duration::from_secs(3 * 24 * 60 * 60)).await.unwrap();
    assert_eq!(report.total(), 0);
    assert_eq!(outbox.total_count().await.unwrap(), 2);
}
