use chrono::{DateTime, Utc};
use rstest::{fixture, rstest};

use crate::record::{DimensionSample, UsageRecord};
use crate::store::{in_memory::InMemoryUsageStore, InsertOutcome, StoreError, UsageStore};

#[cfg(feature = "postgres-tests")]
use crate::store::postgres::PostgresUsageStore;

fn ts(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

fn sample_record(customer_id: &str, window_end: &str) -> UsageRecord {
    UsageRecord {
        customer_id: customer_id.to_string(),
        window_end: ts(window_end),
        dimensions: vec![
            DimensionSample::new("cpu", 4),
            DimensionSample::new("memory", 8),
            DimensionSample::new("storage", 100),
        ],
        pending: true,
    }
}

/// Fixture that returns InMemoryUsageStore
#[fixture]
fn in_memory_store() -> InMemoryUsageStore {
    InMemoryUsageStore::new()
}

async fn run_test_insert_then_get<S: UsageStore>(store: &S) {
    let record = sample_record("ACME", "2024-01-01T02:00:00Z");

    let outcome = store.insert_if_absent(&record).await.unwrap();
    assert_eq!(outcome, InsertOutcome::Inserted);

    let stored = store.get("ACME", ts("2024-01-01T02:00:00Z")).await.unwrap();
    assert_eq!(stored, Some(record));

    let other = store.get("ACME", ts("2024-01-01T03:00:00Z")).await.unwrap();
    assert_eq!(other, None);
}

async fn run_test_second_insert_is_rejected<S: UsageStore>(store: &S) {
    let first = sample_record("ACME", "2024-01-01T02:00:00Z");
    let mut second = first.clone();
    second.dimensions[0].quantity = 999;

    assert_eq!(store.insert_if_absent(&first).await.unwrap(), InsertOutcome::Inserted);
    assert_eq!(store.insert_if_absent(&second).await.unwrap(), InsertOutcome::AlreadyExists);

    // The first write wins
    let stored = store.get("ACME", first.window_end).await.unwrap().unwrap();
    assert_eq!(stored.dimensions[0].quantity, 4);
}

async fn run_test_range_excludes_start_and_includes_end<S: UsageStore>(store: &S) {
    store
        .insert_if_absent(&sample_record("ACME", "2024-01-01T02:00:00Z"))
        .await
        .unwrap();

    // Window [01:00, 02:00) is recorded by the record keyed at 02:00
    assert!(store
        .exists_in_range("ACME", ts("2024-01-01T01:00:00Z"), ts("2024-01-01T02:00:00Z"))
        .await
        .unwrap());
    // The following window [02:00, 03:00) is not
    assert!(!store
        .exists_in_range("ACME", ts("2024-01-01T02:00:00Z"), ts("2024-01-01T03:00:00Z"))
        .await
        .unwrap());
    // A record keyed inside the range also counts
    assert!(store
        .exists_in_range("ACME", ts("2024-01-01T01:30:00Z"), ts("2024-01-01T02:30:00Z"))
        .await
        .unwrap());
}

async fn run_test_range_is_scoped_to_customer<S: UsageStore>(store: &S) {
    store
        .insert_if_absent(&sample_record("ACME", "2024-01-01T02:00:00Z"))
        .await
        .unwrap();

    assert!(!store
        .exists_in_range("GLOBEX", ts("2024-01-01T01:00:00Z"), ts("2024-01-01T02:00:00Z"))
        .await
        .unwrap());
    assert_eq!(
        store
            .insert_if_absent(&sample_record("GLOBEX", "2024-01-01T02:00:00Z"))
            .await
            .unwrap(),
        InsertOutcome::Inserted
    );
}

async fn run_test_pending_lifecycle<S: UsageStore>(store: &S) {
    store
        .insert_if_absent(&sample_record("ACME", "2024-01-01T03:00:00Z"))
        .await
        .unwrap();
    store
        .insert_if_absent(&sample_record("ACME", "2024-01-01T02:00:00Z"))
        .await
        .unwrap();

    let pending = store.pending_records("ACME").await.unwrap();
    let ends: Vec<_> = pending.iter().map(|r| r.window_end).collect();
    assert_eq!(ends, vec![ts("2024-01-01T02:00:00Z"), ts("2024-01-01T03:00:00Z")]);

    store.mark_submitted("ACME", ts("2024-01-01T02:00:00Z")).await.unwrap();

    let pending = store.pending_records("ACME").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].window_end, ts("2024-01-01T03:00:00Z"));

    let submitted = store.get("ACME", ts("2024-01-01T02:00:00Z")).await.unwrap().unwrap();
    assert!(!submitted.pending);
}

async fn run_test_mark_submitted_unknown_record<S: UsageStore>(store: &S) {
    let result = store.mark_submitted("ACME", ts("2024-01-01T02:00:00Z")).await;
    assert!(matches!(result, Err(StoreError::NotFound { .. })));
}

#[rstest]
#[tokio::test]
async fn test_insert_then_get(in_memory_store: InMemoryUsageStore) {
    run_test_insert_then_get(&in_memory_store).await;
}

#[rstest]
#[tokio::test]
async fn test_second_insert_is_rejected(in_memory_store: InMemoryUsageStore) {
    run_test_second_insert_is_rejected(&in_memory_store).await;
    assert_eq!(in_memory_store.len(), 1);
}

#[rstest]
#[tokio::test]
async fn test_range_excludes_start_and_includes_end(in_memory_store: InMemoryUsageStore) {
    run_test_range_excludes_start_and_includes_end(&in_memory_store).await;
}

#[rstest]
#[tokio::test]
async fn test_range_is_scoped_to_customer(in_memory_store: InMemoryUsageStore) {
    run_test_range_is_scoped_to_customer(&in_memory_store).await;
}

#[rstest]
#[tokio::test]
async fn test_pending_lifecycle(in_memory_store: InMemoryUsageStore) {
    run_test_pending_lifecycle(&in_memory_store).await;
}

#[rstest]
#[tokio::test]
async fn test_mark_submitted_unknown_record(in_memory_store: InMemoryUsageStore) {
    run_test_mark_submitted_unknown_record(&in_memory_store).await;
}

#[rstest]
#[tokio::test]
async fn test_empty_range_is_never_recorded(in_memory_store: InMemoryUsageStore) {
    in_memory_store
        .insert_if_absent(&sample_record("ACME", "2024-01-01T02:00:00Z"))
        .await
        .unwrap();

    let instant = ts("2024-01-01T02:00:00Z");
    assert!(!in_memory_store.exists_in_range("ACME", instant, instant).await.unwrap());
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_insert_then_get_postgres(pool: sqlx::PgPool) {
    run_test_insert_then_get(&PostgresUsageStore::new(pool)).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_second_insert_is_rejected_postgres(pool: sqlx::PgPool) {
    run_test_second_insert_is_rejected(&PostgresUsageStore::new(pool)).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_range_excludes_start_and_includes_end_postgres(pool: sqlx::PgPool) {
    run_test_range_excludes_start_and_includes_end(&PostgresUsageStore::new(pool)).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_range_is_scoped_to_customer_postgres(pool: sqlx::PgPool) {
    run_test_range_is_scoped_to_customer(&PostgresUsageStore::new(pool)).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_pending_lifecycle_postgres(pool: sqlx::PgPool) {
    run_test_pending_lifecycle(&PostgresUsageStore::new(pool)).await;
}

#[cfg(feature = "postgres-tests")]
#[sqlx::test]
async fn test_mark_submitted_unknown_record_postgres(pool: sqlx::PgPool) {
    run_test_mark_submitted_unknown_record(&PostgresUsageStore::new(pool)).await;
}

mod dedup_gate {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::store::DedupGate;
    use crate::test_utils::{test_metrics, FlakyStore};
    use crate::window::TimeWindow;

    fn window(end: &str) -> TimeWindow {
        TimeWindow::ending_at(ts(end), Duration::from_secs(3600)).unwrap()
    }

    #[tokio::test]
    async fn test_gate_reports_recorded_windows() {
        let store = FlakyStore::new();
        store
            .insert_if_absent(&sample_record("ACME", "2024-01-01T02:00:00Z"))
            .await
            .unwrap();
        let metrics = test_metrics();
        let gate = DedupGate::new(Arc::new(store), metrics.clone());

        assert!(gate.exists("ACME", &window("2024-01-01T02:00:00Z")).await.unwrap());
        assert!(!gate.exists("ACME", &window("2024-01-01T03:00:00Z")).await.unwrap());
        assert!(!gate.exists("ACME", &window("2024-01-01T01:00:00Z")).await.unwrap());
        assert_eq!(metrics.store_operations("exists"), 3);
        assert_eq!(metrics.store_errors("exists"), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_gate_fails_closed_when_store_is_down() {
        let store = FlakyStore::new();
        store.fail_exists(true);
        let metrics = test_metrics();
        let gate = DedupGate::new(Arc::new(store), metrics.clone());

        let result = gate.exists("ACME", &window("2024-01-01T02:00:00Z")).await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(metrics.store_errors("exists"), 1);
    }
}
