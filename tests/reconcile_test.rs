//! Integration tests for the reconciliation pass.

use std::time::Duration;

use batchq::config::Layout;
use batchq::lock::LockOptions;
use batchq::model::{Batch, ItemId, Status, WorkRecord};
use batchq::reconcile::{ReconciliationScanner, RepairKind};
use batchq::store::StateStore;
use chrono::{TimeDelta, Utc};

const HOUR: Duration = Duration::from_secs(3600);

fn setup() -> (tempfile::TempDir, Batch, StateStore, ReconciliationScanner) {
    let dir = tempfile::tempdir().unwrap();
    let batch = Batch::new("2025-07-29", dir.path().join("2025-07-29"));
    std::fs::create_dir_all(batch.root.join("ready")).unwrap();
    let store = StateStore::new(Layout::default(), LockOptions::default());
    let scanner = ReconciliationScanner::new(store.clone(), HOUR);
    (dir, batch, store, scanner)
}

fn seed(store: &StateStore, batch: &Batch, id: u32, status: Status, age: TimeDelta) {
    store
        .update(batch, |set| {
            let record = WorkRecord::new(
                format!("https://a.example/{id}"),
                status,
                Utc::now() - age,
            );
            set.insert(ItemId(id), record);
            Ok(())
        })
        .unwrap();
}

#[test]
fn processing_with_output_becomes_completed() {
    let (_dir, batch, store, scanner) = setup();
    seed(&store, &batch, 1, Status::Processing, TimeDelta::minutes(5));
    std::fs::write(batch.root.join("ready/article_01.md"), "# one").unwrap();

    let repairs = scanner.reconcile(&batch).unwrap();
    assert_eq!(repairs.len(), 1);
    assert_eq!(repairs[0].kind, RepairKind::Completed);

    let record = store.load(&batch).unwrap().get(ItemId(1)).cloned().unwrap();
    assert_eq!(record.status, Status::Completed);
    assert!(record.completed_at.is_some());
}

#[test]
fn old_processing_without_output_times_out() {
    let (_dir, batch, store, scanner) = setup();
    seed(&store, &batch, 1, Status::Processing, TimeDelta::hours(2));
    seed(&store, &batch, 2, Status::Processing, TimeDelta::minutes(10));

    let repairs = scanner.reconcile(&batch).unwrap();
    assert_eq!(repairs.len(), 1);
    assert_eq!(repairs[0].id, ItemId(1));
    assert_eq!(repairs[0].kind, RepairKind::ProcessingTimeout);

    let set = store.load(&batch).unwrap();
    let stuck = set.get(ItemId(1)).unwrap();
    assert_eq!(stuck.status, Status::Failed);
    assert_eq!(stuck.error.as_deref(), Some("processing timeout"));
    assert_eq!(set.get(ItemId(2)).unwrap().status, Status::Processing);
}

#[test]
fn retrying_is_always_interrupted() {
    let (_dir, batch, store, scanner) = setup();
    seed(&store, &batch, 4, Status::Retrying, TimeDelta::seconds(1));

    let repairs = scanner.reconcile(&batch).unwrap();
    assert_eq!(repairs[0].kind, RepairKind::RetryInterrupted);

    let record = store.load(&batch).unwrap().get(ItemId(4)).cloned().unwrap();
    assert_eq!(record.status, Status::Failed);
    assert_eq!(record.error.as_deref(), Some("retry interrupted"));
}

#[test]
fn processing_without_timestamp_is_stuck() {
    let (_dir, batch, store, scanner) = setup();
    std::fs::write(
        batch.root.join("records.json"),
        r#"{"07": {"url": "https://a.example/7", "status": "processing"}}"#,
    )
    .unwrap();

    let repairs = scanner.reconcile(&batch).unwrap();
    assert_eq!(repairs.len(), 1);
    assert_eq!(repairs[0].kind, RepairKind::ProcessingTimeout);
    assert_eq!(
        store.load(&batch).unwrap().get(ItemId(7)).unwrap().status,
        Status::Failed
    );
}

#[test]
fn second_pass_changes_nothing() {
    let (_dir, batch, store, scanner) = setup();
    seed(&store, &batch, 1, Status::Processing, TimeDelta::hours(3));
    seed(&store, &batch, 2, Status::Retrying, TimeDelta::minutes(1));
    seed(&store, &batch, 3, Status::Completed, TimeDelta::hours(5));
    seed(&store, &batch, 4, Status::Pending, TimeDelta::hours(5));

    assert_eq!(scanner.reconcile(&batch).unwrap().len(), 2);
    let after_first = std::fs::read_to_string(batch.root.join("records.json")).unwrap();

    assert!(scanner.reconcile(&batch).unwrap().is_empty());
    let after_second = std::fs::read_to_string(batch.root.join("records.json")).unwrap();
    assert_eq!(after_first, after_second);
}

#[test]
fn artifacts_are_never_deleted() {
    let (_dir, batch, store, scanner) = setup();
    seed(&store, &batch, 1, Status::Processing, TimeDelta::hours(3));
    std::fs::write(batch.root.join("ready/article_01.tmp"), "").unwrap();
    std::fs::create_dir_all(batch.root.join("rendered")).unwrap();
    std::fs::write(batch.root.join("rendered/article_01.html"), "<p/>").unwrap();

    scanner.reconcile(&batch).unwrap();
    assert!(batch.root.join("ready/article_01.tmp").exists());
    assert!(batch.root.join("rendered/article_01.html").exists());
}

#[test]
fn unreadable_batch_does_not_stop_the_others() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(Layout::default(), LockOptions::default());
    let scanner = ReconciliationScanner::new(store.clone(), HOUR);

    let broken = Batch::new("2025-07-28", dir.path().join("2025-07-28"));
    std::fs::create_dir_all(&broken.root).unwrap();
    std::fs::write(broken.root.join("records.json"), "{not json").unwrap();

    let good = Batch::new("2025-07-29", dir.path().join("2025-07-29"));
    std::fs::create_dir_all(&good.root).unwrap();
    seed(&store, &good, 1, Status::Retrying, TimeDelta::seconds(1));

    let report = scanner.reconcile_all(&[broken, good]);
    assert_eq!(report.repairs.len(), 1);
    assert_eq!(report.repairs[0].batch, "2025-07-29");
    assert_eq!(report.failed_batches.len(), 1);
    assert_eq!(report.failed_batches[0].0, "2025-07-28");
}
