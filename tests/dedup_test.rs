//! Integration tests for cross-batch duplicate resolution.

use batchq::config::Layout;
use batchq::dedup::DuplicateResolver;
use batchq::lock::LockOptions;
use batchq::model::{Batch, ItemId, Status};
use batchq::store::StateStore;

struct Fixture {
    _dir: tempfile::TempDir,
    store: StateStore,
    batches: Vec<Batch>,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(Layout::default(), LockOptions::default());
    let batches = ["2025-07-28", "2025-07-29"]
        .iter()
        .map(|key| {
            let batch = Batch::new(*key, dir.path().join(key));
            for sub in ["ready", "rendered", "images"] {
                std::fs::create_dir_all(batch.root.join(sub)).unwrap();
            }
            batch
        })
        .collect();
    Fixture {
        _dir: dir,
        store,
        batches,
    }
}

fn completed(f: &Fixture, batch: usize, id: u32, url: &str) {
    let b = &f.batches[batch];
    let id = ItemId(id);
    std::fs::write(b.root.join(format!("ready/article_{id}.md")), "# text").unwrap();
    std::fs::write(b.root.join(format!("rendered/article_{id}.html")), "<p/>").unwrap();
    std::fs::write(b.root.join(format!("images/article_{id}_1.jpg")), [0u8; 4]).unwrap();
    f.store
        .set_status(b, id, Status::Completed, Some(url), None)
        .unwrap();
}

#[test]
fn smallest_identifier_is_kept() {
    let f = fixture();
    completed(&f, 0, 3, "https://a.example/story");
    completed(&f, 1, 2, "http://www.a.example/story/");
    completed(&f, 1, 4, "https://b.example/other");

    let report = DuplicateResolver::new(f.store.clone()).resolve(&f.batches, false);
    assert!(report.failed_batches.is_empty());
    assert_eq!(report.removals.len(), 1);

    let removal = &report.removals[0];
    assert_eq!(removal.removed.batch, "2025-07-28");
    assert_eq!(removal.removed.id, ItemId(3));
    assert_eq!(removal.kept.batch, "2025-07-29");
    assert_eq!(removal.kept.id, ItemId(2));
    assert_eq!(removal.files.len(), 3);

    let loser = &f.batches[0].root;
    assert!(!loser.join("ready/article_03.md").exists());
    assert!(!loser.join("rendered/article_03.html").exists());
    assert!(!loser.join("images/article_03_1.jpg").exists());
    assert!(loser.join("ready/article_03.tmp").exists());
    assert!(f.store.load(&f.batches[0]).unwrap().get(ItemId(3)).is_none());

    let winner = &f.batches[1].root;
    assert!(winner.join("ready/article_02.md").exists());
    assert!(f.store.load(&f.batches[1]).unwrap().get(ItemId(2)).is_some());
    assert!(f.store.load(&f.batches[1]).unwrap().get(ItemId(4)).is_some());
}

#[test]
fn equal_identifiers_keep_the_earlier_batch() {
    let f = fixture();
    completed(&f, 0, 5, "https://a.example/story");
    completed(&f, 1, 5, "https://a.example/story");

    let report = DuplicateResolver::new(f.store.clone()).resolve(&f.batches, false);
    assert_eq!(report.removals.len(), 1);
    assert_eq!(report.removals[0].kept.batch, "2025-07-28");
    assert_eq!(report.removals[0].removed.batch, "2025-07-29");
}

#[test]
fn dry_run_touches_nothing() {
    let f = fixture();
    completed(&f, 0, 1, "https://a.example/story");
    completed(&f, 0, 2, "https://a.example/story");
    let before = std::fs::read_to_string(f.batches[0].root.join("records.json")).unwrap();

    let report = DuplicateResolver::new(f.store.clone()).resolve(&f.batches, true);
    assert_eq!(report.removals.len(), 1);
    assert_eq!(report.removals[0].removed.id, ItemId(2));
    assert!(report.removals[0].files.is_empty());

    let root = &f.batches[0].root;
    assert!(root.join("ready/article_02.md").exists());
    assert!(root.join("images/article_02_1.jpg").exists());
    assert_eq!(
        std::fs::read_to_string(root.join("records.json")).unwrap(),
        before
    );
}

#[test]
fn removed_identifier_is_never_reallocated() {
    let f = fixture();
    completed(&f, 0, 1, "https://a.example/story");
    completed(&f, 0, 2, "https://a.example/story");

    DuplicateResolver::new(f.store.clone()).resolve(&f.batches, false);

    let allocator = batchq::allocator::NumberAllocator::new(f.store.clone());
    assert_eq!(allocator.next_identifier(&f.batches[0]).unwrap().id, ItemId(3));
}

#[test]
fn second_run_finds_nothing() {
    let f = fixture();
    completed(&f, 0, 1, "https://a.example/story");
    completed(&f, 1, 1, "https://a.example/story");

    let resolver = DuplicateResolver::new(f.store.clone());
    assert_eq!(resolver.resolve(&f.batches, false).removals.len(), 1);
    assert!(resolver.resolve(&f.batches, false).removals.is_empty());
}

#[test]
fn undeletable_artifact_keeps_the_record() {
    let f = fixture();
    completed(&f, 0, 1, "https://a.example/story");
    completed(&f, 0, 2, "https://a.example/story");
    completed(&f, 0, 3, "https://a.example/story");

    // A non-empty directory where id 2's output should be cannot be removed
    // with a file delete.
    let root = f.batches[0].root.clone();
    let stuck = root.join("ready/article_02.md");
    std::fs::remove_file(&stuck).unwrap();
    std::fs::create_dir(&stuck).unwrap();
    std::fs::write(stuck.join("keep"), "x").unwrap();

    let resolver = DuplicateResolver::new(f.store.clone());
    let report = resolver.resolve(&f.batches, false);

    assert_eq!(report.removals.len(), 1);
    assert_eq!(report.removals[0].removed.id, ItemId(3));
    assert_eq!(report.failed_removals.len(), 1);
    assert_eq!(report.failed_removals[0].0.id, ItemId(2));
    assert!(report.failed_batches.is_empty());

    let records = f.store.load(&f.batches[0]).unwrap();
    assert!(records.get(ItemId(1)).is_some());
    assert!(records.get(ItemId(2)).is_some());
    assert!(records.get(ItemId(3)).is_none());
    assert!(!root.join("ready/article_03.md").exists());
    assert!(root.join("ready/article_03.tmp").exists());

    // The other artifacts of id 2 were still attempted, and its id stays reserved.
    assert!(!root.join("rendered/article_02.html").exists());
    assert!(!root.join("images/article_02_1.jpg").exists());
    assert!(root.join("ready/article_02.tmp").exists());

    // The kept record is found again and cleared once the obstacle is gone.
    std::fs::remove_dir_all(&stuck).unwrap();
    let retry = resolver.resolve(&f.batches, false);
    assert_eq!(retry.removals.len(), 1);
    assert_eq!(retry.removals[0].removed.id, ItemId(2));
    assert!(retry.failed_removals.is_empty());
    assert!(f.store.load(&f.batches[0]).unwrap().get(ItemId(2)).is_none());
}
