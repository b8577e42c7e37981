// Replication pipeline integration tests: a fake replica-set view and sync
// source drive BackgroundSync against an in-memory catalog.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;

use ferrobase_core::engine::TxnFlags;
use ferrobase_core::repl::queue::{ReplSettings, ReplicationQueue};
use ferrobase_core::repl::view::{ReplicaSetView, SyncCandidate, SyncSource};
use ferrobase_core::{
    BackgroundSync, Catalog, FerroBaseError, Gtid, GtidManager, KvEngine, LogEntry, OplogWriter,
    Result, SlaveCache,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn setup_catalog() -> Arc<Catalog> {
    init_tracing();
    let engine = Arc::new(KvEngine::new());
    let gtids = Arc::new(GtidManager::new(1));
    let oplog = Arc::new(OplogWriter::new(Arc::new(SlaveCache::new())));
    Arc::new(Catalog::new(engine, gtids, oplog))
}

/// Run some writes on a "primary" catalog and return its oplog contents.
fn primary_entries(num_docs: i64) -> Vec<LogEntry> {
    let catalog = setup_catalog();
    catalog.create_collection("test.users").unwrap();
    let mut entries = Vec::new();
    for i in 1..=num_docs {
        let mut txn = catalog.begin_txn(TxnFlags::default());
        catalog
            .insert("test.users", &json!({"_id": i, "name": format!("user{}", i)}), &mut txn)
            .unwrap();
        txn.commit().unwrap();
    }
    // read them back the way a sync source would serve them
    let dict = catalog
        .engine()
        .dictionary(ferrobase_core::oplog::OPLOG_NS)
        .expect("oplog dictionary");
    let mut cursor = ferrobase_core::engine::EngineCursor::new(dict);
    cursor.seek(&[], true);
    while let Some((_, value)) = cursor.current() {
        let doc: serde_json::Value = serde_json::from_slice(value).unwrap();
        entries.push(LogEntry::from_doc(&doc).unwrap());
        cursor.next();
    }
    entries
}

struct FakeSource {
    name: String,
    entries: Arc<Mutex<Vec<LogEntry>>>,
    readable: Arc<AtomicBool>,
}

impl SyncSource for FakeSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn oldest_entry(&self) -> Result<Option<Gtid>> {
        Ok(self.entries.lock().first().map(|e| e.gtid))
    }

    fn readable(&self) -> Result<bool> {
        Ok(self.readable.load(Ordering::SeqCst))
    }

    fn rollback_required(&self, last_applied: Gtid) -> Result<bool> {
        if last_applied == Gtid::ZERO {
            return Ok(false);
        }
        Ok(!self.entries.lock().iter().any(|e| e.gtid == last_applied))
    }

    fn tail_from(&mut self, last: Gtid) -> Result<Vec<LogEntry>> {
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|e| e.gtid > last)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct FakeView {
    members: Vec<String>,
    entries: HashMap<String, Arc<Mutex<Vec<LogEntry>>>>,
    connect_failures: HashSet<String>,
    vetoes: Mutex<HashMap<String, Instant>>,
    readable: Arc<AtomicBool>,
    stale: AtomicBool,
    primary: AtomicBool,
}

impl FakeView {
    fn single(name: &str, entries: Vec<LogEntry>) -> Self {
        let mut view = FakeView { readable: Arc::new(AtomicBool::new(true)), ..Default::default() };
        view.members.push(name.to_string());
        view.entries.insert(name.to_string(), Arc::new(Mutex::new(entries)));
        view
    }

    fn add_member(&mut self, name: &str, entries: Vec<LogEntry>) {
        self.members.push(name.to_string());
        self.entries.insert(name.to_string(), Arc::new(Mutex::new(entries)));
    }
}

impl ReplicaSetView for FakeView {
    fn candidates(&self) -> Vec<SyncCandidate> {
        self.members.iter().map(|name| SyncCandidate { name: name.clone() }).collect()
    }

    fn connect(&self, name: &str) -> Result<Box<dyn SyncSource>> {
        if self.connect_failures.contains(name) {
            return Err(FerroBaseError::Unreadable(name.to_string()));
        }
        Ok(Box::new(FakeSource {
            name: name.to_string(),
            entries: Arc::clone(&self.entries[name]),
            readable: Arc::clone(&self.readable),
        }))
    }

    fn veto(&self, name: &str, duration: Duration) {
        self.vetoes.lock().insert(name.to_string(), Instant::now() + duration);
    }

    fn is_vetoed(&self, name: &str) -> bool {
        self.vetoes.lock().get(name).is_some_and(|until| *until > Instant::now())
    }

    fn is_primary(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }

    fn take_force_sync(&self) -> Option<String> {
        None
    }

    fn go_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }
}

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn test_end_to_end_sync() {
    let entries = primary_entries(5);
    assert_eq!(entries.len(), 5);

    let secondary = setup_catalog();
    let view = Arc::new(FakeView::single("primary:27017", entries.clone()));
    let sync = BackgroundSync::new(Arc::clone(&secondary), view, ReplSettings::default());
    sync.start();

    assert!(wait_until(Duration::from_secs(5), || {
        secondary.collection("test.users").map_or(0, |c| c.count()) == 5
    }));
    sync.shutdown();

    assert_eq!(secondary.gtid_manager().last_applied(), entries.last().unwrap().gtid);
    let coll = secondary.collection("test.users").unwrap();
    let pk = ferrobase_core::IndexKey(vec![ferrobase_core::KeyValue::Int(3)]);
    assert_eq!(coll.find_by_pk(&pk).unwrap().unwrap()["name"], json!("user3"));
}

#[test]
fn test_refetched_entries_apply_once() {
    let entries = primary_entries(3);

    let secondary = setup_catalog();
    let view = Arc::new(FakeView::single("primary:27017", entries.clone()));
    let sync = BackgroundSync::new(Arc::clone(&secondary), Arc::clone(&view) as _, ReplSettings::default());
    sync.start();
    assert!(wait_until(Duration::from_secs(5), || {
        secondary.collection("test.users").map_or(0, |c| c.count()) == 3
    }));
    sync.shutdown();

    // a restart re-tails from the last applied position; nothing duplicates
    let sync = BackgroundSync::new(Arc::clone(&secondary), view, ReplSettings::default());
    sync.start();
    std::thread::sleep(Duration::from_millis(300));
    sync.shutdown();
    assert_eq!(secondary.collection("test.users").unwrap().count(), 3);
}

#[test]
fn test_connect_failure_vetoes_and_falls_through() {
    let entries = primary_entries(2);

    let mut view = FakeView::single("bad:27017", Vec::new());
    view.connect_failures.insert("bad:27017".to_string());
    view.add_member("good:27017", entries);
    view.readable = Arc::new(AtomicBool::new(true));
    let view = Arc::new(view);

    let secondary = setup_catalog();
    let sync = BackgroundSync::new(Arc::clone(&secondary), Arc::clone(&view) as _, ReplSettings::default());
    sync.start();
    assert!(wait_until(Duration::from_secs(5), || {
        secondary.collection("test.users").map_or(0, |c| c.count()) == 2
    }));
    sync.shutdown();

    assert!(view.is_vetoed("bad:27017"));
    assert!(!view.stale.load(Ordering::SeqCst));
}

#[test]
fn test_stale_secondary_goes_stale() {
    let entries = primary_entries(5);

    // the secondary applies the first two entries, then the source discards
    // everything up to entry 4
    let secondary = setup_catalog();
    let view = Arc::new(FakeView::single("primary:27017", entries[..2].to_vec()));
    let sync = BackgroundSync::new(Arc::clone(&secondary), Arc::clone(&view) as _, ReplSettings::default());
    sync.start();
    assert!(wait_until(Duration::from_secs(5), || {
        secondary.collection("test.users").map_or(0, |c| c.count()) == 2
    }));
    sync.shutdown();

    let view = Arc::new(FakeView::single("primary:27017", entries[3..].to_vec()));
    let sync = BackgroundSync::new(Arc::clone(&secondary), Arc::clone(&view) as _, ReplSettings::default());
    sync.start();
    assert!(wait_until(Duration::from_secs(5), || view.stale.load(Ordering::SeqCst)));
    sync.shutdown();
    assert!(view.is_vetoed("primary:27017"));
    assert_eq!(secondary.collection("test.users").unwrap().count(), 2);
}

#[test]
fn test_divergent_source_is_vetoed_not_hammered() {
    let entries = primary_entries(5);

    // the secondary applies entries 1-2 from a healthy source
    let secondary = setup_catalog();
    let view = Arc::new(FakeView::single("primary:27017", entries[..2].to_vec()));
    let sync = BackgroundSync::new(Arc::clone(&secondary), Arc::clone(&view) as _, ReplSettings::default());
    sync.start();
    assert!(wait_until(Duration::from_secs(5), || {
        secondary.collection("test.users").map_or(0, |c| c.count()) == 2
    }));
    sync.shutdown();

    // the source's history diverged: it reaches back to entry 1 but no
    // longer contains our last applied entry
    let divergent = vec![entries[0].clone(), entries[2].clone()];
    let view = Arc::new(FakeView::single("primary:27017", divergent));
    let sync = BackgroundSync::new(Arc::clone(&secondary), Arc::clone(&view) as _, ReplSettings::default());
    sync.start();
    assert!(wait_until(Duration::from_secs(5), || view.stale.load(Ordering::SeqCst)));
    sync.shutdown();

    assert!(view.is_vetoed("primary:27017"));
    assert_eq!(secondary.collection("test.users").unwrap().count(), 2);
}

fn comment_entry(seq: u64) -> LogEntry {
    LogEntry {
        gtid: Gtid::new(1, seq),
        payload: ferrobase_core::OpPayload {
            op: ferrobase_core::OpType::Comment,
            ns: String::new(),
            o: json!({"msg": "noop"}),
            o2: None,
            from_migrate: false,
        },
    }
}

#[test]
fn test_flow_control_at_default_water_marks() {
    let queue = Arc::new(ReplicationQueue::new(&ReplSettings::default()));

    let q = Arc::clone(&queue);
    let producer = std::thread::spawn(move || {
        for seq in 1..=20_001u64 {
            if !q.push_blocking(comment_entry(seq)) {
                return false;
            }
        }
        true
    });

    assert!(wait_until(Duration::from_secs(5), || queue.len() == 20_000));
    std::thread::sleep(Duration::from_millis(50));
    assert!(!producer.is_finished(), "producer must block above the high-water mark");

    // draining to just below the low-water mark releases it
    for _ in 0..10_001 {
        assert!(queue.pop(Duration::from_millis(100)).is_some());
    }
    assert!(producer.join().unwrap());
    assert_eq!(queue.len(), 10_000);
}
