// src/engine.rs
// In-process key-value engine: named ordered dictionaries with transactional
// writes and seekable cursors. This is the storage collaborator the document
// layer sits on; the consumed surface is open/close, transactional put/delete,
// get, and cursor seek/next/prev in either direction.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{FerroBaseError, Result};

/// Flags fixed at transaction begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxnFlags {
    /// No mutations may pass through this transaction.
    pub read_only: bool,
    /// Reads may observe writes of concurrently committing transactions.
    /// The in-process engine treats this as read-committed; the flag is
    /// carried so callers state their isolation intent.
    pub read_uncommitted: bool,
}

impl TxnFlags {
    pub fn read_only() -> Self {
        TxnFlags { read_only: true, read_uncommitted: false }
    }

    pub fn read_uncommitted() -> Self {
        TxnFlags { read_only: false, read_uncommitted: true }
    }
}

/// One buffered mutation inside a transaction. `value: None` is a delete.
#[derive(Debug, Clone)]
struct WriteOp {
    dict: String,
    key: Vec<u8>,
    value: Option<Vec<u8>>,
}

/// A native transaction handle. Exclusively owned by the operation that began
/// it; writes are buffered and applied atomically at commit.
#[derive(Debug)]
pub struct TxnHandle {
    id: u64,
    flags: TxnFlags,
    writes: Vec<WriteOp>,
    live: bool,
    // moves with its owning operation but is never shared
    _not_sync: std::marker::PhantomData<std::cell::Cell<()>>,
}

impl TxnHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn flags(&self) -> TxnFlags {
        self.flags
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    /// The last buffered write for `key` in `dict`, if any. `Some(None)` is
    /// a staged delete.
    pub fn staged(&self, dict: &str, key: &[u8]) -> Option<Option<&[u8]>> {
        self.writes
            .iter()
            .rev()
            .find(|w| w.dict == dict && w.key == key)
            .map(|w| w.value.as_deref())
    }

    /// Whether the net effect of this transaction's buffered writes leaves a
    /// live key under `prefix` in `dict`.
    pub fn has_staged_put_with_prefix(&self, dict: &str, prefix: &[u8]) -> bool {
        let mut last: HashMap<&[u8], bool> = HashMap::new();
        for w in &self.writes {
            if w.dict == dict && w.key.starts_with(prefix) {
                last.insert(w.key.as_slice(), w.value.is_some());
            }
        }
        last.into_values().any(|is_put| is_put)
    }
}

/// One named ordered dictionary: committed rows in key order.
pub struct Dictionary {
    name: String,
    rows: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl Dictionary {
    fn new(name: String) -> Self {
        Dictionary { name, rows: RwLock::new(BTreeMap::new()) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.rows.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// First entry at or after `key` in ascending order.
    fn lower_bound(&self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        self.rows
            .read()
            .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    /// Last entry at or before `key` in descending order.
    fn upper_bound_rev(&self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        self.rows
            .read()
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    fn next_after(&self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        self.rows
            .read()
            .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    fn prev_before(&self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        self.rows
            .read()
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()))
    }
}

/// Cursor over one dictionary's committed rows. Exclusively owned by one
/// thread for its lifetime; every move re-reads the tree so a tailing cursor
/// observes rows committed after it was opened.
pub struct EngineCursor {
    dict: Arc<Dictionary>,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl EngineCursor {
    pub fn new(dict: Arc<Dictionary>) -> Self {
        EngineCursor { dict, current: None }
    }

    /// Position at the first entry >= `key` (forward) or the last entry
    /// <= `key` (reverse).
    pub fn seek(&mut self, key: &[u8], forward: bool) {
        self.current = if forward {
            self.dict.lower_bound(key)
        } else {
            self.dict.upper_bound_rev(key)
        };
    }

    /// Move one physical entry ahead of the current position.
    pub fn next(&mut self) {
        self.current = match self.current.take() {
            Some((k, _)) => self.dict.next_after(&k),
            None => None,
        };
    }

    /// Move one physical entry behind the current position.
    pub fn prev(&mut self) {
        self.current = match self.current.take() {
            Some((k, _)) => self.dict.prev_before(&k),
            None => None,
        };
    }

    pub fn current(&self) -> Option<(&[u8], &[u8])> {
        self.current.as_ref().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    pub fn invalidate(&mut self) {
        self.current = None;
    }
}

/// The engine: a registry of open dictionaries plus transaction bookkeeping.
/// Owned by a top-level server context and passed by handle.
pub struct KvEngine {
    dicts: RwLock<HashMap<String, Arc<Dictionary>>>,
    next_txn_id: AtomicU64,
    // serializes commit application so a multi-dictionary commit is atomic
    // with respect to other commits
    commit_lock: Mutex<()>,
}

impl KvEngine {
    pub fn new() -> Self {
        KvEngine {
            dicts: RwLock::new(HashMap::new()),
            next_txn_id: AtomicU64::new(1),
            commit_lock: Mutex::new(()),
        }
    }

    /// Open a dictionary, creating it if it doesn't already exist.
    pub fn open_dictionary(&self, name: &str) -> Arc<Dictionary> {
        if let Some(d) = self.dicts.read().get(name) {
            return Arc::clone(d);
        }
        let mut dicts = self.dicts.write();
        Arc::clone(
            dicts
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Dictionary::new(name.to_string()))),
        )
    }

    /// Look up a dictionary without creating it.
    pub fn dictionary(&self, name: &str) -> Option<Arc<Dictionary>> {
        self.dicts.read().get(name).map(Arc::clone)
    }

    pub fn drop_dictionary(&self, name: &str) -> Result<()> {
        self.dicts
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| FerroBaseError::NamespaceNotFound(name.to_string()))
    }

    pub fn list_dictionaries(&self) -> Vec<String> {
        let mut names: Vec<String> = self.dicts.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn begin(&self, flags: TxnFlags) -> TxnHandle {
        TxnHandle {
            id: self.next_txn_id.fetch_add(1, Ordering::SeqCst),
            flags,
            writes: Vec::new(),
            live: true,
            _not_sync: std::marker::PhantomData,
        }
    }

    /// Buffer a put into `txn`.
    pub fn put(&self, txn: &mut TxnHandle, dict: &str, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.buffer(txn, dict, key, Some(value))
    }

    /// Buffer a delete into `txn`.
    pub fn delete(&self, txn: &mut TxnHandle, dict: &str, key: Vec<u8>) -> Result<()> {
        self.buffer(txn, dict, key, None)
    }

    fn buffer(
        &self,
        txn: &mut TxnHandle,
        dict: &str,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
    ) -> Result<()> {
        if !txn.live {
            return Err(FerroBaseError::TransactionCommitted);
        }
        if txn.flags.read_only {
            debug_assert!(false, "write buffered on a read-only transaction");
            return Err(FerroBaseError::ReadOnlyTxn);
        }
        txn.writes.push(WriteOp { dict: dict.to_string(), key, value });
        Ok(())
    }

    /// Apply every buffered write and finalize the transaction. Fails if the
    /// transaction was already finalized.
    pub fn commit(&self, txn: &mut TxnHandle) -> Result<()> {
        if !txn.live {
            return Err(FerroBaseError::TransactionCommitted);
        }
        let _guard = self.commit_lock.lock();
        for op in txn.writes.drain(..) {
            let dict = self.open_dictionary(&op.dict);
            let mut rows = dict.rows.write();
            match op.value {
                Some(v) => {
                    rows.insert(op.key, v);
                }
                None => {
                    rows.remove(&op.key);
                }
            }
        }
        txn.live = false;
        Ok(())
    }

    /// Discard every buffered write and finalize the transaction. Aborting a
    /// finalized transaction is a no-op.
    pub fn abort(&self, txn: &mut TxnHandle) {
        txn.writes.clear();
        txn.live = false;
    }
}

impl Default for KvEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_applies_writes() {
        let engine = KvEngine::new();
        let mut txn = engine.begin(TxnFlags::default());
        engine.put(&mut txn, "d", b"a".to_vec(), b"1".to_vec()).unwrap();
        engine.put(&mut txn, "d", b"b".to_vec(), b"2".to_vec()).unwrap();
        engine.commit(&mut txn).unwrap();

        let dict = engine.dictionary("d").unwrap();
        assert_eq!(dict.get(b"a"), Some(b"1".to_vec()));
        assert_eq!(dict.get(b"b"), Some(b"2".to_vec()));
    }

    #[test]
    fn test_abort_discards_writes() {
        let engine = KvEngine::new();
        let mut txn = engine.begin(TxnFlags::default());
        engine.put(&mut txn, "d", b"a".to_vec(), b"1".to_vec()).unwrap();
        engine.abort(&mut txn);

        assert!(engine.dictionary("d").map_or(true, |d| d.get(b"a").is_none()));
    }

    #[test]
    fn test_double_commit_fails() {
        let engine = KvEngine::new();
        let mut txn = engine.begin(TxnFlags::default());
        engine.commit(&mut txn).unwrap();
        assert!(matches!(
            engine.commit(&mut txn),
            Err(FerroBaseError::TransactionCommitted)
        ));
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let engine = KvEngine::new();
        let mut txn = engine.begin(TxnFlags::read_only());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            engine.put(&mut txn, "d", b"a".to_vec(), b"1".to_vec())
        }));
        // debug builds assert, release builds error
        match result {
            Ok(r) => assert!(matches!(r, Err(FerroBaseError::ReadOnlyTxn))),
            Err(_) => {}
        }
    }

    #[test]
    fn test_cursor_seek_and_walk() {
        let engine = KvEngine::new();
        let mut txn = engine.begin(TxnFlags::default());
        for k in [b"b".to_vec(), b"d".to_vec(), b"f".to_vec()] {
            engine.put(&mut txn, "d", k.clone(), k).unwrap();
        }
        engine.commit(&mut txn).unwrap();

        let mut cursor = EngineCursor::new(engine.dictionary("d").unwrap());
        cursor.seek(b"c", true);
        assert_eq!(cursor.current().unwrap().0, b"d");
        cursor.next();
        assert_eq!(cursor.current().unwrap().0, b"f");
        cursor.next();
        assert!(cursor.current().is_none());

        cursor.seek(b"c", false);
        assert_eq!(cursor.current().unwrap().0, b"b");
        cursor.prev();
        assert!(cursor.current().is_none());
    }

    #[test]
    fn test_tailing_cursor_sees_later_commits() {
        let engine = KvEngine::new();
        engine.open_dictionary("d");
        let mut cursor = EngineCursor::new(engine.dictionary("d").unwrap());
        cursor.seek(b"", true);
        assert!(cursor.current().is_none());

        let mut txn = engine.begin(TxnFlags::default());
        engine.put(&mut txn, "d", b"a".to_vec(), b"1".to_vec()).unwrap();
        engine.commit(&mut txn).unwrap();

        cursor.seek(b"", true);
        assert_eq!(cursor.current().unwrap().0, b"a");
    }
}
