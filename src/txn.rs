// src/txn.rs
// Scoped transaction wrapper: default-aborts on drop unless committed.

use std::sync::Arc;

use crate::engine::{KvEngine, TxnFlags, TxnHandle};
use crate::error::{FerroBaseError, Result};
use crate::oplog::{Gtid, GtidManager, LogEntry, OpPayload, OPLOG_NS};

/// Wraps a native transaction handle in an exception-safe object.
///
/// The drop impl aborts unless the transaction was already committed, so every
/// exit path (normal return, early `?`, panic unwind) releases the engine
/// resource. Knows whether it's read-only, which the cursor and writer paths
/// rely on. Exclusively owned; never shared across threads.
pub struct TxnContext {
    engine: Arc<KvEngine>,
    gtid_manager: Arc<GtidManager>,
    handle: TxnHandle,
    /// Locally-logged operations; GTIDs are allocated at commit.
    staged_ops: Vec<OpPayload>,
    /// Entries fetched from a sync source, carrying their original GTIDs.
    replicated: Vec<LogEntry>,
    /// Non-engine effects held back until the commit succeeds.
    on_commit: Vec<Box<dyn FnOnce() + Send>>,
    /// Compensations for immediate non-engine effects, run on abort.
    on_abort: Vec<Box<dyn FnOnce() + Send>>,
}

impl TxnContext {
    pub fn new(engine: Arc<KvEngine>, gtid_manager: Arc<GtidManager>, flags: TxnFlags) -> Self {
        let handle = engine.begin(flags);
        TxnContext {
            engine,
            gtid_manager,
            handle,
            staged_ops: Vec::new(),
            replicated: Vec::new(),
            on_commit: Vec::new(),
            on_abort: Vec::new(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.handle.is_live()
    }

    pub fn is_read_only(&self) -> bool {
        self.handle.flags().read_only
    }

    pub fn engine(&self) -> &Arc<KvEngine> {
        &self.engine
    }

    /// Buffer a put on this transaction.
    pub fn put(&mut self, dict: &str, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.engine.put(&mut self.handle, dict, key, value)
    }

    /// Buffer a delete on this transaction.
    pub fn delete(&mut self, dict: &str, key: Vec<u8>) -> Result<()> {
        self.engine.delete(&mut self.handle, dict, key)
    }

    /// Committed-state read. Reads do not observe this transaction's own
    /// buffered writes.
    pub fn get(&self, dict: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.engine.dictionary(dict).and_then(|d| d.get(key))
    }

    /// The last write this transaction buffered on `dict`/`key`, if any.
    /// `Some(None)` is a staged delete.
    pub fn staged(&self, dict: &str, key: &[u8]) -> Option<Option<&[u8]>> {
        self.handle.staged(dict, key)
    }

    /// Whether this transaction has buffered a surviving put under `prefix`.
    pub fn has_staged_put_with_prefix(&self, dict: &str, prefix: &[u8]) -> bool {
        self.handle.has_staged_put_with_prefix(dict, prefix)
    }

    /// Hold a side effect back until the commit succeeds.
    pub fn defer_on_commit(&mut self, f: impl FnOnce() + Send + 'static) {
        self.on_commit.push(Box::new(f));
    }

    /// Register a compensation that undoes an immediate side effect if the
    /// transaction aborts.
    pub fn defer_on_abort(&mut self, f: impl FnOnce() + Send + 'static) {
        self.on_abort.push(Box::new(f));
    }

    /// Stage a canonical log record to be appended atomically with this
    /// transaction's data writes. Read-only contexts must never log.
    pub fn log_op(&mut self, payload: OpPayload) -> Result<()> {
        if !self.handle.is_live() {
            return Err(FerroBaseError::TransactionCommitted);
        }
        if self.is_read_only() {
            debug_assert!(false, "log_op on a read-only transaction");
            return Err(FerroBaseError::ReadOnlyTxn);
        }
        self.staged_ops.push(payload);
        Ok(())
    }

    /// Stage an already-identified entry fetched from a sync source. Its GTID
    /// is preserved so the local oplog mirrors the upstream order.
    pub fn log_replicated(&mut self, entry: LogEntry) -> Result<()> {
        if !self.handle.is_live() {
            return Err(FerroBaseError::TransactionCommitted);
        }
        if self.is_read_only() {
            debug_assert!(false, "log_replicated on a read-only transaction");
            return Err(FerroBaseError::ReadOnlyTxn);
        }
        self.replicated.push(entry);
        Ok(())
    }

    /// Number of staged log records (local and replicated).
    pub fn pending_ops(&self) -> usize {
        self.staged_ops.len() + self.replicated.len()
    }

    /// Finalize the transaction: allocate GTIDs for staged records, append
    /// them to the oplog dictionary inside the same write set, then apply
    /// everything atomically. Fails if already finalized.
    pub fn commit(&mut self) -> Result<()> {
        if !self.handle.is_live() {
            return Err(FerroBaseError::TransactionCommitted);
        }
        let mut gtids = Vec::new();
        for payload in self.staged_ops.drain(..) {
            let gtid = self.gtid_manager.next();
            let entry = LogEntry { gtid, payload };
            Self::append_entry(&self.engine, &mut self.handle, &entry)?;
            gtids.push(gtid);
        }
        let replicated: Vec<Gtid> = self.replicated.iter().map(|e| e.gtid).collect();
        for entry in std::mem::take(&mut self.replicated) {
            Self::append_entry(&self.engine, &mut self.handle, &entry)?;
        }
        self.engine.commit(&mut self.handle)?;
        for gtid in replicated {
            self.gtid_manager.note_fetched(gtid);
            self.gtid_manager.note_applied(gtid);
        }
        self.on_abort.clear();
        for hook in self.on_commit.drain(..) {
            hook();
        }
        Ok(())
    }

    fn append_entry(engine: &KvEngine, handle: &mut TxnHandle, entry: &LogEntry) -> Result<()> {
        let key = entry.gtid.as_key().encode();
        let value = serde_json::to_vec(&entry.to_doc())?;
        engine.put(handle, OPLOG_NS, key, value)
    }

    /// Roll back. Aborting twice is a no-op.
    pub fn abort(&mut self) {
        self.staged_ops.clear();
        self.replicated.clear();
        self.on_commit.clear();
        for hook in self.on_abort.drain(..) {
            hook();
        }
        self.engine.abort(&mut self.handle);
    }
}

impl Drop for TxnContext {
    fn drop(&mut self) {
        if self.handle.is_live() {
            self.abort();
        }
    }
}
