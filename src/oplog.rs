// src/oplog.rs
// Oplog entry format, GTID allocation, and the operation-logging entry points.
// Every committed data mutation gets exactly one entry, written in the same
// transaction as the mutation itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::error::{FerroBaseError, Result};
use crate::keys::{IndexKey, KeyValue};
use crate::txn::TxnContext;

/// The oplog's own namespace. Lives under the reserved `local.` prefix so it
/// is itself never replicated.
pub const OPLOG_NS: &str = "local.oplog.rs";

/// Reserved prefix for per-node housekeeping namespaces; writes here are
/// never logged.
pub const LOCAL_NS_PREFIX: &str = "local.";

const SLAVES_NS: &str = "local.slaves";

// exact wire keys
const KEY_OP: &str = "op";
const KEY_NS: &str = "ns";
const KEY_ROW: &str = "o";
const KEY_NEW_ROW: &str = "o2";
const KEY_MIGRATE: &str = "fromMigrate";
const KEY_ID: &str = "_id";

/// Globally-ordered transaction identifier: (primary term, sequence).
/// Total order across the replica set; strictly increasing per writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gtid {
    pub term: u64,
    pub seq: u64,
}

impl Gtid {
    pub const ZERO: Gtid = Gtid { term: 0, seq: 0 };

    pub fn new(term: u64, seq: u64) -> Self {
        Gtid { term, seq }
    }

    /// The smallest GTID strictly greater than this one. Used to seek a
    /// cursor past an already-seen entry.
    pub fn successor(&self) -> Gtid {
        Gtid { term: self.term, seq: self.seq + 1 }
    }

    /// The oplog dictionary's primary key for this entry.
    pub fn as_key(&self) -> IndexKey {
        IndexKey::new(vec![KeyValue::Int(self.term as i64), KeyValue::Int(self.seq as i64)])
    }

    pub fn to_value(&self) -> Value {
        json!({ "t": self.term, "i": self.seq })
    }

    pub fn from_value(v: &Value) -> Result<Gtid> {
        let term = v.get("t").and_then(Value::as_u64);
        let seq = v.get("i").and_then(Value::as_u64);
        match (term, seq) {
            (Some(t), Some(i)) => Ok(Gtid::new(t, i)),
            _ => Err(FerroBaseError::InvalidEntry(format!("bad GTID: {v}"))),
        }
    }
}

/// Operation kind, with its single-character wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Insert,
    Update,
    Delete,
    Command,
    Comment,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Insert => "i",
            OpType::Update => "u",
            OpType::Delete => "d",
            OpType::Command => "c",
            OpType::Comment => "n",
        }
    }

    pub fn from_str(s: &str) -> Result<OpType> {
        match s {
            "i" => Ok(OpType::Insert),
            "u" => Ok(OpType::Update),
            "d" => Ok(OpType::Delete),
            "c" => Ok(OpType::Command),
            "n" => Ok(OpType::Comment),
            other => Err(FerroBaseError::InvalidEntry(format!("bad op type: {other}"))),
        }
    }
}

/// A canonical log record as staged inside a transaction, before a GTID has
/// been assigned. `o` is the inserted doc / old doc / command doc / comment;
/// `o2` is the new doc on updates.
#[derive(Debug, Clone)]
pub struct OpPayload {
    pub op: OpType,
    pub ns: String,
    pub o: Value,
    pub o2: Option<Value>,
    pub from_migrate: bool,
}

/// A durable oplog record: payload plus its globally-ordered identifier.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub gtid: Gtid,
    pub payload: OpPayload,
}

impl LogEntry {
    /// Render the exact wire/storage document. `fromMigrate` is present only
    /// when true.
    pub fn to_doc(&self) -> Value {
        let mut doc = serde_json::Map::new();
        doc.insert(KEY_ID.to_string(), self.gtid.to_value());
        doc.insert(KEY_OP.to_string(), json!(self.payload.op.as_str()));
        doc.insert(KEY_NS.to_string(), json!(self.payload.ns));
        if self.payload.from_migrate {
            doc.insert(KEY_MIGRATE.to_string(), json!(true));
        }
        doc.insert(KEY_ROW.to_string(), self.payload.o.clone());
        if let Some(o2) = &self.payload.o2 {
            doc.insert(KEY_NEW_ROW.to_string(), o2.clone());
        }
        Value::Object(doc)
    }

    pub fn from_doc(doc: &Value) -> Result<LogEntry> {
        let missing = |k: &str| FerroBaseError::InvalidEntry(format!("missing field '{k}'"));
        let gtid = Gtid::from_value(doc.get(KEY_ID).ok_or_else(|| missing(KEY_ID))?)?;
        let op = OpType::from_str(
            doc.get(KEY_OP).and_then(Value::as_str).ok_or_else(|| missing(KEY_OP))?,
        )?;
        let ns = doc
            .get(KEY_NS)
            .and_then(Value::as_str)
            .ok_or_else(|| missing(KEY_NS))?
            .to_string();
        let o = doc.get(KEY_ROW).ok_or_else(|| missing(KEY_ROW))?.clone();
        let o2 = doc.get(KEY_NEW_ROW).cloned();
        let from_migrate = doc.get(KEY_MIGRATE).and_then(Value::as_bool).unwrap_or(false);
        Ok(LogEntry { gtid, payload: OpPayload { op, ns, o, o2, from_migrate } })
    }
}

/// GTID allocation and replication progress tracking for one node.
///
/// `last_live` is the newest GTID present in the local oplog (written locally
/// or fetched from the sync source); `last_applied` is the newest GTID whose
/// effects are in the data dictionaries. On a primary both advance together.
pub struct GtidManager {
    inner: Mutex<GtidState>,
}

struct GtidState {
    term: u64,
    next_seq: u64,
    last_live: Gtid,
    last_applied: Gtid,
}

impl GtidManager {
    pub fn new(term: u64) -> Self {
        GtidManager {
            inner: Mutex::new(GtidState {
                term,
                next_seq: 1,
                last_live: Gtid::ZERO,
                last_applied: Gtid::ZERO,
            }),
        }
    }

    /// Allocate the next GTID for a local write. Strictly increasing.
    pub fn next(&self) -> Gtid {
        let mut state = self.inner.lock();
        let gtid = Gtid::new(state.term, state.next_seq);
        state.next_seq += 1;
        state.last_live = gtid;
        state.last_applied = gtid;
        gtid
    }

    /// Note an entry fetched from the sync source and written to the local
    /// oplog but not yet applied.
    pub fn note_fetched(&self, gtid: Gtid) {
        let mut state = self.inner.lock();
        debug_assert!(gtid > state.last_live, "fetched GTIDs must arrive in order");
        if gtid > state.last_live {
            state.last_live = gtid;
        }
    }

    /// Note an entry's effects reaching the data dictionaries.
    pub fn note_applied(&self, gtid: Gtid) {
        let mut state = self.inner.lock();
        if gtid > state.last_applied {
            state.last_applied = gtid;
        }
    }

    /// (newest in oplog, newest applied).
    pub fn live_gtids(&self) -> (Gtid, Gtid) {
        let state = self.inner.lock();
        (state.last_live, state.last_applied)
    }

    pub fn last_applied(&self) -> Gtid {
        self.inner.lock().last_applied
    }

    /// Replaying an entry at or below the applied point is a no-op.
    pub fn already_applied(&self, gtid: Gtid) -> bool {
        gtid <= self.inner.lock().last_applied
    }
}

/// Process-wide cache of known secondaries, invalidated as a side channel
/// when `local.slaves` is written. Kept outside the transactional log.
pub struct SlaveCache {
    valid: AtomicBool,
}

impl SlaveCache {
    pub fn new() -> Self {
        SlaveCache { valid: AtomicBool::new(true) }
    }

    pub fn reset(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    pub fn revalidate(&self) {
        self.valid.store(true, Ordering::SeqCst);
    }
}

impl Default for SlaveCache {
    fn default() -> Self {
        Self::new()
    }
}

/// One entry point per logical operation kind. Each builds the canonical
/// record and stages it on the active transaction, so the log record commits
/// atomically with the data mutation it describes.
pub struct OplogWriter {
    slave_cache: Arc<SlaveCache>,
}

impl OplogWriter {
    pub fn new(slave_cache: Arc<SlaveCache>) -> Self {
        OplogWriter { slave_cache }
    }

    pub fn slave_cache(&self) -> &Arc<SlaveCache> {
        &self.slave_cache
    }

    fn check_side_channels(&self, ns: &str) {
        if ns.starts_with(SLAVES_NS) {
            self.slave_cache.reset();
        }
    }

    /// Local housekeeping namespaces are per-node and never replicate.
    fn is_local_ns(ns: &str) -> bool {
        ns.starts_with(LOCAL_NS_PREFIX)
    }

    pub fn log_insert(&self, ns: &str, row: &Value, txn: &mut TxnContext) -> Result<()> {
        self.check_side_channels(ns);
        if Self::is_local_ns(ns) {
            return Ok(());
        }
        txn.log_op(OpPayload {
            op: OpType::Insert,
            ns: ns.to_string(),
            o: row.clone(),
            o2: None,
            from_migrate: false,
        })
    }

    pub fn log_update(
        &self,
        ns: &str,
        old_row: &Value,
        new_row: &Value,
        from_migrate: bool,
        txn: &mut TxnContext,
    ) -> Result<()> {
        self.check_side_channels(ns);
        if Self::is_local_ns(ns) {
            return Ok(());
        }
        txn.log_op(OpPayload {
            op: OpType::Update,
            ns: ns.to_string(),
            o: old_row.clone(),
            o2: Some(new_row.clone()),
            from_migrate,
        })
    }

    pub fn log_delete(
        &self,
        ns: &str,
        row: &Value,
        from_migrate: bool,
        txn: &mut TxnContext,
    ) -> Result<()> {
        self.check_side_channels(ns);
        if Self::is_local_ns(ns) {
            return Ok(());
        }
        txn.log_op(OpPayload {
            op: OpType::Delete,
            ns: ns.to_string(),
            o: row.clone(),
            o2: None,
            from_migrate,
        })
    }

    pub fn log_command(&self, ns: &str, cmd: &Value, txn: &mut TxnContext) -> Result<()> {
        self.check_side_channels(ns);
        if Self::is_local_ns(ns) {
            return Ok(());
        }
        txn.log_op(OpPayload {
            op: OpType::Command,
            ns: ns.to_string(),
            o: cmd.clone(),
            o2: None,
            from_migrate: false,
        })
    }

    pub fn log_comment(&self, comment: &Value, txn: &mut TxnContext) -> Result<()> {
        txn.log_op(OpPayload {
            op: OpType::Comment,
            ns: String::new(),
            o: comment.clone(),
            o2: None,
            from_migrate: false,
        })
    }
}
