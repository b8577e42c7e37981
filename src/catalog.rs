// src/catalog.rs
// Namespace registry and the document mutation path. Every write, local or
// replicated, goes through Catalog::insert/update_by_pk/delete_by_pk so the
// data effect and its oplog record share one transaction.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::engine::{Dictionary, KvEngine};
use crate::error::{FerroBaseError, Result};
use crate::keys::{IndexKey, KeyValue};
use crate::oplog::{GtidManager, OplogWriter, OPLOG_NS};
use crate::txn::TxnContext;

pub const PRIMARY_INDEX_NAME: &str = "_id_";

/// Details about one index of a collection. The primary (`_id_`) index is
/// clustering: its leaf values hold the whole document. A non-clustering
/// secondary stores `key-bytes ++ pk-bytes` as its physical key and an empty
/// value, resolved through the primary on demand.
#[derive(Debug, Clone)]
pub struct IndexDetails {
    name: String,
    ns: String,
    key_fields: Vec<String>,
    unique: bool,
    clustering: bool,
}

impl IndexDetails {
    fn primary(ns: &str) -> Self {
        IndexDetails {
            name: PRIMARY_INDEX_NAME.to_string(),
            ns: ns.to_string(),
            key_fields: vec!["_id".to_string()],
            unique: true,
            clustering: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent_ns(&self) -> &str {
        &self.ns
    }

    /// Storage name of this index's dictionary: `database.collection.$name`.
    pub fn index_ns(&self) -> String {
        if self.is_primary() {
            self.ns.clone()
        } else {
            format!("{}.${}", self.ns, self.name)
        }
    }

    pub fn is_primary(&self) -> bool {
        self.name == PRIMARY_INDEX_NAME
    }

    pub fn unique(&self) -> bool {
        self.unique
    }

    pub fn clustering(&self) -> bool {
        self.clustering
    }

    pub fn num_fields(&self) -> usize {
        self.key_fields.len()
    }

    /// Pull the indexed fields out of a document. A missing field indexes
    /// as Null.
    pub fn extract_key(&self, doc: &Value) -> IndexKey {
        IndexKey::new(
            self.key_fields
                .iter()
                .map(|f| doc.get(f).map_or(KeyValue::Null, KeyValue::from))
                .collect(),
        )
    }
}

/// One collection: its namespace and index set. Index slot 0 is the primary.
pub struct CollectionDetails {
    ns: String,
    engine: Arc<KvEngine>,
    indexes: RwLock<Vec<Arc<IndexDetails>>>,
}

impl CollectionDetails {
    fn new(ns: String, engine: Arc<KvEngine>) -> Self {
        let primary = Arc::new(IndexDetails::primary(&ns));
        engine.open_dictionary(&primary.index_ns());
        CollectionDetails { ns, engine, indexes: RwLock::new(vec![primary]) }
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn primary_index(&self) -> Arc<IndexDetails> {
        Arc::clone(&self.indexes.read()[0])
    }

    pub fn index(&self, name: &str) -> Option<Arc<IndexDetails>> {
        self.indexes.read().iter().find(|i| i.name() == name).map(Arc::clone)
    }

    pub fn index_names(&self) -> Vec<String> {
        self.indexes.read().iter().map(|i| i.name().to_string()).collect()
    }

    pub fn dictionary_for(&self, idx: &IndexDetails) -> Option<Arc<Dictionary>> {
        self.engine.dictionary(&idx.index_ns())
    }

    /// Committed-state primary-key lookup of the full document.
    pub fn find_by_pk(&self, pk: &IndexKey) -> Result<Option<Value>> {
        let primary = self.primary_index();
        let Some(dict) = self.dictionary_for(&primary) else {
            return Ok(None);
        };
        match dict.get(&pk.encode()) {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn count(&self) -> usize {
        self.dictionary_for(&self.primary_index()).map_or(0, |d| d.len())
    }

    pub fn primary_key_of(&self, doc: &Value) -> Result<IndexKey> {
        let pk = self.primary_index().extract_key(doc);
        if pk.0.iter().any(|v| *v == KeyValue::Null) {
            return Err(FerroBaseError::InvalidEntry(format!(
                "document for {} has no _id",
                self.ns
            )));
        }
        Ok(pk)
    }
}

/// Explicit registry of open collections, owned by the server context and
/// passed by handle to whoever needs lookup.
pub struct Catalog {
    engine: Arc<KvEngine>,
    gtid_manager: Arc<GtidManager>,
    oplog: Arc<OplogWriter>,
    collections: Arc<RwLock<HashMap<String, Arc<CollectionDetails>>>>,
}

impl Catalog {
    pub fn new(engine: Arc<KvEngine>, gtid_manager: Arc<GtidManager>, oplog: Arc<OplogWriter>) -> Self {
        engine.open_dictionary(OPLOG_NS);
        Catalog {
            engine,
            gtid_manager,
            oplog,
            collections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn engine(&self) -> &Arc<KvEngine> {
        &self.engine
    }

    pub fn gtid_manager(&self) -> &Arc<GtidManager> {
        &self.gtid_manager
    }

    pub fn oplog_writer(&self) -> &Arc<OplogWriter> {
        &self.oplog
    }

    /// Begin a transaction bound to this catalog's engine and GTID allocator.
    pub fn begin_txn(&self, flags: crate::engine::TxnFlags) -> TxnContext {
        TxnContext::new(Arc::clone(&self.engine), Arc::clone(&self.gtid_manager), flags)
    }

    pub fn create_collection(&self, ns: &str) -> Result<Arc<CollectionDetails>> {
        let mut colls = self.collections.write();
        if colls.contains_key(ns) {
            return Err(FerroBaseError::NamespaceExists(ns.to_string()));
        }
        let coll = Arc::new(CollectionDetails::new(ns.to_string(), Arc::clone(&self.engine)));
        colls.insert(ns.to_string(), Arc::clone(&coll));
        Ok(coll)
    }

    /// Look up a collection; absent namespaces are a normal case, not an
    /// error, so cursors over them come up permanently empty.
    pub fn collection(&self, ns: &str) -> Option<Arc<CollectionDetails>> {
        self.collections.read().get(ns).map(Arc::clone)
    }

    pub fn ensure_collection(&self, ns: &str) -> Arc<CollectionDetails> {
        if let Some(c) = self.collection(ns) {
            return c;
        }
        match self.create_collection(ns) {
            Ok(c) => c,
            // lost a race; the other creator's entry is fine
            Err(_) => self.collection(ns).expect("collection must exist after create race"),
        }
    }

    pub fn drop_collection(&self, ns: &str) -> Result<()> {
        Self::remove_collection(&self.collections, &self.engine, ns)
            .ok_or_else(|| FerroBaseError::NamespaceNotFound(ns.to_string()))
    }

    fn remove_collection(
        collections: &RwLock<HashMap<String, Arc<CollectionDetails>>>,
        engine: &KvEngine,
        ns: &str,
    ) -> Option<()> {
        let coll = collections.write().remove(ns)?;
        for idx in coll.indexes.read().iter() {
            let _ = engine.drop_dictionary(&idx.index_ns());
        }
        Some(())
    }

    /// Create a collection inside `txn`. The registry entry appears at once
    /// (the caller's write lock keeps other writers off the database) and is
    /// removed again if the transaction aborts, so a failed command leaves no
    /// unlogged namespace behind.
    pub fn create_collection_txn(
        &self,
        ns: &str,
        txn: &mut TxnContext,
    ) -> Result<Arc<CollectionDetails>> {
        let coll = self.create_collection(ns)?;
        let collections = Arc::clone(&self.collections);
        let engine = Arc::clone(&self.engine);
        let ns = ns.to_string();
        txn.defer_on_abort(move || {
            let _ = Self::remove_collection(&collections, &engine, &ns);
        });
        Ok(coll)
    }

    /// Drop a collection inside `txn`. Existence is validated now; the
    /// registry entry and the dictionaries are destroyed only once the
    /// transaction commits, so the data outlives any failure after the
    /// handler ran.
    pub fn drop_collection_txn(&self, ns: &str, txn: &mut TxnContext) -> Result<()> {
        if self.collection(ns).is_none() {
            return Err(FerroBaseError::NamespaceNotFound(ns.to_string()));
        }
        let collections = Arc::clone(&self.collections);
        let engine = Arc::clone(&self.engine);
        let ns = ns.to_string();
        txn.defer_on_commit(move || {
            let _ = Self::remove_collection(&collections, &engine, &ns);
        });
        Ok(())
    }

    pub fn list_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Add a secondary index, backfilling entries for existing documents
    /// inside `txn`.
    pub fn ensure_index(
        &self,
        ns: &str,
        name: &str,
        key_fields: Vec<String>,
        unique: bool,
        clustering: bool,
        txn: &mut TxnContext,
    ) -> Result<()> {
        let coll = self
            .collection(ns)
            .ok_or_else(|| FerroBaseError::NamespaceNotFound(ns.to_string()))?;
        if coll.index(name).is_some() {
            return Ok(());
        }
        let idx = Arc::new(IndexDetails {
            name: name.to_string(),
            ns: ns.to_string(),
            key_fields,
            unique,
            clustering,
        });
        self.engine.open_dictionary(&idx.index_ns());

        // backfill from the primary
        if let Some(primary_dict) = coll.dictionary_for(&coll.primary_index()) {
            let mut cursor = crate::engine::EngineCursor::new(primary_dict);
            cursor.seek(&[], true);
            while let Some((_, value)) = cursor.current().map(|(k, v)| (k.to_vec(), v.to_vec())) {
                let doc: Value = serde_json::from_slice(&value)?;
                let pk = coll.primary_key_of(&doc)?;
                self.put_index_entry(&idx, &doc, &pk, txn)?;
                cursor.next();
            }
        }
        coll.indexes.write().push(idx);
        Ok(())
    }

    fn put_index_entry(
        &self,
        idx: &IndexDetails,
        doc: &Value,
        pk: &IndexKey,
        txn: &mut TxnContext,
    ) -> Result<()> {
        let key = idx.extract_key(doc);
        let physical = key.encode_with_suffix(pk);
        let value = if idx.clustering() { serde_json::to_vec(doc)? } else { Vec::new() };
        txn.put(&idx.index_ns(), physical, value)
    }

    fn delete_index_entry(
        &self,
        idx: &IndexDetails,
        doc: &Value,
        pk: &IndexKey,
        txn: &mut TxnContext,
    ) -> Result<()> {
        let key = idx.extract_key(doc);
        txn.delete(&idx.index_ns(), key.encode_with_suffix(pk))
    }

    /// Insert a document and log it, in one transaction.
    pub fn insert(&self, ns: &str, doc: &Value, txn: &mut TxnContext) -> Result<()> {
        self.insert_raw(ns, doc, txn)?;
        self.oplog.log_insert(ns, doc, txn)
    }

    /// The insert data path without oplogging; replayed entries carry their
    /// own log record.
    pub(crate) fn insert_raw(&self, ns: &str, doc: &Value, txn: &mut TxnContext) -> Result<()> {
        let coll = self.ensure_collection(ns);
        let pk = coll.primary_key_of(doc)?;
        let primary = coll.primary_index();
        let primary_dict = coll
            .dictionary_for(&primary)
            .ok_or_else(|| FerroBaseError::NamespaceNotFound(ns.to_string()))?;
        // a write staged earlier in this same transaction supersedes the
        // committed row: a staged put occupies the key, a staged delete
        // frees it
        let pk_bytes = pk.encode();
        let occupied = match txn.staged(&primary.index_ns(), &pk_bytes) {
            Some(staged) => staged.is_some(),
            None => primary_dict.get(&pk_bytes).is_some(),
        };
        if occupied {
            return Err(FerroBaseError::DuplicateKey(format!("{:?}", pk)));
        }

        txn.put(&primary.index_ns(), pk_bytes, serde_json::to_vec(doc)?)?;
        for idx in coll.indexes.read().iter().skip(1) {
            if idx.unique() {
                self.unique_check(&coll, idx, doc, txn)?;
            }
            self.put_index_entry(idx, doc, &pk, txn)?;
        }
        Ok(())
    }

    /// Replace the document at `pk` and log old/new, in one transaction.
    pub fn update_by_pk(
        &self,
        ns: &str,
        pk: &IndexKey,
        new_doc: &Value,
        from_migrate: bool,
        txn: &mut TxnContext,
    ) -> Result<()> {
        let old_doc = self.update_raw(ns, pk, new_doc, txn)?;
        self.oplog.log_update(ns, &old_doc, new_doc, from_migrate, txn)
    }

    /// The update data path without oplogging. Returns the replaced document.
    pub(crate) fn update_raw(
        &self,
        ns: &str,
        pk: &IndexKey,
        new_doc: &Value,
        txn: &mut TxnContext,
    ) -> Result<Value> {
        let coll = self
            .collection(ns)
            .ok_or_else(|| FerroBaseError::NamespaceNotFound(ns.to_string()))?;
        let old_doc = coll.find_by_pk(pk)?.ok_or(FerroBaseError::DocumentNotFound)?;

        let primary = coll.primary_index();
        txn.put(&primary.index_ns(), pk.encode(), serde_json::to_vec(new_doc)?)?;
        for idx in coll.indexes.read().iter().skip(1) {
            self.delete_index_entry(idx, &old_doc, pk, txn)?;
            self.put_index_entry(idx, new_doc, pk, txn)?;
        }
        Ok(old_doc)
    }

    /// Remove the document at `pk` and log it, in one transaction.
    pub fn delete_by_pk(
        &self,
        ns: &str,
        pk: &IndexKey,
        from_migrate: bool,
        txn: &mut TxnContext,
    ) -> Result<()> {
        let old_doc = self.delete_raw(ns, pk, txn)?;
        self.oplog.log_delete(ns, &old_doc, from_migrate, txn)
    }

    /// The delete data path without oplogging. Returns the removed document.
    pub(crate) fn delete_raw(
        &self,
        ns: &str,
        pk: &IndexKey,
        txn: &mut TxnContext,
    ) -> Result<Value> {
        let coll = self
            .collection(ns)
            .ok_or_else(|| FerroBaseError::NamespaceNotFound(ns.to_string()))?;
        let old_doc = coll.find_by_pk(pk)?.ok_or(FerroBaseError::DocumentNotFound)?;

        let primary = coll.primary_index();
        txn.delete(&primary.index_ns(), pk.encode())?;
        for idx in coll.indexes.read().iter().skip(1) {
            self.delete_index_entry(idx, &old_doc, pk, txn)?;
        }
        Ok(old_doc)
    }

    fn unique_check(
        &self,
        coll: &CollectionDetails,
        idx: &IndexDetails,
        doc: &Value,
        txn: &TxnContext,
    ) -> Result<()> {
        let key = idx.extract_key(doc);
        let prefix = key.encode();
        let dup = || {
            FerroBaseError::DuplicateKey(format!("{:?} (unique index {})", key, idx.name()))
        };
        if txn.has_staged_put_with_prefix(&idx.index_ns(), &prefix) {
            return Err(dup());
        }
        let Some(dict) = coll.dictionary_for(idx) else {
            return Ok(());
        };
        let mut cursor = crate::engine::EngineCursor::new(dict);
        cursor.seek(&prefix, true);
        while let Some(k) = cursor.current().map(|(k, _)| k.to_vec()) {
            if !k.starts_with(&prefix) {
                break;
            }
            // a committed entry counts unless this transaction staged its
            // removal
            if !matches!(txn.staged(&idx.index_ns(), &k), Some(None)) {
                return Err(dup());
            }
            cursor.next();
        }
        Ok(())
    }
}
