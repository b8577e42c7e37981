// src/cursor.rs
// Bounded index cursor: walks one index's physical entries in either
// direction, pruning against explicit start/end keys or a multi-interval
// field-range set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::bounds::{BoundsCheck, FieldRangeBounds, FieldRangeIterator};
use crate::catalog::{Catalog, CollectionDetails, IndexDetails};
use crate::engine::EngineCursor;
use crate::error::{FerroBaseError, Result};
use crate::keys::IndexKey;

/// Tunables for cursor behavior.
#[derive(Debug, Clone, Copy)]
pub struct CursorSettings {
    /// How many extra out-of-range positions one advance() call may consume
    /// before giving up and amortizing the skip over later calls.
    pub skip_cap: u64,
}

impl Default for CursorSettings {
    fn default() -> Self {
        CursorSettings { skip_cap: 20 }
    }
}

/// Scan direction.
pub const FORWARD: i32 = 1;
pub const REVERSE: i32 = -1;

fn sgn(ord: std::cmp::Ordering) -> i32 {
    match ord {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

/// A cursor over one index of one collection.
///
/// A missing collection or index makes the cursor permanently empty rather
/// than an error; callers treat empty cursors as a normal case. The backing
/// engine cursor is exclusively owned for the cursor's lifetime.
pub struct IndexCursor {
    coll: Option<Arc<CollectionDetails>>,
    idx: Option<Arc<IndexDetails>>,
    cursor: Option<EngineCursor>,
    start_key: IndexKey,
    end_key: Option<IndexKey>,
    end_inclusive: bool,
    direction: i32,
    bounds_iter: Option<FieldRangeIterator>,
    multi: bool,
    nscanned: u64,
    curr_key: Option<IndexKey>,
    curr_pk: Option<IndexKey>,
    curr_obj: Option<Value>,
    interrupt: Option<Arc<AtomicBool>>,
    settings: CursorSettings,
}

impl IndexCursor {
    /// Cursor over [start, end] (or [end, start] when reverse) with an
    /// inclusivity flag on the end key.
    pub fn new_range(
        catalog: &Catalog,
        ns: &str,
        index_name: &str,
        start_key: IndexKey,
        end_key: IndexKey,
        end_inclusive: bool,
        direction: i32,
    ) -> Self {
        let (coll, idx) = Self::resolve(catalog, ns, index_name);
        let mut cursor = IndexCursor {
            coll,
            idx,
            cursor: None,
            start_key,
            end_key: Some(end_key),
            end_inclusive,
            direction,
            bounds_iter: None,
            multi: false,
            nscanned: 0,
            curr_key: None,
            curr_pk: None,
            curr_obj: None,
            interrupt: None,
            settings: CursorSettings::default(),
        };
        cursor.initialize();
        cursor
    }

    /// Cursor over the whole index.
    pub fn full(catalog: &Catalog, ns: &str, index_name: &str, direction: i32) -> Self {
        let (start, end) = if direction > 0 {
            (IndexKey::min(), IndexKey::max())
        } else {
            (IndexKey::max(), IndexKey::min())
        };
        Self::new_range(catalog, ns, index_name, start, end, true, direction)
    }

    /// Forward cursor driven by a multi-interval field-range set.
    /// `single_interval_limit` of 0 means unlimited.
    pub fn new_bounds(
        catalog: &Catalog,
        ns: &str,
        index_name: &str,
        bounds: FieldRangeBounds,
        single_interval_limit: usize,
    ) -> Self {
        let (coll, idx) = Self::resolve(catalog, ns, index_name);
        let start_key = bounds.start_key();
        let multi = bounds.size() > 1;
        let mut cursor = IndexCursor {
            coll,
            idx,
            cursor: None,
            start_key,
            end_key: None,
            end_inclusive: true,
            direction: FORWARD,
            bounds_iter: Some(FieldRangeIterator::new(bounds, single_interval_limit)),
            multi,
            nscanned: 0,
            curr_key: None,
            curr_pk: None,
            curr_obj: None,
            interrupt: None,
            settings: CursorSettings::default(),
        };
        cursor.initialize();
        cursor
    }

    fn resolve(
        catalog: &Catalog,
        ns: &str,
        index_name: &str,
    ) -> (Option<Arc<CollectionDetails>>, Option<Arc<IndexDetails>>) {
        // collection and index are mutually absent when the namespace doesn't
        // exist; the cursor is then treated as empty
        let Some(coll) = catalog.collection(ns) else {
            return (None, None);
        };
        match coll.index(index_name) {
            Some(idx) => (Some(coll), Some(idx)),
            None => (None, None),
        }
    }

    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn with_settings(mut self, settings: CursorSettings) -> Self {
        self.settings = settings;
        self
    }

    fn initialize(&mut self) {
        let (Some(coll), Some(idx)) = (self.coll.clone(), self.idx.clone()) else {
            debug_assert!(self.coll.is_none() && self.idx.is_none());
            return;
        };
        let Some(dict) = coll.dictionary_for(&idx) else {
            return;
        };
        let mut engine_cursor = EngineCursor::new(dict);
        engine_cursor.seek(&self.start_key.encode(), self.direction > 0);
        debug!(
            cursor = %self.describe(),
            start = ?self.start_key,
            direction = self.direction,
            "initialize: seek to start key"
        );
        self.cursor = Some(engine_cursor);
        if let Err(e) = self.load_current() {
            debug!(cursor = %self.describe(), error = %e, "initialize: bad physical entry");
            self.curr_key = None;
            return;
        }
        // advance() checks are skipped during the initial position
        let _ = self.check_current_against_bounds();
    }

    /// Decode the physical entry under the engine cursor into
    /// (key, primary key, optional embedded document).
    fn load_current(&mut self) -> Result<()> {
        self.curr_key = None;
        self.curr_pk = None;
        self.curr_obj = None;

        let idx = self.idx.as_ref().expect("load_current requires an index");
        let Some((raw_key, raw_val)) = self.cursor.as_ref().and_then(EngineCursor::current) else {
            return Ok(());
        };
        let (key, rest) = IndexKey::decode_n(raw_key, idx.num_fields())?;
        // a primary-key suffix follows the key unless this is the primary
        // index itself, where pk == key
        let pk = if rest.is_empty() { key.clone() } else { IndexKey::decode_all(rest)? };
        let obj = if raw_val.is_empty() { None } else { Some(serde_json::from_slice(raw_val)?) };
        self.curr_key = Some(key);
        self.curr_pk = Some(pk);
        self.curr_obj = obj;
        Ok(())
    }

    /// Whether the current position is valid.
    pub fn ok(&self) -> bool {
        self.curr_key.is_some()
    }

    pub fn curr_key(&self) -> Option<&IndexKey> {
        self.curr_key.as_ref()
    }

    pub fn curr_pk(&self) -> Option<&IndexKey> {
        self.curr_pk.as_ref()
    }

    pub fn nscanned(&self) -> u64 {
        self.nscanned
    }

    /// Check the current key against whichever bound set this cursor carries.
    fn check_current_against_bounds(&mut self) -> Result<bool> {
        if self.bounds_iter.is_none() {
            self.check_end();
            if self.ok() {
                self.nscanned += 1;
            }
        } else {
            let start_nscanned = self.nscanned;
            if self.skip_out_of_range_keys_and_check_end()? {
                loop {
                    if self.nscanned > start_nscanned + self.settings.skip_cap {
                        // amortize the rest of the skip over later advances
                        break;
                    }
                    if !self.skip_out_of_range_keys_and_check_end()? {
                        break;
                    }
                }
            }
        }
        Ok(self.ok())
    }

    /// One step of the multi-interval skip loop. Returns true when the
    /// position was out of range and the cursor moved, i.e. another step may
    /// be needed.
    fn skip_out_of_range_keys_and_check_end(&mut self) -> Result<bool> {
        if !self.ok() {
            return Ok(false);
        }
        let key = self.curr_key.clone().expect("ok() implies a current key");
        let verdict = self
            .bounds_iter
            .as_mut()
            .expect("bounds cursor required")
            .advance(&key);
        match verdict {
            BoundsCheck::PastEnd => {
                debug!(cursor = %self.describe(), key = ?key, "past end of bounds");
                self.curr_key = None;
                Ok(false)
            }
            BoundsCheck::InRange => {
                self.nscanned += 1;
                Ok(false)
            }
            BoundsCheck::Skip => {
                self.nscanned += 1;
                self.physical_advance()?;
                Ok(true)
            }
        }
    }

    /// Compare the current key against the explicit end key, honoring the
    /// scan direction and the inclusivity flag.
    fn check_end(&mut self) {
        let (Some(curr), Some(end)) = (self.curr_key.as_ref(), self.end_key.as_ref()) else {
            return;
        };
        let cmp = sgn(end.cmp(curr));
        if (cmp != 0 && cmp != self.direction) || (cmp == 0 && !self.end_inclusive) {
            debug!(cursor = %self.describe(), curr = ?curr, end = ?end, "stopping at end bound");
            self.curr_key = None;
        }
    }

    fn physical_advance(&mut self) -> Result<()> {
        let Some(cursor) = self.cursor.as_mut() else {
            self.curr_key = None;
            return Ok(());
        };
        if self.direction > 0 {
            cursor.next();
        } else {
            cursor.prev();
        }
        self.load_current()
    }

    /// Move to the next/previous physical entry and re-validate against the
    /// bounds. Returns whether the new position is valid.
    pub fn advance(&mut self) -> Result<bool> {
        if let Some(flag) = &self.interrupt {
            if flag.load(Ordering::SeqCst) {
                return Err(FerroBaseError::Interrupted);
            }
        }
        if self.curr_key.is_none() {
            return Ok(false);
        }
        debug_assert!(
            self.coll.is_some() && self.idx.is_some(),
            "a valid position implies the namespace and index exist"
        );
        self.physical_advance()?;
        self.check_current_against_bounds()
    }

    /// The full document at the current position. For a non-clustering index
    /// the value is not embedded and is resolved through a primary-key
    /// lookup the first time it's asked for.
    pub fn current(&mut self) -> Result<Option<Value>> {
        if !self.ok() {
            return Ok(None);
        }
        if self.curr_obj.is_none() {
            let coll = self.coll.as_ref().expect("ok() implies the collection exists");
            let pk = self.curr_pk.as_ref().expect("ok() implies a current pk");
            let found = coll.find_by_pk(pk)?.ok_or_else(|| {
                FerroBaseError::Engine(format!("index entry with no document at pk {:?}", pk))
            })?;
            self.curr_obj = Some(found);
        }
        Ok(self.curr_obj.clone())
    }

    fn describe(&self) -> String {
        let mut s = format!(
            "IndexCursor {}",
            self.idx.as_ref().map_or("(null)", |i| i.name())
        );
        if self.direction < 0 {
            s.push_str(" reverse");
        }
        if self.multi {
            s.push_str(" multi");
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::FieldInterval;
    use crate::catalog::PRIMARY_INDEX_NAME;
    use crate::engine::{KvEngine, TxnFlags};
    use crate::keys::KeyValue;
    use crate::oplog::{GtidManager, OplogWriter, SlaveCache};
    use serde_json::json;

    fn setup() -> Catalog {
        let engine = Arc::new(KvEngine::new());
        let gtids = Arc::new(GtidManager::new(1));
        let oplog = Arc::new(OplogWriter::new(Arc::new(SlaveCache::new())));
        Catalog::new(engine, gtids, oplog)
    }

    fn insert_ids(catalog: &Catalog, ns: &str, ids: &[i64]) {
        let mut txn = catalog.begin_txn(TxnFlags::default());
        for id in ids {
            catalog.insert(ns, &json!({"_id": id, "v": id * 10}), &mut txn).unwrap();
        }
        txn.commit().unwrap();
    }

    #[test]
    fn test_missing_namespace_is_permanently_empty() {
        let catalog = setup();
        let mut cursor = IndexCursor::full(&catalog, "test.ghost", PRIMARY_INDEX_NAME, FORWARD);
        assert!(!cursor.ok());
        assert!(!cursor.advance().unwrap());
        assert_eq!(cursor.current().unwrap(), None);
        assert_eq!(cursor.nscanned(), 0);
    }

    #[test]
    fn test_single_document_full_scan() {
        let catalog = setup();
        insert_ids(&catalog, "test.a", &[7]);
        let mut cursor = IndexCursor::full(&catalog, "test.a", PRIMARY_INDEX_NAME, FORWARD);
        assert!(cursor.ok());
        assert_eq!(cursor.current().unwrap().unwrap()["_id"], json!(7));
        assert_eq!(cursor.nscanned(), 1);
        assert!(!cursor.advance().unwrap());
    }

    #[test]
    fn test_forward_scan_yields_key_order() {
        let catalog = setup();
        insert_ids(&catalog, "test.a", &[5, 3]);
        let mut cursor = IndexCursor::full(&catalog, "test.a", PRIMARY_INDEX_NAME, FORWARD);
        let mut seen = Vec::new();
        while cursor.ok() {
            seen.push(cursor.current().unwrap().unwrap()["_id"].as_i64().unwrap());
            cursor.advance().unwrap();
        }
        assert_eq!(seen, vec![3, 5]);
    }

    #[test]
    fn test_reverse_scan_with_inclusive_bounds() {
        let catalog = setup();
        insert_ids(&catalog, "test.a", &[1, 2, 3, 4, 5]);
        let mut cursor = IndexCursor::new_range(
            &catalog,
            "test.a",
            PRIMARY_INDEX_NAME,
            IndexKey::from(KeyValue::Int(4)),
            IndexKey::from(KeyValue::Int(2)),
            true,
            REVERSE,
        );
        let mut seen = Vec::new();
        while cursor.ok() {
            seen.push(cursor.curr_key().unwrap().0[0].clone());
            cursor.advance().unwrap();
        }
        assert_eq!(seen, vec![KeyValue::Int(4), KeyValue::Int(3), KeyValue::Int(2)]);
    }

    #[test]
    fn test_exclusive_end_key() {
        let catalog = setup();
        insert_ids(&catalog, "test.a", &[1, 2, 3]);
        let mut cursor = IndexCursor::new_range(
            &catalog,
            "test.a",
            PRIMARY_INDEX_NAME,
            IndexKey::min(),
            IndexKey::from(KeyValue::Int(3)),
            false,
            FORWARD,
        );
        let mut seen = Vec::new();
        while cursor.ok() {
            seen.push(cursor.curr_key().unwrap().0[0].clone());
            cursor.advance().unwrap();
        }
        assert_eq!(seen, vec![KeyValue::Int(1), KeyValue::Int(2)]);
    }

    #[test]
    fn test_secondary_index_resolves_document() {
        let catalog = setup();
        insert_ids(&catalog, "test.a", &[1, 2]);
        let mut txn = catalog.begin_txn(TxnFlags::default());
        catalog
            .ensure_index("test.a", "v_1", vec!["v".to_string()], false, false, &mut txn)
            .unwrap();
        txn.commit().unwrap();

        let mut cursor = IndexCursor::full(&catalog, "test.a", "v_1", FORWARD);
        assert!(cursor.ok());
        // non-clustering: the document comes from the pk lookup
        let doc = cursor.current().unwrap().unwrap();
        assert_eq!(doc["v"], json!(10));
        assert_eq!(cursor.curr_pk().unwrap().0[0], KeyValue::Int(1));
    }

    #[test]
    fn test_multi_interval_bounds_scan() {
        let catalog = setup();
        insert_ids(&catalog, "test.a", &[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let bounds = FieldRangeBounds::single(vec![
            FieldInterval::closed(KeyValue::Int(2), KeyValue::Int(3)),
            FieldInterval::closed(KeyValue::Int(7), KeyValue::Int(8)),
        ])
        .unwrap();
        let mut cursor = IndexCursor::new_bounds(&catalog, "test.a", PRIMARY_INDEX_NAME, bounds, 0);
        let mut seen = Vec::new();
        while cursor.ok() {
            seen.push(cursor.curr_key().unwrap().0[0].clone());
            cursor.advance().unwrap();
        }
        assert_eq!(
            seen,
            vec![KeyValue::Int(2), KeyValue::Int(3), KeyValue::Int(7), KeyValue::Int(8)]
        );
        // positions 4,5,6 were scanned and filtered
        assert!(cursor.nscanned() >= 7);
    }

    #[test]
    fn test_skip_cap_amortizes_over_advances() {
        let catalog = setup();
        let ids: Vec<i64> = (0..100).collect();
        insert_ids(&catalog, "test.a", &ids);
        let bounds = FieldRangeBounds::single(vec![
            FieldInterval::point(KeyValue::Int(0)),
            FieldInterval::point(KeyValue::Int(99)),
        ])
        .unwrap();
        let mut cursor = IndexCursor::new_bounds(&catalog, "test.a", PRIMARY_INDEX_NAME, bounds, 0)
            .with_settings(CursorSettings { skip_cap: 20 });
        assert!(cursor.ok());
        assert_eq!(cursor.curr_key().unwrap().0[0], KeyValue::Int(0));

        // the 98 skipped positions take several advance() calls, each capped
        let mut calls = 0;
        loop {
            cursor.advance().unwrap();
            calls += 1;
            if !cursor.ok() || cursor.curr_key().unwrap().0[0] == KeyValue::Int(99) {
                break;
            }
        }
        assert!(cursor.ok(), "cursor should eventually reach 99");
        assert!(calls > 1, "a capped skip must span multiple advance calls");
    }

    #[test]
    fn test_interrupt_aborts_advance() {
        let catalog = setup();
        insert_ids(&catalog, "test.a", &[1, 2, 3]);
        let flag = Arc::new(AtomicBool::new(false));
        let mut cursor = IndexCursor::full(&catalog, "test.a", PRIMARY_INDEX_NAME, FORWARD)
            .with_interrupt(Arc::clone(&flag));
        assert!(cursor.ok());
        flag.store(true, Ordering::SeqCst);
        assert!(matches!(cursor.advance(), Err(FerroBaseError::Interrupted)));
    }
}
