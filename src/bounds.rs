// src/bounds.rs
// Multi-interval bounds over a compound index key, and the iterator the
// cursor consults after every physical move.

use crate::error::{FerroBaseError, Result};
use crate::keys::{IndexKey, KeyValue};

/// One closed/open interval over a single key field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldInterval {
    pub start: KeyValue,
    pub start_inclusive: bool,
    pub end: KeyValue,
    pub end_inclusive: bool,
}

enum Position {
    Below,
    In,
    Above,
}

impl FieldInterval {
    /// Closed interval [start, end].
    pub fn closed(start: KeyValue, end: KeyValue) -> Self {
        FieldInterval { start, start_inclusive: true, end, end_inclusive: true }
    }

    /// The degenerate interval [v, v] matching exactly one value.
    pub fn point(v: KeyValue) -> Self {
        FieldInterval { start: v.clone(), start_inclusive: true, end: v, end_inclusive: true }
    }

    /// The full range, MinKey through MaxKey.
    pub fn full() -> Self {
        FieldInterval::closed(KeyValue::MinKey, KeyValue::MaxKey)
    }

    fn position(&self, v: &KeyValue) -> Position {
        if *v < self.start || (!self.start_inclusive && *v == self.start) {
            Position::Below
        } else if *v > self.end || (!self.end_inclusive && *v == self.end) {
            Position::Above
        } else {
            Position::In
        }
    }
}

/// An ordered set of disjoint intervals per field of a compound key.
/// Within one field the intervals are sorted and non-overlapping.
#[derive(Debug, Clone)]
pub struct FieldRangeBounds {
    fields: Vec<Vec<FieldInterval>>,
}

impl FieldRangeBounds {
    pub fn new(fields: Vec<Vec<FieldInterval>>) -> Result<Self> {
        for intervals in &fields {
            for pair in intervals.windows(2) {
                let ok = pair[0].end < pair[1].start
                    || (pair[0].end == pair[1].start
                        && !(pair[0].end_inclusive && pair[1].start_inclusive));
                if !ok {
                    return Err(FerroBaseError::Engine(
                        "field intervals must be sorted and disjoint".to_string(),
                    ));
                }
            }
        }
        Ok(FieldRangeBounds { fields })
    }

    /// Bounds over a single field.
    pub fn single(intervals: Vec<FieldInterval>) -> Result<Self> {
        Self::new(vec![intervals])
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    /// Total interval count, used to describe the cursor.
    pub fn size(&self) -> usize {
        self.fields.iter().map(Vec::len).sum()
    }

    /// The key to seek to first: each field's lowest interval start.
    pub fn start_key(&self) -> IndexKey {
        IndexKey::new(
            self.fields
                .iter()
                .map(|ivals| ivals.first().map_or(KeyValue::MaxKey, |iv| iv.start.clone()))
                .collect(),
        )
    }
}

/// The iterator's verdict on one physical key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundsCheck {
    /// Key lies inside the current interval of every field.
    InRange,
    /// Key is outside the current intervals but later keys may match; the
    /// position is counted but not yielded.
    Skip,
    /// No further key in scan order can match.
    PastEnd,
}

/// Walks the interval set alongside the cursor. Interval positions only move
/// forward while a field's prefix is unchanged; a skipped interval is never
/// revisited for the same prefix.
pub struct FieldRangeIterator {
    bounds: FieldRangeBounds,
    cur: Vec<usize>,
    last_values: Vec<Option<KeyValue>>,
    single_interval_limit: usize,
    in_interval_count: usize,
}

impl FieldRangeIterator {
    /// `single_interval_limit` of 0 means unlimited; a positive limit forces
    /// a skip to the next interval after that many in-range hits within one
    /// interval combination.
    pub fn new(bounds: FieldRangeBounds, single_interval_limit: usize) -> Self {
        let n = bounds.num_fields();
        FieldRangeIterator {
            bounds,
            cur: vec![0; n],
            last_values: vec![None; n],
            single_interval_limit,
            in_interval_count: 0,
        }
    }

    /// Judge `key` against the bounds, moving interval positions forward as
    /// the key passes them.
    pub fn advance(&mut self, key: &IndexKey) -> BoundsCheck {
        debug_assert_eq!(key.len(), self.bounds.num_fields(), "key arity mismatch");
        for i in 0..self.bounds.num_fields() {
            let v = &key.0[i];

            // a new value for this field restarts every deeper field's scan
            if self.last_values[i].as_ref() != Some(v) {
                self.last_values[i] = Some(v.clone());
                for j in (i + 1)..self.bounds.num_fields() {
                    self.cur[j] = 0;
                    self.last_values[j] = None;
                }
                // the in-interval count follows the innermost field, so only
                // an outer field moving on resets it
                if i + 1 < self.bounds.num_fields() {
                    self.in_interval_count = 0;
                }
            }

            let intervals = &self.bounds.fields[i];
            loop {
                let Some(interval) = intervals.get(self.cur[i]) else {
                    // this field ran out of intervals: for the first field
                    // nothing further can match, for deeper fields the scan
                    // must carry on until an earlier field's value moves
                    return if i == 0 { BoundsCheck::PastEnd } else { BoundsCheck::Skip };
                };
                match interval.position(v) {
                    Position::Below => return BoundsCheck::Skip,
                    Position::In => break,
                    Position::Above => {
                        self.cur[i] += 1;
                        self.in_interval_count = 0;
                    }
                }
            }
        }

        if self.single_interval_limit > 0 {
            self.in_interval_count += 1;
            if self.in_interval_count > self.single_interval_limit {
                // force the innermost field onto its next interval
                if let Some(last) = self.cur.last_mut() {
                    *last += 1;
                }
                self.in_interval_count = 0;
                return BoundsCheck::Skip;
            }
        }
        BoundsCheck::InRange
    }
}
