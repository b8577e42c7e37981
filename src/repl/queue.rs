// src/repl/queue.rs
// Bounded buffer between the oplog producer and the applier. Flow control is
// hysteretic: a producer that fills the queue past the high-water mark blocks
// until the applier drains it below the low-water mark.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde_json::{json, Value};

use crate::oplog::LogEntry;

/// Tunables for the replication pipeline.
#[derive(Debug, Clone)]
pub struct ReplSettings {
    /// Queue depth at which the producer starts blocking.
    pub high_water: usize,
    /// Queue depth at which a blocked producer is released.
    pub low_water: usize,
    /// Back-off after a database-level error in the producer loop.
    pub db_retry: Duration,
    /// Back-off after any other producer error.
    pub generic_retry: Duration,
    /// How long a source that made us stale is vetoed.
    pub stale_veto: Duration,
}

impl Default for ReplSettings {
    fn default() -> Self {
        ReplSettings {
            high_water: 20_000,
            low_water: 10_000,
            db_retry: Duration::from_secs(10),
            generic_retry: Duration::from_secs(60),
            stale_veto: Duration::from_secs(600),
        }
    }
}

struct QueueState {
    deque: VecDeque<LogEntry>,
    throttled: bool,
    wait_time: Duration,
    shutdown: bool,
}

/// FIFO of fetched oplog entries awaiting replay, shared between the
/// producer and applier threads.
pub struct ReplicationQueue {
    state: Mutex<QueueState>,
    data_ready: Condvar,
    drained: Condvar,
    high_water: usize,
    low_water: usize,
}

impl ReplicationQueue {
    pub fn new(settings: &ReplSettings) -> Self {
        assert!(settings.low_water < settings.high_water);
        ReplicationQueue {
            state: Mutex::new(QueueState {
                deque: VecDeque::new(),
                throttled: false,
                wait_time: Duration::ZERO,
                shutdown: false,
            }),
            data_ready: Condvar::new(),
            drained: Condvar::new(),
            high_water: settings.high_water,
            low_water: settings.low_water,
        }
    }

    /// Append an entry, blocking while flow control is engaged. Returns false
    /// if the queue was shut down before the entry could be enqueued.
    pub fn push_blocking(&self, entry: LogEntry) -> bool {
        let mut state = self.state.lock();
        if state.deque.len() >= self.high_water {
            state.throttled = true;
        }
        while state.throttled && !state.shutdown {
            let start = Instant::now();
            self.drained.wait(&mut state);
            state.wait_time += start.elapsed();
        }
        if state.shutdown {
            return false;
        }
        state.deque.push_back(entry);
        self.data_ready.notify_one();
        true
    }

    /// Remove the oldest entry, waiting up to `timeout` for one to arrive.
    pub fn pop(&self, timeout: Duration) -> Option<LogEntry> {
        let mut state = self.state.lock();
        if state.deque.is_empty() && !state.shutdown {
            self.data_ready.wait_for(&mut state, timeout);
        }
        let entry = state.deque.pop_front();
        if state.throttled && state.deque.len() < self.low_water {
            state.throttled = false;
            self.drained.notify_all();
        }
        entry
    }

    pub fn len(&self) -> usize {
        self.state.lock().deque.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().deque.is_empty()
    }

    /// Release every waiter; subsequent pushes are rejected.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.data_ready.notify_all();
        self.drained.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Counters reported by serverStatus.
    pub fn status(&self) -> Value {
        let state = self.state.lock();
        json!({
            "waitTimeMs": state.wait_time.as_millis() as u64,
            "numElems": state.deque.len() as u64,
        })
    }
}
