// src/lock.rs
// Hierarchical locking: a global lock with intent modes wrapping per-database
// read/write locks. Acquisition order is always global-then-database.
// Recursive acquisition by the same thread is reference-counted; lock guards
// never cross threads.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

/// Global lock modes. `IntentRead`/`IntentWrite` announce a database-level
/// read/write; `Read`/`Write` claim the whole server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GlobalMode {
    IntentRead,
    IntentWrite,
    Read,
    Write,
}

impl GlobalMode {
    fn index(self) -> usize {
        match self {
            GlobalMode::IntentRead => 0,
            GlobalMode::IntentWrite => 1,
            GlobalMode::Read => 2,
            GlobalMode::Write => 3,
        }
    }

    /// Standard intent-lock compatibility: intents coexist with each other,
    /// shared coexists with intents-to-read, exclusive with nothing.
    fn compatible_with(self, counts: &[usize; 4]) -> bool {
        match self {
            GlobalMode::IntentRead => counts[3] == 0,
            GlobalMode::IntentWrite => counts[2] == 0 && counts[3] == 0,
            GlobalMode::Read => counts[1] == 0 && counts[3] == 0,
            GlobalMode::Write => counts.iter().all(|&c| c == 0),
        }
    }

    /// Whether a holder of `self` may recursively satisfy a request for
    /// `other` without re-acquiring.
    fn covers(self, other: GlobalMode) -> bool {
        match self {
            GlobalMode::Write => true,
            GlobalMode::Read => matches!(other, GlobalMode::Read | GlobalMode::IntentRead),
            GlobalMode::IntentWrite => {
                matches!(other, GlobalMode::IntentWrite | GlobalMode::IntentRead)
            }
            GlobalMode::IntentRead => matches!(other, GlobalMode::IntentRead),
        }
    }
}

struct GlobalHold {
    mode: GlobalMode,
    count: usize,
}

#[derive(Default)]
struct GlobalState {
    counts: [usize; 4],
    holders: HashMap<ThreadId, GlobalHold>,
}

struct GlobalLock {
    state: Mutex<GlobalState>,
    cond: Condvar,
}

impl GlobalLock {
    fn new() -> Self {
        GlobalLock { state: Mutex::new(GlobalState::default()), cond: Condvar::new() }
    }

    fn acquire(&self, mode: GlobalMode) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match state.holders.get(&me).map(|h| h.mode) {
                Some(own) => {
                    debug_assert!(
                        own.covers(mode),
                        "lock upgrade from {:?} to {:?} is a contract violation",
                        own, mode
                    );
                    if own.covers(mode) {
                        state.holders.get_mut(&me).expect("hold present").count += 1;
                        return;
                    }
                    // release-build fallback for an upgrade request: wait
                    // until no other thread conflicts, then switch modes
                    let mut counts = state.counts;
                    counts[own.index()] -= 1;
                    if mode.compatible_with(&counts) {
                        state.counts[own.index()] -= 1;
                        state.counts[mode.index()] += 1;
                        let hold = state.holders.get_mut(&me).expect("hold present");
                        hold.mode = mode;
                        hold.count += 1;
                        return;
                    }
                }
                None => {
                    if mode.compatible_with(&state.counts) {
                        state.counts[mode.index()] += 1;
                        state.holders.insert(me, GlobalHold { mode, count: 1 });
                        return;
                    }
                }
            }
            self.cond.wait(&mut state);
        }
    }

    fn release(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        let hold = state.holders.get_mut(&me).expect("release without hold");
        hold.count -= 1;
        if hold.count == 0 {
            let mode = hold.mode;
            state.holders.remove(&me);
            state.counts[mode.index()] -= 1;
            self.cond.notify_all();
        }
    }

    fn held_mode(&self) -> Option<GlobalMode> {
        let me = thread::current().id();
        self.state.lock().holders.get(&me).map(|h| h.mode)
    }
}

#[derive(Default)]
struct DbState {
    writer: Option<ThreadId>,
    write_count: usize,
    readers: HashMap<ThreadId, usize>,
}

struct DbLock {
    state: Mutex<DbState>,
    cond: Condvar,
}

impl DbLock {
    fn new() -> Self {
        DbLock { state: Mutex::new(DbState::default()), cond: Condvar::new() }
    }

    fn acquire_read(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            if state.writer.is_none() || state.writer == Some(me) {
                *state.readers.entry(me).or_insert(0) += 1;
                return;
            }
            self.cond.wait(&mut state);
        }
    }

    fn release_read(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        let count = state.readers.get_mut(&me).expect("read release without hold");
        *count -= 1;
        if *count == 0 {
            state.readers.remove(&me);
            self.cond.notify_all();
        }
    }

    fn acquire_write(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        debug_assert!(
            !state.readers.contains_key(&me) || state.writer == Some(me),
            "read-to-write upgrade is a contract violation"
        );
        loop {
            if state.writer == Some(me) {
                state.write_count += 1;
                return;
            }
            let others_reading = state.readers.keys().any(|t| *t != me);
            if state.writer.is_none() && !others_reading {
                state.writer = Some(me);
                state.write_count = 1;
                return;
            }
            self.cond.wait(&mut state);
        }
    }

    fn release_write(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        assert_eq!(state.writer, Some(me), "write release without hold");
        state.write_count -= 1;
        if state.write_count == 0 {
            state.writer = None;
            self.cond.notify_all();
        }
    }
}

/// The only component whose state is safely concurrent by design: all
/// acquisition goes through one coordinating structure, owned by the server
/// context.
pub struct LockManager {
    global: GlobalLock,
    dbs: Mutex<HashMap<String, std::sync::Arc<DbLock>>>,
}

impl LockManager {
    pub fn new() -> Self {
        LockManager { global: GlobalLock::new(), dbs: Mutex::new(HashMap::new()) }
    }

    fn db_lock(&self, db: &str) -> std::sync::Arc<DbLock> {
        let mut dbs = self.dbs.lock();
        std::sync::Arc::clone(dbs.entry(db.to_string()).or_insert_with(|| {
            std::sync::Arc::new(DbLock::new())
        }))
    }

    /// True if the calling thread holds the global lock in any mode.
    pub fn is_locked(&self) -> bool {
        self.global.held_mode().is_some()
    }

    /// True if the calling thread holds a write-intending global mode.
    pub fn is_write_locked(&self) -> bool {
        matches!(
            self.global.held_mode(),
            Some(GlobalMode::IntentWrite) | Some(GlobalMode::Write)
        )
    }

    pub fn global_read(&self) -> GlobalRead<'_> {
        self.global.acquire(GlobalMode::Read);
        GlobalRead { mgr: self, _not_send: PhantomData }
    }

    pub fn global_write(&self) -> GlobalWrite<'_> {
        self.global.acquire(GlobalMode::Write);
        GlobalWrite { mgr: self, _not_send: PhantomData }
    }

    /// Lock one database for reading. The global intent lock is taken here;
    /// do not take a global lock first.
    pub fn db_read(&self, db_or_ns: &str) -> DbRead<'_> {
        let db = database_of(db_or_ns);
        self.global.acquire(GlobalMode::IntentRead);
        let lock = self.db_lock(&db);
        lock.acquire_read();
        DbRead { mgr: self, lock, _not_send: PhantomData }
    }

    /// Lock one database for writing. The global intent lock is taken here;
    /// do not take a global lock first.
    pub fn db_write(&self, db_or_ns: &str) -> DbWrite<'_> {
        let db = database_of(db_or_ns);
        self.global.acquire(GlobalMode::IntentWrite);
        let lock = self.db_lock(&db);
        lock.acquire_write();
        DbWrite { mgr: self, lock, _not_send: PhantomData }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// The database portion of a namespace ("db.collection" -> "db").
pub fn database_of(ns: &str) -> String {
    match ns.find('.') {
        Some(i) => ns[..i].to_string(),
        None => ns.to_string(),
    }
}

// Guards release on drop and are !Send: a held lock never crosses threads.

pub struct GlobalRead<'a> {
    mgr: &'a LockManager,
    _not_send: PhantomData<*const ()>,
}

impl Drop for GlobalRead<'_> {
    fn drop(&mut self) {
        self.mgr.global.release();
    }
}

pub struct GlobalWrite<'a> {
    mgr: &'a LockManager,
    _not_send: PhantomData<*const ()>,
}

impl Drop for GlobalWrite<'_> {
    fn drop(&mut self) {
        self.mgr.global.release();
    }
}

pub struct DbRead<'a> {
    mgr: &'a LockManager,
    lock: std::sync::Arc<DbLock>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for DbRead<'_> {
    fn drop(&mut self) {
        self.lock.release_read();
        self.mgr.global.release();
    }
}

pub struct DbWrite<'a> {
    mgr: &'a LockManager,
    lock: std::sync::Arc<DbLock>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for DbWrite<'_> {
    fn drop(&mut self) {
        self.lock.release_write();
        self.mgr.global.release();
    }
}
