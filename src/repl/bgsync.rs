// src/repl/bgsync.rs
// The two replication threads. The producer selects a sync source, tails its
// oplog and feeds the queue; the applier drains the queue and replays entries
// in GTID order. Both run until shutdown; errors back the loops off rather
// than killing them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::catalog::Catalog;
use crate::engine::TxnFlags;
use crate::error::{FerroBaseError, Result};
use crate::oplog::Gtid;
use crate::repl::apply::apply_entry;
use crate::repl::queue::{ReplSettings, ReplicationQueue};
use crate::repl::view::{ReplicaSetView, SyncSource};

const IDLE_POLL: Duration = Duration::from_millis(100);
const PRIMARY_POLL: Duration = Duration::from_secs(1);

pub struct BackgroundSync {
    catalog: Arc<Catalog>,
    view: Arc<dyn ReplicaSetView>,
    queue: Arc<ReplicationQueue>,
    settings: ReplSettings,
    shutdown: AtomicBool,
    sleep_lock: Mutex<()>,
    sleep_cond: Condvar,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundSync {
    pub fn new(
        catalog: Arc<Catalog>,
        view: Arc<dyn ReplicaSetView>,
        settings: ReplSettings,
    ) -> Arc<Self> {
        let queue = Arc::new(ReplicationQueue::new(&settings));
        Arc::new(BackgroundSync {
            catalog,
            view,
            queue,
            settings,
            shutdown: AtomicBool::new(false),
            sleep_lock: Mutex::new(()),
            sleep_cond: Condvar::new(),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn queue(&self) -> &Arc<ReplicationQueue> {
        &self.queue
    }

    /// Spawn the producer and applier threads.
    pub fn start(self: &Arc<Self>) {
        let producer = Arc::clone(self);
        let applier = Arc::clone(self);
        let mut threads = self.threads.lock();
        threads.push(
            std::thread::Builder::new()
                .name("replProducer".to_string())
                .spawn(move || producer.producer_loop())
                .expect("spawn replProducer"),
        );
        threads.push(
            std::thread::Builder::new()
                .name("replApplier".to_string())
                .spawn(move || applier.applier_loop())
                .expect("spawn replApplier"),
        );
    }

    /// Stop both threads and wait for them.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.queue.shutdown();
        self.sleep_cond.notify_all();
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.join() {
                error!(?e, "replication thread panicked");
            }
        }
    }

    fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Sleep that wakes early on shutdown.
    fn sleep(&self, dur: Duration) {
        let mut guard = self.sleep_lock.lock();
        if !self.is_shut_down() {
            self.sleep_cond.wait_for(&mut guard, dur);
        }
    }

    fn producer_loop(self: Arc<Self>) {
        info!("replication producer starting");
        while !self.is_shut_down() {
            if self.view.is_primary() {
                self.sleep(PRIMARY_POLL);
                continue;
            }
            match self.produce() {
                Ok(()) => {}
                Err(FerroBaseError::Engine(msg)) => {
                    warn!(%msg, "database error in producer, backing off");
                    self.sleep(self.settings.db_retry);
                }
                Err(e) => {
                    warn!(error = %e, "error in producer, backing off");
                    self.sleep(self.settings.generic_retry);
                }
            }
        }
        info!("replication producer stopping");
    }

    /// One source-selection + streaming session. Returns Ok when the session
    /// ends for a benign reason (reselect, became primary, shutdown).
    fn produce(&self) -> Result<()> {
        let Some(mut source) = self.select_source()? else {
            self.sleep(PRIMARY_POLL);
            return Ok(());
        };
        info!(source = source.name(), "syncing from");

        let last_applied = self.catalog.gtid_manager().last_applied();
        if source.rollback_required(last_applied)? {
            warn!(
                source = source.name(),
                ?last_applied,
                "sync source does not contain our last applied entry; manual intervention required"
            );
            // keep the loop from hammering the same divergent source
            self.view.veto(source.name(), self.settings.stale_veto);
            self.view.go_stale();
            self.sleep(self.settings.db_retry);
            return Ok(());
        }

        self.stream_from(source.as_mut())
    }

    /// Walk the candidate list and return the first usable source. Candidates
    /// that fail to connect are vetoed briefly; candidates whose oplog no
    /// longer reaches back to us are vetoed for much longer. If every
    /// candidate has discarded our position we have gone stale.
    fn select_source(&self) -> Result<Option<Box<dyn SyncSource>>> {
        let candidates = self.view.candidates();
        if candidates.is_empty() {
            return Ok(None);
        }
        let (last_live, _) = self.catalog.gtid_manager().live_gtids();
        let mut saw_stale = false;
        for candidate in &candidates {
            if self.view.is_vetoed(&candidate.name) {
                continue;
            }
            let source = match self.view.connect(&candidate.name) {
                Ok(source) => source,
                Err(e) => {
                    debug!(candidate = %candidate.name, error = %e, "connect failed, vetoing");
                    self.view.veto(&candidate.name, self.settings.db_retry);
                    continue;
                }
            };
            if let Some(oldest) = source.oldest_entry()? {
                if last_live != Gtid::ZERO && oldest > last_live {
                    warn!(
                        candidate = %candidate.name,
                        ?oldest,
                        ?last_live,
                        "candidate's oplog starts after our newest entry"
                    );
                    self.view.veto(&candidate.name, self.settings.stale_veto);
                    saw_stale = true;
                    continue;
                }
            }
            return Ok(Some(source));
        }
        if saw_stale {
            self.view.go_stale();
            return Err(FerroBaseError::StaleSource);
        }
        Ok(None)
    }

    /// Tail `source` until something forces reselection.
    fn stream_from(&self, source: &mut dyn SyncSource) -> Result<()> {
        let mut last = self.catalog.gtid_manager().live_gtids().0;
        loop {
            if self.is_shut_down() || self.view.is_primary() {
                return Ok(());
            }
            if let Some(target) = self.view.take_force_sync() {
                info!(%target, "resync requested, dropping sync source");
                return Ok(());
            }
            if !source.readable()? {
                warn!(source = source.name(), "sync source no longer readable");
                return Ok(());
            }
            let batch = source.tail_from(last)?;
            if batch.is_empty() {
                self.sleep(IDLE_POLL);
                continue;
            }
            for entry in batch {
                last = entry.gtid;
                if !self.queue.push_blocking(entry) {
                    return Ok(());
                }
            }
        }
    }

    fn applier_loop(self: Arc<Self>) {
        info!("replication applier starting");
        loop {
            let Some(entry) = self.queue.pop(IDLE_POLL) else {
                if self.is_shut_down() && self.queue.is_empty() {
                    break;
                }
                continue;
            };
            // an entry handed to us must eventually apply; retry until it
            // does or we are shut down
            loop {
                let mut txn = self.catalog.begin_txn(TxnFlags::read_uncommitted());
                let result = apply_entry(&self.catalog, &entry, &mut txn)
                    .and_then(|()| txn.commit());
                match result {
                    Ok(()) => break,
                    Err(e) => {
                        error!(gtid = ?entry.gtid, error = %e, "failed to apply entry, retrying");
                        self.sleep(self.settings.db_retry);
                        if self.is_shut_down() {
                            return;
                        }
                    }
                }
            }
        }
        info!("replication applier stopping");
    }
}
