// src/repl/view.rs
// Collaborator traits between the sync machinery and the replica-set layer.
// Production wiring lives with the server; tests use in-memory doubles.

use std::time::Duration;

use crate::error::Result;
use crate::oplog::{Gtid, LogEntry};

/// One member we could sync from, in priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCandidate {
    pub name: String,
}

/// The sync machinery's view of the replica set.
pub trait ReplicaSetView: Send + Sync {
    /// Members we may sync from, best first. Vetoed members are still
    /// listed; the caller filters through `is_vetoed`.
    fn candidates(&self) -> Vec<SyncCandidate>;

    /// Open a connection to a member's oplog.
    fn connect(&self, name: &str) -> Result<Box<dyn SyncSource>>;

    /// Temporarily exclude a member from source selection.
    fn veto(&self, name: &str, duration: Duration);

    fn is_vetoed(&self, name: &str) -> bool;

    /// True while this node is the primary; the producer idles.
    fn is_primary(&self) -> bool;

    /// A manual resync was requested; the producer drops its source and
    /// reselects. Returns the requested member, clearing the flag.
    fn take_force_sync(&self) -> Option<String>;

    /// We fell off the back of every candidate's oplog. The replica-set
    /// layer transitions this node to a recovering state.
    fn go_stale(&self);
}

/// An open connection to one member's oplog.
pub trait SyncSource: Send {
    fn name(&self) -> &str;

    /// The oldest entry the source still retains, or None if its oplog is
    /// empty. Used for the staleness check before tailing.
    fn oldest_entry(&self) -> Result<Option<Gtid>>;

    /// Whether the source's data can serve reads right now. An unreadable
    /// source forces reselection.
    fn readable(&self) -> Result<bool>;

    /// Whether our last applied entry is absent from the source's oplog,
    /// meaning our history diverged and must be rolled back first.
    fn rollback_required(&self, last_applied: Gtid) -> Result<bool>;

    /// Fetch the next batch of entries after `last`, in order. An empty
    /// batch means nothing new yet.
    fn tail_from(&mut self, last: Gtid) -> Result<Vec<LogEntry>>;
}
