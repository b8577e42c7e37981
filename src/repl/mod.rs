// src/repl/mod.rs
// Replication: the producer/applier pair that keeps a secondary in sync.
// `bgsync` tails a sync source and feeds `queue`; the applier drains the
// queue and replays entries through `apply`.

pub mod apply;
pub mod bgsync;
pub mod queue;
pub mod view;

pub use apply::apply_entry;
pub use bgsync::BackgroundSync;
pub use queue::{ReplSettings, ReplicationQueue};
pub use view::{ReplicaSetView, SyncCandidate, SyncSource};
