// src/lib.rs
// Transactional document-storage core: ordered index cursors, multi-operation
// transactions, an operation log, and the replication/command machinery that
// consumes it.

pub mod auth;
pub mod bounds;
pub mod catalog;
pub mod command;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod keys;
pub mod lock;
pub mod oplog;
pub mod repl;
pub mod txn;

// Public exports
pub use auth::{AuthenticationInfo, Privilege};
pub use bounds::{BoundsCheck, FieldInterval, FieldRangeBounds};
pub use catalog::{Catalog, CollectionDetails, IndexDetails};
pub use command::{Command, CommandRegistry, Gateway, LockType, OpCtx};
pub use cursor::{CursorSettings, IndexCursor};
pub use engine::{KvEngine, TxnFlags};
pub use error::{FerroBaseError, Result};
pub use keys::{IndexKey, KeyValue};
pub use lock::LockManager;
pub use oplog::{Gtid, GtidManager, LogEntry, OpPayload, OpType, OplogWriter, SlaveCache};
pub use repl::{BackgroundSync, ReplSettings, ReplicaSetView, ReplicationQueue, SyncSource};
pub use txn::TxnContext;
