// src/repl/apply.rs
// Replays fetched oplog entries through the catalog's data path. Replay is
// idempotent: an entry already present below the applied point is a no-op.
// The applier feeds entries strictly in order; an entry the applied point
// passed without recording is refused.

use serde_json::Value;
use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::error::{FerroBaseError, Result};
use crate::lock::database_of;
use crate::oplog::{LogEntry, OpType, OPLOG_NS};
use crate::txn::TxnContext;

/// Replay one entry inside `txn`. The entry's own log record is staged with
/// its original GTID; no new GTID is allocated.
pub fn apply_entry(catalog: &Catalog, entry: &LogEntry, txn: &mut TxnContext) -> Result<()> {
    let manager = catalog.gtid_manager();
    if manager.already_applied(entry.gtid) {
        // every applied entry left a record in the local oplog; one below
        // the applied point with no record means a higher GTID got ahead
        // of it
        let recorded = catalog
            .engine()
            .dictionary(OPLOG_NS)
            .is_some_and(|d| d.get(&entry.gtid.as_key().encode()).is_some());
        if !recorded {
            return Err(FerroBaseError::InvalidEntry(format!(
                "entry {:?} arrived after the applied point reached {:?}",
                entry.gtid,
                manager.last_applied()
            )));
        }
        debug!(gtid = ?entry.gtid, "skipping already applied entry");
        return Ok(());
    }
    match entry.payload.op {
        OpType::Insert => {
            catalog.insert_raw(&entry.payload.ns, &entry.payload.o, txn)?;
        }
        OpType::Update => {
            let new_doc = entry
                .payload
                .o2
                .as_ref()
                .ok_or_else(|| FerroBaseError::InvalidEntry("update without new row".into()))?;
            let pk = pk_of(catalog, &entry.payload.ns, &entry.payload.o)?;
            catalog.update_raw(&entry.payload.ns, &pk, new_doc, txn)?;
        }
        OpType::Delete => {
            let pk = pk_of(catalog, &entry.payload.ns, &entry.payload.o)?;
            catalog.delete_raw(&entry.payload.ns, &pk, txn)?;
        }
        OpType::Command => apply_command(catalog, entry, txn)?,
        OpType::Comment => {}
    }

    txn.log_replicated(entry.clone())?;
    Ok(())
}

fn pk_of(catalog: &Catalog, ns: &str, doc: &Value) -> Result<crate::keys::IndexKey> {
    let coll = catalog
        .collection(ns)
        .ok_or_else(|| FerroBaseError::NamespaceNotFound(ns.to_string()))?;
    coll.primary_key_of(doc)
}

/// Commands arrive against the database's `$cmd` namespace; the payload's
/// first field names the command.
fn apply_command(catalog: &Catalog, entry: &LogEntry, txn: &mut TxnContext) -> Result<()> {
    let db = database_of(&entry.payload.ns);
    let obj = entry
        .payload
        .o
        .as_object()
        .ok_or_else(|| FerroBaseError::InvalidEntry("command payload is not a document".into()))?;
    let Some((name, arg)) = obj.iter().next() else {
        return Err(FerroBaseError::InvalidEntry("empty command payload".into()));
    };
    let coll_name = arg.as_str().unwrap_or_default();
    let target_ns = format!("{}.{}", db, coll_name);
    match name.as_str() {
        "create" => match catalog.create_collection_txn(&target_ns, txn) {
            Ok(_) => Ok(()),
            Err(FerroBaseError::NamespaceExists(_)) => Ok(()),
            Err(e) => Err(e),
        },
        "drop" => match catalog.drop_collection_txn(&target_ns, txn) {
            Ok(()) => Ok(()),
            Err(FerroBaseError::NamespaceNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        },
        other => {
            warn!(command = other, ns = %entry.payload.ns, "ignoring unsupported replicated command");
            Ok(())
        }
    }
}
