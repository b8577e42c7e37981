// src/command/builtin.rs
// The standard command set. Each command exercises one gateway path; data
// mutations that oplog themselves go through the catalog, DDL stages its
// registry effects on the transaction and relies on the gateway writing the
// command record.

use serde_json::{json, Map, Value};

use crate::command::{Command, LockType, OpCtx};
use crate::engine::TxnFlags;
use crate::error::{FerroBaseError, Result};

fn target_ns(dbname: &str, cmd: &Value, field: &str) -> Result<String> {
    let coll = cmd
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| FerroBaseError::BadValue(format!("missing '{}' field", field)))?;
    Ok(format!("{}.{}", dbname, coll))
}

/// Liveness probe. No locks, no credentials.
pub struct Ping;

impl Command for Ping {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn lock_type(&self) -> LockType {
        LockType::None
    }

    fn slave_ok(&self) -> bool {
        true
    }

    fn requires_auth(&self) -> bool {
        false
    }

    fn run(&self, _dbname: &str, _cmd: &Value, _ctx: &mut OpCtx, _result: &mut Map<String, Value>)
        -> Result<()> {
        Ok(())
    }
}

/// Server counters, including the replication queue's.
pub struct ServerStatus;

impl Command for ServerStatus {
    fn name(&self) -> &'static str {
        "serverStatus"
    }

    fn lock_type(&self) -> LockType {
        LockType::None
    }

    fn slave_ok(&self) -> bool {
        true
    }

    fn run(&self, _dbname: &str, _cmd: &Value, ctx: &mut OpCtx, result: &mut Map<String, Value>)
        -> Result<()> {
        result.insert("version".to_string(), json!(env!("CARGO_PKG_VERSION")));
        if let Some(queue) = &ctx.repl_queue {
            result.insert("replBuffer".to_string(), queue.status());
        }
        Ok(())
    }
}

/// Count documents in a collection. A missing collection counts zero.
pub struct Count;

impl Command for Count {
    fn name(&self) -> &'static str {
        "count"
    }

    fn lock_type(&self) -> LockType {
        LockType::Read
    }

    fn slave_ok(&self) -> bool {
        true
    }

    fn needs_txn(&self) -> bool {
        true
    }

    fn txn_flags(&self) -> TxnFlags {
        TxnFlags::read_only()
    }

    fn run(&self, dbname: &str, cmd: &Value, ctx: &mut OpCtx, result: &mut Map<String, Value>)
        -> Result<()> {
        let ns = target_ns(dbname, cmd, "count")?;
        let n = ctx.catalog.collection(&ns).map_or(0, |coll| coll.count());
        result.insert("n".to_string(), json!(n as u64));
        Ok(())
    }
}

/// Create a collection. Replicated as a command record.
pub struct Create;

impl Command for Create {
    fn name(&self) -> &'static str {
        "create"
    }

    fn lock_type(&self) -> LockType {
        LockType::Write
    }

    fn needs_txn(&self) -> bool {
        true
    }

    fn logs_op(&self) -> bool {
        true
    }

    fn run(&self, dbname: &str, cmd: &Value, ctx: &mut OpCtx, _result: &mut Map<String, Value>)
        -> Result<()> {
        let ns = target_ns(dbname, cmd, "create")?;
        let catalog = std::sync::Arc::clone(&ctx.catalog);
        let txn = ctx.txn()?;
        catalog.create_collection_txn(&ns, txn)?;
        Ok(())
    }
}

/// Drop a collection. Replicated as a command record.
pub struct Drop;

impl Command for Drop {
    fn name(&self) -> &'static str {
        "drop"
    }

    fn lock_type(&self) -> LockType {
        LockType::Write
    }

    fn needs_txn(&self) -> bool {
        true
    }

    fn logs_op(&self) -> bool {
        true
    }

    fn run(&self, dbname: &str, cmd: &Value, ctx: &mut OpCtx, result: &mut Map<String, Value>)
        -> Result<()> {
        let ns = target_ns(dbname, cmd, "drop")?;
        let catalog = std::sync::Arc::clone(&ctx.catalog);
        let txn = ctx.txn()?;
        catalog.drop_collection_txn(&ns, txn)?;
        result.insert("ns".to_string(), json!(ns));
        Ok(())
    }
}

/// Insert documents. The data path writes its own oplog records, one per
/// row, all inside the gateway's transaction.
pub struct Insert;

impl Command for Insert {
    fn name(&self) -> &'static str {
        "insert"
    }

    fn lock_type(&self) -> LockType {
        LockType::Write
    }

    fn needs_txn(&self) -> bool {
        true
    }

    fn run(&self, dbname: &str, cmd: &Value, ctx: &mut OpCtx, result: &mut Map<String, Value>)
        -> Result<()> {
        let ns = target_ns(dbname, cmd, "insert")?;
        let docs = cmd
            .get("documents")
            .and_then(Value::as_array)
            .ok_or_else(|| FerroBaseError::BadValue("missing 'documents' field".to_string()))?
            .clone();
        let catalog = std::sync::Arc::clone(&ctx.catalog);
        let txn = ctx.txn()?;
        for doc in &docs {
            catalog.insert(&ns, doc, txn)?;
        }
        result.insert("n".to_string(), json!(docs.len() as u64));
        Ok(())
    }
}
