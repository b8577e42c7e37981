// src/command/mod.rs
// The command execution gateway: every request enters through one state
// machine that checks credentials, resolves locks and transactions from the
// command's declared traits, runs the handler, and renders the outcome as a
// result document. Internal errors never escape as errors; they become
// `{ok: 0.0, errmsg, code}`.

pub mod builtin;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::auth::AuthenticationInfo;
use crate::catalog::Catalog;
use crate::engine::TxnFlags;
use crate::error::{FerroBaseError, Result};
use crate::lock::LockManager;
use crate::repl::queue::ReplicationQueue;
use crate::repl::view::ReplicaSetView;
use crate::txn::TxnContext;

/// What a command needs locked while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    /// No locks; the handler touches no collection data.
    None,
    Read,
    Write,
}

/// Per-operation context handed to command handlers.
pub struct OpCtx {
    pub catalog: Arc<Catalog>,
    pub locks: Arc<LockManager>,
    pub auth: Arc<AuthenticationInfo>,
    pub repl_view: Option<Arc<dyn ReplicaSetView>>,
    pub repl_queue: Option<Arc<ReplicationQueue>>,
    pub interrupt: Arc<AtomicBool>,
    /// Open transaction for the duration of a READ/WRITE command that asked
    /// for one; the gateway commits it after a successful run.
    pub txn: Option<TxnContext>,
}

impl OpCtx {
    pub fn new(catalog: Arc<Catalog>, locks: Arc<LockManager>, auth: Arc<AuthenticationInfo>) -> Self {
        OpCtx {
            catalog,
            locks,
            auth,
            repl_view: None,
            repl_queue: None,
            interrupt: Arc::new(AtomicBool::new(false)),
            txn: None,
        }
    }

    pub fn with_repl(
        mut self,
        view: Arc<dyn ReplicaSetView>,
        queue: Arc<ReplicationQueue>,
    ) -> Self {
        self.repl_view = Some(view);
        self.repl_queue = Some(queue);
        self
    }

    /// Standalone nodes are always writable.
    pub fn is_master(&self) -> bool {
        self.repl_view.as_ref().map_or(true, |v| v.is_primary())
    }

    pub fn check_interrupt(&self) -> Result<()> {
        if self.interrupt.load(Ordering::Relaxed) {
            return Err(FerroBaseError::Interrupted);
        }
        Ok(())
    }

    /// The transaction the gateway opened for this command. Handlers that
    /// declare `needs_txn` may rely on it being present.
    pub fn txn(&mut self) -> Result<&mut TxnContext> {
        self.txn.as_mut().ok_or(FerroBaseError::LockContract(
            "command ran without the transaction it declared".to_string(),
        ))
    }
}

/// A command declares its requirements through these traits; the gateway owns
/// sequencing. Handlers only see a context that already satisfies what they
/// declared.
pub trait Command: Send + Sync {
    fn name(&self) -> &'static str;

    fn lock_type(&self) -> LockType;

    /// Take the global lock instead of the target database's lock.
    fn lock_globally(&self) -> bool {
        false
    }

    /// Only runnable against the `admin` database.
    fn admin_only(&self) -> bool {
        false
    }

    /// Runnable on a secondary.
    fn slave_ok(&self) -> bool {
        false
    }

    fn requires_auth(&self) -> bool {
        true
    }

    /// Ask the gateway for a transaction spanning the handler (and the
    /// command's oplog entry, for writers). Only meaningful with lock type
    /// Read or Write.
    fn needs_txn(&self) -> bool {
        false
    }

    fn txn_flags(&self) -> TxnFlags {
        TxnFlags::default()
    }

    /// Whether a successful run is recorded in the oplog as a command
    /// operation, inside the same transaction as the handler's writes.
    fn logs_op(&self) -> bool {
        false
    }

    fn run(&self, dbname: &str, cmd: &Value, ctx: &mut OpCtx, result: &mut Map<String, Value>)
        -> Result<()>;
}

/// All commands known to the server, built once at startup.
pub struct CommandRegistry {
    commands: Vec<Arc<dyn Command>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        CommandRegistry { commands: Vec::new() }
    }

    /// The standard command set.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(builtin::Ping));
        registry.register(Arc::new(builtin::ServerStatus));
        registry.register(Arc::new(builtin::Count));
        registry.register(Arc::new(builtin::Create));
        registry.register(Arc::new(builtin::Drop));
        registry.register(Arc::new(builtin::Insert));
        registry
    }

    pub fn register(&mut self, command: Arc<dyn Command>) {
        debug_assert!(
            self.find(command.name()).is_none(),
            "duplicate command {}",
            command.name()
        );
        self.commands.push(command);
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn Command>> {
        self.commands.iter().find(|c| c.name() == name)
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Entry point for command execution.
pub struct Gateway {
    registry: CommandRegistry,
}

impl Gateway {
    pub fn new(registry: CommandRegistry) -> Self {
        Gateway { registry }
    }

    /// Run `cmd` against `dbname` and render the outcome as a result
    /// document.
    pub fn execute(&self, name: &str, dbname: &str, cmd: &Value, ctx: &mut OpCtx) -> Value {
        let mut result = Map::new();
        match self.execute_inner(name, dbname, cmd, ctx, &mut result) {
            Ok(()) => {
                result.insert("ok".to_string(), json!(1.0));
            }
            Err(e) => {
                warn!(command = name, db = dbname, error = %e, "command failed");
                result.insert("ok".to_string(), json!(0.0));
                result.insert("errmsg".to_string(), json!(e.to_string()));
                result.insert("code".to_string(), json!(e.code()));
            }
        }
        Value::Object(result)
    }

    fn execute_inner(
        &self,
        name: &str,
        dbname: &str,
        cmd: &Value,
        ctx: &mut OpCtx,
        result: &mut Map<String, Value>,
    ) -> Result<()> {
        let command = Arc::clone(
            self.registry
                .find(name)
                .ok_or_else(|| FerroBaseError::UnknownCommand(name.to_string()))?,
        );
        debug!(command = name, db = dbname, "executing command");

        if command.admin_only() && dbname != "admin" {
            return Err(FerroBaseError::AccessDenied);
        }
        if !command.slave_ok() && !ctx.is_master() {
            return Err(FerroBaseError::NotMaster);
        }
        ctx.check_interrupt()?;

        match command.lock_type() {
            LockType::None => self.run_unlocked(&command, dbname, cmd, ctx, result),
            LockType::Read => self.run_read(&command, dbname, cmd, ctx, result),
            LockType::Write => self.run_write(&command, dbname, cmd, ctx, result),
        }
    }

    fn run_unlocked(
        &self,
        command: &Arc<dyn Command>,
        dbname: &str,
        cmd: &Value,
        ctx: &mut OpCtx,
        result: &mut Map<String, Value>,
    ) -> Result<()> {
        // a handler that touches no collections has no business in a
        // transaction
        if command.needs_txn() {
            return Err(FerroBaseError::LockContract(format!(
                "command {} takes no locks but asked for a transaction",
                command.name()
            )));
        }
        if command.requires_auth() && !ctx.auth.is_authorized_reads(dbname) {
            return Err(FerroBaseError::NeedLogin);
        }
        command.run(dbname, cmd, ctx, result)
    }

    fn run_read(
        &self,
        command: &Arc<dyn Command>,
        dbname: &str,
        cmd: &Value,
        ctx: &mut OpCtx,
        result: &mut Map<String, Value>,
    ) -> Result<()> {
        if command.requires_auth() && !ctx.auth.is_authorized_reads(dbname) {
            return Err(FerroBaseError::NeedLogin);
        }
        let locks = Arc::clone(&ctx.locks);
        let _global;
        let _db;
        if command.lock_globally() {
            _global = Some(locks.global_read());
            _db = None;
        } else {
            _global = None;
            _db = Some(locks.db_read(dbname));
        }

        if command.needs_txn() {
            ctx.txn = Some(ctx.catalog.begin_txn(command.txn_flags()));
        }
        let outcome = command.run(dbname, cmd, ctx, result);
        let txn = ctx.txn.take();
        match (outcome, txn) {
            (Ok(()), Some(mut txn)) => txn.commit(),
            (Ok(()), None) => Ok(()),
            (Err(e), txn) => {
                drop(txn); // aborts
                Err(e)
            }
        }
    }

    fn run_write(
        &self,
        command: &Arc<dyn Command>,
        dbname: &str,
        cmd: &Value,
        ctx: &mut OpCtx,
        result: &mut Map<String, Value>,
    ) -> Result<()> {
        if command.requires_auth() && !ctx.auth.is_authorized_writes(dbname) {
            return Err(FerroBaseError::NeedLogin);
        }
        let locks = Arc::clone(&ctx.locks);
        let _global;
        let _db;
        if command.lock_globally() {
            _global = Some(locks.global_write());
            _db = None;
        } else {
            _global = None;
            _db = Some(locks.db_write(dbname));
        }

        if command.needs_txn() {
            ctx.txn = Some(ctx.catalog.begin_txn(command.txn_flags()));
        }
        let outcome = command.run(dbname, cmd, ctx, result);
        let txn = ctx.txn.take();
        match (outcome, txn) {
            (Ok(()), Some(mut txn)) => {
                if command.logs_op() {
                    let cmd_ns = format!("{}.$cmd", dbname);
                    ctx.catalog.oplog_writer().log_command(&cmd_ns, cmd, &mut txn)?;
                }
                txn.commit()
            }
            (Ok(()), None) => Ok(()),
            (Err(e), txn) => {
                drop(txn); // aborts
                Err(e)
            }
        }
    }
}
