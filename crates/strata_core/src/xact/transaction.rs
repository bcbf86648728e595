//! The transaction state machine.
//!
//! A [`Transaction`] moves through `IDLE -> ACTIVE -> UPDATE -> (PREPARED)`
//! and back to `IDLE` on commit or abort; `close` makes it `CLOSED` for
//! good. The object outlives individual units of work: after each commit
//! the next unit of work gets a fresh local id.
//!
//! Locks are taken through locking policies in the transaction's own lock
//! group and released when the unit of work ends. Every lock call checks
//! the group's lock-count limit and escalates row locks to container locks
//! when it is crossed.

use super::context::EngineContext;
use super::event::{TransactionEvent, TransactionListener};
use super::post_commit::{ServiceOutcome, Serviceable};
use super::savepoint::{SavepointKind, SavepointStack};
use super::state::{CommitFlags, TransactionKind, XactState, XactStatus};
use super::table::TransactionTableEntry;
use crate::container::{ContainerHandle, OpenMode};
use crate::data::ContainerState;
use crate::error::{CoreError, CoreResult, Severity};
use crate::lock::{
    ContainerLock, Latch, LockGroup, LockManager, LockQualifier, Lockable, RowLock, WaitMode,
};
use crate::log::LogOp;
use crate::policy::{Isolation, LockScope, LockingMode, LockingPolicy};
use crate::types::{
    CompatibilitySpace, ContainerKey, GlobalTransactionId, LogInstant, RecordHandle, TransactionId,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// A shared, lockable transaction.
pub type XactContext = Arc<Mutex<Transaction>>;

/// XA vote: prepared and ready to commit.
pub const XA_OK: i32 = 0;
/// XA vote: nothing was written, the branch is already finished.
pub const XA_RDONLY: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    Commit,
    Abort,
}

/// A unit of work against the store.
pub struct Transaction {
    ctx: Arc<EngineContext>,
    self_ref: Weak<Mutex<Transaction>>,
    kind: TransactionKind,
    name: String,
    id: Option<TransactionId>,
    gid: Option<GlobalTransactionId>,
    owner: u64,
    space: CompatibilitySpace,
    state: XactState,
    read_only: bool,
    just_created: bool,
    seen_updates: bool,
    need_sync: bool,
    in_complete: Option<Completion>,
    in_post_commit: bool,
    recovery: bool,
    limit_armed: bool,
    log_extras: XactStatus,
    first_log: Option<LogInstant>,
    last_log: Option<LogInstant>,
    savepoints: SavepointStack,
    default_policy: Option<LockingPolicy>,
    handles: Vec<Arc<ContainerHandle>>,
    listeners: Vec<Weak<dyn TransactionListener>>,
    post_commit: Vec<Box<dyn Serviceable>>,
    post_termination: Vec<Box<dyn Serviceable>>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("gid", &self.gid)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("name", &self.name)
            .field("first_log", &self.first_log)
            .field("last_log", &self.last_log)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    fn blank(
        ctx: Arc<EngineContext>,
        self_ref: Weak<Mutex<Transaction>>,
        kind: TransactionKind,
        space: Option<CompatibilitySpace>,
        read_only: bool,
        name: &str,
    ) -> Self {
        let owner = ctx.next_owner();
        Self {
            ctx,
            self_ref,
            kind,
            name: name.to_owned(),
            id: None,
            gid: None,
            owner,
            space: space.unwrap_or(CompatibilitySpace(owner)),
            state: XactState::Idle,
            read_only,
            just_created: true,
            seen_updates: false,
            need_sync: false,
            in_complete: None,
            in_post_commit: false,
            recovery: false,
            limit_armed: false,
            log_extras: kind.status_extras(),
            first_log: None,
            last_log: None,
            savepoints: SavepointStack::default(),
            default_policy: None,
            handles: Vec::new(),
            listeners: Vec::new(),
            post_commit: Vec::new(),
            post_termination: Vec::new(),
        }
    }

    /// Creates and registers a transaction.
    ///
    /// `space` shares a parent's compatibility space; `None` gets a space of
    /// its own.
    pub(crate) fn start(
        ctx: &Arc<EngineContext>,
        kind: TransactionKind,
        space: Option<CompatibilitySpace>,
        read_only: bool,
        name: &str,
        gid: Option<GlobalTransactionId>,
    ) -> CoreResult<XactContext> {
        ctx.check_corrupt()?;
        let id = ctx.allocate_id();
        let xact = Arc::new_cyclic(|weak| {
            let mut xact =
                Self::blank(Arc::clone(ctx), weak.clone(), kind, space, read_only, name);
            xact.id = Some(id);
            xact.gid = gid.clone();
            Mutex::new(xact)
        });
        let excluded = kind.excluded_from_quiesce();
        let mut entry =
            TransactionTableEntry::new(id, kind, excluded, name, Arc::downgrade(&xact));
        entry.gid = gid;
        ctx.gate.admit(excluded, || ctx.table.add(entry))?;
        {
            let mut guard = xact.lock();
            if !read_only {
                let scope = guard.scope();
                ctx.locks
                    .set_limit(scope.space, scope.group, ctx.config.escalation_threshold);
                guard.limit_armed = true;
            }
        }
        tracing::debug!(xid = %id, kind = kind.name(), name, "transaction started");
        Ok(xact)
    }

    /// A transaction outside the table, used by recovery to take on the
    /// identity of logged transactions.
    pub(crate) fn detached(ctx: Arc<EngineContext>, kind: TransactionKind) -> Self {
        let mut xact = Self::blank(ctx, Weak::new(), kind, None, false, kind.name());
        xact.recovery = true;
        xact.just_created = false;
        xact
    }

    /// Current local id; `None` once closed.
    #[must_use]
    pub fn id(&self) -> Option<TransactionId> {
        self.id
    }

    /// Global id of an XA transaction.
    #[must_use]
    pub fn global_id(&self) -> Option<&GlobalTransactionId> {
        self.gid.as_ref()
    }

    /// Transaction name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind of transaction.
    #[must_use]
    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> XactState {
        self.state
    }

    /// Whether no unit of work is in progress.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state == XactState::Idle
    }

    /// Whether nothing has been logged in the current unit of work.
    #[must_use]
    pub fn is_pristine(&self) -> bool {
        matches!(self.state, XactState::Idle | XactState::Active)
    }

    /// Whether the transaction is prepared.
    #[must_use]
    pub fn is_prepared(&self) -> bool {
        self.state == XactState::Prepared
    }

    /// Whether the transaction may not log updates.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// First log record of the current unit of work.
    #[must_use]
    pub fn first_log_instant(&self) -> Option<LogInstant> {
        self.first_log
    }

    /// Last log record of the current unit of work.
    #[must_use]
    pub fn last_log_instant(&self) -> Option<LogInstant> {
        self.last_log
    }

    /// Compatibility space locks are requested in.
    #[must_use]
    pub fn compatibility_space(&self) -> CompatibilitySpace {
        self.space
    }

    /// Lock group released at the end of each unit of work.
    #[must_use]
    pub fn lock_group(&self) -> LockGroup {
        LockGroup::Transaction(self.owner)
    }

    /// Number of savepoints.
    #[must_use]
    pub fn savepoint_depth(&self) -> usize {
        self.savepoints.len()
    }

    pub(crate) fn self_ref(&self) -> Weak<Mutex<Transaction>> {
        self.self_ref.clone()
    }

    pub(crate) fn scope(&self) -> LockScope {
        LockScope {
            space: self.space,
            group: self.lock_group(),
            timeout: self.ctx.config.lock_wait_timeout,
        }
    }

    fn require_id(&self) -> CoreResult<TransactionId> {
        self.id
            .ok_or_else(|| CoreError::protocol("transaction has no id"))
    }

    fn flush_on_commit(&self) -> bool {
        matches!(self.kind, TransactionKind::User | TransactionKind::NestedUpdate)
            && self.ctx.config.flush_log_on_commit
    }

    /// Whether another transaction is waiting for a lock.
    #[must_use]
    pub fn anyone_blocked(&self) -> bool {
        self.ctx.locks.anyone_blocked()
    }

    // ---- state transitions ----

    fn set_active_state(&mut self) -> CoreResult<()> {
        match self.state {
            XactState::Closed => Err(CoreError::protocol("transaction is closed")),
            XactState::Prepared if self.in_complete != Some(Completion::Abort) => {
                Err(CoreError::protocol("transaction is prepared"))
            }
            XactState::Idle => {
                let ctx = Arc::clone(&self.ctx);
                let excluded = self.kind.excluded_from_quiesce();
                ctx.gate.admit(excluded, || self.activate(excluded))
            }
            _ => Ok(()),
        }
    }

    /// Runs under the quiesce gate.
    fn activate(&mut self, excluded: bool) {
        if let Some(old) = self.id {
            if self.just_created {
                self.ctx.table.set_state(old, XactState::Active);
            } else {
                let id = self.ctx.allocate_id();
                let mut entry = TransactionTableEntry::new(
                    id,
                    self.kind,
                    excluded,
                    &self.name,
                    self.self_ref.clone(),
                );
                entry.state = XactState::Active;
                entry.gid = self.gid.clone();
                self.ctx.table.reassign_id(old, entry);
                self.id = Some(id);
            }
        }
        self.just_created = false;
        self.state = XactState::Active;
    }

    fn set_update_state(&mut self) -> CoreResult<()> {
        if self.read_only {
            return Err(CoreError::protocol("read-only transaction cannot log updates"));
        }
        self.state = XactState::Update;
        if let Some(id) = self.id {
            self.ctx.table.set_state(id, XactState::Update);
        }
        Ok(())
    }

    fn set_prepare_state(&mut self) -> CoreResult<()> {
        if matches!(self.state, XactState::Prepared | XactState::Closed) {
            return Err(CoreError::protocol(format!(
                "cannot prepare a {} transaction",
                self.state.name()
            )));
        }
        self.state = XactState::Prepared;
        if let Some(id) = self.id {
            self.ctx.table.set_state(id, XactState::Prepared);
        }
        Ok(())
    }

    fn set_idle_state(&mut self) {
        self.state = XactState::Idle;
        self.seen_updates = false;
        self.first_log = None;
        self.last_log = None;
        if let Some(id) = self.id {
            self.ctx.table.set_state(id, XactState::Idle);
        }
        self.ctx.gate.notify_idle();
    }

    // ---- logging ----

    /// Logs `op` and applies it, writing a BeginXact first if this is the
    /// first update of the unit of work.
    pub(crate) fn log_and_do(&mut self, op: &LogOp) -> CoreResult<LogInstant> {
        self.ctx.check_corrupt()?;
        self.check_usable("update")?;
        self.set_active_state()?;
        let id = self.require_id()?;
        if self.state == XactState::Active {
            self.set_update_state()?;
            let begin = LogOp::BeginXact {
                status: self.log_extras,
                gid: self.gid.clone(),
            };
            let instant = self.ctx.logger.log_and_do(Some(id), &begin)?;
            self.ctx
                .table
                .add_update_transaction(id, self.log_extras, self.gid.clone(), instant);
            self.first_log = Some(instant);
            self.last_log = Some(instant);
        }
        self.seen_updates = true;
        let instant = self.ctx.logger.log_and_do(Some(id), op)?;
        self.last_log = Some(instant);
        self.ctx.table.set_log_range(id, self.first_log, self.last_log);
        self.savepoints.record_logged(instant);
        Ok(instant)
    }

    fn log_and_undo(&mut self, from: LogInstant, to: LogInstant) -> CoreResult<()> {
        self.set_active_state()?;
        if self.state == XactState::Active {
            self.set_update_state()?;
        }
        let id = self.require_id()?;
        let outcome = self.ctx.logger.undo(id, from, to)?;
        if let Some(last) = outcome.last_clr {
            self.last_log = Some(last);
            self.ctx.table.set_log_range(id, self.first_log, self.last_log);
        }
        if let Some(first) = outcome.first_clr {
            self.savepoints.record_compensation(first);
        }
        tracing::debug!(xid = %id, undone = outcome.undone, "log range undone");
        Ok(())
    }

    // ---- commit ----

    /// Commits with a log flush.
    ///
    /// Returns the instant of the EndXact record, or `None` if nothing was
    /// logged.
    ///
    /// # Errors
    ///
    /// Returns `CommitFailed` for statement-level failures and passes more
    /// severe errors through.
    pub fn commit(&mut self) -> CoreResult<Option<LogInstant>> {
        self.commit_with(CommitFlags::SYNC)
    }

    /// Commits without forcing the log. The flush is owed to the next sync
    /// commit or abort of this transaction object.
    ///
    /// With `READONLY_TRANSACTION_INITIALIZATION`, an idle transaction with
    /// no savepoints is left untouched.
    ///
    /// # Errors
    ///
    /// As for [`Transaction::commit`].
    pub fn commit_no_sync(&mut self, flags: CommitFlags) -> CoreResult<Option<LogInstant>> {
        if self.state == XactState::Idle
            && self.savepoints.is_empty()
            && flags.contains(CommitFlags::READONLY_TRANSACTION_INITIALIZATION)
        {
            return Ok(None);
        }
        self.commit_with(CommitFlags::NO_SYNC | flags)
    }

    fn commit_with(&mut self, flags: CommitFlags) -> CoreResult<Option<LogInstant>> {
        self.check_usable("commit")?;
        let instant = self.prepare_commit(flags)?;
        self.complete_commit(flags)?;
        if let Some(at) = instant {
            tracing::debug!(at = %at, name = %self.name, "transaction committed");
        }
        Ok(instant)
    }

    fn prepare_commit(&mut self, flags: CommitFlags) -> CoreResult<Option<LogInstant>> {
        if self.state == XactState::Closed {
            return Err(CoreError::protocol("commit of a closed transaction"));
        }
        match self.write_commit(flags) {
            Err(err) if err.severity() < Severity::Transaction => Err(CoreError::CommitFailed {
                source: Box::new(err),
            }),
            other => other,
        }
    }

    fn write_commit(&mut self, flags: CommitFlags) -> CoreResult<Option<LogInstant>> {
        self.pre_complete(Completion::Commit)?;
        if self.seen_updates {
            let id = self.require_id()?;
            let prepare = flags.contains(CommitFlags::PREPARE);
            let outcome = if prepare {
                XactStatus::PREPARED
            } else {
                XactStatus::COMMITTED
            };
            let end = LogOp::EndXact {
                status: outcome | self.log_extras,
                gid: self.gid.clone(),
            };
            let at = self.ctx.logger.log_and_do(Some(id), &end)?;
            if prepare {
                self.ctx.table.prepare_transaction(id);
            } else {
                self.ctx.table.remove_update_transaction(id);
            }
            if self.flush_on_commit() {
                if flags.contains(CommitFlags::SYNC) {
                    self.ctx.logger.flush(at)?;
                    self.need_sync = false;
                } else {
                    self.need_sync = true;
                }
            }
            return Ok(Some(at));
        }
        if self.need_sync && flags.contains(CommitFlags::SYNC) {
            self.ctx.logger.flush_all()?;
            self.need_sync = false;
        }
        Ok(None)
    }

    fn complete_commit(&mut self, flags: CommitFlags) -> CoreResult<()> {
        self.post_complete(flags, Completion::Commit)?;
        if flags.contains(CommitFlags::KEEP_LOCKS) {
            // the locks still held make the transaction active
            self.set_active_state()?;
        } else {
            self.post_termination();
        }
        self.clear_global_id();
        Ok(())
    }

    // ---- abort ----

    /// Rolls back the current unit of work. Aborting a closed transaction
    /// does nothing.
    ///
    /// # Errors
    ///
    /// A failure while undoing marks the store corrupt and returns
    /// `StoreCorrupt`.
    pub fn abort(&mut self) -> CoreResult<()> {
        if self.state == XactState::Closed {
            return Ok(());
        }
        if let Err(err) = self.write_abort() {
            if err.severity() < Severity::System {
                return Err(self.ctx.mark_corrupt(CoreError::AbortFailed {
                    source: Box::new(err),
                }));
            }
            return Err(err);
        }
        self.post_complete(CommitFlags::NONE, Completion::Abort)?;
        // work queued for after commit is meaningless now
        self.post_commit.clear();
        self.post_termination();
        self.clear_global_id();
        tracing::debug!(xid = ?self.id, name = %self.name, "transaction aborted");
        Ok(())
    }

    fn write_abort(&mut self) -> CoreResult<()> {
        self.pre_complete(Completion::Abort)?;
        if let Some(first) = self.first_log {
            let last = self.last_log.unwrap_or(first);
            let id = self.require_id()?;
            self.log_and_undo(first, last)?;
            let end = LogOp::EndXact {
                status: XactStatus::ABORTED | self.log_extras,
                gid: self.table_gid(id),
            };
            let at = self.ctx.logger.log_and_do(Some(id), &end)?;
            self.ctx.table.remove_update_transaction(id);
            self.ctx.logger.flush(at)?;
        } else if self.need_sync {
            self.ctx.logger.flush_all()?;
        }
        self.need_sync = false;
        Ok(())
    }

    /// Recovery undoes global transactions under a local identity; the end
    /// record still carries the real global id.
    fn table_gid(&self, id: TransactionId) -> Option<GlobalTransactionId> {
        if self.gid.is_some() || !self.recovery {
            return self.gid.clone();
        }
        self.ctx.table.info(id).and_then(|info| info.global_id)
    }

    // ---- completion helpers ----

    fn pre_complete(&mut self, completion: Completion) -> CoreResult<()> {
        if self.in_complete.is_some() {
            let message = match completion {
                Completion::Commit => "commit re-entered an unfinished completion",
                Completion::Abort => "abort re-entered an unfinished completion",
            };
            return Err(self.ctx.mark_corrupt(CoreError::protocol(message)));
        }
        self.in_complete = Some(completion);
        if !self.kind.post_complete_mode() {
            self.do_complete(completion);
        }
        Ok(())
    }

    fn post_complete(&mut self, flags: CommitFlags, completion: Completion) -> CoreResult<()> {
        if self.kind.post_complete_mode() {
            self.do_complete(completion);
        }
        if !flags.contains(CommitFlags::KEEP_LOCKS) {
            self.release_all_locks();
        } else if completion == Completion::Abort {
            return Err(CoreError::protocol("locks cannot be kept after an abort"));
        }
        self.set_idle_state();
        self.in_complete = None;
        Ok(())
    }

    fn do_complete(&mut self, completion: Completion) {
        self.savepoints.clear();
        self.notify(match completion {
            Completion::Commit => TransactionEvent::Commit,
            Completion::Abort => TransactionEvent::Abort,
        });
    }

    fn release_all_locks(&mut self) {
        self.ctx.locks.unlock_group(self.space, self.lock_group());
    }

    /// Turns a local transaction into a global one.
    pub(crate) fn set_global_id(&mut self, gid: GlobalTransactionId) -> CoreResult<()> {
        self.check_usable("promote to global")?;
        if let Some(id) = self.id {
            self.ctx.table.set_global_id(id, Some(gid.clone()));
        }
        self.gid = Some(gid);
        Ok(())
    }

    fn clear_global_id(&mut self) {
        if self.gid.take().is_some() {
            if let Some(id) = self.id {
                self.ctx.table.set_global_id(id, None);
            }
        }
    }

    fn post_termination(&mut self) {
        let terminated = std::mem::take(&mut self.post_termination);
        for work in terminated {
            self.add_post_commit_work(work);
        }
        if self.post_commit.is_empty() {
            return;
        }
        let work = std::mem::take(&mut self.post_commit);
        let inline = !self.in_post_commit
            && !self.recovery
            && self.kind == TransactionKind::User
            && self.gid.is_none();
        if !inline {
            for item in work {
                self.ctx.post_commit.submit(item);
            }
            return;
        }
        self.in_post_commit = true;
        for mut item in work {
            if !item.service_immediately() {
                self.ctx.post_commit.submit(item);
                continue;
            }
            match item.perform_work() {
                Ok(ServiceOutcome::Done) => {}
                Ok(ServiceOutcome::Requeue) => self.ctx.post_commit.submit(item),
                Err(err) => {
                    tracing::warn!(error = %err, work = ?item, "post-commit work failed");
                }
            }
        }
        self.in_post_commit = false;
    }

    /// Queues work to run after the next commit. Ignored during recovery.
    pub fn add_post_commit_work(&mut self, work: Box<dyn Serviceable>) {
        if self.recovery {
            return;
        }
        self.post_commit.push(work);
    }

    /// Queues work to run once the transaction ends, commit or abort.
    pub fn add_post_termination_work(&mut self, work: Box<dyn Serviceable>) {
        if self.recovery {
            return;
        }
        self.post_termination.push(work);
    }

    // ---- events ----

    /// Registers a listener for this transaction's events. The listener is
    /// held weakly and dropped after the next commit or abort.
    pub fn add_listener<L: TransactionListener + 'static>(&mut self, listener: &Arc<L>) {
        let weak: Weak<dyn TransactionListener> = Arc::<L>::downgrade(listener);
        self.listeners.push(weak);
    }

    fn notify(&mut self, event: TransactionEvent) {
        for handle in &self.handles {
            handle.on_event(event);
        }
        self.listeners.retain(|listener| match listener.upgrade() {
            Some(listener) => {
                listener.on_event(event);
                true
            }
            None => false,
        });
        match event {
            TransactionEvent::Commit | TransactionEvent::Abort => {
                self.handles.clear();
                self.listeners.clear();
            }
            TransactionEvent::SavepointRollback | TransactionEvent::LockEscalate => {
                self.handles.retain(|handle| handle.is_open());
            }
        }
    }

    // ---- savepoints ----

    /// Sets a savepoint and returns the new depth.
    ///
    /// # Errors
    ///
    /// Fails for duplicate names, SQL savepoints nested in user savepoints,
    /// and internal transactions.
    pub fn set_savepoint(&mut self, name: &str, kind: SavepointKind) -> CoreResult<usize> {
        self.reject_internal("set savepoint")?;
        self.check_usable("set savepoint")?;
        self.savepoints.push(name, kind)
    }

    /// Releases a savepoint and the ones above it; returns the new depth.
    ///
    /// # Errors
    ///
    /// Returns `SavepointNotFound` if no such savepoint exists.
    pub fn release_savepoint(&mut self, name: &str, kind: SavepointKind) -> CoreResult<usize> {
        self.reject_internal("release savepoint")?;
        self.check_usable("release savepoint")?;
        let position = self.savepoints.find(name, kind)?;
        Ok(self.savepoints.release(position))
    }

    /// Undoes everything logged since the savepoint, which stays set.
    ///
    /// # Errors
    ///
    /// Returns `SavepointNotFound` if no such savepoint exists, or
    /// `RollbackFailed` if the undo fails.
    pub fn rollback_to_savepoint(&mut self, name: &str, kind: SavepointKind) -> CoreResult<usize> {
        self.reject_internal("rollback to savepoint")?;
        self.check_usable("rollback to savepoint")?;
        let position = self.savepoints.find(name, kind)?;
        self.notify(TransactionEvent::SavepointRollback);
        if let Some(from) = self.savepoints.truncate_for_rollback(position) {
            let to = self.last_log.unwrap_or(from);
            if let Err(err) = self.log_and_undo(from, to) {
                if err.severity() < Severity::Transaction {
                    return Err(CoreError::RollbackFailed {
                        source: Box::new(err),
                    });
                }
                return Err(err);
            }
        }
        Ok(self.savepoints.len())
    }

    fn reject_internal(&self, operation: &'static str) -> CoreResult<()> {
        if self.kind == TransactionKind::Internal {
            return Err(CoreError::NotSupportedInInternal { operation });
        }
        Ok(())
    }

    // ---- policies and containers ----

    /// Looks up a locking policy.
    #[must_use]
    pub fn get_locking_policy(
        &self,
        mode: LockingMode,
        isolation: Isolation,
        stricter_ok: bool,
    ) -> Option<LockingPolicy> {
        self.ctx.matrix.get(mode, isolation, stricter_ok)
    }

    /// Sets the policy used by [`Transaction::open_container`]. `None`
    /// restores the engine default.
    pub fn set_default_locking_policy(&mut self, policy: Option<LockingPolicy>) {
        self.default_policy = policy;
    }

    /// Policy used when a container is opened without one.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the configured isolation has no policy.
    pub fn default_locking_policy(&self) -> CoreResult<LockingPolicy> {
        match &self.default_policy {
            Some(policy) => Ok(policy.clone()),
            None => self.ctx.default_policy(),
        }
    }

    /// Opens a container with the default policy.
    ///
    /// Returns `None` if `NO_WAIT` is set and the container lock is not
    /// available.
    ///
    /// # Errors
    ///
    /// Returns `ContainerNotFound` for containers that are not live, or a
    /// lock timeout.
    pub fn open_container(
        &mut self,
        key: ContainerKey,
        mode: OpenMode,
    ) -> CoreResult<Option<Arc<ContainerHandle>>> {
        self.open_container_with(key, None, mode)
    }

    /// Opens a container with an explicit policy.
    ///
    /// # Errors
    ///
    /// As for [`Transaction::open_container`].
    pub fn open_container_with(
        &mut self,
        key: ContainerKey,
        policy: Option<LockingPolicy>,
        mode: OpenMode,
    ) -> CoreResult<Option<Arc<ContainerHandle>>> {
        self.check_usable("open container")?;
        self.open_container_inner(key, policy, mode, true)
    }

    fn open_container_inner(
        &mut self,
        key: ContainerKey,
        policy: Option<LockingPolicy>,
        mode: OpenMode,
        check_limit: bool,
    ) -> CoreResult<Option<Arc<ContainerHandle>>> {
        self.ctx.check_corrupt()?;
        if !mode.contains(OpenMode::LOCK_ONLY)
            && self.ctx.data.container_state(key) != ContainerState::Live
        {
            return Err(CoreError::ContainerNotFound { container: key });
        }
        self.set_active_state()?;
        let policy = match policy {
            Some(policy) => policy,
            None => self.default_locking_policy()?,
        };
        let scope = self.scope();
        let handle = Arc::new(ContainerHandle::new(
            key,
            self.ctx.next_handle_id(),
            mode,
            policy.clone(),
            scope,
        ));
        let wait = !mode.contains(OpenMode::NO_WAIT);
        let for_update = mode.contains(OpenMode::FOR_UPDATE);
        let granted = match policy.lock_container(&scope, &handle, wait, for_update) {
            Ok(granted) => granted,
            Err(err) => {
                handle.close();
                return Err(err);
            }
        };
        if !granted {
            handle.close();
            return Ok(None);
        }
        self.handles.push(Arc::clone(&handle));
        if check_limit {
            self.check_lock_limit()?;
        }
        Ok(Some(handle))
    }

    /// Creates a container and returns its key. The container is locked
    /// exclusively until the transaction ends.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock or the log write fails.
    pub fn add_container(&mut self, segment: u32) -> CoreResult<ContainerKey> {
        self.check_usable("add container")?;
        let key = self.ctx.data.allocate_container_id(segment);
        let policy = self.container_policy()?;
        self.open_container_inner(
            key,
            Some(policy),
            OpenMode::FOR_UPDATE | OpenMode::LOCK_ONLY,
            true,
        )?
        .ok_or_else(|| CoreError::lock_timeout(Lockable::Container(key).to_string()))?;
        self.log_and_do(&LogOp::ContainerChange {
            container: key,
            before: ContainerState::Absent,
            after: ContainerState::Live,
        })?;
        tracing::debug!(container = %key, "container added");
        Ok(key)
    }

    /// Drops a container under an exclusive container lock.
    ///
    /// # Errors
    ///
    /// Returns `ContainerNotFound` if the container is not live.
    pub fn drop_container(&mut self, key: ContainerKey) -> CoreResult<()> {
        self.check_usable("drop container")?;
        let policy = self.container_policy()?;
        self.open_container_inner(key, Some(policy), OpenMode::FOR_UPDATE, true)?
            .ok_or_else(|| CoreError::lock_timeout(Lockable::Container(key).to_string()))?;
        self.log_and_do(&LogOp::ContainerChange {
            container: key,
            before: ContainerState::Live,
            after: ContainerState::Dropped,
        })?;
        tracing::debug!(container = %key, "container dropped");
        Ok(())
    }

    fn container_policy(&self) -> CoreResult<LockingPolicy> {
        self.ctx
            .matrix
            .get(LockingMode::Container, Isolation::Serializable, false)
            .ok_or_else(|| CoreError::invalid_argument("no container locking policy"))
    }

    /// Creates an unlogged, unlocked container for temporary rows.
    ///
    /// # Errors
    ///
    /// Returns a protocol error on a closed transaction.
    pub fn add_and_load_stream_container(
        &mut self,
        segment: u32,
        rows: Vec<Vec<u8>>,
    ) -> CoreResult<ContainerKey> {
        self.check_usable("add stream container")?;
        Ok(self.ctx.data.add_stream_container(segment, rows))
    }

    /// Reads back a stream container.
    ///
    /// # Errors
    ///
    /// Returns `ContainerNotFound` for unknown keys.
    pub fn open_stream_container(&self, key: ContainerKey) -> CoreResult<Vec<Vec<u8>>> {
        self.check_usable("open stream container")?;
        self.ctx.data.read_stream_container(key)
    }

    /// Drops a stream container.
    ///
    /// # Errors
    ///
    /// Returns `ContainerNotFound` for unknown keys.
    pub fn drop_stream_container(&mut self, key: ContainerKey) -> CoreResult<()> {
        self.check_usable("drop stream container")?;
        self.ctx.data.drop_stream_container(key)
    }

    /// Everything but abort and the XA completion calls is refused once a
    /// transaction is closed or prepared.
    fn check_usable(&self, operation: &str) -> CoreResult<()> {
        match self.state {
            XactState::Closed => Err(CoreError::protocol(format!(
                "{operation} on a closed transaction"
            ))),
            XactState::Prepared => Err(CoreError::protocol(format!(
                "{operation} on a prepared transaction"
            ))),
            _ => Ok(()),
        }
    }

    // ---- records ----

    fn check_handle(
        &self,
        handle: &ContainerHandle,
        record: RecordHandle,
        write: bool,
    ) -> CoreResult<()> {
        self.check_usable("record access")?;
        if !handle.is_open() || handle.scope().group != self.lock_group() {
            return Err(CoreError::protocol(format!(
                "container {} is not open in this transaction",
                handle.key()
            )));
        }
        if handle.lock_only() {
            return Err(CoreError::protocol("lock-only handles cannot access records"));
        }
        if record.container != handle.key() {
            return Err(CoreError::invalid_argument(format!(
                "record {record} is not in container {}",
                handle.key()
            )));
        }
        if write && !handle.for_update() {
            return Err(CoreError::protocol(format!(
                "container {} is not open for update",
                handle.key()
            )));
        }
        Ok(())
    }

    /// Reads a record under the handle's read lock.
    ///
    /// # Errors
    ///
    /// Returns a lock timeout or `ContainerNotFound`.
    pub fn fetch(
        &mut self,
        handle: &ContainerHandle,
        record: RecordHandle,
    ) -> CoreResult<Option<Vec<u8>>> {
        self.check_handle(handle, record, false)?;
        handle.policy().lock_record_for_read(
            handle.scope(),
            handle,
            record,
            true,
            handle.for_update(),
        )?;
        self.check_lock_limit()?;
        self.ctx.data.read(record)
    }

    /// Reads every record of the container, locking each one.
    ///
    /// # Errors
    ///
    /// As for [`Transaction::fetch`].
    pub fn scan(&mut self, handle: &ContainerHandle) -> CoreResult<Vec<(RecordHandle, Vec<u8>)>> {
        let rows = self.ctx.data.records(handle.key())?;
        let mut visible = Vec::with_capacity(rows.len());
        for (record, _) in rows {
            if let Some(row) = self.fetch(handle, record)? {
                visible.push((record, row));
            }
        }
        Ok(visible)
    }

    /// Inserts a new record.
    ///
    /// # Errors
    ///
    /// Returns `RecordExists` if the slot is taken.
    pub fn insert(
        &mut self,
        handle: &ContainerHandle,
        record: RecordHandle,
        row: Vec<u8>,
    ) -> CoreResult<()> {
        self.check_handle(handle, record, true)?;
        handle
            .policy()
            .lock_record_for_write(handle.scope(), record, true, true)?;
        self.check_lock_limit()?;
        if self.ctx.data.read(record)?.is_some() {
            return Err(CoreError::RecordExists { record });
        }
        self.log_and_do(&LogOp::RowChange {
            record,
            before: None,
            after: Some(row),
        })?;
        Ok(())
    }

    /// Replaces a record.
    ///
    /// # Errors
    ///
    /// Returns `RecordNotFound` if the record does not exist.
    pub fn update(
        &mut self,
        handle: &ContainerHandle,
        record: RecordHandle,
        row: Vec<u8>,
    ) -> CoreResult<()> {
        let before = self.lock_existing_for_write(handle, record)?;
        self.log_and_do(&LogOp::RowChange {
            record,
            before: Some(before),
            after: Some(row),
        })?;
        Ok(())
    }

    /// Deletes a record.
    ///
    /// # Errors
    ///
    /// Returns `RecordNotFound` if the record does not exist.
    pub fn delete(&mut self, handle: &ContainerHandle, record: RecordHandle) -> CoreResult<()> {
        let before = self.lock_existing_for_write(handle, record)?;
        self.log_and_do(&LogOp::RowChange {
            record,
            before: Some(before),
            after: None,
        })?;
        Ok(())
    }

    fn lock_existing_for_write(
        &mut self,
        handle: &ContainerHandle,
        record: RecordHandle,
    ) -> CoreResult<Vec<u8>> {
        self.check_handle(handle, record, true)?;
        handle
            .policy()
            .lock_record_for_write(handle.scope(), record, false, true)?;
        self.check_lock_limit()?;
        self.ctx
            .data
            .read(record)?
            .ok_or(CoreError::RecordNotFound { record })
    }

    /// Locks a record for reading while the caller holds a page latch.
    /// Returns whether the latch was released to wait.
    ///
    /// # Errors
    ///
    /// Returns a lock timeout.
    pub fn lock_record_for_read_latched(
        &mut self,
        handle: &ContainerHandle,
        record: RecordHandle,
        latch: &mut dyn Latch,
    ) -> CoreResult<bool> {
        self.check_handle(handle, record, false)?;
        let released = handle.policy().lock_record_for_read_latched(
            handle.scope(),
            handle,
            record,
            handle.for_update(),
            latch,
        )?;
        self.check_lock_limit()?;
        Ok(released)
    }

    /// Locks a record for writing while the caller holds a page latch.
    ///
    /// # Errors
    ///
    /// Returns a lock timeout.
    pub fn lock_record_for_write_latched(
        &mut self,
        handle: &ContainerHandle,
        record: RecordHandle,
        latch: &mut dyn Latch,
    ) -> CoreResult<bool> {
        self.check_handle(handle, record, true)?;
        let released = handle
            .policy()
            .lock_record_for_write_latched(handle.scope(), record, latch)?;
        self.check_lock_limit()?;
        Ok(released)
    }

    /// Checks that an insert at `record` would not block, without keeping
    /// a lock.
    ///
    /// # Errors
    ///
    /// Returns a lock timeout.
    pub fn zero_duration_lock_record_for_write(
        &self,
        handle: &ContainerHandle,
        record: RecordHandle,
        previous_key: bool,
        wait: bool,
    ) -> CoreResult<bool> {
        self.check_handle(handle, record, true)?;
        handle
            .policy()
            .zero_duration_lock_record_for_write(handle.scope(), record, previous_key, wait)
    }

    /// Releases a read lock early where the handle's isolation allows it.
    ///
    /// # Errors
    ///
    /// Returns `LockAccounting` on an impossible release count.
    pub fn unlock_record_after_read(
        &self,
        handle: &ContainerHandle,
        record: RecordHandle,
        for_update: bool,
        row_qualified: bool,
    ) -> CoreResult<()> {
        self.check_handle(handle, record, false)?;
        handle.policy().unlock_record_after_read(
            handle.scope(),
            handle,
            record,
            for_update,
            row_qualified,
        )
    }

    // ---- lock escalation ----

    fn check_lock_limit(&mut self) -> CoreResult<()> {
        if !self.limit_armed {
            return Ok(());
        }
        let scope = self.scope();
        if self
            .ctx
            .locks
            .take_limit_notice(scope.space, scope.group)
            .is_none()
        {
            return Ok(());
        }
        let result = self.reached(self.ctx.config.escalation_threshold);
        self.ctx.locks.limit_handled(scope.space, scope.group);
        result
    }

    /// Escalates row locks of the busiest containers to container locks.
    ///
    /// A container qualifies when it holds at least `limit / (n + 1)` of
    /// the row locks, `n` being the number of containers with row locks,
    /// but never fewer than a quarter of `limit`.
    fn reached(&mut self, limit: usize) -> CoreResult<()> {
        let scope = self.scope();
        let mut rows: BTreeMap<ContainerKey, usize> = BTreeMap::new();
        for (lockable, _) in self.ctx.locks.locks_in_group(scope.space, scope.group) {
            if let Lockable::Record(record) = lockable {
                *rows.entry(record.container).or_default() += 1;
            }
        }
        let threshold = (limit / (rows.len() + 1)).max(limit / 4);
        let escalate = self.ctx.matrix.escalation().clone();
        let mut escalated = false;
        for (key, count) in rows {
            if count < threshold {
                continue;
            }
            let mode = OpenMode::FOR_UPDATE | OpenMode::LOCK_ONLY | OpenMode::NO_WAIT;
            match self.open_container_inner(key, Some(escalate.clone()), mode, false) {
                Ok(Some(handle)) => {
                    handle.close();
                    escalated = true;
                    tracing::debug!(container = %key, rows = count, "row locks escalated");
                }
                Ok(None) => {
                    tracing::warn!(
                        container = %key,
                        "lock escalation could not get the container lock"
                    );
                }
                Err(err) if err.is_lock_timeout() => {
                    tracing::warn!(container = %key, error = %err, "lock escalation timed out");
                }
                Err(err) => return Err(err),
            }
        }
        if escalated {
            self.notify(TransactionEvent::LockEscalate);
        }
        Ok(())
    }

    // ---- XA ----

    /// Commits a global transaction, in one phase or after a prepare.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the prepare state does not match
    /// `one_phase`.
    pub fn xa_commit(&mut self, one_phase: bool) -> CoreResult<()> {
        if one_phase && self.state == XactState::Prepared {
            return Err(CoreError::protocol("one-phase commit of a prepared transaction"));
        }
        if !one_phase && self.state != XactState::Prepared {
            return Err(CoreError::protocol("two-phase commit of an unprepared transaction"));
        }
        self.prepare_commit(CommitFlags::SYNC)?;
        self.complete_commit(CommitFlags::SYNC)
    }

    /// Prepares a global transaction and returns the vote: [`XA_OK`], or
    /// [`XA_RDONLY`] if nothing was written, in which case the transaction
    /// is already finished.
    ///
    /// # Errors
    ///
    /// Returns an error if the prepare record cannot be written.
    pub fn xa_prepare(&mut self) -> CoreResult<i32> {
        self.check_usable("prepare")?;
        if self.is_pristine() {
            self.abort()?;
            return Ok(XA_RDONLY);
        }
        self.prepare_commit(CommitFlags::SYNC | CommitFlags::PREPARE | CommitFlags::KEEP_LOCKS)?;
        self.in_complete = None;
        self.set_prepare_state()?;
        tracing::debug!(xid = ?self.id, gid = ?self.gid, "transaction prepared");
        Ok(XA_OK)
    }

    /// Rolls back a global transaction.
    ///
    /// # Errors
    ///
    /// As for [`Transaction::abort`].
    pub fn xa_rollback(&mut self) -> CoreResult<()> {
        self.abort()
    }

    /// Reacquires the write locks of a prepared transaction found by
    /// recovery.
    ///
    /// # Errors
    ///
    /// A failure marks the store corrupt.
    pub fn reprepare(&mut self) -> CoreResult<()> {
        if self.state == XactState::Closed {
            return Err(CoreError::protocol("reprepare of a closed transaction"));
        }
        match self.reclaim_prepared_locks() {
            Ok(()) => Ok(()),
            Err(err) if err.severity() < Severity::System => {
                Err(self.ctx.mark_corrupt(CoreError::AbortFailed {
                    source: Box::new(err),
                }))
            }
            Err(err) => Err(err),
        }
    }

    fn reclaim_prepared_locks(&mut self) -> CoreResult<()> {
        let id = self.require_id()?;
        self.state = XactState::Update;
        if let (Some(first), Some(last)) = (self.first_log, self.last_log) {
            let scope = self.scope();
            let locks = Arc::clone(&self.ctx.locks);
            let mut reclaim = |op: &LogOp| reclaim_lock(&scope, locks.as_ref(), op);
            self.ctx.logger.reprepare(id, first, last, &mut reclaim)?;
        }
        self.set_prepare_state()?;
        self.seen_updates = true;
        Ok(())
    }

    // ---- identity ----

    /// Takes on the identity of a recovery table entry, or drops any
    /// identity when `entry` is `None`.
    pub(crate) fn assume_identity(&mut self, entry: Option<TransactionTableEntry>) {
        match entry {
            Some(entry) => {
                self.id = Some(entry.xid);
                // recovery acts as a local transaction
                self.gid = None;
                self.first_log = entry.first_log;
                self.last_log = entry.last_log;
                self.log_extras = masked_extras(entry.status);
                if self.state == XactState::Idle {
                    self.state = XactState::Active;
                }
            }
            None => {
                self.id = None;
                self.gid = None;
                self.first_log = None;
                self.last_log = None;
                self.state = XactState::Idle;
            }
        }
    }

    /// Takes on the full identity, global id included, of a prepared entry.
    pub(crate) fn assume_global_identity(&mut self, entry: &TransactionTableEntry) {
        self.id = Some(entry.xid);
        self.gid = entry.gid.clone();
        self.first_log = entry.first_log;
        self.last_log = entry.last_log;
        self.log_extras = masked_extras(entry.status);
        self.just_created = false;
        self.seen_updates = entry.first_log.is_some();
        self.state = if entry.prepared {
            XactState::Prepared
        } else {
            XactState::Active
        };
    }

    // ---- close ----

    /// Ends the life of the transaction object. It must be idle.
    ///
    /// # Errors
    ///
    /// Returns `TransactionNotIdle` if a unit of work is in progress.
    pub fn close(&mut self) -> CoreResult<()> {
        match self.state {
            XactState::Closed => return Ok(()),
            XactState::Idle => {}
            _ => {
                return Err(CoreError::TransactionNotIdle {
                    id: self.id.unwrap_or(TransactionId(0)),
                })
            }
        }
        if self.limit_armed {
            self.ctx.locks.clear_limit(self.space, self.lock_group());
            self.limit_armed = false;
        }
        if let Some(id) = self.id.take() {
            self.ctx.table.remove(id);
            tracing::debug!(xid = %id, "transaction closed");
        }
        self.state = XactState::Closed;
        self.gid = None;
        self.first_log = None;
        self.last_log = None;
        self.ctx.gate.notify_idle();
        Ok(())
    }

    /// Aborts if necessary, then closes.
    ///
    /// # Errors
    ///
    /// As for [`Transaction::abort`].
    pub fn destroy(&mut self) -> CoreResult<()> {
        if self.state != XactState::Closed {
            self.abort()?;
        }
        self.close()
    }
}

fn masked_extras(status: XactStatus) -> XactStatus {
    let mask = XactStatus::ROLLBACK_FIRST | XactStatus::INTERNAL | XactStatus::NESTED_TOP;
    XactStatus::from_bits(status.bits() & mask.bits())
}

/// Lock a prepared transaction must hold again for one of its records.
fn reclaim_lock(scope: &LockScope, locks: &dyn LockManager, op: &LogOp) -> CoreResult<()> {
    let wait = WaitMode::Timed(scope.timeout);
    match op {
        LogOp::RowChange { record, .. } => {
            locks.lock_object(
                scope.space,
                scope.group,
                Lockable::Container(record.container),
                LockQualifier::Container(ContainerLock::Cix),
                wait,
            )?;
            locks.lock_object(
                scope.space,
                scope.group,
                Lockable::Record(*record),
                LockQualifier::Row(RowLock::Rx3),
                wait,
            )?;
        }
        LogOp::ContainerChange { container, .. } => {
            locks.lock_object(
                scope.space,
                scope.group,
                Lockable::Container(*container),
                LockQualifier::Container(ContainerLock::Cx),
                wait,
            )?;
        }
        LogOp::Compensation { op, .. } => reclaim_lock(scope, locks, op)?,
        LogOp::BeginXact { .. } | LogOp::EndXact { .. } | LogOp::Checkpoint { .. } => {}
    }
    Ok(())
}
