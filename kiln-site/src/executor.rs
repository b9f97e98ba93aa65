//! The partition executor state machine.
//!
//! One dedicated thread per partition owns the storage engine, drains the
//! work queue, runs stored procedures, and drives commit and abort. All
//! engine mutation happens on this thread; cross-thread deliveries touch
//! only the shared transaction table. A procedure blocked on a batch does
//! not suspend the thread: `wait_for_responses` re-enters the scheduling
//! loop until the round latch opens, deferring new initiations so
//! transactions stay strictly serial per partition.

use kiln_common::pool::Reusable;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use tracing::{debug, error, warn};

use kiln_common::config::SiteConfig;
use kiln_common::error::{KilnError, KilnResult};
use kiln_common::ids::{DependencyId, PartitionId, TxnId, UndoToken, NULL_UNDO_TOKEN};
use kiln_common::latch::CountDownLatch;
use kiln_core::engine::{FragmentWork, StorageEngine};
use kiln_core::message::{decode_params, encode_params, FragmentTask, InitiateTask, WorkItem};
use kiln_core::response::{ClientResponse, FragmentResponse, FragmentStatus, ResponseStatus};
use kiln_core::sysproc::{SysProcContext, SysProcRegistry};
use kiln_core::table::{DependencySet, Table};
use kiln_txn::callback::CallbackKind;
use kiln_txn::dependency::TaskDisposition;
use kiln_txn::pools::SitePools;
use kiln_txn::state::TransactionState;

use crate::coordinator::{Coordinator, WaveTracker};
use crate::messenger::Messenger;
use crate::procedure::{PlannedFragment, ProcedureFailure, ProcedureRegistry, StoredProcedure};

/// One-shot client response sink installed when a transaction is queued.
pub type ClientResponseFn = Box<dyn FnOnce(ClientResponse) + Send>;

/// How long the nested scheduling loop waits on the round latch between
/// queue drains.
const NESTED_WAIT_SLICE: Duration = Duration::from_millis(1);

struct ExecutorShared {
    partition: PartitionId,
    local_partition_count: usize,
    sender: Sender<WorkItem>,
    txn_table: Mutex<HashMap<TxnId, Arc<TransactionState>>>,
    response_slots: Mutex<HashMap<TxnId, ClientResponseFn>>,
    last_committed: AtomicU64,
    error_count: AtomicUsize,
    pools: Arc<SitePools>,
    coordinator: Mutex<Weak<Coordinator>>,
}

impl ExecutorShared {
    fn coordinator(&self) -> KilnResult<Arc<Coordinator>> {
        self.coordinator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
            .ok_or(KilnError::QueueClosed("coordinator is gone"))
    }
}

/// Cloneable cross-thread handle to one partition executor: the work-queue
/// sender plus the shared transaction table.
#[derive(Clone)]
pub struct ExecutorHandle {
    shared: Arc<ExecutorShared>,
}

impl std::fmt::Debug for ExecutorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorHandle")
            .field("partition", &self.shared.partition)
            .finish()
    }
}

impl ExecutorHandle {
    /// Creates the handle side of one partition executor.
    #[must_use]
    pub fn new(
        partition: PartitionId,
        local_partition_count: usize,
        sender: Sender<WorkItem>,
        pools: Arc<SitePools>,
    ) -> Self {
        Self {
            shared: Arc::new(ExecutorShared {
                partition,
                local_partition_count,
                sender,
                txn_table: Mutex::new(HashMap::new()),
                response_slots: Mutex::new(HashMap::new()),
                last_committed: AtomicU64::new(0),
                error_count: AtomicUsize::new(0),
                pools,
                coordinator: Mutex::new(Weak::new()),
            }),
        }
    }

    /// Wires the coordinator in after site construction.
    pub fn attach_coordinator(&self, coordinator: Weak<Coordinator>) {
        *self
            .shared
            .coordinator
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = coordinator;
    }

    /// Partition this handle addresses.
    #[must_use]
    pub fn partition(&self) -> PartitionId {
        self.shared.partition
    }

    /// Highest transaction id committed on this partition.
    #[must_use]
    pub fn last_committed(&self) -> TxnId {
        self.shared.last_committed.load(Ordering::Acquire)
    }

    /// Errors the executor loop has absorbed so far.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.shared.error_count.load(Ordering::Acquire)
    }

    /// Live transactions currently tracked on this partition.
    #[must_use]
    pub fn running_transactions(&self) -> usize {
        self.shared
            .txn_table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn send(&self, item: WorkItem) -> KilnResult<()> {
        self.shared
            .sender
            .send(item)
            .map_err(|_| KilnError::QueueClosed("partition work queue is closed"))
    }

    /// Wakes the executor loop so it observes the shutdown flag.
    pub fn send_poison(&self) {
        let _ = self.shared.sender.send(WorkItem::Poison);
    }

    /// Looks one transaction up in the shared table.
    #[must_use]
    pub fn lookup(&self, txn_id: TxnId) -> Option<Arc<TransactionState>> {
        self.shared
            .txn_table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&txn_id)
            .cloned()
    }

    /// Admits a transaction at its base partition: creates the Local state
    /// from the pool, installs the response sink, and enqueues the
    /// initiation.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidState`] when the transaction id is
    /// already active on this partition, or [`KilnError::QueueClosed`]
    /// after shutdown.
    pub fn queue_initiate(
        &self,
        task: InitiateTask,
        on_response: ClientResponseFn,
    ) -> KilnResult<()> {
        {
            let mut table = self
                .shared
                .txn_table
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if table.contains_key(&task.txn_id) {
                return Err(KilnError::InvalidState(
                    "transaction id is already active on this partition",
                ));
            }
            let state = Arc::new(self.shared.pools.txn_local().acquire());
            state.init_local(&task)?;
            let _ = table.insert(task.txn_id, state);
        }
        let _ = self
            .shared
            .response_slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.txn_id, on_response);
        self.send(WorkItem::Initiate(task))
    }

    /// Admits a remote transaction whose procedure runs on another
    /// partition, acking its init-queue wave. Idempotent per transaction.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidState`] when the id is already armed
    /// here as a Local transaction.
    pub fn ensure_remote(
        &self,
        txn_id: TxnId,
        base_partition: PartitionId,
        participating: Vec<PartitionId>,
    ) -> KilnResult<()> {
        let mut table = self
            .shared
            .txn_table
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = table.get(&txn_id) {
            if existing.is_exec_local() {
                return Err(KilnError::InvalidState(
                    "transaction already runs locally on this partition",
                ));
            }
            return Ok(());
        }
        let state = Arc::new(self.shared.pools.txn_remote().acquire());
        state.init_remote(
            txn_id,
            base_partition,
            participating,
            self.shared.local_partition_count,
        )?;
        // Admission is synchronous in-process: arm the init-queue wave and
        // ack it immediately; the cleanup wave stays armed until finish.
        state.arm_callback(CallbackKind::Init, 1)?;
        let _ = state.deliver_callback(CallbackKind::Init)?;
        state.arm_callback(CallbackKind::Cleanup, 1)?;
        let _ = table.insert(txn_id, state);
        Ok(())
    }

    /// Re-enqueues the initiation of a restarted transaction whose state
    /// is already armed in this partition's table.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::UnknownTransaction`] when no state exists for
    /// the id, or [`KilnError::QueueClosed`] after shutdown.
    pub fn requeue_initiate(&self, task: InitiateTask) -> KilnResult<()> {
        if self.lookup(task.txn_id).is_none() {
            return Err(KilnError::UnknownTransaction {
                txn_id: task.txn_id,
            });
        }
        self.send(WorkItem::Initiate(task))
    }

    /// Enqueues a fragment task.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::QueueClosed`] after shutdown.
    pub fn queue_fragment(&self, task: FragmentTask) -> KilnResult<()> {
        self.send(WorkItem::Fragment(task))
    }

    /// Enqueues a prepare probe.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::QueueClosed`] after shutdown.
    pub fn queue_prepare(&self, txn_id: TxnId) -> KilnResult<()> {
        self.send(WorkItem::Prepare { txn_id })
    }

    /// Enqueues the transaction conclusion.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::QueueClosed`] after shutdown.
    pub fn queue_finish(&self, txn_id: TxnId, commit: bool) -> KilnResult<()> {
        self.send(WorkItem::Finish { txn_id, commit })
    }

    /// Buffers delivered dependency rows into the owning transaction and
    /// re-dispatches any tasks they unblocked.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::UnknownTransaction`] when the transaction is
    /// not tracked here; callers log and drop.
    pub fn store_dependency_set(
        &self,
        source: PartitionId,
        set: DependencySet,
    ) -> KilnResult<()> {
        let txn_id = set.txn_id;
        let Some(ts) = self.lookup(txn_id) else {
            return Err(KilnError::UnknownTransaction { txn_id });
        };
        for (dep_id, table) in set.entries {
            let unblocked = ts.add_result(source, dep_id, table)?;
            for task in unblocked {
                if task.is_local_to(self.shared.partition) {
                    self.queue_fragment(task)?;
                } else {
                    self.shared.coordinator()?.request_work(&ts, vec![task])?;
                }
            }
        }
        Ok(())
    }

    fn take_response_slot(&self, txn_id: TxnId) -> Option<ClientResponseFn> {
        self.shared
            .response_slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&txn_id)
    }

    fn remove_state(&self, txn_id: TxnId) -> Option<Arc<TransactionState>> {
        self.shared
            .txn_table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&txn_id)
    }

    fn reinsert_state(&self, txn_id: TxnId, state: Arc<TransactionState>) {
        let _ = self
            .shared
            .txn_table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(txn_id, state);
    }

    fn bump_error(&self) {
        let _ = self.shared.error_count.fetch_add(1, Ordering::AcqRel);
    }
}

/// Execution context loaned to a stored procedure for one transaction.
pub struct ProcedureContext<'a> {
    executor: &'a mut PartitionExecutor,
    ts: Arc<TransactionState>,
}

impl ProcedureContext<'_> {
    /// Transaction being executed.
    #[must_use]
    pub fn txn_id(&self) -> TxnId {
        self.ts.txn_id()
    }

    /// Partition the procedure body runs on.
    #[must_use]
    pub fn partition(&self) -> PartitionId {
        self.executor.handle.partition()
    }

    /// Dispatches one batch of fragments and blocks until every declared
    /// output dependency is satisfied, returning the merged result tables
    /// in declaration order.
    ///
    /// # Errors
    ///
    /// Propagates the transaction's pending error, or
    /// [`KilnError::Mispredict`] when a single-partition prediction breaks.
    pub fn execute_batch(&mut self, fragments: Vec<PlannedFragment>) -> KilnResult<Vec<Table>> {
        let txn_id = self.ts.txn_id();
        let partition = self.executor.handle.partition();
        let tasks = fragments
            .into_iter()
            .map(|fragment| FragmentTask {
                txn_id,
                source_partition: partition,
                destination_partition: fragment.destination,
                fragment_ids: vec![fragment.fragment_id],
                param_blobs: vec![encode_params(&fragment.params)],
                input_dep_ids: fragment.input_dep_ids,
                output_dep_ids: vec![fragment.output_dep_id],
                via_coordinator: false,
                sysproc: fragment.sysproc,
                attached_deps: Vec::new(),
            })
            .collect();
        self.executor.wait_for_responses(&self.ts, tasks)
    }

    /// Bulk-loads rows into a table on this partition, covered by a fresh
    /// undo token of this transaction.
    ///
    /// # Errors
    ///
    /// Propagates engine errors (unknown table, arity mismatch).
    pub fn load_table(&mut self, table_index: usize, rows: Table) -> KilnResult<()> {
        self.executor.load_table(&self.ts, table_index, rows)
    }
}

/// Thread-owned side of one partition executor.
pub struct PartitionExecutor {
    config: SiteConfig,
    handle: ExecutorHandle,
    receiver: Receiver<WorkItem>,
    engine: Box<dyn StorageEngine>,
    sysprocs: Arc<SysProcRegistry>,
    procedures: Arc<ProcedureRegistry>,
    proc_pools: HashMap<String, Vec<Box<dyn StoredProcedure>>>,
    coordinator: Arc<Coordinator>,
    messenger: Arc<dyn Messenger>,
    pools: Arc<SitePools>,
    last_undo_token: UndoToken,
    deferred: VecDeque<WorkItem>,
    finished_queue: VecDeque<TxnId>,
    last_tick: Instant,
    shutdown: Arc<AtomicBool>,
    drain_latch: Arc<CountDownLatch>,
}

impl PartitionExecutor {
    /// Assembles the thread-owned executor side.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: SiteConfig,
        handle: ExecutorHandle,
        receiver: Receiver<WorkItem>,
        engine: Box<dyn StorageEngine>,
        sysprocs: Arc<SysProcRegistry>,
        procedures: Arc<ProcedureRegistry>,
        coordinator: Arc<Coordinator>,
        messenger: Arc<dyn Messenger>,
        pools: Arc<SitePools>,
        shutdown: Arc<AtomicBool>,
        drain_latch: Arc<CountDownLatch>,
    ) -> Self {
        let mut executor = Self {
            config,
            handle,
            receiver,
            engine,
            sysprocs,
            procedures,
            proc_pools: HashMap::new(),
            coordinator,
            messenger,
            pools,
            last_undo_token: NULL_UNDO_TOKEN,
            deferred: VecDeque::new(),
            finished_queue: VecDeque::new(),
            last_tick: Instant::now(),
            shutdown,
            drain_latch,
        };
        executor.prefill_procedure_pools();
        executor
    }

    fn prefill_procedure_pools(&mut self) {
        for name in self.procedures.names() {
            let size = self
                .procedures
                .pool_size(&name, self.config.proc_pool_default_size);
            let mut pool = Vec::with_capacity(size);
            for _ in 0..size {
                if let Some(instance) = self.procedures.create(&name) {
                    pool.push(instance);
                }
            }
            let _ = self.proc_pools.insert(name, pool);
        }
    }

    /// Main loop. Runs until shutdown, then counts the drain latch down.
    pub fn run(mut self) {
        let partition = self.handle.partition();
        debug!(partition, "partition executor loop starting");
        while !self.shutdown.load(Ordering::Acquire) {
            let item = match self.deferred.pop_front() {
                Some(item) => Some(item),
                None => match self.receiver.recv_timeout(self.config.work_poll_timeout) {
                    Ok(item) => Some(item),
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => None,
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                },
            };
            self.tick_maybe();
            self.collect_garbage();
            if let Some(item) = item {
                self.dispatch_logged(item);
            }
        }
        debug!(partition, "partition executor loop stopping");
        self.drain_latch.count_down();
    }

    /// Dispatches one work item, absorbing non-fatal errors: unknown
    /// transactions are dropped quietly, everything else is logged and
    /// counted. Fatal errors escalate to a cluster shutdown.
    fn dispatch_logged(&mut self, item: WorkItem) {
        match self.dispatch(item) {
            Ok(()) => {}
            Err(KilnError::UnknownTransaction { txn_id }) => {
                debug!(
                    partition = self.handle.partition(),
                    txn_id, "ignoring message for unknown transaction"
                );
            }
            Err(error) if error.is_fatal() => {
                error!(partition = self.handle.partition(), %error, "fatal executor error");
                self.messenger.shutdown_cluster(&error.to_string());
            }
            Err(error) => {
                warn!(partition = self.handle.partition(), %error, "work item failed");
                self.handle.bump_error();
            }
        }
    }

    fn dispatch(&mut self, item: WorkItem) -> KilnResult<()> {
        match item {
            WorkItem::Initiate(task) => self.handle_initiate(task),
            WorkItem::Fragment(task) => self.handle_fragment(task),
            WorkItem::Prepare { txn_id } => self.handle_prepare(txn_id),
            WorkItem::Finish { txn_id, commit } => self.handle_finish(txn_id, commit),
            WorkItem::Poison => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Initiation and procedure execution
    // ------------------------------------------------------------------

    fn handle_initiate(&mut self, task: InitiateTask) -> KilnResult<()> {
        let Some(ts) = self.handle.lookup(task.txn_id) else {
            return Err(KilnError::InvalidState(
                "initiation for a transaction that was never queued",
            ));
        };
        debug!(
            partition = self.handle.partition(),
            txn_id = task.txn_id,
            proc = task.proc_name.as_str(),
            single_partition = ts.is_predict_single_partition(),
            "starting procedure"
        );

        let Some(mut procedure) = self.take_procedure(&task.proc_name) else {
            self.respond(
                task.txn_id,
                ClientResponse::failure(
                    task.txn_id,
                    task.client_handle,
                    ResponseStatus::UnexpectedError,
                    format!("no procedure is registered under '{}'", task.proc_name),
                ),
            );
            ts.mark_finished();
            self.finished_queue.push_back(task.txn_id);
            return Ok(());
        };

        let outcome = {
            let mut ctx = ProcedureContext {
                executor: self,
                ts: Arc::clone(&ts),
            };
            procedure.call(&mut ctx, &task.params)
        };
        self.return_procedure(&task.proc_name, procedure);

        let result = match outcome {
            Ok(results) => self.complete_success(&ts, results),
            Err(ProcedureFailure::Abort(message)) => {
                debug!(txn_id = task.txn_id, "procedure aborted by user");
                self.complete_failure(&ts, ResponseStatus::UserAbort, message)
            }
            Err(ProcedureFailure::Error(KilnError::Mispredict { txn_id })) => {
                debug!(txn_id, "single-partition prediction broke");
                self.restart_mispredicted(&ts)
            }
            Err(ProcedureFailure::Error(error)) => {
                warn!(txn_id = task.txn_id, %error, "procedure failed");
                self.complete_failure(&ts, ResponseStatus::UnexpectedError, error.to_string())
            }
        };
        // The engine tick rides on the initiation path, as the loop's
        // timeout alone cannot keep up under load.
        self.tick_maybe();
        result
    }

    fn complete_success(
        &mut self,
        ts: &Arc<TransactionState>,
        results: Vec<Table>,
    ) -> KilnResult<()> {
        let txn_id = ts.txn_id();
        let response = ClientResponse::success(txn_id, ts.client_handle(), results);
        if ts.is_exec_single_partition() {
            // Fast path: the whole transaction ran here, so it concludes
            // before the client hears back.
            self.commit_txn(txn_id)?;
            self.respond(txn_id, response);
            Ok(())
        } else {
            self.respond(txn_id, response);
            let _ = self.conclude_distributed(ts, true)?;
            Ok(())
        }
    }

    fn complete_failure(
        &mut self,
        ts: &Arc<TransactionState>,
        status: ResponseStatus,
        message: impl Into<String>,
    ) -> KilnResult<()> {
        let txn_id = ts.txn_id();
        let response = ClientResponse::failure(txn_id, ts.client_handle(), status, message);
        if ts.is_exec_single_partition() {
            self.abort_txn(txn_id)?;
            self.respond(txn_id, response);
            Ok(())
        } else {
            self.respond(txn_id, response);
            let _ = self.conclude_distributed(ts, false)?;
            Ok(())
        }
    }

    /// Rolls a mispredicted attempt back and hands the transaction to the
    /// coordinator for resubmission with the multi-partition prediction.
    /// The client's response slot stays armed across the restart; only a
    /// transaction past the restart cap (or one whose fragments already
    /// reached other partitions) reports the misprediction back.
    fn restart_mispredicted(&mut self, ts: &Arc<TransactionState>) -> KilnResult<()> {
        let txn_id = ts.txn_id();
        if self.coordinator.admitted(txn_id).is_empty() {
            // Roll the attempt's writes back before the state is re-armed.
            let undo_token = ts.first_undo_token();
            if undo_token != NULL_UNDO_TOKEN && ts.has_submitted_engine() {
                self.engine.undo_undo_token(undo_token)?;
            }
            if self.coordinator.resubmit_transaction(ts)? {
                return Ok(());
            }
        } else {
            // A mispredict is raised before any coordinator send, so this
            // means the procedure reported one after remote work was
            // already dispatched; replaying in place would leave those
            // partitions holding a dead transaction.
            warn!(
                partition = self.handle.partition(),
                txn_id, "mispredict reported with remote work in flight"
            );
        }
        self.complete_failure(
            ts,
            ResponseStatus::Mispredict,
            "transaction escaped its single-partition prediction",
        )
    }

    fn respond(&self, txn_id: TxnId, response: ClientResponse) {
        match self.handle.take_response_slot(txn_id) {
            Some(deliver) => deliver(response),
            None => warn!(
                partition = self.handle.partition(),
                txn_id, "no response slot for transaction"
            ),
        }
    }

    fn take_procedure(&mut self, name: &str) -> Option<Box<dyn StoredProcedure>> {
        if let Some(pool) = self.proc_pools.get_mut(name)
            && let Some(instance) = pool.pop()
        {
            return Some(instance);
        }
        // Pool ran dry (or the name is unknown): fall back to the factory.
        self.procedures.create(name)
    }

    fn return_procedure(&mut self, name: &str, instance: Box<dyn StoredProcedure>) {
        let cap = self
            .procedures
            .pool_size(name, self.config.proc_pool_default_size);
        if let Some(pool) = self.proc_pools.get_mut(name)
            && pool.len() < cap
        {
            pool.push(instance);
        }
    }

    // ------------------------------------------------------------------
    // Batch dispatch
    // ------------------------------------------------------------------

    /// Registers a batch with the transaction's new round, dispatches the
    /// runnable tasks, and re-enters the scheduling loop until every
    /// declared dependency is satisfied.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::Mispredict`] before anything is sent when a
    /// single-partition-predicted transaction targets a foreign partition;
    /// otherwise propagates the transaction's pending error.
    pub(crate) fn wait_for_responses(
        &mut self,
        ts: &Arc<TransactionState>,
        tasks: Vec<FragmentTask>,
    ) -> KilnResult<Vec<Table>> {
        let partition = self.handle.partition();
        let txn_id = ts.txn_id();

        // Every task registers before anything is dispatched; a task with
        // input dependencies could otherwise start the moment the first
        // response lands.
        ts.init_round(self.next_undo_token())?;
        let mut all_local = true;
        let mut runnable = Vec::new();
        for task in tasks {
            all_local = all_local && task.is_local_to(partition);
            match ts.add_fragment_task(task.clone(), self.pools.dependency())? {
                TaskDisposition::Runnable => runnable.push(task),
                TaskDisposition::Blocked => {}
            }
        }
        if runnable.is_empty() {
            let error = KilnError::InvalidState(
                "every task in the batch is blocked waiting on input",
            );
            ts.set_pending_error(error.clone());
            ts.finish_round(self.pools.dependency())?;
            return Err(error);
        }

        // The latch must exist before dispatch: a local task finishing on
        // this thread must find the round started.
        let latch = ts.start_round()?;

        if all_local {
            for task in runnable {
                self.handle.queue_fragment(task)?;
            }
        } else {
            if ts.is_predict_single_partition() {
                // Nothing has been sent yet; the restart is clean.
                let error = KilnError::Mispredict { txn_id };
                ts.set_pending_error(error.clone());
                ts.finish_round(self.pools.dependency())?;
                return Err(error);
            }
            for task in &mut runnable {
                if task.has_input_dependencies() && !task.is_local_to(partition) {
                    for (dep_id, table) in
                        ts.remove_internal_dependencies(&task.input_dep_ids)
                    {
                        task.attach_result(dep_id, table);
                    }
                }
            }
            let outbound = runnable.len();
            let _ = ts.arm_callback(CallbackKind::Work, outbound);
            self.coordinator.request_work(ts, runnable)?;
        }

        debug!(
            partition,
            txn_id,
            pending = latch.count(),
            "procedure blocked on batch dependencies"
        );
        self.drain_until(|| latch.count() == 0)?;

        if let Some(error) = ts.pending_error() {
            ts.finish_round(self.pools.dependency())?;
            return Err(error);
        }
        let results = ts.take_results();
        ts.finish_round(self.pools.dependency())?;
        Ok(results)
    }

    /// Re-enters the scheduling loop until `done` holds. New initiations
    /// are deferred so transactions stay strictly serial; everything else
    /// (fragments, prepare, finish) executes inline on this thread.
    fn drain_until(&mut self, done: impl Fn() -> bool) -> KilnResult<()> {
        loop {
            loop {
                match self.receiver.try_recv() {
                    Ok(WorkItem::Initiate(task)) => {
                        self.deferred.push_back(WorkItem::Initiate(task));
                    }
                    Ok(item) => self.dispatch_logged(item),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        return Err(KilnError::QueueClosed("partition work queue is closed"));
                    }
                }
            }
            if done() {
                return Ok(());
            }
            if self.shutdown.load(Ordering::Acquire) {
                return Err(KilnError::QueueClosed("site is shutting down"));
            }
            std::thread::sleep(NESTED_WAIT_SLICE);
        }
    }

    // ------------------------------------------------------------------
    // Fragment execution
    // ------------------------------------------------------------------

    fn handle_fragment(&mut self, task: FragmentTask) -> KilnResult<()> {
        let partition = self.handle.partition();
        let Some(ts) = self.handle.lookup(task.txn_id) else {
            return Err(KilnError::InvalidState(
                "fragment for a transaction with no state on this partition",
            ));
        };
        let is_local = ts.is_exec_local();
        debug!(
            partition,
            txn_id = task.txn_id,
            fragments = task.fragment_count(),
            is_local,
            via_coordinator = task.via_coordinator,
            "executing fragment batch"
        );

        // A remote coordinator-routed batch fences a fresh undo window; a
        // local transaction already runs inside its procedure's round.
        if !is_local && task.via_coordinator {
            ts.init_round(self.next_undo_token())?;
            let _ = ts.start_round()?;
            let _ = ts.arm_callback(CallbackKind::Work, 1);
        }

        let mut response = FragmentResponse::pending(task.txn_id, partition);
        let outcome = self.execute_fragment_task(&ts, &task);
        let outcome = outcome.and_then(|set| {
            if set.len() == task.output_dep_ids.len() {
                Ok(set)
            } else {
                Err(KilnError::Engine(format!(
                    "fragment batch produced {} dependencies, declared {}",
                    set.len(),
                    task.output_dep_ids.len()
                )))
            }
        });

        match outcome {
            Ok(set) => {
                response.mark_success();
                response.dep_ids = set.dep_ids();
                if is_local && !task.via_coordinator {
                    // Results land straight in the local buffer; the last
                    // one releases the blocked procedure.
                    for (dep_id, table) in set.entries {
                        let unblocked = ts.add_result(partition, dep_id, table)?;
                        self.route_unblocked(&ts, unblocked)?;
                    }
                } else {
                    // Rows first, metadata second: the metadata ack is what
                    // satisfies the dependency on the far side, and it must
                    // never overtake the rows.
                    self.messenger
                        .send_dependency_set(partition, task.source_partition, set)?;
                    self.messenger.send_fragment_response(response)?;
                }
            }
            Err(error) => {
                warn!(partition, txn_id = task.txn_id, %error, "fragment batch failed");
                self.handle.bump_error();
                let status = match &error {
                    KilnError::Sql(_) => FragmentStatus::UserError,
                    _ => FragmentStatus::UnexpectedError,
                };
                response.mark_failed(status, error.to_string());
                if is_local && !task.via_coordinator {
                    ts.set_pending_error(error);
                } else {
                    self.messenger.send_fragment_response(response)?;
                }
            }
        }

        if !is_local && task.via_coordinator {
            let _ = ts.deliver_callback(CallbackKind::Work);
            ts.finish_round(self.pools.dependency())?;
        }
        Ok(())
    }

    fn execute_fragment_task(
        &mut self,
        ts: &Arc<TransactionState>,
        task: &FragmentTask,
    ) -> KilnResult<DependencySet> {
        if task.fragment_count() == 0 {
            return Err(KilnError::InvalidState("fragment batch is empty"));
        }

        // Decode into owned values: the transport may reclaim the blobs.
        let mut param_sets = Vec::with_capacity(task.param_blobs.len());
        for blob in &task.param_blobs {
            param_sets.push(decode_params(blob)?);
        }
        if param_sets.len() != task.fragment_ids.len() {
            return Err(KilnError::Engine(
                "parameter sets do not match fragment count".to_owned(),
            ));
        }

        // Gather input rows: attached to the message, and (for local
        // transactions) buffered in the state from earlier fragments.
        let mut deps: Vec<(DependencyId, Vec<Table>)> = Vec::new();
        for (dep_id, table) in &task.attached_deps {
            push_dep(&mut deps, *dep_id, table.clone());
        }
        if task.has_input_dependencies() && ts.is_exec_local() {
            for (dep_id, table) in ts.remove_internal_dependencies(&task.input_dep_ids) {
                push_dep(&mut deps, dep_id, table);
            }
        }
        for dep_id in &task.input_dep_ids {
            if !deps.iter().any(|(have, _)| have == dep_id) {
                return Err(KilnError::InvalidState(
                    "input dependency rows are missing for this batch",
                ));
            }
        }

        if task.sysproc {
            if task.fragment_ids.len() != 1 {
                return Err(KilnError::InvalidState(
                    "sysproc batches carry exactly one fragment",
                ));
            }
            let fragment_id = task.fragment_ids[0];
            let Some(handler) = self.sysprocs.lookup(fragment_id) else {
                return Err(KilnError::Engine(format!(
                    "no sysproc handle exists for fragment {fragment_id}"
                )));
            };
            let ctx = SysProcContext {
                partition: self.handle.partition(),
                last_committed: self.handle.last_committed(),
            };
            return handler.execute_plan_fragment(
                task.txn_id,
                &deps,
                fragment_id,
                &param_sets[0],
                &ctx,
            );
        }

        self.engine.stash_work_unit_dependencies(deps);
        ts.mark_submitted_engine();
        self.engine.execute_plan_fragments(&FragmentWork {
            txn_id: task.txn_id,
            fragment_ids: &task.fragment_ids,
            param_sets: &param_sets,
            input_dep_ids: &task.input_dep_ids,
            output_dep_ids: &task.output_dep_ids,
            last_committed: self.handle.last_committed(),
            undo_token: ts.last_undo_token(),
        })
    }

    fn route_unblocked(
        &mut self,
        ts: &Arc<TransactionState>,
        tasks: Vec<FragmentTask>,
    ) -> KilnResult<()> {
        for task in tasks {
            if task.is_local_to(self.handle.partition()) {
                self.handle.queue_fragment(task)?;
            } else {
                self.coordinator.request_work(ts, vec![task])?;
            }
        }
        Ok(())
    }

    fn load_table(
        &mut self,
        ts: &Arc<TransactionState>,
        table_index: usize,
        rows: Table,
    ) -> KilnResult<()> {
        let undo_token = self.next_undo_token();
        ts.note_undo_token(undo_token)?;
        ts.mark_submitted_engine();
        self.engine.load_table(
            table_index,
            rows,
            ts.txn_id(),
            self.handle.last_committed(),
            undo_token,
            false,
        )
    }

    // ------------------------------------------------------------------
    // Commit protocol
    // ------------------------------------------------------------------

    fn handle_prepare(&mut self, txn_id: TxnId) -> KilnResult<()> {
        let partition = self.handle.partition();
        let ready = match self.handle.lookup(txn_id) {
            Some(ts) => !ts.has_pending_error(),
            None => {
                debug!(partition, txn_id, "prepare probe for unknown transaction");
                false
            }
        };
        self.coordinator.prepare_ack(txn_id, partition, ready);
        Ok(())
    }

    fn handle_finish(&mut self, txn_id: TxnId, commit: bool) -> KilnResult<()> {
        if commit {
            self.commit_txn(txn_id)?;
        } else {
            self.abort_txn(txn_id)?;
        }
        self.coordinator.finish_ack(txn_id, self.handle.partition());
        Ok(())
    }

    /// Drives the prepare and finish waves of a distributed transaction
    /// from its base partition, returning whether it committed.
    fn conclude_distributed(
        &mut self,
        ts: &Arc<TransactionState>,
        commit_intent: bool,
    ) -> KilnResult<bool> {
        let txn_id = ts.txn_id();
        let base = self.handle.partition();
        let mut participants = self.coordinator.admitted(txn_id);
        if !participants.contains(&base) {
            participants.push(base);
        }

        let mut outcome = commit_intent;
        if commit_intent {
            let wave = self.coordinator.begin_prepare(ts, &participants)?;
            self.drain_wave(&wave)?;
            // One refusal converts the whole outcome to abort.
            outcome = !wave.any_failed();
            if !outcome {
                warn!(txn_id, "prepare wave failed, aborting everywhere");
            }
        }

        let wave = self.coordinator.begin_finish(ts, &participants, outcome)?;
        self.drain_wave(&wave)?;
        self.coordinator.clear_txn(txn_id);
        Ok(outcome)
    }

    fn drain_wave(&mut self, wave: &Arc<WaveTracker>) -> KilnResult<()> {
        let wave = Arc::clone(wave);
        self.drain_until(move || wave.is_complete())
    }

    /// Commits one transaction on this partition. Idempotent; a commit for
    /// an unknown transaction is dropped quietly.
    fn commit_txn(&mut self, txn_id: TxnId) -> KilnResult<()> {
        let partition = self.handle.partition();
        let Some(ts) = self.handle.lookup(txn_id) else {
            debug!(partition, txn_id, "commit for unknown transaction, ignoring");
            return Ok(());
        };
        if ts.is_finished() {
            return Ok(());
        }

        let undo_token = ts.last_undo_token();
        debug!(
            partition,
            txn_id,
            undo_token,
            submitted = ts.has_submitted_engine(),
            "committing"
        );
        if undo_token != NULL_UNDO_TOKEN && ts.has_submitted_engine() {
            self.engine.release_undo_token(undo_token);
        }
        self.handle
            .shared
            .last_committed
            .store(txn_id, Ordering::Release);
        ts.mark_finished();
        if !ts.is_exec_local() {
            let _ = ts.deliver_callback(CallbackKind::Cleanup);
        }
        self.finished_queue.push_back(txn_id);
        Ok(())
    }

    /// Aborts one transaction on this partition, rolling back from its
    /// first undo token so every round unwinds. Same guards as commit.
    fn abort_txn(&mut self, txn_id: TxnId) -> KilnResult<()> {
        let partition = self.handle.partition();
        let Some(ts) = self.handle.lookup(txn_id) else {
            debug!(partition, txn_id, "abort for unknown transaction, ignoring");
            return Ok(());
        };
        if ts.is_finished() {
            return Ok(());
        }

        let undo_token = ts.first_undo_token();
        debug!(
            partition,
            txn_id,
            undo_token,
            submitted = ts.has_submitted_engine(),
            "rolling back"
        );
        if undo_token != NULL_UNDO_TOKEN && ts.has_submitted_engine() {
            self.engine.undo_undo_token(undo_token)?;
        }
        ts.mark_finished();
        if !ts.is_exec_local() {
            let _ = ts.deliver_callback(CallbackKind::Cleanup);
        }
        self.finished_queue.push_back(txn_id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------

    fn next_undo_token(&mut self) -> UndoToken {
        self.last_undo_token += 1;
        self.last_undo_token
    }

    fn tick_maybe(&mut self) {
        if self.last_tick.elapsed() < self.config.engine_tick_interval {
            return;
        }
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |since| u64::try_from(since.as_millis()).unwrap_or(u64::MAX));
        self.engine.tick(now_ms, self.handle.last_committed());
        self.last_tick = Instant::now();
    }

    /// Cleans up to the configured number of finished transactions whose
    /// lifecycle callbacks are all terminal, returning their states to the
    /// pools.
    fn collect_garbage(&mut self) {
        let mut cleaned = 0;
        while cleaned < self.config.max_txn_gc_per_poll {
            let Some(txn_id) = self.finished_queue.pop_front() else {
                return;
            };
            let ready = match self.handle.lookup(txn_id) {
                Some(ts) => {
                    ts.finished_longer_than(self.config.finished_txn_gc) && ts.is_deletable()
                }
                // Already cleaned through another path.
                None => continue,
            };
            if !ready {
                // The queue is in finish order; the head is the oldest.
                self.finished_queue.push_front(txn_id);
                return;
            }

            let Some(state) = self.handle.remove_state(txn_id) else {
                continue;
            };
            let was_local = state.is_exec_local();
            match Arc::try_unwrap(state) {
                Ok(mut state) => {
                    state.reset();
                    let pool = if was_local {
                        self.pools.txn_local()
                    } else {
                        self.pools.txn_remote()
                    };
                    if let Err(error) = pool.release(state) {
                        warn!(txn_id, %error, "failed to pool a cleaned transaction state");
                    }
                    cleaned += 1;
                }
                Err(state) => {
                    // Someone still holds a reference; retry next poll.
                    self.handle.reinsert_state(txn_id, state);
                    self.finished_queue.push_back(txn_id);
                    return;
                }
            }
        }
    }
}

fn push_dep(deps: &mut Vec<(DependencyId, Vec<Table>)>, dep_id: DependencyId, table: Table) {
    match deps.iter_mut().find(|(have, _)| *have == dep_id) {
        Some((_, tables)) => tables.push(table),
        None => deps.push((dep_id, vec![table])),
    }
}
