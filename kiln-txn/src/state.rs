//! Per-partition transaction state.
//!
//! One record per live transaction per partition: a base of fields common
//! to both roles plus a tagged role for the side-specific ones. The *Local*
//! role lives on the transaction's base partition where the procedure body
//! runs; the *Remote* role lives on any other partition executing fragments
//! on the transaction's behalf. Dependency bookkeeping and callback
//! transitions happen under one internal mutex; the round latch is handed
//! out under that lock so deliveries can never race past the waiter.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use kiln_common::error::{KilnError, KilnResult};
use kiln_common::ids::{
    ClientHandle, CoordTxnId, DependencyId, PartitionId, TxnId, UndoToken, NULL_UNDO_TOKEN,
};
use kiln_common::latch::CountDownLatch;
use kiln_common::pool::{ObjectPool, Reusable};
use kiln_core::message::{FragmentTask, InitiateTask};
use kiln_core::table::{Table, Value};

use crate::callback::{CallbackKind, CallbackSet, SlotProgress};
use crate::dependency::{DependencyInfo, RoundState, TaskDisposition};

/// One RPC controller slot of a remote transaction, tracked per local
/// partition so used controllers can be cancelled on finish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RpcController {
    used: bool,
    cancelled: bool,
}

impl RpcController {
    /// Returns whether the controller was handed out for this transaction.
    #[must_use]
    pub fn is_used(&self) -> bool {
        self.used
    }

    /// Returns whether the controller was cancelled on finish.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// Role-specific fields of a transaction state.
#[derive(Debug)]
enum TxnRole {
    /// Pooled and unarmed.
    Idle,
    /// Procedure body runs on this partition.
    Local {
        touched_partitions: Vec<PartitionId>,
        restarts: u32,
    },
    /// Fragments execute here for a procedure running elsewhere.
    Remote { controllers: Vec<RpcController> },
}

#[derive(Debug)]
struct TxnBase {
    txn_id: TxnId,
    coord_txn_id: Option<CoordTxnId>,
    base_partition: PartitionId,
    client_handle: ClientHandle,
    proc_name: String,
    params: Vec<Value>,
    predict_partitions: Vec<PartitionId>,
    predict_read_only: bool,
    predict_abortable: bool,
    exec_local: bool,
    first_undo_token: UndoToken,
    last_undo_token: UndoToken,
    submitted_engine: bool,
    finished_at: Option<Instant>,
    pending_error: Option<KilnError>,
    callbacks: CallbackSet,
    round: RoundState,
}

impl Default for TxnBase {
    fn default() -> Self {
        Self {
            txn_id: 0,
            coord_txn_id: None,
            base_partition: 0,
            client_handle: 0,
            proc_name: String::new(),
            params: Vec::new(),
            predict_partitions: Vec::new(),
            predict_read_only: false,
            predict_abortable: true,
            exec_local: false,
            first_undo_token: NULL_UNDO_TOKEN,
            last_undo_token: NULL_UNDO_TOKEN,
            submitted_engine: false,
            finished_at: None,
            pending_error: None,
            callbacks: CallbackSet::default(),
            round: RoundState::default(),
        }
    }
}

struct TxnInner {
    base: TxnBase,
    role: TxnRole,
}

/// In-memory record of one live transaction on one partition.
///
/// Shared as `Arc` between the owning executor and the messenger threads
/// that deliver remote results; all mutation serializes on the internal
/// mutex.
pub struct TransactionState {
    inner: Mutex<TxnInner>,
}

impl std::fmt::Debug for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("TransactionState")
            .field("txn_id", &inner.base.txn_id)
            .field("base_partition", &inner.base.base_partition)
            .field("exec_local", &inner.base.exec_local)
            .field("finished", &inner.base.finished_at.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for TransactionState {
    fn default() -> Self {
        Self {
            inner: Mutex::new(TxnInner {
                base: TxnBase::default(),
                role: TxnRole::Idle,
            }),
        }
    }
}

impl TransactionState {
    fn lock(&self) -> std::sync::MutexGuard<'_, TxnInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arms a pooled state for the Local role from an initiate task.
    ///
    /// Idempotent for the same transaction id.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidState`] when the state is armed for a
    /// different transaction.
    pub fn init_local(&self, task: &InitiateTask) -> KilnResult<()> {
        let mut inner = self.lock();
        match inner.role {
            TxnRole::Idle => {}
            TxnRole::Local { .. } if inner.base.txn_id == task.txn_id => return Ok(()),
            _ => {
                return Err(KilnError::InvalidState(
                    "transaction state is armed for another transaction",
                ));
            }
        }
        inner.base = TxnBase {
            txn_id: task.txn_id,
            coord_txn_id: None,
            base_partition: task.base_partition,
            client_handle: task.client_handle,
            proc_name: task.proc_name.clone(),
            params: task.params.clone(),
            predict_partitions: task.predict_partitions.clone(),
            predict_read_only: task.predict_read_only,
            predict_abortable: task.predict_abortable,
            exec_local: true,
            ..TxnBase::default()
        };
        inner.role = TxnRole::Local {
            touched_partitions: Vec::new(),
            restarts: 0,
        };
        Ok(())
    }

    /// Arms a pooled state for the Remote role.
    ///
    /// Idempotent for the same transaction id.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidState`] when the state is armed for a
    /// different transaction.
    pub fn init_remote(
        &self,
        txn_id: TxnId,
        base_partition: PartitionId,
        participating_partitions: Vec<PartitionId>,
        local_partition_count: usize,
    ) -> KilnResult<()> {
        let mut inner = self.lock();
        match inner.role {
            TxnRole::Idle => {}
            TxnRole::Remote { .. } if inner.base.txn_id == txn_id => return Ok(()),
            _ => {
                return Err(KilnError::InvalidState(
                    "transaction state is armed for another transaction",
                ));
            }
        }
        inner.base = TxnBase {
            txn_id,
            base_partition,
            // Remote fragments are assumed read-only until the engine says
            // otherwise; the undo token decides commit-time behavior.
            predict_read_only: true,
            predict_partitions: participating_partitions,
            exec_local: false,
            ..TxnBase::default()
        };
        inner.role = TxnRole::Remote {
            controllers: vec![RpcController::default(); local_partition_count],
        };
        Ok(())
    }

    // ------------------------------------------------------------------
    // Identity and predictions
    // ------------------------------------------------------------------

    /// Transaction id this state is armed for.
    #[must_use]
    pub fn txn_id(&self) -> TxnId {
        self.lock().base.txn_id
    }

    /// Base partition where the procedure body runs.
    #[must_use]
    pub fn base_partition(&self) -> PartitionId {
        self.lock().base.base_partition
    }

    /// Client handle echoed in the response.
    #[must_use]
    pub fn client_handle(&self) -> ClientHandle {
        self.lock().base.client_handle
    }

    /// Registered procedure name (Local role).
    #[must_use]
    pub fn proc_name(&self) -> String {
        self.lock().base.proc_name.clone()
    }

    /// Invocation parameters (Local role).
    #[must_use]
    pub fn params(&self) -> Vec<Value> {
        self.lock().base.params.clone()
    }

    /// Stores the coordinator's transaction id for this transaction.
    pub fn set_coord_txn_id(&self, coord_txn_id: CoordTxnId) {
        self.lock().base.coord_txn_id = Some(coord_txn_id);
    }

    /// The coordinator's transaction id, when one was assigned.
    #[must_use]
    pub fn coord_txn_id(&self) -> Option<CoordTxnId> {
        self.lock().base.coord_txn_id
    }

    /// Returns whether the procedure body executes on this partition.
    #[must_use]
    pub fn is_exec_local(&self) -> bool {
        self.lock().base.exec_local
    }

    /// Returns whether the planner predicted a single-partition transaction:
    /// the predicted set is exactly the base partition.
    #[must_use]
    pub fn is_predict_single_partition(&self) -> bool {
        let inner = self.lock();
        inner.base.predict_partitions == [inner.base.base_partition]
    }

    /// Returns whether execution so far stayed on the base partition.
    #[must_use]
    pub fn is_exec_single_partition(&self) -> bool {
        let inner = self.lock();
        match &inner.role {
            TxnRole::Local {
                touched_partitions, ..
            } => touched_partitions
                .iter()
                .all(|partition| *partition == inner.base.base_partition),
            _ => false,
        }
    }

    /// Returns whether the planner predicted a read-only transaction.
    #[must_use]
    pub fn is_predict_read_only(&self) -> bool {
        self.lock().base.predict_read_only
    }

    /// Returns whether the planner predicted the procedure can abort.
    #[must_use]
    pub fn is_predict_abortable(&self) -> bool {
        self.lock().base.predict_abortable
    }

    /// Partitions the planner predicted this transaction touches.
    #[must_use]
    pub fn predict_partitions(&self) -> Vec<PartitionId> {
        self.lock().base.predict_partitions.clone()
    }

    /// Records one restart of a mispredicted transaction and returns the
    /// new count (Local role). The coordinator consults this against its
    /// restart cap before resubmitting.
    pub fn record_restart(&self) -> u32 {
        let mut inner = self.lock();
        match &mut inner.role {
            TxnRole::Local { restarts, .. } => {
                *restarts += 1;
                *restarts
            }
            _ => 0,
        }
    }

    /// Number of restarts recorded so far (Local role).
    #[must_use]
    pub fn restarts(&self) -> u32 {
        match &self.lock().role {
            TxnRole::Local { restarts, .. } => *restarts,
            _ => 0,
        }
    }

    /// Re-arms a mispredicted Local transaction for resubmission with the
    /// multi-partition prediction.
    ///
    /// Identity (transaction id, base partition, client handle, procedure,
    /// parameters) and the restart count survive; everything execution
    /// scoped — pending error, undo tokens, engine-submission flag,
    /// touched partitions, callback waves, the coordinator id mapping —
    /// resets so the next attempt starts clean. The caller must have
    /// rolled the attempt's writes back first.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidState`] on a non-Local or finished
    /// state, an open round, or a predicted set missing the base
    /// partition.
    pub fn restart_as_multi_partition(
        &self,
        predict_partitions: Vec<PartitionId>,
    ) -> KilnResult<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let TxnRole::Local {
            touched_partitions, ..
        } = &mut inner.role
        else {
            return Err(KilnError::InvalidState(
                "only local transactions are restarted",
            ));
        };
        if inner.base.finished_at.is_some() {
            return Err(KilnError::InvalidState(
                "finished transactions are not restarted",
            ));
        }
        if inner.base.round.in_progress() {
            return Err(KilnError::InvalidState(
                "cannot restart inside an open round",
            ));
        }
        if !predict_partitions.contains(&inner.base.base_partition) {
            return Err(KilnError::InvalidState(
                "restart prediction must include the base partition",
            ));
        }
        touched_partitions.clear();
        inner.base.predict_partitions = predict_partitions;
        inner.base.coord_txn_id = None;
        inner.base.pending_error = None;
        inner.base.submitted_engine = false;
        inner.base.first_undo_token = NULL_UNDO_TOKEN;
        inner.base.last_undo_token = NULL_UNDO_TOKEN;
        inner.base.callbacks.reset_all();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Undo bookkeeping
    // ------------------------------------------------------------------

    /// Last undo token minted for this transaction on this partition.
    #[must_use]
    pub fn last_undo_token(&self) -> UndoToken {
        self.lock().base.last_undo_token
    }

    /// First undo token minted for this transaction on this partition.
    ///
    /// The abort path rolls back from here so every round of the
    /// transaction unwinds, not just the newest.
    #[must_use]
    pub fn first_undo_token(&self) -> UndoToken {
        self.lock().base.first_undo_token
    }

    /// Records an undo token minted outside a round (bulk table load).
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidState`] when the token does not advance
    /// past the last one seen.
    pub fn note_undo_token(&self, undo_token: UndoToken) -> KilnResult<()> {
        let mut inner = self.lock();
        if undo_token <= inner.base.last_undo_token {
            return Err(KilnError::InvalidState(
                "undo token does not advance past the previous one",
            ));
        }
        if inner.base.first_undo_token == NULL_UNDO_TOKEN {
            inner.base.first_undo_token = undo_token;
        }
        inner.base.last_undo_token = undo_token;
        Ok(())
    }

    /// Marks that this transaction submitted work to the engine.
    pub fn mark_submitted_engine(&self) {
        self.lock().base.submitted_engine = true;
    }

    /// Returns whether the engine has seen work from this transaction.
    #[must_use]
    pub fn has_submitted_engine(&self) -> bool {
        self.lock().base.submitted_engine
    }

    // ------------------------------------------------------------------
    // Rounds
    // ------------------------------------------------------------------

    /// Opens a new round fenced by `undo_token`.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidState`] when the previous round is still
    /// open or the token does not advance past the last one seen.
    pub fn init_round(&self, undo_token: UndoToken) -> KilnResult<()> {
        let mut inner = self.lock();
        if undo_token <= inner.base.last_undo_token {
            return Err(KilnError::InvalidState(
                "undo token does not advance past the previous round",
            ));
        }
        inner.base.round.begin(undo_token)?;
        if inner.base.first_undo_token == NULL_UNDO_TOKEN {
            inner.base.first_undo_token = undo_token;
        }
        inner.base.last_undo_token = undo_token;
        Ok(())
    }

    /// Registers one fragment task with the current round.
    ///
    /// # Errors
    ///
    /// Propagates round-state errors; see [`RoundState::add_task`].
    pub fn add_fragment_task(
        &self,
        task: FragmentTask,
        pool: &ObjectPool<DependencyInfo>,
    ) -> KilnResult<TaskDisposition> {
        let mut inner = self.lock();
        let txn_id = inner.base.txn_id;
        let destination = task.destination_partition;
        let disposition = inner.base.round.add_task(task, txn_id, pool)?;
        if let TxnRole::Local {
            touched_partitions, ..
        } = &mut inner.role
            && !touched_partitions.contains(&destination)
        {
            touched_partitions.push(destination);
        }
        Ok(disposition)
    }

    /// Arms and returns the round latch. Must precede any dispatch.
    ///
    /// # Errors
    ///
    /// Propagates round-state errors; see [`RoundState::start`].
    pub fn start_round(&self) -> KilnResult<Arc<CountDownLatch>> {
        self.lock().base.round.start()
    }

    /// Buffers rows for one dependency, returning any unblocked tasks.
    ///
    /// Rows arriving after the round closed are an error unless the
    /// transaction carries a pending error; a failed round legitimately
    /// leaves stragglers in flight, and those are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidState`] for rows no open round declared.
    pub fn add_result(
        &self,
        partition: PartitionId,
        dep_id: DependencyId,
        table: Table,
    ) -> KilnResult<Vec<FragmentTask>> {
        let mut inner = self.lock();
        if !inner.base.round.in_progress() {
            if inner.base.pending_error.is_some() {
                return Ok(Vec::new());
            }
            return Err(KilnError::InvalidState(
                "result arrived after the round finished",
            ));
        }
        inner.base.round.add_result(partition, dep_id, table)
    }

    /// Records a row-less acknowledgement for one dependency.
    ///
    /// Unlike rows, a late acknowledgement is always dropped quietly: the
    /// rows it acknowledges may already have satisfied the dependency and
    /// released the procedure, closing the round before the metadata
    /// caught up.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidState`] for an acknowledgement no open
    /// round declared.
    pub fn add_response(
        &self,
        partition: PartitionId,
        dep_id: DependencyId,
    ) -> KilnResult<Vec<FragmentTask>> {
        let mut inner = self.lock();
        if !inner.base.round.in_progress() {
            return Ok(Vec::new());
        }
        inner.base.round.add_response(partition, dep_id)
    }

    /// Drains the round's merged result tables in declaration order.
    #[must_use]
    pub fn take_results(&self) -> Vec<Table> {
        self.lock().base.round.take_results()
    }

    /// Closes the current round.
    ///
    /// # Errors
    ///
    /// Propagates round-state errors; see [`RoundState::finish`].
    pub fn finish_round(&self, pool: &ObjectPool<DependencyInfo>) -> KilnResult<()> {
        let mut inner = self.lock();
        let error_pending = inner.base.pending_error.is_some();
        inner.base.round.finish(error_pending, pool)
    }

    /// Returns whether a round is currently open.
    #[must_use]
    pub fn round_in_progress(&self) -> bool {
        self.lock().base.round.in_progress()
    }

    /// Removes buffered rows for the given input dependencies so they can
    /// be attached to an outbound task.
    #[must_use]
    pub fn remove_internal_dependencies(
        &self,
        input_dep_ids: &[DependencyId],
    ) -> Vec<(DependencyId, Table)> {
        self.lock()
            .base
            .round
            .remove_internal_dependencies(input_dep_ids)
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    /// Records the first error observed for this transaction; later errors
    /// are dropped. Opens the round latch so a blocked procedure wakes to
    /// observe it.
    pub fn set_pending_error(&self, error: KilnError) {
        let mut inner = self.lock();
        if inner.base.pending_error.is_none() {
            tracing::debug!(txn_id = inner.base.txn_id, %error, "recording pending error");
            inner.base.pending_error = Some(error);
        }
        inner.base.round.open_latch();
    }

    /// Returns whether an error is pending.
    #[must_use]
    pub fn has_pending_error(&self) -> bool {
        self.lock().base.pending_error.is_some()
    }

    /// The pending error, if any.
    #[must_use]
    pub fn pending_error(&self) -> Option<KilnError> {
        self.lock().base.pending_error.clone()
    }

    // ------------------------------------------------------------------
    // Callbacks
    // ------------------------------------------------------------------

    /// Arms one callback wave for `expected` responses.
    ///
    /// # Errors
    ///
    /// Propagates slot errors; see [`crate::callback::CallbackSlot::arm`].
    pub fn arm_callback(&self, kind: CallbackKind, expected: usize) -> KilnResult<()> {
        self.lock().base.callbacks.slot_mut(kind).arm(expected)
    }

    /// Delivers one response to a callback wave.
    ///
    /// # Errors
    ///
    /// Propagates slot errors; see [`crate::callback::CallbackSlot::deliver`].
    pub fn deliver_callback(&self, kind: CallbackKind) -> KilnResult<SlotProgress> {
        self.lock().base.callbacks.slot_mut(kind).deliver()
    }

    /// Terminates one callback wave.
    pub fn abort_callback(&self, kind: CallbackKind) {
        self.lock().base.callbacks.slot_mut(kind).abort();
    }

    /// Terminates every callback wave, used on early abort.
    pub fn abort_all_callbacks(&self) {
        self.lock().base.callbacks.abort_all();
    }

    /// Returns whether one callback wave is finished.
    #[must_use]
    pub fn callback_finished(&self, kind: CallbackKind) -> bool {
        self.lock().base.callbacks.slot(kind).is_finished()
    }

    // ------------------------------------------------------------------
    // Remote RPC controllers
    // ------------------------------------------------------------------

    /// Marks the per-partition RPC controller as handed out (Remote role).
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidState`] on a Local or idle state, or an
    /// out-of-range partition index.
    pub fn mark_controller_used(&self, partition_index: usize) -> KilnResult<()> {
        let mut inner = self.lock();
        let TxnRole::Remote { controllers } = &mut inner.role else {
            return Err(KilnError::InvalidState(
                "rpc controllers exist only on remote transactions",
            ));
        };
        let Some(controller) = controllers.get_mut(partition_index) else {
            return Err(KilnError::InvalidState(
                "rpc controller index is out of range",
            ));
        };
        controller.used = true;
        Ok(())
    }

    /// Snapshot of one RPC controller slot (Remote role).
    #[must_use]
    pub fn controller(&self, partition_index: usize) -> Option<RpcController> {
        let inner = self.lock();
        let TxnRole::Remote { controllers } = &inner.role else {
            return None;
        };
        controllers.get(partition_index).copied()
    }

    /// Cancels every used controller, returning how many were cancelled.
    pub fn cancel_used_controllers(&self) -> usize {
        let mut inner = self.lock();
        let TxnRole::Remote { controllers } = &mut inner.role else {
            return 0;
        };
        let mut cancelled = 0;
        for controller in controllers.iter_mut() {
            if controller.used && !controller.cancelled {
                controller.cancelled = true;
                cancelled += 1;
            }
        }
        cancelled
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Marks the transaction finished on this partition. Remote states also
    /// cancel their used RPC controllers here.
    pub fn mark_finished(&self) {
        {
            let mut inner = self.lock();
            if inner.base.finished_at.is_none() {
                inner.base.finished_at = Some(Instant::now());
            }
        }
        let _ = self.cancel_used_controllers();
    }

    /// Returns whether the transaction was marked finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.lock().base.finished_at.is_some()
    }

    /// Returns whether the transaction finished at least `age` ago.
    #[must_use]
    pub fn finished_longer_than(&self, age: Duration) -> bool {
        self.lock()
            .base
            .finished_at
            .is_some_and(|at| at.elapsed() >= age)
    }

    /// Returns whether every lifecycle-relevant callback wave is terminal
    /// and no round is open.
    ///
    /// The work wave is deliberately not consulted: it is drained by the
    /// response path before finish acknowledgements can arrive.
    #[must_use]
    pub fn is_deletable(&self) -> bool {
        let inner = self.lock();
        if inner.base.finished_at.is_none() || inner.base.round.in_progress() {
            return false;
        }
        let callbacks = &inner.base.callbacks;
        let role_slots: &[CallbackKind] = match inner.role {
            TxnRole::Idle => return true,
            TxnRole::Local { .. } => &[
                CallbackKind::Init,
                CallbackKind::Prepare,
                CallbackKind::Finish,
            ],
            TxnRole::Remote { .. } => &[CallbackKind::Init, CallbackKind::Cleanup],
        };
        role_slots
            .iter()
            .all(|kind| callbacks.slot(*kind).is_poolable())
    }
}

impl Reusable for TransactionState {
    fn reset(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        inner.base = TxnBase::default();
        inner.role = TxnRole::Idle;
    }

    fn is_idle(&self) -> bool {
        matches!(self.lock().role, TxnRole::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::TransactionState;
    use crate::callback::CallbackKind;
    use crate::dependency::DependencyInfo;
    use googletest::prelude::*;
    use kiln_common::error::KilnError;
    use kiln_common::pool::{ObjectPool, Reusable};
    use kiln_core::message::{FragmentTask, InitiateTask};
    use kiln_core::table::Table;
    use rstest::rstest;

    fn dep_pool() -> ObjectPool<DependencyInfo> {
        ObjectPool::new("deps", 16, false, DependencyInfo::default)
    }

    fn initiate(txn_id: u64, base: u16, predicted: Vec<u16>) -> InitiateTask {
        InitiateTask {
            txn_id,
            base_partition: base,
            client_handle: 5,
            source_partition: base,
            proc_name: "Echo".to_owned(),
            params: Vec::new(),
            predict_partitions: predicted,
            predict_read_only: false,
            predict_abortable: true,
        }
    }

    fn fragment(destination: u16, outputs: Vec<i32>) -> FragmentTask {
        FragmentTask {
            txn_id: 100,
            source_partition: 0,
            destination_partition: destination,
            fragment_ids: vec![1],
            param_blobs: vec![Vec::new()],
            input_dep_ids: Vec::new(),
            output_dep_ids: outputs,
            via_coordinator: false,
            sysproc: false,
            attached_deps: Vec::new(),
        }
    }

    #[rstest]
    fn init_local_is_idempotent_for_the_same_transaction() {
        let state = TransactionState::default();
        state
            .init_local(&initiate(100, 0, vec![0]))
            .expect("idle state must arm");
        state
            .init_local(&initiate(100, 0, vec![0]))
            .expect("re-init for the same txn is a no-op");
        assert_that!(
            state.init_local(&initiate(101, 0, vec![0])).is_err(),
            eq(true)
        );
    }

    #[rstest]
    fn prediction_flags_follow_the_partition_set() {
        let state = TransactionState::default();
        state
            .init_local(&initiate(100, 0, vec![0]))
            .expect("idle state must arm");
        assert_that!(state.is_predict_single_partition(), eq(true));

        let multi = TransactionState::default();
        multi
            .init_local(&initiate(101, 0, vec![0, 1]))
            .expect("idle state must arm");
        assert_that!(multi.is_predict_single_partition(), eq(false));
    }

    #[rstest]
    fn touched_partitions_flip_exec_single_partition() {
        let pool = dep_pool();
        let state = TransactionState::default();
        state
            .init_local(&initiate(100, 0, vec![0, 1]))
            .expect("idle state must arm");
        assert_that!(state.is_exec_single_partition(), eq(true));

        state.init_round(1).expect("round must open");
        let _ = state
            .add_fragment_task(fragment(1, vec![10]), &pool)
            .expect("task must register");
        assert_that!(state.is_exec_single_partition(), eq(false));
    }

    #[rstest]
    fn undo_tokens_must_advance_between_rounds() {
        let pool = dep_pool();
        let state = TransactionState::default();
        state
            .init_local(&initiate(100, 0, vec![0]))
            .expect("idle state must arm");
        state.init_round(5).expect("round must open");
        state.finish_round(&pool).expect("empty round must close");
        assert_that!(state.init_round(5).is_err(), eq(true));
        state.init_round(6).expect("advancing token must open");
    }

    #[rstest]
    fn first_pending_error_wins() {
        let state = TransactionState::default();
        state
            .init_local(&initiate(100, 0, vec![0]))
            .expect("idle state must arm");
        state.set_pending_error(KilnError::Engine("first".to_owned()));
        state.set_pending_error(KilnError::Engine("second".to_owned()));
        assert_that!(
            state.pending_error(),
            eq(&Some(KilnError::Engine("first".to_owned())))
        );
    }

    #[rstest]
    fn pending_error_opens_the_round_latch() {
        let pool = dep_pool();
        let state = TransactionState::default();
        state
            .init_local(&initiate(100, 0, vec![0, 1]))
            .expect("idle state must arm");
        state.init_round(1).expect("round must open");
        let _ = state
            .add_fragment_task(fragment(1, vec![10]), &pool)
            .expect("task must register");
        let latch = state.start_round().expect("round must start");
        assert_that!(latch.count(), eq(1_usize));

        state.set_pending_error(KilnError::Engine("remote fault".to_owned()));
        assert_that!(latch.count(), eq(0_usize));
        state
            .finish_round(&pool)
            .expect("pending error permits closing the round");
    }

    #[rstest]
    fn late_result_is_dropped_only_with_a_pending_error() {
        let pool = dep_pool();
        let state = TransactionState::default();
        state
            .init_local(&initiate(100, 0, vec![0]))
            .expect("idle state must arm");
        state.init_round(1).expect("round must open");
        state.finish_round(&pool).expect("empty round must close");

        assert_that!(
            state.add_result(0, 10, Table::empty()).is_err(),
            eq(true)
        );
        state.set_pending_error(KilnError::Engine("fault".to_owned()));
        let unblocked = state
            .add_result(0, 10, Table::empty())
            .expect("straggler rows drop silently after an error");
        assert_that!(unblocked.is_empty(), eq(true));
    }

    #[rstest]
    fn deletable_requires_finish_and_terminal_callbacks() {
        let state = TransactionState::default();
        state
            .init_local(&initiate(100, 0, vec![0]))
            .expect("idle state must arm");
        assert_that!(state.is_deletable(), eq(false));

        state.arm_callback(CallbackKind::Prepare, 2).expect("slot must arm");
        state.mark_finished();
        assert_that!(state.is_deletable(), eq(false));

        state.abort_callback(CallbackKind::Prepare);
        assert_that!(state.is_deletable(), eq(true));
    }

    #[rstest]
    fn restart_clears_execution_state_but_keeps_identity() {
        let pool = dep_pool();
        let state = TransactionState::default();
        state
            .init_local(&initiate(102, 0, vec![0]))
            .expect("idle state must arm");
        state.init_round(1).expect("round must open");
        let _ = state
            .add_fragment_task(fragment(1, vec![10]), &pool)
            .expect("task must register");
        state.mark_submitted_engine();
        state.set_pending_error(KilnError::Mispredict { txn_id: 102 });
        state.finish_round(&pool).expect("pending error closes the round");

        assert_that!(state.record_restart(), eq(1_u32));
        state
            .restart_as_multi_partition(vec![0, 1])
            .expect("mispredicted state must re-arm");

        assert_that!(state.txn_id(), eq(102_u64));
        assert_that!(state.restarts(), eq(1_u32));
        assert_that!(state.is_predict_single_partition(), eq(false));
        assert_that!(state.is_exec_single_partition(), eq(true));
        assert_that!(state.has_pending_error(), eq(false));
        assert_that!(state.has_submitted_engine(), eq(false));
        assert_that!(state.first_undo_token(), eq(0_u64));
        // The next attempt opens its rounds from scratch.
        state.init_round(2).expect("re-armed state accepts a new round");
    }

    #[rstest]
    fn restart_is_refused_inside_an_open_round_or_after_finish() {
        let pool = dep_pool();
        let state = TransactionState::default();
        state
            .init_local(&initiate(102, 0, vec![0]))
            .expect("idle state must arm");
        state.init_round(1).expect("round must open");
        assert_that!(state.restart_as_multi_partition(vec![0, 1]).is_err(), eq(true));
        state.finish_round(&pool).expect("empty round must close");

        state.mark_finished();
        assert_that!(state.restart_as_multi_partition(vec![0, 1]).is_err(), eq(true));
    }

    #[rstest]
    fn remote_state_cancels_used_controllers_on_finish() {
        let state = TransactionState::default();
        state
            .init_remote(100, 0, vec![1], 2)
            .expect("idle state must arm");
        state.mark_controller_used(1).expect("controller must mark");
        state.mark_finished();
        let cancelled = state.controller(1).expect("controller slot exists");
        assert_that!(cancelled.is_used(), eq(true));
        assert_that!(cancelled.is_cancelled(), eq(true));
        let untouched = state.controller(0).expect("controller slot exists");
        assert_that!(untouched.is_used(), eq(false));
        // mark_finished already cancelled the used controller.
        assert_that!(state.cancel_used_controllers(), eq(0_usize));
    }

    #[rstest]
    fn reset_returns_the_state_to_idle() {
        let mut state = TransactionState::default();
        state
            .init_local(&initiate(100, 0, vec![0]))
            .expect("idle state must arm");
        assert_that!(state.is_idle(), eq(false));
        state.reset();
        assert_that!(state.is_idle(), eq(true));
        assert_that!(state.txn_id(), eq(0_u64));
    }
}
