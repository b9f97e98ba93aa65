//! Dependency records and round tracking.
//!
//! A *round* is one batch of fragments a procedure dispatched together.
//! Each declared output dependency gets a pooled [`DependencyInfo`] that
//! tracks which producing partitions still owe rows or an acknowledgement;
//! the round's latch counts unsatisfied dependencies and gates the blocked
//! procedure thread.

use std::sync::Arc;

use hashbrown::HashMap;

use kiln_common::error::{KilnError, KilnResult};
use kiln_common::ids::{DependencyId, PartitionId, TxnId, UndoToken};
use kiln_common::latch::CountDownLatch;
use kiln_common::pool::{ObjectPool, Reusable};
use kiln_core::message::FragmentTask;
use kiln_core::table::Table;

/// Tracking record for one output dependency of the current round.
///
/// A dependency is satisfied once every expected producing partition has
/// delivered *either* rows or an explicit empty response.
#[derive(Debug, Default)]
pub struct DependencyInfo {
    dep_id: DependencyId,
    txn_id: TxnId,
    expected_partitions: Vec<PartitionId>,
    remaining_partitions: Vec<PartitionId>,
    results: Vec<Table>,
}

impl DependencyInfo {
    /// Arms a pooled record for one dependency of one round.
    pub fn init(
        &mut self,
        dep_id: DependencyId,
        txn_id: TxnId,
        producing_partitions: &[PartitionId],
    ) {
        self.dep_id = dep_id;
        self.txn_id = txn_id;
        self.expected_partitions = producing_partitions.to_vec();
        self.remaining_partitions = producing_partitions.to_vec();
        self.results.clear();
    }

    /// Dependency id this record tracks.
    #[must_use]
    pub fn dep_id(&self) -> DependencyId {
        self.dep_id
    }

    /// Returns whether every expected partition has reported.
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        self.remaining_partitions.is_empty()
    }

    /// Adds one more expected producing partition before the round starts.
    pub fn add_producer(&mut self, partition: PartitionId) {
        if !self.expected_partitions.contains(&partition) {
            self.expected_partitions.push(partition);
            self.remaining_partitions.push(partition);
        }
    }

    /// Buffers rows from one producing partition.
    ///
    /// Returns whether this delivery satisfied the dependency.
    pub fn add_result(&mut self, partition: PartitionId, table: Table) -> bool {
        self.results.push(table);
        self.mark_reported(partition)
    }

    /// Records that a producing partition acknowledged the dependency
    /// without rows (the rows travel out-of-band or were empty).
    ///
    /// Returns whether this acknowledgement satisfied the dependency.
    pub fn add_response(&mut self, partition: PartitionId) -> bool {
        self.mark_reported(partition)
    }

    fn mark_reported(&mut self, partition: PartitionId) -> bool {
        let before = self.remaining_partitions.len();
        self.remaining_partitions.retain(|pending| *pending != partition);
        before > 0 && self.remaining_partitions.is_empty()
    }

    /// Drains the buffered rows into one merged table.
    #[must_use]
    pub fn take_merged_result(&mut self) -> Table {
        let mut merged = Table::empty();
        for table in self.results.drain(..) {
            merged.rows.extend(table.rows);
        }
        merged
    }
}

impl Reusable for DependencyInfo {
    fn reset(&mut self) {
        self.dep_id = 0;
        self.txn_id = 0;
        self.expected_partitions.clear();
        self.remaining_partitions.clear();
        self.results.clear();
    }

    fn is_idle(&self) -> bool {
        self.expected_partitions.is_empty() && self.results.is_empty()
    }
}

/// Disposition of one fragment task added to a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskDisposition {
    /// Every input dependency is already available; dispatch now.
    Runnable,
    /// Waiting on input dependencies produced later in the round.
    Blocked,
}

/// Live state of the current round. Owned by the transaction-state mutex.
#[derive(Debug, Default)]
pub struct RoundState {
    undo_token: UndoToken,
    output_order: Vec<DependencyId>,
    deps: HashMap<DependencyId, DependencyInfo>,
    blocked: Vec<FragmentTask>,
    latch: Option<Arc<CountDownLatch>>,
    in_progress: bool,
}

impl RoundState {
    /// Returns whether a round is currently open.
    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    /// Undo token fencing this round's writes.
    #[must_use]
    pub fn undo_token(&self) -> UndoToken {
        self.undo_token
    }

    /// Opens a new round fenced by `undo_token`.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidState`] when the previous round was never
    /// finished.
    pub fn begin(&mut self, undo_token: UndoToken) -> KilnResult<()> {
        if self.in_progress {
            return Err(KilnError::InvalidState(
                "previous round is still in progress",
            ));
        }
        self.undo_token = undo_token;
        self.in_progress = true;
        Ok(())
    }

    /// Registers one fragment task's declared dependencies and classifies
    /// the task.
    ///
    /// Output dependencies get a pooled tracking record expecting the
    /// task's destination partition. The task is `Blocked` when any of its
    /// input dependencies is not yet satisfied within this round.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidState`] when no round is open.
    pub fn add_task(
        &mut self,
        task: FragmentTask,
        txn_id: TxnId,
        pool: &ObjectPool<DependencyInfo>,
    ) -> KilnResult<TaskDisposition> {
        if !self.in_progress {
            return Err(KilnError::InvalidState("no round is in progress"));
        }
        for dep_id in &task.output_dep_ids {
            match self.deps.get_mut(dep_id) {
                Some(info) => info.add_producer(task.destination_partition),
                None => {
                    let mut info = pool.acquire();
                    info.init(*dep_id, txn_id, &[task.destination_partition]);
                    self.output_order.push(*dep_id);
                    let _ = self.deps.insert(*dep_id, info);
                }
            }
        }

        if self.unsatisfied_inputs(&task.input_dep_ids).is_empty() {
            Ok(TaskDisposition::Runnable)
        } else {
            self.blocked.push(task);
            Ok(TaskDisposition::Blocked)
        }
    }

    fn unsatisfied_inputs(&self, input_dep_ids: &[DependencyId]) -> Vec<DependencyId> {
        input_dep_ids
            .iter()
            .copied()
            .filter(|dep_id| {
                self.deps
                    .get(dep_id)
                    .is_none_or(|info| !info.is_satisfied())
            })
            .collect()
    }

    /// Arms and returns the round latch.
    ///
    /// The latch counts dependencies still unsatisfied at this instant;
    /// results that already arrived are not counted twice. Must be called
    /// before any task is dispatched so a same-thread completion cannot
    /// race ahead of the waiter.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidState`] when no round is open or the
    /// round was already started.
    pub fn start(&mut self) -> KilnResult<Arc<CountDownLatch>> {
        if !self.in_progress {
            return Err(KilnError::InvalidState("no round is in progress"));
        }
        if self.latch.is_some() {
            return Err(KilnError::InvalidState("round is already started"));
        }
        let unsatisfied = self
            .deps
            .values()
            .filter(|info| !info.is_satisfied())
            .count();
        let latch = Arc::new(CountDownLatch::new(unsatisfied));
        self.latch = Some(Arc::clone(&latch));
        Ok(latch)
    }

    /// Records rows for one dependency.
    ///
    /// Counts the round latch down when this delivery satisfies the
    /// dependency and returns any tasks it unblocked.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidState`] when no round is open or the
    /// dependency was never declared.
    pub fn add_result(
        &mut self,
        partition: PartitionId,
        dep_id: DependencyId,
        table: Table,
    ) -> KilnResult<Vec<FragmentTask>> {
        let satisfied = {
            let Some(info) = self.deps.get_mut(&dep_id) else {
                return Err(KilnError::InvalidState(
                    "result for a dependency this round never declared",
                ));
            };
            info.add_result(partition, table)
        };
        Ok(self.after_report(satisfied))
    }

    /// Records a row-less acknowledgement for one dependency.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidState`] when no round is open or the
    /// dependency was never declared.
    pub fn add_response(
        &mut self,
        partition: PartitionId,
        dep_id: DependencyId,
    ) -> KilnResult<Vec<FragmentTask>> {
        let satisfied = {
            let Some(info) = self.deps.get_mut(&dep_id) else {
                return Err(KilnError::InvalidState(
                    "response for a dependency this round never declared",
                ));
            };
            info.add_response(partition)
        };
        Ok(self.after_report(satisfied))
    }

    fn after_report(&mut self, satisfied: bool) -> Vec<FragmentTask> {
        if !satisfied {
            return Vec::new();
        }
        if let Some(latch) = &self.latch {
            latch.count_down();
        }
        let mut unblocked = Vec::new();
        let mut index = 0;
        while index < self.blocked.len() {
            if self
                .unsatisfied_inputs(&self.blocked[index].input_dep_ids)
                .is_empty()
            {
                unblocked.push(self.blocked.remove(index));
            } else {
                index += 1;
            }
        }
        unblocked
    }

    /// Forces the round latch open so a blocked procedure can observe a
    /// pending error.
    pub fn open_latch(&self) {
        if let Some(latch) = &self.latch {
            latch.open();
        }
    }

    /// Drains the round's merged result tables in declaration order.
    #[must_use]
    pub fn take_results(&mut self) -> Vec<Table> {
        let mut results = Vec::with_capacity(self.output_order.len());
        for dep_id in &self.output_order {
            if let Some(info) = self.deps.get_mut(dep_id) {
                results.push(info.take_merged_result());
            }
        }
        results
    }

    /// Closes the round, returning the tracking records to the pool.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidState`] when no round is open, or when a
    /// dependency is unsatisfied and `error_pending` is false.
    pub fn finish(
        &mut self,
        error_pending: bool,
        pool: &ObjectPool<DependencyInfo>,
    ) -> KilnResult<()> {
        if !self.in_progress {
            return Err(KilnError::InvalidState("no round is in progress"));
        }
        if !error_pending && self.deps.values().any(|info| !info.is_satisfied()) {
            return Err(KilnError::InvalidState(
                "round finished with unsatisfied dependencies and no pending error",
            ));
        }
        for (_, mut info) in self.deps.drain() {
            info.reset();
            pool.release(info)?;
        }
        self.output_order.clear();
        self.blocked.clear();
        self.latch = None;
        self.in_progress = false;
        self.undo_token = 0;
        Ok(())
    }

    /// Removes buffered rows for the given input dependencies so they can be
    /// attached to an outbound task.
    #[must_use]
    pub fn remove_internal_dependencies(
        &mut self,
        input_dep_ids: &[DependencyId],
    ) -> Vec<(DependencyId, Table)> {
        let mut attached = Vec::new();
        for dep_id in input_dep_ids {
            if let Some(info) = self.deps.get_mut(dep_id)
                && info.is_satisfied()
            {
                attached.push((*dep_id, info.take_merged_result()));
            }
        }
        attached
    }
}
