//! Coordinator interface for distributed transactions.
//!
//! The coordinator packs a batch's outbound fragment tasks into a single
//! cross-partition request keyed by its own transaction id (distinct from
//! the site id; the mapping lives on the transaction state), admits remote
//! participants, fans fragment responses back into the originating state,
//! tracks the prepare/finish acknowledgement waves that conclude a
//! distributed transaction, and resubmits mispredicted transactions with
//! the multi-partition prediction, up to a capped restart count.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use hashbrown::HashMap;
use tracing::{debug, warn};

use kiln_common::error::{KilnError, KilnResult};
use kiln_common::ids::{CoordTxnId, PartitionId, TxnId};
use kiln_common::latch::CountDownLatch;
use kiln_core::message::{FragmentTask, InitiateTask};
use kiln_core::response::{FragmentResponse, FragmentStatus};
use kiln_txn::callback::CallbackKind;
use kiln_txn::state::TransactionState;

use crate::executor::ExecutorHandle;

/// Most restarts a mispredicted transaction gets before the client is told
/// about the misprediction. One restart clears the single-partition
/// prediction, which normally settles it; the cap bounds procedures that
/// keep reporting mispredicts regardless.
pub const MAX_MISPREDICT_RESTARTS: u32 = 3;

/// One partition's slice of a coordinator request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionFragment {
    /// Destination partition.
    pub partition: PartitionId,
    /// The fragment task addressed to it.
    pub task: FragmentTask,
}

/// A batch of fragment tasks bundled into one cross-partition request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorRequest {
    /// The coordinator's view of the transaction id.
    pub coord_txn_id: CoordTxnId,
    /// Per-partition work, in dispatch order.
    pub fragments: Vec<PartitionFragment>,
    /// Whether the issuer knows no further batch follows.
    pub last_fragment: bool,
}

/// Acknowledgement tracker for one prepare or finish wave.
#[derive(Debug)]
pub struct WaveTracker {
    latch: CountDownLatch,
    failed: AtomicBool,
}

impl WaveTracker {
    fn new(expected: usize) -> Self {
        Self {
            latch: CountDownLatch::new(expected),
            failed: AtomicBool::new(false),
        }
    }

    /// Records one participant's acknowledgement.
    pub fn record(&self, ok: bool) {
        if !ok {
            self.failed.store(true, Ordering::Release);
        }
        self.latch.count_down();
    }

    /// Returns whether every participant has acknowledged.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.latch.count() == 0
    }

    /// Returns whether any participant reported failure.
    #[must_use]
    pub fn any_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct InflightTxn {
    base_partition: PartitionId,
    admitted: Vec<PartitionId>,
}

/// In-process coordinator over the site's executor handles.
pub struct Coordinator {
    handles: Vec<ExecutorHandle>,
    next_txn_id: AtomicU64,
    next_coord_txn_id: AtomicU64,
    inflight: Mutex<HashMap<TxnId, InflightTxn>>,
    waves: Mutex<HashMap<TxnId, Arc<WaveTracker>>>,
    requests_sent: AtomicUsize,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("partitions", &self.handles.len())
            .field("requests_sent", &self.requests_sent.load(Ordering::Acquire))
            .finish()
    }
}

impl Coordinator {
    /// Creates the coordinator over the site's executor handles.
    #[must_use]
    pub fn new(handles: Vec<ExecutorHandle>) -> Arc<Self> {
        Arc::new(Self {
            handles,
            next_txn_id: AtomicU64::new(1),
            next_coord_txn_id: AtomicU64::new(1),
            inflight: Mutex::new(HashMap::new()),
            waves: Mutex::new(HashMap::new()),
            requests_sent: AtomicUsize::new(0),
        })
    }

    /// Mints a site-level transaction id for an arriving request.
    #[must_use]
    pub fn mint_txn_id(&self) -> TxnId {
        self.next_txn_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Number of cross-partition fragment requests sent so far.
    #[must_use]
    pub fn requests_sent(&self) -> usize {
        self.requests_sent.load(Ordering::Acquire)
    }

    /// Remote partitions admitted for one transaction.
    #[must_use]
    pub fn admitted(&self, txn_id: TxnId) -> Vec<PartitionId> {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&txn_id)
            .map(|inflight| inflight.admitted.clone())
            .unwrap_or_default()
    }

    fn handle(&self, partition: PartitionId) -> KilnResult<&ExecutorHandle> {
        self.handles
            .get(usize::from(partition))
            .ok_or(KilnError::InvalidState(
                "fragment destination partition is out of range",
            ))
    }

    /// Bundles outbound fragment tasks into one request and dispatches it.
    ///
    /// New remote participants are admitted first (creating their remote
    /// transaction state and acking the init wave) so every destination has
    /// a state in its table before its fragment arrives.
    ///
    /// # Errors
    ///
    /// Returns an error when a destination is out of range or a queue is
    /// closed. Nothing is dispatched for an out-of-range destination.
    pub fn request_work(
        &self,
        ts: &Arc<TransactionState>,
        tasks: Vec<FragmentTask>,
    ) -> KilnResult<()> {
        let txn_id = ts.txn_id();
        let base_partition = ts.base_partition();
        if ts.coord_txn_id().is_none() {
            ts.set_coord_txn_id(self.next_coord_txn_id.fetch_add(1, Ordering::AcqRel));
        }
        let coord_txn_id = ts.coord_txn_id().unwrap_or_default();

        let request = CoordinatorRequest {
            coord_txn_id,
            fragments: tasks
                .into_iter()
                .map(|mut task| {
                    task.via_coordinator = true;
                    PartitionFragment {
                        partition: task.destination_partition,
                        task,
                    }
                })
                .collect(),
            last_fragment: false,
        };
        for fragment in &request.fragments {
            let _ = self.handle(fragment.partition)?;
        }

        // Admit new remote participants before any fragment is dispatched.
        let new_remotes = {
            let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = inflight.entry(txn_id).or_insert_with(|| InflightTxn {
                base_partition,
                ..InflightTxn::default()
            });
            let mut new_remotes = Vec::new();
            for fragment in &request.fragments {
                if fragment.partition != base_partition
                    && !entry.admitted.contains(&fragment.partition)
                {
                    entry.admitted.push(fragment.partition);
                    new_remotes.push(fragment.partition);
                }
            }
            new_remotes
        };
        if !new_remotes.is_empty() {
            // Re-arming after an earlier batch finished its wave is legal.
            ts.arm_callback(CallbackKind::Init, new_remotes.len())?;
            for partition in &new_remotes {
                self.handle(*partition)?.ensure_remote(
                    txn_id,
                    base_partition,
                    vec![*partition],
                )?;
                let _ = ts.deliver_callback(CallbackKind::Init)?;
            }
        }

        let _ = self.requests_sent.fetch_add(1, Ordering::AcqRel);
        debug!(
            txn_id,
            coord_txn_id,
            fragments = request.fragments.len(),
            "dispatching coordinator request"
        );
        for fragment in request.fragments {
            self.handle(fragment.partition)?.queue_fragment(fragment.task)?;
        }
        Ok(())
    }

    /// Fans one fragment response back into the originating transaction.
    ///
    /// Successful responses acknowledge each listed dependency; failures
    /// record the transaction's pending error (first failure wins) and wake
    /// the blocked procedure.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::UnknownTransaction`] when the transaction is no
    /// longer tracked; callers log and drop.
    pub fn deliver_response(&self, response: FragmentResponse) -> KilnResult<()> {
        let txn_id = response.txn_id;
        let base_partition = {
            let inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            inflight
                .get(&txn_id)
                .map(|entry| entry.base_partition)
                .ok_or(KilnError::UnknownTransaction { txn_id })?
        };
        let handle = self.handle(base_partition)?;
        let Some(ts) = handle.lookup(txn_id) else {
            return Err(KilnError::UnknownTransaction { txn_id });
        };

        let _ = ts.deliver_callback(CallbackKind::Work);
        if response.status == FragmentStatus::Success {
            for dep_id in &response.dep_ids {
                let unblocked = ts.add_response(response.source_partition, *dep_id)?;
                for task in unblocked {
                    if task.is_local_to(base_partition) {
                        handle.queue_fragment(task)?;
                    } else {
                        self.request_work(&ts, vec![task])?;
                    }
                }
            }
        } else {
            let message = response
                .error
                .unwrap_or_else(|| "fragment failed without detail".to_owned());
            let error = match response.status {
                FragmentStatus::UserError => KilnError::Sql(message),
                _ => KilnError::Engine(message),
            };
            debug!(
                txn_id,
                source_partition = response.source_partition,
                "recording failed fragment response"
            );
            ts.set_pending_error(error);
        }
        Ok(())
    }

    /// Starts the prepare wave for one distributed transaction.
    ///
    /// # Errors
    ///
    /// Returns an error when a participant queue is closed.
    pub fn begin_prepare(
        &self,
        ts: &Arc<TransactionState>,
        participants: &[PartitionId],
    ) -> KilnResult<Arc<WaveTracker>> {
        let txn_id = ts.txn_id();
        self.ensure_inflight(txn_id, ts.base_partition());
        let wave = Arc::new(WaveTracker::new(participants.len()));
        let _ = self
            .waves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(txn_id, Arc::clone(&wave));
        ts.arm_callback(CallbackKind::Prepare, participants.len())?;
        for partition in participants {
            self.handle(*partition)?.queue_prepare(txn_id)?;
        }
        Ok(wave)
    }

    /// Records one partition's prepare acknowledgement.
    pub fn prepare_ack(&self, txn_id: TxnId, partition: PartitionId, ready: bool) {
        let Some(wave) = self.wave(txn_id) else {
            warn!(txn_id, partition, "prepare ack without a tracked wave");
            return;
        };
        if let Some(ts) = self.base_state(txn_id) {
            let _ = ts.deliver_callback(CallbackKind::Prepare);
        }
        wave.record(ready);
    }

    /// Starts the finish wave, carrying the commit-or-abort outcome to
    /// every participant.
    ///
    /// # Errors
    ///
    /// Returns an error when a participant queue is closed.
    pub fn begin_finish(
        &self,
        ts: &Arc<TransactionState>,
        participants: &[PartitionId],
        commit: bool,
    ) -> KilnResult<Arc<WaveTracker>> {
        let txn_id = ts.txn_id();
        self.ensure_inflight(txn_id, ts.base_partition());
        let wave = Arc::new(WaveTracker::new(participants.len()));
        let _ = self
            .waves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(txn_id, Arc::clone(&wave));
        ts.arm_callback(CallbackKind::Finish, participants.len())?;
        for partition in participants {
            self.handle(*partition)?.queue_finish(txn_id, commit)?;
        }
        Ok(wave)
    }

    /// Records one partition's finish acknowledgement.
    pub fn finish_ack(&self, txn_id: TxnId, partition: PartitionId) {
        let Some(wave) = self.wave(txn_id) else {
            debug!(txn_id, partition, "finish ack without a tracked wave");
            return;
        };
        if let Some(ts) = self.base_state(txn_id) {
            let _ = ts.deliver_callback(CallbackKind::Finish);
        }
        wave.record(true);
    }

    /// Resubmits a mispredicted transaction with the multi-partition
    /// prediction, re-arming its state in place and re-enqueueing the
    /// initiation at its base partition under the same transaction id.
    ///
    /// Returns `false` without resubmitting once the state's restart count
    /// passes [`MAX_MISPREDICT_RESTARTS`]; the caller then routes the
    /// misprediction to the client. The caller must have rolled the failed
    /// attempt's writes back first.
    ///
    /// # Errors
    ///
    /// Returns an error when the state cannot be re-armed (open round,
    /// already finished) or the base partition's queue is closed.
    pub fn resubmit_transaction(&self, ts: &Arc<TransactionState>) -> KilnResult<bool> {
        let txn_id = ts.txn_id();
        let restarts = ts.record_restart();
        if restarts > MAX_MISPREDICT_RESTARTS {
            warn!(txn_id, restarts, "mispredicted transaction passed its restart cap");
            return Ok(false);
        }
        self.clear_txn(txn_id);

        let partition_count = u16::try_from(self.handles.len()).unwrap_or(u16::MAX);
        let all_partitions = (0..partition_count).collect::<Vec<PartitionId>>();
        ts.restart_as_multi_partition(all_partitions.clone())?;

        let base_partition = ts.base_partition();
        let task = InitiateTask {
            txn_id,
            base_partition,
            client_handle: ts.client_handle(),
            source_partition: base_partition,
            proc_name: ts.proc_name(),
            params: ts.params(),
            predict_partitions: all_partitions,
            predict_read_only: ts.is_predict_read_only(),
            predict_abortable: ts.is_predict_abortable(),
        };
        debug!(
            txn_id,
            restarts, "resubmitting mispredicted transaction as multi-partition"
        );
        self.handle(base_partition)?.requeue_initiate(task)?;
        Ok(true)
    }

    /// Drops the coordinator's tracking for a concluded transaction.
    pub fn clear_txn(&self, txn_id: TxnId) {
        let _ = self
            .waves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&txn_id);
        let _ = self
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&txn_id);
    }

    fn ensure_inflight(&self, txn_id: TxnId, base_partition: PartitionId) {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = inflight.entry(txn_id).or_insert_with(|| InflightTxn {
            base_partition,
            ..InflightTxn::default()
        });
    }

    fn wave(&self, txn_id: TxnId) -> Option<Arc<WaveTracker>> {
        self.waves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&txn_id)
            .cloned()
    }

    fn base_state(&self, txn_id: TxnId) -> Option<Arc<TransactionState>> {
        let base_partition = self
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&txn_id)
            .map(|entry| entry.base_partition)?;
        self.handles
            .get(usize::from(base_partition))
            .and_then(|handle| handle.lookup(txn_id))
    }
}
