//! Typed message seam between partitions.
//!
//! The messenger is the site's network boundary: fragment responses travel
//! back to the coordinator path, dependency rows travel directly to the
//! consuming partition, and wrong-owner client requests are forwarded
//! through the redirect pair. [`LocalMessenger`] is the in-process
//! implementation routing over executor handles; tests substitute
//! recording doubles at the same seam.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, error};

use kiln_common::error::{KilnError, KilnResult};
use kiln_common::ids::PartitionId;
use kiln_core::message::InitiateTask;
use kiln_core::response::FragmentResponse;
use kiln_core::table::DependencySet;
use kiln_txn::callback::RedirectRelay;

use crate::coordinator::Coordinator;
use crate::executor::ExecutorHandle;

/// Cross-partition message transport.
pub trait Messenger: Send + Sync {
    /// Delivers a fragment response back toward the transaction's base
    /// partition through the coordinator path.
    ///
    /// # Errors
    ///
    /// Returns an error when the response cannot be routed.
    fn send_fragment_response(&self, response: FragmentResponse) -> KilnResult<()>;

    /// Delivers produced dependency rows directly to the consuming
    /// partition.
    ///
    /// # Errors
    ///
    /// Returns an error when the destination partition cannot be reached.
    fn send_dependency_set(
        &self,
        source: PartitionId,
        destination: PartitionId,
        set: DependencySet,
    ) -> KilnResult<()>;

    /// Forwards a client request that arrived at the wrong owner; `relay`
    /// carries the far side's response back to the originator.
    ///
    /// # Errors
    ///
    /// Returns an error when the owning partition cannot be reached.
    fn forward_initiate(&self, task: InitiateTask, relay: RedirectRelay) -> KilnResult<()>;

    /// Escalates a fatal failure: every executor on the site is told to
    /// stop.
    fn shutdown_cluster(&self, reason: &str);
}

/// In-process messenger routing over the site's executor handles.
pub struct LocalMessenger {
    handles: Vec<ExecutorHandle>,
    coordinator: Weak<Coordinator>,
    shutdown: Arc<AtomicBool>,
}

impl std::fmt::Debug for LocalMessenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMessenger")
            .field("partitions", &self.handles.len())
            .finish()
    }
}

impl LocalMessenger {
    /// Creates a messenger over the site's executor handles.
    #[must_use]
    pub fn new(
        handles: Vec<ExecutorHandle>,
        coordinator: Weak<Coordinator>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            handles,
            coordinator,
            shutdown,
        }
    }

    fn handle(&self, partition: PartitionId) -> KilnResult<&ExecutorHandle> {
        self.handles
            .get(usize::from(partition))
            .ok_or(KilnError::InvalidState(
                "destination partition is out of range",
            ))
    }
}

impl Messenger for LocalMessenger {
    fn send_fragment_response(&self, response: FragmentResponse) -> KilnResult<()> {
        let Some(coordinator) = self.coordinator.upgrade() else {
            return Err(KilnError::QueueClosed("coordinator is gone"));
        };
        match coordinator.deliver_response(response) {
            Ok(()) => Ok(()),
            // The coordinator may broadcast redundantly; a response for a
            // transaction this site no longer tracks is dropped.
            Err(KilnError::UnknownTransaction { txn_id }) => {
                debug!(txn_id, "dropping fragment response for unknown transaction");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    fn send_dependency_set(
        &self,
        source: PartitionId,
        destination: PartitionId,
        set: DependencySet,
    ) -> KilnResult<()> {
        match self.handle(destination)?.store_dependency_set(source, set) {
            Ok(()) => Ok(()),
            Err(KilnError::UnknownTransaction { txn_id }) => {
                debug!(txn_id, "dropping dependency rows for unknown transaction");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    fn forward_initiate(&self, task: InitiateTask, relay: RedirectRelay) -> KilnResult<()> {
        let owner = self.handle(task.base_partition)?;
        debug!(
            txn_id = task.txn_id,
            base_partition = task.base_partition,
            source_partition = task.source_partition,
            "forwarding initiate to its base partition"
        );
        owner.queue_initiate(task, relay)
    }

    fn shutdown_cluster(&self, reason: &str) {
        error!(reason, "fatal executor error, shutting the cluster down");
        self.shutdown.store(true, Ordering::Release);
        for handle in &self.handles {
            handle.send_poison();
        }
    }
}
