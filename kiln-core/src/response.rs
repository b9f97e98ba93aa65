//! Fragment and client response types.

use kiln_common::ids::{ClientHandle, DependencyId, PartitionId, TxnId};

use crate::table::Table;

/// Outcome of one fragment batch on one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentStatus {
    /// Response allocated but not yet populated.
    Null,
    /// Batch executed and produced its declared outputs.
    Success,
    /// Batch failed with a user-visible SQL error.
    UserError,
    /// Batch failed unexpectedly (engine fault, decode failure).
    UnexpectedError,
}

/// Metadata response for one executed fragment batch.
///
/// Carries only dependency ids and status; produced rows travel separately
/// as a [`crate::table::DependencySet`] through the messenger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentResponse {
    /// Transaction the batch belonged to.
    pub txn_id: TxnId,
    /// Partition that executed the batch.
    pub source_partition: PartitionId,
    /// Outcome of the batch.
    pub status: FragmentStatus,
    /// Output dependency ids the batch acknowledged.
    pub dep_ids: Vec<DependencyId>,
    /// Wrapped error message for failed batches.
    pub error: Option<String>,
}

impl FragmentResponse {
    /// Creates an unpopulated response for a batch about to execute.
    #[must_use]
    pub fn pending(txn_id: TxnId, source_partition: PartitionId) -> Self {
        Self {
            txn_id,
            source_partition,
            status: FragmentStatus::Null,
            dep_ids: Vec::new(),
            error: None,
        }
    }

    /// Marks the response successful.
    pub fn mark_success(&mut self) {
        self.status = FragmentStatus::Success;
        self.error = None;
    }

    /// Marks the response failed with the wrapped error text.
    pub fn mark_failed(&mut self, status: FragmentStatus, error: impl Into<String>) {
        self.status = status;
        self.error = Some(error.into());
    }

    /// Returns whether the batch executed successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == FragmentStatus::Success
    }
}

/// Final status of one transaction as reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    /// Transaction committed.
    Success,
    /// Procedure rolled the transaction back on purpose.
    UserAbort,
    /// Single-partition prediction failed; the coordinator restarts the
    /// transaction with a multi-partition prediction.
    Mispredict,
    /// Engine fault, decode failure, or other unexpected error.
    UnexpectedError,
}

/// Response routed back to the client that submitted the transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientResponse {
    /// Transaction the response concludes.
    pub txn_id: TxnId,
    /// Handle the client attached to its request.
    pub client_handle: ClientHandle,
    /// Final status.
    pub status: ResponseStatus,
    /// Result tables in procedure-declared order; empty unless `Success`.
    pub results: Vec<Table>,
    /// Human-readable status detail; empty on success.
    pub status_message: String,
}

impl ClientResponse {
    /// Creates a successful response carrying result tables.
    #[must_use]
    pub fn success(txn_id: TxnId, client_handle: ClientHandle, results: Vec<Table>) -> Self {
        Self {
            txn_id,
            client_handle,
            status: ResponseStatus::Success,
            results,
            status_message: String::new(),
        }
    }

    /// Creates a non-success response with a status detail.
    #[must_use]
    pub fn failure(
        txn_id: TxnId,
        client_handle: ClientHandle,
        status: ResponseStatus,
        status_message: impl Into<String>,
    ) -> Self {
        Self {
            txn_id,
            client_handle,
            status,
            results: Vec::new(),
            status_message: status_message.into(),
        }
    }
}
