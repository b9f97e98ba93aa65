//! Shared error model for cross-crate APIs.

use thiserror::Error;

use crate::ids::TxnId;

/// Unified result type used by all public interfaces in kiln.
pub type KilnResult<T> = Result<T, KilnError>;

/// Error taxonomy of the per-partition execution engine.
///
/// The variants mirror how failures propagate at runtime: procedure-level
/// aborts and mispredicts travel as values through the batch-dispatch
/// contract, engine and decode failures become failed fragment responses,
/// and only [`KilnError::Fatal`] escalates past an executor loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KilnError {
    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// The procedure body rolled the transaction back on purpose.
    #[error("transaction {txn_id} aborted by procedure: {message}")]
    UserAbort {
        /// Transaction that aborted.
        txn_id: TxnId,
        /// Message carried back to the client.
        message: String,
    },

    /// A transaction predicted single-partition tried to touch a foreign
    /// partition and must be restarted with a multi-partition prediction.
    #[error("transaction {txn_id} escaped its single-partition prediction")]
    Mispredict {
        /// Transaction that must be restarted.
        txn_id: TxnId,
    },

    /// The storage engine failed while executing a fragment batch.
    #[error("storage engine error: {0}")]
    Engine(String),

    /// A fragment failed with a SQL-level error.
    #[error("sql error: {0}")]
    Sql(String),

    /// Parameter buffer decoding failed; surfaced to clients as an
    /// unexpected error.
    #[error("parameter decode error: {0}")]
    Deserialize(String),

    /// A commit, abort, or response referenced a transaction this partition
    /// has never seen. Callers log and ignore: the coordinator may broadcast
    /// redundantly across a site's partitions.
    #[error("no transaction state for txn {txn_id}")]
    UnknownTransaction {
        /// The unrecognized transaction id.
        txn_id: TxnId,
    },

    /// A work queue was closed by shutdown before the send completed.
    #[error("work queue is closed: {0}")]
    QueueClosed(&'static str),

    /// Assertion-grade violation; the supervisor shuts the cluster down.
    #[error("fatal executor error: {0}")]
    Fatal(String),
}

impl KilnError {
    /// Returns whether this error must escalate to a cluster shutdown.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::KilnError;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn only_fatal_variant_escalates() {
        assert_that!(KilnError::Fatal("lost engine".to_owned()).is_fatal(), eq(true));
        assert_that!(KilnError::Mispredict { txn_id: 7 }.is_fatal(), eq(false));
        assert_that!(
            KilnError::UnknownTransaction { txn_id: 9 }.is_fatal(),
            eq(false)
        );
    }

    #[rstest]
    fn mispredict_display_names_transaction() {
        let error = KilnError::Mispredict { txn_id: 102 };
        assert_that!(format!("{error}").contains("102"), eq(true));
    }
}
