//! Canonical identifier types used across executor, transaction, and storage layers.

/// Numeric partition identifier inside a single site process.
pub type PartitionId = u16;

/// Monotonic transaction identifier minted by the coordinator on arrival.
pub type TxnId = u64;

/// Opaque handle the client attached to its request, echoed in the response.
pub type ClientHandle = u64;

/// Identifier of a set of rows produced by one fragment and consumed by another.
///
/// Negative values are reserved; see [`NULL_DEPENDENCY_ID`].
pub type DependencyId = i32;

/// Identifier of a compiled plan fragment addressed to one partition.
pub type FragmentId = i64;

/// Monotonic per-partition marker into the engine's write log.
///
/// Zero is never handed out; see [`NULL_UNDO_TOKEN`].
pub type UndoToken = u64;

/// The coordinator's own view of a transaction id.
///
/// Distinct from the site-level [`TxnId`]; the mapping between the two is
/// stored on the transaction state.
pub type CoordTxnId = u64;

/// Sentinel for "no dependency declared".
pub const NULL_DEPENDENCY_ID: DependencyId = -1;

/// Sentinel for "this transaction has not written through the engine yet".
pub const NULL_UNDO_TOKEN: UndoToken = 0;

/// Strongly typed partition-count wrapper to avoid passing raw integers around site APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionCount(u16);

impl PartitionCount {
    /// Creates a validated partition-count value.
    ///
    /// Returns `None` for zero because a site always hosts at least one
    /// owning partition.
    #[must_use]
    pub fn new(value: u16) -> Option<Self> {
        if value == 0 { None } else { Some(Self(value)) }
    }

    /// Returns the inner count.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }

    /// Returns whether `partition` falls inside this site's partition space.
    #[must_use]
    pub const fn contains(self, partition: PartitionId) -> bool {
        partition < self.0
    }
}

#[cfg(test)]
mod tests {
    use super::PartitionCount;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn partition_count_rejects_zero() {
        assert_that!(PartitionCount::new(0), eq(None));
    }

    #[rstest]
    #[case(1)]
    #[case(4)]
    #[case(u16::MAX)]
    fn partition_count_accepts_positive_values(#[case] input: u16) {
        let count = PartitionCount::new(input).expect("positive count must be valid");
        assert_that!(count.get(), eq(input));
    }

    #[rstest]
    fn partition_count_bounds_partition_space() {
        let count = PartitionCount::new(2).expect("literal count must be non-zero");
        assert_that!(count.contains(0), eq(true));
        assert_that!(count.contains(1), eq(true));
        assert_that!(count.contains(2), eq(false));
    }
}
