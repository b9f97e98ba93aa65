//! Storage-engine seam consumed by partition executors.
//!
//! The engine is treated as an opaque operator: catalog load, fragment
//! execution against stashed input dependencies, undo-token release and
//! rollback, bulk table load, and a periodic tick. Each engine instance is
//! exclusively owned by one executor thread.

use kiln_common::error::KilnResult;
use kiln_common::ids::{DependencyId, FragmentId, TxnId, UndoToken};

use crate::table::{DependencySet, Table, Value};

/// Declaration of one storage table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    /// Table name, unique within the catalog.
    pub name: String,
    /// Number of columns.
    pub columns: usize,
}

/// Minimal catalog an engine needs to materialize its tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineCatalog {
    /// Tables in index order; fragment handlers address tables by index.
    pub tables: Vec<TableSpec>,
}

impl EngineCatalog {
    /// Creates a catalog from `(name, columns)` declarations.
    #[must_use]
    pub fn with_tables(tables: &[(&str, usize)]) -> Self {
        Self {
            tables: tables
                .iter()
                .map(|(name, columns)| TableSpec {
                    name: (*name).to_owned(),
                    columns: *columns,
                })
                .collect(),
        }
    }
}

/// One fragment batch handed to the engine.
#[derive(Debug)]
pub struct FragmentWork<'a> {
    /// Transaction the batch belongs to.
    pub txn_id: TxnId,
    /// Compiled fragment ids in execution order.
    pub fragment_ids: &'a [FragmentId],
    /// Decoded parameter set per fragment, parallel to `fragment_ids`.
    pub param_sets: &'a [Vec<Value>],
    /// Input dependency ids the batch consumes (unordered).
    pub input_dep_ids: &'a [DependencyId],
    /// Output dependency ids the batch produces, parallel to `fragment_ids`.
    pub output_dep_ids: &'a [DependencyId],
    /// Highest transaction id committed on this partition.
    pub last_committed: TxnId,
    /// Undo token covering the batch's writes.
    pub undo_token: UndoToken,
}

/// Embedded storage engine owned by one partition executor.
pub trait StorageEngine: Send {
    /// Loads the catalog, materializing empty tables.
    ///
    /// # Errors
    ///
    /// Returns an error when the catalog is malformed or the backend cannot
    /// materialize it.
    fn load_catalog(&mut self, catalog: &EngineCatalog) -> KilnResult<()>;

    /// Advances engine-internal housekeeping. Called from the executor loop
    /// roughly once per second.
    fn tick(&mut self, now_ms: u64, last_committed: TxnId);

    /// Stashes input dependency rows for the next fragment batch. The
    /// engine consumes the stash in the following
    /// [`StorageEngine::execute_plan_fragments`] call.
    fn stash_work_unit_dependencies(&mut self, deps: Vec<(DependencyId, Vec<Table>)>);

    /// Executes a fragment batch and returns the produced dependency set,
    /// keyed by output dependency id.
    ///
    /// # Errors
    ///
    /// Returns `Engine` or `Sql` errors when a fragment fails; partial
    /// writes stay covered by the batch's undo token.
    fn execute_plan_fragments(&mut self, work: &FragmentWork<'_>) -> KilnResult<DependencySet>;

    /// Releases every undo entry up to and including `token` (commit).
    fn release_undo_token(&mut self, token: UndoToken);

    /// Rolls back every uncommitted undo entry at or above `token`, newest
    /// first (abort). The rollback is LIFO: undoing a later token implies
    /// every newer uncommitted write is undone with it, and a token whose
    /// entries were already unwound is a quiet no-op.
    ///
    /// # Errors
    ///
    /// Returns a fatal error when `token` was already released through the
    /// commit path.
    fn undo_undo_token(&mut self, token: UndoToken) -> KilnResult<()>;

    /// Bulk-loads rows into a table, covered by the given undo token.
    ///
    /// # Errors
    ///
    /// Returns an error when the table index is unknown or row arity does
    /// not match the catalog.
    fn load_table(
        &mut self,
        table_index: usize,
        rows: Table,
        txn_id: TxnId,
        last_committed: TxnId,
        undo_token: UndoToken,
        allow_export: bool,
    ) -> KilnResult<()>;
}

#[cfg(test)]
mod tests {
    use super::EngineCatalog;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn catalog_preserves_table_index_order() {
        let catalog = EngineCatalog::with_tables(&[("warehouse", 3), ("district", 4)]);
        assert_that!(catalog.tables.len(), eq(2_usize));
        assert_that!(catalog.tables[0].name.as_str(), eq("warehouse"));
        assert_that!(catalog.tables[1].columns, eq(4_usize));
    }
}
