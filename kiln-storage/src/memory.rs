//! In-memory engine with undo-token rollback and call recording.

use std::thread::{self, ThreadId};

use hashbrown::HashMap;
use tracing::debug;

use kiln_common::error::{KilnError, KilnResult};
use kiln_common::ids::{DependencyId, FragmentId, PartitionId, TxnId, UndoToken};
use kiln_core::engine::{EngineCatalog, FragmentWork, StorageEngine};
use kiln_core::table::{DependencySet, Row, Table, Value};

/// Compiled fragment body: reads inputs and parameters through the scope,
/// mutates tables through it, and returns the fragment's output rows.
pub type FragmentHandler = Box<dyn Fn(&mut FragmentScope<'_>) -> KilnResult<Table> + Send>;

/// Execution scope of one fragment inside a batch.
///
/// Table mutation goes through the scope so the engine can snapshot each
/// touched table under the batch's undo token before the first write.
pub struct FragmentScope<'a> {
    txn_id: TxnId,
    fragment_id: FragmentId,
    params: &'a [Value],
    inputs: &'a [(DependencyId, Vec<Table>)],
    store: &'a mut TableStore,
    undo_token: UndoToken,
}

impl FragmentScope<'_> {
    /// Transaction the fragment executes for.
    #[must_use]
    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    /// Fragment id being executed.
    #[must_use]
    pub fn fragment_id(&self) -> FragmentId {
        self.fragment_id
    }

    /// Decoded parameters of this fragment.
    #[must_use]
    pub fn params(&self) -> &[Value] {
        self.params
    }

    /// Stashed input rows for one dependency id, one table per producing
    /// partition.
    #[must_use]
    pub fn input(&self, dep_id: DependencyId) -> Option<&[Table]> {
        self.inputs
            .iter()
            .find(|(id, _)| *id == dep_id)
            .map(|(_, tables)| tables.as_slice())
    }

    /// Read access to one table's rows.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::Sql`] when the table index is unknown.
    pub fn rows(&self, table_index: usize) -> KilnResult<&[Row]> {
        self.store.rows(table_index)
    }

    /// Appends one row, covered by the batch's undo token.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::Sql`] on an unknown table index or a row whose
    /// arity does not match the catalog.
    pub fn insert_row(&mut self, table_index: usize, row: Row) -> KilnResult<()> {
        self.store.insert_row(table_index, row, self.undo_token)
    }

    /// Deletes every row failing the predicate, covered by the batch's undo
    /// token. Returns the number of deleted rows.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::Sql`] when the table index is unknown.
    pub fn retain_rows(
        &mut self,
        table_index: usize,
        keep: impl Fn(&Row) -> bool,
    ) -> KilnResult<usize> {
        self.store.retain_rows(table_index, keep, self.undo_token)
    }
}

/// One engine-trait invocation, as recorded for tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    /// `load_catalog` with the number of declared tables.
    LoadCatalog {
        /// Declared table count.
        tables: usize,
    },
    /// `tick` observation.
    Tick {
        /// Wall time handed to the engine.
        now_ms: u64,
        /// Commit horizon handed to the engine.
        last_committed: TxnId,
    },
    /// `stash_work_unit_dependencies` with the stashed dependency ids.
    StashDependencies {
        /// Stashed dependency ids.
        dep_ids: Vec<DependencyId>,
    },
    /// `execute_plan_fragments` invocation.
    ExecuteFragments {
        /// Transaction executed for.
        txn_id: TxnId,
        /// Fragment ids in the batch.
        fragment_ids: Vec<FragmentId>,
        /// Undo token covering the batch.
        undo_token: UndoToken,
    },
    /// `release_undo_token` (commit path).
    ReleaseUndo {
        /// Released token.
        token: UndoToken,
    },
    /// `undo_undo_token` (abort path).
    UndoUndo {
        /// Rolled-back token.
        token: UndoToken,
    },
    /// `load_table` invocation.
    LoadTable {
        /// Destination table index.
        table_index: usize,
        /// Transaction loading the rows.
        txn_id: TxnId,
        /// Undo token covering the load.
        undo_token: UndoToken,
    },
}

#[derive(Debug)]
struct StoredTable {
    name: String,
    columns: usize,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct TableStore {
    tables: Vec<StoredTable>,
    // One frame per undo token that produced writes, in token order.
    undo_frames: Vec<UndoFrame>,
}

#[derive(Debug)]
struct UndoFrame {
    token: UndoToken,
    // Pre-image of each table first touched under this token.
    snapshots: Vec<(usize, Vec<Row>)>,
}

impl TableStore {
    fn rows(&self, table_index: usize) -> KilnResult<&[Row]> {
        self.tables
            .get(table_index)
            .map(|table| table.rows.as_slice())
            .ok_or(KilnError::Sql(format!("unknown table index {table_index}")))
    }

    fn snapshot_for_write(&mut self, table_index: usize, token: UndoToken) -> KilnResult<()> {
        if self.tables.get(table_index).is_none() {
            return Err(KilnError::Sql(format!("unknown table index {table_index}")));
        }
        if self
            .undo_frames
            .last()
            .is_none_or(|frame| frame.token != token)
        {
            self.undo_frames.push(UndoFrame {
                token,
                snapshots: Vec::new(),
            });
        }
        let pre_image = self.tables[table_index].rows.clone();
        if let Some(frame) = self.undo_frames.last_mut()
            && !frame.snapshots.iter().any(|(index, _)| *index == table_index)
        {
            frame.snapshots.push((table_index, pre_image));
        }
        Ok(())
    }

    fn insert_row(&mut self, table_index: usize, row: Row, token: UndoToken) -> KilnResult<()> {
        self.snapshot_for_write(table_index, token)?;
        let table = &mut self.tables[table_index];
        if row.len() != table.columns {
            return Err(KilnError::Sql(format!(
                "row arity {} does not match table '{}' ({} columns)",
                row.len(),
                table.name,
                table.columns
            )));
        }
        table.rows.push(row);
        Ok(())
    }

    fn retain_rows(
        &mut self,
        table_index: usize,
        keep: impl Fn(&Row) -> bool,
        token: UndoToken,
    ) -> KilnResult<usize> {
        self.snapshot_for_write(table_index, token)?;
        let rows = &mut self.tables[table_index].rows;
        let before = rows.len();
        rows.retain(|row| keep(row));
        Ok(before - rows.len())
    }
}

/// In-memory storage engine.
///
/// Owned exclusively by one partition executor thread; interior state is
/// deliberately unsynchronized so misuse shows up in the recorded thread
/// ids rather than being masked by locks.
pub struct MemoryEngine {
    partition: PartitionId,
    store: TableStore,
    handlers: HashMap<FragmentId, FragmentHandler>,
    stashed: Vec<(DependencyId, Vec<Table>)>,
    highest_released: UndoToken,
    calls: Vec<(ThreadId, EngineCall)>,
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("partition", &self.partition)
            .field("tables", &self.store.tables.len())
            .field("handlers", &self.handlers.len())
            .field("undo_frames", &self.store.undo_frames.len())
            .finish_non_exhaustive()
    }
}

impl MemoryEngine {
    /// Creates an engine for one partition with no catalog loaded.
    #[must_use]
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            store: TableStore::default(),
            handlers: HashMap::new(),
            stashed: Vec::new(),
            highest_released: 0,
            calls: Vec::new(),
        }
    }

    /// Partition this engine belongs to.
    #[must_use]
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Registers the compiled body for one fragment id.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidState`] when the fragment id already has
    /// a handler.
    pub fn register_fragment(
        &mut self,
        fragment_id: FragmentId,
        handler: FragmentHandler,
    ) -> KilnResult<()> {
        if self.handlers.contains_key(&fragment_id) {
            return Err(KilnError::InvalidState(
                "fragment id is already registered",
            ));
        }
        let _ = self.handlers.insert(fragment_id, handler);
        Ok(())
    }

    /// Recorded trait invocations with their calling threads, in call order.
    #[must_use]
    pub fn calls(&self) -> &[(ThreadId, EngineCall)] {
        &self.calls
    }

    /// Distinct threads that have invoked this engine.
    #[must_use]
    pub fn calling_threads(&self) -> Vec<ThreadId> {
        let mut threads = Vec::new();
        for (thread, _) in &self.calls {
            if !threads.contains(thread) {
                threads.push(*thread);
            }
        }
        threads
    }

    /// Tokens released through the commit path, in call order.
    #[must_use]
    pub fn released_tokens(&self) -> Vec<UndoToken> {
        self.calls
            .iter()
            .filter_map(|(_, call)| match call {
                EngineCall::ReleaseUndo { token } => Some(*token),
                _ => None,
            })
            .collect()
    }

    /// Tokens rolled back through the abort path, in call order.
    #[must_use]
    pub fn undone_tokens(&self) -> Vec<UndoToken> {
        self.calls
            .iter()
            .filter_map(|(_, call)| match call {
                EngineCall::UndoUndo { token } => Some(*token),
                _ => None,
            })
            .collect()
    }

    /// Rows currently visible in one table.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::Sql`] when the table index is unknown.
    pub fn table_rows(&self, table_index: usize) -> KilnResult<&[Row]> {
        self.store.rows(table_index)
    }

    fn record(&mut self, call: EngineCall) {
        self.calls.push((thread::current().id(), call));
    }
}

impl StorageEngine for MemoryEngine {
    fn load_catalog(&mut self, catalog: &EngineCatalog) -> KilnResult<()> {
        self.record(EngineCall::LoadCatalog {
            tables: catalog.tables.len(),
        });
        self.store.tables = catalog
            .tables
            .iter()
            .map(|spec| StoredTable {
                name: spec.name.clone(),
                columns: spec.columns,
                rows: Vec::new(),
            })
            .collect();
        self.store.undo_frames.clear();
        Ok(())
    }

    fn tick(&mut self, now_ms: u64, last_committed: TxnId) {
        self.record(EngineCall::Tick {
            now_ms,
            last_committed,
        });
    }

    fn stash_work_unit_dependencies(&mut self, deps: Vec<(DependencyId, Vec<Table>)>) {
        self.record(EngineCall::StashDependencies {
            dep_ids: deps.iter().map(|(dep_id, _)| *dep_id).collect(),
        });
        self.stashed = deps;
    }

    fn execute_plan_fragments(&mut self, work: &FragmentWork<'_>) -> KilnResult<DependencySet> {
        self.record(EngineCall::ExecuteFragments {
            txn_id: work.txn_id,
            fragment_ids: work.fragment_ids.to_vec(),
            undo_token: work.undo_token,
        });
        if work.fragment_ids.len() != work.param_sets.len()
            || work.fragment_ids.len() != work.output_dep_ids.len()
        {
            return Err(KilnError::Engine(
                "fragment, parameter, and output arities do not match".to_owned(),
            ));
        }

        let inputs = std::mem::take(&mut self.stashed);
        let mut result = DependencySet::new(work.txn_id);
        for (index, fragment_id) in work.fragment_ids.iter().enumerate() {
            let Some(handler) = self.handlers.get(fragment_id) else {
                self.stashed = inputs;
                return Err(KilnError::Sql(format!(
                    "no compiled handler for fragment {fragment_id}"
                )));
            };
            let mut scope = FragmentScope {
                txn_id: work.txn_id,
                fragment_id: *fragment_id,
                params: &work.param_sets[index],
                inputs: &inputs,
                store: &mut self.store,
                undo_token: work.undo_token,
            };
            let table = handler(&mut scope)?;
            result.push(work.output_dep_ids[index], table);
        }
        Ok(result)
    }

    fn release_undo_token(&mut self, token: UndoToken) {
        self.record(EngineCall::ReleaseUndo { token });
        self.store.undo_frames.retain(|frame| frame.token > token);
        self.highest_released = self.highest_released.max(token);
        debug!(partition = self.partition, token, "released undo token");
    }

    fn undo_undo_token(&mut self, token: UndoToken) -> KilnResult<()> {
        self.record(EngineCall::UndoUndo { token });
        if token <= self.highest_released {
            return Err(KilnError::Fatal(format!(
                "undo token {token} was already released on partition {}",
                self.partition
            )));
        }
        // LIFO rollback: everything at or above the token unwinds with it.
        // A token whose frames are already gone was unwound by an earlier
        // rollback, and the redundant request is a quiet no-op.
        while self
            .store
            .undo_frames
            .last()
            .is_some_and(|frame| frame.token >= token)
        {
            if let Some(frame) = self.store.undo_frames.pop() {
                for (table_index, pre_image) in frame.snapshots.into_iter().rev() {
                    self.store.tables[table_index].rows = pre_image;
                }
            }
        }
        debug!(partition = self.partition, token, "rolled back undo token");
        Ok(())
    }

    fn load_table(
        &mut self,
        table_index: usize,
        rows: Table,
        txn_id: TxnId,
        _last_committed: TxnId,
        undo_token: UndoToken,
        _allow_export: bool,
    ) -> KilnResult<()> {
        self.record(EngineCall::LoadTable {
            table_index,
            txn_id,
            undo_token,
        });
        for row in rows.rows {
            self.store.insert_row(table_index, row, undo_token)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{EngineCall, MemoryEngine};
    use googletest::prelude::*;
    use kiln_core::engine::{EngineCatalog, FragmentWork, StorageEngine};
    use kiln_core::table::{Table, Value};
    use rstest::rstest;

    const FRAG_INSERT: i64 = 1;
    const FRAG_COUNT: i64 = 2;

    fn counter_engine() -> MemoryEngine {
        let mut engine = MemoryEngine::new(0);
        engine
            .load_catalog(&EngineCatalog::with_tables(&[("counters", 1)]))
            .expect("catalog must load");
        engine
            .register_fragment(
                FRAG_INSERT,
                Box::new(|scope| {
                    let value = scope.params().first().cloned().unwrap_or(Value::Null);
                    scope.insert_row(0, vec![value])?;
                    Ok(Table::empty())
                }),
            )
            .expect("insert fragment must register");
        engine
            .register_fragment(
                FRAG_COUNT,
                Box::new(|scope| {
                    let count = i64::try_from(scope.rows(0)?.len()).unwrap_or(i64::MAX);
                    Ok(Table::single_integer(count))
                }),
            )
            .expect("count fragment must register");
        engine
    }

    fn run_fragment(
        engine: &mut MemoryEngine,
        fragment_id: i64,
        params: Vec<Value>,
        undo_token: u64,
    ) -> Table {
        let param_sets = vec![params];
        let result = engine
            .execute_plan_fragments(&FragmentWork {
                txn_id: 100,
                fragment_ids: &[fragment_id],
                param_sets: &param_sets,
                input_dep_ids: &[],
                output_dep_ids: &[10],
                last_committed: 0,
                undo_token,
            })
            .expect("fragment must execute");
        result.entries.into_iter().next().expect("one output").1
    }

    #[rstest]
    fn duplicate_fragment_registration_is_rejected() {
        let mut engine = counter_engine();
        assert_that!(
            engine
                .register_fragment(FRAG_INSERT, Box::new(|_| Ok(Table::empty())))
                .is_err(),
            eq(true)
        );
    }

    #[rstest]
    fn unknown_fragment_is_a_sql_error() {
        let mut engine = counter_engine();
        let param_sets = vec![Vec::new()];
        let result = engine.execute_plan_fragments(&FragmentWork {
            txn_id: 100,
            fragment_ids: &[999],
            param_sets: &param_sets,
            input_dep_ids: &[],
            output_dep_ids: &[10],
            last_committed: 0,
            undo_token: 1,
        });
        assert_that!(result.is_err(), eq(true));
    }

    #[rstest]
    fn undo_rolls_back_writes_under_the_token() {
        let mut engine = counter_engine();
        let _ = run_fragment(&mut engine, FRAG_INSERT, vec![Value::Integer(7)], 1);
        assert_that!(engine.table_rows(0).expect("table exists").len(), eq(1_usize));

        engine.undo_undo_token(1).expect("rollback must succeed");
        assert_that!(engine.table_rows(0).expect("table exists").len(), eq(0_usize));
    }

    #[rstest]
    fn release_makes_writes_permanent() {
        let mut engine = counter_engine();
        let _ = run_fragment(&mut engine, FRAG_INSERT, vec![Value::Integer(7)], 1);
        engine.release_undo_token(1);
        assert_that!(engine.undo_undo_token(1).is_err(), eq(true));
        assert_that!(engine.table_rows(0).expect("table exists").len(), eq(1_usize));
    }

    #[rstest]
    fn lifo_rollback_unwinds_newer_tokens_first() {
        let mut engine = counter_engine();
        let _ = run_fragment(&mut engine, FRAG_INSERT, vec![Value::Integer(1)], 1);
        let _ = run_fragment(&mut engine, FRAG_INSERT, vec![Value::Integer(2)], 2);
        let _ = run_fragment(&mut engine, FRAG_INSERT, vec![Value::Integer(3)], 3);

        // Rolling back token 2 implicitly unwinds token 3 as well.
        engine.undo_undo_token(2).expect("rollback must succeed");
        let rows = engine.table_rows(0).expect("table exists");
        assert_that!(rows.len(), eq(1_usize));
        assert_that!(&rows[0], eq(&vec![Value::Integer(1)]));

        // Token 3 is already gone; a redundant rollback is a quiet no-op.
        engine.undo_undo_token(3).expect("redundant rollback is a no-op");
        // Continuing to unwind the older token is still legal.
        engine.undo_undo_token(1).expect("older rollback continues the unwind");
        assert_that!(engine.table_rows(0).expect("table exists").len(), eq(0_usize));
    }

    #[rstest]
    fn rollback_covers_work_written_after_an_earlier_rollback() {
        let mut engine = counter_engine();
        let _ = run_fragment(&mut engine, FRAG_INSERT, vec![Value::Integer(1)], 1);
        engine.undo_undo_token(1).expect("rollback must succeed");

        // A restarted attempt writes under a newer token; rolling it back
        // must not be mistaken for the earlier, already-unwound rollback.
        let _ = run_fragment(&mut engine, FRAG_INSERT, vec![Value::Integer(2)], 2);
        assert_that!(engine.table_rows(0).expect("table exists").len(), eq(1_usize));
        engine.undo_undo_token(2).expect("second rollback must succeed");
        assert_that!(engine.table_rows(0).expect("table exists").len(), eq(0_usize));
    }

    #[rstest]
    fn count_fragment_sees_committed_inserts() {
        let mut engine = counter_engine();
        let _ = run_fragment(&mut engine, FRAG_INSERT, vec![Value::Integer(7)], 1);
        engine.release_undo_token(1);
        let counted = run_fragment(&mut engine, FRAG_COUNT, Vec::new(), 2);
        assert_that!(&counted, eq(&Table::single_integer(1)));
    }

    #[rstest]
    fn calls_record_execution_order() {
        let mut engine = counter_engine();
        let _ = run_fragment(&mut engine, FRAG_INSERT, vec![Value::Integer(7)], 1);
        engine.release_undo_token(1);

        let kinds = engine
            .calls()
            .iter()
            .map(|(_, call)| call.clone())
            .collect::<Vec<_>>();
        assert_that!(
            kinds.contains(&EngineCall::ReleaseUndo { token: 1 }),
            eq(true)
        );
        assert_that!(engine.released_tokens(), eq(&vec![1]));
        assert_that!(engine.calling_threads().len(), eq(1_usize));
    }
}
