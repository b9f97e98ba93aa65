//! Shared harness for the site integration suites: a two-partition site
//! with a counter table, compiled fragment handlers, and the scenario
//! procedures.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use kiln_common::config::SiteConfig;
use kiln_common::error::{KilnError, KilnResult};
use kiln_common::ids::{DependencyId, FragmentId, PartitionId, TxnId};
use kiln_core::engine::EngineCatalog;
use kiln_core::message::InitiateTask;
use kiln_core::response::ClientResponse;
use kiln_core::sysproc::{SysProcContext, SystemProcedure};
use kiln_core::table::{DependencySet, Table, Value};
use kiln_site::executor::ProcedureContext;
use kiln_site::procedure::{
    PlannedFragment, ProcedureFailure, ProcedureRegistration, ProcedureResult, StoredProcedure,
};
use kiln_site::site::{Site, SiteCatalog};
use kiln_storage::MemoryEngine;

/// Inserts its parameter into the counter table and returns `{42}`.
pub const FRAG_WRITE: FragmentId = 1;
/// Inserts a marker row and returns `{3}`.
pub const FRAG_THREE: FragmentId = 2;
/// Inserts a marker row and returns `{4}`.
pub const FRAG_FOUR: FragmentId = 3;
/// Writes a row, then fails with an injected engine fault.
pub const FRAG_BOOM: FragmentId = 4;

pub const REMOTE_PARTITION: PartitionId = 1;

/// System-procedure fragment reporting the partition's commit horizon.
pub const SYSPROC_LAST_COMMITTED: FragmentId = 9000;
/// Output dependency id the sysproc fragment produces by convention.
pub const SYSPROC_DEP: DependencyId = 20;

static LOG_INIT: Once = Once::new();

/// Invocation count of the `AlwaysMispredict` procedure, so the restart
/// cap is observable from tests.
pub static MISPREDICT_ATTEMPTS: AtomicUsize = AtomicUsize::new(0);

fn install_fragments(_partition: PartitionId, engine: &mut MemoryEngine) -> Result<(), KilnError> {
    engine.register_fragment(
        FRAG_WRITE,
        Box::new(|scope| {
            let value = scope.params().first().cloned().unwrap_or(Value::Null);
            scope.insert_row(0, vec![value])?;
            Ok(Table::single_integer(42))
        }),
    )?;
    engine.register_fragment(
        FRAG_THREE,
        Box::new(|scope| {
            scope.insert_row(0, vec![Value::Integer(3)])?;
            Ok(Table::single_integer(3))
        }),
    )?;
    engine.register_fragment(
        FRAG_FOUR,
        Box::new(|scope| {
            scope.insert_row(0, vec![Value::Integer(4)])?;
            Ok(Table::single_integer(4))
        }),
    )?;
    engine.register_fragment(
        FRAG_BOOM,
        Box::new(|scope| {
            scope.insert_row(0, vec![Value::Integer(-1)])?;
            Err(KilnError::Engine("injected remote fault".to_owned()))
        }),
    )?;
    Ok(())
}

struct EchoProcedure;

impl StoredProcedure for EchoProcedure {
    fn call(&mut self, ctx: &mut ProcedureContext<'_>, params: &[Value]) -> ProcedureResult {
        let batch = vec![
            PlannedFragment::new(ctx.partition(), FRAG_WRITE, 10).with_params(params.to_vec()),
        ];
        Ok(ctx.execute_batch(batch)?)
    }
}

struct SumAcrossProcedure {
    remote_fragment: FragmentId,
}

impl StoredProcedure for SumAcrossProcedure {
    fn call(&mut self, ctx: &mut ProcedureContext<'_>, _params: &[Value]) -> ProcedureResult {
        let batch = vec![
            PlannedFragment::new(ctx.partition(), FRAG_THREE, 10),
            PlannedFragment::new(REMOTE_PARTITION, self.remote_fragment, 11),
        ];
        Ok(ctx.execute_batch(batch)?)
    }
}

struct EscapingProcedure;

impl StoredProcedure for EscapingProcedure {
    fn call(&mut self, ctx: &mut ProcedureContext<'_>, _params: &[Value]) -> ProcedureResult {
        let local = vec![
            PlannedFragment::new(ctx.partition(), FRAG_WRITE, 10)
                .with_params(vec![Value::Integer(1)]),
        ];
        let _ = ctx.execute_batch(local)?;
        // The second batch leaves the base partition, which a
        // single-partition prediction does not allow.
        let escape = vec![PlannedFragment::new(REMOTE_PARTITION, FRAG_FOUR, 11)];
        let _ = ctx.execute_batch(escape)?;
        Ok(Vec::new())
    }
}

struct AbortingProcedure;

impl StoredProcedure for AbortingProcedure {
    fn call(&mut self, ctx: &mut ProcedureContext<'_>, _params: &[Value]) -> ProcedureResult {
        let batch = vec![
            PlannedFragment::new(ctx.partition(), FRAG_WRITE, 10)
                .with_params(vec![Value::Integer(9)]),
        ];
        let _ = ctx.execute_batch(batch)?;
        Err(ProcedureFailure::Abort("rolled back on purpose".to_owned()))
    }
}

struct AlwaysMispredictProcedure;

impl StoredProcedure for AlwaysMispredictProcedure {
    fn call(&mut self, ctx: &mut ProcedureContext<'_>, _params: &[Value]) -> ProcedureResult {
        let _ = MISPREDICT_ATTEMPTS.fetch_add(1, Ordering::AcqRel);
        Err(ProcedureFailure::Error(KilnError::Mispredict {
            txn_id: ctx.txn_id(),
        }))
    }
}

struct LastCommittedSysProc;

impl SystemProcedure for LastCommittedSysProc {
    fn execute_plan_fragment(
        &self,
        txn_id: TxnId,
        _deps: &[(DependencyId, Vec<Table>)],
        _fragment_id: FragmentId,
        _params: &[Value],
        ctx: &SysProcContext,
    ) -> KilnResult<DependencySet> {
        let mut set = DependencySet::new(txn_id);
        let horizon = i64::try_from(ctx.last_committed).unwrap_or(i64::MAX);
        set.push(SYSPROC_DEP, Table::single_integer(horizon));
        Ok(set)
    }
}

struct StatusProcedure;

impl StoredProcedure for StatusProcedure {
    fn call(&mut self, ctx: &mut ProcedureContext<'_>, _params: &[Value]) -> ProcedureResult {
        let mut fragment =
            PlannedFragment::new(ctx.partition(), SYSPROC_LAST_COMMITTED, SYSPROC_DEP);
        fragment.sysproc = true;
        Ok(ctx.execute_batch(vec![fragment])?)
    }
}

struct SeedProcedure;

impl StoredProcedure for SeedProcedure {
    fn call(&mut self, ctx: &mut ProcedureContext<'_>, params: &[Value]) -> ProcedureResult {
        let rows = params.iter().map(|value| vec![value.clone()]).collect();
        ctx.load_table(0, Table::from_rows(rows))?;
        Ok(Vec::new())
    }
}

fn procedures() -> Vec<ProcedureRegistration> {
    vec![
        ProcedureRegistration::new("Echo", || Box::new(EchoProcedure)),
        ProcedureRegistration::new("SumAcross", || {
            Box::new(SumAcrossProcedure {
                remote_fragment: FRAG_FOUR,
            })
        }),
        ProcedureRegistration::new("SumAcrossBoom", || {
            Box::new(SumAcrossProcedure {
                remote_fragment: FRAG_BOOM,
            })
        }),
        ProcedureRegistration::new("SpThatEscapes", || Box::new(EscapingProcedure)),
        ProcedureRegistration::new("AbortAfterWrite", || Box::new(AbortingProcedure)),
        ProcedureRegistration::new("Status", || Box::new(StatusProcedure)).with_pool_size(1),
        ProcedureRegistration::new("Seed", || Box::new(SeedProcedure)),
        ProcedureRegistration::new("AlwaysMispredict", || Box::new(AlwaysMispredictProcedure)),
    ]
}

/// Builds the two-partition test site with fast polling and immediate GC
/// eligibility.
pub fn build_site() -> Site {
    LOG_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });

    let config = SiteConfig {
        work_poll_timeout: Duration::from_millis(10),
        finished_txn_gc: Duration::ZERO,
        pool_profiling: true,
        ..SiteConfig::default()
    };
    let catalog = SiteCatalog {
        engine_catalog: EngineCatalog::with_tables(&[("counters", 1)]),
        procedures: procedures(),
        sysprocs: vec![(SYSPROC_LAST_COMMITTED, Arc::new(LastCommittedSysProc) as _)],
    };
    Site::build(config, catalog, &install_fragments).expect("test site must start")
}

/// Builds an initiate task entering through its own base partition.
pub fn initiate(
    txn_id: TxnId,
    base_partition: PartitionId,
    proc_name: &str,
    params: Vec<Value>,
    predicted: Vec<PartitionId>,
) -> InitiateTask {
    InitiateTask {
        txn_id,
        base_partition,
        client_handle: txn_id,
        source_partition: base_partition,
        proc_name: proc_name.to_owned(),
        params,
        predict_partitions: predicted,
        predict_read_only: false,
        predict_abortable: true,
    }
}

/// Submits one request and blocks for its client response.
pub fn submit_and_wait(site: &Site, task: InitiateTask) -> ClientResponse {
    let (response_tx, response_rx) = mpsc::channel();
    site.submit(
        task,
        Box::new(move |response| {
            let _ = response_tx.send(response);
        }),
    )
    .expect("submission must be accepted");
    response_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("client response must arrive")
}

/// Polls `condition` until it holds or the timeout elapses.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
