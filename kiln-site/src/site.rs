//! Site supervisor: per-process registry of partition executors, pools,
//! coordinator, and messenger.
//!
//! The supervisor builds one executor thread per hosted partition, routes
//! incoming client requests to the partition owning each transaction's
//! base partition (redirecting requests that entered through the wrong
//! one), exposes the observability surface, and drives shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use kiln_common::config::{EngineBackend, SiteConfig};
use kiln_common::error::{KilnError, KilnResult};
use kiln_common::ids::{DependencyId, FragmentId, PartitionId, TxnId};
use kiln_common::latch::CountDownLatch;
use kiln_common::pool::{PoolStats, Reusable};
use kiln_core::engine::{EngineCatalog, FragmentWork, StorageEngine};
use kiln_core::message::InitiateTask;
use kiln_core::response::ClientResponse;
use kiln_core::sysproc::{SysProcRegistry, SystemProcedure};
use kiln_core::table::{DependencySet, Table, Value};
use kiln_storage::MemoryEngine;
use kiln_txn::pools::SitePools;

use crate::coordinator::Coordinator;
use crate::executor::{ClientResponseFn, ExecutorHandle, PartitionExecutor};
use crate::messenger::{LocalMessenger, Messenger};
use crate::procedure::{ProcedureRegistration, ProcedureRegistry};

/// How long shutdown waits for the executor loops to drain.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the blocking [`Site::execute`] convenience waits for a client
/// response.
const EXECUTE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a site needs to know at build time.
pub struct SiteCatalog {
    /// Tables materialized on every partition's engine.
    pub engine_catalog: EngineCatalog,
    /// Stored procedures available to clients.
    pub procedures: Vec<ProcedureRegistration>,
    /// System-procedure handlers, keyed by fragment id.
    pub sysprocs: Vec<(FragmentId, Arc<dyn SystemProcedure>)>,
}

impl SiteCatalog {
    /// A catalog with no tables, procedures, or sysprocs.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            engine_catalog: EngineCatalog::default(),
            procedures: Vec::new(),
            sysprocs: Vec::new(),
        }
    }
}

// The in-memory engine is shared with the observability surface behind a
// mutex; the executor is still the only caller of mutating operations, and
// the recorded thread ids prove it.
struct SharedEngine(Arc<Mutex<MemoryEngine>>);

impl SharedEngine {
    fn engine(&self) -> std::sync::MutexGuard<'_, MemoryEngine> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StorageEngine for SharedEngine {
    fn load_catalog(&mut self, catalog: &EngineCatalog) -> KilnResult<()> {
        self.engine().load_catalog(catalog)
    }

    fn tick(&mut self, now_ms: u64, last_committed: TxnId) {
        self.engine().tick(now_ms, last_committed);
    }

    fn stash_work_unit_dependencies(&mut self, deps: Vec<(DependencyId, Vec<Table>)>) {
        self.engine().stash_work_unit_dependencies(deps);
    }

    fn execute_plan_fragments(&mut self, work: &FragmentWork<'_>) -> KilnResult<DependencySet> {
        self.engine().execute_plan_fragments(work)
    }

    fn release_undo_token(&mut self, token: u64) {
        self.engine().release_undo_token(token);
    }

    fn undo_undo_token(&mut self, token: u64) -> KilnResult<()> {
        self.engine().undo_undo_token(token)
    }

    fn load_table(
        &mut self,
        table_index: usize,
        rows: Table,
        txn_id: TxnId,
        last_committed: TxnId,
        undo_token: u64,
        allow_export: bool,
    ) -> KilnResult<()> {
        self.engine().load_table(
            table_index,
            rows,
            txn_id,
            last_committed,
            undo_token,
            allow_export,
        )
    }
}

/// One running site process.
pub struct Site {
    config: SiteConfig,
    pools: Arc<SitePools>,
    handles: Vec<ExecutorHandle>,
    coordinator: Arc<Coordinator>,
    messenger: Arc<LocalMessenger>,
    engines: Vec<Arc<Mutex<MemoryEngine>>>,
    threads: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    drain_latch: Arc<CountDownLatch>,
    down: AtomicBool,
}

impl std::fmt::Debug for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Site")
            .field("partitions", &self.handles.len())
            .field("down", &self.down.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Site {
    /// Builds and starts a site: pools, engines, one executor thread per
    /// partition, the coordinator, and the in-process messenger.
    ///
    /// `engine_setup` installs each partition's compiled fragment handlers
    /// (and any seed rows) before the executor thread takes the engine
    /// over.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidConfig`] for an invalid configuration
    /// or a backend this process cannot host, and propagates catalog and
    /// registration failures.
    pub fn build(
        config: SiteConfig,
        catalog: SiteCatalog,
        engine_setup: &dyn Fn(PartitionId, &mut MemoryEngine) -> KilnResult<()>,
    ) -> KilnResult<Self> {
        let config = config.validated()?;
        if config.backend != EngineBackend::InMemory {
            return Err(KilnError::InvalidConfig(
                "only the in-memory backend is linked into this process",
            ));
        }

        let pools = SitePools::new(&config.pool_idle_caps, config.pool_profiling);
        let procedures = Arc::new(ProcedureRegistry::new(catalog.procedures)?);
        let mut sysprocs = SysProcRegistry::default();
        for (fragment_id, handler) in catalog.sysprocs {
            sysprocs.register(fragment_id, handler)?;
        }
        let sysprocs = Arc::new(sysprocs);

        let partition_count = config.partition_count.get();
        let local_partition_count = usize::from(partition_count);
        let mut engines = Vec::with_capacity(local_partition_count);
        let mut handles = Vec::with_capacity(local_partition_count);
        let mut receivers = Vec::with_capacity(local_partition_count);
        for partition in 0..partition_count {
            let mut engine = MemoryEngine::new(partition);
            engine.load_catalog(&catalog.engine_catalog)?;
            engine_setup(partition, &mut engine)?;
            engines.push(Arc::new(Mutex::new(engine)));

            let (sender, receiver) = mpsc::channel();
            handles.push(ExecutorHandle::new(
                partition,
                local_partition_count,
                sender,
                Arc::clone(&pools),
            ));
            receivers.push(receiver);
        }

        let coordinator = Coordinator::new(handles.clone());
        for handle in &handles {
            handle.attach_coordinator(Arc::downgrade(&coordinator));
        }
        let shutdown = Arc::new(AtomicBool::new(false));
        let messenger = Arc::new(LocalMessenger::new(
            handles.clone(),
            Arc::downgrade(&coordinator),
            Arc::clone(&shutdown),
        ));
        let drain_latch = Arc::new(CountDownLatch::new(local_partition_count));

        let mut threads = Vec::with_capacity(local_partition_count);
        for (partition, receiver) in receivers.into_iter().enumerate() {
            let executor = PartitionExecutor::new(
                config.clone(),
                handles[partition].clone(),
                receiver,
                Box::new(SharedEngine(Arc::clone(&engines[partition]))),
                Arc::clone(&sysprocs),
                Arc::clone(&procedures),
                Arc::clone(&coordinator),
                Arc::clone(&messenger) as Arc<dyn Messenger>,
                Arc::clone(&pools),
                Arc::clone(&shutdown),
                Arc::clone(&drain_latch),
            );
            let thread = thread::Builder::new()
                .name(format!("kiln-exec-{partition}"))
                .spawn(move || executor.run())
                .map_err(|_| KilnError::InvalidState("failed to spawn an executor thread"))?;
            threads.push(thread);
        }

        debug!(partitions = partition_count, "site started");
        Ok(Self {
            config,
            pools,
            handles,
            coordinator,
            messenger,
            engines,
            threads,
            shutdown,
            drain_latch,
            down: AtomicBool::new(false),
        })
    }

    /// Site configuration in effect.
    #[must_use]
    pub fn config(&self) -> &SiteConfig {
        &self.config
    }

    /// Submits one client request, delivering the response through
    /// `on_response`.
    ///
    /// Requests that entered through a partition other than the base
    /// partition are forwarded through the redirect pair: the response
    /// relays back to the originating connection and the pooled redirect
    /// callback returns to its pool.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidConfig`] for an unhosted base
    /// partition, or [`KilnError::InvalidState`] when the transaction id
    /// is already active.
    pub fn submit(&self, task: InitiateTask, on_response: ClientResponseFn) -> KilnResult<()> {
        if !self.config.partition_count.contains(task.base_partition) {
            return Err(KilnError::InvalidConfig(
                "base partition is not hosted by this site",
            ));
        }
        if task.source_partition == task.base_partition {
            return self.owner_handle(task.base_partition)?.queue_initiate(task, on_response);
        }

        // Wrong ingress partition: forward through the redirect pair.
        let pools = Arc::clone(&self.pools);
        let mut redirect = pools.redirect().acquire();
        redirect.arm(task.client_handle, task.source_partition, on_response)?;
        let relay: ClientResponseFn = Box::new(move |response| {
            let mut redirect = redirect;
            if let Err(error) = redirect.relay_response(response) {
                warn!(%error, "redirect relay failed");
            }
            redirect.reset();
            if let Err(error) = pools.redirect().release(redirect) {
                warn!(%error, "failed to pool a redirect callback");
            }
        });
        self.messenger.forward_initiate(task, relay)
    }

    /// Blocking convenience: mints a transaction id, submits with the
    /// optimistic single-partition prediction, and waits for the response.
    /// A misprediction is handled on the dispatch path itself — the
    /// coordinator resubmits with the multi-partition prediction — so a
    /// `Mispredict` status only reaches here past the restart cap.
    ///
    /// # Errors
    ///
    /// Propagates submission errors, or [`KilnError::InvalidState`] when
    /// no response arrives in time.
    pub fn execute(
        &self,
        proc_name: &str,
        params: Vec<Value>,
        base_partition: PartitionId,
    ) -> KilnResult<ClientResponse> {
        let txn_id = self.coordinator.mint_txn_id();
        let task = InitiateTask {
            txn_id,
            base_partition,
            client_handle: txn_id,
            source_partition: base_partition,
            proc_name: proc_name.to_owned(),
            params,
            predict_partitions: vec![base_partition],
            predict_read_only: false,
            predict_abortable: true,
        };
        let (response_tx, response_rx) = mpsc::channel();
        self.submit(
            task,
            Box::new(move |response| {
                let _ = response_tx.send(response);
            }),
        )?;
        response_rx
            .recv_timeout(EXECUTE_RESPONSE_TIMEOUT)
            .map_err(|_| KilnError::InvalidState("timed out waiting for a client response"))
    }

    /// Handle to one hosted partition's executor.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidConfig`] for an unhosted partition.
    pub fn owner_handle(&self, partition: PartitionId) -> KilnResult<&ExecutorHandle> {
        self.handles
            .get(usize::from(partition))
            .ok_or(KilnError::InvalidConfig(
                "partition is not hosted by this site",
            ))
    }

    /// The in-memory engine of one partition, for observability and tests.
    #[must_use]
    pub fn memory_engine(&self, partition: PartitionId) -> Option<Arc<Mutex<MemoryEngine>>> {
        self.engines.get(usize::from(partition)).cloned()
    }

    /// Highest transaction id committed on one partition.
    #[must_use]
    pub fn last_committed(&self, partition: PartitionId) -> TxnId {
        self.handles
            .get(usize::from(partition))
            .map_or(0, ExecutorHandle::last_committed)
    }

    /// Pool counters, in registration order.
    #[must_use]
    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools.stats()
    }

    /// Live transactions per partition.
    #[must_use]
    pub fn running_transactions(&self) -> Vec<(PartitionId, usize)> {
        self.handles
            .iter()
            .map(|handle| (handle.partition(), handle.running_transactions()))
            .collect()
    }

    /// Absorbed executor errors per partition.
    #[must_use]
    pub fn error_counts(&self) -> Vec<(PartitionId, usize)> {
        self.handles
            .iter()
            .map(|handle| (handle.partition(), handle.error_count()))
            .collect()
    }

    /// Cross-partition fragment requests the coordinator has sent.
    #[must_use]
    pub fn coordinator_requests(&self) -> usize {
        self.coordinator.requests_sent()
    }

    /// Stops every executor and joins their threads. Idempotent.
    pub fn shutdown(&mut self) {
        if self.down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("site shutting down");
        self.shutdown.store(true, Ordering::Release);
        for handle in &self.handles {
            handle.send_poison();
        }
        if !self.drain_latch.wait_timeout(SHUTDOWN_DRAIN_TIMEOUT) {
            warn!("executor loops did not drain before the shutdown timeout");
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

impl Drop for Site {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::{Site, SiteCatalog};
    use googletest::prelude::*;
    use kiln_common::config::{EngineBackend, SiteConfig};
    use rstest::rstest;

    #[rstest]
    fn unhosted_backends_are_rejected() {
        let config = SiteConfig {
            backend: EngineBackend::NativeIpc,
            ..SiteConfig::default()
        };
        let result = Site::build(config, SiteCatalog::empty(), &|_, _| Ok(()));
        assert_that!(result.is_err(), eq(true));
    }

    #[rstest]
    fn empty_site_starts_and_shuts_down() {
        let mut site = Site::build(SiteConfig::default(), SiteCatalog::empty(), &|_, _| Ok(()))
            .expect("default site must start");
        assert_that!(site.running_transactions().len(), eq(2_usize));
        site.shutdown();
        site.shutdown();
    }
}
