//! Site configuration shared by bootstrap code.

use std::time::Duration;

use crate::error::{KilnError, KilnResult};
use crate::ids::PartitionCount;

/// Storage backend selected for every partition of a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineBackend {
    /// In-process mock engine with an undo log; the only backend built into
    /// this workspace.
    InMemory,
    /// Native engine linked into the process.
    NativeLib,
    /// Native engine reached over an IPC channel.
    NativeIpc,
    /// Fragments mirrored onto an external SQL backend.
    SqlProxy,
}

/// Idle-list caps for the pooled per-transaction object classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolIdleCaps {
    /// Local transaction states kept idle per site.
    pub txn_local: usize,
    /// Remote transaction states kept idle per site.
    pub txn_remote: usize,
    /// Dependency records kept idle per site.
    pub dependency: usize,
    /// Callback handles kept idle per class per site.
    pub callback: usize,
}

impl Default for PoolIdleCaps {
    fn default() -> Self {
        Self {
            txn_local: 500,
            txn_remote: 500,
            dependency: 500,
            callback: 1000,
        }
    }
}

/// Bootstrap configuration for one site process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteConfig {
    /// Number of partitions hosted by this site, one executor thread each.
    pub partition_count: PartitionCount,
    /// Storage backend used by every partition executor.
    pub backend: EngineBackend,
    /// Reusable procedure instances kept per procedure name. System
    /// procedures always pin their pool to one instance.
    pub proc_pool_default_size: usize,
    /// How long a finished transaction state lingers before it is cleaned.
    pub finished_txn_gc: Duration,
    /// Upper bound of finished transactions cleaned per poll round.
    pub max_txn_gc_per_poll: usize,
    /// Bounded timeout of one work-queue poll. Clamped so the loop can
    /// advance engine ticks; see [`SiteConfig::validated`].
    pub work_poll_timeout: Duration,
    /// Minimum wall-time between engine ticks.
    pub engine_tick_interval: Duration,
    /// Enables hit/miss/high-water counters on every object pool.
    pub pool_profiling: bool,
    /// Idle caps per pooled object class.
    pub pool_idle_caps: PoolIdleCaps,
    /// Requests executor threads be pinned to CPUs. Recorded for deployment
    /// tooling; the executors themselves only name their threads.
    pub pin_threads: bool,
}

/// Longest work-queue poll that still lets the loop advance engine ticks.
pub const MAX_WORK_POLL_TIMEOUT: Duration = Duration::from_millis(500);

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            partition_count: PartitionCount::new(2).expect("literal partition count must be non-zero"),
            backend: EngineBackend::InMemory,
            proc_pool_default_size: 5,
            finished_txn_gc: Duration::from_secs(2),
            max_txn_gc_per_poll: 10,
            work_poll_timeout: MAX_WORK_POLL_TIMEOUT,
            engine_tick_interval: Duration::from_secs(1),
            pool_profiling: false,
            pool_idle_caps: PoolIdleCaps::default(),
            pin_threads: false,
        }
    }
}

impl SiteConfig {
    /// Returns this configuration with runtime bounds enforced.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidConfig`] when a zero sizing knob would
    /// stall the executor loop (empty procedure pools or a GC cap of zero).
    pub fn validated(mut self) -> KilnResult<Self> {
        if self.proc_pool_default_size == 0 {
            return Err(KilnError::InvalidConfig(
                "procedure pool size must be at least one",
            ));
        }
        if self.max_txn_gc_per_poll == 0 {
            return Err(KilnError::InvalidConfig(
                "transaction gc batch must be at least one",
            ));
        }
        if self.work_poll_timeout > MAX_WORK_POLL_TIMEOUT {
            self.work_poll_timeout = MAX_WORK_POLL_TIMEOUT;
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::{EngineBackend, MAX_WORK_POLL_TIMEOUT, SiteConfig};
    use googletest::prelude::*;
    use rstest::rstest;
    use std::time::Duration;

    #[rstest]
    fn default_config_is_valid() {
        let config = SiteConfig::default().validated().expect("defaults must validate");
        assert_that!(config.backend, eq(EngineBackend::InMemory));
        assert_that!(config.proc_pool_default_size, eq(5_usize));
        assert_that!(config.finished_txn_gc, eq(Duration::from_secs(2)));
        assert_that!(config.max_txn_gc_per_poll, eq(10_usize));
    }

    #[rstest]
    fn oversized_poll_timeout_is_clamped() {
        let config = SiteConfig {
            work_poll_timeout: Duration::from_secs(30),
            ..SiteConfig::default()
        };
        let config = config.validated().expect("clamping must not fail");
        assert_that!(config.work_poll_timeout, eq(MAX_WORK_POLL_TIMEOUT));
    }

    #[rstest]
    fn zero_procedure_pool_is_rejected() {
        let config = SiteConfig {
            proc_pool_default_size: 0,
            ..SiteConfig::default()
        };
        assert_that!(config.validated().is_err(), eq(true));
    }
}
