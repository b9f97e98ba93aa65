//! Typed bounded object pools for hot per-transaction structures.
//!
//! Pools are site-scoped: every component that acquires or releases objects
//! receives its pool by `Arc` from the site supervisor. Observability goes
//! through an explicit [`PoolRegistry`] populated at pool construction.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{KilnError, KilnResult};

/// Contract for objects that cycle through an [`ObjectPool`].
///
/// An instance is handed out armed, used for exactly one transaction (or
/// RPC wave), then [`reset`](Reusable::reset) back to idle before release.
pub trait Reusable: Send {
    /// Returns the instance to its idle state, dropping transaction-scoped
    /// payload.
    fn reset(&mut self);

    /// Returns whether the instance is idle and safe to hand to another
    /// owner.
    fn is_idle(&self) -> bool;
}

/// Point-in-time snapshot of one pool's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Registry name of the pool.
    pub name: &'static str,
    /// Instances constructed by the factory.
    pub created: usize,
    /// Acquires served from the idle list.
    pub hits: usize,
    /// Acquires that had to construct a fresh instance.
    pub misses: usize,
    /// Instances returned to the idle list.
    pub returned: usize,
    /// Instances dropped because the idle list was at capacity.
    pub dropped: usize,
    /// Largest idle-list size observed.
    pub high_water: usize,
    /// Current idle-list size.
    pub idle: usize,
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicUsize,
    hits: AtomicUsize,
    misses: AtomicUsize,
    returned: AtomicUsize,
    dropped: AtomicUsize,
    high_water: AtomicUsize,
}

impl PoolCounters {
    fn observe_high_water(&self, idle_len: usize) {
        let _ = self.high_water.fetch_max(idle_len, Ordering::AcqRel);
    }
}

/// Typed bounded pool for one reusable class.
///
/// Acquire pops the idle stack or constructs through the stored factory;
/// release validates the instance is idle and returns it unless the idle cap
/// is reached. All operations serialize behind one short mutex section.
pub struct ObjectPool<T: Reusable> {
    name: &'static str,
    idle_cap: usize,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    idle: Mutex<Vec<T>>,
    counters: Option<PoolCounters>,
}

impl<T: Reusable> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("name", &self.name)
            .field("idle_cap", &self.idle_cap)
            .field("profiling", &self.counters.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Reusable> ObjectPool<T> {
    /// Creates a pool with the given idle-list cap and instance factory.
    ///
    /// Profiling counters are allocated only when `profiling` is set.
    pub fn new<F>(name: &'static str, idle_cap: usize, profiling: bool, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            name,
            idle_cap,
            factory: Box::new(factory),
            idle: Mutex::new(Vec::new()),
            counters: profiling.then(PoolCounters::default),
        }
    }

    /// Registry name of this pool.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Hands out an idle instance, constructing one when the idle list is
    /// empty.
    pub fn acquire(&self) -> T {
        let popped = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match popped {
            Some(instance) => {
                if let Some(counters) = &self.counters {
                    let _ = counters.hits.fetch_add(1, Ordering::AcqRel);
                }
                instance
            }
            None => {
                if let Some(counters) = &self.counters {
                    let _ = counters.misses.fetch_add(1, Ordering::AcqRel);
                    let _ = counters.created.fetch_add(1, Ordering::AcqRel);
                }
                (self.factory)()
            }
        }
    }

    /// Returns an instance to the idle list.
    ///
    /// Instances above the idle cap are dropped instead of retained.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidState`] when the instance was not reset
    /// to idle before release; the instance is dropped in that case so a
    /// misbehaving caller cannot poison the idle list.
    pub fn release(&self, instance: T) -> KilnResult<()> {
        if !instance.is_idle() {
            return Err(KilnError::InvalidState(
                "released pool instance is not idle",
            ));
        }
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() >= self.idle_cap {
            if let Some(counters) = &self.counters {
                let _ = counters.dropped.fetch_add(1, Ordering::AcqRel);
            }
            return Ok(());
        }
        idle.push(instance);
        if let Some(counters) = &self.counters {
            let _ = counters.returned.fetch_add(1, Ordering::AcqRel);
            counters.observe_high_water(idle.len());
        }
        Ok(())
    }

    /// Current idle-list size.
    #[must_use]
    pub fn idle_len(&self) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Read-only observation surface shared by all pool types.
pub trait PoolObserver: Send + Sync {
    /// Snapshots the pool's counters.
    fn stats(&self) -> PoolStats;
}

impl<T: Reusable> PoolObserver for ObjectPool<T> {
    fn stats(&self) -> PoolStats {
        let idle = self.idle_len();
        match &self.counters {
            Some(counters) => PoolStats {
                name: self.name,
                created: counters.created.load(Ordering::Acquire),
                hits: counters.hits.load(Ordering::Acquire),
                misses: counters.misses.load(Ordering::Acquire),
                returned: counters.returned.load(Ordering::Acquire),
                dropped: counters.dropped.load(Ordering::Acquire),
                high_water: counters.high_water.load(Ordering::Acquire),
                idle,
            },
            None => PoolStats {
                name: self.name,
                created: 0,
                hits: 0,
                misses: 0,
                returned: 0,
                dropped: 0,
                high_water: 0,
                idle,
            },
        }
    }
}

/// Explicit name-ordered registry of every pool a site constructed.
#[derive(Default)]
pub struct PoolRegistry {
    entries: Mutex<Vec<Arc<dyn PoolObserver>>>,
}

impl fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("pools", &self.snapshot().len())
            .finish()
    }
}

impl PoolRegistry {
    /// Adds one pool to the registry. Called once per pool at construction.
    pub fn register(&self, pool: Arc<dyn PoolObserver>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(pool);
    }

    /// Snapshots every registered pool, in registration order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PoolStats> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|pool| pool.stats())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{ObjectPool, PoolObserver, PoolRegistry, Reusable};
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Probe {
        serial: usize,
        armed: bool,
    }

    impl Reusable for Probe {
        fn reset(&mut self) {
            self.armed = false;
        }

        fn is_idle(&self) -> bool {
            !self.armed
        }
    }

    fn probe_pool(idle_cap: usize, profiling: bool) -> ObjectPool<Probe> {
        let serials = AtomicUsize::new(0);
        ObjectPool::new("probes", idle_cap, profiling, move || Probe {
            serial: serials.fetch_add(1, Ordering::AcqRel),
            armed: false,
        })
    }

    #[rstest]
    fn acquire_after_release_reuses_same_instance() {
        let pool = probe_pool(8, false);
        let mut first = pool.acquire();
        let first_serial = first.serial;
        first.armed = true;

        first.reset();
        pool.release(first).expect("idle instance must be accepted");

        let second = pool.acquire();
        assert_that!(second.serial, eq(first_serial));
    }

    #[rstest]
    fn release_rejects_armed_instance() {
        let pool = probe_pool(8, false);
        let mut probe = pool.acquire();
        probe.armed = true;

        assert_that!(pool.release(probe).is_err(), eq(true));
        assert_that!(pool.idle_len(), eq(0_usize));
    }

    #[rstest]
    fn idle_cap_drops_excess_instances() {
        let pool = probe_pool(1, true);
        let first = pool.acquire();
        let second = pool.acquire();

        pool.release(first).expect("first release fits under the cap");
        pool.release(second).expect("over-cap release drops silently");

        assert_that!(pool.idle_len(), eq(1_usize));
        let stats = pool.stats();
        assert_that!(stats.dropped, eq(1_usize));
        assert_that!(stats.returned, eq(1_usize));
    }

    #[rstest]
    fn profiling_counters_track_hits_and_misses() {
        let pool = probe_pool(8, true);
        let probe = pool.acquire();
        pool.release(probe).expect("idle instance must be accepted");
        let _ = pool.acquire();

        let stats = pool.stats();
        assert_that!(stats.misses, eq(1_usize));
        assert_that!(stats.hits, eq(1_usize));
        assert_that!(stats.created, eq(1_usize));
        assert_that!(stats.high_water, eq(1_usize));
    }

    #[rstest]
    fn registry_snapshots_pools_in_registration_order() {
        let registry = PoolRegistry::default();
        let pool: Arc<ObjectPool<Probe>> = Arc::new(probe_pool(4, true));
        registry.register(Arc::clone(&pool) as Arc<dyn PoolObserver>);

        let snapshot = registry.snapshot();
        assert_that!(snapshot.len(), eq(1_usize));
        assert_that!(snapshot[0].name, eq("probes"));
    }
}
