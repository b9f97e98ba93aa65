//! Site-scoped pool container.
//!
//! One instance per site process, passed by `Arc` to every component that
//! acquires or releases pooled objects. Construction registers each pool in
//! the registry, so the observability snapshot never needs to enumerate
//! fields.

use std::sync::Arc;

use kiln_common::config::PoolIdleCaps;
use kiln_common::pool::{ObjectPool, PoolObserver, PoolRegistry, PoolStats};

use crate::callback::RedirectCallback;
use crate::dependency::DependencyInfo;
use crate::state::TransactionState;

/// All pooled object classes of one site.
#[derive(Debug)]
pub struct SitePools {
    registry: PoolRegistry,
    txn_local: Arc<ObjectPool<TransactionState>>,
    txn_remote: Arc<ObjectPool<TransactionState>>,
    dependency: Arc<ObjectPool<DependencyInfo>>,
    redirect: Arc<ObjectPool<RedirectCallback>>,
}

impl SitePools {
    /// Builds the pool container and registers every pool.
    #[must_use]
    pub fn new(caps: &PoolIdleCaps, profiling: bool) -> Arc<Self> {
        let registry = PoolRegistry::default();
        let txn_local = Arc::new(ObjectPool::new(
            "states.txn.local",
            caps.txn_local,
            profiling,
            TransactionState::default,
        ));
        let txn_remote = Arc::new(ObjectPool::new(
            "states.txn.remote",
            caps.txn_remote,
            profiling,
            TransactionState::default,
        ));
        let dependency = Arc::new(ObjectPool::new(
            "states.dependency",
            caps.dependency,
            profiling,
            DependencyInfo::default,
        ));
        let redirect = Arc::new(ObjectPool::new(
            "callbacks.redirect",
            caps.callback,
            profiling,
            RedirectCallback::default,
        ));

        registry.register(Arc::clone(&txn_local) as Arc<dyn PoolObserver>);
        registry.register(Arc::clone(&txn_remote) as Arc<dyn PoolObserver>);
        registry.register(Arc::clone(&dependency) as Arc<dyn PoolObserver>);
        registry.register(Arc::clone(&redirect) as Arc<dyn PoolObserver>);

        Arc::new(Self {
            registry,
            txn_local,
            txn_remote,
            dependency,
            redirect,
        })
    }

    /// Pool of Local-role transaction states.
    #[must_use]
    pub fn txn_local(&self) -> &Arc<ObjectPool<TransactionState>> {
        &self.txn_local
    }

    /// Pool of Remote-role transaction states.
    #[must_use]
    pub fn txn_remote(&self) -> &Arc<ObjectPool<TransactionState>> {
        &self.txn_remote
    }

    /// Pool of dependency tracking records.
    #[must_use]
    pub fn dependency(&self) -> &Arc<ObjectPool<DependencyInfo>> {
        &self.dependency
    }

    /// Pool of redirect callbacks.
    #[must_use]
    pub fn redirect(&self) -> &Arc<ObjectPool<RedirectCallback>> {
        &self.redirect
    }

    /// Snapshots every pool, in registration order.
    #[must_use]
    pub fn stats(&self) -> Vec<PoolStats> {
        self.registry.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::SitePools;
    use googletest::prelude::*;
    use kiln_common::config::PoolIdleCaps;
    use rstest::rstest;

    #[rstest]
    fn every_pool_is_registered_at_construction() {
        let pools = SitePools::new(&PoolIdleCaps::default(), true);
        let names = pools
            .stats()
            .into_iter()
            .map(|stats| stats.name)
            .collect::<Vec<_>>();
        assert_that!(
            &names,
            eq(&vec![
                "states.txn.local",
                "states.txn.remote",
                "states.dependency",
                "callbacks.redirect",
            ])
        );
    }

    #[rstest]
    fn acquired_state_returns_to_its_own_pool() {
        let pools = SitePools::new(&PoolIdleCaps::default(), true);
        let state = pools.txn_local().acquire();
        pools
            .txn_local()
            .release(state)
            .expect("idle state must be accepted");
        let stats = pools.stats();
        assert_that!(stats[0].returned, eq(1_usize));
    }
}
