//! System-procedure fragment registration.
//!
//! Sysproc fragments are handled by registered native code instead of the
//! general query engine. Handlers register per fragment id; the executor
//! routes a sysproc-flagged batch to the handler owning its fragment id.

use std::sync::Arc;

use hashbrown::HashMap;

use kiln_common::error::{KilnError, KilnResult};
use kiln_common::ids::{DependencyId, FragmentId, PartitionId, TxnId};

use crate::table::{DependencySet, Table, Value};

/// Execution-site state a system procedure is granted access to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysProcContext {
    /// Partition the fragment executes on.
    pub partition: PartitionId,
    /// Highest transaction id committed on that partition.
    pub last_committed: TxnId,
}

/// Handler for system-procedure plan fragments.
pub trait SystemProcedure: Send + Sync {
    /// Executes one sysproc fragment and returns its dependency set.
    ///
    /// # Errors
    ///
    /// Returns an error when the fragment fails; the executor wraps it into
    /// a failed fragment response.
    fn execute_plan_fragment(
        &self,
        txn_id: TxnId,
        deps: &[(DependencyId, Vec<Table>)],
        fragment_id: FragmentId,
        params: &[Value],
        ctx: &SysProcContext,
    ) -> KilnResult<DependencySet>;
}

/// Fragment-id-keyed registry of system-procedure handlers.
#[derive(Default)]
pub struct SysProcRegistry {
    handlers: HashMap<FragmentId, Arc<dyn SystemProcedure>>,
}

impl std::fmt::Debug for SysProcRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysProcRegistry")
            .field("fragments", &self.handlers.len())
            .finish()
    }
}

impl SysProcRegistry {
    /// Registers a handler for one fragment id.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidState`] when the fragment id already has
    /// a handler.
    pub fn register(
        &mut self,
        fragment_id: FragmentId,
        handler: Arc<dyn SystemProcedure>,
    ) -> KilnResult<()> {
        if self.handlers.contains_key(&fragment_id) {
            return Err(KilnError::InvalidState(
                "sysproc fragment id is already registered",
            ));
        }
        let _ = self.handlers.insert(fragment_id, handler);
        Ok(())
    }

    /// Looks up the handler for one fragment id.
    #[must_use]
    pub fn lookup(&self, fragment_id: FragmentId) -> Option<Arc<dyn SystemProcedure>> {
        self.handlers.get(&fragment_id).cloned()
    }
}
