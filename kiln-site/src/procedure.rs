//! Stored-procedure host types.
//!
//! Each registered procedure name has a bounded pool of reusable instances
//! on every partition executor. The executor loans one instance to a
//! transaction for its lifetime and calls it on the executor thread; the
//! body runs straight-line, dispatching fragment batches and blocking
//! synchronously on their results. Aborts and mispredicts are structured
//! failure values, not unwinding.

use hashbrown::HashMap;

use kiln_common::error::{KilnError, KilnResult};
use kiln_common::ids::{DependencyId, FragmentId, PartitionId};
use kiln_core::table::{Table, Value};

use crate::executor::ProcedureContext;

/// Structured failure of a procedure body.
#[derive(Debug)]
pub enum ProcedureFailure {
    /// The procedure rolled the transaction back on purpose.
    Abort(String),
    /// An execution error propagated out of a batch: engine faults, SQL
    /// errors, or a single-partition misprediction.
    Error(KilnError),
}

impl From<KilnError> for ProcedureFailure {
    fn from(error: KilnError) -> Self {
        Self::Error(error)
    }
}

/// Outcome of one procedure invocation: result tables in declaration order,
/// or a structured failure.
pub type ProcedureResult = Result<Vec<Table>, ProcedureFailure>;

/// One fragment of a batch as a procedure declares it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFragment {
    /// Partition that must execute the fragment.
    pub destination: PartitionId,
    /// Compiled fragment id.
    pub fragment_id: FragmentId,
    /// Fragment parameters.
    pub params: Vec<Value>,
    /// Dependencies the fragment consumes, produced earlier in the batch.
    pub input_dep_ids: Vec<DependencyId>,
    /// Dependency the fragment produces.
    pub output_dep_id: DependencyId,
    /// Whether the fragment routes to a registered system procedure.
    pub sysproc: bool,
}

impl PlannedFragment {
    /// Declares a parameterless fragment with no input dependencies.
    #[must_use]
    pub fn new(
        destination: PartitionId,
        fragment_id: FragmentId,
        output_dep_id: DependencyId,
    ) -> Self {
        Self {
            destination,
            fragment_id,
            params: Vec::new(),
            input_dep_ids: Vec::new(),
            output_dep_id,
            sysproc: false,
        }
    }

    /// Sets the fragment parameters.
    #[must_use]
    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    /// Declares input dependencies consumed by this fragment.
    #[must_use]
    pub fn with_inputs(mut self, input_dep_ids: Vec<DependencyId>) -> Self {
        self.input_dep_ids = input_dep_ids;
        self
    }
}

/// A reusable stored-procedure instance.
///
/// `call` runs on the partition executor thread. The body may dispatch
/// fragment batches through the context and blocks inside
/// `execute_batch` until their dependencies are satisfied.
pub trait StoredProcedure: Send {
    /// Runs the procedure body for one transaction.
    fn call(&mut self, ctx: &mut ProcedureContext<'_>, params: &[Value]) -> ProcedureResult;
}

/// Factory producing fresh procedure instances for the per-name pools.
pub type ProcedureFactory = Box<dyn Fn() -> Box<dyn StoredProcedure> + Send + Sync>;

/// One procedure registration handed to the site at build time.
pub struct ProcedureRegistration {
    /// Procedure name clients invoke.
    pub name: String,
    /// Instance-pool size override; system-procedure hosts pin this to 1.
    pub pool_size: Option<usize>,
    /// Instance factory.
    pub factory: ProcedureFactory,
}

impl ProcedureRegistration {
    /// Registers a procedure with the default pool size.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn StoredProcedure> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            pool_size: None,
            factory: Box::new(factory),
        }
    }

    /// Overrides the instance-pool size for this procedure.
    #[must_use]
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = Some(pool_size);
        self
    }
}

struct ProcedureSpec {
    pool_size: Option<usize>,
    factory: ProcedureFactory,
}

/// Name-keyed registry of procedure factories, shared by every executor.
pub struct ProcedureRegistry {
    specs: HashMap<String, ProcedureSpec>,
}

impl std::fmt::Debug for ProcedureRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcedureRegistry")
            .field("procedures", &self.specs.len())
            .finish()
    }
}

impl ProcedureRegistry {
    /// Builds the registry from site registrations.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::InvalidConfig`] on a duplicate procedure name.
    pub fn new(registrations: Vec<ProcedureRegistration>) -> KilnResult<Self> {
        let mut specs = HashMap::new();
        for registration in registrations {
            if specs.contains_key(&registration.name) {
                return Err(KilnError::InvalidConfig(
                    "procedure name is registered twice",
                ));
            }
            let _ = specs.insert(
                registration.name,
                ProcedureSpec {
                    pool_size: registration.pool_size,
                    factory: registration.factory,
                },
            );
        }
        Ok(Self { specs })
    }

    /// Registered procedure names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.specs.keys().cloned().collect()
    }

    /// Constructs one fresh instance of a procedure.
    #[must_use]
    pub fn create(&self, name: &str) -> Option<Box<dyn StoredProcedure>> {
        self.specs.get(name).map(|spec| (spec.factory)())
    }

    /// Instance-pool size for one procedure, falling back to the site
    /// default.
    #[must_use]
    pub fn pool_size(&self, name: &str, default_size: usize) -> usize {
        self.specs
            .get(name)
            .and_then(|spec| spec.pool_size)
            .unwrap_or(default_size)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::{ProcedureRegistration, ProcedureRegistry, ProcedureResult, StoredProcedure};
    use crate::executor::ProcedureContext;
    use googletest::prelude::*;
    use kiln_core::table::Value;
    use rstest::rstest;

    struct NoopProcedure;

    impl StoredProcedure for NoopProcedure {
        fn call(&mut self, _ctx: &mut ProcedureContext<'_>, _params: &[Value]) -> ProcedureResult {
            Ok(Vec::new())
        }
    }

    #[rstest]
    fn duplicate_names_are_rejected() {
        let result = ProcedureRegistry::new(vec![
            ProcedureRegistration::new("Echo", || Box::new(NoopProcedure)),
            ProcedureRegistration::new("Echo", || Box::new(NoopProcedure)),
        ]);
        assert_that!(result.is_err(), eq(true));
    }

    #[rstest]
    fn pool_size_override_beats_the_default() {
        let registry = ProcedureRegistry::new(vec![
            ProcedureRegistration::new("Echo", || Box::new(NoopProcedure)),
            ProcedureRegistration::new("Stats", || Box::new(NoopProcedure)).with_pool_size(1),
        ])
        .expect("distinct names must register");

        assert_that!(registry.pool_size("Echo", 5), eq(5_usize));
        assert_that!(registry.pool_size("Stats", 5), eq(1_usize));
        assert_that!(registry.create("Echo").is_some(), eq(true));
        assert_that!(registry.create("Missing").is_none(), eq(true));
    }
}
