//! Shared infrastructure for the kiln execution engine: identifier types,
//! the unified error model, site configuration, object pools, and the
//! count-down latch used for round gating.

pub mod config;
pub mod error;
pub mod ids;
pub mod latch;
pub mod pool;
