//! In-memory storage backend for kiln.
//!
//! [`MemoryEngine`] implements the engine seam with integer-indexed tables,
//! a registry of compiled fragment handlers, and a LIFO undo log. Every
//! trait call is recorded with its calling thread so tests can verify the
//! single-writer and undo-monotonicity properties.

mod memory;

pub use memory::{EngineCall, FragmentHandler, FragmentScope, MemoryEngine};
