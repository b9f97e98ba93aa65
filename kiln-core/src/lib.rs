//! Core types shared by the transaction, storage, and site layers: the row
//! and table value model, work messages drained by partition executors,
//! fragment and client responses, the storage-engine seam, and the
//! system-procedure registry.

pub mod engine;
pub mod message;
pub mod response;
pub mod sysproc;
pub mod table;
