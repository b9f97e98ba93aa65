//! Site process of the kiln execution engine.
//!
//! A site hosts one single-threaded executor per partition. Executors drain
//! typed work queues, run stored procedures on their own thread, execute
//! plan fragments against an exclusively-owned storage engine, and
//! cooperate through the coordinator to run distributed transactions with
//! a prepare/finish conclusion. The site supervisor owns the executor
//! threads, the object pools, and the in-process messenger.

pub mod coordinator;
pub mod executor;
pub mod messenger;
pub mod procedure;
pub mod site;
