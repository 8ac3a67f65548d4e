//! Database access for fsr-core
//!
//! Schema creation lives in `fsr_common::db::init`; the modules here are
//! the queries, written as free functions over a `SqlitePool`.

pub mod audit;
pub mod batches;
pub mod operator_queue;
pub mod responses;

pub use fsr_common::db::init::{init_database, init_memory_database};
