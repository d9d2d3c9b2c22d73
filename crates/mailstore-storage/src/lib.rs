//! mailstore storage - repositories over PostgreSQL or memory
//!
//! This crate provides the storage abstraction for mailstore: the row
//! models, one repository trait per table group, PostgreSQL and
//! in-memory implementations of each, and the search predicates the
//! engine pushes down to the backend.

pub mod db;
pub mod memory;
pub mod models;
pub mod predicate;
pub mod repository;
pub mod store;

pub use db::{Database, DatabasePool};
pub use memory::MemoryStore;
pub use models::*;
pub use predicate::{AgeOp, DateOp, Dialect, FlagName, PgDialect, SearchPredicate, SizeOp};
pub use repository::*;
pub use store::Store;
