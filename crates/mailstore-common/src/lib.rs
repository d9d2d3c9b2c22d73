//! mailstore common - shared types and utilities
//!
//! Error taxonomy, configuration and the identifier, flag and ACL types
//! shared by the storage layer, the core engine and the server binary.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
