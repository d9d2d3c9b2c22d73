//! ManageSieve Server Module
//!
//! Remote management of the Sieve scripts run at delivery.

mod command;
mod response;
mod server;

pub use server::{handle_connection, ManageSieveServer};
