//! POP3 Server Module
//!
//! Post Office Protocol version 3 access to each user's INBOX.

mod command;
mod response;
mod server;
mod session;

pub use server::{handle_connection, Pop3Server};
