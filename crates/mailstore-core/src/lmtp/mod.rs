//! LMTP Server Module
//!
//! Local delivery over LMTP (RFC 2033): every accepted recipient gets its
//! own reply after the message data.

mod command;
mod server;

pub use server::{handle_connection, LmtpServer};
