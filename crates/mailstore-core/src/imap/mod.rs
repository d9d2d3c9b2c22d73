//! IMAP4 Server Module
//!
//! IMAP4rev1 access to the mail store, with the ACL, NAMESPACE and SORT
//! extensions and non-synchronizing literals.
//!
//! Supported commands:
//! - CAPABILITY, NOOP, LOGOUT
//! - LOGIN, AUTHENTICATE (PLAIN)
//! - SELECT, EXAMINE, CREATE, DELETE, RENAME, SUBSCRIBE, UNSUBSCRIBE
//! - LIST, LSUB, STATUS, APPEND, NAMESPACE
//! - GETACL, SETACL, DELETEACL, MYRIGHTS, LISTRIGHTS
//! - CHECK, CLOSE, EXPUNGE, SEARCH, SORT, FETCH, STORE, COPY and their UID forms

pub mod command;
pub mod handler;
pub mod parser;
pub mod response;
pub mod search;
pub mod server;
pub mod session;

pub use server::{handle_connection, ImapServer};
