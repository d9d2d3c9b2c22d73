//! mailstore core - mailbox state, search, access control and the
//! IMAP, POP3, LMTP and ManageSieve servers
//!
//! Every server shares one [`Backends`] context: the storage, the
//! authentication driver and the delivery-time sort driver, all chosen
//! by configuration at startup.

pub mod acl;
pub mod auth;
pub mod backend;
pub mod cidr;
pub mod delivery;
pub mod imap;
pub mod listener;
pub mod lmtp;
pub mod mailbox;
pub mod managesieve;
pub mod ordered_set;
pub mod pop3;
pub mod quota;
pub mod relay;
pub mod search;
pub mod sequence;
pub mod session;
pub mod sort;

pub use backend::Backends;
pub use imap::ImapServer;
pub use lmtp::LmtpServer;
pub use managesieve::ManageSieveServer;
pub use pop3::Pop3Server;
