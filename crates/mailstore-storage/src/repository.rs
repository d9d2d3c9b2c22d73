//! Repository layer for data access

pub mod acl;
pub mod aliases;
pub mod mailboxes;
pub mod messages;
pub mod sieve_scripts;
pub mod users;

// Re-export repository traits
pub use acl::AclRepository;
pub use aliases::AliasRepository;
pub use mailboxes::MailboxRepository;
pub use messages::MessageRepository;
pub use sieve_scripts::SieveScriptRepository;
pub use users::UserRepository;

// Re-export database implementations
pub use acl::DbAclRepository;
pub use aliases::DbAliasRepository;
pub use mailboxes::DbMailboxRepository;
pub use messages::DbMessageRepository;
pub use sieve_scripts::DbSieveScriptRepository;
pub use users::DbUserRepository;
