//! Storage context handed to sessions and delivery

use crate::db::{Database, DatabasePool};
use crate::memory::MemoryStore;
use crate::repository::{
    AclRepository, AliasRepository, DbAclRepository, DbAliasRepository, DbMailboxRepository,
    DbMessageRepository, DbSieveScriptRepository, DbUserRepository, MailboxRepository,
    MessageRepository, SieveScriptRepository, UserRepository,
};
use mailstore_common::Result;
use std::sync::Arc;

/// Every repository behind one cloneable handle
#[derive(Clone)]
pub struct Store {
    pub users: Arc<dyn UserRepository>,
    pub mailboxes: Arc<dyn MailboxRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub acl: Arc<dyn AclRepository>,
    pub aliases: Arc<dyn AliasRepository>,
    pub scripts: Arc<dyn SieveScriptRepository>,
    database: Arc<dyn Database>,
}

impl Store {
    /// Repositories backed by PostgreSQL
    pub fn postgres(pool: DatabasePool) -> Self {
        Self {
            users: Arc::new(DbUserRepository::new(pool.clone())),
            mailboxes: Arc::new(DbMailboxRepository::new(pool.clone())),
            messages: Arc::new(DbMessageRepository::new(pool.clone())),
            acl: Arc::new(DbAclRepository::new(pool.clone())),
            aliases: Arc::new(DbAliasRepository::new(pool.clone())),
            scripts: Arc::new(DbSieveScriptRepository::new(pool.clone())),
            database: Arc::new(pool),
        }
    }

    /// Repositories backed by one in-memory store
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            users: store.clone(),
            mailboxes: store.clone(),
            messages: store.clone(),
            acl: store.clone(),
            aliases: store.clone(),
            scripts: store.clone(),
            database: store,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.database.backend_name()
    }

    /// Check that the backend still answers
    pub async fn health_check(&self) -> Result<()> {
        self.database.health_check().await
    }
}
