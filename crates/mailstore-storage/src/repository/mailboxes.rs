//! Mailbox repository

use crate::db::DatabasePool;
use crate::models::Mailbox;
use async_trait::async_trait;
use mailstore_common::types::{MailboxId, MailboxPermission, UserId, ANYONE_USER};
use mailstore_common::{Error, Result};

/// Mailbox repository trait
#[async_trait]
pub trait MailboxRepository: Send + Sync {
    async fn get(&self, id: MailboxId) -> Result<Option<Mailbox>>;
    async fn find_by_name(&self, owner_id: UserId, name: &str) -> Result<Option<Mailbox>>;

    /// Mailboxes owned by the user plus those shared with them (or with
    /// everyone) through a lookup grant, ordered by name.
    async fn list_visible(&self, user_id: UserId) -> Result<Vec<Mailbox>>;

    async fn create(
        &self,
        owner_id: UserId,
        name: &str,
        permission: MailboxPermission,
    ) -> Result<Mailbox>;
    async fn rename(&self, id: MailboxId, name: &str) -> Result<()>;
    async fn set_subscribed(&self, id: MailboxId, subscribed: bool) -> Result<()>;
    async fn delete(&self, id: MailboxId) -> Result<()>;
}

/// Database mailbox repository
pub struct DbMailboxRepository {
    pool: DatabasePool,
}

impl DbMailboxRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MailboxRepository for DbMailboxRepository {
    async fn get(&self, id: MailboxId) -> Result<Option<Mailbox>> {
        sqlx::query_as::<_, Mailbox>("SELECT * FROM mailboxes WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Storage(e.to_string()))
    }

    async fn find_by_name(&self, owner_id: UserId, name: &str) -> Result<Option<Mailbox>> {
        sqlx::query_as::<_, Mailbox>(
            "SELECT * FROM mailboxes WHERE owner_id = $1 AND name = $2",
        )
        .bind(owner_id)
        .bind(name)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Storage(e.to_string()))
    }

    async fn list_visible(&self, user_id: UserId) -> Result<Vec<Mailbox>> {
        sqlx::query_as::<_, Mailbox>(
            r#"
            SELECT * FROM mailboxes
            WHERE owner_id = $1
               OR id IN (
                   SELECT a.mailbox_id FROM acl a
                   JOIN users u ON u.id = a.user_id
                   WHERE (a.user_id = $1 OR u.name = $2) AND a.lookup_flag
               )
            ORDER BY name ASC
            "#,
        )
        .bind(user_id)
        .bind(ANYONE_USER)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Storage(e.to_string()))
    }

    async fn create(
        &self,
        owner_id: UserId,
        name: &str,
        permission: MailboxPermission,
    ) -> Result<Mailbox> {
        sqlx::query_as::<_, Mailbox>(
            r#"
            INSERT INTO mailboxes (owner_id, name, permission)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(owner_id)
        .bind(name)
        .bind(permission.code())
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Storage(e.to_string()))
    }

    async fn rename(&self, id: MailboxId, name: &str) -> Result<()> {
        sqlx::query("UPDATE mailboxes SET name = $2 WHERE id = $1")
            .bind(id)
            .bind(name)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    async fn set_subscribed(&self, id: MailboxId, subscribed: bool) -> Result<()> {
        sqlx::query("UPDATE mailboxes SET subscribed = $2 WHERE id = $1")
            .bind(id)
            .bind(subscribed)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, id: MailboxId) -> Result<()> {
        sqlx::query("DELETE FROM mailboxes WHERE id = $1")
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }
}
