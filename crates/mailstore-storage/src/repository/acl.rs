//! Mailbox ACL repository

use crate::db::DatabasePool;
use crate::models::AclRow;
use async_trait::async_trait;
use mailstore_common::types::{AclMap, MailboxId, UserId};
use mailstore_common::{Error, Result};

/// ACL repository trait
#[async_trait]
pub trait AclRepository: Send + Sync {
    /// Rights row for one user, if any
    async fn get(&self, mailbox_id: MailboxId, user_id: UserId) -> Result<Option<AclMap>>;

    /// Insert or overwrite a rights row
    async fn set(&self, mailbox_id: MailboxId, user_id: UserId, rights: &AclMap) -> Result<()>;

    async fn delete(&self, mailbox_id: MailboxId, user_id: UserId) -> Result<()>;

    /// Every rights row of a mailbox, keyed by user name
    async fn list(&self, mailbox_id: MailboxId) -> Result<Vec<(String, AclMap)>>;
}

/// Database ACL repository
pub struct DbAclRepository {
    pool: DatabasePool,
}

impl DbAclRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

const ACL_COLUMNS: &str = "lookup_flag, read_flag, seen_flag, write_flag, insert_flag, \
                           post_flag, create_flag, delete_flag, administer_flag";

#[async_trait]
impl AclRepository for DbAclRepository {
    async fn get(&self, mailbox_id: MailboxId, user_id: UserId) -> Result<Option<AclMap>> {
        let sql = format!(
            "SELECT u.name AS identifier, {} FROM acl a JOIN users u ON u.id = a.user_id \
             WHERE a.mailbox_id = $1 AND a.user_id = $2",
            ACL_COLUMNS
        );
        let row = sqlx::query_as::<_, AclRow>(&sql)
            .bind(mailbox_id)
            .bind(user_id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        Ok(row.map(|r| r.into_map().1))
    }

    async fn set(&self, mailbox_id: MailboxId, user_id: UserId, rights: &AclMap) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO acl (user_id, mailbox_id, {cols})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (user_id, mailbox_id) DO UPDATE SET
                lookup_flag = EXCLUDED.lookup_flag,
                read_flag = EXCLUDED.read_flag,
                seen_flag = EXCLUDED.seen_flag,
                write_flag = EXCLUDED.write_flag,
                insert_flag = EXCLUDED.insert_flag,
                post_flag = EXCLUDED.post_flag,
                create_flag = EXCLUDED.create_flag,
                delete_flag = EXCLUDED.delete_flag,
                administer_flag = EXCLUDED.administer_flag
            "#,
            cols = ACL_COLUMNS
        );

        sqlx::query(&sql)
            .bind(user_id)
            .bind(mailbox_id)
            .bind(rights.lookup)
            .bind(rights.read)
            .bind(rights.seen)
            .bind(rights.write)
            .bind(rights.insert)
            .bind(rights.post)
            .bind(rights.create)
            .bind(rights.delete)
            .bind(rights.administer)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, mailbox_id: MailboxId, user_id: UserId) -> Result<()> {
        sqlx::query("DELETE FROM acl WHERE mailbox_id = $1 AND user_id = $2")
            .bind(mailbox_id)
            .bind(user_id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    async fn list(&self, mailbox_id: MailboxId) -> Result<Vec<(String, AclMap)>> {
        let sql = format!(
            "SELECT u.name AS identifier, {} FROM acl a JOIN users u ON u.id = a.user_id \
             WHERE a.mailbox_id = $1 ORDER BY u.name ASC",
            ACL_COLUMNS
        );
        let rows = sqlx::query_as::<_, AclRow>(&sql)
            .bind(mailbox_id)
            .fetch_all(self.pool.pool())
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        Ok(rows.into_iter().map(AclRow::into_map).collect())
    }
}
