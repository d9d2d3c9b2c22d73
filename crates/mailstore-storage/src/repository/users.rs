//! User repository

use crate::db::DatabasePool;
use crate::models::User;
use async_trait::async_trait;
use sqlx::Row;
use mailstore_common::types::UserId;
use mailstore_common::{Error, Result};

/// User repository trait
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get(&self, id: UserId) -> Result<Option<User>>;
    async fn find_by_name(&self, name: &str) -> Result<Option<User>>;
    async fn create(&self, name: &str, password_hash: &str) -> Result<User>;

    /// Set the storage quota in bytes; 0 removes it
    async fn set_max_mail_size(&self, id: UserId, bytes: u64) -> Result<()>;

    /// Total size of the messages in every mailbox the user owns
    async fn storage_used(&self, id: UserId) -> Result<u64>;
}

/// Database user repository
pub struct DbUserRepository {
    pool: DatabasePool,
}

impl DbUserRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for DbUserRepository {
    async fn get(&self, id: UserId) -> Result<Option<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Storage(e.to_string()))
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE name = $1")
            .bind(name)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Storage(e.to_string()))
    }

    async fn create(&self, name: &str, password_hash: &str) -> Result<User> {
        sqlx::query_as::<_, User>(
            "INSERT INTO users (name, password_hash) VALUES ($1, $2) RETURNING *",
        )
        .bind(name)
        .bind(password_hash)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Storage(e.to_string()))
    }

    async fn set_max_mail_size(&self, id: UserId, bytes: u64) -> Result<()> {
        let result = sqlx::query("UPDATE users SET max_mail_size = $2 WHERE id = $1")
            .bind(id)
            .bind(bytes.min(i64::MAX as u64) as i64)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("user {}", id)));
        }
        Ok(())
    }

    async fn storage_used(&self, id: UserId) -> Result<u64> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(m.size), 0)::BIGINT AS used FROM messages m
            JOIN mailboxes b ON b.id = m.mailbox_id
            WHERE b.owner_id = $1
            "#,
        )
        .bind(id)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        let used: i64 = row.get("used");
        Ok(used.max(0) as u64)
    }
}
