//! Sieve script repository

use crate::db::DatabasePool;
use crate::models::SieveScript;
use async_trait::async_trait;
use mailstore_common::types::UserId;
use mailstore_common::{Error, Result};

#[async_trait]
pub trait SieveScriptRepository: Send + Sync {
    /// The script run for incoming mail, if the user has one active
    async fn active(&self, owner_id: UserId) -> Result<Option<SieveScript>>;

    /// Every script of the user, by name
    async fn list(&self, owner_id: UserId) -> Result<Vec<SieveScript>>;

    async fn get(&self, owner_id: UserId, name: &str) -> Result<Option<SieveScript>>;

    /// Store a script; activating it deactivates the others
    async fn put(&self, owner_id: UserId, name: &str, script: &str, activate: bool) -> Result<()>;

    /// Make `name` the only active script, or deactivate all of them with
    /// `None`. Fails with `NotFound` if the named script does not exist.
    async fn set_active(&self, owner_id: UserId, name: Option<&str>) -> Result<()>;

    /// Fails with `NotFound` if there is no such script
    async fn delete(&self, owner_id: UserId, name: &str) -> Result<()>;
}

/// Database Sieve script repository
pub struct DbSieveScriptRepository {
    pool: DatabasePool,
}

impl DbSieveScriptRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SieveScriptRepository for DbSieveScriptRepository {
    async fn active(&self, owner_id: UserId) -> Result<Option<SieveScript>> {
        sqlx::query_as::<_, SieveScript>(
            "SELECT * FROM sieve_scripts WHERE owner_id = $1 AND active LIMIT 1",
        )
        .bind(owner_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Storage(e.to_string()))
    }

    async fn list(&self, owner_id: UserId) -> Result<Vec<SieveScript>> {
        sqlx::query_as::<_, SieveScript>(
            "SELECT * FROM sieve_scripts WHERE owner_id = $1 ORDER BY name",
        )
        .bind(owner_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Storage(e.to_string()))
    }

    async fn get(&self, owner_id: UserId, name: &str) -> Result<Option<SieveScript>> {
        sqlx::query_as::<_, SieveScript>(
            "SELECT * FROM sieve_scripts WHERE owner_id = $1 AND name = $2",
        )
        .bind(owner_id)
        .bind(name)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Storage(e.to_string()))
    }

    async fn put(&self, owner_id: UserId, name: &str, script: &str, activate: bool) -> Result<()> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        if activate {
            sqlx::query("UPDATE sieve_scripts SET active = FALSE WHERE owner_id = $1")
                .bind(owner_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
        }

        sqlx::query(
            r#"
            INSERT INTO sieve_scripts (owner_id, name, script, active)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (owner_id, name) DO UPDATE SET script = EXCLUDED.script, active = EXCLUDED.active
            "#,
        )
        .bind(owner_id)
        .bind(name)
        .bind(script)
        .bind(activate)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    async fn set_active(&self, owner_id: UserId, name: Option<&str>) -> Result<()> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        sqlx::query("UPDATE sieve_scripts SET active = FALSE WHERE owner_id = $1")
            .bind(owner_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        if let Some(name) = name {
            let result = sqlx::query(
                "UPDATE sieve_scripts SET active = TRUE WHERE owner_id = $1 AND name = $2",
            )
            .bind(owner_id)
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
            if result.rows_affected() == 0 {
                return Err(Error::NotFound(format!("script {}", name)));
            }
        }

        tx.commit()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, owner_id: UserId, name: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM sieve_scripts WHERE owner_id = $1 AND name = $2")
            .bind(owner_id)
            .bind(name)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("script {}", name)));
        }
        Ok(())
    }
}
