//! Delivery alias repository

use crate::db::DatabasePool;
use crate::models::Alias;
use async_trait::async_trait;
use mailstore_common::{Error, Result};

#[async_trait]
pub trait AliasRepository: Send + Sync {
    /// Local user names an alias delivers to. Matching ignores case.
    async fn resolve(&self, alias: &str) -> Result<Vec<String>>;

    async fn create(&self, alias: &str, deliver_to: &str) -> Result<Alias>;
}

/// Database alias repository
pub struct DbAliasRepository {
    pool: DatabasePool,
}

impl DbAliasRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AliasRepository for DbAliasRepository {
    async fn resolve(&self, alias: &str) -> Result<Vec<String>> {
        let rows = sqlx::query_as::<_, Alias>(
            "SELECT * FROM aliases WHERE LOWER(alias) = LOWER($1) ORDER BY id ASC",
        )
        .bind(alias)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;

        Ok(rows.into_iter().map(|a| a.deliver_to).collect())
    }

    async fn create(&self, alias: &str, deliver_to: &str) -> Result<Alias> {
        sqlx::query_as::<_, Alias>(
            "INSERT INTO aliases (alias, deliver_to) VALUES ($1, $2) RETURNING *",
        )
        .bind(alias)
        .bind(deliver_to)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Storage(e.to_string()))
    }
}
