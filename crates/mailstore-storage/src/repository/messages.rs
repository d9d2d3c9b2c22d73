//! Message repository

use crate::db::DatabasePool;
use crate::models::{MessageRow, MessageSummary, NewMessage};
use crate::predicate::{BindValue, PgDialect, SearchPredicate};
use async_trait::async_trait;
use mailstore_common::types::{MailboxId, MessageFlags, Uid};
use mailstore_common::{Error, Result};
use sqlx::{PgConnection, Row};
use std::collections::HashMap;

/// Message repository trait
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Every message in the mailbox, ascending by UID
    async fn list(&self, mailbox_id: MailboxId) -> Result<Vec<MessageSummary>>;

    /// Store a message and return its UID
    async fn append(&self, message: NewMessage) -> Result<Uid>;

    async fn fetch_raw(&self, mailbox_id: MailboxId, uid: Uid) -> Result<Option<Vec<u8>>>;

    /// First value of a header field for every message carrying it
    async fn header_values(&self, mailbox_id: MailboxId, name: &str) -> Result<Vec<(Uid, String)>>;

    /// UIDs matching a predicate, ascending
    async fn search(&self, mailbox_id: MailboxId, predicate: &SearchPredicate) -> Result<Vec<Uid>>;

    /// Overwrite the client-settable flags of one message
    async fn store_flags(&self, mailbox_id: MailboxId, uid: Uid, flags: &MessageFlags) -> Result<()>;

    async fn clear_recent(&self, mailbox_id: MailboxId) -> Result<()>;

    /// Remove messages flagged deleted, returning their UIDs
    async fn expunge(&self, mailbox_id: MailboxId) -> Result<Vec<Uid>>;

    /// Copy a message into another mailbox, returning the new UID
    async fn copy(&self, mailbox_id: MailboxId, uid: Uid, target: MailboxId) -> Result<Uid>;
}

/// Take the next UID of a mailbox. The row lock is held until the caller's
/// transaction ends, so UIDs commit in the order they were handed out.
async fn allocate_uid(conn: &mut PgConnection, mailbox_id: MailboxId) -> Result<i64> {
    let row = sqlx::query(
        "UPDATE mailboxes SET uidnext = uidnext + 1 WHERE id = $1 RETURNING uidnext - 1 AS uid",
    )
    .bind(mailbox_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| Error::Storage(e.to_string()))?
    .ok_or_else(|| Error::NotFound(format!("mailbox {}", mailbox_id)))?;
    Ok(row.get("uid"))
}

/// PostgreSQL message repository implementation
pub struct DbMessageRepository {
    pool: DatabasePool,
}

impl DbMessageRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for DbMessageRepository {
    async fn list(&self, mailbox_id: MailboxId) -> Result<Vec<MessageSummary>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT uid, seen, answered, flagged, deleted, draft, recent, size, internal_date
            FROM messages WHERE mailbox_id = $1
            ORDER BY uid ASC
            "#,
        )
        .bind(mailbox_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;

        let keyword_rows = sqlx::query(
            r#"
            SELECT m.uid, k.keyword FROM message_keywords k
            JOIN messages m ON m.id = k.message_id
            WHERE m.mailbox_id = $1
            "#,
        )
        .bind(mailbox_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;

        let mut keywords: HashMap<i64, Vec<String>> = HashMap::new();
        for row in keyword_rows {
            let uid: i64 = row.get("uid");
            keywords.entry(uid).or_default().push(row.get("keyword"));
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let kw = keywords.remove(&row.uid).unwrap_or_default();
                row.into_summary(kw)
            })
            .collect())
    }

    async fn append(&self, message: NewMessage) -> Result<Uid> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        let uid = allocate_uid(&mut *tx, message.mailbox_id).await?;

        let flags = &message.flags;
        let row = sqlx::query(
            r#"
            INSERT INTO messages (mailbox_id, uid, seen, answered, flagged, deleted, draft, recent,
                                  size, internal_date, sent_date, raw)
            VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE, $8, $9, $10, $11)
            RETURNING id
            "#,
        )
        .bind(message.mailbox_id)
        .bind(uid)
        .bind(flags.seen)
        .bind(flags.answered)
        .bind(flags.flagged)
        .bind(flags.deleted)
        .bind(flags.draft)
        .bind(message.raw.len() as i64)
        .bind(message.internal_date)
        .bind(message.sent_date)
        .bind(&message.raw)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        let id: i64 = row.get("id");

        for keyword in &flags.keywords {
            sqlx::query("INSERT INTO message_keywords (message_id, keyword) VALUES ($1, $2)")
                .bind(id)
                .bind(keyword)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
        }

        for (name, value) in &message.headers {
            sqlx::query("INSERT INTO message_headers (message_id, name, value) VALUES ($1, $2, $3)")
                .bind(id)
                .bind(name.to_ascii_lowercase())
                .bind(value)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        Ok(uid as Uid)
    }

    async fn fetch_raw(&self, mailbox_id: MailboxId, uid: Uid) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT raw FROM messages WHERE mailbox_id = $1 AND uid = $2")
            .bind(mailbox_id)
            .bind(uid as i64)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        Ok(row.map(|r| r.get("raw")))
    }

    async fn header_values(&self, mailbox_id: MailboxId, name: &str) -> Result<Vec<(Uid, String)>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (m.uid) m.uid, h.value FROM message_headers h
            JOIN messages m ON m.id = h.message_id
            WHERE m.mailbox_id = $1 AND h.name = $2
            ORDER BY m.uid ASC
            "#,
        )
        .bind(mailbox_id)
        .bind(name.to_ascii_lowercase())
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get::<i64, _>("uid") as Uid, r.get("value")))
            .collect())
    }

    async fn search(&self, mailbox_id: MailboxId, predicate: &SearchPredicate) -> Result<Vec<Uid>> {
        let rendered = predicate.render(&PgDialect, 2);
        let sql = format!(
            "SELECT m.uid FROM messages m WHERE m.mailbox_id = $1 AND {} ORDER BY m.uid ASC",
            rendered.sql
        );

        let mut query = sqlx::query(&sql).bind(mailbox_id);
        for value in rendered.binds {
            query = match value {
                BindValue::Text(v) => query.bind(v),
                BindValue::Date(v) => query.bind(v),
                BindValue::Int(v) => query.bind(v),
                BindValue::Bool(v) => query.bind(v),
            };
        }

        let rows = query
            .fetch_all(self.pool.pool())
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|r| r.get::<i64, _>("uid") as Uid)
            .collect())
    }

    async fn store_flags(&self, mailbox_id: MailboxId, uid: Uid, flags: &MessageFlags) -> Result<()> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        let row = sqlx::query(
            r#"
            UPDATE messages
            SET seen = $3, answered = $4, flagged = $5, deleted = $6, draft = $7
            WHERE mailbox_id = $1 AND uid = $2
            RETURNING id
            "#,
        )
        .bind(mailbox_id)
        .bind(uid as i64)
        .bind(flags.seen)
        .bind(flags.answered)
        .bind(flags.flagged)
        .bind(flags.deleted)
        .bind(flags.draft)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?
        .ok_or_else(|| Error::NotFound(format!("message {}", uid)))?;
        let id: i64 = row.get("id");

        sqlx::query("DELETE FROM message_keywords WHERE message_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        for keyword in &flags.keywords {
            sqlx::query("INSERT INTO message_keywords (message_id, keyword) VALUES ($1, $2)")
                .bind(id)
                .bind(keyword)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::Storage(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    async fn clear_recent(&self, mailbox_id: MailboxId) -> Result<()> {
        sqlx::query("UPDATE messages SET recent = FALSE WHERE mailbox_id = $1 AND recent")
            .bind(mailbox_id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    async fn expunge(&self, mailbox_id: MailboxId) -> Result<Vec<Uid>> {
        let rows = sqlx::query(
            "DELETE FROM messages WHERE mailbox_id = $1 AND deleted RETURNING uid",
        )
        .bind(mailbox_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;

        let mut uids: Vec<Uid> = rows
            .into_iter()
            .map(|r| r.get::<i64, _>("uid") as Uid)
            .collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn copy(&self, mailbox_id: MailboxId, uid: Uid, target: MailboxId) -> Result<Uid> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        let source = sqlx::query("SELECT id FROM messages WHERE mailbox_id = $1 AND uid = $2")
            .bind(mailbox_id)
            .bind(uid as i64)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?
            .ok_or_else(|| Error::NotFound(format!("message {}", uid)))?;
        let source_id: i64 = source.get("id");

        let new_uid = allocate_uid(&mut *tx, target).await?;

        let row = sqlx::query(
            r#"
            INSERT INTO messages (mailbox_id, uid, seen, answered, flagged, deleted, draft, recent,
                                  size, internal_date, sent_date, raw)
            SELECT $2, $3, seen, answered, flagged, deleted, draft, TRUE,
                   size, internal_date, sent_date, raw
            FROM messages WHERE id = $1
            RETURNING id
            "#,
        )
        .bind(source_id)
        .bind(target)
        .bind(new_uid)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
        let new_id: i64 = row.get("id");

        sqlx::query(
            "INSERT INTO message_keywords (message_id, keyword) SELECT $2, keyword FROM message_keywords WHERE message_id = $1",
        )
        .bind(source_id)
        .bind(new_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;

        sqlx::query(
            "INSERT INTO message_headers (message_id, name, value) SELECT $2, name, value FROM message_headers WHERE message_id = $1",
        )
        .bind(source_id)
        .bind(new_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        Ok(new_uid as Uid)
    }
}
