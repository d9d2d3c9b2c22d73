//! Database models

use chrono::{DateTime, NaiveDate, Utc};
use mailstore_common::types::{
    MailboxId, MailboxPermission, MessageFlags, Timestamp, Uid, UserId,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// User model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub password_hash: String,
    pub active: bool,
    /// Storage quota in bytes, 0 for none
    pub max_mail_size: i64,
    pub created_at: DateTime<Utc>,
}

/// Mailbox model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: MailboxId,
    pub owner_id: UserId,
    pub name: String,
    pub permission: i16,
    pub subscribed: bool,
    /// UID the next stored message will get
    pub uidnext: i64,
    pub created_at: DateTime<Utc>,
}

impl Mailbox {
    pub fn permission(&self) -> MailboxPermission {
        MailboxPermission::from_code(self.permission)
    }
}

/// Message row as stored, without the raw body
#[derive(Debug, Clone, FromRow)]
pub struct MessageRow {
    pub uid: i64,
    pub seen: bool,
    pub answered: bool,
    pub flagged: bool,
    pub deleted: bool,
    pub draft: bool,
    pub recent: bool,
    pub size: i64,
    pub internal_date: DateTime<Utc>,
}

/// Per-message metadata loaded when a mailbox is opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSummary {
    pub uid: Uid,
    pub flags: MessageFlags,
    pub internal_date: Timestamp,
    pub size: u64,
}

impl MessageRow {
    pub fn into_summary(self, keywords: impl IntoIterator<Item = String>) -> MessageSummary {
        MessageSummary {
            uid: self.uid as Uid,
            flags: MessageFlags {
                seen: self.seen,
                answered: self.answered,
                flagged: self.flagged,
                deleted: self.deleted,
                draft: self.draft,
                recent: self.recent,
                keywords: keywords.into_iter().collect(),
            },
            internal_date: self.internal_date,
            size: self.size.max(0) as u64,
        }
    }
}

/// A message to be stored
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub mailbox_id: MailboxId,
    pub raw: Vec<u8>,
    pub flags: MessageFlags,
    pub internal_date: Timestamp,
    /// Value of the Date header, when it parsed
    pub sent_date: Option<Timestamp>,
    /// Top-level header fields, names lowercased
    pub headers: Vec<(String, String)>,
}

impl NewMessage {
    /// Day the message was sent, used by header-date searches
    pub fn sent_day(&self) -> Option<NaiveDate> {
        self.sent_date.map(|d| d.date_naive())
    }
}

/// Alias model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Alias {
    pub id: i64,
    pub alias: String,
    pub deliver_to: String,
}

/// Sieve script model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SieveScript {
    pub owner_id: UserId,
    pub name: String,
    pub script: String,
    pub active: bool,
}

/// ACL row, one per (mailbox, user)
#[derive(Debug, Clone, FromRow)]
pub struct AclRow {
    pub identifier: String,
    pub lookup_flag: bool,
    pub read_flag: bool,
    pub seen_flag: bool,
    pub write_flag: bool,
    pub insert_flag: bool,
    pub post_flag: bool,
    pub create_flag: bool,
    pub delete_flag: bool,
    pub administer_flag: bool,
}

impl AclRow {
    pub fn into_map(self) -> (String, mailstore_common::types::AclMap) {
        let map = mailstore_common::types::AclMap {
            lookup: self.lookup_flag,
            read: self.read_flag,
            seen: self.seen_flag,
            write: self.write_flag,
            insert: self.insert_flag,
            post: self.post_flag,
            create: self.create_flag,
            delete: self.delete_flag,
            administer: self.administer_flag,
        };
        (self.identifier, map)
    }
}
