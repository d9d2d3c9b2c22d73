//! Common types for mailstore

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Unique identifier for users
pub type UserId = i64;

/// Unique identifier for mailboxes
pub type MailboxId = i64;

/// Durable per-mailbox message identifier
pub type Uid = u64;

/// Message sequence number, 1-based and dense
pub type Msn = u32;

/// Timestamp wrapper
pub type Timestamp = DateTime<Utc>;

/// Login name of the pseudo-user whose grants apply to everybody.
pub const ANYONE_USER: &str = "anyone";

/// Email address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse an email address from a string
    pub fn parse(s: &str) -> Option<Self> {
        let (local, domain) = s.rsplit_once('@')?;
        if local.is_empty() || domain.is_empty() {
            return None;
        }
        Some(Self::new(local, domain))
    }

    /// The local part without any `+detail` suffix, and the detail itself.
    pub fn split_detail(&self) -> (&str, Option<&str>) {
        match self.local.split_once('+') {
            Some((user, detail)) if !user.is_empty() && !detail.is_empty() => (user, Some(detail)),
            _ => (&self.local, None),
        }
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::Validation("Invalid email address".to_string()))
    }
}

/// Message flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MessageFlags {
    pub seen: bool,
    pub answered: bool,
    pub flagged: bool,
    pub deleted: bool,
    pub draft: bool,
    pub recent: bool,
    #[serde(default)]
    pub keywords: BTreeSet<String>,
}

/// System flags in the order they are reported to clients.
pub const SYSTEM_FLAGS: [&str; 5] = ["\\Seen", "\\Answered", "\\Deleted", "\\Flagged", "\\Draft"];

impl MessageFlags {
    /// Build from an IMAP flag list. `\Recent` is server-managed and ignored.
    pub fn from_imap<S: AsRef<str>>(list: &[S]) -> Self {
        let mut flags = Self::default();
        for flag in list {
            let flag = flag.as_ref();
            match flag.to_ascii_uppercase().as_str() {
                "\\SEEN" => flags.seen = true,
                "\\ANSWERED" => flags.answered = true,
                "\\FLAGGED" => flags.flagged = true,
                "\\DELETED" => flags.deleted = true,
                "\\DRAFT" => flags.draft = true,
                "\\RECENT" => {}
                _ if flag.starts_with('\\') || flag.is_empty() => {}
                _ => {
                    flags.keywords.insert(flag.to_string());
                }
            }
        }
        flags
    }

    /// IMAP flag list, system flags first, then keywords.
    pub fn to_imap(&self) -> Vec<String> {
        let mut out = Vec::new();
        let system = [self.seen, self.answered, self.deleted, self.flagged, self.draft];
        for (set, name) in system.iter().zip(SYSTEM_FLAGS) {
            if *set {
                out.push(name.to_string());
            }
        }
        if self.recent {
            out.push("\\Recent".to_string());
        }
        out.extend(self.keywords.iter().cloned());
        out
    }

    /// Add every flag set in `other`.
    pub fn add(&mut self, other: &MessageFlags) {
        self.seen |= other.seen;
        self.answered |= other.answered;
        self.flagged |= other.flagged;
        self.deleted |= other.deleted;
        self.draft |= other.draft;
        self.keywords.extend(other.keywords.iter().cloned());
    }

    /// Clear every flag set in `other`.
    pub fn remove(&mut self, other: &MessageFlags) {
        self.seen &= !other.seen;
        self.answered &= !other.answered;
        self.flagged &= !other.flagged;
        self.deleted &= !other.deleted;
        self.draft &= !other.draft;
        self.keywords.retain(|k| !other.keywords.contains(k));
    }

    /// Replace the client-settable flags, keeping `\Recent`.
    pub fn replace(&mut self, other: &MessageFlags) {
        let recent = self.recent;
        *self = other.clone();
        self.recent = recent;
    }
}

/// Mailbox access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailboxPermission {
    ReadOnly,
    ReadWrite,
}

impl MailboxPermission {
    /// Storage encoding: 1 read-only, 2 read-write.
    pub fn from_code(code: i16) -> Self {
        if code == 1 {
            MailboxPermission::ReadOnly
        } else {
            MailboxPermission::ReadWrite
        }
    }

    pub fn code(self) -> i16 {
        match self {
            MailboxPermission::ReadOnly => 1,
            MailboxPermission::ReadWrite => 2,
        }
    }
}

/// A single mailbox right
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AclRight {
    Lookup,
    Read,
    Seen,
    Write,
    Insert,
    Post,
    Create,
    Delete,
    Administer,
}

impl AclRight {
    /// All rights in canonical order.
    pub const ALL: [AclRight; 9] = [
        AclRight::Lookup,
        AclRight::Read,
        AclRight::Seen,
        AclRight::Write,
        AclRight::Insert,
        AclRight::Post,
        AclRight::Create,
        AclRight::Delete,
        AclRight::Administer,
    ];

    pub fn letter(self) -> char {
        match self {
            AclRight::Lookup => 'l',
            AclRight::Read => 'r',
            AclRight::Seen => 's',
            AclRight::Write => 'w',
            AclRight::Insert => 'i',
            AclRight::Post => 'p',
            AclRight::Create => 'c',
            AclRight::Delete => 'd',
            AclRight::Administer => 'a',
        }
    }

    pub fn from_letter(c: char) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.letter() == c)
    }

    /// Rights that change mailbox contents and need a writable mailbox.
    pub fn requires_write(self) -> bool {
        !matches!(self, AclRight::Lookup | AclRight::Read)
    }
}

/// The nine right flags of one (mailbox, identifier) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AclMap {
    pub lookup: bool,
    pub read: bool,
    pub seen: bool,
    pub write: bool,
    pub insert: bool,
    pub post: bool,
    pub create: bool,
    pub delete: bool,
    pub administer: bool,
}

impl AclMap {
    /// Every right granted.
    pub fn all() -> Self {
        let mut map = Self::default();
        for right in AclRight::ALL {
            map.set(right, true);
        }
        map
    }

    pub fn get(&self, right: AclRight) -> bool {
        match right {
            AclRight::Lookup => self.lookup,
            AclRight::Read => self.read,
            AclRight::Seen => self.seen,
            AclRight::Write => self.write,
            AclRight::Insert => self.insert,
            AclRight::Post => self.post,
            AclRight::Create => self.create,
            AclRight::Delete => self.delete,
            AclRight::Administer => self.administer,
        }
    }

    pub fn set(&mut self, right: AclRight, value: bool) {
        let slot = match right {
            AclRight::Lookup => &mut self.lookup,
            AclRight::Read => &mut self.read,
            AclRight::Seen => &mut self.seen,
            AclRight::Write => &mut self.write,
            AclRight::Insert => &mut self.insert,
            AclRight::Post => &mut self.post,
            AclRight::Create => &mut self.create,
            AclRight::Delete => &mut self.delete,
            AclRight::Administer => &mut self.administer,
        };
        *slot = value;
    }

    pub fn is_empty(&self) -> bool {
        AclRight::ALL.iter().all(|r| !self.get(*r))
    }

    /// Rights granted by either map
    pub fn union(&self, other: &AclMap) -> AclMap {
        let mut out = *self;
        for right in AclRight::ALL {
            if other.get(right) {
                out.set(right, true);
            }
        }
        out
    }

    /// Granted rights as letters in canonical order, e.g. `lrs`.
    pub fn rights_string(&self) -> String {
        AclRight::ALL
            .iter()
            .filter(|r| self.get(**r))
            .map(|r| r.letter())
            .collect()
    }
}
