//! In-memory storage backend
//!
//! Implements every repository trait over plain collections behind a
//! tokio `RwLock`. Used by the `memory` database backend and throughout
//! the test suites. Raw SQL predicates are not understood here and fail
//! with `InvalidQuery`.

use crate::db::Database;
use crate::models::{Alias, Mailbox, MessageSummary, NewMessage, SieveScript, User};
use crate::predicate::{AgeOp, SearchPredicate};
use crate::repository::{
    AclRepository, AliasRepository, MailboxRepository, MessageRepository, SieveScriptRepository,
    UserRepository,
};
use async_trait::async_trait;
use chrono::Utc;
use mailstore_common::types::{
    AclMap, MailboxId, MailboxPermission, MessageFlags, Timestamp, Uid, UserId, ANYONE_USER,
};
use mailstore_common::{Error, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct StoredMessage {
    mailbox_id: MailboxId,
    flags: MessageFlags,
    internal_date: Timestamp,
    sent_date: Option<Timestamp>,
    headers: Vec<(String, String)>,
    raw: Vec<u8>,
}

impl StoredMessage {
    fn summary(&self, uid: Uid) -> MessageSummary {
        MessageSummary {
            uid,
            flags: self.flags.clone(),
            internal_date: self.internal_date,
            size: self.raw.len() as u64,
        }
    }

    fn matches(&self, predicate: &SearchPredicate, now: Timestamp) -> Result<bool> {
        Ok(match predicate {
            SearchPredicate::HeaderDate { op, date } => self
                .sent_date
                .map(|d| op.matches(d.date_naive(), *date))
                .unwrap_or(false),
            SearchPredicate::InternalDate { op, date } => {
                op.matches(self.internal_date.date_naive(), *date)
            }
            SearchPredicate::Age { op, seconds } => {
                let age = (now - self.internal_date).num_seconds();
                match op {
                    AgeOp::Younger => age <= *seconds,
                    AgeOp::Older => age >= *seconds,
                }
            }
            SearchPredicate::Header { name, value } => {
                let needle = value.to_lowercase();
                self.headers.iter().any(|(n, v)| {
                    n.eq_ignore_ascii_case(name) && v.to_lowercase().contains(&needle)
                })
            }
            SearchPredicate::Size { op, size } => op.matches(self.raw.len() as u64, *size),
            SearchPredicate::Flag { flag, set } => flag.get(&self.flags) == *set,
            SearchPredicate::Keyword { keyword, set } => {
                self.flags.keywords.contains(keyword) == *set
            }
            SearchPredicate::Raw(fragment) => {
                return Err(Error::InvalidQuery(format!(
                    "raw predicate not supported by the memory backend: {}",
                    fragment
                )))
            }
        })
    }
}

#[derive(Debug, Default)]
struct MemoryData {
    users: BTreeMap<UserId, User>,
    mailboxes: BTreeMap<MailboxId, Mailbox>,
    messages: BTreeMap<(MailboxId, Uid), StoredMessage>,
    acl: BTreeMap<(MailboxId, UserId), AclMap>,
    aliases: Vec<Alias>,
    scripts: Vec<SieveScript>,
    next_user: UserId,
    next_mailbox: MailboxId,
    next_alias: i64,
}

impl MemoryData {
    fn messages_in(&self, mailbox_id: MailboxId) -> impl Iterator<Item = (Uid, &StoredMessage)> {
        self.messages
            .range((mailbox_id, Uid::MIN)..=(mailbox_id, Uid::MAX))
            .map(|((_, uid), m)| (*uid, m))
    }

    /// Hand out the mailbox's next UID
    fn allocate_uid(&mut self, mailbox_id: MailboxId) -> Result<Uid> {
        let mailbox = self
            .mailboxes
            .get_mut(&mailbox_id)
            .ok_or_else(|| Error::NotFound(format!("mailbox {}", mailbox_id)))?;
        let uid = mailbox.uidnext.max(1) as Uid;
        mailbox.uidnext = uid as i64 + 1;
        Ok(uid)
    }
}

/// In-memory store
#[derive(Debug)]
pub struct MemoryStore {
    data: RwLock<MemoryData>,
    offline: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store holding only the `anyone` pseudo-user.
    pub fn new() -> Self {
        let mut data = MemoryData {
            next_user: 1,
            next_mailbox: 1,
            next_alias: 1,
            ..Default::default()
        };
        let anyone = User {
            id: data.next_user,
            name: ANYONE_USER.to_string(),
            password_hash: String::new(),
            active: false,
            max_mail_size: 0,
            created_at: Utc::now(),
        };
        data.users.insert(anyone.id, anyone);
        data.next_user += 1;

        Self {
            data: RwLock::new(data),
            offline: AtomicBool::new(false),
        }
    }

    /// Simulate an outage: every call fails with a storage error until
    /// the store is brought back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Storage("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Database for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn health_check(&self) -> Result<()> {
        self.check()
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn get(&self, id: UserId) -> Result<Option<User>> {
        self.check()?;
        Ok(self.data.read().await.users.get(&id).cloned())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<User>> {
        self.check()?;
        let data = self.data.read().await;
        Ok(data.users.values().find(|u| u.name == name).cloned())
    }

    async fn create(&self, name: &str, password_hash: &str) -> Result<User> {
        self.check()?;
        let mut data = self.data.write().await;
        if data.users.values().any(|u| u.name == name) {
            return Err(Error::Validation(format!("user {} already exists", name)));
        }
        let user = User {
            id: data.next_user,
            name: name.to_string(),
            password_hash: password_hash.to_string(),
            active: true,
            max_mail_size: 0,
            created_at: Utc::now(),
        };
        data.next_user += 1;
        data.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn set_max_mail_size(&self, id: UserId, bytes: u64) -> Result<()> {
        self.check()?;
        let mut data = self.data.write().await;
        let user = data
            .users
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("user {}", id)))?;
        user.max_mail_size = bytes.min(i64::MAX as u64) as i64;
        Ok(())
    }

    async fn storage_used(&self, id: UserId) -> Result<u64> {
        self.check()?;
        let data = self.data.read().await;
        Ok(data
            .messages
            .values()
            .filter(|m| {
                data.mailboxes
                    .get(&m.mailbox_id)
                    .map_or(false, |b| b.owner_id == id)
            })
            .map(|m| m.raw.len() as u64)
            .sum())
    }
}

#[async_trait]
impl MailboxRepository for MemoryStore {
    async fn get(&self, id: MailboxId) -> Result<Option<Mailbox>> {
        self.check()?;
        Ok(self.data.read().await.mailboxes.get(&id).cloned())
    }

    async fn find_by_name(&self, owner_id: UserId, name: &str) -> Result<Option<Mailbox>> {
        self.check()?;
        let data = self.data.read().await;
        Ok(data
            .mailboxes
            .values()
            .find(|m| m.owner_id == owner_id && m.name == name)
            .cloned())
    }

    async fn list_visible(&self, user_id: UserId) -> Result<Vec<Mailbox>> {
        self.check()?;
        let data = self.data.read().await;
        let anyone = data
            .users
            .values()
            .find(|u| u.name == ANYONE_USER)
            .map(|u| u.id);

        let mut out: Vec<Mailbox> = data
            .mailboxes
            .values()
            .filter(|m| {
                m.owner_id == user_id
                    || data.acl.iter().any(|((mailbox, user), rights)| {
                        *mailbox == m.id
                            && rights.lookup
                            && (*user == user_id || Some(*user) == anyone)
                    })
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn create(
        &self,
        owner_id: UserId,
        name: &str,
        permission: MailboxPermission,
    ) -> Result<Mailbox> {
        self.check()?;
        let mut data = self.data.write().await;
        if data
            .mailboxes
            .values()
            .any(|m| m.owner_id == owner_id && m.name == name)
        {
            return Err(Error::Validation(format!("mailbox {} already exists", name)));
        }
        let mailbox = Mailbox {
            id: data.next_mailbox,
            owner_id,
            name: name.to_string(),
            permission: permission.code(),
            subscribed: true,
            uidnext: 1,
            created_at: Utc::now(),
        };
        data.next_mailbox += 1;
        data.mailboxes.insert(mailbox.id, mailbox.clone());
        Ok(mailbox)
    }

    async fn rename(&self, id: MailboxId, name: &str) -> Result<()> {
        self.check()?;
        let mut data = self.data.write().await;
        let mailbox = data
            .mailboxes
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("mailbox {}", id)))?;
        mailbox.name = name.to_string();
        Ok(())
    }

    async fn set_subscribed(&self, id: MailboxId, subscribed: bool) -> Result<()> {
        self.check()?;
        let mut data = self.data.write().await;
        if let Some(mailbox) = data.mailboxes.get_mut(&id) {
            mailbox.subscribed = subscribed;
        }
        Ok(())
    }

    async fn delete(&self, id: MailboxId) -> Result<()> {
        self.check()?;
        let mut data = self.data.write().await;
        data.mailboxes.remove(&id);
        data.messages.retain(|_, m| m.mailbox_id != id);
        data.acl.retain(|(mailbox, _), _| *mailbox != id);
        Ok(())
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn list(&self, mailbox_id: MailboxId) -> Result<Vec<MessageSummary>> {
        self.check()?;
        let data = self.data.read().await;
        Ok(data
            .messages_in(mailbox_id)
            .map(|(uid, m)| m.summary(uid))
            .collect())
    }

    async fn append(&self, message: NewMessage) -> Result<Uid> {
        self.check()?;
        let mut data = self.data.write().await;
        let uid = data.allocate_uid(message.mailbox_id)?;

        let mut flags = message.flags;
        flags.recent = true;
        data.messages.insert(
            (message.mailbox_id, uid),
            StoredMessage {
                mailbox_id: message.mailbox_id,
                flags,
                internal_date: message.internal_date,
                sent_date: message.sent_date,
                headers: message
                    .headers
                    .into_iter()
                    .map(|(n, v)| (n.to_ascii_lowercase(), v))
                    .collect(),
                raw: message.raw,
            },
        );
        Ok(uid)
    }

    async fn fetch_raw(&self, mailbox_id: MailboxId, uid: Uid) -> Result<Option<Vec<u8>>> {
        self.check()?;
        let data = self.data.read().await;
        Ok(data
            .messages
            .get(&(mailbox_id, uid))
            .map(|m| m.raw.clone()))
    }

    async fn header_values(&self, mailbox_id: MailboxId, name: &str) -> Result<Vec<(Uid, String)>> {
        self.check()?;
        let name = name.to_ascii_lowercase();
        let data = self.data.read().await;
        Ok(data
            .messages_in(mailbox_id)
            .filter_map(|(uid, m)| {
                m.headers
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, v)| (uid, v.clone()))
            })
            .collect())
    }

    async fn search(&self, mailbox_id: MailboxId, predicate: &SearchPredicate) -> Result<Vec<Uid>> {
        self.check()?;
        let now = Utc::now();
        let data = self.data.read().await;
        let mut out = Vec::new();
        for (uid, message) in data.messages_in(mailbox_id) {
            if message.matches(predicate, now)? {
                out.push(uid);
            }
        }
        Ok(out)
    }

    async fn store_flags(&self, mailbox_id: MailboxId, uid: Uid, flags: &MessageFlags) -> Result<()> {
        self.check()?;
        let mut data = self.data.write().await;
        let message = data
            .messages
            .get_mut(&(mailbox_id, uid))
            .ok_or_else(|| Error::NotFound(format!("message {}", uid)))?;
        message.flags.replace(flags);
        Ok(())
    }

    async fn clear_recent(&self, mailbox_id: MailboxId) -> Result<()> {
        self.check()?;
        let mut data = self.data.write().await;
        for message in data.messages.values_mut() {
            if message.mailbox_id == mailbox_id {
                message.flags.recent = false;
            }
        }
        Ok(())
    }

    async fn expunge(&self, mailbox_id: MailboxId) -> Result<Vec<Uid>> {
        self.check()?;
        let mut data = self.data.write().await;
        let doomed: Vec<Uid> = data
            .messages_in(mailbox_id)
            .filter(|(_, m)| m.flags.deleted)
            .map(|(uid, _)| uid)
            .collect();
        for uid in &doomed {
            data.messages.remove(&(mailbox_id, *uid));
        }
        Ok(doomed)
    }

    async fn copy(&self, mailbox_id: MailboxId, uid: Uid, target: MailboxId) -> Result<Uid> {
        self.check()?;
        let mut data = self.data.write().await;
        let mut copy = data
            .messages
            .get(&(mailbox_id, uid))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("message {}", uid)))?;
        copy.mailbox_id = target;
        copy.flags.recent = true;

        let new_uid = data.allocate_uid(target)?;
        data.messages.insert((target, new_uid), copy);
        Ok(new_uid)
    }
}

#[async_trait]
impl AclRepository for MemoryStore {
    async fn get(&self, mailbox_id: MailboxId, user_id: UserId) -> Result<Option<AclMap>> {
        self.check()?;
        Ok(self.data.read().await.acl.get(&(mailbox_id, user_id)).copied())
    }

    async fn set(&self, mailbox_id: MailboxId, user_id: UserId, rights: &AclMap) -> Result<()> {
        self.check()?;
        self.data
            .write()
            .await
            .acl
            .insert((mailbox_id, user_id), *rights);
        Ok(())
    }

    async fn delete(&self, mailbox_id: MailboxId, user_id: UserId) -> Result<()> {
        self.check()?;
        self.data.write().await.acl.remove(&(mailbox_id, user_id));
        Ok(())
    }

    async fn list(&self, mailbox_id: MailboxId) -> Result<Vec<(String, AclMap)>> {
        self.check()?;
        let data = self.data.read().await;
        let mut out: Vec<(String, AclMap)> = data
            .acl
            .iter()
            .filter(|((mailbox, _), _)| *mailbox == mailbox_id)
            .filter_map(|((_, user), rights)| {
                data.users.get(user).map(|u| (u.name.clone(), *rights))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

#[async_trait]
impl AliasRepository for MemoryStore {
    async fn resolve(&self, alias: &str) -> Result<Vec<String>> {
        self.check()?;
        let data = self.data.read().await;
        Ok(data
            .aliases
            .iter()
            .filter(|a| a.alias.eq_ignore_ascii_case(alias))
            .map(|a| a.deliver_to.clone())
            .collect())
    }

    async fn create(&self, alias: &str, deliver_to: &str) -> Result<Alias> {
        self.check()?;
        let mut data = self.data.write().await;
        let row = Alias {
            id: data.next_alias,
            alias: alias.to_string(),
            deliver_to: deliver_to.to_string(),
        };
        data.next_alias += 1;
        data.aliases.push(row.clone());
        Ok(row)
    }
}

#[async_trait]
impl SieveScriptRepository for MemoryStore {
    async fn active(&self, owner_id: UserId) -> Result<Option<SieveScript>> {
        self.check()?;
        let data = self.data.read().await;
        Ok(data
            .scripts
            .iter()
            .find(|s| s.owner_id == owner_id && s.active)
            .cloned())
    }

    async fn list(&self, owner_id: UserId) -> Result<Vec<SieveScript>> {
        self.check()?;
        let data = self.data.read().await;
        let mut scripts: Vec<_> = data
            .scripts
            .iter()
            .filter(|s| s.owner_id == owner_id)
            .cloned()
            .collect();
        scripts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(scripts)
    }

    async fn get(&self, owner_id: UserId, name: &str) -> Result<Option<SieveScript>> {
        self.check()?;
        let data = self.data.read().await;
        Ok(data
            .scripts
            .iter()
            .find(|s| s.owner_id == owner_id && s.name == name)
            .cloned())
    }

    async fn put(&self, owner_id: UserId, name: &str, script: &str, activate: bool) -> Result<()> {
        self.check()?;
        let mut data = self.data.write().await;
        if activate {
            for s in data.scripts.iter_mut().filter(|s| s.owner_id == owner_id) {
                s.active = false;
            }
        }
        data.scripts
            .retain(|s| !(s.owner_id == owner_id && s.name == name));
        data.scripts.push(SieveScript {
            owner_id,
            name: name.to_string(),
            script: script.to_string(),
            active: activate,
        });
        Ok(())
    }

    async fn set_active(&self, owner_id: UserId, name: Option<&str>) -> Result<()> {
        self.check()?;
        let mut data = self.data.write().await;
        if let Some(name) = name {
            if !data
                .scripts
                .iter()
                .any(|s| s.owner_id == owner_id && s.name == name)
            {
                return Err(Error::NotFound(format!("script {}", name)));
            }
        }
        for s in data.scripts.iter_mut().filter(|s| s.owner_id == owner_id) {
            s.active = Some(s.name.as_str()) == name;
        }
        Ok(())
    }

    async fn delete(&self, owner_id: UserId, name: &str) -> Result<()> {
        self.check()?;
        let mut data = self.data.write().await;
        let before = data.scripts.len();
        data.scripts
            .retain(|s| !(s.owner_id == owner_id && s.name == name));
        if data.scripts.len() == before {
            return Err(Error::NotFound(format!("script {}", name)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::{DateOp, FlagName, SizeOp};
    use chrono::{NaiveDate, TimeZone};
    use pretty_assertions::assert_eq;

    fn message(mailbox_id: MailboxId, raw: &str, subject: &str) -> NewMessage {
        NewMessage {
            mailbox_id,
            raw: raw.as_bytes().to_vec(),
            flags: MessageFlags::default(),
            internal_date: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            sent_date: Some(Utc.with_ymd_and_hms(2024, 4, 30, 8, 0, 0).unwrap()),
            headers: vec![("Subject".to_string(), subject.to_string())],
        }
    }

    async fn seeded() -> (MemoryStore, MailboxId) {
        let store = MemoryStore::new();
        let user = UserRepository::create(&store, "joe", "").await.unwrap();
        let inbox = MailboxRepository::create(&store, user.id, "INBOX", MailboxPermission::ReadWrite)
            .await
            .unwrap();
        (store, inbox.id)
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_uids() {
        let (store, inbox) = seeded().await;
        let a = store.append(message(inbox, "a", "first")).await.unwrap();
        let b = store.append(message(inbox, "bb", "second")).await.unwrap();
        assert!(b > a);

        let listed = MessageRepository::list(&store, inbox).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].flags.recent);
        assert_eq!(listed[1].size, 2);
    }

    #[tokio::test]
    async fn test_search_predicates() {
        let (store, inbox) = seeded().await;
        let a = store.append(message(inbox, "short", "Hello there")).await.unwrap();
        let b = store
            .append(message(inbox, "a much longer body", "Invoice"))
            .await
            .unwrap();

        let hits = store
            .search(
                inbox,
                &SearchPredicate::Header {
                    name: "subject".to_string(),
                    value: "hello".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(hits, vec![a]);

        let hits = store
            .search(inbox, &SearchPredicate::Size { op: SizeOp::Larger, size: 10 })
            .await
            .unwrap();
        assert_eq!(hits, vec![b]);

        let hits = store
            .search(
                inbox,
                &SearchPredicate::HeaderDate {
                    op: DateOp::On,
                    date: NaiveDate::from_ymd_opt(2024, 4, 30).unwrap(),
                },
            )
            .await
            .unwrap();
        assert_eq!(hits, vec![a, b]);
    }

    #[tokio::test]
    async fn test_raw_predicate_is_rejected() {
        let (store, inbox) = seeded().await;
        store.append(message(inbox, "x", "x")).await.unwrap();
        let err = store
            .search(inbox, &SearchPredicate::Raw("1 = 1".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_QUERY");
    }

    #[tokio::test]
    async fn test_store_flags_and_expunge() {
        let (store, inbox) = seeded().await;
        let a = store.append(message(inbox, "a", "a")).await.unwrap();
        let b = store.append(message(inbox, "b", "b")).await.unwrap();

        let flags = MessageFlags::from_imap(&["\\Deleted"]);
        store.store_flags(inbox, a, &flags).await.unwrap();

        let deleted = store
            .search(inbox, &SearchPredicate::Flag { flag: FlagName::Deleted, set: true })
            .await
            .unwrap();
        assert_eq!(deleted, vec![a]);

        assert_eq!(store.expunge(inbox).await.unwrap(), vec![a]);
        let left: Vec<Uid> = MessageRepository::list(&store, inbox)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.uid)
            .collect();
        assert_eq!(left, vec![b]);
    }

    #[tokio::test]
    async fn test_copy_marks_recent() {
        let (store, inbox) = seeded().await;
        let user = UserRepository::find_by_name(&store, "joe").await.unwrap().unwrap();
        let archive =
            MailboxRepository::create(&store, user.id, "Archive", MailboxPermission::ReadWrite)
                .await
                .unwrap();
        let a = store.append(message(inbox, "a", "a")).await.unwrap();
        store.clear_recent(inbox).await.unwrap();

        let copied = store.copy(inbox, a, archive.id).await.unwrap();
        let listed = MessageRepository::list(&store, archive.id).await.unwrap();
        assert_eq!(listed[0].uid, copied);
        assert!(listed[0].flags.recent);
    }

    #[tokio::test]
    async fn test_uids_are_allocated_per_mailbox() {
        let (store, inbox) = seeded().await;
        let user = UserRepository::find_by_name(&store, "joe").await.unwrap().unwrap();
        let archive =
            MailboxRepository::create(&store, user.id, "Archive", MailboxPermission::ReadWrite)
                .await
                .unwrap();

        assert_eq!(store.append(message(inbox, "a", "a")).await.unwrap(), 1);
        assert_eq!(store.append(message(inbox, "b", "b")).await.unwrap(), 2);
        assert_eq!(store.append(message(archive.id, "c", "c")).await.unwrap(), 1);
        assert_eq!(store.copy(inbox, 2, archive.id).await.unwrap(), 2);

        // Expunging the highest UID does not let it be reused
        store
            .store_flags(inbox, 2, &MessageFlags::from_imap(&["\\Deleted"]))
            .await
            .unwrap();
        assert_eq!(store.expunge(inbox).await.unwrap(), vec![2]);
        assert_eq!(store.append(message(inbox, "d", "d")).await.unwrap(), 3);

        let reopened = MailboxRepository::get(&store, inbox).await.unwrap().unwrap();
        assert_eq!(reopened.uidnext, 4);
        assert_eq!(store.fetch_raw(archive.id, 2).await.unwrap(), Some(b"b".to_vec()));
        assert!(store.fetch_raw(inbox, 1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_shared_mailboxes_are_visible() {
        let (store, inbox) = seeded().await;
        let bob = UserRepository::create(&store, "bob", "").await.unwrap();
        assert!(store.list_visible(bob.id).await.unwrap().is_empty());

        let anyone = UserRepository::find_by_name(&store, ANYONE_USER)
            .await
            .unwrap()
            .unwrap();
        let mut rights = AclMap::default();
        rights.lookup = true;
        AclRepository::set(&store, inbox, anyone.id, &rights).await.unwrap();

        let visible = store.list_visible(bob.id).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(
            AclRepository::list(&store, inbox).await.unwrap(),
            vec![(ANYONE_USER.to_string(), rights)]
        );
    }

    #[tokio::test]
    async fn test_storage_used_counts_owned_mailboxes() {
        let (store, inbox) = seeded().await;
        let joe = UserRepository::find_by_name(&store, "joe").await.unwrap().unwrap();
        assert_eq!(joe.max_mail_size, 0);
        let bob = UserRepository::create(&store, "bob", "").await.unwrap();
        let other = MailboxRepository::create(&store, bob.id, "INBOX", MailboxPermission::ReadWrite)
            .await
            .unwrap();

        store.append(message(inbox, "12345", "a")).await.unwrap();
        store.append(message(inbox, "123", "b")).await.unwrap();
        store.append(message(other.id, "1234567", "c")).await.unwrap();
        assert_eq!(store.storage_used(joe.id).await.unwrap(), 8);
        assert_eq!(store.storage_used(bob.id).await.unwrap(), 7);

        store.set_max_mail_size(joe.id, 1024).await.unwrap();
        let joe = UserRepository::get(&store, joe.id).await.unwrap().unwrap();
        assert_eq!(joe.max_mail_size, 1024);
        assert!(store.set_max_mail_size(99, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_offline_store_fails() {
        let (store, inbox) = seeded().await;
        store.set_offline(true);
        assert!(store.health_check().await.is_err());
        let err = MessageRepository::list(&store, inbox).await.unwrap_err();
        assert!(err.is_transient());
        store.set_offline(false);
        assert!(store.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_aliases_and_scripts() {
        let store = MemoryStore::new();
        AliasRepository::create(&store, "Sales@example.com", "joe").await.unwrap();
        assert_eq!(
            store.resolve("sales@EXAMPLE.com").await.unwrap(),
            vec!["joe".to_string()]
        );

        store.put(7, "one", "keep;", true).await.unwrap();
        store.put(7, "two", "discard;", true).await.unwrap();
        let active = store.active(7).await.unwrap().unwrap();
        assert_eq!(active.name, "two");
    }

    #[tokio::test]
    async fn test_script_management() {
        let store = MemoryStore::new();
        store.put(7, "work", "keep;", false).await.unwrap();
        store.put(7, "home", "discard;", false).await.unwrap();
        store.put(8, "other", "keep;", true).await.unwrap();

        let names: Vec<_> = SieveScriptRepository::list(&store, 7)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["home", "work"]);

        store.set_active(7, Some("work")).await.unwrap();
        assert_eq!(store.active(7).await.unwrap().unwrap().name, "work");
        assert!(store.set_active(7, Some("missing")).await.is_err());
        assert_eq!(store.active(7).await.unwrap().unwrap().name, "work");

        store.set_active(7, None).await.unwrap();
        assert!(store.active(7).await.unwrap().is_none());
        assert!(store.active(8).await.unwrap().is_some());

        SieveScriptRepository::delete(&store, 7, "home").await.unwrap();
        assert!(SieveScriptRepository::get(&store, 7, "home").await.unwrap().is_none());
        let err = SieveScriptRepository::delete(&store, 7, "home").await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        assert_eq!(
            SieveScriptRepository::get(&store, 7, "work").await.unwrap().unwrap().script,
            "keep;"
        );
    }
}
