//! Mailbox state
//!
//! One session's view of one mailbox: the UID to MSN mapping, per-message
//! flags and the counters IMAP reports. The view is loaded in bulk when
//! the mailbox is opened and afterwards only changes through this
//! session's own commands or an explicit [`MailboxState::resync`].
//!
//! UIDs are kept in a sorted vector, so the MSN of a message is its index
//! plus one and the MSN space never has gaps.

use crate::ordered_set::{OrderedSet, Record};
use crate::search::SearchKey;
use mailstore_common::types::{
    MailboxId, MailboxPermission, MessageFlags, Msn, Timestamp, Uid, UserId, SYSTEM_FLAGS,
};
use mailstore_common::{Error, Result};
use mailstore_storage::{Mailbox, MessageSummary, Store};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Per-message data held in the state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo {
    pub uid: Uid,
    pub flags: MessageFlags,
    pub internal_date: Timestamp,
    pub size: u64,
}

impl From<MessageSummary> for MessageInfo {
    fn from(m: MessageSummary) -> Self {
        Self {
            uid: m.uid,
            flags: m.flags,
            internal_date: m.internal_date,
            size: m.size,
        }
    }
}

impl Record for MessageInfo {
    type Key = Uid;

    fn key(&self) -> Uid {
        self.uid
    }
}

/// Differences found by a resync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Removed messages with the MSN each had, highest MSN first, so that
    /// reporting them in order never invalidates a later entry
    pub expunged: Vec<(Uid, Msn)>,
    /// New UIDs, ascending
    pub appended: Vec<Uid>,
    /// Messages whose flags changed elsewhere, ascending
    pub flags_changed: Vec<Uid>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.expunged.is_empty() && self.appended.is_empty() && self.flags_changed.is_empty()
    }
}

/// Live view of one mailbox
#[derive(Debug, Clone)]
pub struct MailboxState {
    pub id: MailboxId,
    pub owner_id: UserId,
    pub name: String,
    pub permission: MailboxPermission,
    uids: Vec<Uid>,
    messages: BTreeMap<Uid, MessageInfo>,
    uidnext: Uid,
    keywords: BTreeSet<String>,
    /// Ordering produced by the last SORT
    pub sorted: Option<Vec<Msn>>,
    /// Tree of the last SEARCH
    pub search: Option<SearchKey>,
}

impl MailboxState {
    /// An empty view of a mailbox row
    pub fn new(mailbox: &Mailbox) -> Self {
        Self {
            id: mailbox.id,
            owner_id: mailbox.owner_id,
            name: mailbox.name.clone(),
            permission: mailbox.permission(),
            uids: Vec::new(),
            messages: BTreeMap::new(),
            uidnext: mailbox.uidnext.max(1) as Uid,
            keywords: BTreeSet::new(),
            sorted: None,
            search: None,
        }
    }

    /// Load a mailbox and all of its messages from storage
    pub async fn open(store: &Store, mailbox_id: MailboxId) -> Result<Self> {
        let mailbox = store
            .mailboxes
            .get(mailbox_id)
            .await?
            .ok_or_else(|| Error::Storage(format!("unknown mailbox {}", mailbox_id)))?;

        let mut state = Self::new(&mailbox);
        let summaries = store.messages.list(mailbox_id).await?;
        state.load(summaries.into_iter().map(MessageInfo::from));

        debug!(
            mailbox = %state.name,
            exists = state.exists(),
            "Opened mailbox"
        );
        Ok(state)
    }

    fn load(&mut self, messages: impl IntoIterator<Item = MessageInfo>) {
        self.uids.clear();
        self.messages.clear();
        for info in messages {
            self.keywords.extend(info.flags.keywords.iter().cloned());
            self.uidnext = self.uidnext.max(info.uid + 1);
            self.uids.push(info.uid);
            self.messages.insert(info.uid, info);
        }
        self.uids.sort_unstable();
        self.uids.dedup();
    }

    /// Number of messages in the view
    pub fn exists(&self) -> usize {
        self.uids.len()
    }

    pub fn uidnext(&self) -> Uid {
        self.uidnext
    }

    pub fn uidvalidity(&self) -> u64 {
        self.id as u64
    }

    pub fn is_read_only(&self) -> bool {
        self.permission == MailboxPermission::ReadOnly
    }

    /// UIDs in MSN order
    pub fn uids(&self) -> &[Uid] {
        &self.uids
    }

    pub fn msn_of(&self, uid: Uid) -> Result<Msn> {
        self.uids
            .binary_search(&uid)
            .map(|idx| (idx + 1) as Msn)
            .map_err(|_| Error::NotFound(format!("uid {}", uid)))
    }

    pub fn uid_of(&self, msn: Msn) -> Result<Uid> {
        (msn as usize)
            .checked_sub(1)
            .and_then(|idx| self.uids.get(idx).copied())
            .ok_or_else(|| Error::NotFound(format!("msn {}", msn)))
    }

    pub fn info(&self, uid: Uid) -> Option<&MessageInfo> {
        self.messages.get(&uid)
    }

    pub fn info_by_msn(&self, msn: Msn) -> Option<&MessageInfo> {
        self.uid_of(msn).ok().and_then(|uid| self.messages.get(&uid))
    }

    /// Remove a message. Every higher MSN shifts down by one. Returns the
    /// MSN the message had.
    pub fn apply_expunge(&mut self, uid: Uid) -> Result<Msn> {
        let idx = self
            .uids
            .binary_search(&uid)
            .map_err(|_| Error::NotFound(format!("uid {}", uid)))?;
        self.uids.remove(idx);
        self.messages.remove(&uid);
        self.invalidate();
        Ok((idx + 1) as Msn)
    }

    /// Add a message at the end. Its UID must be above every UID in view.
    pub fn apply_append(&mut self, info: MessageInfo) -> Result<Msn> {
        if let Some(last) = self.uids.last() {
            if info.uid <= *last {
                return Err(Error::Sync(format!(
                    "uid {} is not above the last uid {}",
                    info.uid, last
                )));
            }
        }
        self.keywords.extend(info.flags.keywords.iter().cloned());
        self.uidnext = self.uidnext.max(info.uid + 1);
        self.uids.push(info.uid);
        self.messages.insert(info.uid, info);
        self.invalidate();
        Ok(self.uids.len() as Msn)
    }

    /// Replace the flags of one message
    pub fn set_flags(&mut self, uid: Uid, flags: MessageFlags) -> Result<()> {
        let info = self
            .messages
            .get_mut(&uid)
            .ok_or_else(|| Error::NotFound(format!("uid {}", uid)))?;
        self.keywords.extend(flags.keywords.iter().cloned());
        info.flags = flags;
        Ok(())
    }

    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Clear `\Recent` on every message in the view
    pub fn clear_recent(&mut self) {
        for info in self.messages.values_mut() {
            info.flags.recent = false;
        }
    }

    /// Re-read the message list and bring the view up to date.
    ///
    /// `\Recent` of messages already in view is kept as this session saw
    /// it; the store's copy may have been cleared by another session.
    pub async fn resync(&mut self, store: &Store) -> Result<ChangeSet> {
        let fresh: OrderedSet<MessageInfo> = store
            .messages
            .list(self.id)
            .await?
            .into_iter()
            .map(MessageInfo::from)
            .collect();
        let current: OrderedSet<MessageInfo> = self.messages.values().cloned().collect();

        let mut changes = ChangeSet::default();

        for gone in current.difference(&fresh).iter().rev() {
            let msn = self.msn_of(gone.uid)?;
            changes.expunged.push((gone.uid, msn));
        }
        changes.appended = fresh.difference(&current).keys().copied().collect();

        let mut merged = Vec::with_capacity(fresh.len());
        for info in fresh.iter() {
            let mut info = info.clone();
            if let Some(old) = current.get(&info.uid) {
                info.flags.recent = old.flags.recent;
                if old.flags != info.flags {
                    changes.flags_changed.push(info.uid);
                }
            }
            merged.push(info);
        }

        self.load(merged);
        if !changes.is_empty() {
            self.invalidate();
            debug!(
                mailbox = %self.name,
                expunged = changes.expunged.len(),
                appended = changes.appended.len(),
                flags_changed = changes.flags_changed.len(),
                "Resynced mailbox"
            );
        }
        Ok(changes)
    }

    fn invalidate(&mut self) {
        self.sorted = None;
        self.search = None;
    }

    pub fn recent(&self) -> usize {
        self.messages.values().filter(|m| m.flags.recent).count()
    }

    pub fn unseen(&self) -> usize {
        self.messages.values().filter(|m| !m.flags.seen).count()
    }

    /// MSN of the first message without `\Seen`
    pub fn first_unseen(&self) -> Option<Msn> {
        self.uids
            .iter()
            .position(|uid| self.messages.get(uid).map(|m| !m.flags.seen).unwrap_or(false))
            .map(|idx| (idx + 1) as Msn)
    }

    /// System flags followed by every keyword seen in this mailbox
    pub fn flags_list(&self) -> Vec<String> {
        SYSTEM_FLAGS
            .iter()
            .map(|f| f.to_string())
            .chain(self.keywords.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mailstore_storage::{MemoryStore, NewMessage};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn info(uid: Uid) -> MessageInfo {
        MessageInfo {
            uid,
            flags: MessageFlags::default(),
            internal_date: Utc::now(),
            size: 10,
        }
    }

    fn state_with(uids: &[Uid]) -> MailboxState {
        let mailbox = Mailbox {
            id: 1,
            owner_id: 1,
            name: "INBOX".to_string(),
            permission: MailboxPermission::ReadWrite.code(),
            subscribed: true,
            uidnext: 1,
            created_at: Utc::now(),
        };
        let mut state = MailboxState::new(&mailbox);
        state.load(uids.iter().map(|u| info(*u)));
        state
    }

    #[test]
    fn test_bijection() {
        let state = state_with(&[3, 9, 12, 40]);
        for msn in 1..=state.exists() as Msn {
            assert_eq!(state.msn_of(state.uid_of(msn).unwrap()).unwrap(), msn);
        }
        for uid in state.uids().to_vec() {
            assert_eq!(state.uid_of(state.msn_of(uid).unwrap()).unwrap(), uid);
        }
        assert!(state.uid_of(0).is_err());
        assert!(state.uid_of(5).is_err());
        assert_eq!(state.msn_of(4).unwrap_err().code(), "NOT_FOUND");
    }

    #[test]
    fn test_expunge_shifts_higher_msns() {
        let mut state = state_with(&[10, 20, 30, 40]);
        let before: Vec<(Uid, Msn)> = state
            .uids()
            .iter()
            .map(|u| (*u, state.msn_of(*u).unwrap()))
            .collect();

        assert_eq!(state.apply_expunge(20).unwrap(), 2);
        assert_eq!(state.exists(), 3);
        for (uid, msn) in before {
            match uid {
                10 => assert_eq!(state.msn_of(uid).unwrap(), msn),
                20 => assert!(state.msn_of(uid).is_err()),
                _ => assert_eq!(state.msn_of(uid).unwrap(), msn - 1),
            }
        }
    }

    #[test]
    fn test_append_takes_next_msn() {
        let mut state = state_with(&[5, 6]);
        let exists = state.exists() as Msn;
        assert_eq!(state.apply_append(info(9)).unwrap(), exists + 1);
        assert_eq!(state.uidnext(), 10);

        let err = state.apply_append(info(7)).unwrap_err();
        assert_eq!(err.code(), "SYNC_ERROR");
    }

    #[test]
    fn test_expunge_then_append_scenario() {
        let mut state = state_with(&[100, 101, 102]);
        assert_eq!(state.uids(), &[100, 101, 102]);

        state.apply_expunge(101).unwrap();
        assert_eq!(state.uids(), &[100, 102]);
        assert_eq!(state.msn_of(102).unwrap(), 2);

        state.apply_append(info(103)).unwrap();
        assert_eq!(state.uids(), &[100, 102, 103]);
        assert_eq!(
            [100, 102, 103].map(|u| state.msn_of(u).unwrap()),
            [1, 2, 3]
        );
    }

    #[test]
    fn test_flags_and_counters() {
        let mut state = state_with(&[1, 2, 3]);
        let seen = MessageFlags::from_imap(&["\\Seen", "$Work"]);
        state.set_flags(1, seen).unwrap();
        state.set_flags(2, MessageFlags::from_imap(&["\\Seen"])).unwrap();

        assert_eq!(state.unseen(), 1);
        assert_eq!(state.first_unseen(), Some(3));
        assert!(state.flags_list().contains(&"$Work".to_string()));
        assert_eq!(state.flags_list()[0], "\\Seen");
        assert!(state.set_flags(99, MessageFlags::default()).is_err());
    }

    fn new_message(mailbox_id: MailboxId) -> NewMessage {
        NewMessage {
            mailbox_id,
            raw: b"Subject: hi\r\n\r\nbody\r\n".to_vec(),
            flags: MessageFlags::default(),
            internal_date: Utc::now(),
            sent_date: None,
            headers: vec![("subject".to_string(), "hi".to_string())],
        }
    }

    #[tokio::test]
    async fn test_open_and_resync() {
        let backing = Arc::new(MemoryStore::new());
        let store = Store::memory(backing);
        let user = store.users.create("joe", "").await.unwrap();
        let inbox = store
            .mailboxes
            .create(user.id, "INBOX", MailboxPermission::ReadWrite)
            .await
            .unwrap();

        let a = store.messages.append(new_message(inbox.id)).await.unwrap();
        let b = store.messages.append(new_message(inbox.id)).await.unwrap();
        let c = store.messages.append(new_message(inbox.id)).await.unwrap();

        let mut state = MailboxState::open(&store, inbox.id).await.unwrap();
        assert_eq!(state.exists(), 3);
        assert_eq!(state.recent(), 3);
        state.sorted = Some(vec![1, 2, 3]);

        // another session expunges a and c, flags b and delivers d
        let del = MessageFlags::from_imap(&["\\Deleted"]);
        store.messages.store_flags(inbox.id, a, &del).await.unwrap();
        store.messages.store_flags(inbox.id, c, &del).await.unwrap();
        store.messages.expunge(inbox.id).await.unwrap();
        store
            .messages
            .store_flags(inbox.id, b, &MessageFlags::from_imap(&["\\Flagged"]))
            .await
            .unwrap();
        store.messages.clear_recent(inbox.id).await.unwrap();
        let d = store.messages.append(new_message(inbox.id)).await.unwrap();

        let changes = state.resync(&store).await.unwrap();
        assert_eq!(changes.expunged, vec![(c, 3), (a, 1)]);
        assert_eq!(changes.appended, vec![d]);
        assert_eq!(changes.flags_changed, vec![b]);
        assert_eq!(state.uids(), &[b, d]);
        assert!(state.info(b).unwrap().flags.recent);
        assert!(state.sorted.is_none());

        let again = state.resync(&store).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_open_unknown_mailbox_is_storage_error() {
        let store = Store::memory(Arc::new(MemoryStore::new()));
        let err = MailboxState::open(&store, 42).await.unwrap_err();
        assert_eq!(err.code(), "STORAGE_ERROR");
    }
}
