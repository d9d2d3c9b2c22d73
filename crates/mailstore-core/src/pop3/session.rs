//! POP3 Session management
//!
//! Holds the maildrop of one POP3 connection: the INBOX view and the
//! messages marked for deletion, which are only removed on QUIT.

use crate::mailbox::{MailboxState, MessageInfo};
use mailstore_common::types::{Msn, Uid, UserId};
use std::collections::BTreeSet;

/// POP3 Session
#[derive(Debug, Default)]
pub struct Pop3Session {
    /// Username given with USER
    pub username: Option<String>,
    /// Authenticated user id and login name
    pub user: Option<(UserId, String)>,
    /// The maildrop, locked in at PASS
    pub maildrop: Option<MailboxState>,
    /// Message numbers marked with DELE
    deleted: BTreeSet<Msn>,
}

impl Pop3Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the transaction state with `maildrop` open
    pub fn authenticate(&mut self, user_id: UserId, name: String, maildrop: MailboxState) {
        self.username = None;
        self.user = Some((user_id, name));
        self.maildrop = Some(maildrop);
        self.deleted.clear();
    }

    /// Message by number, unless it is marked deleted
    pub fn get(&self, msg: u32) -> Option<&MessageInfo> {
        if self.deleted.contains(&msg) {
            return None;
        }
        self.maildrop.as_ref()?.info_by_msn(msg)
    }

    /// Messages not marked deleted, with their numbers
    pub fn messages(&self) -> Vec<(Msn, &MessageInfo)> {
        let Some(maildrop) = self.maildrop.as_ref() else {
            return Vec::new();
        };
        (1..=maildrop.exists() as Msn)
            .filter(|msn| !self.deleted.contains(msn))
            .filter_map(|msn| maildrop.info_by_msn(msn).map(|info| (msn, info)))
            .collect()
    }

    pub fn message_count(&self) -> usize {
        self.messages().len()
    }

    pub fn total_size(&self) -> u64 {
        self.messages().iter().map(|(_, info)| info.size).sum()
    }

    /// Mark a message for deletion. False for unknown or already deleted
    /// messages.
    pub fn mark_deleted(&mut self, msg: u32) -> bool {
        if self.get(msg).is_none() {
            return false;
        }
        self.deleted.insert(msg)
    }

    /// Reset deletions (RSET command)
    pub fn reset_deletions(&mut self) {
        self.deleted.clear();
    }

    /// UIDs of the messages marked for deletion
    pub fn deleted_uids(&self) -> Vec<Uid> {
        let Some(maildrop) = self.maildrop.as_ref() else {
            return Vec::new();
        };
        self.deleted
            .iter()
            .filter_map(|msn| maildrop.uid_of(*msn).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mailstore_common::types::{MailboxPermission, MessageFlags};
    use mailstore_storage::Mailbox;
    use pretty_assertions::assert_eq;

    fn maildrop() -> MailboxState {
        let mailbox = Mailbox {
            id: 1,
            owner_id: 2,
            name: "INBOX".to_string(),
            permission: MailboxPermission::ReadWrite.code(),
            subscribed: true,
            uidnext: 1,
            created_at: Utc::now(),
        };
        let mut state = MailboxState::new(&mailbox);
        for (uid, size) in [(10, 100), (11, 200), (15, 50)] {
            state
                .apply_append(MessageInfo {
                    uid,
                    flags: MessageFlags::default(),
                    internal_date: Utc::now(),
                    size,
                })
                .unwrap();
        }
        state
    }

    #[test]
    fn test_session_new() {
        let session = Pop3Session::new();
        assert!(session.user.is_none());
        assert_eq!(session.message_count(), 0);
        assert!(session.get(1).is_none());
    }

    #[test]
    fn test_message_operations() {
        let mut session = Pop3Session::new();
        session.username = Some("joe".to_string());
        session.authenticate(2, "joe".to_string(), maildrop());
        assert!(session.username.is_none());

        assert_eq!(session.message_count(), 3);
        assert_eq!(session.total_size(), 350);
        assert_eq!(session.get(2).map(|m| m.uid), Some(11));

        assert!(session.mark_deleted(2));
        assert!(!session.mark_deleted(2));
        assert!(!session.mark_deleted(9));
        assert_eq!(session.message_count(), 2);
        assert_eq!(session.total_size(), 150);
        assert!(session.get(2).is_none());
        assert_eq!(
            session.messages().iter().map(|(n, _)| *n).collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert_eq!(session.deleted_uids(), vec![11]);

        session.reset_deletions();
        assert_eq!(session.message_count(), 3);
        assert!(session.deleted_uids().is_empty());
    }
}
