//! IMAP Session management
//!
//! Holds the authenticated user and the selected mailbox of one
//! connection, and maps client mailbox names onto stored mailboxes.
//!
//! A user's own mailboxes are named as stored, with `INBOX` matched
//! case-insensitively. Mailboxes of other users are reached through the
//! other-users namespace as `#Users/<owner>/<name>`.

use crate::mailbox::MailboxState;
use crate::session::ClientState;
use mailstore_common::types::{UserId, ANYONE_USER};
use mailstore_common::{Error, Result};
use mailstore_storage::{Mailbox, Store};
use regex::Regex;

/// Prefix of the other-users namespace
pub const USERS_NAMESPACE: &str = "#Users/";

/// IMAP Session
#[derive(Debug, Default)]
pub struct ImapSession {
    /// Authenticated user id and login name
    pub user: Option<(UserId, String)>,
    /// Currently selected mailbox
    pub selected: Option<MailboxState>,
    /// Selected through EXAMINE
    pub read_only: bool,
    logged_out: bool,
}

impl ImapSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set authenticated state
    pub fn authenticate(&mut self, user_id: UserId, name: impl Into<String>) {
        self.user = Some((user_id, name.into()));
    }

    /// Select a mailbox
    pub fn select(&mut self, mailbox: MailboxState, read_only: bool) {
        self.selected = Some(mailbox);
        self.read_only = read_only;
    }

    /// Close the selected mailbox
    pub fn close_mailbox(&mut self) {
        self.selected = None;
        self.read_only = false;
    }

    pub fn logout(&mut self) {
        self.logged_out = true;
    }

    /// Connection state implied by the session contents
    pub fn state(&self) -> ClientState {
        if self.logged_out {
            ClientState::Logout
        } else if self.selected.is_some() {
            ClientState::Selected
        } else if self.user.is_some() {
            ClientState::Authenticated
        } else {
            ClientState::NonAuthenticated
        }
    }

    pub fn user_id(&self) -> Result<UserId> {
        self.user
            .as_ref()
            .map(|(id, _)| *id)
            .ok_or_else(|| Error::Auth("not authenticated".to_string()))
    }

    pub fn selected_mut(&mut self) -> Result<&mut MailboxState> {
        self.selected
            .as_mut()
            .ok_or_else(|| Error::Validation("no mailbox selected".to_string()))
    }
}

/// Owner id and stored name addressed by a client mailbox name.
/// `None` when the name points at an unknown user.
pub async fn owner_and_name(
    store: &Store,
    user: UserId,
    name: &str,
) -> Result<Option<(UserId, String)>> {
    if let Some(rest) = name.strip_prefix(USERS_NAMESPACE) {
        let Some((owner, mailbox)) = rest.split_once('/') else {
            return Ok(None);
        };
        if owner == ANYONE_USER {
            return Ok(None);
        }
        return Ok(store
            .users
            .find_by_name(owner)
            .await?
            .map(|u| (u.id, normalize(mailbox))));
    }
    Ok(Some((user, normalize(name))))
}

/// Look up the mailbox a client name refers to
pub async fn resolve(store: &Store, user: UserId, name: &str) -> Result<Option<Mailbox>> {
    match owner_and_name(store, user, name).await? {
        Some((owner, name)) => store.mailboxes.find_by_name(owner, &name).await,
        None => Ok(None),
    }
}

/// Name of a mailbox as shown to `user`
pub async fn display_name(store: &Store, user: UserId, mailbox: &Mailbox) -> Result<String> {
    if mailbox.owner_id == user {
        return Ok(mailbox.name.clone());
    }
    let owner = store
        .users
        .get(mailbox.owner_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("user {}", mailbox.owner_id)))?;
    Ok(format!("{}{}/{}", USERS_NAMESPACE, owner.name, mailbox.name))
}

fn normalize(name: &str) -> String {
    if name.eq_ignore_ascii_case("INBOX") {
        "INBOX".to_string()
    } else {
        name.to_string()
    }
}

/// Matcher for LIST and LSUB patterns: `*` matches anything, `%` anything
/// but the hierarchy separator.
pub fn list_matcher(reference: &str, pattern: &str) -> Result<Regex> {
    let mut expr = String::from("^");
    for c in format!("{}{}", reference, pattern).chars() {
        match c {
            '*' => expr.push_str(".*"),
            '%' => expr.push_str("[^/]*"),
            c => expr.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| Error::InvalidQuery(format!("invalid pattern: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailstore_common::types::MailboxPermission;
    use mailstore_storage::MemoryStore;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn test_session_states() {
        let mut session = ImapSession::new();
        assert_eq!(session.state(), ClientState::NonAuthenticated);
        assert!(session.user_id().is_err());

        session.authenticate(7, "joe");
        assert_eq!(session.state(), ClientState::Authenticated);
        assert_eq!(session.user_id().unwrap(), 7);
        assert!(session.selected_mut().is_err());

        session.logout();
        assert_eq!(session.state(), ClientState::Logout);
    }

    #[test]
    fn test_list_matcher() {
        let all = list_matcher("", "*").unwrap();
        assert!(all.is_match("INBOX"));
        assert!(all.is_match("Work/2024"));

        let top = list_matcher("", "%").unwrap();
        assert!(top.is_match("Work"));
        assert!(!top.is_match("Work/2024"));

        let below = list_matcher("Work/", "%").unwrap();
        assert!(below.is_match("Work/2024"));
        assert!(!below.is_match("Work"));

        let literal = list_matcher("", "a.b").unwrap();
        assert!(literal.is_match("a.b"));
        assert!(!literal.is_match("axb"));
    }

    #[tokio::test]
    async fn test_resolve_names() {
        let store = Store::memory(Arc::new(MemoryStore::new()));
        let joe = store.users.create("joe", "").await.unwrap().id;
        let bob = store.users.create("bob", "").await.unwrap().id;
        let inbox = store
            .mailboxes
            .create(joe, "INBOX", MailboxPermission::ReadWrite)
            .await
            .unwrap();
        let shared = store
            .mailboxes
            .create(bob, "Shared", MailboxPermission::ReadWrite)
            .await
            .unwrap();

        let found = resolve(&store, joe, "inbox").await.unwrap().unwrap();
        assert_eq!(found.id, inbox.id);

        let found = resolve(&store, joe, "#Users/bob/Shared").await.unwrap().unwrap();
        assert_eq!(found.id, shared.id);
        assert_eq!(
            display_name(&store, joe, &found).await.unwrap(),
            "#Users/bob/Shared"
        );
        assert_eq!(display_name(&store, bob, &found).await.unwrap(), "Shared");

        assert!(resolve(&store, joe, "#Users/nobody/INBOX").await.unwrap().is_none());
        assert!(resolve(&store, joe, "#Users/bob").await.unwrap().is_none());
        assert!(resolve(&store, joe, "Missing").await.unwrap().is_none());
    }
}
