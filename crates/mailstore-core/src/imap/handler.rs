//! IMAP command execution
//!
//! Handlers append their untagged responses to the outbound buffer and
//! return the text of the tagged OK. Failures are returned as
//! [`mailstore_common::Error`]; the connection loop turns them into NO or
//! BAD completions.

use super::command::{FetchItem, ImapCommand, Section, StatusItem, StoreFlags, StoreOperation};
use super::response::ImapResponse;
use super::session::{display_name, list_matcher, owner_and_name, resolve, ImapSession};
use crate::acl::{self, has_right, AclTarget};
use crate::auth::decode_plain;
use crate::backend::Backends;
use crate::delivery::new_message;
use crate::mailbox::{MailboxState, MessageInfo};
use crate::quota::{self, Quota, QUOTA_ROOT};
use crate::search::{self, mime::top_level_headers, SearchKey, SortCriterion};
use crate::sequence::SequenceSet;
use chrono::{DateTime, Utc};
use mailstore_common::types::{AclRight, MailboxPermission, MessageFlags, Msn, Uid, UserId};
use mailstore_common::{Error, Result};
use mailstore_storage::{Mailbox, Store};
use tracing::{debug, info};

/// Executes commands for one session
pub struct Handler<'a> {
    backends: &'a Backends,
    session: &'a mut ImapSession,
    out: &'a mut Vec<u8>,
}

impl<'a> Handler<'a> {
    pub fn new(backends: &'a Backends, session: &'a mut ImapSession, out: &'a mut Vec<u8>) -> Self {
        Self {
            backends,
            session,
            out,
        }
    }

    fn push(&mut self, data: impl AsRef<[u8]>) {
        self.out.extend_from_slice(data.as_ref());
    }

    /// Run one command
    pub async fn execute(&mut self, command: ImapCommand) -> Result<String> {
        let name = command.name();
        match command {
            ImapCommand::Capability => self.push(ImapResponse::capability()),
            ImapCommand::Noop | ImapCommand::Check => {}
            ImapCommand::Logout => {
                self.push(ImapResponse::bye("mailstore logging out"));
                self.session.logout();
            }
            ImapCommand::Login { username, password } => self.login(&username, &password).await?,
            ImapCommand::Authenticate {
                mechanism,
                initial_response,
            } => self.authenticate(&mechanism, initial_response.as_deref()).await?,
            ImapCommand::Select { mailbox } => return self.select(&mailbox, false).await,
            ImapCommand::Examine { mailbox } => return self.select(&mailbox, true).await,
            ImapCommand::Create { mailbox } => self.create(&mailbox).await?,
            ImapCommand::Delete { mailbox } => self.delete(&mailbox).await?,
            ImapCommand::Rename {
                old_mailbox,
                new_mailbox,
            } => self.rename(&old_mailbox, &new_mailbox).await?,
            ImapCommand::Subscribe { mailbox } => self.subscribe(&mailbox, true).await?,
            ImapCommand::Unsubscribe { mailbox } => self.subscribe(&mailbox, false).await?,
            ImapCommand::List { reference, pattern } => {
                self.list(&reference, &pattern, false).await?
            }
            ImapCommand::Lsub { reference, pattern } => {
                self.list(&reference, &pattern, true).await?
            }
            ImapCommand::Status { mailbox, items } => self.status(&mailbox, &items).await?,
            ImapCommand::Append {
                mailbox,
                flags,
                date,
                message,
            } => self.append(&mailbox, &flags, date.as_deref(), &message).await?,
            ImapCommand::Namespace => self.push(ImapResponse::namespace()),
            ImapCommand::GetAcl { mailbox } => self.getacl(&mailbox).await?,
            ImapCommand::SetAcl {
                mailbox,
                identifier,
                rights,
            } => self.setacl(&mailbox, &identifier, Some(rights.as_str())).await?,
            ImapCommand::DeleteAcl {
                mailbox,
                identifier,
            } => self.setacl(&mailbox, &identifier, None).await?,
            ImapCommand::MyRights { mailbox } => self.myrights(&mailbox).await?,
            ImapCommand::ListRights {
                mailbox,
                identifier,
            } => self.listrights(&mailbox, &identifier).await?,
            ImapCommand::GetQuota { root } => self.getquota(&root).await?,
            ImapCommand::GetQuotaRoot { mailbox } => self.getquotaroot(&mailbox).await?,
            ImapCommand::Close => self.close().await?,
            ImapCommand::Expunge => self.expunge().await?,
            ImapCommand::Search { key, uid } => self.search(&key, None, uid).await?,
            ImapCommand::Sort { criteria, key, uid } => {
                self.search(&key, Some(&criteria), uid).await?
            }
            ImapCommand::Fetch {
                sequence,
                items,
                uid,
            } => self.fetch(&sequence, items, uid).await?,
            ImapCommand::Store {
                sequence,
                flags,
                uid,
            } => self.store(&sequence, &flags, uid).await?,
            ImapCommand::Copy {
                sequence,
                mailbox,
                uid,
            } => self.copy(&sequence, &mailbox, uid).await?,
        }
        Ok(format!("{} completed", name))
    }

    /// Resync the selected mailbox and report what changed underneath it
    pub async fn report_changes(&mut self) -> Result<()> {
        let store = &self.backends.store;
        let Some(state) = self.session.selected.as_mut() else {
            return Ok(());
        };
        let changes = state.resync(store).await?;

        for (_, msn) in &changes.expunged {
            self.out.extend_from_slice(ImapResponse::expunge(*msn).as_bytes());
        }
        if !changes.appended.is_empty() {
            self.out
                .extend_from_slice(ImapResponse::exists(state.exists()).as_bytes());
            self.out
                .extend_from_slice(ImapResponse::recent(state.recent()).as_bytes());
        }
        for uid in &changes.flags_changed {
            if let (Ok(msn), Some(info)) = (state.msn_of(*uid), state.info(*uid)) {
                let line = format!(
                    "* {} FETCH (FLAGS {})\r\n",
                    msn,
                    ImapResponse::format_flags(&info.flags)
                );
                self.out.extend_from_slice(line.as_bytes());
            }
        }
        Ok(())
    }

    async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        match self.backends.auth.validate(username, password).await? {
            Some(user_id) => {
                info!(user = %username, user_id, "IMAP login");
                self.session.authenticate(user_id, username);
                Ok(())
            }
            None => Err(Error::Auth("invalid credentials".to_string())),
        }
    }

    async fn authenticate(&mut self, mechanism: &str, response: Option<&str>) -> Result<()> {
        if !mechanism.eq_ignore_ascii_case("PLAIN") {
            return Err(Error::Validation(format!(
                "unsupported authentication mechanism {}",
                mechanism
            )));
        }
        let response =
            response.ok_or_else(|| Error::InvalidQuery("missing credentials".to_string()))?;
        let (username, password) = decode_plain(response)
            .ok_or_else(|| Error::InvalidQuery("invalid PLAIN credentials".to_string()))?;
        self.login(&username, &password).await
    }

    async fn select(&mut self, name: &str, examine: bool) -> Result<String> {
        let backends = self.backends;
        let store = &backends.store;
        let user = self.session.user_id()?;
        // a failed SELECT leaves no mailbox selected
        self.session.close_mailbox();

        let mailbox = lookup(store, user, name).await?;
        require(store, &mailbox, user, AclRight::Read, name).await?;

        let mut state = MailboxState::open(store, mailbox.id).await?;
        if examine {
            state.permission = MailboxPermission::ReadOnly;
        }
        let read_only = state.is_read_only();
        if !read_only {
            store.messages.clear_recent(mailbox.id).await?;
        }

        let flags = state.flags_list();
        self.push(ImapResponse::mailbox_flags(&flags));
        self.push(ImapResponse::exists(state.exists()));
        self.push(ImapResponse::recent(state.recent()));
        if let Some(msn) = state.first_unseen() {
            self.push(ImapResponse::unseen(msn));
        }
        if read_only {
            self.push("* OK [PERMANENTFLAGS ()] No permanent flags permitted\r\n");
        } else {
            self.push(ImapResponse::permanent_flags(&flags));
        }
        self.push(ImapResponse::uid_validity(state.uidvalidity()));
        self.push(ImapResponse::uid_next(state.uidnext()));

        info!(mailbox = %state.name, exists = state.exists(), read_only, "Mailbox selected");
        self.session.select(state, read_only);

        let command = if examine { "EXAMINE" } else { "SELECT" };
        Ok(if read_only {
            format!("[READ-ONLY] {} completed", command)
        } else {
            format!("[READ-WRITE] {} completed", command)
        })
    }

    async fn create(&mut self, name: &str) -> Result<()> {
        let store = &self.backends.store;
        let user = self.session.user_id()?;
        let name = name.trim_end_matches('/');
        if name.is_empty() {
            return Err(Error::Validation("empty mailbox name".to_string()));
        }

        let (owner, stored) = owner_and_name(store, user, name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no such user for {}", name)))?;
        if owner != user {
            return Err(Error::PermissionDenied(
                "cannot create mailboxes of other users".to_string(),
            ));
        }
        if store.mailboxes.find_by_name(owner, &stored).await?.is_some() {
            return Err(Error::Validation(format!("mailbox {} already exists", name)));
        }
        store
            .mailboxes
            .create(owner, &stored, MailboxPermission::ReadWrite)
            .await?;
        info!(user_id = user, mailbox = %stored, "Mailbox created");
        Ok(())
    }

    async fn delete(&mut self, name: &str) -> Result<()> {
        let store = &self.backends.store;
        let user = self.session.user_id()?;
        let mailbox = lookup(store, user, name).await?;
        if mailbox.owner_id == user && mailbox.name == "INBOX" {
            return Err(Error::Validation("cannot delete INBOX".to_string()));
        }
        require(store, &mailbox, user, AclRight::Delete, name).await?;

        if self.session.selected.as_ref().map(|s| s.id) == Some(mailbox.id) {
            self.session.close_mailbox();
        }
        store.mailboxes.delete(mailbox.id).await?;
        info!(user_id = user, mailbox = %mailbox.name, "Mailbox deleted");
        Ok(())
    }

    async fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        let store = &self.backends.store;
        let user = self.session.user_id()?;
        let mailbox = lookup(store, user, old).await?;
        if mailbox.owner_id == user && mailbox.name == "INBOX" {
            return Err(Error::Validation("renaming INBOX is not supported".to_string()));
        }
        require(store, &mailbox, user, AclRight::Delete, old).await?;

        let (owner, stored) = owner_and_name(store, user, new.trim_end_matches('/'))
            .await?
            .ok_or_else(|| Error::NotFound(format!("no such user for {}", new)))?;
        if owner != mailbox.owner_id {
            return Err(Error::PermissionDenied(
                "cannot move mailboxes between users".to_string(),
            ));
        }
        if store.mailboxes.find_by_name(owner, &stored).await?.is_some() {
            return Err(Error::Validation(format!("mailbox {} already exists", new)));
        }

        let prefix = format!("{}/", mailbox.name);
        let children: Vec<Mailbox> = store
            .mailboxes
            .list_visible(user)
            .await?
            .into_iter()
            .filter(|m| m.owner_id == owner && m.name.starts_with(&prefix))
            .collect();

        store.mailboxes.rename(mailbox.id, &stored).await?;
        for child in &children {
            let renamed = format!("{}/{}", stored, &child.name[prefix.len()..]);
            store.mailboxes.rename(child.id, &renamed).await?;
        }

        if let Some(state) = self.session.selected.as_mut() {
            if state.id == mailbox.id {
                state.rename(stored.clone());
            }
        }
        info!(user_id = user, from = %mailbox.name, to = %stored, "Mailbox renamed");
        Ok(())
    }

    async fn subscribe(&mut self, name: &str, subscribed: bool) -> Result<()> {
        let store = &self.backends.store;
        let user = self.session.user_id()?;
        let mailbox = lookup(store, user, name).await?;
        require(store, &mailbox, user, AclRight::Lookup, name).await?;
        store.mailboxes.set_subscribed(mailbox.id, subscribed).await
    }

    async fn list(&mut self, reference: &str, pattern: &str, lsub: bool) -> Result<()> {
        let backends = self.backends;
        let store = &backends.store;
        let user = self.session.user_id()?;
        let kind = if lsub { "LSUB" } else { "LIST" };

        if pattern.is_empty() {
            // hierarchy delimiter query
            self.push(ImapResponse::list(kind, &["\\Noselect"], ""));
            return Ok(());
        }

        let matcher = list_matcher(reference, pattern)?;
        let mut names = Vec::new();
        for mailbox in store.mailboxes.list_visible(user).await? {
            if lsub && !mailbox.subscribed {
                continue;
            }
            if !has_right(store, &mailbox, user, AclRight::Lookup).await? {
                continue;
            }
            names.push(display_name(store, user, &mailbox).await?);
        }

        for name in &names {
            if !matcher.is_match(name) {
                continue;
            }
            let children = names.iter().any(|other| {
                other.len() > name.len() + 1
                    && other.starts_with(name.as_str())
                    && other.as_bytes()[name.len()] == b'/'
            });
            let flag = if children {
                "\\HasChildren"
            } else {
                "\\HasNoChildren"
            };
            self.push(ImapResponse::list(kind, &[flag], name));
        }
        Ok(())
    }

    async fn status(&mut self, name: &str, items: &[StatusItem]) -> Result<()> {
        let backends = self.backends;
        let store = &backends.store;
        let user = self.session.user_id()?;
        let mailbox = lookup(store, user, name).await?;
        require(store, &mailbox, user, AclRight::Read, name).await?;

        let opened;
        let state = match self.session.selected.as_ref() {
            Some(selected) if selected.id == mailbox.id => selected,
            _ => {
                opened = MailboxState::open(store, mailbox.id).await?;
                &opened
            }
        };

        let values: Vec<(&str, u64)> = items
            .iter()
            .map(|item| {
                let value = match item {
                    StatusItem::Messages => state.exists() as u64,
                    StatusItem::Recent => state.recent() as u64,
                    StatusItem::UidNext => state.uidnext(),
                    StatusItem::UidValidity => state.uidvalidity(),
                    StatusItem::Unseen => state.unseen() as u64,
                };
                (item.name(), value)
            })
            .collect();
        let line = ImapResponse::status(name, &values);
        self.push(line);
        Ok(())
    }

    async fn append(
        &mut self,
        name: &str,
        flags: &[String],
        date: Option<&str>,
        raw: &[u8],
    ) -> Result<()> {
        let backends = self.backends;
        let store = &backends.store;
        let user = self.session.user_id()?;
        let mailbox = resolve(store, user, name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("[TRYCREATE] no such mailbox {}", name)))?;
        require(store, &mailbox, user, AclRight::Insert, name).await?;

        quota::reserve(store, mailbox.owner_id, raw.len() as u64).await?;

        let mut message = new_message(mailbox.id, raw, MessageFlags::from_imap(flags));
        if let Some(date) = date {
            message.internal_date = parse_date_time(date)
                .ok_or_else(|| Error::InvalidQuery(format!("invalid date-time {}", date)))?;
        }
        let uid = store.messages.append(message).await?;
        debug!(mailbox = %mailbox.name, uid, size = raw.len(), "Message appended");

        if self.session.selected.as_ref().map(|s| s.id) == Some(mailbox.id) {
            self.report_changes().await?;
        }
        Ok(())
    }

    async fn getacl(&mut self, name: &str) -> Result<()> {
        let store = &self.backends.store;
        let user = self.session.user_id()?;
        let mailbox = lookup(store, user, name).await?;
        require(store, &mailbox, user, AclRight::Administer, name).await?;
        let rights = acl::list_rights_for_mailbox(store, &mailbox).await?;
        self.push(ImapResponse::acl(name, &rights));
        Ok(())
    }

    /// SETACL with `rights`, DELETEACL without
    async fn setacl(&mut self, name: &str, identifier: &str, rights: Option<&str>) -> Result<()> {
        let store = &self.backends.store;
        let user = self.session.user_id()?;
        let mailbox = lookup(store, user, name).await?;
        require(store, &mailbox, user, AclRight::Administer, name).await?;
        let target = identifier_id(store, identifier).await?;

        match rights {
            Some(rights) => {
                acl::set_rights(store, mailbox.id, target, rights).await?;
            }
            None => acl::delete_rights(store, mailbox.id, target).await?,
        }
        info!(
            mailbox = %mailbox.name,
            identifier = %identifier,
            rights = rights.unwrap_or(""),
            "ACL changed"
        );
        Ok(())
    }

    async fn myrights(&mut self, name: &str) -> Result<()> {
        let store = &self.backends.store;
        let user = self.session.user_id()?;
        let mailbox = lookup(store, user, name).await?;
        let rights = acl::myrights(store, &mailbox, user).await?;
        if rights.is_empty() {
            return Err(Error::PermissionDenied(format!("no rights on {}", name)));
        }
        self.push(ImapResponse::myrights(name, &rights.rights_string()));
        Ok(())
    }

    /// GETQUOTA for the session user's root
    async fn getquota(&mut self, root: &str) -> Result<()> {
        if root != QUOTA_ROOT {
            return Err(Error::NotFound(format!("unknown quota root {}", root)));
        }
        let user = self.session.user_id()?;
        let quota = Quota::load(&self.backends.store, user).await?;
        self.push_quota(&quota);
        Ok(())
    }

    async fn getquotaroot(&mut self, name: &str) -> Result<()> {
        let store = &self.backends.store;
        let user = self.session.user_id()?;
        let mailbox = lookup(store, user, name).await?;
        require(store, &mailbox, user, AclRight::Lookup, name).await?;
        let quota = Quota::load(store, mailbox.owner_id).await?;
        self.push(ImapResponse::quotaroot(name, QUOTA_ROOT));
        self.push_quota(&quota);
        Ok(())
    }

    /// Limits are only reported when set
    fn push_quota(&mut self, quota: &Quota) {
        if quota.is_limited() {
            let (usage, limit) = quota.storage_kib();
            self.push(ImapResponse::quota(QUOTA_ROOT, &[("STORAGE", usage, limit)]));
        }
    }

    async fn listrights(&mut self, name: &str, identifier: &str) -> Result<()> {
        let store = &self.backends.store;
        let user = self.session.user_id()?;
        let mailbox = lookup(store, user, name).await?;
        require(store, &mailbox, user, AclRight::Administer, name).await?;
        let target = identifier_id(store, identifier).await?;
        let rights = acl::listrights(&mailbox, target);
        self.push(ImapResponse::listrights(name, identifier, &rights));
        Ok(())
    }

    /// CLOSE silently expunges when the mailbox is writable
    async fn close(&mut self) -> Result<()> {
        let store = &self.backends.store;
        let user = self.session.user_id()?;
        let read_only = self.session.read_only;
        if let Some(state) = self.session.selected.as_ref() {
            if !read_only && has_right(store, state, user, AclRight::Delete).await? {
                let removed = store.messages.expunge(state.id).await?;
                debug!(mailbox = %state.name, removed = removed.len(), "Expunged on close");
            }
        }
        self.session.close_mailbox();
        Ok(())
    }

    async fn expunge(&mut self) -> Result<()> {
        let store = &self.backends.store;
        let user = self.session.user_id()?;
        if self.session.read_only {
            return Err(Error::Validation("mailbox is read-only".to_string()));
        }
        let state = self.session.selected_mut()?;
        require(store, &*state, user, AclRight::Delete, &state.name).await?;

        let mut removed = store.messages.expunge(state.id).await?;
        // highest MSN first, so no reported number shifts
        removed.sort_unstable_by(|a, b| b.cmp(a));
        for uid in removed {
            if let Ok(msn) = state.apply_expunge(uid) {
                self.out
                    .extend_from_slice(ImapResponse::expunge(msn).as_bytes());
            }
        }
        Ok(())
    }

    async fn search(
        &mut self,
        key: &SearchKey,
        criteria: Option<&[SortCriterion]>,
        uid: bool,
    ) -> Result<()> {
        let store = &self.backends.store;
        let state = self.session.selected_mut()?;

        let mut bits = vec![false; state.exists()];
        search::search(store, &mut bits, key, state).await?;
        let (kind, msns) = match criteria {
            Some(criteria) => ("SORT", search::sort(store, &bits, criteria, state).await?),
            None => ("SEARCH", search::matching_msns(&bits)),
        };

        let numbers: Vec<u64> = if uid {
            msns.iter()
                .filter_map(|msn| state.uid_of(*msn).ok())
                .collect()
        } else {
            msns.iter().map(|msn| *msn as u64).collect()
        };
        self.out
            .extend_from_slice(ImapResponse::numbers(kind, &numbers).as_bytes());
        Ok(())
    }

    async fn fetch(&mut self, sequence: &SequenceSet, mut items: Vec<FetchItem>, uid: bool) -> Result<()> {
        let store = &self.backends.store;
        let user = self.session.user_id()?;
        let read_only = self.session.read_only;
        let state = self.session.selected_mut()?;

        if uid && !items.contains(&FetchItem::Uid) {
            items.insert(0, FetchItem::Uid);
        }
        let marks_seen = items.iter().any(|item| {
            matches!(
                item,
                FetchItem::Rfc822 | FetchItem::Rfc822Text | FetchItem::Body { peek: false, .. }
            )
        });
        let sets_seen =
            marks_seen && !read_only && has_right(store, &*state, user, AclRight::Seen).await?;
        let needs_raw = items.iter().any(|item| {
            matches!(
                item,
                FetchItem::Rfc822
                    | FetchItem::Rfc822Header
                    | FetchItem::Rfc822Text
                    | FetchItem::Envelope
                    | FetchItem::Body { .. }
            )
        });

        for (msn, uid) in targets(state, sequence, uid) {
            let raw = if needs_raw {
                Some(
                    store
                        .messages
                        .fetch_raw(state.id, uid)
                        .await?
                        .ok_or_else(|| Error::Sync(format!("message {} is gone", uid)))?,
                )
            } else {
                None
            };

            let mut flags_changed = false;
            if sets_seen {
                if let Some(current) = state.info(uid).map(|i| i.flags.clone()) {
                    if !current.seen {
                        let mut updated = current;
                        updated.seen = true;
                        store.messages.store_flags(state.id, uid, &updated).await?;
                        state.set_flags(uid, updated)?;
                        flags_changed = !items.contains(&FetchItem::Flags);
                    }
                }
            }

            let info = state
                .info(uid)
                .ok_or_else(|| Error::Sync(format!("message {} is gone", uid)))?;
            let line = fetch_line(msn, info, &items, raw.as_deref(), flags_changed);
            self.out.extend_from_slice(&line);
        }
        Ok(())
    }

    async fn store(&mut self, sequence: &SequenceSet, flags: &StoreFlags, uid: bool) -> Result<()> {
        let store = &self.backends.store;
        let user = self.session.user_id()?;
        if self.session.read_only {
            return Err(Error::Validation("mailbox is read-only".to_string()));
        }
        let state = self.session.selected_mut()?;

        let requested = MessageFlags::from_imap(&flags.flags);
        let replace = flags.operation == StoreOperation::Replace;
        let mut others = requested.clone();
        others.seen = false;
        if requested.seen || replace {
            require(store, &*state, user, AclRight::Seen, &state.name).await?;
        }
        if others != MessageFlags::default() || replace {
            require(store, &*state, user, AclRight::Write, &state.name).await?;
        }

        for (msn, uid_) in targets(state, sequence, uid) {
            let Some(current) = state.info(uid_).map(|i| i.flags.clone()) else {
                continue;
            };
            let mut updated = current.clone();
            match flags.operation {
                StoreOperation::Replace => updated.replace(&requested),
                StoreOperation::Add => updated.add(&requested),
                StoreOperation::Remove => updated.remove(&requested),
            }
            if updated != current {
                store.messages.store_flags(state.id, uid_, &updated).await?;
                state.set_flags(uid_, updated.clone())?;
            }
            if !flags.silent {
                let mut line = format!(
                    "* {} FETCH (FLAGS {}",
                    msn,
                    ImapResponse::format_flags(&updated)
                );
                if uid {
                    line.push_str(&format!(" UID {}", uid_));
                }
                line.push_str(")\r\n");
                self.out.extend_from_slice(line.as_bytes());
            }
        }
        Ok(())
    }

    async fn copy(&mut self, sequence: &SequenceSet, name: &str, uid: bool) -> Result<()> {
        let backends = self.backends;
        let store = &backends.store;
        let user = self.session.user_id()?;
        let target = resolve(store, user, name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("[TRYCREATE] no such mailbox {}", name)))?;
        require(store, &target, user, AclRight::Insert, name).await?;

        let state = self.session.selected_mut()?;
        let source = state.id;
        let uids: Vec<Uid> = targets(state, sequence, uid).into_iter().map(|(_, u)| u).collect();
        let size: u64 = uids
            .iter()
            .filter_map(|u| state.info(*u))
            .map(|info| info.size)
            .sum();
        quota::reserve(store, target.owner_id, size).await?;

        for uid in &uids {
            store.messages.copy(source, *uid, target.id).await?;
        }
        debug!(from = source, to = target.id, count = uids.len(), "Messages copied");

        if target.id == source {
            self.report_changes().await?;
        }
        Ok(())
    }
}

async fn lookup(store: &Store, user: UserId, name: &str) -> Result<Mailbox> {
    resolve(store, user, name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("no such mailbox {}", name)))
}

async fn require(
    store: &Store,
    mailbox: &impl AclTarget,
    user: UserId,
    right: AclRight,
    name: &str,
) -> Result<()> {
    if has_right(store, mailbox, user, right).await? {
        Ok(())
    } else {
        Err(Error::PermissionDenied(format!(
            "right '{}' required on {}",
            right.letter(),
            name
        )))
    }
}

async fn identifier_id(store: &Store, identifier: &str) -> Result<UserId> {
    store
        .users
        .find_by_name(identifier)
        .await?
        .map(|u| u.id)
        .ok_or_else(|| Error::NotFound(format!("no such identifier {}", identifier)))
}

/// Messages addressed by a sequence set, as (MSN, UID) in MSN order
fn targets(state: &MailboxState, sequence: &SequenceSet, by_uid: bool) -> Vec<(Msn, Uid)> {
    let uids = state.uids();
    let max = if by_uid {
        uids.last().copied().unwrap_or(0)
    } else {
        uids.len() as u64
    };
    uids.iter()
        .enumerate()
        .filter(|(idx, uid)| {
            let n = if by_uid { **uid } else { *idx as u64 + 1 };
            sequence.contains(n, max)
        })
        .map(|(idx, uid)| ((idx + 1) as Msn, *uid))
        .collect()
}

/// `dd-Mon-yyyy hh:mm:ss +zzzz`
fn parse_date_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(s.trim(), "%d-%b-%Y %H:%M:%S %z")
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Header block (with its blank line) and body of a raw message
fn split_message(raw: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
        return raw.split_at(pos + 4);
    }
    if let Some(pos) = raw.windows(2).position(|w| w == b"\n\n") {
        return raw.split_at(pos + 2);
    }
    (raw, &[])
}

/// Header lines named in `names`, folded lines included
fn header_fields(header: &[u8], names: &[String]) -> Vec<u8> {
    let text = String::from_utf8_lossy(header);
    let mut out = String::new();
    let mut keep = false;
    for line in text.split_inclusive('\n') {
        if line.trim_end().is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if keep {
                out.push_str(line);
            }
            continue;
        }
        let name = line.split(':').next().unwrap_or("").trim();
        keep = names.iter().any(|n| n.eq_ignore_ascii_case(name));
        if keep {
            out.push_str(line);
        }
    }
    out.push_str("\r\n");
    out.into_bytes()
}

fn section_bytes(raw: &[u8], section: &Section) -> Vec<u8> {
    let (header, text) = split_message(raw);
    match section {
        Section::Full => raw.to_vec(),
        Section::Header => header.to_vec(),
        Section::Text => text.to_vec(),
        Section::HeaderFields(names) => header_fields(header, names),
    }
}

fn literal(label: &str, data: &[u8]) -> Vec<u8> {
    let mut out = format!("{} {{{}}}\r\n", label, data.len()).into_bytes();
    out.extend_from_slice(data);
    out
}

fn fetch_line(
    msn: Msn,
    info: &MessageInfo,
    items: &[FetchItem],
    raw: Option<&[u8]>,
    with_flags: bool,
) -> Vec<u8> {
    let raw = raw.unwrap_or_default();
    let mut parts: Vec<Vec<u8>> = Vec::with_capacity(items.len() + 1);
    for item in items {
        let part = match item {
            FetchItem::Flags => {
                format!("FLAGS {}", ImapResponse::format_flags(&info.flags)).into_bytes()
            }
            FetchItem::Uid => format!("UID {}", info.uid).into_bytes(),
            FetchItem::InternalDate => format!(
                "INTERNALDATE {}",
                ImapResponse::format_internal_date(&info.internal_date)
            )
            .into_bytes(),
            FetchItem::Rfc822Size => format!("RFC822.SIZE {}", info.size).into_bytes(),
            FetchItem::Envelope => format!(
                "ENVELOPE {}",
                ImapResponse::format_envelope(&top_level_headers(raw))
            )
            .into_bytes(),
            FetchItem::Rfc822 => literal("RFC822", raw),
            FetchItem::Rfc822Header => literal("RFC822.HEADER", split_message(raw).0),
            FetchItem::Rfc822Text => literal("RFC822.TEXT", split_message(raw).1),
            FetchItem::Body {
                section, partial, ..
            } => {
                let data = section_bytes(raw, section);
                match partial {
                    Some((start, length)) => {
                        let from = (*start as usize).min(data.len());
                        let to = from.saturating_add(*length as usize).min(data.len());
                        literal(
                            &format!("BODY[{}]<{}>", section.name(), start),
                            &data[from..to],
                        )
                    }
                    None => literal(&format!("BODY[{}]", section.name()), &data),
                }
            }
        };
        parts.push(part);
    }
    if with_flags {
        parts.push(format!("FLAGS {}", ImapResponse::format_flags(&info.flags)).into_bytes());
    }

    let mut out = format!("* {} FETCH (", msn).into_bytes();
    out.extend_from_slice(&parts.join(&b' '));
    out.extend_from_slice(b")\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const RAW: &[u8] = b"From: alice@example.com\r\nSubject: hello\r\n  world\r\nTo: bob@example.com\r\n\r\nbody text\r\n";

    #[test]
    fn test_split_message() {
        let (header, text) = split_message(RAW);
        assert!(header.ends_with(b"\r\n\r\n"));
        assert_eq!(text, b"body text\r\n");
        assert_eq!(split_message(b"no body"), (&b"no body"[..], &b""[..]));
    }

    #[test]
    fn test_header_fields_keep_folded_lines() {
        let (header, _) = split_message(RAW);
        let fields = header_fields(header, &["SUBJECT".to_string()]);
        assert_eq!(fields, b"Subject: hello\r\n  world\r\n\r\n".to_vec());
    }

    #[test]
    fn test_targets() {
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
        for uid in [4, 9, 12] {
            state
                .apply_append(MessageInfo {
                    uid,
                    flags: MessageFlags::default(),
                    internal_date: Utc::now(),
                    size: 1,
                })
                .unwrap();
        }

        let all = SequenceSet::parse("1:*").unwrap();
        assert_eq!(targets(&state, &all, false), vec![(1, 4), (2, 9), (3, 12)]);
        let by_uid = SequenceSet::parse("5:*").unwrap();
        assert_eq!(targets(&state, &by_uid, true), vec![(2, 9), (3, 12)]);
        let last = SequenceSet::parse("*").unwrap();
        assert_eq!(targets(&state, &last, false), vec![(3, 12)]);
        let missing = SequenceSet::parse("7").unwrap();
        assert!(targets(&state, &missing, false).is_empty());
    }

    #[test]
    fn test_fetch_line() {
        let info = MessageInfo {
            uid: 42,
            flags: MessageFlags::from_imap(&["\\Seen"]),
            internal_date: Utc::now(),
            size: RAW.len() as u64,
        };
        let items = vec![
            FetchItem::Uid,
            FetchItem::Flags,
            FetchItem::Body {
                section: Section::Text,
                peek: true,
                partial: Some((0, 4)),
            },
        ];
        let line = fetch_line(3, &info, &items, Some(RAW), false);
        assert_eq!(
            String::from_utf8(line).unwrap(),
            "* 3 FETCH (UID 42 FLAGS (\\Seen) BODY[TEXT]<0> {4}\r\nbody)\r\n"
        );
    }

    #[test]
    fn test_parse_date_time() {
        let parsed = parse_date_time("05-Mar-2024 10:00:00 +0200").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-03-05T08:00:00+00:00");
        assert!(parse_date_time("yesterday").is_none());
    }
}
